use core::marker::PhantomData;
use critical_section::RestoreState;

/// Interrupts stay masked for as long as this is alive, and are restored to their previous
/// state when it drops, on every exit path.
///
/// The board supplies the mask/restore implementation through `critical_section::set_impl!`.
pub struct InterruptGuard {
    state: RestoreState,
    // restore must happen on the core that masked
    _not_send: PhantomData<*mut ()>,
}

impl InterruptGuard {
    pub fn acquire() -> Self {
        Self {
            state: unsafe { critical_section::acquire() },
            _not_send: PhantomData,
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        unsafe { critical_section::release(self.state) }
    }
}
