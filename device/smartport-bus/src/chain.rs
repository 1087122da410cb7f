//! The ordered set of logical devices sharing the bus.
//!
//! Every device carries two numbers: the identity it was attached with, which selects its
//! role, and the unit identity the host hands out with INIT, which is what packets are
//! addressed to. A bus reset forgets the unit identities.

use crate::device::LogicalDevice;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use log::{debug, info};

/// Attach identities with a fixed role.
pub mod identity {
    pub const PRINTER: u8 = 0x40;
    pub const MODEM: u8 = 0x50;
    pub const CPM: u8 = 0x5a;
    pub const CASSETTE: u8 = 0x5f;
    pub const FUJINET: u8 = 0x70;
    pub const NETWORK: u8 = 0x71;
    pub const NETWORK_LAST: u8 = 0x78;
    pub const MIDI: u8 = 0x99;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeviceClass {
    /// The primary controller.
    Fuji,
    Modem,
    /// One of the network adapters; the index counts from [`identity::NETWORK`].
    Network(u8),
    Midi,
    Cassette,
    Cpm,
    Printer,
    /// Anything else, e.g. a disk.
    Other,
}
impl DeviceClass {
    pub const fn from_identity(id: u8) -> Self {
        match id {
            identity::FUJINET => Self::Fuji,
            identity::MODEM => Self::Modem,
            identity::NETWORK..=identity::NETWORK_LAST => Self::Network(id - identity::NETWORK),
            identity::MIDI => Self::Midi,
            identity::CASSETTE => Self::Cassette,
            identity::CPM => Self::Cpm,
            identity::PRINTER => Self::Printer,
            _ => Self::Other,
        }
    }
}

/// Names a device on the chain for as long as it stays attached.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DeviceHandle(u32);

const NETWORK_SLOTS: usize = (identity::NETWORK_LAST - identity::NETWORK + 1) as usize;

/// The most recently attached device of each fixed role.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Roles {
    pub fuji: Option<DeviceHandle>,
    pub modem: Option<DeviceHandle>,
    pub network: [Option<DeviceHandle>; NETWORK_SLOTS],
    pub midi: Option<DeviceHandle>,
    pub cassette: Option<DeviceHandle>,
    pub cpm: Option<DeviceHandle>,
    pub printer: Option<DeviceHandle>,
}
impl Roles {
    fn slot(&mut self, class: DeviceClass) -> Option<&mut Option<DeviceHandle>> {
        Some(match class {
            DeviceClass::Fuji => &mut self.fuji,
            DeviceClass::Modem => &mut self.modem,
            DeviceClass::Network(i) => &mut self.network[i as usize],
            DeviceClass::Midi => &mut self.midi,
            DeviceClass::Cassette => &mut self.cassette,
            DeviceClass::Cpm => &mut self.cpm,
            DeviceClass::Printer => &mut self.printer,
            DeviceClass::Other => return None,
        })
    }

    fn forget(&mut self, handle: DeviceHandle) {
        let all = [
            &mut self.fuji,
            &mut self.modem,
            &mut self.midi,
            &mut self.cassette,
            &mut self.cpm,
            &mut self.printer,
        ];
        for slot in all.into_iter().chain(self.network.iter_mut()) {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
    }
}

pub(crate) struct Entry {
    pub(crate) handle: DeviceHandle,
    pub(crate) identity: u8,
    pub(crate) unit: Option<u8>,
    pub(crate) device: Box<dyn LogicalDevice>,
}

#[derive(Default)]
pub struct DaisyChain {
    entries: VecDeque<Entry>,
    roles: Roles,
    next_handle: u32,
}

impl DaisyChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts `device` at the front of the chain. Identities are not checked for uniqueness.
    pub fn attach(&mut self, device: Box<dyn LogicalDevice>, identity: u8) -> DeviceHandle {
        let handle = DeviceHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        let class = DeviceClass::from_identity(identity);
        if let Some(slot) = self.roles.slot(class) {
            *slot = Some(handle);
        }
        debug!(
            "[bus]: attached {} as {identity:02x} ({class:?})",
            device.name()
        );
        self.entries.push_front(Entry {
            handle,
            identity,
            unit: None,
            device,
        });
        handle
    }

    /// Removes and drops the device. Must not be called while a receive into its buffer is in
    /// flight. Returns whether the device was attached.
    pub fn detach(&mut self, handle: DeviceHandle) -> bool {
        let Some(i) = self.position(handle) else {
            return false;
        };
        if let Some(entry) = self.entries.remove(i) {
            debug!("[bus]: detached {}", entry.device.name());
        }
        self.roles.forget(handle);
        true
    }

    /// First device attached with `identity`.
    pub fn find_by_identity(&self, identity: u8) -> Option<DeviceHandle> {
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .map(|e| e.handle)
    }

    /// First device the host numbered `unit`.
    pub fn find_by_unit(&self, unit: u8) -> Option<DeviceHandle> {
        self.entries
            .iter()
            .find(|e| e.unit == Some(unit))
            .map(|e| e.handle)
    }

    /// Rewrites the attach identity in place. The role table is left as it was.
    pub fn change_identity(&mut self, handle: DeviceHandle, identity: u8) -> bool {
        match self.entry_mut(handle) {
            Some(entry) => {
                entry.identity = identity;
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Gives every device its shutdown call, in chain order.
    pub fn shutdown_all(&mut self) {
        for entry in self.entries.iter_mut() {
            info!("[bus]: shutting down {:02x}", entry.identity);
            entry.device.shutdown();
        }
        info!("[bus]: all devices shut down");
    }

    pub fn identity(&self, handle: DeviceHandle) -> Option<u8> {
        self.entry(handle).map(|e| e.identity)
    }

    pub fn class(&self, handle: DeviceHandle) -> Option<DeviceClass> {
        self.identity(handle).map(DeviceClass::from_identity)
    }

    /// Unit identity assigned by INIT, if any since the last reset.
    pub fn unit(&self, handle: DeviceHandle) -> Option<u8> {
        self.entry(handle).and_then(|e| e.unit)
    }

    pub fn roles(&self) -> &Roles {
        &self.roles
    }

    pub fn device_mut(&mut self, handle: DeviceHandle) -> Option<&mut (dyn LogicalDevice + 'static)> {
        self.entry_mut(handle).map(|e| e.device.as_mut())
    }

    /// Handles in chain order.
    pub fn handles(&self) -> impl Iterator<Item = DeviceHandle> + '_ {
        self.entries.iter().map(|e| e.handle)
    }

    pub(crate) fn clear_units(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.unit = None;
        }
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [Entry] {
        self.entries.make_contiguous()
    }

    fn position(&self, handle: DeviceHandle) -> Option<usize> {
        self.entries.iter().position(|e| e.handle == handle)
    }

    fn entry(&self, handle: DeviceHandle) -> Option<&Entry> {
        self.entries.iter().find(|e| e.handle == handle)
    }

    fn entry_mut(&mut self, handle: DeviceHandle) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.handle == handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Command, DeviceError, Transport};
    use std::cell::Cell;
    use std::rc::Rc;

    struct Dummy {
        buf: [u8; 8],
        shutdowns: Rc<Cell<usize>>,
        dropped: Rc<Cell<bool>>,
    }
    impl LogicalDevice for Dummy {
        fn packet_buffer(&mut self) -> &mut [u8] {
            &mut self.buf
        }
        fn process(&mut self, _: &mut dyn Transport, _: &Command) -> Result<(), DeviceError> {
            Ok(())
        }
        fn shutdown(&mut self) {
            self.shutdowns.set(self.shutdowns.get() + 1);
        }
    }
    impl Drop for Dummy {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    fn dummy(shutdowns: &Rc<Cell<usize>>) -> (Box<Dummy>, Rc<Cell<bool>>) {
        let dropped = Rc::new(Cell::new(false));
        let device = Box::new(Dummy {
            buf: [0; 8],
            shutdowns: shutdowns.clone(),
            dropped: dropped.clone(),
        });
        (device, dropped)
    }

    #[test]
    fn test_classes() {
        assert_eq!(DeviceClass::from_identity(0x70), DeviceClass::Fuji);
        assert_eq!(DeviceClass::from_identity(0x50), DeviceClass::Modem);
        assert_eq!(DeviceClass::from_identity(0x71), DeviceClass::Network(0));
        assert_eq!(DeviceClass::from_identity(0x78), DeviceClass::Network(7));
        assert_eq!(DeviceClass::from_identity(0x79), DeviceClass::Other);
        assert_eq!(DeviceClass::from_identity(0x99), DeviceClass::Midi);
        assert_eq!(DeviceClass::from_identity(0x5f), DeviceClass::Cassette);
        assert_eq!(DeviceClass::from_identity(0x5a), DeviceClass::Cpm);
        assert_eq!(DeviceClass::from_identity(0x40), DeviceClass::Printer);
        assert_eq!(DeviceClass::from_identity(0x31), DeviceClass::Other);
    }

    #[test]
    fn test_attach_front_and_find() {
        let shutdowns = Rc::new(Cell::new(0));
        let mut chain = DaisyChain::new();
        let a = chain.attach(dummy(&shutdowns).0, 0x31);
        let b = chain.attach(dummy(&shutdowns).0, 0x70);
        let c = chain.attach(dummy(&shutdowns).0, 0x31);
        assert_eq!(chain.count(), 3);
        assert_eq!(chain.handles().collect::<Vec<_>>(), [c, b, a]);
        // duplicates are allowed; the front-most one wins
        assert_eq!(chain.find_by_identity(0x31), Some(c));
        assert_eq!(chain.find_by_identity(0x70), Some(b));
        assert_eq!(chain.find_by_identity(0x42), None);
        assert_eq!(chain.roles().fuji, Some(b));
        assert_eq!(chain.class(b), Some(DeviceClass::Fuji));
    }

    #[test]
    fn test_network_roles() {
        let shutdowns = Rc::new(Cell::new(0));
        let mut chain = DaisyChain::new();
        let first = chain.attach(dummy(&shutdowns).0, 0x71);
        let last = chain.attach(dummy(&shutdowns).0, 0x78);
        assert_eq!(chain.roles().network[0], Some(first));
        assert_eq!(chain.roles().network[7], Some(last));
        assert!(chain.roles().network[1..7].iter().all(Option::is_none));
    }

    #[test]
    fn test_detach_drops_device() {
        let shutdowns = Rc::new(Cell::new(0));
        let mut chain = DaisyChain::new();
        let (device, dropped) = dummy(&shutdowns);
        let printer = chain.attach(device, identity::PRINTER);
        let other = chain.attach(dummy(&shutdowns).0, 0x31);
        assert!(chain.detach(printer));
        assert!(dropped.get());
        assert_eq!(chain.count(), 1);
        assert_eq!(chain.roles().printer, None);
        assert_eq!(chain.find_by_identity(identity::PRINTER), None);
        assert!(!chain.detach(printer));
        assert_eq!(chain.handles().collect::<Vec<_>>(), [other]);
    }

    #[test]
    fn test_change_identity() {
        let shutdowns = Rc::new(Cell::new(0));
        let mut chain = DaisyChain::new();
        let h = chain.attach(dummy(&shutdowns).0, 0x31);
        assert!(chain.change_identity(h, 0x32));
        assert_eq!(chain.identity(h), Some(0x32));
        assert_eq!(chain.find_by_identity(0x31), None);
        assert_eq!(chain.find_by_identity(0x32), Some(h));
        chain.detach(h);
        assert!(!chain.change_identity(h, 0x33));
    }

    #[test]
    fn test_shutdown_all() {
        let shutdowns = Rc::new(Cell::new(0));
        let mut chain = DaisyChain::new();
        for id in [0x40, 0x50, 0x70] {
            chain.attach(dummy(&shutdowns).0, id);
        }
        chain.shutdown_all();
        assert_eq!(shutdowns.get(), 3);
        assert_eq!(chain.count(), 3);
    }

    #[test]
    fn test_units() {
        let shutdowns = Rc::new(Cell::new(0));
        let mut chain = DaisyChain::new();
        let h = chain.attach(dummy(&shutdowns).0, 0x31);
        assert_eq!(chain.unit(h), None);
        chain.entries_mut()[0].unit = Some(0x81);
        assert_eq!(chain.find_by_unit(0x81), Some(h));
        chain.clear_units();
        assert_eq!(chain.unit(h), None);
        assert_eq!(chain.find_by_unit(0x81), None);
    }
}
