use crate::hal::{BusPins, Line};

/// Bus state encoded on the four phase lines.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Idle,
    /// PH0 and PH2 up, PH1 and PH3 down.
    Reset,
    /// PH1 and PH3 up; PH0 and PH2 don't matter.
    Enable,
}
impl Phase {
    /// Classifies one snapshot of PH0..PH3. Enable takes precedence over reset.
    pub const fn classify(levels: [bool; 4]) -> Self {
        let [ph0, ph1, ph2, ph3] = levels;
        if ph1 && ph3 {
            Self::Enable
        } else if ph0 && ph2 && !ph1 && !ph3 {
            Self::Reset
        } else {
            Self::Idle
        }
    }

    /// Samples the phase lines. Not debounced.
    pub fn read<P: BusPins + ?Sized>(pins: &mut P) -> Self {
        Self::classify(Line::PHASES.map(|line| pins.level(line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truth_table() {
        for bits in 0u8..16 {
            let levels = [0, 1, 2, 3].map(|i| bits & (1 << i) != 0);
            let expected = match bits {
                // PH1 | PH3 (with any PH0/PH2)
                0b1010 | 0b1011 | 0b1110 | 0b1111 => Phase::Enable,
                // PH0 | PH2 alone
                0b0101 => Phase::Reset,
                _ => Phase::Idle,
            };
            assert_eq!(Phase::classify(levels), expected, "levels {levels:?}");
        }
    }

    struct Levels([bool; 4]);
    impl BusPins for Levels {
        fn level(&mut self, line: Line) -> bool {
            match line {
                Line::Phase0 => self.0[0],
                Line::Phase1 => self.0[1],
                Line::Phase2 => self.0[2],
                Line::Phase3 => self.0[3],
                _ => false,
            }
        }
        fn drive(&mut self, _: Line, _: bool) {}
        fn set_output(&mut self, _: Line, _: bool) {}
    }

    #[test]
    fn test_read_lines_in_order() {
        assert_eq!(Phase::read(&mut Levels([true, false, true, false])), Phase::Reset);
        assert_eq!(Phase::read(&mut Levels([false, true, false, true])), Phase::Enable);
        assert_eq!(Phase::read(&mut Levels([true, true, false, false])), Phase::Idle);
    }
}
