// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Squelch state machine shared by the FM and WFM demodulators.

/// Thresholds are linear power ratios; `0.0` is the sentinel for "always
/// open" (set from the wire by sending ≤ -999 dB).
#[derive(Debug, Clone)]
pub struct Squelch {
    pub open_threshold: f32,
    pub close_threshold: f32,
    tail_blocks: u32,
    tail_left: u32,
    state: SquelchState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SquelchState {
    Open,
    Closing,
    Closed,
}

impl Squelch {
    pub fn new(open_threshold: f32, close_threshold: f32, tail_blocks: u32) -> Self {
        Self {
            open_threshold,
            close_threshold,
            tail_blocks,
            tail_left: 0,
            state: SquelchState::Closed,
        }
    }

    /// Both thresholds at the sentinel: audio is unconditionally open.
    pub fn always_open(&self) -> bool {
        self.open_threshold == 0.0 && self.close_threshold == 0.0
    }

    pub fn state(&self) -> SquelchState {
        self.state
    }

    /// Advance one block with the given metric (SNR, power ratio or tone
    /// deviation, per the demodulator). Returns the new state.
    pub fn update(&mut self, metric: f32) -> SquelchState {
        if self.always_open() {
            self.state = SquelchState::Open;
            return self.state;
        }
        match self.state {
            SquelchState::Closed => {
                if metric >= self.open_threshold {
                    self.state = SquelchState::Open;
                }
            }
            SquelchState::Open => {
                if metric < self.close_threshold {
                    self.state = SquelchState::Closing;
                    self.tail_left = self.tail_blocks;
                }
            }
            SquelchState::Closing => {
                if metric >= self.open_threshold {
                    self.state = SquelchState::Open;
                } else if self.tail_left == 0 {
                    self.state = SquelchState::Closed;
                } else {
                    self.tail_left -= 1;
                }
            }
        }
        self.state
    }

    /// Audio passes while open or riding out the tail.
    pub fn is_audible(&self) -> bool {
        self.state != SquelchState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_at_threshold_and_closes_after_tail() {
        let mut squelch = Squelch::new(4.0, 2.0, 2);
        assert_eq!(squelch.state(), SquelchState::Closed);
        assert_eq!(squelch.update(3.0), SquelchState::Closed);
        assert_eq!(squelch.update(5.0), SquelchState::Open);
        // Below close: enter the tail, stay audible.
        assert_eq!(squelch.update(1.0), SquelchState::Closing);
        assert!(squelch.is_audible());
        assert_eq!(squelch.update(1.0), SquelchState::Closing);
        assert_eq!(squelch.update(1.0), SquelchState::Closing);
        assert_eq!(squelch.update(1.0), SquelchState::Closed);
        assert!(!squelch.is_audible());
    }

    #[test]
    fn test_tail_reopens_on_signal_return() {
        let mut squelch = Squelch::new(4.0, 2.0, 3);
        squelch.update(5.0);
        squelch.update(1.0);
        assert_eq!(squelch.state(), SquelchState::Closing);
        assert_eq!(squelch.update(6.0), SquelchState::Open);
    }

    #[test]
    fn test_hysteresis_holds_between_thresholds() {
        let mut squelch = Squelch::new(4.0, 2.0, 1);
        squelch.update(5.0);
        // Metric between close and open: stays open.
        assert_eq!(squelch.update(3.0), SquelchState::Open);
    }

    #[test]
    fn test_sentinel_is_always_open() {
        let mut squelch = Squelch::new(0.0, 0.0, 2);
        assert!(squelch.always_open());
        assert_eq!(squelch.update(0.0), SquelchState::Open);
        assert_eq!(squelch.update(-100.0), SquelchState::Open);
    }
}
