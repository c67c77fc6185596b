//! Per-tick progress line.
//!
//! ```text
//! [ 00 47 ++ ER W -- -- ] tasks(5/7) requests(12/99:08s) active(3) 512 KB/s
//! ```

use std::fmt;
use std::time::Duration;

use crate::engine::{TaskStatus, TransferState};

/// One fixed-width slot of the progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressSlot {
    /// Transferring; completed percent, 0 while the size is unknown.
    Percent(u64),
    /// Finished this tick.
    Done,
    /// Failed and resubmitted this tick.
    Retrying,
    /// Any other engine state, shown by its initial.
    State(TransferState),
    /// No task in this slot.
    Idle,
}

impl ProgressSlot {
    /// Slot for a polled transfer that stays in the active set.
    #[must_use]
    pub fn from_status(status: &TaskStatus) -> Self {
        match status.status {
            TransferState::Active => Self::Percent(status.percent()),
            other => Self::State(other),
        }
    }
}

impl fmt::Display for ProgressSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Percent(percent) if *percent >= 100 => f.write_str("++ "),
            Self::Percent(percent) => write!(f, "{percent:02} "),
            Self::Done => f.write_str("++ "),
            Self::Retrying => f.write_str("ER "),
            Self::State(state) => {
                let initial = state.as_str().chars().next().unwrap_or('?');
                write!(f, "{} ", initial.to_ascii_uppercase())
            }
            Self::Idle => f.write_str("-- "),
        }
    }
}

/// Everything one progress line shows.
#[derive(Debug, Clone)]
pub struct ProgressLine<'a> {
    pub slots: &'a [ProgressSlot],
    pub capacity: usize,
    pub active_tasks: usize,
    /// Limiter occupancy as `"<used>/<capacity>"`.
    pub limiter: String,
    /// Time until the next submission slot, shown only while throttled.
    pub throttle_wait: Option<Duration>,
    pub engine_active: u64,
    /// Engine-wide speed in bytes per second.
    pub download_speed: u64,
}

impl fmt::Display for ProgressLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[ ")?;
        for slot in self.slots {
            write!(f, "{slot}")?;
        }
        for _ in self.slots.len()..self.capacity {
            write!(f, "{}", ProgressSlot::Idle)?;
        }
        write!(f, "] tasks({}/{}) requests({}", self.active_tasks, self.capacity, self.limiter)?;
        if let Some(wait) = self.throttle_wait.filter(|wait| wait.as_secs() > 0) {
            write!(f, ":{:02}s", wait.as_secs())?;
        }
        write!(
            f,
            ") active({}) {} KB/s",
            self.engine_active,
            self.download_speed / 1000
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: TransferState, total: u64, done: u64) -> TaskStatus {
        TaskStatus {
            gid: "g".to_string(),
            status: state,
            total_length: total,
            completed_length: done,
            download_speed: 0,
            dir: String::new(),
            error_code: None,
            error_message: None,
        }
    }

    #[test]
    fn test_slot_zero_length_active_renders_00() {
        let slot = ProgressSlot::from_status(&status(TransferState::Active, 0, 0));
        assert_eq!(slot.to_string(), "00 ");
    }

    #[test]
    fn test_slot_percent_is_zero_padded() {
        let slot = ProgressSlot::from_status(&status(TransferState::Active, 100, 7));
        assert_eq!(slot.to_string(), "07 ");
        assert_eq!(ProgressSlot::Percent(100).to_string(), "++ ");
    }

    #[test]
    fn test_slot_other_states_use_initial() {
        assert_eq!(
            ProgressSlot::from_status(&status(TransferState::Waiting, 0, 0)).to_string(),
            "W "
        );
        assert_eq!(ProgressSlot::State(TransferState::Paused).to_string(), "P ");
    }

    #[test]
    fn test_unfinalized_completion_does_not_render_as_done() {
        let slot = ProgressSlot::State(TransferState::Error);
        assert_eq!(slot.to_string(), "E ");
        assert_ne!(slot.to_string(), ProgressSlot::Done.to_string());
    }

    #[test]
    fn test_slot_markers() {
        assert_eq!(ProgressSlot::Done.to_string(), "++ ");
        assert_eq!(ProgressSlot::Retrying.to_string(), "ER ");
        assert_eq!(ProgressSlot::Idle.to_string(), "-- ");
    }

    #[test]
    fn test_line_fills_idle_slots() {
        let slots = [ProgressSlot::Percent(42), ProgressSlot::Done];
        let line = ProgressLine {
            slots: &slots,
            capacity: 4,
            active_tasks: 1,
            limiter: "3/99".to_string(),
            throttle_wait: None,
            engine_active: 1,
            download_speed: 2048,
        };
        assert_eq!(
            line.to_string(),
            "[ 42 ++ -- -- ] tasks(1/4) requests(3/99) active(1) 2 KB/s"
        );
    }

    #[test]
    fn test_line_shows_throttle_wait() {
        let line = ProgressLine {
            slots: &[],
            capacity: 1,
            active_tasks: 0,
            limiter: "99/99".to_string(),
            throttle_wait: Some(Duration::from_secs(8)),
            engine_active: 0,
            download_speed: 0,
        };
        assert_eq!(
            line.to_string(),
            "[ -- ] tasks(0/1) requests(99/99:08s) active(0) 0 KB/s"
        );
    }

    #[test]
    fn test_line_hides_zero_throttle_wait() {
        let line = ProgressLine {
            slots: &[],
            capacity: 0,
            active_tasks: 0,
            limiter: "0/99".to_string(),
            throttle_wait: Some(Duration::from_millis(400)),
            engine_active: 0,
            download_speed: 999,
        };
        assert_eq!(line.to_string(), "[ ] tasks(0/0) requests(0/99) active(0) 0 KB/s");
    }
}
