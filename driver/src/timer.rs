use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub type TimeValue = Duration;

fn boot_time() -> Instant {
    static BOOT: OnceLock<Instant> = OnceLock::new();
    *BOOT.get_or_init(Instant::now)
}

/// Monotonic time since the driver first looked at the clock.
pub fn current_time() -> TimeValue {
    boot_time().elapsed()
}

pub fn current_time_nanos() -> u64 {
    current_time().as_nanos() as u64
}

/// A monotonic one-shot timer. Arming it again moves the deadline.
///
/// The timer does not run anything by itself: the thread waiting on it asks
/// [`OneShotTimer::fire`] once [`OneShotTimer::deadline`] has passed.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    deadline: Mutex<Option<Instant>>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, after: TimeValue) {
        let deadline = Instant::now().checked_add(after);
        *self.deadline.lock() = deadline;
    }

    /// Returns whether the timer was still armed.
    pub fn cancel(&self) -> bool {
        self.deadline.lock().take().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.lock()
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.lock().is_some()
    }

    /// Disarms the timer if it has expired. Returns whether it did.
    pub fn fire(&self) -> bool {
        let mut deadline = self.deadline.lock();
        match *deadline {
            Some(at) if Instant::now() >= at => {
                *deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_shot() {
        let timer = OneShotTimer::new();
        assert!(!timer.fire());
        timer.start(Duration::from_micros(50));
        assert!(timer.is_armed());
        std::thread::sleep(Duration::from_micros(100));
        assert!(timer.fire());
        assert!(!timer.fire());
        assert!(!timer.cancel());

        timer.start(Duration::from_secs(60));
        assert!(!timer.fire());
        assert!(timer.cancel());
        assert_eq!(timer.deadline(), None);
    }

    #[test]
    fn clock_is_monotonic() {
        let a = current_time_nanos();
        let b = current_time_nanos();
        assert!(b >= a);
    }
}
