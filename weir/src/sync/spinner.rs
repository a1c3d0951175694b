//! Adaptive backoff for conditions that cannot be channel-selected on
//!
//! A [Spinner] yields the task for a bounded number of rounds and then
//! starts sleeping between retries. Callers pick a [SpinPriority] that
//! trades latency against scheduler pressure; waiting for a saturated
//! producer queue sits in the middle, a flush quiescence wait runs near
//! realtime.
use tokio::time::{sleep, Duration};

/// Backoff aggressiveness. Each priority carries a yield budget and the
/// sleep applied once the budget is spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpinPriority {
    /// no spinning, sleep immediately
    Suspend,
    /// background work, long sleeps
    Low,
    /// default for queue-full waits
    Medium,
    /// latency sensitive waits
    High,
    /// quiescence waits on the hot path
    Realtime,
}

impl SpinPriority {
    fn tuning(self) -> (u32, Duration) {
        match self {
            SpinPriority::Suspend => (0, Duration::from_millis(10)),
            SpinPriority::Low => (32, Duration::from_millis(5)),
            SpinPriority::Medium => (64, Duration::from_millis(1)),
            SpinPriority::High => (256, Duration::from_micros(100)),
            SpinPriority::Realtime => (1024, Duration::from_micros(10)),
        }
    }
}

/// Adaptive backoff helper. Call [Spinner::wait] in a retry loop and
/// [Spinner::reset] whenever progress is made.
pub struct Spinner {
    spins: u32,
    sleep_for: Duration,
    count: u32,
}

impl Spinner {
    /// Creates a spinner with the given priority.
    pub fn new(priority: SpinPriority) -> Self {
        let (spins, sleep_for) = priority.tuning();
        Spinner {
            spins,
            sleep_for,
            count: 0,
        }
    }

    /// Yields the task; sleeps once the yield budget is exhausted.
    pub async fn wait(&mut self) {
        if self.count < self.spins {
            self.count += 1;
            tokio::task::yield_now().await;
        } else {
            sleep(self.sleep_for).await;
        }
    }

    /// Restores the yield budget after progress.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}
