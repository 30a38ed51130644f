use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared stop flag handed to every blocking operation.
///
/// Clones observe the same flag; cancelling any clone cancels all of them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleeps for `total` in short slices. Returns `false` if cancelled
    /// before or during the sleep.
    pub fn sleep(&self, total: Duration) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_cancelled() {
                return false;
            }
            let step = remaining.min(SLEEP_SLICE);
            thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        !self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::CancellationToken;
    use std::time::{Duration, Instant};

    #[test]
    fn sleep_returns_early_once_cancelled() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let started = Instant::now();
        assert!(!token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().expect("join");
    }

    #[test]
    fn sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(token.sleep(Duration::from_millis(10)));
    }
}
