use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cooperative cancellation flag shared between a worker and its owner.
///
/// The worker polls [`SignalOfStop::cancelled`] between blocking calls and sleeps
/// through [`SignalOfStop::wait_timeout`], which returns as soon as the owner
/// calls [`SignalOfStop::cancel`].
#[derive(Debug)]
pub struct SignalOfStop {
    // Shared state between clones
    shared: Arc<SharedState>,
}

#[derive(Debug)]
struct SharedState {
    closing: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl SignalOfStop {
    pub fn new() -> SignalOfStop {
        SignalOfStop {
            shared: Arc::new(SharedState {
                closing: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        self.shared.closing.store(true, Ordering::Release);

        // Lock briefly so a waiter between its check and its wait cannot miss the notification
        let _guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.shared.condvar.notify_all();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.closing.load(Ordering::Acquire)
    }

    /// Inverse of [`SignalOfStop::cancelled`], reads as the keep-alive flag.
    pub fn is_alive(&self) -> bool {
        !self.cancelled()
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` when cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self
            .shared
            .mutex
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        while !self.cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .shared
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
        true
    }
}

impl Default for SignalOfStop {
    fn default() -> Self {
        Self::new()
    }
}

// Implementing the Clone trait
impl Clone for SignalOfStop {
    fn clone(&self) -> SignalOfStop {
        SignalOfStop {
            shared: Arc::clone(&self.shared),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let sos = SignalOfStop::new();
        let other = sos.clone();
        assert!(other.is_alive());

        sos.cancel();
        assert!(other.cancelled());
        assert!(!other.is_alive());
    }

    #[test]
    fn test_wait_timeout_elapses_without_cancel() {
        let sos = SignalOfStop::new();
        let start = Instant::now();
        assert!(!sos.wait_timeout(Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_wait_timeout_wakes_on_cancel() {
        let sos = SignalOfStop::new();
        let other = sos.clone();

        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let cancelled = other.wait_timeout(Duration::from_secs(10));
            (cancelled, start.elapsed())
        });

        thread::sleep(Duration::from_millis(20));
        sos.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }
}
