//! Wake signal the pump blocks on between cycles

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct WakeSignal {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        *self.pending.lock() = true;
        self.cv.notify_all();
    }

    /// Block until signalled or `timeout` elapses. Consumes the signal.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pending = self.pending.lock();
        if !*pending {
            let _ = self.cv.wait_for(&mut pending, timeout);
        }
        std::mem::replace(&mut *pending, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_before_wait_is_kept() {
        let wake = WakeSignal::new();
        wake.signal();
        assert!(wake.wait(Duration::from_millis(1)));
        assert!(!wake.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_signal_from_other_thread() {
        let wake = Arc::new(WakeSignal::new());
        let remote = Arc::clone(&wake);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.signal();
        });
        assert!(wake.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
