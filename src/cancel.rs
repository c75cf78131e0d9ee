use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_SLICE: Duration = Duration::from_millis(10);

/// Session-wide cancellation flag shared by every worker thread.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    flag: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Sleep for `duration` unless a stop arrives first. Returns true if stopped.
    pub fn wait(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop_requested() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    /// Raw flag for `signal_hook::flag::register`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    /// Register SIGINT and SIGTERM to request a stop.
    pub fn register_signals(&self) -> std::io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGINT, self.flag())?;
        signal_hook::flag::register(signal_hook::consts::SIGTERM, self.flag())?;
        Ok(())
    }
}
