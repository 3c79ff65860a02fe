use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Warns when the runtime thread runs longer than `threshold` without
/// parking, i.e. something is blocking the event loop.
#[derive(Debug)]
pub(crate) struct BlockDetector {
    epoch: Instant,
    /// Milliseconds since `epoch` when the thread last unparked, 0 while parked.
    busy_since_ms: AtomicU64,
    threshold: Duration,
}

impl BlockDetector {
    pub(crate) fn new(threshold: Duration) -> Self {
        Self {
            epoch: Instant::now(),
            busy_since_ms: AtomicU64::new(0),
            threshold,
        }
    }

    /// Creates a detector with its watchdog thread.
    pub(crate) fn spawn(threshold: Duration) -> io::Result<Arc<Self>> {
        let detector = Arc::new(Self::new(threshold));
        let watched = Arc::downgrade(&detector);
        thread::Builder::new()
            .name("worker-block-detect".to_string())
            .spawn(move || watchdog(watched))?;
        Ok(detector)
    }

    pub(crate) fn unparked(&self) {
        self.busy_since_ms.store(self.now_ms().max(1), Ordering::Relaxed);
    }

    pub(crate) fn parked(&self) {
        self.busy_since_ms.store(0, Ordering::Relaxed);
    }

    pub(crate) fn blocked_for(&self) -> Option<Duration> {
        let since = self.busy_since_ms.load(Ordering::Relaxed);
        if since == 0 {
            return None;
        }
        let busy = Duration::from_millis(self.now_ms().saturating_sub(since));
        (busy >= self.threshold).then_some(busy)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn watchdog(detector: Weak<BlockDetector>) {
    loop {
        let Some(detector) = detector.upgrade() else {
            return;
        };
        if let Some(blocked) = detector.blocked_for() {
            tracing::warn!(
                component = "concurrency",
                blocked_ms = blocked.as_millis() as u64,
                threshold_ms = detector.threshold.as_millis() as u64,
                "I/O runtime thread blocked without yielding"
            );
        }
        let interval = detector.threshold;
        drop(detector);
        thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parked_thread_is_not_blocked() {
        let detector = BlockDetector::new(Duration::from_millis(10));
        assert_eq!(detector.blocked_for(), None);
        detector.unparked();
        detector.parked();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(detector.blocked_for(), None);
    }

    #[test]
    fn test_busy_thread_is_blocked() {
        let detector = BlockDetector::new(Duration::from_millis(10));
        detector.unparked();
        thread::sleep(Duration::from_millis(30));
        let blocked = detector.blocked_for().expect("should report blocking");
        assert!(blocked >= Duration::from_millis(10));
    }

    #[test]
    fn test_watchdog_stops_with_detector() {
        let detector = BlockDetector::spawn(Duration::from_millis(5)).unwrap();
        detector.unparked();
        thread::sleep(Duration::from_millis(15));
        drop(detector);
    }
}
