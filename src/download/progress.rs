//! Download progress values, observer registry and throttling.
//!
//! Producers emit [`DownloadProgress`] to zero or more observers. Observers
//! may subscribe or unsubscribe at any time, including from inside a
//! callback while a transfer is running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Snapshot of a transfer's progress. Purely informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DownloadProgress {
    /// Bytes retrieved so far.
    pub bytes_downloaded: u64,
    /// Total bytes expected, zero when unknown.
    pub bytes_total: u64,
}

impl DownloadProgress {
    /// Create a progress snapshot.
    pub const fn new(bytes_downloaded: u64, bytes_total: u64) -> Self {
        Self {
            bytes_downloaded,
            bytes_total,
        }
    }

    /// Completed fraction in `[0, 1]`, or `None` when the total is unknown.
    pub fn fraction(&self) -> Option<f64> {
        if self.bytes_total == 0 {
            return None;
        }
        Some((self.bytes_downloaded as f64 / self.bytes_total as f64).min(1.0))
    }
}

/// Handle returned by [`ProgressObservers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Observer = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Registry of progress observers.
#[derive(Default)]
pub struct ProgressObservers {
    next_id: AtomicU64,
    observers: Mutex<Vec<(SubscriptionId, Observer)>>,
}

impl ProgressObservers {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer`; it receives every subsequent emission.
    pub fn subscribe(
        &self,
        observer: impl Fn(DownloadProgress) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.observers.lock() {
            observers.push((id, Arc::new(observer)));
        }
        id
    }

    /// Remove an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut observers) = self.observers.lock() else {
            return false;
        };
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Number of registered observers.
    pub fn len(&self) -> usize {
        self.observers.lock().map(|o| o.len()).unwrap_or(0)
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `progress` to every observer registered right now.
    ///
    /// The lock is released before callbacks run, so a callback may
    /// unsubscribe itself.
    pub fn emit(&self, progress: DownloadProgress) {
        let snapshot: Vec<Observer> = match self.observers.lock() {
            Ok(observers) => observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            Err(_) => return,
        };
        for observer in snapshot {
            observer(progress);
        }
    }
}

impl std::fmt::Debug for ProgressObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressObservers")
            .field("observers", &self.len())
            .finish()
    }
}

/// Rate-limiter for progress updates.
///
/// Ensures intermediate progress events are not emitted more frequently
/// than the configured interval.
pub struct ProgressThrottle {
    last_emit: Option<Instant>,
    min_interval: Duration,
}

impl ProgressThrottle {
    /// Create a new throttle with the specified minimum interval.
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last_emit: None,
            min_interval,
        }
    }

    /// Check if enough time has passed to emit another progress update.
    pub fn should_emit(&mut self) -> bool {
        let now = Instant::now();
        match self.last_emit {
            Some(last) if now.duration_since(last) < self.min_interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}
