//! Registry of named in-flight operations.
//!
//! Every long running piece of work the UI may want to reflect (a login, a
//! table load, a save) registers itself under a key while it runs. Starting
//! under a key that is already live replaces the record; each start gets a
//! fresh registration id so that late progress updates, timeouts and cleanup
//! of the replaced registration leave the new one alone.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::auth::clock::{Clock, SystemClock};

pub mod batch;

pub use batch::TrackedTask;

const OPERATION_EVENT_CAPACITY: usize = 64;
const DEFAULT_MESSAGE: &str = "Loading...";

/// What kind of work an operation represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    #[default]
    Default,
    Crud,
    Table,
    Auth,
    Navigation,
}

/// Options for starting an operation
#[derive(Debug, Clone, PartialEq)]
pub struct OperationConfig {
    pub message: String,
    pub kind: OperationKind,
    pub blocking: bool,
    pub cancellable: bool,
    pub timeout: Option<Duration>,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGE)
    }
}

impl OperationConfig {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: OperationKind::Default,
            blocking: false,
            cancellable: false,
            timeout: None,
        }
    }

    pub fn kind(mut self, kind: OperationKind) -> Self {
        self.kind = kind;
        self
    }

    /// Whether the UI should be blocked while the operation runs
    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn cancellable(mut self, cancellable: bool) -> Self {
        self.cancellable = cancellable;
        self
    }

    /// Remove the record automatically after `timeout`
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Snapshot of a live operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    pub key: String,
    pub message: String,
    /// Percentage in `0.0..=100.0`
    pub progress: f64,
    pub cancellable: bool,
    pub kind: OperationKind,
    pub blocks_ui: bool,
    pub started_at: DateTime<Utc>,
    pub timeout_ms: Option<u64>,
}

/// Why an operation record went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    TimedOut,
    /// Another start under the same key took its place
    Replaced,
}

/// Changes to the registry, for observers that render them
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationEvent {
    Started {
        operation: Operation,
    },
    Progress {
        key: String,
        progress: f64,
        message: String,
    },
    Ended {
        key: String,
        reason: EndReason,
    },
}

/// Identifies one start of an operation key
pub type RegistrationId = u64;

/// Outcome of a tracked piece of work
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> TrackedResult<T> {
    fn succeeded(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

struct Entry {
    operation: Operation,
    registration: RegistrationId,
    timer: Option<AbortHandle>,
}

impl Entry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct TrackerInner {
    entries: DashMap<String, Entry>,
    next_registration: AtomicU64,
    events: broadcast::Sender<OperationEvent>,
    clock: Arc<dyn Clock>,
}

impl TrackerInner {
    fn emit(&self, event: OperationEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Remove `key` only if it still belongs to `registration`
    fn finish(&self, key: &str, registration: RegistrationId, reason: EndReason) -> bool {
        match self
            .entries
            .remove_if(key, |_, entry| entry.registration == registration)
        {
            Some((_, mut entry)) => {
                if reason != EndReason::TimedOut {
                    entry.cancel_timer();
                }
                debug!(key = %key, registration, ?reason, "Operation ended");
                self.emit(OperationEvent::Ended {
                    key: key.to_string(),
                    reason,
                });
                true
            }
            None => false,
        }
    }

    fn report(
        &self,
        key: &str,
        registration: Option<RegistrationId>,
        progress: f64,
        message: Option<&str>,
    ) -> bool {
        let update = match self.entries.get_mut(key) {
            Some(mut entry) if registration.map_or(true, |r| r == entry.registration) => {
                entry.operation.progress = clamp_progress(progress);
                if let Some(message) = message {
                    entry.operation.message = message.to_string();
                }
                Some((entry.operation.progress, entry.operation.message.clone()))
            }
            _ => None,
        };

        match update {
            Some((progress, message)) => {
                trace!(key = %key, progress, "Operation progress");
                self.emit(OperationEvent::Progress {
                    key: key.to_string(),
                    progress,
                    message,
                });
                true
            }
            None => false,
        }
    }
}

fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 100.0)
    }
}

/// Concurrent registry of in-flight operations, cheap to clone
#[derive(Clone)]
pub struct OperationTracker {
    inner: Arc<TrackerInner>,
}

impl Default for OperationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationTracker")
            .field("active", &self.inner.entries.len())
            .finish()
    }
}

impl OperationTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Tracker stamping `started_at` from the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(OPERATION_EVENT_CAPACITY);
        Self {
            inner: Arc::new(TrackerInner {
                entries: DashMap::new(),
                next_registration: AtomicU64::new(1),
                events,
                clock,
            }),
        }
    }

    /// Register `key`, replacing any live record under the same key.
    ///
    /// With a timeout and a running tokio runtime the record is removed
    /// automatically once the timeout elapses. The work itself is not
    /// cancelled.
    pub fn start(&self, key: &str, config: OperationConfig) -> RegistrationId {
        let registration = self.inner.next_registration.fetch_add(1, Ordering::SeqCst);
        let operation = Operation {
            key: key.to_string(),
            message: config.message,
            progress: 0.0,
            cancellable: config.cancellable,
            kind: config.kind,
            blocks_ui: config.blocking,
            started_at: self.inner.clock.now(),
            timeout_ms: config
                .timeout
                .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
        };

        let previous = self.inner.entries.insert(
            key.to_string(),
            Entry {
                operation: operation.clone(),
                registration,
                timer: None,
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_timer();
            debug!(key = %key, replaced = previous.registration, "Operation replaced");
            self.inner.emit(OperationEvent::Ended {
                key: key.to_string(),
                reason: EndReason::Replaced,
            });
        }

        debug!(key = %key, registration, kind = ?operation.kind, blocking = operation.blocks_ui, "Operation started");
        self.inner.emit(OperationEvent::Started { operation });

        if let Some(timeout) = config.timeout {
            self.schedule_timeout(key, registration, timeout);
        }

        registration
    }

    fn schedule_timeout(&self, key: &str, registration: RegistrationId, timeout: Duration) {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(key = %key, "No async runtime, operation timeout not scheduled");
                return;
            }
        };

        let inner: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let timer_key = key.to_string();
        let timer = handle
            .spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(inner) = inner.upgrade() {
                    if inner.finish(&timer_key, registration, EndReason::TimedOut) {
                        warn!(key = %timer_key, ?timeout, "Operation timed out");
                    }
                }
            })
            .abort_handle();

        match self.inner.entries.get_mut(key) {
            Some(mut entry) if entry.registration == registration => entry.timer = Some(timer),
            _ => timer.abort(),
        }
    }

    /// Update progress (clamped to `0..=100`) and optionally the message.
    ///
    /// Returns false when no operation is live under `key`.
    pub fn update_progress(&self, key: &str, progress: f64, message: Option<&str>) -> bool {
        self.inner.report(key, None, progress, message)
    }

    /// Remove `key` whatever registration owns it. Idempotent.
    pub fn end(&self, key: &str) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, mut entry)) => {
                entry.cancel_timer();
                debug!(key = %key, registration = entry.registration, "Operation ended");
                self.inner.emit(OperationEvent::Ended {
                    key: key.to_string(),
                    reason: EndReason::Completed,
                });
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.inner.entries.contains_key(key)
    }

    /// Whether any live operation blocks the UI
    pub fn any_blocking(&self) -> bool {
        self.inner
            .entries
            .iter()
            .any(|entry| entry.operation.blocks_ui)
    }

    pub fn get(&self, key: &str) -> Option<Operation> {
        self.inner
            .entries
            .get(key)
            .map(|entry| entry.operation.clone())
    }

    /// Snapshot of every live operation, oldest first
    pub fn operations(&self) -> Vec<Operation> {
        let mut operations: Vec<Operation> = self
            .inner
            .entries
            .iter()
            .map(|entry| entry.operation.clone())
            .collect();
        operations.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.key.cmp(&b.key)));
        operations
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.inner.events.subscribe()
    }

    /// Run `work` registered under `key`, passing its error through.
    ///
    /// The registration is removed when the returned future completes, fails,
    /// panics or is dropped, but only if it was not already replaced or timed
    /// out.
    pub async fn track<T, E, F, Fut>(&self, key: &str, config: OperationConfig, work: F) -> Result<T, E>
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let registration = self.start(key, config);
        let _guard = RegistrationGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            registration,
        };

        work(ProgressReporter {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            registration,
        })
        .await
    }

    /// Run `work` under `key` and fold its outcome into a [`TrackedResult`].
    ///
    /// Errors and panics become `success: false` with the error text.
    pub async fn run_tracked<T, E, F, Fut>(
        &self,
        key: &str,
        config: OperationConfig,
        work: F,
    ) -> TrackedResult<T>
    where
        F: FnOnce(ProgressReporter) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let outcome = AssertUnwindSafe(self.track(key, config, work))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(data)) => TrackedResult::succeeded(data),
            Ok(Err(e)) => {
                debug!(key = %key, error = %e, "Tracked operation failed");
                TrackedResult::failed(e.to_string())
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(key = %key, panic = %message, "Tracked operation panicked");
                TrackedResult::failed(message)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "operation panicked".to_string()
    }
}

struct RegistrationGuard {
    inner: Arc<TrackerInner>,
    key: String,
    registration: RegistrationId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.inner
            .finish(&self.key, self.registration, EndReason::Completed);
    }
}

/// Handle given to tracked work for reporting its own progress
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<TrackerInner>,
    key: String,
    registration: RegistrationId,
}

impl ProgressReporter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Report progress; ignored once this registration is gone
    pub fn report(&self, progress: f64, message: Option<&str>) -> bool {
        self.inner
            .report(&self.key, Some(self.registration), progress, message)
    }
}
