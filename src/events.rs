use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::auth::token::Identity;

/// Default capacity of the session notification channel
pub const SESSION_EVENT_CAPACITY: usize = 100;

/// Notifications the session core broadcasts to the rest of the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The authenticated state was (re)evaluated
    SessionChanged {
        authenticated: bool,
        user: Option<Identity>,
    },
    /// A login completed successfully
    LoginSucceeded { user: Identity },
    /// The local session was discarded
    LoggedOut { forced: bool },
    /// The session could not be recovered; navigation should go to login
    SessionExpired { message: String },
}

impl SessionEvent {
    /// Short name used in logs and statistics
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionChanged { .. } => "session.changed",
            Self::LoginSucceeded { .. } => "session.login",
            Self::LoggedOut { .. } => "session.logout",
            Self::SessionExpired { .. } => "session.expired",
        }
    }
}

/// Envelope carrying a notification with its identity and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionNotification {
    /// Unique notification ID
    pub id: String,
    /// When the notification was published
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub event: SessionEvent,
}

impl SessionNotification {
    pub fn new(event: SessionEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            event,
        }
    }
}

/// Statistics about event bus activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events delivered to at least one subscriber
    pub events_published: u64,
    /// Number of events dropped (no receivers)
    pub events_dropped: u64,
}

/// Typed broadcast channel for session notifications.
///
/// Publishing is synchronous so it can be used from the forced-logout path.
pub struct EventBus {
    sender: broadcast::Sender<SessionNotification>,
    capacity: usize,
    published: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    pub fn new(capacity: usize) -> Self {
        info!(capacity, "Creating session event bus");
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            published: Arc::new(AtomicU64::new(0)),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get a receiver to subscribe to notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        trace!("New subscriber registered to session event bus");
        self.sender.subscribe()
    }

    /// Publish a notification to all subscribers, returning how many received it
    pub fn publish(&self, event: SessionEvent) -> usize {
        let event_type = event.event_type();
        trace!(event_type, "Publishing session event");

        match self.sender.send(SessionNotification::new(event)) {
            Ok(receivers) => {
                self.published.fetch_add(1, Ordering::Relaxed);
                trace!(receivers, "Session event published");
                receivers
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(event_type, "No receivers for session event, message dropped");
                0
            }
        }
    }

    /// Get current event bus statistics
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            events_published: self.published.load(Ordering::Relaxed),
            events_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics counters
    pub fn reset_stats(&self) {
        self.published.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SESSION_EVENT_CAPACITY)
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            capacity: self.capacity,
            published: Arc::clone(&self.published),
            dropped: Arc::clone(&self.dropped),
        }
    }
}
