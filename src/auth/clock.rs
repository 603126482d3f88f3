use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};

use crate::auth::token::SessionRecord;

/// Source of the current time for every validity decision
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Whether a session is usable at `now`.
///
/// An absent record is never valid; otherwise the session is valid strictly
/// before `issued_at + expires_in_seconds`.
pub fn is_session_valid(record: Option<&SessionRecord>, now: DateTime<Utc>) -> bool {
    match record {
        Some(record) => now < record.expires_at(),
        None => false,
    }
}
