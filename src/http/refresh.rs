//! Single-flight refresh of an expired session.
//!
//! Every call that receives a 401 asks the [`RefreshCoordinator`] for a
//! credential to replay with. While a refresh is outstanding all of them
//! await the same shared future, so at most one refresh request reaches the
//! server no matter how many calls failed together, and all of them observe
//! the same outcome.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, error, info, warn};

use crate::auth::api::AuthApi;
use crate::auth::clock::Clock;
use crate::auth::storage::{offload, TokenStore};
use crate::auth::token::{decode_identity, Identity, SessionRecord};
use crate::error::{authentication_required, SessionError, SessionResult};

/// Outcome shared by every call waiting on one refresh
pub type RefreshOutcome = SessionResult<SessionRecord>;

type InFlight = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Receiver of the session transitions a refresh can cause
pub trait SessionObserver: Send + Sync {
    /// A refresh stored a new record
    fn session_refreshed(&self, record: &SessionRecord, identity: Identity);

    /// The session could not be recovered.
    ///
    /// The record has already been removed from the store when this runs.
    fn session_expired(&self, cause: &SessionError);
}

pub struct RefreshCoordinator {
    store: Arc<TokenStore>,
    api: Arc<dyn AuthApi>,
    clock: Arc<dyn Clock>,
    observer: Arc<dyn SessionObserver>,
    default_token_type: String,
    in_flight: Arc<Mutex<Option<(u64, InFlight)>>>,
    next_id: AtomicU64,
    refresh_count: Arc<AtomicU64>,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<TokenStore>,
        api: Arc<dyn AuthApi>,
        clock: Arc<dyn Clock>,
        observer: Arc<dyn SessionObserver>,
        default_token_type: &str,
    ) -> Self {
        Self {
            store,
            api,
            clock,
            observer,
            default_token_type: default_token_type.to_string(),
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
            refresh_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of refresh requests sent to the server so far
    pub fn refresh_count(&self) -> u64 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    /// Whether a refresh is currently outstanding
    pub fn is_refreshing(&self) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Get a credential to replay a call that was rejected with 401.
    ///
    /// `seen_token` is the access token the store held when the call was
    /// prepared. If the store has moved on since then the current record is
    /// returned without contacting the server.
    pub async fn recover(&self, seen_token: Option<&str>) -> RefreshOutcome {
        let in_flight = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

            match slot.as_ref() {
                Some((id, in_flight)) => {
                    debug!(refresh_id = id, "Joining in-flight refresh");
                    in_flight.clone()
                }
                None => match self.store.read() {
                    None => {
                        debug!("No session to refresh");
                        return Err(authentication_required("no active session"));
                    }
                    Some(current) if Some(current.access_token.as_str()) != seen_token => {
                        debug!("Credential already superseded, replaying with current one");
                        return Ok(current);
                    }
                    Some(current) => {
                        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                        let in_flight = self.refresh_task(id, current).boxed().shared();
                        *slot = Some((id, in_flight.clone()));
                        in_flight
                    }
                },
            }
        };

        in_flight.await
    }

    fn refresh_task(
        &self,
        id: u64,
        current: SessionRecord,
    ) -> impl Future<Output = RefreshOutcome> + Send + 'static {
        let store = Arc::clone(&self.store);
        let api = Arc::clone(&self.api);
        let clock = Arc::clone(&self.clock);
        let observer = Arc::clone(&self.observer);
        let slot = Arc::clone(&self.in_flight);
        let refresh_count = Arc::clone(&self.refresh_count);
        let default_token_type = self.default_token_type.clone();

        async move {
            info!(refresh_id = id, "Refreshing session");
            refresh_count.fetch_add(1, Ordering::SeqCst);

            let refreshed = async {
                let grant = api.refresh(&current.refresh_token).await?;
                let record =
                    grant.into_record(Some(&current.refresh_token), &default_token_type, clock.now())?;
                let identity = decode_identity(&record.access_token)?;
                Ok::<_, SessionError>((record, identity))
            }
            .await;

            let outcome = match refreshed {
                Ok((record, identity)) => {
                    let swapped = {
                        let store = Arc::clone(&store);
                        let (expected, record) = (current.clone(), record.clone());
                        offload(move || store.replace_if(&expected, &record)).await
                    };
                    match swapped {
                        Ok(true) => {
                            info!(refresh_id = id, expires_at = %record.expires_at(), "Session refreshed");
                            observer.session_refreshed(&record, identity);
                            Ok(record)
                        }
                        Ok(false) => superseded(id, &store),
                        Err(cause) => expire(id, &store, observer.as_ref(), &current, cause),
                    }
                }
                Err(cause) => expire(id, &store, observer.as_ref(), &current, cause),
            };

            let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if matches!(slot.as_ref(), Some((current_id, _)) if *current_id == id) {
                *slot = None;
            }

            outcome
        }
    }
}

/// The session was replaced or ended while the refresh ran
fn superseded(id: u64, store: &TokenStore) -> RefreshOutcome {
    match store.read() {
        Some(record) => {
            debug!(refresh_id = id, "Session changed during refresh, using current record");
            Ok(record)
        }
        None => {
            debug!(refresh_id = id, "Session ended during refresh");
            Err(authentication_required("session ended during refresh"))
        }
    }
}

/// Discard the refreshed session, unless someone else already replaced it
fn expire(
    id: u64,
    store: &TokenStore,
    observer: &dyn SessionObserver,
    current: &SessionRecord,
    cause: SessionError,
) -> RefreshOutcome {
    match store.clear_if(current) {
        Ok(false) => return superseded(id, store),
        Ok(true) => {}
        Err(e) => warn!(refresh_id = id, error = %e, "Failed to remove persisted session"),
    }

    error!(refresh_id = id, error = %cause, "Session refresh failed");
    observer.session_expired(&cause);
    Err(authentication_required(format!(
        "session could not be refreshed: {}",
        cause
    )))
}
