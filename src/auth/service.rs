use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::api::AuthApi;
use crate::auth::clock::{is_session_valid, Clock};
use crate::auth::storage::{offload, TokenStore};
use crate::auth::token::{decode_identity, Identity, SessionRecord};
use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::events::{EventBus, SessionEvent};
use crate::http::refresh::SessionObserver;
use crate::operations::{OperationConfig, OperationKind, OperationTracker};

/// Tracker key of the login operation
pub const LOGIN_OPERATION_KEY: &str = "auth.login";
/// Tracker key of the logout operation
pub const LOGOUT_OPERATION_KEY: &str = "auth.logout";

const SESSION_EXPIRED_MESSAGE: &str = "Your session has expired. Please sign in again.";

/// Reactive view of the session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub is_authenticated: bool,
    pub user: Option<Identity>,
    pub loading: bool,
    pub is_logging_in: bool,
    pub is_logging_out: bool,
}

/// Result of a router guard check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationDecision {
    Allow,
    RedirectToLogin,
}

/// Continuation run once the next login succeeds
pub type PendingAction = Box<dyn FnOnce(&Identity) + Send>;

/// Owner of the session state machine.
///
/// Login and logout are expected to be serialized by the caller; the token
/// store is last-writer-wins.
pub struct SessionManager {
    store: Arc<TokenStore>,
    api: Arc<dyn AuthApi>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    tracker: OperationTracker,
    state: watch::Sender<SessionState>,
    pending: Mutex<Vec<PendingAction>>,
    busy: BusyCounters,
    default_token_type: String,
    login_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Busy {
    Checking,
    LoggingIn,
    LoggingOut,
}

/// Calls in flight per busy flag; a flag stays up until its count drops to zero
#[derive(Default)]
struct BusyCounters {
    checking: AtomicUsize,
    logging_in: AtomicUsize,
    logging_out: AtomicUsize,
}

impl BusyCounters {
    fn counter(&self, busy: Busy) -> &AtomicUsize {
        match busy {
            Busy::Checking => &self.checking,
            Busy::LoggingIn => &self.logging_in,
            Busy::LoggingOut => &self.logging_out,
        }
    }

    fn apply(&self, state: &watch::Sender<SessionState>) {
        state.send_modify(|s| {
            let logging_in = self.logging_in.load(Ordering::SeqCst) > 0;
            s.is_logging_in = logging_in;
            s.is_logging_out = self.logging_out.load(Ordering::SeqCst) > 0;
            s.loading = logging_in || self.checking.load(Ordering::SeqCst) > 0;
        });
    }
}

/// Holds a busy flag up until the owning call finishes or is dropped
struct BusyFlag<'a> {
    state: &'a watch::Sender<SessionState>,
    counters: &'a BusyCounters,
    busy: Busy,
}

impl<'a> BusyFlag<'a> {
    fn raise(manager: &'a SessionManager, busy: Busy) -> Self {
        manager.busy.counter(busy).fetch_add(1, Ordering::SeqCst);
        manager.busy.apply(&manager.state);
        Self {
            state: &manager.state,
            counters: &manager.busy,
            busy,
        }
    }
}

impl Drop for BusyFlag<'_> {
    fn drop(&mut self) {
        self.counters.counter(self.busy).fetch_sub(1, Ordering::SeqCst);
        self.counters.apply(self.state);
    }
}

impl SessionManager {
    pub fn new(
        store: Arc<TokenStore>,
        api: Arc<dyn AuthApi>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        tracker: OperationTracker,
        config: &SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        Self {
            store,
            api,
            clock,
            events,
            tracker,
            state,
            pending: Mutex::new(Vec::new()),
            busy: BusyCounters::default(),
            default_token_type: config.default_token_type.clone(),
            login_timeout: config.login_timeout(),
        }
    }

    /// Restore the persisted session at startup
    pub async fn initialize(&self) -> bool {
        info!("Initializing session");
        self.check_authentication().await
    }

    /// Re-evaluate the stored session and publish the result.
    ///
    /// An expired record is reported as unauthenticated but left in place so
    /// the next 401 can still refresh it. A record whose token cannot be
    /// decoded is logged out.
    pub async fn check_authentication(&self) -> bool {
        let _loading = BusyFlag::raise(self, Busy::Checking);

        let record = self.store.read();
        let user = match record {
            Some(record) if is_session_valid(Some(&record), self.clock.now()) => {
                match decode_identity(&record.access_token) {
                    Ok(identity) => Some(identity),
                    Err(e) => {
                        warn!(error = %e, "Stored session token is unreadable, logging out");
                        self.logout().await;
                        return false;
                    }
                }
            }
            Some(_) => {
                debug!("Stored session has expired");
                None
            }
            None => None,
        };

        let authenticated = user.is_some();
        self.publish_session(user);
        debug!(authenticated, "Session checked");
        authenticated
    }

    /// Exchange credentials for a session.
    ///
    /// Runs as the blocking `auth.login` operation. On failure the stored
    /// session and the reactive state are left as they were.
    pub async fn login(&self, username: &str, password: &str) -> SessionResult<Identity> {
        let identity = {
            let _busy = BusyFlag::raise(self, Busy::LoggingIn);

            let config = OperationConfig::new("Signing in")
                .kind(OperationKind::Auth)
                .blocking(true)
                .timeout(self.login_timeout);

            self.tracker
                .track(LOGIN_OPERATION_KEY, config, |_| self.authenticate(username, password))
                .await
        };

        match identity {
            Ok(identity) => {
                info!(user = %identity.user_name(), "Login succeeded");
                self.events.publish(SessionEvent::LoginSucceeded {
                    user: identity.clone(),
                });
                self.publish_session(Some(identity.clone()));
                self.run_pending(&identity);
                Ok(identity)
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                Err(e)
            }
        }
    }

    async fn authenticate(&self, username: &str, password: &str) -> SessionResult<Identity> {
        let grant = self.api.login(username, password).await?;
        let record = grant.into_record(None, &self.default_token_type, self.clock.now())?;
        let identity = decode_identity(&record.access_token)?;
        let store = Arc::clone(&self.store);
        offload(move || store.write(&record)).await?;
        Ok(identity)
    }

    /// End the session, telling the server on a best-effort basis.
    ///
    /// The local session is always cleared.
    pub async fn logout(&self) {
        let _busy = BusyFlag::raise(self, Busy::LoggingOut);

        if let Some(record) = self.store.read() {
            let notify = self
                .tracker
                .track(
                    LOGOUT_OPERATION_KEY,
                    OperationConfig::new("Signing out").kind(OperationKind::Auth),
                    |_| self.api.logout(&record),
                )
                .await;
            if let Err(e) = notify {
                warn!(error = %e, "Server logout failed, clearing local session anyway");
            }
        }

        self.clear_local(false);
        info!("Logged out");
    }

    /// Discard the session immediately without contacting the server
    pub fn force_logout(&self, reason: &str) {
        info!(reason = %reason, "Forcing logout");
        self.clear_local(true);
    }

    /// Whether the caller may proceed.
    ///
    /// When not authenticated the optional action is kept and run after the
    /// next successful login.
    pub fn require_auth(&self, pending: Option<PendingAction>) -> bool {
        if self.is_authenticated() {
            return true;
        }
        if let Some(action) = pending {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(action);
            debug!("Action deferred until login");
        }
        false
    }

    /// Router guard.
    ///
    /// A stored record that is expired or unreadable is forced out; protected
    /// routes redirect to login unless the session is valid.
    pub fn guard_navigation(&self, requires_auth: bool) -> NavigationDecision {
        let record = self.store.read();
        let valid_user = match record {
            Some(record) if is_session_valid(Some(&record), self.clock.now()) => {
                match decode_identity(&record.access_token) {
                    Ok(identity) => Some(identity),
                    Err(e) => {
                        warn!(error = %e, "Stored session token is unreadable");
                        self.force_logout("unreadable session token");
                        None
                    }
                }
            }
            Some(_) => {
                self.force_logout("session expired");
                None
            }
            None => {
                if self.is_authenticated() {
                    self.publish_session(None);
                }
                None
            }
        };

        match valid_user {
            Some(identity) => {
                if self.state.borrow().user.as_ref() != Some(&identity) {
                    self.publish_session(Some(identity));
                }
                NavigationDecision::Allow
            }
            None if requires_auth => NavigationDecision::RedirectToLogin,
            None => NavigationDecision::Allow,
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.state
            .borrow()
            .user
            .as_ref()
            .is_some_and(|user| user.has_role(role))
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        self.state
            .borrow()
            .user
            .as_ref()
            .is_some_and(|user| user.has_any_role(roles))
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated
    }

    /// Name of the signed in user
    pub fn user_name(&self) -> Option<String> {
        self.state
            .borrow()
            .user
            .as_ref()
            .map(|user| user.user_name().to_string())
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state change
    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    fn publish_session(&self, user: Option<Identity>) {
        let authenticated = user.is_some();
        self.state.send_modify(|state| {
            state.is_authenticated = authenticated;
            state.user = user.clone();
        });
        self.events.publish(SessionEvent::SessionChanged {
            authenticated,
            user,
        });
    }

    fn clear_local(&self, forced: bool) {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to remove persisted session");
        }
        self.reset_local(forced);
    }

    fn reset_local(&self, forced: bool) {
        self.state.send_modify(|state| {
            state.is_authenticated = false;
            state.user = None;
        });
        self.events.publish(SessionEvent::LoggedOut { forced });
        self.events.publish(SessionEvent::SessionChanged {
            authenticated: false,
            user: None,
        });
    }

    fn run_pending(&self, identity: &Identity) {
        let actions: Vec<PendingAction> = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if !actions.is_empty() {
            debug!(count = actions.len(), "Running actions deferred until login");
        }
        for action in actions {
            action(identity);
        }
    }
}

impl SessionObserver for SessionManager {
    fn session_refreshed(&self, record: &SessionRecord, identity: Identity) {
        if self.store.read().as_ref() != Some(record) {
            debug!("Session changed after refresh, not publishing it");
            return;
        }
        debug!(expires_at = %record.expires_at(), user = %identity.user_name(), "Session refreshed");
        self.publish_session(Some(identity));
    }

    fn session_expired(&self, cause: &SessionError) {
        if self.store.is_present() {
            debug!(error = %cause, "Refresh failed but a newer session is in place");
            return;
        }
        warn!(error = %cause, "Session expired");
        self.reset_local(true);
        self.events.publish(SessionEvent::SessionExpired {
            message: SESSION_EXPIRED_MESSAGE.to_string(),
        });
    }
}
