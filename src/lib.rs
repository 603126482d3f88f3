//! Session lifecycle core for JWT-authenticated API clients.
//!
//! [`SessionCore`] wires the pieces together: a [`TokenStore`] holding the
//! persisted session, a [`SessionClient`] that attaches credentials and
//! recovers from 401s through a single-flight refresh, the
//! [`SessionManager`] state machine, and an [`OperationTracker`] for
//! UI-visible in-flight work.

use std::sync::Arc;

use tracing::info;

pub mod auth;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod operations;

pub use auth::{
    decode_identity, is_session_valid, AuthApi, Clock, FileStorage, HttpAuthApi, Identity,
    ManualClock, MemoryStorage, NavigationDecision, PendingAction, SessionManager, SessionRecord,
    SessionState, StorageBackend, SystemClock, TokenGrant, TokenStore,
};
pub use config::SessionConfig;
pub use error::{ErrorCategory, ErrorCode, SessionError, SessionResult};
pub use events::{EventBus, EventBusStats, SessionEvent, SessionNotification};
pub use http::{
    HttpClient, HttpRequest, HttpResponse, RefreshCoordinator, RequestContext,
    RequestInterceptor, ReqwestHttpClient, SessionClient,
};
pub use operations::{
    EndReason, Operation, OperationConfig, OperationEvent, OperationKind, OperationTracker,
    ProgressReporter, TrackedResult, TrackedTask,
};

/// Fully wired session core
#[derive(Clone)]
pub struct SessionCore {
    config: SessionConfig,
    store: Arc<TokenStore>,
    events: EventBus,
    tracker: OperationTracker,
    manager: Arc<SessionManager>,
    client: SessionClient,
}

impl SessionCore {
    pub fn builder(config: SessionConfig) -> SessionCoreBuilder {
        SessionCoreBuilder::new(config)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn tracker(&self) -> &OperationTracker {
        &self.tracker
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Client for authenticated API calls
    pub fn client(&self) -> &SessionClient {
        &self.client
    }

    /// Restore the persisted session
    pub async fn initialize(&self) -> bool {
        self.manager.initialize().await
    }
}

/// Builds a [`SessionCore`], with every collaborator replaceable
pub struct SessionCoreBuilder {
    config: SessionConfig,
    transport: Option<Arc<dyn HttpClient>>,
    storage: Option<Box<dyn StorageBackend>>,
    clock: Option<Arc<dyn Clock>>,
    auth_api: Option<Arc<dyn AuthApi>>,
}

impl SessionCoreBuilder {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            transport: None,
            storage: None,
            clock: None,
            auth_api: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn HttpClient>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn storage(mut self, storage: Box<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom credential exchange instead of the HTTP endpoints
    pub fn auth_api(mut self, auth_api: Arc<dyn AuthApi>) -> Self {
        self.auth_api = Some(auth_api);
        self
    }

    pub fn build(self) -> SessionResult<SessionCore> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn HttpClient> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestHttpClient::with_timeout(config.request_timeout())?),
        };

        let storage: Box<dyn StorageBackend> = match (self.storage, &config.storage_path) {
            (Some(storage), _) => storage,
            (None, Some(path)) => Box::new(FileStorage::new(path.clone())),
            (None, None) => Box::new(MemoryStorage::new()),
        };
        let store = Arc::new(TokenStore::new(storage, config.storage_prefix.clone()));

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let auth_api: Arc<dyn AuthApi> = match self.auth_api {
            Some(api) => api,
            None => Arc::new(HttpAuthApi::new(Arc::clone(&transport), &config)),
        };

        let events = EventBus::new(config.event_capacity);
        let tracker = OperationTracker::with_clock(Arc::clone(&clock));
        let manager = Arc::new(SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&auth_api),
            Arc::clone(&clock),
            events.clone(),
            tracker.clone(),
            &config,
        ));

        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            auth_api,
            Arc::clone(&clock),
            manager.clone(),
            &config.default_token_type,
        ));
        let client = SessionClient::new(
            transport,
            RequestInterceptor::new(Arc::clone(&store), clock, &config.default_token_type),
            coordinator,
            &config.base_url,
            &config.default_token_type,
        );

        info!(base_url = %config.base_url, persisted = config.storage_path.is_some(), "Session core ready");

        Ok(SessionCore {
            config,
            store,
            events,
            tracker,
            manager,
            client,
        })
    }
}
