//! Shared setup for the integration tests

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast::Receiver;

use session_core::{
    AuthApi, Clock, ManualClock, MemoryStorage, SessionConfig, SessionCore, SessionError,
    SessionEvent, SessionNotification, SessionRecord, SessionResult, StorageBackend, TokenGrant,
};

/// An unsigned JWT carrying the given claims
pub fn jwt(claims: Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, payload)
}

/// Access token for `user`, distinguished by `version`
pub fn token_for(user: &str, version: u32) -> String {
    jwt(json!({"sub": user, "roles": ["USER"], "userId": 42, "v": version}))
}

/// Token response body as the auth endpoints return it
pub fn grant_body(access_token: &str, refresh_token: &str, expires_in: u64) -> String {
    json!({
        "accessToken": access_token,
        "refreshToken": refresh_token,
        "tokenType": "Bearer",
        "expiresIn": expires_in
    })
    .to_string()
}

pub fn config_for(server: &mockito::ServerGuard) -> SessionConfig {
    SessionConfig {
        base_url: server.url(),
        login_path: "/auth/login".to_string(),
        refresh_path: "/auth/refresh".to_string(),
        logout_path: "/auth/logout".to_string(),
        request_timeout_ms: 5_000,
        login_timeout_ms: 5_000,
        storage_prefix: "app_".to_string(),
        storage_path: None,
        event_capacity: 64,
        default_token_type: "Bearer".to_string(),
    }
}

fn grant_for(access_token: &str, refresh_token: &str) -> TokenGrant {
    TokenGrant {
        access_token: access_token.to_string(),
        refresh_token: Some(refresh_token.to_string()),
        token_type: Some("Bearer".to_string()),
        expires_in: 3600,
        issued_at: None,
    }
}

/// Auth endpoints answered in process, with a refresh that takes a while
pub struct SlowRefreshApi {
    pub delay: StdDuration,
    /// Access token handed out by the refresh, or why it fails
    pub refreshed: Result<String, SessionError>,
    /// Access token handed out by every login
    pub login_token: String,
}

#[async_trait::async_trait]
impl AuthApi for SlowRefreshApi {
    async fn login(&self, _username: &str, _password: &str) -> SessionResult<TokenGrant> {
        Ok(grant_for(&self.login_token, "refresh-login"))
    }

    async fn refresh(&self, _refresh_token: &str) -> SessionResult<TokenGrant> {
        tokio::time::sleep(self.delay).await;
        let access_token = self.refreshed.clone()?;
        Ok(grant_for(&access_token, "refresh-2"))
    }

    async fn logout(&self, _record: &SessionRecord) -> SessionResult<()> {
        Ok(())
    }
}

/// A wired core with a clock the test controls
pub struct TestEnvironment {
    pub core: SessionCore,
    pub clock: Arc<ManualClock>,
    pub notifications: Receiver<SessionNotification>,
}

impl TestEnvironment {
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_storage(config, Box::new(MemoryStorage::new()))
    }

    pub fn with_storage(config: SessionConfig, storage: Box<dyn StorageBackend>) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let builder = SessionCore::builder(config).storage(storage).clock(clock.clone());
        Self::finish(builder.build()?, clock)
    }

    /// Core whose auth endpoints are served by `api` instead of the server
    pub fn with_auth_api(config: SessionConfig, api: Arc<dyn AuthApi>) -> Result<Self> {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let core = SessionCore::builder(config)
            .auth_api(api)
            .clock(clock.clone())
            .build()?;
        Self::finish(core, clock)
    }

    fn finish(core: SessionCore, clock: Arc<ManualClock>) -> Result<Self> {
        let notifications = core.events().subscribe();
        Ok(Self {
            core,
            clock,
            notifications,
        })
    }

    /// Store a session record issued `age_secs` ago
    pub fn seed_session(&self, access_token: &str, age_secs: i64, expires_in: u64) -> Result<()> {
        self.core.store().write(&SessionRecord {
            access_token: access_token.to_string(),
            refresh_token: "refresh-1".to_string(),
            token_type: "Bearer".to_string(),
            expires_in_seconds: expires_in,
            issued_at: self.clock.now() - Duration::seconds(age_secs),
        })?;
        Ok(())
    }

    /// Every notification published so far that has not been read yet
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            events.push(notification.event);
        }
        events
    }

    pub fn count_expired(events: &[SessionEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, SessionEvent::SessionExpired { .. }))
            .count()
    }
}
