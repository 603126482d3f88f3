use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::auth::token::{SessionRecord, TokenGrant};
use crate::config::SessionConfig;
use crate::error::{network_failure, refresh_failed, SessionError, SessionResult};
use crate::http::{HttpClient, HttpRequest, HttpResponse};

const DEFAULT_LOGIN_FAILURE_MESSAGE: &str = "Invalid username or password";

/// Server endpoints the session lifecycle depends on
#[async_trait::async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange credentials for a token grant
    async fn login(&self, username: &str, password: &str) -> SessionResult<TokenGrant>;

    /// Exchange a refresh token for a new grant
    async fn refresh(&self, refresh_token: &str) -> SessionResult<TokenGrant>;

    /// Tell the server the session is over
    async fn logout(&self, record: &SessionRecord) -> SessionResult<()>;
}

/// AuthApi backed by JSON endpoints
pub struct HttpAuthApi {
    http: Arc<dyn HttpClient>,
    login_url: String,
    refresh_url: String,
    logout_url: String,
    default_token_type: String,
}

impl HttpAuthApi {
    pub fn new(http: Arc<dyn HttpClient>, config: &SessionConfig) -> Self {
        Self {
            http,
            login_url: config.endpoint(&config.login_path),
            refresh_url: config.endpoint(&config.refresh_path),
            logout_url: config.endpoint(&config.logout_path),
            default_token_type: config.default_token_type.clone(),
        }
    }

    async fn post_json(&self, url: &str, body: &Value) -> SessionResult<HttpResponse> {
        let request = HttpRequest::post(url).with_json(body)?;
        self.http.send(request).await.map_err(network_failure)
    }

    fn parse_grant(response: &HttpResponse) -> SessionResult<TokenGrant> {
        response
            .json::<TokenGrant>()
            .map_err(|e| SessionError::UnexpectedResponse {
                status: response.status(),
                reason: format!("invalid token response: {}", e),
            })
    }
}

/// Pull a human readable message out of an error body
fn server_message(response: &HttpResponse) -> Option<String> {
    let body: Value = response.json().ok()?;
    ["message", "mensaje", "error", "detail"]
        .iter()
        .find_map(|field| body.get(*field).and_then(Value::as_str))
        .filter(|message| !message.trim().is_empty())
        .map(str::to_string)
}

#[async_trait::async_trait]
impl AuthApi for HttpAuthApi {
    #[instrument(skip(self, password), fields(url = %self.login_url))]
    async fn login(&self, username: &str, password: &str) -> SessionResult<TokenGrant> {
        let body = json!({ "usuario": username, "password": password });
        let response = self.post_json(&self.login_url, &body).await?;

        if !response.is_success() {
            debug!(status = response.status(), "Login rejected");
            return Err(SessionError::AuthenticationFailure {
                message: server_message(&response)
                    .unwrap_or_else(|| DEFAULT_LOGIN_FAILURE_MESSAGE.to_string()),
            });
        }

        Self::parse_grant(&response)
    }

    #[instrument(skip_all, fields(url = %self.refresh_url))]
    async fn refresh(&self, refresh_token: &str) -> SessionResult<TokenGrant> {
        let body = json!({ "refreshToken": refresh_token });
        let response = self.post_json(&self.refresh_url, &body).await?;

        if !response.is_success() {
            debug!(status = response.status(), "Refresh rejected");
            let reason = server_message(&response)
                .unwrap_or_else(|| format!("server answered {}", response.status()));
            return Err(refresh_failed(reason));
        }

        Self::parse_grant(&response)
    }

    #[instrument(skip_all, fields(url = %self.logout_url))]
    async fn logout(&self, record: &SessionRecord) -> SessionResult<()> {
        let mut request = HttpRequest::post(&self.logout_url)
            .with_json(&json!({ "refreshToken": record.refresh_token }))?;
        request.set_authorization(&record.authorization_value(&self.default_token_type));

        let response = self.http.send(request).await.map_err(network_failure)?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SessionError::UnexpectedResponse {
                status: response.status(),
                reason: "logout was not acknowledged".to_string(),
            })
        }
    }
}
