use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{network_failure, SessionError, SessionResult};
use crate::http::interceptor::{RequestContext, RequestInterceptor};
use crate::http::refresh::RefreshCoordinator;
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// Transport wrapper that runs every call through the session interceptors.
///
/// A call goes out with the current credential; a 401 hands it to the
/// [`RefreshCoordinator`] and the call is replayed once with whatever
/// credential the coordinator produced. A second 401 is final.
#[derive(Clone)]
pub struct SessionClient {
    transport: Arc<dyn HttpClient>,
    interceptor: RequestInterceptor,
    coordinator: Arc<RefreshCoordinator>,
    base_url: String,
    default_token_type: String,
}

impl SessionClient {
    pub fn new(
        transport: Arc<dyn HttpClient>,
        interceptor: RequestInterceptor,
        coordinator: Arc<RefreshCoordinator>,
        base_url: &str,
        default_token_type: &str,
    ) -> Self {
        Self {
            transport,
            interceptor,
            coordinator,
            base_url: base_url.trim_end_matches('/').to_string(),
            default_token_type: default_token_type.to_string(),
        }
    }

    /// Absolute URL for a path relative to the configured API base
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Send a call, recovering from one authorization failure.
    ///
    /// Non-401 responses are returned as-is, whatever their status.
    pub async fn execute(&self, request: HttpRequest) -> SessionResult<HttpResponse> {
        let mut ctx = RequestContext::new(request);
        self.interceptor.intercept(&mut ctx);

        loop {
            let response = self
                .transport
                .send(ctx.request.clone())
                .await
                .map_err(network_failure)?;

            if !response.is_unauthorized() {
                return Ok(response);
            }

            if ctx.is_replay() {
                warn!(url = %ctx.request.url, attempt = ctx.attempt, "Replayed call was rejected again");
                return Err(SessionError::AuthorizationExpired {
                    url: ctx.request.url.clone(),
                });
            }

            debug!(url = %ctx.request.url, "Call rejected with 401, recovering session");
            let record = self.coordinator.recover(ctx.seen_token()).await?;
            ctx.prepare_replay(&record, &self.default_token_type);
            debug!(url = %ctx.request.url, attempt = ctx.attempt, "Replaying call");
        }
    }

    pub async fn get(&self, path: &str) -> SessionResult<HttpResponse> {
        self.execute(HttpRequest::get(self.url(path))).await
    }

    pub async fn delete(&self, path: &str) -> SessionResult<HttpResponse> {
        self.execute(HttpRequest::delete(self.url(path))).await
    }

    pub async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> SessionResult<HttpResponse> {
        self.execute(HttpRequest::post(self.url(path)).with_json(body)?)
            .await
    }

    pub async fn put_json<B: Serialize>(&self, path: &str, body: &B) -> SessionResult<HttpResponse> {
        self.execute(HttpRequest::put(self.url(path)).with_json(body)?)
            .await
    }

    /// GET a path and decode a successful JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> SessionResult<T> {
        let response = self.get(path).await?;
        if !response.is_success() {
            return Err(SessionError::UnexpectedResponse {
                status: response.status(),
                reason: response.text(),
            });
        }
        response
            .json()
            .map_err(|e| SessionError::UnexpectedResponse {
                status: response.status(),
                reason: format!("invalid JSON body: {}", e),
            })
    }
}
