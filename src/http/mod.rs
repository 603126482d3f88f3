use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, Method, StatusCode};

pub mod client;
pub mod interceptor;
pub mod refresh;

pub use client::SessionClient;
pub use interceptor::{RequestContext, RequestInterceptor};
pub use refresh::{RefreshCoordinator, RefreshOutcome};

/// An outbound call, cheap to clone so it can be replayed
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Add a header, ignoring names or values that are not valid HTTP
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Attach a JSON body
    pub fn with_json<T: serde::Serialize>(mut self, body: &T) -> Result<Self> {
        self.body = Some(Bytes::from(serde_json::to_vec(body)?));
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(self)
    }

    /// The current `Authorization` header, if any
    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }

    /// Set the `Authorization` header; returns false if the value is not a valid header
    pub fn set_authorization(&mut self, value: &str) -> bool {
        match HeaderValue::from_str(value) {
            Ok(mut value) => {
                value.set_sensitive(true);
                self.headers.insert(AUTHORIZATION, value);
                true
            }
            Err(_) => false,
        }
    }
}

/// A received response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Create a JSON response
    pub fn json_body(status: u16, value: &serde_json::Value) -> Self {
        let mut response = Self::new(status, value.to_string());
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }

    pub fn status(&self) -> u16 {
        self.status.as_u16()
    }

    /// Check if successful (2xx status)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Body as text, lossily decoded
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse body as JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Transport used for every network call, allowing for mocking
#[async_trait::async_trait]
pub trait HttpClient: Send + Sync {
    /// Send a request; `Err` means the server could not be reached at all
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Implementation of HttpClient using reqwest
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a client whose requests are bounded by the given timeout
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Create a new client with custom configuration
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Mock implementation of HttpClient for testing
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// What a mocked route answers with
    #[derive(Debug, Clone)]
    pub enum MockReply {
        Response(HttpResponse),
        NetworkError(String),
    }

    type Responder = Arc<dyn Fn(&HttpRequest) -> MockReply + Send + Sync>;

    struct Route {
        method: Method,
        path: String,
        delay: Option<Duration>,
        responder: Responder,
    }

    /// A mock HTTP client that answers from registered routes and records every request
    #[derive(Clone, Default)]
    pub struct MockHttpClient {
        routes: Arc<Mutex<Vec<Route>>>,
        requests: Arc<Mutex<Vec<HttpRequest>>>,
    }

    impl MockHttpClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Register a responder for requests whose URL ends with `path`
        pub fn route<F>(&self, method: Method, path: &str, responder: F)
        where
            F: Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
        {
            self.route_with_delay(method, path, None, responder);
        }

        /// Register a responder that answers after a delay
        pub fn route_with_delay<F>(
            &self,
            method: Method,
            path: &str,
            delay: Option<Duration>,
            responder: F,
        ) where
            F: Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
        {
            self.routes.lock().unwrap().push(Route {
                method,
                path: path.to_string(),
                delay,
                responder: Arc::new(responder),
            });
        }

        /// Register a fixed JSON response
        pub fn mock_json(&self, method: Method, path: &str, status: u16, body: serde_json::Value) {
            self.route(method, path, move |_| {
                MockReply::Response(HttpResponse::json_body(status, &body))
            });
        }

        /// Get the list of recorded requests
        pub fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// Number of recorded requests matching method and path
        pub fn count(&self, method: Method, path: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.method == method && r.url.ends_with(path))
                .count()
        }
    }

    #[async_trait::async_trait]
    impl HttpClient for MockHttpClient {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());

            let found = {
                let routes = self.routes.lock().unwrap();
                routes
                    .iter()
                    .find(|r| r.method == request.method && request.url.ends_with(&r.path))
                    .map(|r| (r.delay, Arc::clone(&r.responder)))
            };

            let (delay, responder) = found.ok_or_else(|| {
                anyhow::anyhow!("No mock response configured for {} {}", request.method, request.url)
            })?;

            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            match responder(&request) {
                MockReply::Response(response) => Ok(response),
                MockReply::NetworkError(reason) => Err(anyhow::anyhow!(reason)),
            }
        }
    }
}
