use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, trace, warn};

use crate::auth::clock::{is_session_valid, Clock};
use crate::auth::storage::TokenStore;
use crate::auth::token::SessionRecord;
use crate::http::HttpRequest;

/// Remaining lifetime below which attaching a credential is logged
const EXPIRY_NOTICE_SECS: i64 = 60;

/// Per-call state carried through the interceptor chain
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: HttpRequest,
    /// Number of replays already performed for this call
    pub attempt: u32,
    /// Access token the store held when the call was prepared
    seen_token: Option<String>,
}

impl RequestContext {
    pub fn new(request: HttpRequest) -> Self {
        Self {
            request,
            attempt: 0,
            seen_token: None,
        }
    }

    pub fn is_replay(&self) -> bool {
        self.attempt > 0
    }

    /// Access token the call was prepared against, attached or not
    pub fn seen_token(&self) -> Option<&str> {
        self.seen_token.as_deref()
    }

    /// Mark the call retried and carry the new credential
    pub fn prepare_replay(&mut self, record: &SessionRecord, default_token_type: &str) {
        self.attempt += 1;
        self.seen_token = Some(record.access_token.clone());
        if !self
            .request
            .set_authorization(&record.authorization_value(default_token_type))
        {
            warn!(url = %self.request.url, "Refreshed credential is not a valid header value");
        }
    }
}

/// Attaches the session credential to outbound calls
#[derive(Clone)]
pub struct RequestInterceptor {
    store: Arc<TokenStore>,
    clock: Arc<dyn Clock>,
    default_token_type: String,
}

impl RequestInterceptor {
    pub fn new(store: Arc<TokenStore>, clock: Arc<dyn Clock>, default_token_type: &str) -> Self {
        Self {
            store,
            clock,
            default_token_type: default_token_type.to_string(),
        }
    }

    /// Attach `Authorization` when the session is valid; otherwise leave the call untouched
    pub fn intercept(&self, ctx: &mut RequestContext) {
        let record = self.store.read();
        ctx.seen_token = record.as_ref().map(|r| r.access_token.clone());

        let now = self.clock.now();
        match record {
            Some(record) if is_session_valid(Some(&record), now) => {
                let value = record.authorization_value(&self.default_token_type);
                if ctx.request.set_authorization(&value) {
                    trace!(
                        url = %ctx.request.url,
                        expires_in_secs = record.seconds_until_expiry(now),
                        "Attached session credential"
                    );
                    if record.expires_within(now, Duration::seconds(EXPIRY_NOTICE_SECS)) {
                        debug!(url = %ctx.request.url, "Session credential expires soon");
                    }
                } else {
                    warn!(url = %ctx.request.url, "Stored credential is not a valid header value");
                }
            }
            Some(_) => trace!(url = %ctx.request.url, "Session expired, sending without credential"),
            None => trace!(url = %ctx.request.url, "No session, sending without credential"),
        }
    }
}
