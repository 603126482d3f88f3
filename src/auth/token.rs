use std::collections::BTreeSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{token_decode_failed, SessionError, SessionResult};

/// The persisted session artifacts.
///
/// A record only exists as a whole: every field is required, so "no session"
/// is expressed as `Option<SessionRecord>::None` rather than as empty fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The bearer credential attached to outbound requests
    pub access_token: String,
    /// Longer-lived credential exchanged for a new access token
    pub refresh_token: String,
    /// Authorization scheme declared by the server (usually "Bearer")
    pub token_type: String,
    /// Lifetime of the access token, counted from `issued_at`
    pub expires_in_seconds: u64,
    /// When the access token was issued
    pub issued_at: DateTime<Utc>,
}

impl SessionRecord {
    /// The single instant at which the access token stops being valid
    pub fn expires_at(&self) -> DateTime<Utc> {
        let lifetime = i64::try_from(self.expires_in_seconds).unwrap_or(i64::MAX);
        Duration::try_seconds(lifetime)
            .and_then(|lifetime| self.issued_at.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Seconds left before expiry (negative once expired)
    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at() - now).num_seconds()
    }

    /// Check if the token will expire within the given window
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.expires_at() - now <= window
    }

    /// Value for the `Authorization` header
    pub fn authorization_value(&self, default_type: &str) -> String {
        let scheme = if self.token_type.trim().is_empty() {
            default_type
        } else {
            self.token_type.trim()
        };
        format!("{} {}", scheme, self.access_token)
    }
}

/// Token response returned by the login and refresh endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(alias = "expiresInSeconds")]
    pub expires_in: u64,
    #[serde(default, deserialize_with = "deserialize_issued_at")]
    pub issued_at: Option<DateTime<Utc>>,
}

impl TokenGrant {
    /// Turn the grant into a complete session record.
    ///
    /// Refresh responses may omit the refresh token, in which case the one
    /// that was exchanged stays in use.
    pub fn into_record(
        self,
        previous_refresh_token: Option<&str>,
        default_token_type: &str,
        now: DateTime<Utc>,
    ) -> SessionResult<SessionRecord> {
        if self.access_token.trim().is_empty() {
            return Err(SessionError::UnexpectedResponse {
                status: 200,
                reason: "token response carried an empty access token".to_string(),
            });
        }

        let refresh_token = match self.refresh_token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => previous_refresh_token
                .map(str::to_string)
                .ok_or_else(|| SessionError::UnexpectedResponse {
                    status: 200,
                    reason: "token response carried no refresh token".to_string(),
                })?,
        };

        Ok(SessionRecord {
            access_token: self.access_token,
            refresh_token,
            token_type: self
                .token_type
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| default_token_type.to_string()),
            expires_in_seconds: self.expires_in,
            issued_at: self.issued_at.unwrap_or(now),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IssuedAtRepr {
    Millis(i64),
    Text(String),
}

fn deserialize_issued_at<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<IssuedAtRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(IssuedAtRepr::Millis(ms)) => DateTime::<Utc>::from_timestamp_millis(ms)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("issuedAt out of range: {}", ms))),
        Some(IssuedAtRepr::Text(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| D::Error::custom(format!("invalid issuedAt '{}': {}", text, e))),
    }
}

/// Identity claims read from the access token payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// The `sub` claim, used as the user name
    pub subject: String,
    /// Role names granted to the user
    pub roles: BTreeSet<String>,
    /// Server-side user identifier (any JSON value, null when absent)
    pub user_id: Value,
}

impl Identity {
    pub fn user_name(&self) -> &str {
        &self.subject
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_any_role<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().any(|role| self.roles.contains(role.as_ref()))
    }
}

/// Decode the identity carried in a JWT payload segment.
///
/// The signature is not verified; the server that issued the token is the
/// only authority on its validity. Anything that does not parse is reported
/// as `SessionError::TokenDecode`.
pub fn decode_identity(token: &str) -> SessionResult<Identity> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(header), Some(payload)) if !header.is_empty() && !payload.is_empty() => payload,
        _ => return Err(token_decode_failed("token is not a JWT")),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| token_decode_failed(format!("payload is not base64url: {}", e)))?;

    let claims: Value = serde_json::from_slice(&bytes)
        .map_err(|e| token_decode_failed(format!("payload is not JSON: {}", e)))?;

    let claims = claims
        .as_object()
        .ok_or_else(|| token_decode_failed("payload is not a JSON object"))?;

    let subject = claims
        .get("sub")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| token_decode_failed("payload has no subject"))?
        .to_string();

    let roles = ["roles", "authorities", "role"]
        .iter()
        .find_map(|name| claims.get(*name))
        .map(parse_roles)
        .unwrap_or_default();

    let user_id = ["userId", "user_id", "id"]
        .iter()
        .find_map(|name| claims.get(*name))
        .cloned()
        .unwrap_or(Value::Null);

    Ok(Identity {
        subject,
        roles,
        user_id,
    })
}

fn parse_roles(value: &Value) -> BTreeSet<String> {
    let names: Vec<&str> = match value {
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        Value::String(joined) => joined.split(',').collect(),
        _ => Vec::new(),
    };

    names
        .into_iter()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Build an unsigned JWT carrying the given claims
#[cfg(test)]
pub(crate) fn unsigned_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}
