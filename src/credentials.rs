//! Short-lived credentials and the cache that keeps them fresh.
//!
//! [`CredentialCache`] keeps one slot per [`CredentialScope`]. A slot's mutex is held
//! across the whole "check expiry, refresh if needed" sequence, so concurrent tasks
//! that find the same expired credential wait for a single refresh.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Deserializer};

use crate::error::{CmrErrorResponse, Error, Result};

/// Minutes before expiry at which a credential is refreshed.
pub const DEFAULT_SAFETY_MARGIN_MINUTES: i64 = 5;

/// Temporary AWS keys handed out by a DAAC `/s3credentials` endpoint.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct S3Credentials {
    #[serde(rename = "accessKeyId")]
    pub access_key_id: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_access_key: String,
    #[serde(rename = "sessionToken", default)]
    pub session_token: String,
    #[serde(deserialize_with = "de_expiration")]
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub token: String,
    /// `None` for tokens supplied by the user; they are trusted until rejected.
    pub expiration: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerToken")
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CredentialScope {
    /// Direct access through one DAAC's credential endpoint.
    S3 { endpoint: String },
    /// HTTPS downloads with an Earthdata Login bearer token.
    Https,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    S3(S3Credentials),
    Bearer(BearerToken),
}

impl Credential {
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        match self {
            Credential::S3(c) => Some(c.expiration),
            Credential::Bearer(t) => t.expiration,
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        match self.expiration() {
            Some(exp) => now < exp - margin,
            None => true,
        }
    }
}

/// Source of fresh credentials; the cache calls it only on a miss or expiry.
pub trait CredentialProvider: Send + Sync {
    fn s3_credentials(&self, endpoint: &str) -> Result<S3Credentials>;
    fn bearer_token(&self) -> Result<BearerToken>;
}

impl<P: CredentialProvider + ?Sized> CredentialProvider for &P {
    fn s3_credentials(&self, endpoint: &str) -> Result<S3Credentials> {
        (**self).s3_credentials(endpoint)
    }

    fn bearer_token(&self) -> Result<BearerToken> {
        (**self).bearer_token()
    }
}

impl<P: CredentialProvider + ?Sized> CredentialProvider for Arc<P> {
    fn s3_credentials(&self, endpoint: &str) -> Result<S3Credentials> {
        (**self).s3_credentials(endpoint)
    }

    fn bearer_token(&self) -> Result<BearerToken> {
        (**self).bearer_token()
    }
}

/// Seconds a failed refresh is replayed to later callers before the provider is tried again.
pub const DEFAULT_FAILURE_TTL_SECS: i64 = 30;

#[derive(Debug, Clone, Default)]
enum SlotState {
    #[default]
    Empty,
    Ready(Credential),
    /// The last refresh failed; callers get the same error until `retry_at`.
    Failed {
        message: String,
        retry_at: DateTime<Utc>,
    },
}

type Slot = Arc<Mutex<SlotState>>;

pub struct CredentialCache<P> {
    provider: P,
    margin: TimeDelta,
    failure_ttl: TimeDelta,
    slots: Mutex<HashMap<CredentialScope, Slot>>,
}

impl<P: CredentialProvider> CredentialCache<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            margin: TimeDelta::minutes(DEFAULT_SAFETY_MARGIN_MINUTES),
            failure_ttl: TimeDelta::seconds(DEFAULT_FAILURE_TTL_SECS),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_safety_margin(mut self, margin: TimeDelta) -> Self {
        self.margin = margin;
        self
    }

    /// How long a failed refresh is shared with later callers of the same scope.
    pub fn with_failure_ttl(mut self, ttl: TimeDelta) -> Self {
        self.failure_ttl = ttl;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns a credential for `scope` that will not expire within the safety margin.
    ///
    /// Callers that queue behind an in-flight refresh get its result, success or
    /// failure, without calling the provider themselves.
    pub fn get(&self, scope: &CredentialScope) -> Result<Credential> {
        let slot = self.slot(scope);
        let mut current = slot.lock();
        let now = Utc::now();
        match &*current {
            SlotState::Ready(cred) if cred.is_fresh(now, self.margin) => return Ok(cred.clone()),
            SlotState::Ready(cred) => {
                tracing::info!(?scope, expiration = ?cred.expiration(), "credential expired, refreshing");
            }
            SlotState::Failed { message, retry_at } if now < *retry_at => {
                return Err(Error::Credential(message.clone()));
            }
            SlotState::Failed { .. } | SlotState::Empty => {}
        }

        match self.refresh(scope) {
            Ok(fresh) => {
                tracing::debug!(?scope, expiration = ?fresh.expiration(), "credential refreshed");
                *current = SlotState::Ready(fresh.clone());
                Ok(fresh)
            }
            Err(err) => {
                let message = match err {
                    Error::Credential(message) => message,
                    other => other.to_string(),
                };
                tracing::warn!(?scope, error = %message, "credential refresh failed");
                *current = SlotState::Failed {
                    message: message.clone(),
                    retry_at: Utc::now() + self.failure_ttl,
                };
                Err(Error::Credential(message))
            }
        }
    }

    /// Seeds or replaces the cached credential for `scope`.
    pub fn insert(&self, scope: CredentialScope, credential: Credential) {
        *self.slot(&scope).lock() = SlotState::Ready(credential);
    }

    /// Forgets the cached credential or failure for `scope`.
    pub fn invalidate(&self, scope: &CredentialScope) {
        if let Some(slot) = self.slots.lock().get(scope) {
            *slot.lock() = SlotState::Empty;
        }
    }

    fn refresh(&self, scope: &CredentialScope) -> Result<Credential> {
        Ok(match scope {
            CredentialScope::S3 { endpoint } => {
                Credential::S3(self.provider.s3_credentials(endpoint)?)
            }
            CredentialScope::Https => Credential::Bearer(self.provider.bearer_token()?),
        })
    }

    fn slot(&self, scope: &CredentialScope) -> Slot {
        self.slots.lock().entry(scope.clone()).or_default().clone()
    }
}

/// Earthdata Login backed provider.
#[derive(Clone)]
pub struct EarthdataAuth {
    http: HttpClient,
    edl_hostname: String,
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl std::fmt::Debug for EarthdataAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EarthdataAuth")
            .field("edl_hostname", &self.edl_hostname)
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expiration_date: Option<String>,
}

impl EarthdataAuth {
    pub fn new(
        http: HttpClient,
        edl_hostname: impl Into<String>,
        token: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        Self {
            http,
            edl_hostname: edl_hostname.into(),
            token,
            username,
            password,
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.token.is_some() || (self.username.is_some() && self.password.is_some())
    }

    fn find_or_create_token(&self, username: &str, password: &str) -> Result<BearerToken> {
        let url = format!("https://{}/api/users/find_or_create_token", self.edl_hostname);
        tracing::debug!(%url, "requesting Earthdata Login token");
        let resp = self
            .http
            .post(&url)
            .basic_auth(username, Some(password))
            .send()
            .map_err(|e| Error::Credential(format!("could not reach Earthdata Login: {e}")))?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Credential(format!(
                "Earthdata Login rejected the token request (HTTP {}): {}",
                status.as_u16(),
                error_detail(&text)
            )));
        }

        let parsed: TokenResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Credential(format!("unexpected token response: {e}")))?;
        Ok(BearerToken {
            token: parsed.access_token,
            expiration: parsed.expiration_date.as_deref().and_then(parse_token_date),
        })
    }
}

impl CredentialProvider for EarthdataAuth {
    fn s3_credentials(&self, endpoint: &str) -> Result<S3Credentials> {
        let token = self.bearer_token()?;
        tracing::debug!(%endpoint, "requesting S3 credentials");
        let resp = self
            .http
            .get(endpoint)
            .bearer_auth(&token.token)
            .send()
            .map_err(|e| Error::Credential(format!("could not reach {endpoint}: {e}")))?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if !status.is_success() {
            return Err(Error::Credential(format!(
                "{endpoint} returned HTTP {}: {}",
                status.as_u16(),
                error_detail(&text)
            )));
        }
        serde_json::from_str(&text)
            .map_err(|e| Error::Credential(format!("unexpected S3 credential response: {e}")))
    }

    fn bearer_token(&self) -> Result<BearerToken> {
        if let Some(token) = &self.token {
            return Ok(BearerToken {
                token: token.clone(),
                expiration: None,
            });
        }
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => self.find_or_create_token(u, p),
            _ => Err(Error::Credential(
                "no Earthdata Login credentials configured; set EARTHDATA_TOKEN, \
                 EARTHDATA_USERNAME/EARTHDATA_PASSWORD, or add a .netrc entry"
                    .to_string(),
            )),
        }
    }
}

fn error_detail(body: &str) -> String {
    serde_json::from_str::<CmrErrorResponse>(body)
        .ok()
        .map(|e| {
            e.error_description
                .or(e.error)
                .or(e.message)
                .unwrap_or_default()
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| body.trim().chars().take(300).collect())
}

/// Accepts RFC 3339 and the `2024-01-01 00:00:00+00:00` form DAAC endpoints return.
pub fn parse_expiration(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%:z"))
        .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

// Earthdata Login reports token expiry as a bare `MM/DD/YYYY` date.
fn parse_token_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(s.trim(), "%m/%d/%Y")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn de_expiration<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DateTime<Utc>, D::Error> {
    let s = String::deserialize(d)?;
    parse_expiration(&s)
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised expiration `{s}`")))
}
