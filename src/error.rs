use std::fmt;

use reqwest::StatusCode;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The filter combination can never be sent to the catalog.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A catalog page request failed; pagination stops here.
    #[error("catalog request failed{}: {message} (url: {url})", status_suffix(.status))]
    CatalogRequest {
        status: Option<u16>,
        url: String,
        message: String,
    },

    /// A catalog item could not be understood as a record.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("transfer batch is empty")]
    EmptyBatch,

    #[error("configuration error: {0:#}")]
    Config(#[from] anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

/// Why a single transfer task ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Connection reset, timeout, 408/429/5xx.
    TransientNetwork,
    NotFound,
    Forbidden,
    /// Target path is malformed or collides with something that is not a file.
    LocalPathConflict,
    /// The record carries no link of a usable access class.
    NoAccessLink,
    Credential,
    Cancelled,
    Other,
}

impl FailureReason {
    pub fn from_status(status: StatusCode) -> Self {
        match status.as_u16() {
            404 | 410 => FailureReason::NotFound,
            401 | 403 => FailureReason::Forbidden,
            code if crate::util::retriable_status(code) => FailureReason::TransientNetwork,
            _ => FailureReason::Other,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::TransientNetwork => "transient network error",
            FailureReason::NotFound => "not found",
            FailureReason::Forbidden => "forbidden",
            FailureReason::LocalPathConflict => "local path conflict",
            FailureReason::NoAccessLink => "no usable access link",
            FailureReason::Credential => "credential unavailable",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Other => "failed",
        };
        f.write_str(s)
    }
}

/// Per-item transfer failure. Never returned from a batch call directly; it is
/// only found inside [`crate::TransferReport::failed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {message}")]
pub struct TransferTaskError {
    pub reason: FailureReason,
    pub message: String,
}

impl TransferTaskError {
    pub fn new(reason: FailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.reason == FailureReason::TransientNetwork
    }

    pub(crate) fn from_reqwest(url: &str, err: &reqwest::Error) -> Self {
        let reason = match err.status() {
            Some(status) => FailureReason::from_status(status),
            None if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() => {
                FailureReason::TransientNetwork
            }
            None => FailureReason::Other,
        };
        Self::new(reason, format!("{url}: {err}"))
    }

    pub(crate) fn from_io(path: &std::path::Path, err: &std::io::Error) -> Self {
        let reason = match err.kind() {
            std::io::ErrorKind::PermissionDenied => FailureReason::Forbidden,
            std::io::ErrorKind::IsADirectory
            | std::io::ErrorKind::AlreadyExists
            | std::io::ErrorKind::InvalidInput => FailureReason::LocalPathConflict,
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::Interrupted => FailureReason::TransientNetwork,
            _ => FailureReason::Other,
        };
        Self::new(reason, format!("{}: {err}", path.display()))
    }
}

impl From<Error> for TransferTaskError {
    fn from(err: Error) -> Self {
        let reason = match &err {
            Error::Credential(_) => FailureReason::Credential,
            Error::Http(e) => e
                .status()
                .map(FailureReason::from_status)
                .unwrap_or(FailureReason::TransientNetwork),
            Error::CatalogRequest {
                status: Some(code), ..
            } => StatusCode::from_u16(*code)
                .map(FailureReason::from_status)
                .unwrap_or(FailureReason::Other),
            _ => FailureReason::Other,
        };
        TransferTaskError::new(reason, err.to_string())
    }
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct CmrErrorResponse {
    #[serde(default)]
    pub(crate) errors: Vec<serde_json::Value>,
    // Earthdata Login and the S3 credential endpoints answer with these instead.
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) error_description: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

impl CmrErrorResponse {
    fn joined(&self) -> String {
        let mut parts: Vec<String> = self
            .errors
            .iter()
            .map(|e| match e {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect();
        parts.extend(self.error.iter().cloned());
        parts.extend(self.error_description.iter().cloned());
        parts.extend(self.message.iter().cloned());
        parts.join("; ")
    }
}

/// Turns a failed catalog response into an actionable [`Error::CatalogRequest`].
pub(crate) fn format_catalog_error(status: StatusCode, url: &str, body: &str) -> Error {
    let detail = serde_json::from_str::<CmrErrorResponse>(body)
        .map(|e| e.joined())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| body.trim().chars().take(1000).collect());

    let message = if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        format!(
            "authentication/authorization failed.\n- Check that EARTHDATA_TOKEN (or the .netrc entry for Earthdata Login) is valid\n- Ensure the token is not expired\n- Restricted collections also require the dataset EULA to be accepted\n\nServer message: {detail}"
        )
    } else if status == StatusCode::BAD_REQUEST {
        format!("the catalog rejected the query parameters.\n\nServer message: {detail}")
    } else {
        detail
    };

    Error::CatalogRequest {
        status: Some(status.as_u16()),
        url: url.to_string(),
        message,
    }
}
