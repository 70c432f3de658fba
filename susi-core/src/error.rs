//! Error taxonomy shared by every pipeline step.
//!
//! Steps classify what they can (an HTTP 401 from OneDrive is an auth problem,
//! a 503 from S3 is transient) and everything bubbles up to the orchestrator,
//! which decides between "retry next cycle" and "drop and notify".

use thiserror::Error;

/// Errors produced by the image pipeline and its collaborators.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Credentials invalid or expired. Needs manual remediation (re-run the
    /// OAuth flow), never retried automatically.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Network failure, timeout, rate limit or 5xx. Retried with backoff.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The remote API understood and rejected the request.
    #[error("platform rejected request (code {code}): {message}")]
    Platform { code: String, message: String },

    /// Missing or invalid setting.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Local state file could not be read or written.
    #[error("local state i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    #[must_use]
    pub fn platform(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Platform {
            code: code.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Only transient failures are worth another attempt within a cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Classify a non-success HTTP response from a bearer-token API.
    ///
    /// 401/403 mean the token is bad, 408/429/5xx are worth retrying, and any
    /// other status is the platform refusing the request.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = truncate(body, 500);
        match status {
            401 | 403 => Self::Auth(format!("status {status}: {body}")),
            408 | 429 | 500..=599 => Self::Transient(format!("status {status}: {body}")),
            _ => Self::Platform {
                code: status.to_string(),
                message: body.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), &e.to_string());
        }
        if e.is_decode() {
            return Self::Platform {
                code: "decode".to_string(),
                message: e.to_string(),
            };
        }
        Self::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Cut a response body down to something that fits in a log line or email.
pub(crate) fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
