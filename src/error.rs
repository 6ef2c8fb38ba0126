//! Error taxonomy and retry logic
//!
//! Every engine operation returns [`RelayError`]. Callers branch on
//! [`RelayError::kind`] rather than on variants so that wrapped sqlite, JSON
//! and HTTP failures classify the same way as errors raised by the engine.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use rusqlite::ErrorCode;
use thiserror::Error;
use tokio::time::sleep;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Coarse error classes shared by the store, the HTTP surface and the poll client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed request (missing locator fields, unknown app type, ...)
    Validation,

    /// A uniqueness or foreign-key constraint rejected the write
    ConstraintViolation,

    /// Unknown connection or update id
    NotFound,

    /// Network or store temporarily unavailable (retryable)
    TransientIo,

    /// Stops the affected loop
    Fatal,
}

impl ErrorKind {
    /// Only transient failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientIo)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::ConstraintViolation => "constraint_violation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Errors raised by the relay engine, its HTTP surface and the poll client.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success response from a relay server
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }

    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Classify this error into the relay taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::TransientIo(_) => ErrorKind::TransientIo,
            Self::Fatal(_) | Self::Sqlite(_) => ErrorKind::Fatal,
            Self::Json(_) => ErrorKind::Validation,
            Self::Http(err) => {
                if err.is_decode() || err.is_builder() {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::TransientIo
                }
            }
            Self::Api { status, .. } => match *status {
                400 | 422 => ErrorKind::Validation,
                404 => ErrorKind::NotFound,
                409 => ErrorKind::ConstraintViolation,
                408 | 425 | 429 | 500..=599 => ErrorKind::TransientIo,
                _ => ErrorKind::Fatal,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// HTTP status the server answers with for this error.
    pub fn status_code(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::ConstraintViolation => 409,
            ErrorKind::TransientIo => 503,
            ErrorKind::Fatal => 500,
        }
    }
}

impl From<rusqlite::Error> for RelayError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
                ErrorCode::ConstraintViolation => RelayError::ConstraintViolation(
                    message.clone().unwrap_or_else(|| failure.to_string()),
                ),
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    RelayError::TransientIo(err.to_string())
                }
                _ => RelayError::Sqlite(err),
            },
            _ => RelayError::Sqlite(err),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Spread concurrent retries by up to a fifth of the delay.
fn with_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..=(ms / 5).max(1));
    delay + Duration::from_millis(jitter)
}

/// Execute an async operation, retrying retryable failures with exponential
/// backoff. Non-retryable failures are returned as they are; exhausting the
/// attempt budget escalates to [`RelayError::Fatal`].
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempts >= policy.max_attempts {
                    return Err(RelayError::fatal(format!(
                        "operation failed after {} attempts: {}",
                        attempts, e
                    )));
                }

                let delay = policy.delay_after(attempts);
                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    error = %e,
                    "retrying after transient failure"
                );

                sleep(with_jitter(delay)).await;
            }
        }
    }
}
