use std::fmt;

/// Errors surfaced by the collaborators the River talks to.
///
/// The River itself never lets these escape its loop; they are logged
/// and the cycle carries on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RiverError {
    /// A message or object could not be (de)serialized.
    Serialization(String),

    /// The queue backend rejected a push or pull.
    Queue(String),

    /// The DAO failed to read or persist objects.
    Dao(String),

    /// The outbound webhook request could not be built or sent.
    Http(String),

    /// A required field was missing from an operation payload.
    InvalidPayload {
        reason: String,
    },
}

pub type RiverResult<T> = Result<T, RiverError>;

impl fmt::Display for RiverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiverError::Serialization(msg) =>
                write!(f, "serialization failed: {}", msg),
            RiverError::Queue(msg) =>
                write!(f, "queue error: {}", msg),
            RiverError::Dao(msg) =>
                write!(f, "dao error: {}", msg),
            RiverError::Http(msg) =>
                write!(f, "http error: {}", msg),
            RiverError::InvalidPayload { reason } =>
                write!(f, "invalid payload: {}", reason),
        }
    }
}

impl std::error::Error for RiverError {}

impl From<serde_json::Error> for RiverError {
    fn from(err: serde_json::Error) -> Self {
        RiverError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for RiverError {
    fn from(err: reqwest::Error) -> Self {
        RiverError::Http(err.to_string())
    }
}

/// Result of a single webhook delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Failed(FailureReason),
}

/// Reasons why an HTTP delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout,
    Network,
    /// Target answered with a status outside the success range.
    Status(u16),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout =>
                write!(f, "request timed out"),
            FailureReason::Network =>
                write!(f, "network error"),
            FailureReason::Status(code) =>
                write!(f, "target returned status {}", code),
        }
    }
}
