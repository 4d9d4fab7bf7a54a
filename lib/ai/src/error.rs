//! Error types for the AI crate.
//!
//! - `LlmError`: a completion call that produced no usable text
//! - `JsonObjectError`: model output that is not a single JSON object
//!
//! AI node kinds turn both into their documented fallback outputs, so
//! neither normally fails a run.

use std::fmt;

/// A completion call that produced no usable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// The endpoint could not be reached.
    Unreachable { endpoint: String, reason: String },
    /// The endpoint answered with a non-success status.
    Status { status: u16, body: String },
    /// The completion did not arrive in time.
    Timeout,
    /// The provider throttled the call.
    RateLimited { retry_after_secs: Option<u64> },
    /// The response body was not a chat completion.
    InvalidResponse { reason: String },
    /// The backend cannot be built from its configuration.
    InvalidConfig { reason: String },
    /// A scripted backend ran out of responses.
    Exhausted,
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unreachable { endpoint, reason } => {
                write!(f, "completion endpoint {endpoint} unreachable: {reason}")
            }
            Self::Status { status, body } if body.is_empty() => {
                write!(f, "completion endpoint returned {status}")
            }
            Self::Status { status, body } => {
                write!(f, "completion endpoint returned {status}: {body}")
            }
            Self::Timeout => write!(f, "completion timed out"),
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => write!(f, "completion rate limited, retry after {secs}s"),
            Self::RateLimited {
                retry_after_secs: None,
            } => write!(f, "completion rate limited"),
            Self::InvalidResponse { reason } => {
                write!(f, "invalid completion response: {reason}")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid LLM configuration: {reason}"),
            Self::Exhausted => write!(f, "no scripted completion left"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Model output that could not be read as exactly one JSON object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonObjectError {
    /// The output was empty.
    Empty,
    /// The output was not valid JSON, or had trailing content.
    Malformed { reason: String },
    /// The output was valid JSON but not an object.
    NotAnObject { found: &'static str },
}

impl fmt::Display for JsonObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "model returned no content"),
            Self::Malformed { reason } => write!(f, "model returned malformed JSON: {reason}"),
            Self::NotAnObject { found } => {
                write!(f, "model returned a JSON {found} instead of an object")
            }
        }
    }
}

impl std::error::Error for JsonObjectError {}
