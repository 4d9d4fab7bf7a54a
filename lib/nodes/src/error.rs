//! Error types for the nodes crate.

use std::fmt;

/// Errors from enqueuing outbound work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundError {
    /// The delivery log could not be reached.
    Unavailable { details: String },
    /// The instruction could not be encoded.
    Encode { details: String },
}

impl fmt::Display for OutboundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable { details } => {
                write!(f, "outbound delivery log unavailable: {details}")
            }
            Self::Encode { details } => {
                write!(f, "failed to encode outbound instruction: {details}")
            }
        }
    }
}

impl std::error::Error for OutboundError {}
