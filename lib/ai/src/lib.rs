//! AI primitives for the relayflow platform.
//!
//! Node kinds that call a model go through [`LlmBackend`]. The production
//! backend speaks the OpenAI chat completions wire format; every reply is
//! expected to be one JSON object, read with [`parse_json_object`].

pub mod backend;
pub mod error;
pub mod json;
pub mod openai;

pub use backend::{
    LlmBackend, LlmBackendConfig, LlmMessage, LlmProvider, LlmRequest, LlmResponse, MessageRole,
    ScriptedBackend, TokenUsage,
};
pub use error::{JsonObjectError, LlmError};
pub use json::parse_json_object;
pub use openai::OpenAiCompatibleBackend;
