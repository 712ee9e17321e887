pub mod anthropic;

pub use anthropic::{LlmClient, LlmConfig, LlmError, LlmMessage, LlmResponse};
