pub mod anthropic;
pub mod canonical;
pub mod envelope;
pub(crate) mod error_shapes;
pub mod mapping;
pub mod openai_chat;
pub mod openai_responses;
pub mod usage;
