pub mod chat_controller;
pub mod error;

pub use chat_controller::{ChatController, ChatOptions, IncompleteReason, SendOutcome};
pub use error::{ChatError, ChatResult};
