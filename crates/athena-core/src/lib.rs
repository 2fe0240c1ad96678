//! Client core for the Athena chat service.
//!
//! Holds the signed-in user's conversations and folders, sends messages,
//! assembles streamed assistant replies into sanitized HTML, and reconciles
//! local state with the documents returned by the CRUD API.

pub mod controllers;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;

pub use controllers::{
    ChatController, ChatError, ChatOptions, ChatResult, IncompleteReason, SendOutcome,
};
pub use models::{
    ChatEvent, Conversation, ConversationsStore, ErrorStore, Folder, Message, MessageId, Role,
    SendPhase, Template, TemplateStore, UserIdentity,
};
pub use repositories::{ApiError, ChatApi, HttpChatApi, InMemoryChatApi, SharedHttpClient};
pub use services::{ErrorCollectorLayer, HttpReplySource, ReplySource, StreamError};
pub use settings::{
    AthenaSettings, IncompleteStreamPolicy, SettingsJsonRepository, SettingsRepository,
};
