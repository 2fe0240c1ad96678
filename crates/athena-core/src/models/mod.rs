pub mod conversation;
pub mod conversations_store;
pub mod error_store;
pub mod folder;
pub mod stream_manager;
pub mod template_store;
pub mod user;

pub use conversation::{ContentFormat, Conversation, Message, MessageId, Role};
pub use conversations_store::ConversationsStore;
pub use error_store::{ErrorEntry, ErrorLevel, ErrorStore};
pub use folder::Folder;
pub use stream_manager::{ChatEvent, SendPhase, StreamManager, StreamStatus, StreamTicket};
pub use template_store::{Template, TemplateStore};
pub use user::UserIdentity;
