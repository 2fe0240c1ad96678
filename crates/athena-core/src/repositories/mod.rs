pub mod chat_api;
pub mod document_adapter;
pub mod error;
pub mod http_chat_api;
pub mod http_client;
pub mod in_memory_chat_api;

pub use chat_api::{
    ApiOperation, BoxFuture, ChatApi, ConversationDocument, FolderDocument, MessageDocument,
};
pub use document_adapter::{
    conversation_from_document, conversation_to_document, folder_from_document,
};
pub use error::{ApiError, ApiResult};
pub use http_chat_api::HttpChatApi;
pub use http_client::SharedHttpClient;
pub use in_memory_chat_api::InMemoryChatApi;
