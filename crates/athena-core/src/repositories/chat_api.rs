use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ApiResult;
use crate::models::Role;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Message as stored by the document database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Conversation as stored by the document database.
///
/// `messageCount` and `preview` may be present on the wire but are never
/// trusted; the client derives both from `messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub messages: Vec<MessageDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderDocument {
    #[serde(rename = "_id", default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub conversations: Vec<ConversationDocument>,
}

/// Which CRUD call an operation maps to (used for logging and failure injection)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    SyncUser,
    ListConversations,
    CreateConversation,
    SetPinned,
    DeleteConversation,
    PostMessage,
    ListFolders,
    CreateFolder,
    RenameFolder,
    DeleteFolder,
}

/// CRUD seam over the document store.
///
/// Each method is exactly one request. Methods returning a document return the
/// server's authoritative copy after the change.
pub trait ChatApi: Send + Sync + 'static {
    /// Register the signed-in user with the backend
    fn sync_user(&self) -> BoxFuture<'static, ApiResult<()>>;

    fn list_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, ApiResult<Vec<ConversationDocument>>>;

    fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
    ) -> BoxFuture<'static, ApiResult<ConversationDocument>>;

    fn set_pinned(&self, conversation_id: &str, pinned: bool) -> BoxFuture<'static, ApiResult<()>>;

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, ApiResult<()>>;

    /// Append a message; answers with the updated conversation
    fn post_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> BoxFuture<'static, ApiResult<ConversationDocument>>;

    fn list_folders(&self, user_id: &str) -> BoxFuture<'static, ApiResult<Vec<FolderDocument>>>;

    fn create_folder(
        &self,
        user_id: &str,
        name: &str,
        conversations: Vec<ConversationDocument>,
    ) -> BoxFuture<'static, ApiResult<FolderDocument>>;

    fn rename_folder(&self, folder_id: &str, new_name: &str) -> BoxFuture<'static, ApiResult<()>>;

    fn delete_folder(&self, folder_id: &str) -> BoxFuture<'static, ApiResult<()>>;
}
