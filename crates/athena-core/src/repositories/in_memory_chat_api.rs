use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use super::chat_api::{
    ApiOperation, BoxFuture, ChatApi, ConversationDocument, FolderDocument, MessageDocument,
};
use super::error::{ApiError, ApiResult};
use crate::models::Role;

#[derive(Default)]
struct State {
    conversations: Vec<(String, ConversationDocument)>,
    folders: Vec<(String, FolderDocument)>,
    next_id: u64,
    last_time: Option<DateTime<Utc>>,
    /// Calls of an operation to let through before the injected failure
    failures: HashMap<ApiOperation, usize>,
    calls: Vec<ApiOperation>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    /// Strictly increasing server clock so ordering by timestamp is stable
    fn now(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let now = match self.last_time {
            Some(last) if now <= last => last + Duration::milliseconds(1),
            _ => now,
        };
        self.last_time = Some(now);
        now
    }

    fn begin(&mut self, operation: ApiOperation) -> ApiResult<()> {
        self.calls.push(operation);
        match self.failures.get_mut(&operation) {
            Some(0) => {
                self.failures.remove(&operation);
                Err(ApiError::Status {
                    status: 500,
                    body: format!("injected failure for {:?}", operation),
                })
            }
            Some(skip) => {
                *skip -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn conversation_mut(&mut self, id: &str) -> ApiResult<&mut ConversationDocument> {
        self.conversations
            .iter_mut()
            .map(|(_, doc)| doc)
            .find(|doc| doc.id == id)
            .ok_or_else(|| ApiError::NotFound { id: id.to_string() })
    }

    fn folder_snapshots_mut<'a>(
        &'a mut self,
        conversation_id: &'a str,
    ) -> impl Iterator<Item = &'a mut ConversationDocument> + 'a {
        self.folders
            .iter_mut()
            .flat_map(|(_, folder)| folder.conversations.iter_mut())
            .filter(move |c| c.id == conversation_id)
    }
}

/// `ChatApi` that behaves like the document store, kept in memory.
///
/// Assigns `_id`s, trims posted content, mirrors message appends and pin
/// changes into folder snapshots, and can be told to fail the next call of a
/// given operation.
#[derive(Clone, Default)]
pub struct InMemoryChatApi {
    state: Arc<Mutex<State>>,
}

impl InMemoryChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail with HTTP 500
    pub fn fail_next(&self, operation: ApiOperation) {
        self.fail_after(operation, 0);
    }

    /// Let `skip` calls of `operation` succeed, then fail the one after
    pub fn fail_after(&self, operation: ApiOperation, skip: usize) {
        self.state.lock().failures.insert(operation, skip);
    }

    /// Every operation attempted so far, in order
    pub fn calls(&self) -> Vec<ApiOperation> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self, operation: ApiOperation) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| **c == operation)
            .count()
    }

    pub fn conversation(&self, id: &str) -> Option<ConversationDocument> {
        self.state
            .lock()
            .conversations
            .iter()
            .find(|(_, doc)| doc.id == id)
            .map(|(_, doc)| doc.clone())
    }

    pub fn folder(&self, id: &str) -> Option<FolderDocument> {
        self.state
            .lock()
            .folders
            .iter()
            .find(|(_, doc)| doc.id == id)
            .map(|(_, doc)| doc.clone())
    }
}

impl ChatApi for InMemoryChatApi {
    fn sync_user(&self) -> BoxFuture<'static, ApiResult<()>> {
        let state = self.state.clone();
        Box::pin(async move { state.lock().begin(ApiOperation::SyncUser) })
    }

    fn list_conversations(
        &self,
        user_id: &str,
    ) -> BoxFuture<'static, ApiResult<Vec<ConversationDocument>>> {
        let state = self.state.clone();
        let user_id = user_id.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::ListConversations)?;
            Ok(state
                .conversations
                .iter()
                .filter(|(owner, _)| *owner == user_id)
                .map(|(_, doc)| doc.clone())
                .collect())
        })
    }

    fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
    ) -> BoxFuture<'static, ApiResult<ConversationDocument>> {
        let state = self.state.clone();
        let user_id = user_id.to_string();
        let title = title.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::CreateConversation)?;

            let now = state.now();
            let doc = ConversationDocument {
                id: state.next_id("conv"),
                title,
                pinned: false,
                messages: Vec::new(),
                created_at: Some(now),
                updated_at: Some(now),
                message_count: Some(0),
                preview: None,
            };
            state.conversations.push((user_id, doc.clone()));
            Ok(doc)
        })
    }

    fn set_pinned(&self, conversation_id: &str, pinned: bool) -> BoxFuture<'static, ApiResult<()>> {
        let state = self.state.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::SetPinned)?;
            state.conversation_mut(&conversation_id)?.pinned = pinned;
            for snapshot in state.folder_snapshots_mut(&conversation_id) {
                snapshot.pinned = pinned;
            }
            Ok(())
        })
    }

    fn delete_conversation(&self, conversation_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let state = self.state.clone();
        let conversation_id = conversation_id.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::DeleteConversation)?;
            state
                .conversations
                .retain(|(_, doc)| doc.id != conversation_id);
            for (_, folder) in &mut state.folders {
                folder.conversations.retain(|c| c.id != conversation_id);
            }
            Ok(())
        })
    }

    fn post_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> BoxFuture<'static, ApiResult<ConversationDocument>> {
        let state = self.state.clone();
        let conversation_id = conversation_id.to_string();
        let content = content.trim().to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::PostMessage)?;
            state.conversation_mut(&conversation_id)?;

            let now = state.now();
            let message = MessageDocument {
                id: state.next_id("msg"),
                role,
                content,
                created_at: Some(now),
            };

            let append = |doc: &mut ConversationDocument| {
                doc.messages.push(message.clone());
                doc.message_count = Some(doc.messages.len());
                doc.updated_at = Some(now);
            };

            for snapshot in state.folder_snapshots_mut(&conversation_id) {
                append(snapshot);
            }
            let doc = state.conversation_mut(&conversation_id)?;
            append(doc);
            Ok(doc.clone())
        })
    }

    fn list_folders(&self, user_id: &str) -> BoxFuture<'static, ApiResult<Vec<FolderDocument>>> {
        let state = self.state.clone();
        let user_id = user_id.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::ListFolders)?;
            Ok(state
                .folders
                .iter()
                .filter(|(owner, _)| *owner == user_id)
                .map(|(_, doc)| doc.clone())
                .collect())
        })
    }

    fn create_folder(
        &self,
        user_id: &str,
        name: &str,
        conversations: Vec<ConversationDocument>,
    ) -> BoxFuture<'static, ApiResult<FolderDocument>> {
        let state = self.state.clone();
        let user_id = user_id.to_string();
        let name = name.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::CreateFolder)?;

            let doc = FolderDocument {
                id: state.next_id("folder"),
                name,
                conversations,
            };
            state.folders.push((user_id, doc.clone()));
            Ok(doc)
        })
    }

    fn rename_folder(&self, folder_id: &str, new_name: &str) -> BoxFuture<'static, ApiResult<()>> {
        let state = self.state.clone();
        let folder_id = folder_id.to_string();
        let new_name = new_name.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::RenameFolder)?;
            let folder = state
                .folders
                .iter_mut()
                .map(|(_, doc)| doc)
                .find(|doc| doc.id == folder_id)
                .ok_or_else(|| ApiError::NotFound { id: folder_id.clone() })?;
            folder.name = new_name;
            Ok(())
        })
    }

    fn delete_folder(&self, folder_id: &str) -> BoxFuture<'static, ApiResult<()>> {
        let state = self.state.clone();
        let folder_id = folder_id.to_string();

        Box::pin(async move {
            let mut state = state.lock();
            state.begin(ApiOperation::DeleteFolder)?;
            state.folders.retain(|(_, doc)| doc.id != folder_id);
            Ok(())
        })
    }
}
