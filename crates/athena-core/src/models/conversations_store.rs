use std::collections::HashMap;

use chrono::{DateTime, Utc};

use super::conversation::{Conversation, Message, MessageId};
use super::folder::Folder;

/// Client-side store for the signed-in user's conversations and folders.
///
/// The conversation map is the single authority for conversation content.
/// Folder entries hold snapshots of the same conversations; every mutation
/// goes through `apply_to_conversation` (or one of the replace/remove
/// routines) so canonical entry and snapshots change in the same step.
pub struct ConversationsStore {
    conversations: HashMap<String, Conversation>,
    folders: Vec<Folder>,
    selected_conversation_id: Option<String>,
    thinking_conversation_id: Option<String>,
}

impl ConversationsStore {
    pub fn new() -> Self {
        Self {
            conversations: HashMap::new(),
            folders: Vec::new(),
            selected_conversation_id: None,
            thinking_conversation_id: None,
        }
    }

    /// Replace the whole conversation list with a fresh server listing.
    /// The most recently updated conversation becomes the selection.
    pub fn replace_conversations(&mut self, conversations: Vec<Conversation>) {
        self.conversations = conversations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();

        self.selected_conversation_id = self.list_all().first().map(|c| c.id.clone());

        if let Some(thinking) = &self.thinking_conversation_id
            && !self.conversations.contains_key(thinking)
        {
            self.thinking_conversation_id = None;
        }

        self.sync_folder_snapshots();
    }

    /// Replace the folder list with a fresh server listing. Snapshots are
    /// rebuilt from the canonical conversations; references to conversations
    /// that no longer exist are dropped.
    pub fn replace_folders(&mut self, folders: Vec<Folder>) {
        self.folders = folders;
        self.sync_folder_snapshots();
    }

    fn sync_folder_snapshots(&mut self) {
        let conversations = &self.conversations;
        for folder in &mut self.folders {
            folder.conversations = folder
                .conversations
                .iter()
                .filter_map(|snapshot| conversations.get(&snapshot.id).cloned())
                .collect();
        }
    }

    /// Add a conversation to the store
    pub fn add_conversation(&mut self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn get_conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.conversations.contains_key(id)
    }

    /// Apply a mutation to the canonical conversation and to every folder
    /// snapshot that shares its id. Returns false if the conversation is unknown.
    pub fn apply_to_conversation<F>(&mut self, id: &str, mutate: F) -> bool
    where
        F: Fn(&mut Conversation),
    {
        let Some(canonical) = self.conversations.get_mut(id) else {
            return false;
        };
        mutate(canonical);

        for folder in &mut self.folders {
            for snapshot in folder.conversations.iter_mut().filter(|c| c.id == id) {
                mutate(snapshot);
            }
        }

        true
    }

    /// Install the authoritative version of a conversation, replacing the
    /// canonical entry and every folder snapshot with the same id.
    pub fn replace_conversation(&mut self, conversation: Conversation) {
        for folder in &mut self.folders {
            for snapshot in folder
                .conversations
                .iter_mut()
                .filter(|c| c.id == conversation.id)
            {
                *snapshot = conversation.clone();
            }
        }

        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Remove a conversation and every folder reference to it
    pub fn remove_conversation(&mut self, id: &str) -> Option<Conversation> {
        let removed = self.conversations.remove(id);

        for folder in &mut self.folders {
            folder.conversations.retain(|c| c.id != id);
        }

        if self.selected_conversation_id.as_deref() == Some(id) {
            self.selected_conversation_id = None;
        }
        if self.thinking_conversation_id.as_deref() == Some(id) {
            self.thinking_conversation_id = None;
        }

        removed
    }

    /// Flip the pinned flag. Returns the new state.
    pub fn toggle_pin(&mut self, id: &str) -> Option<bool> {
        let current = self.conversations.get(id)?.pinned;
        self.set_pinned(id, !current);
        Some(!current)
    }

    pub fn set_pinned(&mut self, id: &str, pinned: bool) -> bool {
        self.apply_to_conversation(id, |c| c.pinned = pinned)
    }

    /// Append a message to a conversation (and its folder snapshots)
    pub fn append_message(&mut self, conversation_id: &str, message: Message) -> bool {
        self.apply_to_conversation(conversation_id, |c| c.push_message(message.clone()))
    }

    /// Insert an empty assistant placeholder for an in-flight stream.
    ///
    /// The placeholder id is derived from `now` and bumped until it is unique
    /// within the conversation.
    pub fn begin_streaming_message(
        &mut self,
        conversation_id: &str,
        now: DateTime<Utc>,
    ) -> Option<MessageId> {
        let conversation = self.conversations.get(conversation_id)?;

        let mut timestamp = now.timestamp_millis();
        while conversation
            .messages
            .iter()
            .any(|m| m.id == MessageId::Streaming(timestamp))
        {
            timestamp += 1;
        }

        let placeholder = Message::streaming_assistant(timestamp, now);
        let id = placeholder.id.clone();
        self.apply_to_conversation(conversation_id, |c| c.messages.push(placeholder.clone()));
        Some(id)
    }

    pub fn update_streaming_message(
        &mut self,
        conversation_id: &str,
        message_id: &MessageId,
        content: &str,
    ) -> bool {
        let Some(conversation) = self.conversations.get(conversation_id) else {
            return false;
        };
        if conversation.find_message(message_id).is_none() {
            return false;
        }

        self.apply_to_conversation(conversation_id, |c| {
            c.set_message_content(message_id, content);
        })
    }

    /// Swap a placeholder for the message the server stored in its place
    pub fn resolve_streaming_message(
        &mut self,
        conversation_id: &str,
        placeholder: &MessageId,
        durable: Message,
    ) -> bool {
        let Some(conversation) = self.conversations.get(conversation_id) else {
            return false;
        };
        if conversation.find_message(placeholder).is_none() {
            return false;
        }

        self.apply_to_conversation(conversation_id, |c| {
            if let Some(slot) = c.messages.iter_mut().find(|m| &m.id == placeholder) {
                *slot = durable.clone();
            }
            c.updated_at = c.updated_at.max(durable.created_at);
        })
    }

    pub fn discard_streaming_message(
        &mut self,
        conversation_id: &str,
        message_id: &MessageId,
    ) -> bool {
        let Some(conversation) = self.conversations.get(conversation_id) else {
            return false;
        };
        if conversation.find_message(message_id).is_none() {
            return false;
        }

        self.apply_to_conversation(conversation_id, |c| {
            c.remove_message(message_id);
        })
    }

    /// Conversations with the pinned flag set, most recent first
    pub fn pinned(&self) -> Vec<&Conversation> {
        self.list_all().into_iter().filter(|c| c.pinned).collect()
    }

    /// Unpinned conversations, most recent first
    pub fn recent(&self) -> Vec<&Conversation> {
        self.list_all().into_iter().filter(|c| !c.pinned).collect()
    }

    /// The N most recent unpinned conversations
    pub fn list_recent(&self, limit: usize) -> Vec<&Conversation> {
        let mut convs = self.recent();
        convs.truncate(limit);
        convs
    }

    /// List all conversations (sorted by updated_at descending)
    pub fn list_all(&self) -> Vec<&Conversation> {
        let mut convs: Vec<&Conversation> = self.conversations.values().collect();
        convs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        convs
    }

    /// Case-insensitive match on title or preview
    pub fn search(&self, query: &str) -> Vec<&Conversation> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return self.list_all();
        }

        self.list_all()
            .into_iter()
            .filter(|c| {
                c.title.to_lowercase().contains(&query)
                    || c.preview().to_lowercase().contains(&query)
            })
            .collect()
    }

    /// Get count of conversations
    pub fn count(&self) -> usize {
        self.conversations.len()
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    pub fn get_folder(&self, id: &str) -> Option<&Folder> {
        self.folders.iter().find(|f| f.id == id)
    }

    /// Whether a folder other than `except_id` already uses `name`
    pub fn has_folder_named(&self, name: &str, except_id: Option<&str>) -> bool {
        self.folders
            .iter()
            .any(|f| Some(f.id.as_str()) != except_id && f.has_name(name))
    }

    pub fn add_folder(&mut self, folder: Folder) {
        self.folders.push(folder);
    }

    /// Rename a folder, returning its previous name
    pub fn rename_folder(&mut self, id: &str, name: &str) -> Option<String> {
        let folder = self.folders.iter_mut().find(|f| f.id == id)?;
        Some(std::mem::replace(&mut folder.name, name.to_string()))
    }

    pub fn remove_folder(&mut self, id: &str) -> Option<Folder> {
        let index = self.folders.iter().position(|f| f.id == id)?;
        Some(self.folders.remove(index))
    }

    /// Set the selected conversation
    pub fn select(&mut self, id: &str) -> bool {
        if self.conversations.contains_key(id) {
            self.selected_conversation_id = Some(id.to_string());
            true
        } else {
            false
        }
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected_conversation_id.as_deref()
    }

    pub fn selected_conversation(&self) -> Option<&Conversation> {
        self.selected_conversation_id
            .as_deref()
            .and_then(|id| self.conversations.get(id))
    }

    /// Show the thinking indicator on one conversation
    pub fn set_thinking(&mut self, conversation_id: &str) {
        self.thinking_conversation_id = Some(conversation_id.to_string());
    }

    /// Clear the thinking indicator if it belongs to `conversation_id`
    pub fn clear_thinking(&mut self, conversation_id: &str) {
        if self.thinking_conversation_id.as_deref() == Some(conversation_id) {
            self.thinking_conversation_id = None;
        }
    }

    pub fn thinking_id(&self) -> Option<&str> {
        self.thinking_conversation_id.as_deref()
    }

    pub fn is_thinking(&self, conversation_id: &str) -> bool {
        self.thinking_conversation_id.as_deref() == Some(conversation_id)
    }
}

impl Default for ConversationsStore {
    fn default() -> Self {
        Self::new()
    }
}
