use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::error::{ChatError, ChatResult};
use crate::models::{
    ChatEvent, Conversation, ConversationsStore, Message, MessageId, Role, SendPhase,
    StreamManager, StreamStatus, StreamTicket, TemplateStore, UserIdentity,
};
use crate::repositories::{
    ApiError, ChatApi, ConversationDocument, conversation_from_document, conversation_to_document,
    folder_from_document,
};
use crate::services::{
    DEFAULT_RENDER_BATCH_SIZE, EventStream, ReplySource, StreamError, StreamEvent,
    TokenAccumulator, read_events, render_markdown_html,
};
use crate::settings::{AthenaSettings, IncompleteStreamPolicy};

/// Tunables for the send-message pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatOptions {
    pub render_batch_size: usize,
    pub incomplete_stream_policy: IncompleteStreamPolicy,
    /// Abandon a reply after this long without data
    pub stream_idle_timeout: Option<Duration>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            render_batch_size: DEFAULT_RENDER_BATCH_SIZE,
            incomplete_stream_policy: IncompleteStreamPolicy::Discard,
            stream_idle_timeout: None,
        }
    }
}

impl From<&AthenaSettings> for ChatOptions {
    fn from(settings: &AthenaSettings) -> Self {
        Self {
            render_batch_size: settings.render_batch_size,
            incomplete_stream_policy: settings.incomplete_stream_policy,
            stream_idle_timeout: settings.stream_idle_timeout(),
        }
    }
}

/// Why a reply stream ended before its terminal marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncompleteReason {
    /// The server closed the body
    Closed,
    /// The connection failed mid-stream
    Transport(String),
    /// No data arrived within the idle timeout
    TimedOut,
    /// Paused by the user, or the conversation went away
    Cancelled,
}

impl fmt::Display for IncompleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "stream closed before completion"),
            Self::Transport(msg) => write!(f, "stream interrupted: {}", msg),
            Self::TimedOut => write!(f, "stream timed out"),
            Self::Cancelled => write!(f, "stream cancelled"),
        }
    }
}

/// How a send-message interaction ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The full reply was persisted
    Completed { message_id: String },
    /// A partial reply was persisted
    Truncated {
        message_id: String,
        reason: IncompleteReason,
    },
    /// The partial reply was dropped
    Discarded { reason: IncompleteReason },
    /// The stream completed without any text
    EmptyReply,
}

enum StreamEnd {
    Done,
    Incomplete(IncompleteReason),
}

enum NextEvent {
    Item(Option<Result<StreamEvent, StreamError>>),
    TimedOut,
}

async fn next_event(events: &mut EventStream, idle: Option<Duration>) -> NextEvent {
    match idle {
        Some(limit) => match tokio::time::timeout(limit, events.next()).await {
            Ok(item) => NextEvent::Item(item),
            Err(_) => NextEvent::TimedOut,
        },
        None => NextEvent::Item(events.next().await),
    }
}

/// Coordinates the conversation store, the CRUD API and the reply stream.
///
/// Cheap to clone; clones share state. Store and stream locks are only held
/// for synchronous read-modify-write steps, never across an `.await`.
#[derive(Clone)]
pub struct ChatController {
    api: Arc<dyn ChatApi>,
    replies: Arc<dyn ReplySource>,
    store: Arc<Mutex<ConversationsStore>>,
    streams: Arc<Mutex<StreamManager>>,
    user: UserIdentity,
    options: ChatOptions,
}

impl ChatController {
    pub fn new(
        api: Arc<dyn ChatApi>,
        replies: Arc<dyn ReplySource>,
        user: UserIdentity,
        options: ChatOptions,
    ) -> Self {
        Self {
            api,
            replies,
            store: Arc::new(Mutex::new(ConversationsStore::new())),
            streams: Arc::new(Mutex::new(StreamManager::new())),
            user,
            options,
        }
    }

    pub fn user(&self) -> &UserIdentity {
        &self.user
    }

    /// Read from the store under its lock
    pub fn read<R>(&self, f: impl FnOnce(&ConversationsStore) -> R) -> R {
        f(&self.store.lock())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.streams.lock().subscribe()
    }

    pub fn phase(&self, conversation_id: &str) -> SendPhase {
        self.streams.lock().phase(conversation_id)
    }

    pub fn is_streaming(&self, conversation_id: &str) -> bool {
        self.streams.lock().is_streaming(conversation_id)
    }

    /// Cancel every in-flight reply
    pub fn shutdown(&self) {
        self.streams.lock().stop_all();
    }

    fn emit(&self, event: ChatEvent) {
        self.streams.lock().emit(event);
    }

    /// Log a failed operation and tell subscribers, handing the error back
    fn report(&self, operation: &'static str, error: impl Into<ChatError>) -> ChatError {
        let error = error.into();
        warn!(operation, error = %error, "Operation failed");
        self.emit(ChatEvent::OperationFailed {
            operation,
            error: error.to_string(),
        });
        error
    }

    /// Install a server document as the authoritative copy of a conversation
    /// that is still present locally
    fn install_document(&self, doc: ConversationDocument) -> ChatResult<Conversation> {
        let conversation = conversation_from_document(doc)?;
        let mut store = self.store.lock();
        if !store.contains(&conversation.id) {
            return Err(ChatError::UnknownConversation(conversation.id));
        }
        store.replace_conversation(conversation.clone());
        Ok(conversation)
    }

    pub async fn sync_user(&self) -> ChatResult<()> {
        self.api
            .sync_user()
            .await
            .map_err(|e| self.report("sync_user", e))?;
        debug!(user_id = %self.user.id, "User synced");
        Ok(())
    }

    /// Reload conversations and folders from the server
    pub async fn refresh(&self) -> ChatResult<()> {
        let user_id = self.user.id.as_str();
        let (conversations, folders) = futures::try_join!(
            self.api.list_conversations(user_id),
            self.api.list_folders(user_id)
        )
        .map_err(|e| self.report("refresh", e))?;

        let conversations: Vec<Conversation> = conversations
            .into_iter()
            .filter_map(|doc| {
                conversation_from_document(doc)
                    .map_err(|e| warn!(error = %e, "Skipping invalid conversation document"))
                    .ok()
            })
            .collect();
        let folders = folders
            .into_iter()
            .filter_map(|doc| {
                folder_from_document(doc)
                    .map_err(|e| warn!(error = %e, "Skipping invalid folder document"))
                    .ok()
            })
            .collect();

        info!(count = conversations.len(), "Loaded conversations");
        {
            let mut store = self.store.lock();
            store.replace_conversations(conversations);
            store.replace_folders(folders);
        }
        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::FoldersChanged);
        Ok(())
    }

    /// Create an empty conversation and select it
    pub async fn create_conversation(&self) -> ChatResult<String> {
        let title = format!("New chat {}", self.store.lock().count() + 1);

        let doc = self
            .api
            .create_conversation(&self.user.id, &title)
            .await
            .map_err(|e| self.report("create_conversation", e))?;
        let conversation =
            conversation_from_document(doc).map_err(|e| self.report("create_conversation", e))?;

        let id = conversation.id.clone();
        {
            let mut store = self.store.lock();
            store.add_conversation(conversation);
            store.select(&id);
        }
        self.emit(ChatEvent::ConversationsChanged);
        info!(conv_id = %id, title = %title, "Created conversation");
        Ok(id)
    }

    pub fn select_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        if !self.store.lock().select(conversation_id) {
            return Err(ChatError::UnknownConversation(conversation_id.to_string()));
        }
        self.emit(ChatEvent::ConversationsChanged);
        Ok(())
    }

    pub async fn send_to_selected(&self, content: &str) -> ChatResult<SendOutcome> {
        let conversation_id = self
            .store
            .lock()
            .selected_id()
            .map(str::to_string)
            .ok_or(ChatError::NoSelection)?;
        self.send_message(&conversation_id, content).await
    }

    /// Send a template's body to the selected conversation
    pub async fn send_template(
        &self,
        templates: &TemplateStore,
        template_id: &str,
    ) -> ChatResult<SendOutcome> {
        let content = templates
            .get(template_id)
            .map(|t| t.content.clone())
            .ok_or_else(|| ChatError::UnknownTemplate(template_id.to_string()))?;
        self.send_to_selected(&content).await
    }

    /// Submit an earlier message's content again as a new send
    pub async fn resend_message(
        &self,
        conversation_id: &str,
        message_key: &str,
    ) -> ChatResult<SendOutcome> {
        let content = {
            let store = self.store.lock();
            let conversation = store
                .get_conversation(conversation_id)
                .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;
            conversation
                .find_message_by_key(message_key)
                .ok_or_else(|| ChatError::UnknownMessage(message_key.to_string()))?
                .plain_text()
        };

        info!(conv_id = %conversation_id, message_id = %message_key, "Resending message");
        self.send_message(conversation_id, &content).await
    }

    /// Send a user message and stream the assistant reply into the conversation.
    ///
    /// Validation failures return before anything changes. Once the interaction
    /// is registered, every failure leaves the conversation without a
    /// placeholder and the thinking indicator cleared.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        content: &str,
    ) -> ChatResult<SendOutcome> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if !self.store.lock().contains(conversation_id) {
            return Err(ChatError::UnknownConversation(conversation_id.to_string()));
        }

        let ticket = {
            let mut streams = self.streams.lock();
            if streams.phase(conversation_id).is_busy() {
                return Err(ChatError::SendInFlight(conversation_id.to_string()));
            }
            let ticket = streams.register(conversation_id);
            streams.set_phase(&ticket, SendPhase::UserMessageSubmitting);
            ticket
        };

        info!(conv_id = %conversation_id, "Sending message");
        let result = self.run_send(&ticket, content).await;
        if let Err(e) = &result {
            self.fail(&ticket, e);
        }
        result
    }

    async fn run_send(&self, ticket: &StreamTicket, content: &str) -> ChatResult<SendOutcome> {
        let conv_id = ticket.conversation_id.as_str();

        self.store
            .lock()
            .append_message(conv_id, Message::pending_user(content));
        self.emit(ChatEvent::ConversationsChanged);

        // A failed append is not rolled back; the optimistic copy stays until the next refresh
        let doc = self.api.post_message(conv_id, Role::User, content).await?;
        self.install_document(doc)?;
        self.set_phase(ticket, SendPhase::UserMessagePersisted);
        self.emit(ChatEvent::ConversationsChanged);

        if ticket.is_cancelled() {
            self.finish(ticket, SendPhase::Idle, StreamStatus::Cancelled);
            return Ok(SendOutcome::Discarded {
                reason: IncompleteReason::Cancelled,
            });
        }

        self.store.lock().set_thinking(conv_id);
        let opened = tokio::select! {
            biased;
            _ = ticket.cancel_token().cancelled() => None,
            opened = self.replies.open(conv_id, content) => Some(opened),
        };
        let bytes = match opened {
            Some(opened) => opened?,
            None => {
                self.clear_thinking(ticket);
                self.finish(ticket, SendPhase::Idle, StreamStatus::Cancelled);
                return Ok(SendOutcome::Discarded {
                    reason: IncompleteReason::Cancelled,
                });
            }
        };

        let placeholder = self
            .store
            .lock()
            .begin_streaming_message(conv_id, Utc::now())
            .ok_or_else(|| ChatError::UnknownConversation(conv_id.to_string()))?;
        self.set_phase(ticket, SendPhase::AssistantStreaming);
        self.emit(ChatEvent::StreamStarted {
            conversation_id: conv_id.to_string(),
            message_id: placeholder.to_string(),
        });
        debug!(conv_id = %conv_id, message_id = %placeholder, "Reply stream started");

        let mut events = read_events(bytes);
        let mut accumulator = TokenAccumulator::new(self.options.render_batch_size);
        let idle = self.options.stream_idle_timeout;

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = ticket.cancel_token().cancelled() => None,
                next = next_event(&mut events, idle) => Some(next),
            };
            let Some(next) = next else {
                break StreamEnd::Incomplete(IncompleteReason::Cancelled);
            };

            match next {
                NextEvent::TimedOut => break StreamEnd::Incomplete(IncompleteReason::TimedOut),
                NextEvent::Item(None) => break StreamEnd::Incomplete(IncompleteReason::Closed),
                NextEvent::Item(Some(Err(e))) => {
                    break StreamEnd::Incomplete(IncompleteReason::Transport(e.to_string()));
                }
                NextEvent::Item(Some(Ok(StreamEvent::Done))) => break StreamEnd::Done,
                NextEvent::Item(Some(Ok(StreamEvent::Malformed(payload)))) => {
                    warn!(conv_id = %conv_id, payload = %payload, "Skipping malformed stream payload");
                }
                NextEvent::Item(Some(Ok(StreamEvent::Delta(fragment)))) => {
                    if let Some(tick) = accumulator.push(&fragment) {
                        self.render(conv_id, &placeholder, tick.text, tick.html);
                    }
                }
            }
        };

        match end {
            StreamEnd::Done => self.finalize(ticket, &placeholder, accumulator).await,
            StreamEnd::Incomplete(reason) => {
                self.settle_incomplete(ticket, &placeholder, accumulator, reason)
                    .await
            }
        }
    }

    async fn finalize(
        &self,
        ticket: &StreamTicket,
        placeholder: &MessageId,
        mut accumulator: TokenAccumulator,
    ) -> ChatResult<SendOutcome> {
        let conv_id = ticket.conversation_id.as_str();
        self.set_phase(ticket, SendPhase::AssistantFinalizing);

        let reply = accumulator.finish()?;
        self.render(conv_id, placeholder, reply.text.clone(), reply.html.clone());

        if reply.text.trim().is_empty() {
            self.discard_placeholder(conv_id, placeholder);
            self.clear_thinking(ticket);
            self.finish(ticket, SendPhase::Idle, StreamStatus::Discarded);
            info!(conv_id = %conv_id, "Reply finished without text");
            return Ok(SendOutcome::EmptyReply);
        }

        let message_id = self.persist_reply(conv_id, placeholder, &reply.html).await?;
        self.clear_thinking(ticket);
        self.finish(ticket, SendPhase::Idle, StreamStatus::Completed);
        info!(
            conv_id = %conv_id,
            message_id = %message_id,
            fragments = reply.fragment_count,
            "Reply persisted"
        );
        Ok(SendOutcome::Completed { message_id })
    }

    async fn settle_incomplete(
        &self,
        ticket: &StreamTicket,
        placeholder: &MessageId,
        accumulator: TokenAccumulator,
        reason: IncompleteReason,
    ) -> ChatResult<SendOutcome> {
        let conv_id = ticket.conversation_id.as_str();
        let still_present = self.store.lock().contains(conv_id);

        let partial = match self.options.incomplete_stream_policy {
            IncompleteStreamPolicy::PersistTruncated if still_present => accumulator.into_partial(),
            _ => None,
        };

        if let Some(text) = partial {
            self.set_phase(ticket, SendPhase::AssistantFinalizing);
            let html = render_markdown_html(&text);
            self.render(conv_id, placeholder, text, html.clone());

            let message_id = self.persist_reply(conv_id, placeholder, &html).await?;
            self.clear_thinking(ticket);
            self.finish(ticket, SendPhase::Idle, StreamStatus::Truncated);
            warn!(conv_id = %conv_id, reason = %reason, "Persisted truncated reply");
            return Ok(SendOutcome::Truncated { message_id, reason });
        }

        self.discard_placeholder(conv_id, placeholder);
        self.clear_thinking(ticket);
        if reason == IncompleteReason::Cancelled {
            info!(conv_id = %conv_id, "Reply stream cancelled");
            self.finish(ticket, SendPhase::Idle, StreamStatus::Cancelled);
        } else {
            warn!(conv_id = %conv_id, reason = %reason, "Discarded incomplete reply");
            self.finish(
                ticket,
                SendPhase::Failed(reason.to_string()),
                StreamStatus::Discarded,
            );
        }
        Ok(SendOutcome::Discarded { reason })
    }

    /// Store the reply and reconcile the conversation with the server's copy
    async fn persist_reply(
        &self,
        conv_id: &str,
        placeholder: &MessageId,
        html: &str,
    ) -> ChatResult<String> {
        let saved = match self.api.post_message(conv_id, Role::Assistant, html).await {
            Ok(doc) => conversation_from_document(doc).map_err(ChatError::from),
            Err(e) => Err(ChatError::from(e)),
        };
        let conversation = match saved {
            Ok(conversation) => conversation,
            Err(e) => {
                self.discard_placeholder(conv_id, placeholder);
                return Err(e);
            }
        };

        let Some(durable) = conversation
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .cloned()
        else {
            self.discard_placeholder(conv_id, placeholder);
            return Err(ApiError::invalid("saved conversation has no assistant message").into());
        };

        let message_id = durable.id.to_string();
        {
            let mut store = self.store.lock();
            store.resolve_streaming_message(conv_id, placeholder, durable);
            if store.contains(conv_id) {
                store.replace_conversation(conversation);
            }
        }
        self.emit(ChatEvent::ConversationsChanged);
        Ok(message_id)
    }

    fn render(&self, conv_id: &str, placeholder: &MessageId, text: String, html: String) {
        self.store
            .lock()
            .update_streaming_message(conv_id, placeholder, &html);
        self.emit(ChatEvent::TextRendered {
            conversation_id: conv_id.to_string(),
            message_id: placeholder.to_string(),
            text,
            html,
        });
    }

    fn discard_placeholder(&self, conv_id: &str, placeholder: &MessageId) {
        if self
            .store
            .lock()
            .discard_streaming_message(conv_id, placeholder)
        {
            self.emit(ChatEvent::ConversationsChanged);
        }
    }

    fn set_phase(&self, ticket: &StreamTicket, phase: SendPhase) {
        self.streams.lock().set_phase(ticket, phase);
    }

    fn finish(&self, ticket: &StreamTicket, phase: SendPhase, status: StreamStatus) {
        self.streams.lock().finish(ticket, phase, status);
    }

    /// Clear the indicator unless a newer interaction now owns it
    fn clear_thinking(&self, ticket: &StreamTicket) {
        let current = self.streams.lock().is_current(ticket);
        if current {
            self.store.lock().clear_thinking(&ticket.conversation_id);
        }
    }

    fn fail(&self, ticket: &StreamTicket, error: &ChatError) {
        error!(conv_id = %ticket.conversation_id, error = %error, "Send failed");
        self.clear_thinking(ticket);

        let message = error.to_string();
        self.finish(
            ticket,
            SendPhase::Failed(message.clone()),
            StreamStatus::Error(message.clone()),
        );
        self.emit(ChatEvent::OperationFailed {
            operation: "send_message",
            error: message,
        });
    }

    /// Stop the reply being generated for a conversation and clear its indicator.
    /// Returns whether an interaction was running.
    pub fn pause(&self, conversation_id: &str) -> bool {
        let stopped = self.streams.lock().stop_stream(conversation_id);
        self.store.lock().clear_thinking(conversation_id);
        if stopped {
            info!(conv_id = %conversation_id, "Paused reply");
        }
        stopped
    }

    /// Flip the pinned flag, rolling back if the server rejects it
    pub async fn toggle_pin(&self, conversation_id: &str) -> ChatResult<bool> {
        let pinned = self
            .store
            .lock()
            .toggle_pin(conversation_id)
            .ok_or_else(|| ChatError::UnknownConversation(conversation_id.to_string()))?;
        self.emit(ChatEvent::ConversationsChanged);

        if let Err(e) = self.api.set_pinned(conversation_id, pinned).await {
            self.store.lock().set_pinned(conversation_id, !pinned);
            self.emit(ChatEvent::ConversationsChanged);
            return Err(self.report("toggle_pin", e));
        }

        debug!(conv_id = %conversation_id, pinned, "Pin updated");
        Ok(pinned)
    }

    /// Remove a conversation locally (including folder references), then on the server
    pub async fn delete_conversation(&self, conversation_id: &str) -> ChatResult<()> {
        if self
            .store
            .lock()
            .remove_conversation(conversation_id)
            .is_none()
        {
            return Err(ChatError::UnknownConversation(conversation_id.to_string()));
        }
        self.streams.lock().forget(conversation_id);
        self.emit(ChatEvent::ConversationsChanged);
        self.emit(ChatEvent::FoldersChanged);

        self.api
            .delete_conversation(conversation_id)
            .await
            .map_err(|e| self.report("delete_conversation", e))?;
        info!(conv_id = %conversation_id, "Deleted conversation");
        Ok(())
    }

    /// Create a folder holding snapshots of the given conversations
    pub async fn create_folder(
        &self,
        name: &str,
        conversation_ids: &[String],
    ) -> ChatResult<String> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ChatError::EmptyFolderName);
        }
        if conversation_ids.is_empty() {
            return Err(ChatError::EmptyFolder);
        }

        let documents = {
            let store = self.store.lock();
            if store.has_folder_named(name, None) {
                return Err(ChatError::DuplicateFolderName(name.to_string()));
            }
            conversation_ids
                .iter()
                .map(|id| {
                    store
                        .get_conversation(id)
                        .map(conversation_to_document)
                        .ok_or_else(|| ChatError::UnknownConversation(id.clone()))
                })
                .collect::<ChatResult<Vec<_>>>()?
        };

        let doc = self
            .api
            .create_folder(&self.user.id, name, documents)
            .await
            .map_err(|e| self.report("create_folder", e))?;
        let folder = folder_from_document(doc).map_err(|e| self.report("create_folder", e))?;

        let id = folder.id.clone();
        self.store.lock().add_folder(folder);
        self.emit(ChatEvent::FoldersChanged);
        info!(folder_id = %id, name = %name, "Created folder");
        Ok(id)
    }

    pub async fn rename_folder(&self, folder_id: &str, new_name: &str) -> ChatResult<()> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ChatError::EmptyFolderName);
        }

        let previous = {
            let mut store = self.store.lock();
            if store.get_folder(folder_id).is_none() {
                return Err(ChatError::UnknownFolder(folder_id.to_string()));
            }
            if store.has_folder_named(new_name, Some(folder_id)) {
                return Err(ChatError::DuplicateFolderName(new_name.to_string()));
            }
            store.rename_folder(folder_id, new_name)
        };
        self.emit(ChatEvent::FoldersChanged);

        if let Err(e) = self.api.rename_folder(folder_id, new_name).await {
            if let Some(previous) = previous {
                self.store.lock().rename_folder(folder_id, &previous);
                self.emit(ChatEvent::FoldersChanged);
            }
            return Err(self.report("rename_folder", e));
        }
        Ok(())
    }

    pub async fn delete_folder(&self, folder_id: &str) -> ChatResult<()> {
        if self.store.lock().remove_folder(folder_id).is_none() {
            return Err(ChatError::UnknownFolder(folder_id.to_string()));
        }
        self.emit(ChatEvent::FoldersChanged);

        self.api
            .delete_folder(folder_id)
            .await
            .map_err(|e| self.report("delete_folder", e))?;
        info!(folder_id = %folder_id, "Deleted folder");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ContentFormat;
    use crate::repositories::{ApiOperation, InMemoryChatApi};
    use crate::services::{ReplyScript, ScriptedReplySource};
    use bytes::Bytes;

    const USER: &str = "user_1";

    struct Harness {
        controller: ChatController,
        api: InMemoryChatApi,
        replies: Arc<ScriptedReplySource>,
    }

    fn harness_with(options: ChatOptions) -> Harness {
        let api = InMemoryChatApi::new();
        let replies = Arc::new(ScriptedReplySource::new());
        let controller = ChatController::new(
            Arc::new(api.clone()),
            replies.clone(),
            UserIdentity::new(USER),
            options,
        );
        Harness {
            controller,
            api,
            replies,
        }
    }

    fn harness() -> Harness {
        harness_with(ChatOptions::default())
    }

    fn conversation(h: &Harness, id: &str) -> Conversation {
        h.controller
            .read(|s| s.get_conversation(id).cloned())
            .expect("conversation should exist")
    }

    fn assert_mirrors_match(h: &Harness) {
        h.controller.read(|store| {
            for folder in store.folders() {
                for snapshot in &folder.conversations {
                    let canonical = store
                        .get_conversation(&snapshot.id)
                        .expect("folder references a deleted conversation");
                    assert_eq!(snapshot.pinned, canonical.pinned);
                    assert_eq!(snapshot.messages, canonical.messages);
                }
            }
        });
    }

    async fn wait_for_stream_start(rx: &mut broadcast::Receiver<ChatEvent>) {
        loop {
            match rx.recv().await {
                Ok(ChatEvent::StreamStarted { .. }) => return,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    }

    fn data_chunks(lines: &[&str]) -> Vec<Bytes> {
        lines
            .iter()
            .map(|l| Bytes::from(format!("data: {}\n\n", l)))
            .collect()
    }

    #[tokio::test]
    async fn test_hello_round_trip() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::fragments(&["Hi", " there"]));

        let outcome = h.controller.send_message(&conv_id, "Hello").await.unwrap();
        let message_id = match outcome {
            SendOutcome::Completed { message_id } => message_id,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.messages[0].role, Role::User);
        assert_eq!(conv.messages[0].content, "Hello");
        assert_eq!(conv.messages[0].format, ContentFormat::Text);
        assert_eq!(conv.messages[1].role, Role::Assistant);
        assert_eq!(conv.messages[1].id.to_string(), message_id);
        assert_eq!(conv.messages[1].content, render_markdown_html("Hi there").trim());
        assert_eq!(conv.preview(), "Hi there");
        assert!(!conv.has_placeholder());

        assert_eq!(h.replies.opened(), vec![(conv_id.clone(), "Hello".to_string())]);
        assert_eq!(h.api.conversation(&conv_id).unwrap().messages.len(), 2);
        assert_eq!(h.controller.phase(&conv_id), SendPhase::Idle);
        assert!(h.controller.read(|s| s.thinking_id().is_none()));
    }

    #[tokio::test]
    async fn test_phases_follow_the_send_state_machine() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::fragments(&["Hi"]));
        let mut rx = h.controller.subscribe();

        h.controller.send_message(&conv_id, "Hello").await.unwrap();

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::PhaseChanged { phase, .. } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![
                SendPhase::UserMessageSubmitting,
                SendPhase::UserMessagePersisted,
                SendPhase::AssistantStreaming,
                SendPhase::AssistantFinalizing,
                SendPhase::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_http_500_keeps_user_message_only() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::Status(500));

        let err = h.controller.send_message(&conv_id, "Hello").await.unwrap_err();
        assert!(matches!(
            err,
            ChatError::Stream(StreamError::Connection {
                status: Some(500),
                ..
            })
        ));

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.message_count(), 1);
        assert_eq!(conv.messages[0].role, Role::User);
        assert!(!conv.messages[0].id.is_placeholder());
        assert!(!h.controller.read(|s| s.is_thinking(&conv_id)));
        assert!(matches!(h.controller.phase(&conv_id), SendPhase::Failed(_)));
    }

    #[tokio::test]
    async fn test_malformed_fragment_is_skipped() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::Chunks(data_chunks(&[
            r#"{"delta":"Hi"}"#,
            "not-json",
            r#"{"delta":" there"}"#,
            "[DONE]",
        ])));

        let outcome = h.controller.send_message(&conv_id, "Hello").await.unwrap();
        assert!(matches!(outcome, SendOutcome::Completed { .. }));

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.messages[1].content, render_markdown_html("Hi there").trim());
    }

    #[tokio::test]
    async fn test_throttled_renders_then_one_final_render() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies
            .push(ReplyScript::fragments(&["a", "b", "c", "d", "e", "f"]));
        let mut rx = h.controller.subscribe();

        h.controller.send_message(&conv_id, "letters").await.unwrap();

        let mut rendered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ChatEvent::TextRendered { text, .. } = event {
                rendered.push(text);
            }
        }
        assert_eq!(rendered, vec!["abcde".to_string(), "abcdef".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        assert!(matches!(
            h.controller.send_message(&conv_id, "   ").await,
            Err(ChatError::EmptyMessage)
        ));
        assert!(matches!(
            h.controller.send_message("missing", "hi").await,
            Err(ChatError::UnknownConversation(_))
        ));
        assert_eq!(h.api.call_count(ApiOperation::PostMessage), 0);
    }

    #[tokio::test]
    async fn test_user_message_persist_failure_is_not_rolled_back() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.api.fail_next(ApiOperation::PostMessage);

        let err = h.controller.send_message(&conv_id, "Hello").await.unwrap_err();
        assert!(matches!(err, ChatError::Api(ApiError::Status { status: 500, .. })));

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.message_count(), 1);
        assert!(matches!(conv.messages[0].id, MessageId::Pending(_)));
        assert!(h.replies.opened().is_empty());
        assert!(matches!(h.controller.phase(&conv_id), SendPhase::Failed(_)));
    }

    #[tokio::test]
    async fn test_reply_persist_failure_drops_placeholder() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.api.fail_after(ApiOperation::PostMessage, 1);
        h.replies.push(ReplyScript::fragments(&["Hi"]));

        assert!(h.controller.send_message(&conv_id, "Hello").await.is_err());

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.message_count(), 1);
        assert!(!conv.has_placeholder());
        assert!(!h.controller.read(|s| s.is_thinking(&conv_id)));
    }

    #[tokio::test]
    async fn test_close_without_done_discards_by_default() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::Chunks(data_chunks(&[r#"{"delta":"Hi"}"#])));

        let outcome = h.controller.send_message(&conv_id, "Hello").await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Discarded {
                reason: IncompleteReason::Closed
            }
        );
        assert_eq!(conversation(&h, &conv_id).message_count(), 1);
        assert_eq!(h.api.conversation(&conv_id).unwrap().messages.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_persists_truncated_when_configured() {
        let h = harness_with(ChatOptions {
            incomplete_stream_policy: IncompleteStreamPolicy::PersistTruncated,
            ..Default::default()
        });
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::ChunksThenError(
            data_chunks(&[r#"{"delta":"Hi"}"#, r#"{"delta":" there"}"#]),
            "connection reset".to_string(),
        ));

        let outcome = h.controller.send_message(&conv_id, "Hello").await.unwrap();
        let reason = match outcome {
            SendOutcome::Truncated { reason, .. } => reason,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!(matches!(reason, IncompleteReason::Transport(_)));

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.messages[1].content, render_markdown_html("Hi there").trim());
        assert_eq!(h.controller.phase(&conv_id), SendPhase::Idle);
    }

    #[tokio::test]
    async fn test_pause_cancels_stream_and_clears_indicator() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies
            .push(ReplyScript::Pending(data_chunks(&[r#"{"delta":"Hi"}"#])));
        let mut rx = h.controller.subscribe();

        let controller = h.controller.clone();
        let id = conv_id.clone();
        let task = tokio::spawn(async move { controller.send_message(&id, "Hello").await });

        wait_for_stream_start(&mut rx).await;
        assert!(h.controller.read(|s| s.is_thinking(&conv_id)));
        assert!(matches!(
            h.controller.send_message(&conv_id, "again").await,
            Err(ChatError::SendInFlight(_))
        ));

        assert!(h.controller.pause(&conv_id));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Discarded {
                reason: IncompleteReason::Cancelled
            }
        );

        let conv = conversation(&h, &conv_id);
        assert!(!conv.has_placeholder());
        assert!(!h.controller.read(|s| s.is_thinking(&conv_id)));
        assert_eq!(h.controller.phase(&conv_id), SendPhase::Idle);
        assert!(!h.controller.pause(&conv_id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_abandons_silent_stream() {
        let h = harness_with(ChatOptions {
            stream_idle_timeout: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::Pending(Vec::new()));

        let outcome = h.controller.send_message(&conv_id, "Hello").await.unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Discarded {
                reason: IncompleteReason::TimedOut
            }
        );
        assert!(matches!(h.controller.phase(&conv_id), SendPhase::Failed(_)));
    }

    #[tokio::test]
    async fn test_resend_submits_same_content() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::fragments(&["Hi"]));
        h.replies.push(ReplyScript::fragments(&["Hello again"]));
        h.controller.send_message(&conv_id, "Hello").await.unwrap();

        let user_key = conversation(&h, &conv_id).messages[0].id.to_string();
        h.controller.resend_message(&conv_id, &user_key).await.unwrap();

        let queries: Vec<String> = h.replies.opened().into_iter().map(|(_, q)| q).collect();
        assert_eq!(queries, vec!["Hello", "Hello"]);
        assert_eq!(conversation(&h, &conv_id).message_count(), 4);

        assert!(matches!(
            h.controller.resend_message(&conv_id, "nope").await,
            Err(ChatError::UnknownMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_send_to_selected() {
        let h = harness();
        assert!(matches!(
            h.controller.send_to_selected("Hello").await,
            Err(ChatError::NoSelection)
        ));

        let conv_id = h.controller.create_conversation().await.unwrap();
        h.replies.push(ReplyScript::fragments(&["Hi"]));
        h.controller.send_to_selected("Hello").await.unwrap();
        assert_eq!(conversation(&h, &conv_id).message_count(), 2);
    }

    #[tokio::test]
    async fn test_send_template_uses_its_body() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        let mut templates = TemplateStore::new();
        let template_id = templates
            .create("Greeting", "Say hello in French", None)
            .id
            .clone();

        assert!(matches!(
            h.controller.send_template(&templates, "missing").await,
            Err(ChatError::UnknownTemplate(_))
        ));
        assert_eq!(conversation(&h, &conv_id).message_count(), 0);

        h.replies.push(ReplyScript::fragments(&["Bonjour"]));
        h.controller
            .send_template(&templates, &template_id)
            .await
            .unwrap();

        let conv = conversation(&h, &conv_id);
        assert_eq!(conv.messages[0].content, "Say hello in French");
        assert_eq!(conv.message_count(), 2);
    }

    #[tokio::test]
    async fn test_toggle_pin_twice_keeps_folders_in_sync() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.controller
            .create_folder("Work", &[conv_id.clone()])
            .await
            .unwrap();

        assert!(h.controller.toggle_pin(&conv_id).await.unwrap());
        assert_mirrors_match(&h);
        assert!(h.api.conversation(&conv_id).unwrap().pinned);

        assert!(!h.controller.toggle_pin(&conv_id).await.unwrap());
        assert_mirrors_match(&h);
        assert!(!conversation(&h, &conv_id).pinned);
        assert!(!h.api.conversation(&conv_id).unwrap().pinned);
    }

    #[tokio::test]
    async fn test_toggle_pin_rolls_back_on_failure() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.controller
            .create_folder("Work", &[conv_id.clone()])
            .await
            .unwrap();
        h.api.fail_next(ApiOperation::SetPinned);

        assert!(h.controller.toggle_pin(&conv_id).await.is_err());
        assert!(!conversation(&h, &conv_id).pinned);
        assert_mirrors_match(&h);
    }

    #[tokio::test]
    async fn test_message_appends_reach_folder_mirrors() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        h.controller
            .create_folder("Work", &[conv_id.clone()])
            .await
            .unwrap();
        h.replies.push(ReplyScript::fragments(&["Hi", " there"]));

        h.controller.send_message(&conv_id, "Hello").await.unwrap();
        assert_mirrors_match(&h);
    }

    #[tokio::test]
    async fn test_delete_conversation_cascades() {
        let h = harness();
        let keep = h.controller.create_conversation().await.unwrap();
        let doomed = h.controller.create_conversation().await.unwrap();
        let folder_id = h
            .controller
            .create_folder("Work", &[keep.clone(), doomed.clone()])
            .await
            .unwrap();

        h.controller.delete_conversation(&doomed).await.unwrap();

        h.controller.read(|s| {
            assert!(s.get_conversation(&doomed).is_none());
            let folder = s.get_folder(&folder_id).unwrap();
            assert!(!folder.contains(&doomed));
            assert!(folder.contains(&keep));
        });
        assert!(h.api.conversation(&doomed).is_none());
        assert_mirrors_match(&h);

        assert!(matches!(
            h.controller.delete_conversation(&doomed).await,
            Err(ChatError::UnknownConversation(_))
        ));
    }

    #[tokio::test]
    async fn test_folder_validation() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        let ids = vec![conv_id.clone()];

        assert!(matches!(
            h.controller.create_folder("  ", &ids).await,
            Err(ChatError::EmptyFolderName)
        ));
        assert!(matches!(
            h.controller.create_folder("Work", &[]).await,
            Err(ChatError::EmptyFolder)
        ));
        assert!(matches!(
            h.controller.create_folder("Work", &["missing".to_string()]).await,
            Err(ChatError::UnknownConversation(_))
        ));

        let folder_id = h.controller.create_folder("Work", &ids).await.unwrap();
        assert!(matches!(
            h.controller.create_folder("work", &ids).await,
            Err(ChatError::DuplicateFolderName(_))
        ));
        assert_eq!(h.api.call_count(ApiOperation::CreateFolder), 1);

        h.controller.delete_folder(&folder_id).await.unwrap();
        assert!(h.api.folder(&folder_id).is_none());
        assert!(matches!(
            h.controller.delete_folder(&folder_id).await,
            Err(ChatError::UnknownFolder(_))
        ));
    }

    #[tokio::test]
    async fn test_rename_folder_rolls_back_on_failure() {
        let h = harness();
        let conv_id = h.controller.create_conversation().await.unwrap();
        let folder_id = h
            .controller
            .create_folder("Work", &[conv_id])
            .await
            .unwrap();

        h.controller.rename_folder(&folder_id, "Clients").await.unwrap();
        assert_eq!(h.api.folder(&folder_id).unwrap().name, "Clients");

        h.api.fail_next(ApiOperation::RenameFolder);
        assert!(h.controller.rename_folder(&folder_id, "Archive").await.is_err());
        let name = h.controller.read(|s| s.get_folder(&folder_id).unwrap().name.clone());
        assert_eq!(name, "Clients");
    }

    #[tokio::test]
    async fn test_refresh_loads_server_state() {
        let h = harness();
        let first = h.api.create_conversation(USER, "First").await.unwrap();
        let second = h.api.create_conversation(USER, "Second").await.unwrap();
        h.api.create_conversation("someone_else", "Hidden").await.unwrap();
        h.api
            .create_folder(USER, "Work", vec![first.clone()])
            .await
            .unwrap();

        h.controller.refresh().await.unwrap();

        h.controller.read(|s| {
            assert_eq!(s.count(), 2);
            assert_eq!(s.selected_id(), Some(second.id.as_str()));
            assert_eq!(s.folders().len(), 1);
        });
    }

    #[tokio::test]
    async fn test_refresh_repairs_stale_and_dangling_folder_snapshots() {
        let h = harness();
        let stale = h.api.create_conversation(USER, "First").await.unwrap();
        h.api.set_pinned(&stale.id, true).await.unwrap();

        let mut dangling = stale.clone();
        dangling.id = "deleted-conv".to_string();
        let folder = h
            .api
            .create_folder(USER, "Work", vec![stale.clone(), dangling])
            .await
            .unwrap();

        h.controller.refresh().await.unwrap();

        assert_mirrors_match(&h);
        h.controller.read(|s| {
            let snapshots = &s.get_folder(&folder.id).unwrap().conversations;
            assert_eq!(snapshots.len(), 1);
            assert_eq!(snapshots[0].id, stale.id);
            assert!(snapshots[0].pinned);
        });
    }

    #[tokio::test]
    async fn test_failed_operation_is_reported_to_subscribers() {
        let h = harness();
        let mut rx = h.controller.subscribe();
        h.api.fail_next(ApiOperation::CreateConversation);

        assert!(h.controller.create_conversation().await.is_err());
        let reported = std::iter::from_fn(|| rx.try_recv().ok()).any(|e| {
            matches!(
                e,
                ChatEvent::OperationFailed {
                    operation: "create_conversation",
                    ..
                }
            )
        });
        assert!(reported);
        assert_eq!(h.controller.read(|s| s.count()), 0);
    }

    #[tokio::test]
    async fn test_new_chat_titles_count_up() {
        let h = harness();
        let a = h.controller.create_conversation().await.unwrap();
        let b = h.controller.create_conversation().await.unwrap();
        assert_eq!(conversation(&h, &a).title, "New chat 1");
        assert_eq!(conversation(&h, &b).title, "New chat 2");
        assert_eq!(h.controller.read(|s| s.selected_id().map(str::to_string)), Some(b));
    }
}
