use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::markdown_renderer::strip_tags;

/// Preview length used by the sidebar when no explicit limit is given.
pub const DEFAULT_PREVIEW_CHARS: usize = 80;

/// Preview shown for a conversation that has no messages yet.
pub const EMPTY_PREVIEW: &str = "No messages yet";

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a message.
///
/// Only `Durable` identifiers come from the backing store. `Streaming` marks the
/// assistant message being assembled from an in-flight reply stream and
/// `Pending` marks a user message appended optimistically before the server
/// confirmed it. Both placeholder kinds disappear once the authoritative
/// conversation document replaces the local copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Durable(String),
    Streaming(i64),
    Pending(Uuid),
}

impl MessageId {
    pub fn is_placeholder(&self) -> bool {
        !matches!(self, MessageId::Durable(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Durable(id) => f.write_str(id),
            MessageId::Streaming(ts) => write!(f, "streaming-{}", ts),
            MessageId::Pending(uuid) => write!(f, "pending-{}", uuid),
        }
    }
}

/// Whether `content` is raw text typed by the user or sanitized HTML
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Text,
    Html,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub format: ContentFormat,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Optimistic user message, shown before the server confirms it
    pub fn pending_user(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::Pending(Uuid::new_v4()),
            role: Role::User,
            content: content.into(),
            format: ContentFormat::Text,
            created_at: Utc::now(),
        }
    }

    /// Empty assistant message that receives rendered stream output
    pub fn streaming_assistant(timestamp_millis: i64, created_at: DateTime<Utc>) -> Self {
        Self {
            id: MessageId::Streaming(timestamp_millis),
            role: Role::Assistant,
            content: String::new(),
            format: ContentFormat::Html,
            created_at,
        }
    }

    /// Plain-text view of the content (HTML tags stripped)
    pub fn plain_text(&self) -> String {
        match self.format {
            ContentFormat::Text => self.content.clone(),
            ContentFormat::Html => strip_tags(&self.content),
        }
    }
}

/// A conversation as held by the client.
///
/// `message_count` and `preview` are computed from `messages` on demand so they
/// can never drift from the message list.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            updated_at: Utc::now(),
            pinned: false,
            messages: Vec::new(),
        }
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn preview(&self) -> String {
        self.preview_with_limit(DEFAULT_PREVIEW_CHARS)
    }

    /// Preview derived from the latest message, truncated to `max_chars`
    pub fn preview_with_limit(&self, max_chars: usize) -> String {
        let Some(latest) = self.messages.last() else {
            return EMPTY_PREVIEW.to_string();
        };

        let text = latest.plain_text();
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.chars().take(max_chars).collect()
    }

    pub fn find_message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    /// Look up a message by its displayed identifier
    pub fn find_message_by_key(&self, key: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id.to_string() == key)
    }

    pub fn has_placeholder(&self) -> bool {
        self.messages.iter().any(|m| m.id.is_placeholder())
    }

    /// Append a message and bump the update timestamp
    pub fn push_message(&mut self, message: Message) {
        self.updated_at = message.created_at.max(self.updated_at);
        self.messages.push(message);
    }

    /// Set the content of a message in place. Returns false if the id is unknown.
    pub fn set_message_content(&mut self, id: &MessageId, content: &str) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.content = content.to_string();
                true
            }
            None => false,
        }
    }

    pub fn remove_message(&mut self, id: &MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|m| &m.id != id);
        self.messages.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn durable(id: &str, role: Role, content: &str, format: ContentFormat) -> Message {
        Message {
            id: MessageId::Durable(id.to_string()),
            role,
            content: content.to_string(),
            format,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_conversation_preview() {
        let conv = Conversation::new("c1", "New chat 1");
        assert_eq!(conv.message_count(), 0);
        assert_eq!(conv.preview(), EMPTY_PREVIEW);
    }

    #[test]
    fn test_preview_tracks_latest_message() {
        let mut conv = Conversation::new("c1", "Chat");
        conv.push_message(durable("m1", Role::User, "Hello", ContentFormat::Text));
        conv.push_message(durable(
            "m2",
            Role::Assistant,
            "<p>Hi <strong>there</strong></p>\n",
            ContentFormat::Html,
        ));

        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.preview(), "Hi there");
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        let mut conv = Conversation::new("c1", "Chat");
        conv.push_message(durable("m1", Role::User, &"é".repeat(100), ContentFormat::Text));
        assert_eq!(conv.preview_with_limit(10).chars().count(), 10);
    }

    #[test]
    fn test_message_id_display() {
        assert_eq!(MessageId::Durable("abc".into()).to_string(), "abc");
        assert_eq!(MessageId::Streaming(1700).to_string(), "streaming-1700");
        assert!(MessageId::Streaming(1).is_placeholder());
        assert!(!MessageId::Durable("x".into()).is_placeholder());
    }

    #[test]
    fn test_set_and_remove_message() {
        let mut conv = Conversation::new("c1", "Chat");
        let placeholder = Message::streaming_assistant(42, Utc::now());
        let id = placeholder.id.clone();
        conv.push_message(placeholder);

        assert!(conv.set_message_content(&id, "<p>partial</p>"));
        assert_eq!(conv.find_message(&id).map(|m| m.content.as_str()), Some("<p>partial</p>"));
        assert!(conv.has_placeholder());

        assert!(conv.remove_message(&id));
        assert!(!conv.has_placeholder());
        assert!(!conv.remove_message(&id));
    }
}
