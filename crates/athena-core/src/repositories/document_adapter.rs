//! Mapping between server documents and client models.
//!
//! The document store names its primary key `_id`; the client uses `id`. All
//! reshaping of server responses happens here.

use chrono::{DateTime, Utc};

use super::chat_api::{ConversationDocument, FolderDocument, MessageDocument};
use super::error::{ApiError, ApiResult};
use crate::models::{ContentFormat, Conversation, Folder, Message, MessageId, Role};

/// Stored assistant content is already sanitized HTML; user content is raw text
fn format_for(role: Role) -> ContentFormat {
    match role {
        Role::User => ContentFormat::Text,
        Role::Assistant => ContentFormat::Html,
    }
}

pub fn message_from_document(
    doc: MessageDocument,
    fallback_time: DateTime<Utc>,
) -> ApiResult<Message> {
    if doc.id.is_empty() {
        return Err(ApiError::invalid("message document without _id"));
    }

    Ok(Message {
        id: MessageId::Durable(doc.id),
        role: doc.role,
        format: format_for(doc.role),
        content: doc.content,
        created_at: doc.created_at.unwrap_or(fallback_time),
    })
}

pub fn conversation_from_document(doc: ConversationDocument) -> ApiResult<Conversation> {
    if doc.id.is_empty() {
        return Err(ApiError::invalid("conversation document without _id"));
    }

    let base_time = doc
        .created_at
        .or(doc.updated_at)
        .unwrap_or_else(Utc::now);

    let messages = doc
        .messages
        .into_iter()
        .map(|m| message_from_document(m, base_time))
        .collect::<ApiResult<Vec<_>>>()?;

    let latest_message = messages.iter().map(|m| m.created_at).max();
    let updated_at = match (doc.updated_at, latest_message) {
        (Some(stored), Some(latest)) => stored.max(latest),
        (Some(stored), None) => stored,
        (None, Some(latest)) => latest,
        (None, None) => base_time,
    };

    Ok(Conversation {
        id: doc.id,
        title: doc.title,
        updated_at,
        pinned: doc.pinned,
        messages,
    })
}

pub fn folder_from_document(doc: FolderDocument) -> ApiResult<Folder> {
    if doc.id.is_empty() {
        return Err(ApiError::invalid("folder document without _id"));
    }

    let conversations = doc
        .conversations
        .into_iter()
        .map(conversation_from_document)
        .collect::<ApiResult<Vec<_>>>()?;

    Ok(Folder {
        id: doc.id,
        name: doc.name,
        conversations,
    })
}

/// Document form of a conversation, used when embedding it into a new folder.
/// Placeholder messages are never sent to the server.
pub fn conversation_to_document(conversation: &Conversation) -> ConversationDocument {
    ConversationDocument {
        id: conversation.id.clone(),
        title: conversation.title.clone(),
        pinned: conversation.pinned,
        messages: conversation
            .messages
            .iter()
            .filter(|m| !m.id.is_placeholder())
            .map(|m| MessageDocument {
                id: m.id.to_string(),
                role: m.role,
                content: m.content.clone(),
                created_at: Some(m.created_at),
            })
            .collect(),
        created_at: None,
        updated_at: Some(conversation.updated_at),
        message_count: None,
        preview: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message_doc(id: &str, role: Role, content: &str) -> MessageDocument {
        MessageDocument {
            id: id.to_string(),
            role,
            content: content.to_string(),
            created_at: Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap()),
        }
    }

    fn conversation_doc(id: &str) -> ConversationDocument {
        ConversationDocument {
            id: id.to_string(),
            title: "New chat 1".to_string(),
            pinned: false,
            messages: vec![
                message_doc("m1", Role::User, "Hello"),
                message_doc("m2", Role::Assistant, "<p>Hi there</p>\n"),
            ],
            created_at: None,
            updated_at: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
            message_count: Some(99),
            preview: Some("stale".to_string()),
        }
    }

    #[test]
    fn test_remaps_id_and_derives_counts() {
        let conv = conversation_from_document(conversation_doc("c1")).unwrap();
        assert_eq!(conv.id, "c1");
        assert_eq!(conv.message_count(), 2);
        assert_eq!(conv.preview(), "Hi there");
        assert_eq!(conv.messages[0].format, ContentFormat::Text);
        assert_eq!(conv.messages[1].format, ContentFormat::Html);
        assert_eq!(conv.messages[1].id, MessageId::Durable("m2".into()));
        // Stored timestamp older than the newest message is corrected
        assert_eq!(conv.updated_at, Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());
    }

    #[test]
    fn test_missing_ids_are_rejected() {
        assert!(matches!(
            conversation_from_document(conversation_doc("")),
            Err(ApiError::InvalidData { .. })
        ));

        let mut doc = conversation_doc("c1");
        doc.messages[0].id.clear();
        assert!(conversation_from_document(doc).is_err());
    }

    #[test]
    fn test_folder_snapshots_are_converted() {
        let folder = folder_from_document(FolderDocument {
            id: "f1".to_string(),
            name: "Work".to_string(),
            conversations: vec![conversation_doc("c1")],
        })
        .unwrap();
        assert!(folder.contains("c1"));
    }

    #[test]
    fn test_to_document_skips_placeholders() {
        let mut conv = conversation_from_document(conversation_doc("c1")).unwrap();
        conv.messages
            .push(Message::streaming_assistant(1, Utc::now()));

        let doc = conversation_to_document(&conv);
        assert_eq!(doc.id, "c1");
        assert_eq!(doc.messages.len(), 2);
        assert_eq!(doc.messages[1].id, "m2");
    }
}
