use super::conversation::Conversation;

/// A named group of conversation snapshots.
///
/// The snapshots are a denormalized mirror of the canonical entries in
/// `ConversationsStore`; they are only ever changed through the store's
/// mirroring routines.
#[derive(Debug, Clone, PartialEq)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub conversations: Vec<Conversation>,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            conversations: Vec::new(),
        }
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.iter().any(|c| c.id == conversation_id)
    }

    /// Folder names are unique per user, compared case-insensitively
    pub fn has_name(&self, name: &str) -> bool {
        self.name.trim().to_lowercase() == name.trim().to_lowercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_comparison_ignores_case() {
        let folder = Folder::new("f1", "Work Projects");
        assert!(folder.has_name("work projects"));
        assert!(folder.has_name("  WORK PROJECTS "));
        assert!(!folder.has_name("Work"));
    }

    #[test]
    fn test_contains() {
        let mut folder = Folder::new("f1", "Work");
        folder.conversations.push(Conversation::new("c1", "Chat"));
        assert!(folder.contains("c1"));
        assert!(!folder.contains("c2"));
    }
}
