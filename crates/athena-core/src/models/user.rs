use serde::{Deserialize, Serialize};

/// The signed-in user as reported by the identity provider.
///
/// Only a stable identifier and display metadata cross this boundary; how the
/// identifier was obtained is the provider's business.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UserIdentity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

impl UserIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.trim().is_empty()
    }
}
