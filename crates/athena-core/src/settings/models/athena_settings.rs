use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{TemplateStore, UserIdentity};
use crate::models::conversation::DEFAULT_PREVIEW_CHARS;
use crate::services::token_accumulator::DEFAULT_RENDER_BATCH_SIZE;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 200;

/// What to do with a reply whose stream ended without the terminal marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteStreamPolicy {
    /// Drop the partial reply
    #[default]
    Discard,
    /// Store the partial reply as a regular assistant message
    PersistTruncated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AthenaSettings {
    pub api_base_url: String,
    pub user: UserIdentity,
    pub render_batch_size: usize,
    pub preview_chars: usize,
    pub incomplete_stream_policy: IncompleteStreamPolicy,
    /// Give up on a reply stream after this long without data. `None` waits forever.
    pub stream_idle_timeout_secs: Option<u64>,
    pub error_log_capacity: usize,
    /// Prompt templates offered by the composer
    pub templates: TemplateStore,
}

impl AthenaSettings {
    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl Default for AthenaSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            user: UserIdentity::default(),
            render_batch_size: DEFAULT_RENDER_BATCH_SIZE,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            incomplete_stream_policy: IncompleteStreamPolicy::Discard,
            stream_idle_timeout_secs: None,
            error_log_capacity: DEFAULT_ERROR_LOG_CAPACITY,
            templates: TemplateStore::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_falls_back_to_defaults() {
        let settings: AthenaSettings = serde_json::from_str(
            r#"{"api_base_url":"https://athena.example","incomplete_stream_policy":"persist_truncated"}"#,
        )
        .unwrap();

        assert_eq!(settings.api_base_url, "https://athena.example");
        assert_eq!(
            settings.incomplete_stream_policy,
            IncompleteStreamPolicy::PersistTruncated
        );
        assert_eq!(settings.render_batch_size, 5);
        assert_eq!(settings.stream_idle_timeout(), None);
        assert!(settings.templates.is_empty());
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let settings = AthenaSettings {
            stream_idle_timeout_secs: Some(0),
            ..Default::default()
        };
        assert_eq!(settings.stream_idle_timeout(), None);

        let settings = AthenaSettings {
            stream_idle_timeout_secs: Some(30),
            ..Default::default()
        };
        assert_eq!(settings.stream_idle_timeout(), Some(Duration::from_secs(30)));
    }
}
