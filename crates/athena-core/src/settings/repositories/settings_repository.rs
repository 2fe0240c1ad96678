use std::fmt;

use crate::repositories::BoxFuture;
use crate::settings::models::AthenaSettings;

/// Settings storage error - abstracts over specific implementation errors
#[derive(Debug)]
pub enum SettingsError {
    IoError(String),
    SerializationError(String),
    PathError(String),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IoError(msg) => write!(f, "I/O error: {}", msg),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Self::PathError(msg) => write!(f, "Path error: {}", msg),
        }
    }
}

impl std::error::Error for SettingsError {}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub trait SettingsRepository: Send + Sync + 'static {
    /// Load settings, falling back to defaults when nothing is stored yet
    fn load(&self) -> BoxFuture<'static, SettingsResult<AthenaSettings>>;

    fn save(&self, settings: AthenaSettings) -> BoxFuture<'static, SettingsResult<()>>;

    /// Where the settings live (for diagnostics)
    fn storage_path(&self) -> String;
}
