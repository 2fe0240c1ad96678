use std::path::PathBuf;

use tracing::debug;

use super::settings_repository::{SettingsError, SettingsRepository, SettingsResult};
use crate::repositories::BoxFuture;
use crate::settings::models::AthenaSettings;

pub struct SettingsJsonRepository {
    file_path: PathBuf,
}

impl SettingsJsonRepository {
    /// Repository at `<config dir>/athena/settings.json`
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::PathError("Cannot determine config directory".into()))?;

        Ok(Self::with_path(config_dir.join("athena").join("settings.json")))
    }

    pub fn with_path(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }
}

fn join_error(e: tokio::task::JoinError) -> SettingsError {
    SettingsError::IoError(format!("Blocking task failed: {}", e))
}

impl SettingsRepository for SettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, SettingsResult<AthenaSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let contents = tokio::task::spawn_blocking({
                let path = path.clone();
                move || {
                    if !path.exists() {
                        return Ok(None);
                    }
                    std::fs::read_to_string(&path).map(Some)
                }
            })
            .await
            .map_err(join_error)?
            .map_err(|e| SettingsError::IoError(e.to_string()))?;

            let Some(contents) = contents else {
                debug!(path = %path.display(), "No settings file, using defaults");
                return Ok(AthenaSettings::default());
            };

            let settings: AthenaSettings = serde_json::from_str(&contents)
                .map_err(|e| SettingsError::SerializationError(e.to_string()))?;

            Ok(settings)
        })
    }

    fn save(&self, settings: AthenaSettings) -> BoxFuture<'static, SettingsResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&settings)
                .map_err(|e| SettingsError::SerializationError(e.to_string()))?;

            tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| SettingsError::IoError(e.to_string()))?;
                }

                // Write atomically using temp file + rename
                let temp_path = path.with_extension("json.tmp");
                std::fs::write(&temp_path, &json)
                    .map_err(|e| SettingsError::IoError(e.to_string()))?;

                std::fs::rename(&temp_path, &path)
                    .map_err(|e| SettingsError::IoError(e.to_string()))?;

                Ok::<(), SettingsError>(())
            })
            .await
            .map_err(join_error)??;

            Ok(())
        })
    }

    fn storage_path(&self) -> String {
        self.file_path.display().to_string()
    }
}
