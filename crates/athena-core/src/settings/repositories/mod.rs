pub mod settings_json_repository;
pub mod settings_repository;

pub use settings_json_repository::SettingsJsonRepository;
pub use settings_repository::{SettingsError, SettingsRepository, SettingsResult};
