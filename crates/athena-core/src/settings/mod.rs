pub mod models;
pub mod repositories;

pub use models::{AthenaSettings, IncompleteStreamPolicy};
pub use repositories::{SettingsError, SettingsJsonRepository, SettingsRepository, SettingsResult};
