pub mod athena_settings;

pub use athena_settings::{AthenaSettings, IncompleteStreamPolicy};
