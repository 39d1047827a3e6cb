pub mod models;
pub mod repositories;

pub use models::{ClientSettings, MAX_RECENT_SERVERS};
pub use repositories::{
    SessionSettingsJsonRepository, SessionSettingsRepository, SettingsError, SettingsResult,
};
