pub mod session_settings_json_repository;
pub mod session_settings_repository;

pub use session_settings_json_repository::SessionSettingsJsonRepository;
pub use session_settings_repository::{
    SessionSettingsRepository, SettingsError, SettingsResult,
};
