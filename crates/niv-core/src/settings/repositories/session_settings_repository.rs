use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::settings::models::ClientSettings;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Path error: {0}")]
    PathError(String),
}

pub type SettingsResult<T> = Result<T, SettingsError>;

pub trait SessionSettingsRepository: Send + Sync + 'static {
    /// Load settings, or defaults on first run
    fn load(&self) -> BoxFuture<'static, SettingsResult<ClientSettings>>;

    /// Save settings to storage
    fn save(&self, settings: ClientSettings) -> BoxFuture<'static, SettingsResult<()>>;
}
