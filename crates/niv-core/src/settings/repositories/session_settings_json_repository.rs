use std::path::{Path, PathBuf};

use super::session_settings_repository::{
    BoxFuture, SessionSettingsRepository, SettingsError, SettingsResult,
};
use crate::settings::models::ClientSettings;

const SETTINGS_FILE: &str = "session.json";

pub struct SessionSettingsJsonRepository {
    file_path: PathBuf,
}

impl SessionSettingsJsonRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> SettingsResult<Self> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SettingsError::PathError("Cannot determine config directory".into()))?;

        Ok(Self::in_dir(&config_dir.join("niv")))
    }

    /// Keep `session.json` inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            file_path: dir.join(SETTINGS_FILE),
        }
    }

    pub fn with_path(file_path: PathBuf) -> Self {
        Self { file_path }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

fn join_error(e: tokio::task::JoinError) -> SettingsError {
    SettingsError::IoError(std::io::Error::other(e))
}

impl SessionSettingsRepository for SessionSettingsJsonRepository {
    fn load(&self) -> BoxFuture<'static, SettingsResult<ClientSettings>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            // File I/O on the blocking pool
            let contents = tokio::task::spawn_blocking(move || {
                if !path.exists() {
                    return Ok(None);
                }
                std::fs::read_to_string(&path).map(Some)
            })
            .await
            .map_err(join_error)??;

            let Some(contents) = contents else {
                return Ok(ClientSettings::default());
            };

            let settings: ClientSettings = serde_json::from_str(&contents)?;
            Ok(settings)
        })
    }

    fn save(&self, settings: ClientSettings) -> BoxFuture<'static, SettingsResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            let json = serde_json::to_string_pretty(&settings)?;

            tokio::task::spawn_blocking(move || {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }

                // Write atomically using temp file + rename
                let temp_path = path.with_extension("json.tmp");
                std::fs::write(&temp_path, &json)?;
                std::fs::rename(&temp_path, &path)
            })
            .await
            .map_err(join_error)??;

            Ok(())
        })
    }
}
