use std::path::PathBuf;

use super::conversation_repository::{BoxFuture, ConversationRepository};
use super::error::{RepositoryError, RepositoryResult};
use crate::models::Conversation;

/// JSON file-based repository for conversations
/// Stores the ordered list in ~/.config/niv/conversations.json
pub struct ConversationJsonRepository {
    file_path: PathBuf,
}

impl ConversationJsonRepository {
    /// Create repository with XDG-compliant path
    pub fn new() -> RepositoryResult<Self> {
        let config_dir = dirs::config_dir().ok_or_else(|| RepositoryError::InitializationError {
            message: "Could not determine config directory".to_string(),
        })?;

        Ok(Self {
            file_path: config_dir.join("niv").join("conversations.json"),
        })
    }

    /// Create repository with custom path (for testing)
    pub fn with_path(file_path: PathBuf) -> Self {
        Self { file_path }
    }
}

impl ConversationRepository for ConversationJsonRepository {
    fn load_all(&self) -> BoxFuture<'static, RepositoryResult<Vec<Conversation>>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            // If file doesn't exist, return empty list (first run)
            if !tokio::fs::try_exists(&path).await? {
                return Ok(Vec::new());
            }

            let contents = tokio::fs::read_to_string(&path).await?;
            let conversations: Vec<Conversation> = serde_json::from_str(&contents)?;

            Ok(conversations)
        })
    }

    fn save_all(&self, conversations: Vec<Conversation>) -> BoxFuture<'static, RepositoryResult<()>> {
        let path = self.file_path.clone();

        Box::pin(async move {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let json = serde_json::to_string_pretty(&conversations)?;

            // Write atomically using temp file + rename
            let temp_path = path.with_extension("json.tmp");
            tokio::fs::write(&temp_path, json).await?;
            tokio::fs::rename(&temp_path, &path).await?;

            Ok(())
        })
    }

    fn storage_path(&self) -> String {
        self.file_path.to_string_lossy().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConversationJsonRepository::with_path(dir.path().join("conversations.json"));
        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("conversations.json");
        let repo = ConversationJsonRepository::with_path(path.clone());

        let older = Conversation::new("1".into(), vec![Message::user("10".into(), "Older")]);
        let newer = Conversation::new("2".into(), vec![Message::user("20".into(), "Newer")]);
        repo.save_all(vec![newer.clone(), older.clone()]).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = repo.load_all().await.unwrap();
        assert_eq!(loaded, vec![newer, older]);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ConversationJsonRepository::with_path(dir.path().join("conversations.json"));

        repo.save_all(vec![Conversation::new("1".into(), Vec::new())])
            .await
            .unwrap();
        repo.save_all(Vec::new()).await.unwrap();

        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.json");
        std::fs::write(&path, "{not json").unwrap();

        let repo = ConversationJsonRepository::with_path(path);
        let err = repo.load_all().await.unwrap_err();
        assert!(matches!(err, RepositoryError::SerializationError(_)));
    }
}
