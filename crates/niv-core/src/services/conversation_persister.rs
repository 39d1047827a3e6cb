use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error};

use crate::models::Conversation;
use crate::repositories::{ConversationRepository, RepositoryError, RepositoryResult};

#[derive(Clone)]
struct Snapshot {
    version: u64,
    conversations: Arc<Vec<Conversation>>,
}

#[derive(Clone, Default)]
struct Persisted {
    version: u64,
    error: Option<String>,
}

/// Background writer for the conversation list.
///
/// Holds at most one pending snapshot. A snapshot submitted while a save is
/// running replaces whatever was waiting, so the repository only ever moves
/// forward to newer states.
pub struct ConversationPersister {
    pending: watch::Sender<Snapshot>,
    persisted: watch::Receiver<Persisted>,
}

impl ConversationPersister {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(repo: Arc<dyn ConversationRepository>) -> Self {
        let (pending, mut pending_rx) = watch::channel(Snapshot {
            version: 0,
            conversations: Arc::new(Vec::new()),
        });
        let (persisted_tx, persisted) = watch::channel(Persisted::default());

        tokio::spawn(async move {
            while pending_rx.changed().await.is_ok() {
                let snapshot = pending_rx.borrow_and_update().clone();
                let conversations = Vec::clone(&snapshot.conversations);
                let count = conversations.len();

                let error = match repo.save_all(conversations).await {
                    Ok(()) => {
                        debug!(version = snapshot.version, count, "Conversations saved");
                        None
                    }
                    Err(e) => {
                        error!(
                            error = ?e,
                            version = snapshot.version,
                            path = %repo.storage_path(),
                            "Failed to save conversations"
                        );
                        Some(e.to_string())
                    }
                };

                persisted_tx.send_replace(Persisted {
                    version: snapshot.version,
                    error,
                });
            }
            debug!("Conversation persister stopped");
        });

        Self { pending, persisted }
    }

    /// Queue `conversations` as the newest state. Never blocks.
    pub fn submit(&self, version: u64, conversations: Vec<Conversation>) {
        self.pending.send_replace(Snapshot {
            version,
            conversations: Arc::new(conversations),
        });
    }

    /// Wait until the newest submitted snapshot has been written, and report
    /// whether that write succeeded.
    pub async fn flush(&self) -> RepositoryResult<()> {
        let target = self.pending.borrow().version;
        let mut persisted = self.persisted.clone();
        let state = persisted
            .wait_for(|p| p.version >= target)
            .await
            .map_err(|_| RepositoryError::WorkerStopped)?;

        match &state.error {
            Some(message) => Err(RepositoryError::SaveFailed {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}
