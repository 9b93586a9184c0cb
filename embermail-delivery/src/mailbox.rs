//! Local delivery and sent-message archival seams.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{DeliveryError, SystemError};

/// Delivers a message to a recipient owned by this installation.
#[async_trait]
pub trait LocalMailboxStore: Send + Sync {
    /// Appends `message` to `owner`'s mailbox. `owner` is the local part (or
    /// full address) the routing policy resolved as locally served.
    async fn deliver(&self, owner: &str, message: &[u8]) -> Result<(), DeliveryError>;
}

/// Archives a copy of a successfully delivered message, for audit or
/// sent-mail folders. Distinct from [`LocalMailboxStore`]: a message can be
/// archived regardless of whether its recipients were local or remote.
#[async_trait]
pub trait SentMessageStore: Send + Sync {
    async fn archive(&self, message_id: &str, message: &[u8]) -> Result<(), DeliveryError>;
}

/// Appends each owner's mail to `<root>/<owner>.mbox`, creating the file if
/// it does not exist. Intended for local testing and small installations;
/// a production embedder would more likely hand off to Maildir or a
/// database-backed store.
#[derive(Debug, Clone)]
pub struct FileMailboxStore {
    root: PathBuf,
}

impl FileMailboxStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn mailbox_path(&self, owner: &str) -> PathBuf {
        let sanitised: String = owner
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join(format!("{sanitised}.mbox"))
    }
}

#[async_trait]
impl LocalMailboxStore for FileMailboxStore {
    async fn deliver(&self, owner: &str, message: &[u8]) -> Result<(), DeliveryError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(SystemError::Io)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.mailbox_path(owner))
            .await
            .map_err(SystemError::Io)?;

        file.write_all(format!("From {owner} local\n").as_bytes())
            .await
            .map_err(SystemError::Io)?;
        file.write_all(message).await.map_err(SystemError::Io)?;
        file.write_all(b"\n\n").await.map_err(SystemError::Io)?;
        Ok(())
    }
}

/// Archives nothing. The default when the embedder has no sent-mail store.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSentMessageStore;

#[async_trait]
impl SentMessageStore for NullSentMessageStore {
    async fn archive(&self, _message_id: &str, _message: &[u8]) -> Result<(), DeliveryError> {
        Ok(())
    }
}
