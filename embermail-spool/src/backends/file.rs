//! File-backed spool: the production backend. Entry metadata and raw
//! message bytes are sibling files named by [`SpooledMessageId`]; the lock
//! is a third sidecar file whose presence and mtime represent ownership.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::{
    backend::{BackingStore, PermanentFailure, SpoolEntry},
    entry::{DeliveryOutcome, SpoolSubmission, now_unix},
    error::{Result, SerializationError, SpoolError, ValidationError},
    types::SpooledMessageId,
};

/// A lock sidecar older than this is considered abandoned by a dead worker
/// and may be reclaimed by another.
const LOCK_TTL: Duration = Duration::from_secs(300);

const UNIX_SYSTEM_DIRECTORIES: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/boot", "/sys", "/proc", "/dev",
];

const WINDOWS_SYSTEM_DIRECTORIES: &[&str] = &[
    "windows",
    "program files",
    "program files (x86)",
    "programdata",
];

/// Rejects paths that are relative, contain a `..` component, or sit under
/// a well-known OS directory nobody should be pointing a mail spool at.
/// Does not touch the filesystem; existence is checked separately by
/// [`FileBackingStore::ensure_ready`].
fn check_path_is_sane(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(SpoolError::Validation(ValidationError::InvalidConfiguration(
            format!("spool path must be absolute: {}", path.display()),
        )));
    }
    if path.components().any(|c| c.as_os_str() == "..") {
        return Err(SpoolError::Validation(ValidationError::InvalidConfiguration(
            format!("spool path cannot contain '..': {}", path.display()),
        )));
    }

    let rendered = path.display().to_string();
    let lower = rendered.to_ascii_lowercase();

    for system_dir in UNIX_SYSTEM_DIRECTORIES {
        if rendered == *system_dir || rendered.starts_with(&format!("{system_dir}/")) {
            return Err(SpoolError::Validation(ValidationError::InvalidConfiguration(
                format!("spool path is a system directory: {rendered}"),
            )));
        }
    }
    for system_dir in WINDOWS_SYSTEM_DIRECTORIES {
        if lower.contains(&format!(":\\{system_dir}")) {
            return Err(SpoolError::Validation(ValidationError::InvalidConfiguration(
                format!("spool path is a system directory: {rendered}"),
            )));
        }
    }

    Ok(())
}

/// Builder for [`FileBackingStore`], mirroring how the rest of the config
/// layer constructs validated values.
#[derive(Debug, Default)]
pub struct FileBackingStoreBuilder {
    directory: Option<PathBuf>,
}

impl FileBackingStoreBuilder {
    #[must_use]
    pub fn path(mut self, directory: PathBuf) -> Self {
        self.directory = Some(directory);
        self
    }

    /// # Errors
    /// Returns a [`ValidationError`] if no path was given, or the path is
    /// relative, traverses `..`, or names a system directory.
    pub fn build(self) -> Result<FileBackingStore> {
        let directory = self.directory.ok_or_else(|| {
            SpoolError::Validation(ValidationError::InvalidConfiguration(
                "spool path is required".to_string(),
            ))
        })?;
        check_path_is_sane(&directory)?;
        Ok(FileBackingStore { directory })
    }
}

/// File-backed [`BackingStore`]. Metadata is bincode-encoded into
/// `<id>.meta`; the raw message bytes the transaction processor already
/// wrote to the spool directory are referenced by path, not copied.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    directory: PathBuf,
}

impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            path: PathBuf,
        }
        let raw = Raw::deserialize(deserializer)?;
        FileBackingStore::builder()
            .path(raw.path)
            .build()
            .map_err(serde::de::Error::custom)
    }
}

impl FileBackingStore {
    #[must_use]
    pub fn builder() -> FileBackingStoreBuilder {
        FileBackingStoreBuilder::default()
    }

    /// # Errors
    /// Returns a [`ValidationError`] if `directory` is relative, traverses
    /// `..`, or names a system directory.
    pub fn new(directory: PathBuf) -> Result<Self> {
        Self::builder().path(directory).build()
    }

    /// Creates the spool directory if it does not already exist. Safe to
    /// call on every startup.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created, or exists as a
    /// non-directory.
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.directory.is_file() {
            return Err(SpoolError::Validation(ValidationError::NotDirectory(
                self.directory.display().to_string(),
            )));
        }
        tokio::fs::create_dir_all(&self.directory).await?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.directory
    }

    fn meta_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.directory.join(id.meta_filename())
    }

    fn lock_path(&self, id: &SpooledMessageId) -> PathBuf {
        self.directory.join(id.lock_filename())
    }

    async fn read_entry(&self, id: &SpooledMessageId) -> Result<SpoolEntry> {
        let bytes = tokio::fs::read(self.meta_path(id)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SpoolError::NotFound(id.clone())
            } else {
                SpoolError::Io(e)
            }
        })?;
        let (entry, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())
            .map_err(|e| SpoolError::Serialization(SerializationError::Decode(e)))?;
        Ok(entry)
    }

    async fn write_entry(&self, entry: &SpoolEntry) -> Result<()> {
        let bytes = bincode::serde::encode_to_vec(entry, bincode::config::legacy())
            .map_err(|e| SpoolError::Serialization(SerializationError::Encode(e)))?;
        tokio::fs::write(self.meta_path(&entry.id), bytes).await?;
        Ok(())
    }

    async fn lock_is_free(&self, id: &SpooledMessageId) -> bool {
        let Ok(metadata) = tokio::fs::metadata(self.lock_path(id)).await else {
            return true;
        };
        metadata
            .modified()
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_none_or(|age| age > LOCK_TTL)
    }

    /// Claims the lock sidecar with a single atomic exclusive-create, so two
    /// workers racing on the same entry cannot both believe they own it.
    /// `lock_is_free` may find a lock that's merely stale; in that case the
    /// abandoned file is removed first, but the actual claim is still decided
    /// by whichever `create_new` wins the race.
    async fn acquire_lock(&self, id: &SpooledMessageId, worker_token: &str) -> bool {
        if !self.lock_is_free(id).await {
            return false;
        }
        let _ = tokio::fs::remove_file(self.lock_path(id)).await;

        let Ok(mut file) = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(id))
            .await
        else {
            return false;
        };
        file.write_all(worker_token.as_bytes()).await.is_ok()
    }

    async fn release_lock(&self, id: &SpooledMessageId) {
        let _ = tokio::fs::remove_file(self.lock_path(id)).await;
    }

    async fn entry_ids(&self) -> Result<Vec<SpooledMessageId>> {
        let mut ids = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&self.directory).await?;
        while let Some(dir_entry) = read_dir.next_entry().await? {
            let Some(filename) = dir_entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if filename.ends_with(".meta")
                && let Some(id) = SpooledMessageId::from_filename(&filename)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn enqueue(&self, submission: SpoolSubmission) -> Result<SpooledMessageId> {
        let id = SpooledMessageId::generate();
        let entry = SpoolEntry::from_submission(id.clone(), submission);
        self.write_entry(&entry).await?;
        Ok(id)
    }

    async fn claim_due(&self, worker_token: &str, limit: usize) -> Result<Vec<SpoolEntry>> {
        let now = now_unix();
        let mut due = Vec::new();
        for id in self.entry_ids().await? {
            if let Ok(entry) = self.read_entry(&id).await
                && entry.next_attempt_at_unix <= now
            {
                due.push(entry);
            }
        }
        due.sort_by_key(|entry| entry.next_attempt_at_unix);

        let mut claimed = Vec::new();
        for entry in due {
            if claimed.len() >= limit {
                break;
            }
            if self.acquire_lock(&entry.id, worker_token).await {
                claimed.push(entry);
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: &SpooledMessageId) -> Result<()> {
        let entry = self.read_entry(id).await?;
        tokio::fs::remove_file(self.meta_path(id)).await?;
        let _ = tokio::fs::remove_file(&entry.message_path).await;
        self.release_lock(id).await;
        Ok(())
    }

    async fn reschedule(&self, id: &SpooledMessageId, next_at_unix: i64, new_attempts: u32) -> Result<()> {
        let mut entry = self.read_entry(id).await?;
        entry.next_attempt_at_unix = next_at_unix;
        entry.attempts = new_attempts;
        self.write_entry(&entry).await?;
        self.release_lock(id).await;
        Ok(())
    }

    async fn fail_permanent(&self, id: &SpooledMessageId, per_recipient_reasons: &[PermanentFailure]) -> Result<()> {
        let mut entry = self.read_entry(id).await?;
        for status in &mut entry.recipients {
            let rendered = status.disposition.entry.address.to_string();
            if per_recipient_reasons.iter().any(|(addr, _)| *addr == rendered) {
                status.outcome = DeliveryOutcome::PermanentFailure;
            }
        }

        if entry.is_fully_resolved() {
            self.complete(id).await
        } else {
            self.write_entry(&entry).await?;
            self.release_lock(id).await;
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use embermail_common::{address::Address, envelope::NotifyFlags, envelope::RecipientEntry};

    use super::*;
    use crate::entry::RecipientDisposition;

    fn submission(address: &str, message_path: PathBuf) -> SpoolSubmission {
        let mailbox = mailparse::addrparse(address).unwrap().remove(0);
        SpoolSubmission {
            sender: Some("sender@example.com".to_string()),
            recipients: vec![RecipientDisposition {
                entry: RecipientEntry {
                    address: Address::from(mailbox),
                    notify: NotifyFlags::default_on_failure(),
                    orcpt: None,
                },
                local: true,
            }],
            message_path,
            message_len: 3,
            client_id: "client.example.com".to_string(),
            authenticated_as: None,
            ret: None,
            envid: None,
            received_at_unix: now_unix(),
        }
    }

    #[tokio::test]
    async fn enqueue_persists_entry_claim_then_complete_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let message_path = dir.path().join("body.eml");
        tokio::fs::write(&message_path, b"raw").await.unwrap();

        let store = FileBackingStore::new(dir.path().to_path_buf()).unwrap();
        store.ensure_ready().await.unwrap();
        let id = store
            .enqueue(submission("alice@example.com", message_path.clone()))
            .await
            .unwrap();
        assert!(store.meta_path(&id).exists());

        let claimed = store.claim_due("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_due("worker-2", 10).await.unwrap().is_empty());

        store.complete(&id).await.unwrap();
        assert!(!store.meta_path(&id).exists());
        assert!(!message_path.exists());
    }

    #[test]
    fn builder_rejects_relative_paths() {
        let result = FileBackingStore::builder()
            .path(PathBuf::from("relative/path"))
            .build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("must be absolute"));
    }

    #[test]
    fn builder_rejects_parent_dir_traversal() {
        let result = FileBackingStore::builder()
            .path(PathBuf::from("/var/spool/../etc/passwd"))
            .build();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("cannot contain '..'"));
    }

    #[test]
    #[cfg(unix)]
    fn builder_rejects_unix_system_directories() {
        for path in ["/etc/spool", "/bin/messages", "/usr/bin/data"] {
            let result = FileBackingStore::builder().path(PathBuf::from(path)).build();
            assert!(result.is_err(), "{path} should have been rejected");
        }
    }

    #[test]
    #[cfg(unix)]
    fn builder_accepts_valid_unix_paths() {
        for path in ["/var/spool/embermail", "/opt/embermail/spool", "/tmp/test-spool"] {
            let result = FileBackingStore::builder().path(PathBuf::from(path)).build();
            assert!(result.is_ok(), "{path} should have been accepted: {result:?}");
        }
    }
}
