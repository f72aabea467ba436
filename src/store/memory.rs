//! In-memory store with blobs kept on disk.

use crate::error::{Error, Result};
use crate::store::{FileRecord, MessageRecord, NewFile, NewMessage, Store};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

#[derive(Default)]
struct Inner {
    /// username -> hex password digest
    users: HashMap<String, String>,
    messages: BTreeMap<i64, MessageRecord>,
    files: BTreeMap<i64, FileRecord>,
    /// legacy uuid -> file id
    files_by_uuid: HashMap<String, i64>,
    /// message id -> file id
    files_by_message: HashMap<i64, i64>,
    next_message_id: i64,
    next_file_id: i64,
}

impl Inner {
    fn next_message_id(&mut self) -> i64 {
        self.next_message_id += 1;
        self.next_message_id
    }

    fn next_file_id(&mut self) -> i64 {
        self.next_file_id += 1;
        self.next_file_id
    }
}

pub struct MemoryStore {
    blob_dir: PathBuf,
    inner: RwLock<Inner>,
}

fn password_digest(username: &str, password: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(username.as_bytes());
    hasher.update(&[0]);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize().as_bytes())
}

impl MemoryStore {
    /// Blobs are written under `blob_dir`, which is created on first use.
    pub fn new(blob_dir: impl Into<PathBuf>) -> Self {
        Self {
            blob_dir: blob_dir.into(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    async fn adopt_blob(&self, staged: &Path, target: &Path) -> Result<()> {
        tokio::fs::create_dir_all(&self.blob_dir)
            .await
            .map_err(|e| Error::Storage(format!("cannot create blob dir: {}", e)))?;
        if tokio::fs::rename(staged, target).await.is_err() {
            // Staging may sit on another filesystem.
            tokio::fs::copy(staged, target)
                .await
                .map_err(|e| Error::Storage(format!("cannot store blob: {}", e)))?;
            let _ = tokio::fs::remove_file(staged).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register_user(&self, username: &str, password: &str) -> Result<()> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::Rejected("username and password are required".into()));
        }
        let mut inner = self.inner.write();
        if inner.users.contains_key(username) {
            return Err(Error::Rejected(format!("username {} is taken", username)));
        }
        inner
            .users
            .insert(username.to_string(), password_digest(username, password));
        Ok(())
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<bool> {
        let inner = self.inner.read();
        Ok(inner
            .users
            .get(username)
            .is_some_and(|digest| *digest == password_digest(username, password)))
    }

    async fn save_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let mut inner = self.inner.write();
        let record = MessageRecord {
            id: inner.next_message_id(),
            from: message.from,
            to: message.to,
            body: message.body,
            reply_to: message.reply_to,
            file_id: None,
            sent_at: Utc::now(),
            delivered: message.delivered,
            edited: false,
        };
        inner.messages.insert(record.id, record.clone());
        Ok(record)
    }

    async fn message(&self, id: i64) -> Result<Option<MessageRecord>> {
        Ok(self.inner.read().messages.get(&id).cloned())
    }

    async fn undelivered_for(&self, username: &str) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .messages
            .values()
            .filter(|m| m.to == username && !m.delivered)
            .cloned()
            .collect())
    }

    async fn mark_delivered(&self, id: i64) -> Result<bool> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
        Ok(!std::mem::replace(&mut message.delivered, true))
    }

    async fn requeue(&self, id: i64) -> Result<()> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
        message.delivered = false;
        Ok(())
    }

    async fn history(&self, user: &str, peer: &str, limit: usize) -> Result<Vec<MessageRecord>> {
        let inner = self.inner.read();
        let mut newest: Vec<MessageRecord> = inner
            .messages
            .values()
            .rev()
            .filter(|m| m.involves(user, peer))
            .take(limit)
            .cloned()
            .collect();
        newest.reverse();
        Ok(newest)
    }

    async fn search(
        &self,
        user: &str,
        peer: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>> {
        let needle = query.to_lowercase();
        let inner = self.inner.read();
        Ok(inner
            .messages
            .values()
            .rev()
            .filter(|m| match peer {
                Some(peer) => m.involves(user, peer),
                None => m.from == user || m.to == user,
            })
            .filter(|m| m.body.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn edit_message(
        &self,
        id: i64,
        body: &str,
        reply_to: Option<i64>,
    ) -> Result<MessageRecord> {
        let mut inner = self.inner.write();
        let message = inner
            .messages
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
        message.body = body.to_string();
        message.reply_to = reply_to;
        message.edited = true;
        Ok(message.clone())
    }

    async fn delete_message(&self, id: i64) -> Result<MessageRecord> {
        let mut inner = self.inner.write();
        inner
            .messages
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))
    }

    async fn save_file(&self, file: NewFile, staged: &Path) -> Result<FileRecord> {
        let (file_id, message_id) = {
            let mut inner = self.inner.write();
            (inner.next_file_id(), inner.next_message_id())
        };
        let path = self.blob_dir.join(format!("{}-{}.blob", file_id, file.uuid));
        self.adopt_blob(staged, &path).await?;

        let record = FileRecord {
            id: file_id,
            message_id,
            uuid: file.uuid,
            from: file.from,
            to: file.to,
            name: file.name,
            mime: file.mime,
            bytes: file.bytes,
            media: file.media,
            duration_ms: file.duration_ms,
            reply_to: file.reply_to,
            path,
        };
        let message = MessageRecord {
            id: message_id,
            from: record.from.clone(),
            to: record.to.clone(),
            body: record.label(),
            reply_to: record.reply_to,
            file_id: Some(file_id),
            sent_at: Utc::now(),
            delivered: file.delivered,
            edited: false,
        };

        let mut inner = self.inner.write();
        inner.messages.insert(message_id, message);
        inner.files_by_uuid.insert(record.uuid.clone(), file_id);
        inner.files_by_message.insert(message_id, file_id);
        inner.files.insert(file_id, record.clone());
        Ok(record)
    }

    async fn file_by_id(&self, id: i64) -> Result<Option<FileRecord>> {
        Ok(self.inner.read().files.get(&id).cloned())
    }

    async fn file_by_message(&self, message_id: i64) -> Result<Option<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .files_by_message
            .get(&message_id)
            .and_then(|id| inner.files.get(id))
            .cloned())
    }

    async fn file_by_uuid(&self, uuid: &str) -> Result<Option<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .files_by_uuid
            .get(uuid)
            .and_then(|id| inner.files.get(id))
            .cloned())
    }

    async fn files_between(&self, user: &str, peer: &str) -> Result<Vec<FileRecord>> {
        let inner = self.inner.read();
        Ok(inner
            .files
            .values()
            .filter(|f| (f.from == user && f.to == peer) || (f.from == peer && f.to == user))
            .cloned()
            .collect())
    }

    async fn delete_file(&self, id: i64) -> Result<FileRecord> {
        let record = {
            let mut inner = self.inner.write();
            let record = inner
                .files
                .remove(&id)
                .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
            inner.files_by_uuid.remove(&record.uuid);
            inner.files_by_message.remove(&record.message_id);
            inner.messages.remove(&record.message_id);
            record
        };
        if let Err(e) = tokio::fs::remove_file(&record.path).await {
            tracing::warn!("Failed to remove blob {}: {}", record.path.display(), e);
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MediaKind;
    use tempfile::TempDir;

    fn dm(from: &str, to: &str, body: &str) -> NewMessage {
        NewMessage {
            from: from.into(),
            to: to.into(),
            body: body.into(),
            reply_to: None,
            delivered: true,
        }
    }

    #[tokio::test]
    async fn test_register_and_authenticate() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());

        store.register_user("alice", "pw").await.unwrap();
        assert!(store.authenticate("alice", "pw").await.unwrap());
        assert!(!store.authenticate("alice", "wrong").await.unwrap());
        assert!(!store.authenticate("nobody", "pw").await.unwrap());
        assert!(matches!(
            store.register_user("alice", "again").await,
            Err(Error::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_history_keeps_newest_oldest_first() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());

        for i in 0..5 {
            store.save_message(dm("alice", "bob", &format!("m{}", i))).await.unwrap();
        }
        store.save_message(dm("alice", "carol", "elsewhere")).await.unwrap();

        let history = store.history("bob", "alice", 3).await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test]
    async fn test_undelivered_queue() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());

        let mut queued = dm("alice", "bob", "later");
        queued.delivered = false;
        let saved = store.save_message(queued).await.unwrap();

        assert_eq!(store.undelivered_for("bob").await.unwrap().len(), 1);
        assert!(store.mark_delivered(saved.id).await.unwrap());
        assert!(store.undelivered_for("bob").await.unwrap().is_empty());

        // A second claim loses.
        assert!(!store.mark_delivered(saved.id).await.unwrap());

        store.requeue(saved.id).await.unwrap();
        assert_eq!(store.undelivered_for("bob").await.unwrap().len(), 1);
        assert!(store.mark_delivered(saved.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_newest_first() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path());

        store.save_message(dm("alice", "bob", "Lunch at noon?")).await.unwrap();
        store.save_message(dm("bob", "alice", "lunch works")).await.unwrap();
        store.save_message(dm("carol", "dave", "lunch too")).await.unwrap();

        let hits = store.search("alice", None, "LUNCH", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].body, "lunch works");
    }

    #[tokio::test]
    async fn test_save_and_delete_file() {
        let tmp = TempDir::new().unwrap();
        let store = MemoryStore::new(tmp.path().join("blobs"));
        let staged = tmp.path().join("upload.part");
        std::fs::write(&staged, [1u8, 2, 3]).unwrap();

        let record = store
            .save_file(
                NewFile {
                    uuid: "u-1".into(),
                    from: "alice".into(),
                    to: "bob".into(),
                    name: "a.bin".into(),
                    mime: "application/octet-stream".into(),
                    bytes: 3,
                    media: MediaKind::File,
                    duration_ms: None,
                    reply_to: Some(7),
                    delivered: false,
                },
                &staged,
            )
            .await
            .unwrap();

        assert!(!staged.exists());
        assert_eq!(std::fs::read(&record.path).unwrap(), vec![1, 2, 3]);
        assert_eq!(store.file_by_uuid("u-1").await.unwrap(), Some(record.clone()));
        assert_eq!(
            store.file_by_message(record.message_id).await.unwrap(),
            Some(record.clone())
        );

        let message = store.message(record.message_id).await.unwrap().unwrap();
        assert_eq!(message.body, "[FILE] a.bin");
        assert_eq!(message.reply_to, Some(7));
        assert_eq!(message.file_id, Some(record.id));

        store.delete_file(record.id).await.unwrap();
        assert!(!record.path.exists());
        assert_eq!(store.file_by_id(record.id).await.unwrap(), None);
        assert_eq!(store.message(record.message_id).await.unwrap(), None);
    }
}
