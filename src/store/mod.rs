//! Storage collaborator.
//!
//! The engine never persists anything itself: sessions hand messages, files
//! and credentials to a [`Store`]. [`MemoryStore`] is the bundled
//! implementation (records in memory, blobs on disk) used by the binary and
//! the tests.

pub mod memory;

pub use memory::MemoryStore;

use crate::error::Result;
use crate::protocol::body::FileEvent;
use crate::protocol::FrameKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Whether a transfer is a generic file or a voice clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    File,
    Audio,
}

impl MediaKind {
    /// The media kind a META or CHUNK frame belongs to.
    pub fn of_frame(kind: FrameKind) -> Option<Self> {
        match kind {
            FrameKind::FileMeta | FrameKind::FileChunk | FrameKind::FileEvt => Some(Self::File),
            FrameKind::AudioMeta | FrameKind::AudioChunk | FrameKind::AudioEvt => {
                Some(Self::Audio)
            }
            _ => None,
        }
    }

    pub fn meta_kind(self) -> FrameKind {
        match self {
            Self::File => FrameKind::FileMeta,
            Self::Audio => FrameKind::AudioMeta,
        }
    }

    pub fn chunk_kind(self) -> FrameKind {
        match self {
            Self::File => FrameKind::FileChunk,
            Self::Audio => FrameKind::AudioChunk,
        }
    }

    pub fn event_kind(self) -> FrameKind {
        match self {
            Self::File => FrameKind::FileEvt,
            Self::Audio => FrameKind::AudioEvt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: i64,
    pub from: String,
    pub to: String,
    /// Untagged body; file messages hold their history label.
    pub body: String,
    pub reply_to: Option<i64>,
    pub file_id: Option<i64>,
    pub sent_at: DateTime<Utc>,
    pub delivered: bool,
    pub edited: bool,
}

impl MessageRecord {
    pub fn involves(&self, user: &str, peer: &str) -> bool {
        (self.from == user && self.to == peer) || (self.from == peer && self.to == user)
    }
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub from: String,
    pub to: String,
    pub body: String,
    pub reply_to: Option<i64>,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub message_id: i64,
    /// Legacy identifier accepted by download requests.
    pub uuid: String,
    pub from: String,
    pub to: String,
    pub name: String,
    pub mime: String,
    pub bytes: u64,
    pub media: MediaKind,
    pub duration_ms: Option<u32>,
    pub reply_to: Option<i64>,
    /// Where the blob lives.
    pub path: PathBuf,
}

impl FileRecord {
    /// Body of the message that represents this file in history.
    pub fn label(&self) -> String {
        file_label(self.media, &self.name, &self.mime)
    }

    pub fn event(&self) -> FileEvent {
        FileEvent {
            from: self.from.clone(),
            to: self.to.clone(),
            uuid: self.uuid.clone(),
            file_id: self.id,
            message_id: self.message_id,
            reply_to: self.reply_to,
            name: self.name.clone(),
            mime: self.mime.clone(),
            bytes: self.bytes,
        }
    }
}

/// `[AUDIO]` for voice clips, `[VIDEO] <name>` for video files, `[FILE] <name>` otherwise.
pub fn file_label(media: MediaKind, name: &str, mime: &str) -> String {
    match media {
        MediaKind::Audio => "[AUDIO]".to_string(),
        MediaKind::File if mime.starts_with("video/") => format!("[VIDEO] {}", name),
        MediaKind::File => format!("[FILE] {}", name),
    }
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub uuid: String,
    pub from: String,
    pub to: String,
    pub name: String,
    pub mime: String,
    pub bytes: u64,
    pub media: MediaKind,
    pub duration_ms: Option<u32>,
    pub reply_to: Option<i64>,
    pub delivered: bool,
}

/// Durable state behind the sessions. Failures surface as `Error::Storage`
/// (or `Rejected`/`NotFound` where the request itself is at fault).
#[async_trait]
pub trait Store: Send + Sync {
    async fn register_user(&self, username: &str, password: &str) -> Result<()>;

    async fn authenticate(&self, username: &str, password: &str) -> Result<bool>;

    async fn save_message(&self, message: NewMessage) -> Result<MessageRecord>;

    async fn message(&self, id: i64) -> Result<Option<MessageRecord>>;

    /// Messages addressed to `username` that were queued while it was offline, oldest first.
    async fn undelivered_for(&self, username: &str) -> Result<Vec<MessageRecord>>;

    /// Mark a queued message delivered. Returns false if it already was, so
    /// exactly one caller wins the right to push it.
    async fn mark_delivered(&self, id: i64) -> Result<bool>;

    /// Put a claimed message back in the queue after its push failed.
    async fn requeue(&self, id: i64) -> Result<()>;

    /// The newest `limit` messages between two users, oldest first.
    async fn history(&self, user: &str, peer: &str, limit: usize) -> Result<Vec<MessageRecord>>;

    /// Messages visible to `user` whose body contains `query`, newest first.
    async fn search(
        &self,
        user: &str,
        peer: Option<&str>,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>>;

    async fn edit_message(&self, id: i64, body: &str, reply_to: Option<i64>)
        -> Result<MessageRecord>;

    async fn delete_message(&self, id: i64) -> Result<MessageRecord>;

    /// Persist a completed upload, taking ownership of the staged file.
    async fn save_file(&self, file: NewFile, staged: &Path) -> Result<FileRecord>;

    async fn file_by_id(&self, id: i64) -> Result<Option<FileRecord>>;

    async fn file_by_message(&self, message_id: i64) -> Result<Option<FileRecord>>;

    async fn file_by_uuid(&self, uuid: &str) -> Result<Option<FileRecord>>;

    /// Files exchanged between two users, oldest first.
    async fn files_between(&self, user: &str, peer: &str) -> Result<Vec<FileRecord>>;

    /// Remove a file, its blob and its message.
    async fn delete_file(&self, id: i64) -> Result<FileRecord>;
}
