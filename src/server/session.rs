//! Per-connection session.
//!
//! Frames are handled strictly in arrival order. The session owns at most one
//! in-progress upload; a new META abandons whatever was open before it.
//!
//! Upload states: IDLE -> META_RECEIVED -> RECEIVING_CHUNKS -> {COMPLETE | ABORTED}.
//! `upload == None` is IDLE; an open [`Upload`] with `expected_seq == 0` is
//! META_RECEIVED. Dropping an `Upload` closes its sink and deletes the partial
//! file, which is how every abort path releases it.

use crate::error::{Error, Result};
use crate::protocol::body::{
    from_body, to_body, DownloadMeta, DownloadRequest, DownloadTarget, FileSaved, SearchHit,
    TransferMeta, DEFAULT_MIME,
};
use crate::protocol::{Frame, FrameKind};
use crate::reply;
use crate::server::registry::PeerHandle;
use crate::server::ServerState;
use crate::store::{FileRecord, MediaKind, MessageRecord, NewFile, NewMessage};
use crate::temp_file::TempFileGuard;
use bytes::Bytes;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Single upload slot.
struct Upload {
    transfer_id: String,
    media: MediaKind,
    to: String,
    name: String,
    mime: String,
    declared_size: u64,
    duration_ms: Option<u32>,
    reply_to: Option<i64>,
    uuid: String,
    expected_seq: u32,
    bytes_written: u64,
    file: File,
    guard: TempFileGuard,
}

pub struct Session {
    conn_id: u64,
    state: Arc<ServerState>,
    out: mpsc::Sender<Frame>,
    user: Option<String>,
    upload: Option<Upload>,
}

impl Session {
    pub fn new(conn_id: u64, state: Arc<ServerState>, out: mpsc::Sender<Frame>) -> Self {
        Self {
            conn_id,
            state,
            out,
            user: None,
            upload: None,
        }
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Transfer id of the open upload, if any.
    pub fn active_transfer(&self) -> Option<&str> {
        self.upload.as_ref().map(|u| u.transfer_id.as_str())
    }

    /// Handle one inbound frame.
    ///
    /// Per-operation failures are answered with an ERROR frame correlated by
    /// the request's `transfer_id`; only a closed outbound path is returned.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let kind = frame.kind;
        let transfer_id = frame.transfer_id.clone();

        let outcome = match kind {
            FrameKind::Register => self.handle_register(frame).await,
            FrameKind::Login => self.handle_login(frame).await,
            FrameKind::Dm => self.handle_dm(frame).await,
            FrameKind::History => self.handle_history(frame).await,
            FrameKind::EditMsg => self.handle_edit(frame).await,
            FrameKind::DeleteMsg => self.handle_delete_message(frame).await,
            FrameKind::Search => self.handle_search(frame).await,
            FrameKind::FileHistory => self.handle_file_history(frame).await,
            FrameKind::DeleteFile => self.handle_delete_file(frame).await,
            FrameKind::DownloadFile => self.handle_download(frame).await,
            FrameKind::FileMeta | FrameKind::AudioMeta => self.handle_meta(frame).await,
            FrameKind::FileChunk | FrameKind::AudioChunk => self.handle_chunk(frame).await,
            other => Err(Error::ProtocolViolation(format!(
                "unsupported frame kind {:?}",
                other
            ))),
        };

        match outcome {
            Ok(()) => Ok(()),
            Err(Error::ConnectionClosed) => Err(Error::ConnectionClosed),
            Err(e) => {
                warn!(conn = self.conn_id, ?kind, transfer_id = %transfer_id, "{}", e);
                self.send(Frame::error(transfer_id, e.to_string())).await
            }
        }
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        self.out
            .send(frame)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn require_user(&self) -> Result<String> {
        self.user.clone().ok_or(Error::Unauthorized)
    }

    fn peer(&self, user: &str) -> Option<PeerHandle> {
        self.state.registry.get(user)
    }

    fn limit(&self, seq: u32) -> usize {
        if seq == 0 {
            self.state.config.default_limit as usize
        } else {
            seq as usize
        }
    }

    // =========================================================================
    // Accounts
    // =========================================================================

    async fn handle_register(&mut self, frame: Frame) -> Result<()> {
        self.state
            .store
            .register_user(&frame.sender, &frame.body)
            .await?;
        info!(conn = self.conn_id, user = %frame.sender, "registered");
        self.send(Frame::ack(frame.transfer_id, "OK REGISTER")).await
    }

    async fn handle_login(&mut self, frame: Frame) -> Result<()> {
        let username = frame.sender;
        if !self
            .state
            .store
            .authenticate(&username, &frame.body)
            .await?
        {
            return Err(Error::Rejected("invalid credentials".into()));
        }

        if let Some(previous) = self.user.take() {
            self.state.registry.remove_if_owner(&previous, self.conn_id);
        }
        let replaced = self
            .state
            .registry
            .insert(&username, PeerHandle::new(self.conn_id, self.out.clone()));
        if let Some(old) = replaced {
            debug!(user = %username, old_conn = old.conn_id(), "login replaces earlier session");
        }
        self.user = Some(username.clone());
        info!(
            conn = self.conn_id,
            user = %username,
            online = self.state.registry.len(),
            "logged in"
        );

        self.send(Frame::ack(frame.transfer_id, "OK LOGIN")).await?;
        self.flush_queued(&username).await
    }

    /// Deliver everything that was queued while `user` was offline.
    ///
    /// Each message is claimed before it is sent; one that a live push
    /// already claimed is skipped.
    async fn flush_queued(&self, user: &str) -> Result<()> {
        let queued = self.state.store.undelivered_for(user).await?;
        for message in queued {
            let frame = match message.file_id {
                Some(file_id) => match self.state.store.file_by_id(file_id).await? {
                    Some(record) => event_frame(&record)?,
                    None => continue,
                },
                None => dm_frame(&message),
            };
            if !self.state.store.mark_delivered(message.id).await? {
                continue;
            }
            if let Err(e) = self.send(frame).await {
                self.state.store.requeue(message.id).await?;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Push a stored message to its recipient if online.
    ///
    /// Returns true once the message has gone out, whether through this push
    /// or through the recipient's login flush. A full or closed peer queue
    /// leaves it queued.
    async fn push_stored(&self, to: &str, message_id: i64, frame: Frame) -> Result<bool> {
        let Some(peer) = self.peer(to) else {
            return Ok(false);
        };
        if !self.state.store.mark_delivered(message_id).await? {
            return Ok(true);
        }
        if peer.send(frame) {
            return Ok(true);
        }
        self.state.store.requeue(message_id).await?;
        Ok(false)
    }

    // =========================================================================
    // Messages
    // =========================================================================

    async fn handle_dm(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        if frame.recipient.is_empty() {
            return Err(Error::ProtocolViolation("DM names no recipient".into()));
        }
        let (reply_to, text) = reply::strip(&frame.body);

        let record = self
            .state
            .store
            .save_message(NewMessage {
                from: user,
                to: frame.recipient.clone(),
                body: text.to_string(),
                reply_to,
                delivered: false,
            })
            .await?;

        let delivered = self
            .push_stored(&record.to, record.id, dm_frame(&record))
            .await?;
        let status = if delivered { "OK DM" } else { "OK QUEUED" };
        debug!(conn = self.conn_id, id = record.id, to = %record.to, status, "dm stored");
        self.send(Frame::ack(record.id.to_string(), status)).await
    }

    async fn handle_history(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        if frame.recipient.is_empty() {
            return Err(Error::ProtocolViolation("HISTORY names no peer".into()));
        }
        let records = self
            .state
            .store
            .history(&user, &frame.recipient, self.limit(frame.seq))
            .await?;

        for record in &records {
            let line = if record.from == user {
                format!("[HIST OUT] {}", record.body)
            } else {
                format!("[HIST IN] {}: {}", record.from, record.body)
            };
            let replay = Frame::new(FrameKind::History)
                .with_sender(record.from.as_str())
                .with_recipient(record.to.as_str())
                .with_body(reply::prepend(&line, record.reply_to))
                .with_transfer_id(record.id.to_string());
            self.send(replay).await?;
        }
        self.send(Frame::ack(
            frame.transfer_id,
            format!("OK HISTORY {}", records.len()),
        ))
        .await
    }

    /// Look up a message the current user wrote.
    async fn own_message(&self, user: &str, transfer_id: &str) -> Result<MessageRecord> {
        let id = parse_id(transfer_id)?;
        let record = self
            .state
            .store
            .message(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
        if record.from != user {
            return Err(Error::Rejected(format!(
                "message {} belongs to another user",
                id
            )));
        }
        Ok(record)
    }

    async fn handle_edit(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        let record = self.own_message(&user, &frame.transfer_id).await?;
        if record.file_id.is_some() {
            return Err(Error::Rejected("file messages cannot be edited".into()));
        }

        let (tag, text) = reply::strip(&frame.body);
        let updated = self
            .state
            .store
            .edit_message(record.id, text, tag.or(record.reply_to))
            .await?;

        self.send(Frame::ack(updated.id.to_string(), "OK EDITED"))
            .await?;
        if let Some(peer) = self.peer(&updated.to) {
            let notice = Frame::new(FrameKind::EditMsg)
                .with_sender(updated.from.as_str())
                .with_recipient(updated.to.as_str())
                .with_body(reply::prepend(&updated.body, updated.reply_to))
                .with_transfer_id(updated.id.to_string());
            peer.send(notice);
        }
        Ok(())
    }

    async fn handle_delete_message(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        let record = self.own_message(&user, &frame.transfer_id).await?;

        match record.file_id {
            Some(file_id) => {
                self.state.store.delete_file(file_id).await?;
            }
            None => {
                self.state.store.delete_message(record.id).await?;
            }
        }

        self.send(Frame::ack(record.id.to_string(), "OK DELETED"))
            .await?;
        if let Some(peer) = self.peer(&record.to) {
            let notice = Frame::new(FrameKind::DeleteMsg)
                .with_sender(record.from.as_str())
                .with_recipient(record.to.as_str())
                .with_transfer_id(record.id.to_string());
            peer.send(notice);
        }
        Ok(())
    }

    async fn handle_search(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        let query = frame.body.trim();
        if query.is_empty() {
            return Err(Error::ProtocolViolation("empty search query".into()));
        }
        let peer = (!frame.recipient.is_empty()).then_some(frame.recipient.as_str());
        let hits = self
            .state
            .store
            .search(&user, peer, query, self.limit(frame.seq))
            .await?;

        for record in &hits {
            let hit = SearchHit {
                message_id: record.id,
                from: record.from.clone(),
                to: record.to.clone(),
                body: record.body.clone(),
                reply_to: record.reply_to,
                sent_at: record.sent_at.to_rfc3339(),
            };
            self.send(
                Frame::new(FrameKind::SearchHit)
                    .with_sender(record.from.as_str())
                    .with_recipient(record.to.as_str())
                    .with_body(to_body(&hit)?)
                    .with_transfer_id(record.id.to_string()),
            )
            .await?;
        }
        self.send(Frame::ack(
            frame.transfer_id,
            format!("OK SEARCH {}", hits.len()),
        ))
        .await
    }

    // =========================================================================
    // Files
    // =========================================================================

    async fn handle_file_history(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        if frame.recipient.is_empty() {
            return Err(Error::ProtocolViolation("FILE_HISTORY names no peer".into()));
        }
        let files = self
            .state
            .store
            .files_between(&user, &frame.recipient)
            .await?;
        for record in &files {
            self.send(event_frame(record)?).await?;
        }
        self.send(Frame::ack(
            frame.transfer_id,
            format!("OK FILE_HISTORY {}", files.len()),
        ))
        .await
    }

    async fn handle_delete_file(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        let id = parse_id(&frame.transfer_id)?;
        let record = self
            .state
            .store
            .file_by_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("file {}", id)))?;
        if record.from != user {
            return Err(Error::Rejected(format!("file {} belongs to another user", id)));
        }
        self.state.store.delete_file(id).await?;
        info!(conn = self.conn_id, file_id = id, "file deleted");
        self.send(Frame::ack(frame.transfer_id, "OK FILE_DELETED"))
            .await
    }

    async fn handle_download(&mut self, frame: Frame) -> Result<()> {
        let user = self.require_user()?;
        let request: DownloadRequest = from_body(&frame.body)?;
        let target = request
            .target()
            .ok_or_else(|| Error::ProtocolViolation("download request names no file".into()))?;

        let store = &self.state.store;
        let record = match &target {
            DownloadTarget::FileId(id) => store.file_by_id(*id).await?,
            DownloadTarget::MessageId(id) => store.file_by_message(*id).await?,
            DownloadTarget::Uuid(uuid) => store.file_by_uuid(uuid).await?,
        }
        .ok_or_else(|| Error::NotFound(format!("{:?}", target)))?;

        if record.from != user && record.to != user {
            return Err(Error::Rejected(format!(
                "file {} is not shared with {}",
                record.id, user
            )));
        }
        self.stream_file(&record).await
    }

    /// Send META then the blob in bounded chunks, the last one flagged.
    async fn stream_file(&self, record: &FileRecord) -> Result<()> {
        let mut file = File::open(&record.path)
            .await
            .map_err(|e| Error::Storage(format!("cannot open blob for file {}: {}", record.id, e)))?;
        let transfer_id = record.id.to_string();
        let meta = DownloadMeta {
            file_id: record.id,
            message_id: record.message_id,
            name: record.name.clone(),
            mime: record.mime.clone(),
            bytes: record.bytes,
        };
        self.send(
            Frame::new(record.media.meta_kind())
                .with_sender(record.from.as_str())
                .with_recipient(record.to.as_str())
                .with_body(to_body(&meta)?)
                .with_transfer_id(transfer_id.as_str()),
        )
        .await?;

        let chunk_size = self.state.config.chunk_size;
        let mut current = read_chunk(&mut file, chunk_size).await?;
        let mut seq = 0u32;
        loop {
            // Read one buffer ahead so the final chunk can carry `last`.
            let next = if current.len() < chunk_size {
                Bytes::new()
            } else {
                read_chunk(&mut file, chunk_size).await?
            };
            let last = next.is_empty();
            self.send(
                Frame::new(record.media.chunk_kind())
                    .with_transfer_id(transfer_id.as_str())
                    .with_seq(seq)
                    .with_last(last)
                    .with_bin(current),
            )
            .await?;
            if last {
                break;
            }
            current = next;
            seq += 1;
        }
        debug!(conn = self.conn_id, file_id = record.id, chunks = seq + 1, "download streamed");
        Ok(())
    }

    async fn handle_meta(&mut self, frame: Frame) -> Result<()> {
        self.require_user()?;

        if let Some(previous) = self.upload.take() {
            debug!(
                conn = self.conn_id,
                transfer_id = %previous.transfer_id,
                bytes = previous.bytes_written,
                "abandoning unfinished upload"
            );
        }

        let media = MediaKind::of_frame(frame.kind)
            .ok_or_else(|| Error::ProtocolViolation(format!("{:?} is not a META", frame.kind)))?;
        if frame.transfer_id.is_empty() {
            return Err(Error::ProtocolViolation("META without transfer id".into()));
        }

        let (reply_to, body) = reply::strip(&frame.body);
        let meta: TransferMeta = from_body(body)?;
        let to = if meta.to.is_empty() {
            frame.recipient.clone()
        } else {
            meta.to.clone()
        };
        if to.is_empty() {
            return Err(Error::ProtocolViolation("transfer names no recipient".into()));
        }

        let config = &self.state.config;
        if meta.size == 0 {
            return Err(Error::ProtocolViolation("declared size is zero".into()));
        }
        if meta.size > config.max_file_size {
            return Err(Error::ProtocolViolation(format!(
                "declared size {} exceeds maximum {}",
                meta.size, config.max_file_size
            )));
        }
        if media == MediaKind::Audio {
            if let Some(duration) = meta.duration_ms {
                if duration > config.max_audio_duration_ms {
                    return Err(Error::ProtocolViolation(format!(
                        "audio duration {}ms exceeds maximum {}ms",
                        duration, config.max_audio_duration_ms
                    )));
                }
            }
        }

        let staging = self.state.staging_dir();
        tokio::fs::create_dir_all(&staging)
            .await
            .map_err(|e| Error::Storage(format!("cannot create staging dir: {}", e)))?;
        let uuid = uuid::Uuid::new_v4().to_string();
        let path = staging.join(format!("{}.part", uuid));
        let guard = TempFileGuard::new(&path);
        let file = File::create(&path)
            .await
            .map_err(|e| Error::Storage(format!("cannot open upload sink: {}", e)))?;

        debug!(
            conn = self.conn_id,
            transfer_id = %frame.transfer_id,
            to = %to,
            size = meta.size,
            ?media,
            "upload opened"
        );
        self.upload = Some(Upload {
            transfer_id: frame.transfer_id,
            media,
            to,
            name: if meta.name.is_empty() {
                "file".to_string()
            } else {
                meta.name
            },
            mime: if meta.mime.trim().is_empty() {
                DEFAULT_MIME.to_string()
            } else {
                meta.mime
            },
            declared_size: meta.size,
            duration_ms: meta.duration_ms,
            reply_to,
            uuid,
            expected_seq: 0,
            bytes_written: 0,
            file,
            guard,
        });
        Ok(())
    }

    async fn handle_chunk(&mut self, frame: Frame) -> Result<()> {
        self.require_user()?;

        // Taken out of the slot: any early return below drops it, which aborts
        // the transfer and deletes the partial sink.
        let mut upload = self.upload.take().ok_or_else(|| {
            Error::ProtocolViolation(format!(
                "chunk for {} without a preceding META",
                frame.transfer_id
            ))
        })?;

        if frame.transfer_id != upload.transfer_id {
            return Err(Error::ProtocolViolation(format!(
                "chunk for transfer {} while {} is open",
                frame.transfer_id, upload.transfer_id
            )));
        }
        if MediaKind::of_frame(frame.kind) != Some(upload.media) {
            return Err(Error::ProtocolViolation(format!(
                "{:?} does not belong to a {:?} transfer",
                frame.kind, upload.media
            )));
        }
        if frame.seq != upload.expected_seq {
            return Err(Error::ProtocolViolation(format!(
                "out-of-order chunk: expected seq {}, got {}",
                upload.expected_seq, frame.seq
            )));
        }

        let data = frame.bin.unwrap_or_default();
        let total = upload.bytes_written + data.len() as u64;
        if total > upload.declared_size || total > self.state.config.max_file_size {
            return Err(Error::ProtocolViolation(format!(
                "transfer {} exceeds its size limit ({} > {})",
                upload.transfer_id, total, upload.declared_size
            )));
        }

        upload
            .file
            .write_all(&data)
            .await
            .map_err(|e| Error::Storage(format!("cannot write upload sink: {}", e)))?;
        upload.bytes_written = total;
        upload.expected_seq = upload
            .expected_seq
            .checked_add(1)
            .ok_or_else(|| Error::ProtocolViolation("chunk sequence overflow".into()))?;

        if frame.last {
            self.complete_upload(upload).await
        } else {
            self.upload = Some(upload);
            Ok(())
        }
    }

    async fn complete_upload(&mut self, upload: Upload) -> Result<()> {
        let user = self.require_user()?;
        let Upload {
            transfer_id,
            media,
            to,
            name,
            mime,
            duration_ms,
            reply_to,
            uuid,
            bytes_written,
            mut file,
            guard,
            ..
        } = upload;

        let flushed = match file.flush().await {
            Ok(()) => file.sync_all().await,
            Err(e) => Err(e),
        };
        flushed.map_err(|e| Error::Storage(format!("cannot flush upload sink: {}", e)))?;
        drop(file);

        let record = self
            .state
            .store
            .save_file(
                NewFile {
                    uuid,
                    from: user,
                    to,
                    name,
                    mime,
                    bytes: bytes_written,
                    media,
                    duration_ms,
                    reply_to,
                    delivered: false,
                },
                guard.path(),
            )
            .await?;
        // The store now owns the blob.
        guard.defuse();

        info!(
            conn = self.conn_id,
            transfer_id = %transfer_id,
            file_id = record.id,
            bytes = record.bytes,
            "upload complete"
        );
        let saved = FileSaved::new(record.message_id, record.id, record.bytes, record.mime.as_str());
        self.send(Frame::ack(transfer_id, to_body(&saved)?)).await?;

        self.push_stored(&record.to, record.message_id, event_frame(&record)?)
            .await?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(user) = self.user.take() {
            if self.state.registry.remove_if_owner(&user, self.conn_id) {
                debug!(conn = self.conn_id, user = %user, "went offline");
            }
        }
        if let Some(upload) = self.upload.take() {
            debug!(
                conn = self.conn_id,
                transfer_id = %upload.transfer_id,
                "connection ended mid-upload"
            );
        }
    }
}

fn parse_id(transfer_id: &str) -> Result<i64> {
    transfer_id
        .parse()
        .map_err(|_| Error::ProtocolViolation(format!("{:?} is not a numeric id", transfer_id)))
}

/// Live or queued delivery of a text message, reply tag restored.
fn dm_frame(record: &MessageRecord) -> Frame {
    Frame::new(FrameKind::Dm)
        .with_sender(record.from.as_str())
        .with_recipient(record.to.as_str())
        .with_body(reply::prepend(&record.body, record.reply_to))
        .with_transfer_id(record.id.to_string())
}

/// FILE_EVT / AUDIO_EVT announcing a stored file.
fn event_frame(record: &FileRecord) -> Result<Frame> {
    Ok(Frame::new(record.media.event_kind())
        .with_sender(record.from.as_str())
        .with_recipient(record.to.as_str())
        .with_body(to_body(&record.event())?)
        .with_transfer_id(record.id.to_string()))
}

/// Fill up to `size` bytes; shorter only at end of file.
async fn read_chunk(file: &mut File, size: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::Storage(format!("cannot read blob: {}", e)))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(Bytes::from(buf))
}
