//! Client side of the protocol.
//!
//! A [`Client`] owns one connection. Requests that the server correlates by
//! `transfer_id` (login, uploads, history...) wait for their ACK; everything
//! else the server pushes is surfaced on the [`ClientEvent`] channel returned
//! by [`Client::connect`].

pub mod download;
pub mod transfer;

pub use download::DownloadGuard;
pub use transfer::{OutboundTransfer, PayloadSource};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::body::{from_body, to_body, DownloadMeta, DownloadRequest, FileSaved};
use crate::protocol::{read_frame, write_frame, Frame, FrameKind};
use crate::reply;
use download::ActiveDownload;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Something the server sent that no request was waiting for.
#[derive(Debug)]
pub enum ClientEvent {
    /// DM, HISTORY, EDIT_MSG, DELETE_MSG, SEARCH_HIT, FILE_EVT or AUDIO_EVT.
    Incoming(Frame),
    /// An ACK nobody awaited, e.g. the `OK DM` / `OK QUEUED` for a DM.
    Ack(Frame),
    /// An ERROR nobody awaited.
    Error(Frame),
    DownloadFinished {
        file_id: i64,
        path: PathBuf,
        bytes: u64,
    },
    DownloadFailed {
        file_id: i64,
        reason: String,
    },
    Disconnected,
}

struct Shared {
    writer: tokio::sync::Mutex<BoxedWriter>,
    pending: Mutex<HashMap<String, oneshot::Sender<Frame>>>,
    downloads: DownloadGuard,
    /// Set once the reader has stopped; nothing will answer after that.
    closed: AtomicBool,
}

impl Shared {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Checked under the pending lock so a waiter is either refused here or
    /// dropped by [`Shared::shut`].
    fn register(&self, transfer_id: &str) -> Result<oneshot::Receiver<Frame>> {
        let mut pending = self.pending.lock();
        self.ensure_open()?;
        let (tx, rx) = oneshot::channel();
        pending.insert(transfer_id.to_string(), tx);
        Ok(rx)
    }

    /// Waiters see their oneshot dropped and report ConnectionClosed.
    fn shut(&self) {
        let mut pending = self.pending.lock();
        self.closed.store(true, Ordering::Release);
        pending.clear();
    }

    fn forget(&self, transfer_id: &str) {
        self.pending.lock().remove(transfer_id);
    }
}

pub struct Client {
    shared: Arc<Shared>,
    config: ClientConfig,
    user: Option<String>,
    reader: JoinHandle<()>,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream, config))
    }

    /// Run the client over any duplex byte stream.
    pub fn from_stream<S>(stream: S, config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let writer: BoxedWriter = Box::new(writer);
        let shared = Arc::new(Shared {
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            downloads: DownloadGuard::new(),
            closed: AtomicBool::new(false),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(reader, shared.clone(), events_tx));
        (
            Self {
                shared,
                config,
                user: None,
                reader,
            },
            events_rx,
        )
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.shared.ensure_open()?;
        let mut writer = self.shared.writer.lock().await;
        write_frame(&mut *writer, frame).await
    }

    fn sender(&self) -> &str {
        self.user.as_deref().unwrap_or_default()
    }

    /// Send `frame` and wait for the ACK carrying its `transfer_id`.
    async fn request(&self, frame: Frame) -> Result<String> {
        let transfer_id = frame.transfer_id.clone();
        let rx = self.shared.register(&transfer_id)?;
        if let Err(e) = self.send_frame(&frame).await {
            self.shared.forget(&transfer_id);
            return Err(e);
        }
        match tokio::time::timeout(self.config.ack_timeout(), rx).await {
            Ok(Ok(reply)) => into_ack(reply),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.shared.forget(&transfer_id);
                Err(Error::TransferTimeout {
                    transfer_id,
                    attempts: 1,
                })
            }
        }
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<()> {
        self.request(
            Frame::new(FrameKind::Register)
                .with_sender(username)
                .with_body(password)
                .with_transfer_id(new_request_id()),
        )
        .await?;
        Ok(())
    }

    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.request(
            Frame::new(FrameKind::Login)
                .with_sender(username)
                .with_body(password)
                .with_transfer_id(new_request_id()),
        )
        .await?;
        info!(user = username, "logged in");
        self.user = Some(username.to_string());
        Ok(())
    }

    /// Fire-and-forget; the server's `OK DM`/`OK QUEUED` arrives as [`ClientEvent::Ack`].
    pub async fn send_dm(&self, to: &str, body: &str, reply_to: Option<i64>) -> Result<()> {
        self.send_frame(
            &Frame::new(FrameKind::Dm)
                .with_sender(self.sender())
                .with_recipient(to)
                .with_body(reply::prepend(body, reply_to)),
        )
        .await
    }

    /// Replayed lines arrive as events before this returns their count.
    pub async fn history(&self, peer: &str, limit: u32) -> Result<usize> {
        let ack = self
            .request(
                Frame::new(FrameKind::History)
                    .with_sender(self.sender())
                    .with_recipient(peer)
                    .with_seq(limit)
                    .with_transfer_id(new_request_id()),
            )
            .await?;
        Ok(trailing_count(&ack))
    }

    pub async fn search(&self, query: &str, peer: Option<&str>, limit: u32) -> Result<usize> {
        let ack = self
            .request(
                Frame::new(FrameKind::Search)
                    .with_sender(self.sender())
                    .with_recipient(peer.unwrap_or_default())
                    .with_body(query)
                    .with_seq(limit)
                    .with_transfer_id(new_request_id()),
            )
            .await?;
        Ok(trailing_count(&ack))
    }

    pub async fn file_history(&self, peer: &str) -> Result<usize> {
        let ack = self
            .request(
                Frame::new(FrameKind::FileHistory)
                    .with_sender(self.sender())
                    .with_recipient(peer)
                    .with_transfer_id(new_request_id()),
            )
            .await?;
        Ok(trailing_count(&ack))
    }

    pub async fn edit_message(&self, message_id: i64, body: &str, reply_to: Option<i64>) -> Result<()> {
        self.request(
            Frame::new(FrameKind::EditMsg)
                .with_sender(self.sender())
                .with_body(reply::prepend(body, reply_to))
                .with_transfer_id(message_id.to_string()),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_message(&self, message_id: i64) -> Result<()> {
        self.request(
            Frame::new(FrameKind::DeleteMsg)
                .with_sender(self.sender())
                .with_transfer_id(message_id.to_string()),
        )
        .await?;
        Ok(())
    }

    pub async fn delete_file(&self, file_id: i64) -> Result<()> {
        self.request(
            Frame::new(FrameKind::DeleteFile)
                .with_sender(self.sender())
                .with_transfer_id(file_id.to_string()),
        )
        .await?;
        Ok(())
    }

    /// Ask for a file to be streamed into `dest_dir`.
    ///
    /// Returns false without sending anything if a download of `file_id` is
    /// already in flight. Completion is reported as
    /// [`ClientEvent::DownloadFinished`] or [`ClientEvent::DownloadFailed`].
    pub async fn request_download(&self, file_id: i64, dest_dir: &Path) -> Result<bool> {
        if !self.shared.downloads.try_begin(file_id, dest_dir) {
            debug!(file_id, "download already in flight");
            return Ok(false);
        }
        let frame = Frame::new(FrameKind::DownloadFile)
            .with_sender(self.sender())
            .with_body(to_body(&DownloadRequest::by_file(file_id))?)
            .with_transfer_id(file_id.to_string());
        if let Err(e) = self.send_frame(&frame).await {
            self.shared.downloads.finish(file_id);
            return Err(e);
        }
        Ok(true)
    }

    /// Whether the server side has gone away.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn download_in_flight(&self, file_id: i64) -> bool {
        self.shared.downloads.is_in_flight(file_id)
    }

    /// Upload `transfer` and wait for the server to confirm it.
    ///
    /// Each attempt sends META and every chunk, then waits up to the ACK
    /// timeout. Timeouts and local read failures are retried with the same
    /// `transfer_id` until `max_attempts` attempts have been made; an ERROR
    /// reply is final.
    pub async fn send_with_ack(&self, transfer: &OutboundTransfer) -> Result<FileSaved> {
        let size = transfer.validate(&self.config).await?;
        let meta = transfer.meta_frame(self.sender(), size)?;
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_transfer(transfer, &meta, size).await {
                Ok(saved) => {
                    info!(
                        transfer_id = %transfer.transfer_id,
                        file_id = saved.file_id,
                        attempt,
                        "transfer acknowledged"
                    );
                    return Ok(saved);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        transfer_id = %transfer.transfer_id,
                        attempt,
                        "{}; retrying",
                        e
                    );
                    tokio::time::sleep(self.config.retry_backoff()).await;
                }
                Err(Error::TransferTimeout { transfer_id, .. }) => {
                    return Err(Error::TransferTimeout {
                        transfer_id,
                        attempts: attempt,
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_transfer(
        &self,
        transfer: &OutboundTransfer,
        meta: &Frame,
        size: u64,
    ) -> Result<FileSaved> {
        let transfer_id = transfer.transfer_id.as_str();
        let rx = self.shared.register(transfer_id)?;
        if let Err(e) = self.stream_transfer(transfer, meta, size).await {
            self.shared.forget(transfer_id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.ack_timeout(), rx).await {
            Ok(Ok(reply)) => {
                let body = into_ack(reply)?;
                from_body(&body)
            }
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            Err(_) => {
                self.shared.forget(transfer_id);
                Err(Error::TransferTimeout {
                    transfer_id: transfer_id.to_string(),
                    attempts: 1,
                })
            }
        }
    }

    /// META plus all chunks under one writer lock so nothing interleaves.
    async fn stream_transfer(&self, transfer: &OutboundTransfer, meta: &Frame, size: u64) -> Result<()> {
        let mut payload = transfer.open().await?;
        let mut writer = self.shared.writer.lock().await;
        write_frame(&mut *writer, meta).await?;

        let chunk_kind = transfer.media.chunk_kind();
        let chunk_size = self.config.chunk_size as u64;
        let mut sent = 0u64;
        let mut seq = 0u32;
        loop {
            let want = chunk_size.min(size - sent) as usize;
            let chunk = payload.next_chunk(want).await?;
            if chunk.is_empty() {
                return Err(Error::TransferIo(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("payload ended after {} of {} bytes", sent, size),
                )));
            }
            sent += chunk.len() as u64;
            let last = sent >= size;
            let frame = Frame::new(chunk_kind)
                .with_transfer_id(transfer.transfer_id.as_str())
                .with_seq(seq)
                .with_last(last)
                .with_bin(chunk);
            write_frame(&mut *writer, &frame).await?;
            if last {
                break;
            }
            seq += 1;
        }
        debug!(transfer_id = %transfer.transfer_id, chunks = seq + 1, bytes = sent, "transfer sent");
        Ok(())
    }

    /// Shut down the write side; the server then closes the connection.
    pub async fn close(&self) -> Result<()> {
        self.shared.writer.lock().await.shutdown().await?;
        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn into_ack(reply: Frame) -> Result<String> {
    match reply.kind {
        FrameKind::Ack => Ok(reply.body),
        _ => Err(Error::Rejected(reply.body)),
    }
}

/// `OK HISTORY 3` -> 3
fn trailing_count(ack: &str) -> usize {
    ack.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

async fn read_loop<R>(mut reader: R, shared: Arc<Shared>, events: mpsc::UnboundedSender<ClientEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut active: HashMap<String, ActiveDownload> = HashMap::new();

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("{}", e);
                break;
            }
        };

        match frame.kind {
            FrameKind::Ack | FrameKind::Error => {
                let waiter = shared.pending.lock().remove(&frame.transfer_id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(frame);
                    continue;
                }
                match (frame.kind, download_id(&shared, &frame)) {
                    (FrameKind::Error, Some(file_id)) => {
                        active.remove(&frame.transfer_id);
                        fail_download(&shared, &events, file_id, frame.body);
                    }
                    (FrameKind::Ack, _) => {
                        let _ = events.send(ClientEvent::Ack(frame));
                    }
                    _ => {
                        let _ = events.send(ClientEvent::Error(frame));
                    }
                }
            }
            kind if kind.is_meta() => match download_id(&shared, &frame) {
                Some(file_id) => {
                    let started = match shared.downloads.dest_dir(file_id) {
                        Some(dir) => match from_body::<DownloadMeta>(&frame.body) {
                            Ok(meta) => ActiveDownload::start(&dir, &meta).await,
                            Err(e) => Err(e),
                        },
                        None => Err(Error::NotFound(format!("download {}", file_id))),
                    };
                    match started {
                        Ok(dl) => {
                            active.insert(frame.transfer_id, dl);
                        }
                        Err(e) => fail_download(&shared, &events, file_id, e.to_string()),
                    }
                }
                None => {
                    let _ = events.send(ClientEvent::Incoming(frame));
                }
            },
            kind if kind.is_chunk() => {
                let Some(mut dl) = active.remove(&frame.transfer_id) else {
                    debug!(transfer_id = %frame.transfer_id, "chunk for no active download");
                    continue;
                };
                let data = frame.bin.clone().unwrap_or_default();
                if let Err(e) = dl.write_chunk(frame.seq, &data).await {
                    fail_download(&shared, &events, dl.file_id, e.to_string());
                    continue;
                }
                if !frame.last {
                    active.insert(frame.transfer_id, dl);
                    continue;
                }
                let file_id = dl.file_id;
                shared.downloads.finish(file_id);
                match dl.finish().await {
                    Ok((path, bytes)) => {
                        info!(file_id, path = %path.display(), bytes, "download finished");
                        let _ = events.send(ClientEvent::DownloadFinished {
                            file_id,
                            path,
                            bytes,
                        });
                    }
                    Err(e) => fail_download(&shared, &events, file_id, e.to_string()),
                }
            }
            _ => {
                let _ = events.send(ClientEvent::Incoming(frame));
            }
        }
    }

    shared.shut();
    drop(active);
    for file_id in shared.downloads.drain() {
        let _ = events.send(ClientEvent::DownloadFailed {
            file_id,
            reason: Error::ConnectionClosed.to_string(),
        });
    }
    let _ = events.send(ClientEvent::Disconnected);
}

/// The file id of an in-flight download this frame belongs to.
fn download_id(shared: &Shared, frame: &Frame) -> Option<i64> {
    frame
        .transfer_id
        .parse()
        .ok()
        .filter(|id| shared.downloads.is_in_flight(*id))
}

fn fail_download(
    shared: &Shared,
    events: &mpsc::UnboundedSender<ClientEvent>,
    file_id: i64,
    reason: String,
) {
    warn!(file_id, "download failed: {}", reason);
    shared.downloads.finish(file_id);
    let _ = events.send(ClientEvent::DownloadFailed { file_id, reason });
}
