//! Outbound file and audio transfers.

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::protocol::body::{to_body, TransferMeta, DEFAULT_MIME};
use crate::protocol::Frame;
use crate::reply;
use crate::store::MediaKind;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Where the bytes of a transfer come from.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    Path(PathBuf),
    Memory(Bytes),
}

/// One upload, reusable across retries under the same `transfer_id`.
#[derive(Debug, Clone)]
pub struct OutboundTransfer {
    pub recipient: String,
    pub source: PayloadSource,
    pub name: String,
    pub mime: String,
    pub media: MediaKind,
    pub duration_ms: Option<u32>,
    pub reply_to: Option<i64>,
    pub transfer_id: String,
}

impl OutboundTransfer {
    /// A file upload named after the last component of `path`.
    pub fn file(recipient: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Self::new(recipient, PayloadSource::Path(path), name, MediaKind::File)
    }

    pub fn audio(recipient: impl Into<String>, data: impl Into<Bytes>, duration_ms: u32) -> Self {
        let mut transfer = Self::new(
            recipient,
            PayloadSource::Memory(data.into()),
            "voice-note",
            MediaKind::Audio,
        );
        transfer.duration_ms = Some(duration_ms);
        transfer
    }

    pub fn new(
        recipient: impl Into<String>,
        source: PayloadSource,
        name: impl Into<String>,
        media: MediaKind,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            source,
            name: name.into(),
            mime: DEFAULT_MIME.to_string(),
            media,
            duration_ms: None,
            reply_to: None,
            transfer_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = mime.into();
        self
    }

    pub fn with_reply_to(mut self, message_id: i64) -> Self {
        self.reply_to = Some(message_id);
        self
    }

    /// Local checks; returns the payload size. Nothing is sent on failure.
    pub async fn validate(&self, config: &ClientConfig) -> Result<u64> {
        if self.recipient.is_empty() {
            return Err(Error::InvalidPayload("no recipient".into()));
        }
        let size = match &self.source {
            PayloadSource::Memory(bytes) => bytes.len() as u64,
            PayloadSource::Path(path) => {
                let meta = tokio::fs::metadata(path).await.map_err(Error::TransferIo)?;
                if !meta.is_file() {
                    return Err(Error::InvalidPayload(format!(
                        "{} is not a regular file",
                        path.display()
                    )));
                }
                meta.len()
            }
        };
        if size == 0 {
            return Err(Error::InvalidPayload("payload is empty".into()));
        }
        if size > config.max_file_size {
            return Err(Error::InvalidPayload(format!(
                "payload is {} bytes, limit is {}",
                size, config.max_file_size
            )));
        }
        if self.media == MediaKind::Audio {
            match self.duration_ms {
                Some(d) if d > config.max_audio_duration_ms => {
                    return Err(Error::InvalidPayload(format!(
                        "audio is {}ms, limit is {}ms",
                        d, config.max_audio_duration_ms
                    )))
                }
                _ => {}
            }
        }
        Ok(size)
    }

    pub(crate) fn meta_frame(&self, sender: &str, size: u64) -> Result<Frame> {
        let meta = TransferMeta {
            to: self.recipient.clone(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            size,
            duration_ms: self.duration_ms,
        };
        Ok(Frame::new(self.media.meta_kind())
            .with_sender(sender)
            .with_recipient(self.recipient.as_str())
            .with_body(reply::prepend(&to_body(&meta)?, self.reply_to))
            .with_transfer_id(self.transfer_id.as_str()))
    }

    pub(crate) async fn open(&self) -> Result<PayloadReader> {
        match &self.source {
            PayloadSource::Memory(bytes) => Ok(PayloadReader::Memory(bytes.clone())),
            PayloadSource::Path(path) => open_file(path).await.map(PayloadReader::File),
        }
    }
}

async fn open_file(path: &Path) -> Result<File> {
    File::open(path).await.map_err(Error::TransferIo)
}

pub(crate) enum PayloadReader {
    Memory(Bytes),
    File(File),
}

impl PayloadReader {
    /// Up to `max` bytes; empty at end of input.
    pub async fn next_chunk(&mut self, max: usize) -> Result<Bytes> {
        match self {
            PayloadReader::Memory(rest) => {
                let n = max.min(rest.len());
                Ok(rest.split_to(n))
            }
            PayloadReader::File(file) => {
                let mut buf = vec![0u8; max];
                let mut filled = 0;
                while filled < max {
                    let n = file
                        .read(&mut buf[filled..])
                        .await
                        .map_err(Error::TransferIo)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(Bytes::from(buf))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::body::from_body;
    use crate::protocol::FrameKind;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_validation_rejects_before_io() {
        let config = ClientConfig {
            max_file_size: 4,
            ..Default::default()
        };
        let empty = OutboundTransfer::new("bob", PayloadSource::Memory(Bytes::new()), "x", MediaKind::File);
        assert!(matches!(empty.validate(&config).await, Err(Error::InvalidPayload(_))));

        let big = OutboundTransfer::new(
            "bob",
            PayloadSource::Memory(Bytes::from_static(b"12345")),
            "x",
            MediaKind::File,
        );
        assert!(matches!(big.validate(&config).await, Err(Error::InvalidPayload(_))));

        let long_audio = OutboundTransfer::audio("bob", Bytes::from_static(b"ogg"), 30_001);
        assert!(matches!(long_audio.validate(&config).await, Err(Error::InvalidPayload(_))));

        let missing = OutboundTransfer::file("bob", "/definitely/not/here.bin");
        assert!(matches!(missing.validate(&config).await, Err(Error::TransferIo(_))));
    }

    #[tokio::test]
    async fn test_file_source_reads_in_chunks() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("data.bin");
        std::fs::write(&path, b"abcdefg").unwrap();

        let transfer = OutboundTransfer::file("bob", &path);
        assert_eq!(transfer.name, "data.bin");
        assert_eq!(transfer.validate(&ClientConfig::default()).await.unwrap(), 7);

        let mut reader = transfer.open().await.unwrap();
        assert_eq!(reader.next_chunk(3).await.unwrap(), "abc");
        assert_eq!(reader.next_chunk(3).await.unwrap(), "def");
        assert_eq!(reader.next_chunk(3).await.unwrap(), "g");
        assert!(reader.next_chunk(3).await.unwrap().is_empty());
    }

    #[test]
    fn test_meta_frame_carries_reply_tag() {
        let transfer = OutboundTransfer::audio("bob", Bytes::from_static(b"ogg"), 1200)
            .with_mime("audio/ogg")
            .with_reply_to(12);
        let frame = transfer.meta_frame("alice", 3).unwrap();
        assert_eq!(frame.kind, FrameKind::AudioMeta);
        assert_eq!(frame.transfer_id, transfer.transfer_id);

        let (tag, body) = reply::strip(&frame.body);
        assert_eq!(tag, Some(12));
        let meta: TransferMeta = from_body(body).unwrap();
        assert_eq!(meta.size, 3);
        assert_eq!(meta.duration_ms, Some(1200));
        assert_eq!(meta.to, "bob");
    }
}
