//! JSON bodies carried by structured frame kinds.
//!
//! Bodies stay flat objects of strings, integers and nulls so any peer can
//! parse them by hand.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn to_body<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Parse a body, reporting bad JSON as a protocol violation.
pub fn from_body<T: DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| Error::ProtocolViolation(format!("bad body: {}", e)))
}

/// MIME type assumed when a META names none.
pub const DEFAULT_MIME: &str = "application/octet-stream";

fn default_mime() -> String {
    DEFAULT_MIME.to_string()
}

/// FILE_META / AUDIO_META sent by a client before its chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMeta {
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_mime")]
    pub mime: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u32>,
}

/// ACK body for a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSaved {
    pub status: String,
    pub message_id: i64,
    pub file_id: i64,
    pub bytes: u64,
    pub mime: String,
}

impl FileSaved {
    pub const STATUS: &'static str = "FILE_SAVED";

    pub fn new(message_id: i64, file_id: i64, bytes: u64, mime: impl Into<String>) -> Self {
        Self {
            status: Self::STATUS.to_string(),
            message_id,
            file_id,
            bytes,
            mime: mime.into(),
        }
    }
}

/// FILE_EVT / AUDIO_EVT body describing a stored transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEvent {
    pub from: String,
    pub to: String,
    pub uuid: String,
    pub file_id: i64,
    pub message_id: i64,
    pub reply_to: Option<i64>,
    pub name: String,
    pub mime: String,
    pub bytes: u64,
}

/// DOWNLOAD_FILE request. Exactly one of the keys is expected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// What a download request resolves against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    FileId(i64),
    MessageId(i64),
    Uuid(String),
}

impl DownloadRequest {
    pub fn by_file(file_id: i64) -> Self {
        Self {
            file_id: Some(file_id),
            ..Default::default()
        }
    }

    pub fn by_message(message_id: i64) -> Self {
        Self {
            message_id: Some(message_id),
            ..Default::default()
        }
    }

    pub fn by_uuid(uuid: impl Into<String>) -> Self {
        Self {
            id: Some(uuid.into()),
            ..Default::default()
        }
    }

    /// File id wins over message id, which wins over the legacy uuid.
    pub fn target(&self) -> Option<DownloadTarget> {
        if let Some(id) = self.file_id {
            Some(DownloadTarget::FileId(id))
        } else if let Some(id) = self.message_id {
            Some(DownloadTarget::MessageId(id))
        } else {
            self.id.clone().map(DownloadTarget::Uuid)
        }
    }
}

/// META sent by the server in front of a download stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMeta {
    pub file_id: i64,
    pub message_id: i64,
    pub name: String,
    pub mime: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub message_id: i64,
    pub from: String,
    pub to: String,
    pub body: String,
    pub reply_to: Option<i64>,
    pub sent_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_saved_wire_shape() {
        let ack = FileSaved::new(12, 4, 3, "application/octet-stream");
        assert_eq!(
            to_body(&ack).unwrap(),
            r#"{"status":"FILE_SAVED","messageId":12,"fileId":4,"bytes":3,"mime":"application/octet-stream"}"#
        );
    }

    #[test]
    fn test_transfer_meta_without_mime() {
        let meta: TransferMeta = from_body(r#"{"name":"a.bin","size":3}"#).unwrap();
        assert_eq!(meta.mime, DEFAULT_MIME);
        assert_eq!(meta.name, "a.bin");

        let err = from_body::<TransferMeta>(r#"{"name":"a.bin"}"#).unwrap_err();
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn test_file_event_null_reply() {
        let evt = FileEvent {
            from: "alice".into(),
            to: "bob".into(),
            uuid: "u-1".into(),
            file_id: 1,
            message_id: 2,
            reply_to: None,
            name: "a.bin".into(),
            mime: "application/octet-stream".into(),
            bytes: 3,
        };
        let body = to_body(&evt).unwrap();
        assert!(body.contains(r#""replyTo":null"#));
        let back: FileEvent = from_body(&body).unwrap();
        assert_eq!(back, evt);
    }

    #[test]
    fn test_download_request_variants() {
        let by_file: DownloadRequest = from_body(r#"{"fileId":5}"#).unwrap();
        assert_eq!(by_file.target(), Some(DownloadTarget::FileId(5)));

        let by_msg: DownloadRequest = from_body(r#"{"messageId":9}"#).unwrap();
        assert_eq!(by_msg.target(), Some(DownloadTarget::MessageId(9)));

        let legacy: DownloadRequest = from_body(r#"{"id":"3f2a-11"}"#).unwrap();
        assert_eq!(legacy.target(), Some(DownloadTarget::Uuid("3f2a-11".into())));

        let empty: DownloadRequest = from_body("{}").unwrap();
        assert_eq!(empty.target(), None);

        assert_eq!(to_body(&DownloadRequest::by_file(5)).unwrap(), r#"{"fileId":5}"#);
    }

    #[test]
    fn test_transfer_meta_optional_fields() {
        let meta: TransferMeta =
            from_body(r#"{"name":"a.bin","mime":"application/octet-stream","size":3}"#).unwrap();
        assert_eq!(meta.to, "");
        assert_eq!(meta.duration_ms, None);

        let audio = TransferMeta {
            to: "bob".into(),
            name: "note.ogg".into(),
            mime: "audio/ogg".into(),
            size: 2048,
            duration_ms: Some(4_000),
        };
        assert!(to_body(&audio).unwrap().contains(r#""durationMs":4000"#));
    }

    #[test]
    fn test_bad_json_is_protocol_violation() {
        let err = from_body::<TransferMeta>("{not json").unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }
}
