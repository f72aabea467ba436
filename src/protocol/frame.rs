//! Frame type and its binary layout.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Frame format: len:u32 | kind:u8 | payload
//!
//! Payload layout:
//! sender(u16 len + UTF-8) | recipient(u16 len + UTF-8) | body(u32 len + UTF-8)
//! | transfer_id(u16 len + UTF-8) | seq:u32 | flags:u8 | [bin_len:u32 | bin]

use crate::error::{Error, Result};
use crate::protocol::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the `len:u32 | kind:u8` header in front of every payload.
pub const HEADER_LEN: usize = 5;

// =============================================================================
// Frame kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Login = 0,
    Register = 1,
    Dm = 2,
    Ack = 3,
    Error = 4,
    History = 5,
    FileMeta = 9,
    FileChunk = 10,
    AudioMeta = 11,
    AudioChunk = 12,
    FileEvt = 13,
    AudioEvt = 14,
    DownloadFile = 30,
    DeleteMsg = 31,
    EditMsg = 32,
    Search = 33,
    SearchHit = 34,
    FileHistory = 35,
    DeleteFile = 36,
}

impl FrameKind {
    pub const ALL: [FrameKind; 19] = [
        Self::Login,
        Self::Register,
        Self::Dm,
        Self::Ack,
        Self::Error,
        Self::History,
        Self::FileMeta,
        Self::FileChunk,
        Self::AudioMeta,
        Self::AudioChunk,
        Self::FileEvt,
        Self::AudioEvt,
        Self::DownloadFile,
        Self::DeleteMsg,
        Self::EditMsg,
        Self::Search,
        Self::SearchHit,
        Self::FileHistory,
        Self::DeleteFile,
    ];

    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Login),
            1 => Some(Self::Register),
            2 => Some(Self::Dm),
            3 => Some(Self::Ack),
            4 => Some(Self::Error),
            5 => Some(Self::History),
            9 => Some(Self::FileMeta),
            10 => Some(Self::FileChunk),
            11 => Some(Self::AudioMeta),
            12 => Some(Self::AudioChunk),
            13 => Some(Self::FileEvt),
            14 => Some(Self::AudioEvt),
            30 => Some(Self::DownloadFile),
            31 => Some(Self::DeleteMsg),
            32 => Some(Self::EditMsg),
            33 => Some(Self::Search),
            34 => Some(Self::SearchHit),
            35 => Some(Self::FileHistory),
            36 => Some(Self::DeleteFile),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn is_meta(self) -> bool {
        matches!(self, Self::FileMeta | Self::AudioMeta)
    }

    pub fn is_chunk(self) -> bool {
        matches!(self, Self::FileChunk | Self::AudioChunk)
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        const LAST = 1 << 0;
        const HAS_BIN = 1 << 1;
    }
}

// =============================================================================
// Frame
// =============================================================================

/// The atomic unit of the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub sender: String,
    pub recipient: String,
    pub body: String,
    /// Correlation id: a generated opaque id or a decimal message/file id.
    pub transfer_id: String,
    /// Chunk sequence on chunk kinds, a generic integer argument otherwise.
    pub seq: u32,
    pub last: bool,
    pub bin: Option<Bytes>,
}

impl Frame {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            sender: String::new(),
            recipient: String::new(),
            body: String::new(),
            transfer_id: String::new(),
            seq: 0,
            last: false,
            bin: None,
        }
    }

    /// ACK correlated by `transfer_id`.
    pub fn ack(transfer_id: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(FrameKind::Ack)
            .with_transfer_id(transfer_id)
            .with_body(body)
    }

    /// ERROR correlated by `transfer_id`.
    pub fn error(transfer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FrameKind::Error)
            .with_transfer_id(transfer_id)
            .with_body(message)
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_recipient(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = recipient.into();
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_transfer_id(mut self, transfer_id: impl Into<String>) -> Self {
        self.transfer_id = transfer_id.into();
        self
    }

    pub fn with_seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn with_last(mut self, last: bool) -> Self {
        self.last = last;
        self
    }

    pub fn with_bin(mut self, bin: impl Into<Bytes>) -> Self {
        self.bin = Some(bin.into());
        self
    }

    fn flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        if self.last {
            flags |= FrameFlags::LAST;
        }
        if self.bin.is_some() {
            flags |= FrameFlags::HAS_BIN;
        }
        flags
    }

    fn payload_len(&self) -> usize {
        let mut len = 2 + self.sender.len()
            + 2 + self.recipient.len()
            + 4 + self.body.len()
            + 2 + self.transfer_id.len()
            + 4
            + 1;
        if let Some(bin) = &self.bin {
            len += 4 + bin.len();
        }
        len
    }

    /// Encode the full frame, header included.
    pub fn encode(&self) -> Result<Bytes> {
        for (field, value) in [
            ("sender", &self.sender),
            ("recipient", &self.recipient),
            ("transfer_id", &self.transfer_id),
        ] {
            if value.len() > u16::MAX as usize {
                return Err(Error::MalformedFrame(format!(
                    "{} is {} bytes, limit is {}",
                    field,
                    value.len(),
                    u16::MAX
                )));
            }
        }

        let payload_len = self.payload_len();
        if payload_len > MAX_FRAME_SIZE as usize {
            return Err(Error::MalformedFrame(format!(
                "frame payload {} exceeds maximum {}",
                payload_len, MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_len);
        buf.put_u32(payload_len as u32);
        buf.put_u8(self.kind.code());
        put_str16(&mut buf, &self.sender);
        put_str16(&mut buf, &self.recipient);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(self.body.as_bytes());
        put_str16(&mut buf, &self.transfer_id);
        buf.put_u32(self.seq);
        buf.put_u8(self.flags().bits());
        if let Some(bin) = &self.bin {
            buf.put_u32(bin.len() as u32);
            buf.put_slice(bin);
        }

        Ok(buf.freeze())
    }

    /// Decode a payload that followed a `len | kind` header.
    pub fn decode(kind: FrameKind, mut payload: Bytes) -> Result<Self> {
        let sender = get_str16(&mut payload, "sender")?;
        let recipient = get_str16(&mut payload, "recipient")?;

        ensure_remaining(&payload, 4, "body length")?;
        let body_len = payload.get_u32() as usize;
        let body = get_utf8(&mut payload, body_len, "body")?;

        let transfer_id = get_str16(&mut payload, "transfer_id")?;

        ensure_remaining(&payload, 5, "seq and flags")?;
        let seq = payload.get_u32();
        let raw_flags = payload.get_u8();
        let flags = FrameFlags::from_bits(raw_flags)
            .ok_or_else(|| Error::MalformedFrame(format!("unknown flag bits {:#04x}", raw_flags)))?;

        let bin = if flags.contains(FrameFlags::HAS_BIN) {
            ensure_remaining(&payload, 4, "bin length")?;
            let len = payload.get_u32() as usize;
            ensure_remaining(&payload, len, "bin")?;
            Some(payload.copy_to_bytes(len))
        } else {
            None
        };

        if payload.has_remaining() {
            return Err(Error::MalformedFrame(format!(
                "{} trailing bytes after {:?} frame",
                payload.remaining(),
                kind
            )));
        }

        Ok(Self {
            kind,
            sender,
            recipient,
            body,
            transfer_id,
            seq,
            last: flags.contains(FrameFlags::LAST),
            bin,
        })
    }
}

fn put_str16(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn ensure_remaining(payload: &Bytes, need: usize, field: &str) -> Result<()> {
    if payload.remaining() < need {
        return Err(Error::MalformedFrame(format!(
            "{} truncated: expected {} bytes, got {}",
            field,
            need,
            payload.remaining()
        )));
    }
    Ok(())
}

fn get_str16(payload: &mut Bytes, field: &str) -> Result<String> {
    ensure_remaining(payload, 2, field)?;
    let len = payload.get_u16() as usize;
    get_utf8(payload, len, field)
}

fn get_utf8(payload: &mut Bytes, len: usize, field: &str) -> Result<String> {
    ensure_remaining(payload, len, field)?;
    String::from_utf8(payload.copy_to_bytes(len).to_vec())
        .map_err(|_| Error::MalformedFrame(format!("invalid UTF-8 in {}", field)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(encoded: &Bytes) -> Bytes {
        encoded.slice(HEADER_LEN..)
    }

    #[test]
    fn test_chunk_roundtrip() {
        let frame = Frame::new(FrameKind::FileChunk)
            .with_sender("alice")
            .with_recipient("bob")
            .with_transfer_id("f1")
            .with_seq(7)
            .with_last(true)
            .with_bin(vec![1u8, 2, 3]);
        let encoded = frame.encode().unwrap();

        assert_eq!(encoded[4], FrameKind::FileChunk.code());
        let declared = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
        assert_eq!(declared as usize, encoded.len() - HEADER_LEN);

        let decoded = Frame::decode(FrameKind::FileChunk, payload_of(&encoded)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_empty_bin_differs_from_absent_bin() {
        let with_empty = Frame::new(FrameKind::AudioChunk).with_bin(Bytes::new());
        let without = Frame::new(FrameKind::AudioChunk);

        let a = Frame::decode(FrameKind::AudioChunk, payload_of(&with_empty.encode().unwrap()))
            .unwrap();
        let b = Frame::decode(FrameKind::AudioChunk, payload_of(&without.encode().unwrap()))
            .unwrap();

        assert_eq!(a.bin, Some(Bytes::new()));
        assert_eq!(b.bin, None);
    }

    #[test]
    fn test_unicode_body_roundtrip() {
        let frame = Frame::new(FrameKind::Dm)
            .with_sender("zoë")
            .with_recipient("bob")
            .with_body("[REPLY:12]héllo 👋");
        let decoded =
            Frame::decode(FrameKind::Dm, payload_of(&frame.encode().unwrap())).unwrap();
        assert_eq!(decoded.body, "[REPLY:12]héllo 👋");
        assert_eq!(decoded.sender, "zoë");
    }

    #[test]
    fn test_truncated_string_is_malformed() {
        let frame = Frame::new(FrameKind::Dm).with_sender("alice").with_body("hi");
        let encoded = frame.encode().unwrap();
        // Cut the payload inside the sender string.
        let cut = encoded.slice(HEADER_LEN..HEADER_LEN + 4);
        let err = Frame::decode(FrameKind::Dm, cut).unwrap_err();
        assert!(matches!(err, Error::MalformedFrame(_)));
    }

    #[test]
    fn test_bin_length_beyond_payload_is_malformed() {
        let frame = Frame::new(FrameKind::FileChunk).with_bin(vec![9u8; 8]);
        let encoded = frame.encode().unwrap();
        let short = encoded.slice(HEADER_LEN..encoded.len() - 3);
        assert!(matches!(
            Frame::decode(FrameKind::FileChunk, short),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_are_malformed() {
        let frame = Frame::new(FrameKind::Ack).with_body("OK DM");
        let mut payload = BytesMut::from(&frame.encode().unwrap()[HEADER_LEN..]);
        payload.put_u8(0xAA);
        assert!(matches!(
            Frame::decode(FrameKind::Ack, payload.freeze()),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_flag_bits_are_malformed() {
        let frame = Frame::new(FrameKind::Ack);
        let mut raw = frame.encode().unwrap().to_vec();
        let flags_at = raw.len() - 1;
        raw[flags_at] = 0b1000_0000;
        let payload = Bytes::from(raw).slice(HEADER_LEN..);
        assert!(matches!(
            Frame::decode(FrameKind::Ack, payload),
            Err(Error::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_oversized_sender_rejected_at_encode() {
        let frame = Frame::new(FrameKind::Dm).with_sender("x".repeat(70_000));
        assert!(matches!(frame.encode(), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn test_frame_kind_codes() {
        assert_eq!(FrameKind::from_u8(0), Some(FrameKind::Login));
        assert_eq!(FrameKind::from_u8(9), Some(FrameKind::FileMeta));
        assert_eq!(FrameKind::from_u8(36), Some(FrameKind::DeleteFile));
        assert_eq!(FrameKind::from_u8(6), None);
        assert_eq!(FrameKind::from_u8(0xFF), None);
        for kind in FrameKind::ALL {
            assert_eq!(FrameKind::from_u8(kind.code()), Some(kind));
        }
    }

    #[test]
    fn test_meta_and_chunk_predicates() {
        assert!(FrameKind::FileMeta.is_meta());
        assert!(FrameKind::AudioMeta.is_meta());
        assert!(FrameKind::AudioChunk.is_chunk());
        assert!(!FrameKind::FileEvt.is_chunk());
        assert!(!FrameKind::Dm.is_meta());
    }
}
