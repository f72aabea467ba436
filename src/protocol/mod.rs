//! Wire protocol: frames, the stream codec and structured bodies.
//!
//! Every message between client and server is one [`Frame`], written as a
//! length-prefixed record on a single persistent TCP stream. The codec knows
//! nothing about message semantics; it only moves frames.

pub mod body;
pub mod codec;
pub mod frame;

pub use codec::{read_frame, write_frame};
pub use frame::{Frame, FrameFlags, FrameKind, HEADER_LEN};

/// Maximum frame payload (4MB) - prevents OOM from malicious/corrupted frames
pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

/// Chunk size used both for sending and for buffering downloads
pub const CHUNK_SIZE: usize = 64 * 1024; // 64KB

/// Largest file or audio payload accepted (25MB)
pub const MAX_FILE_SIZE: u64 = 25 * 1024 * 1024;

/// Longest audio clip accepted
pub const MAX_AUDIO_DURATION_MS: u32 = 30_000;

/// Result limit for HISTORY/SEARCH when the request leaves `seq` at 0
pub const DEFAULT_RESULT_LIMIT: u32 = 50;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn kind_strategy() -> impl Strategy<Value = FrameKind> {
        (0..FrameKind::ALL.len()).prop_map(|i| FrameKind::ALL[i])
    }

    fn frame_strategy() -> impl Strategy<Value = Frame> {
        (
            kind_strategy(),
            ".{0,24}",
            ".{0,24}",
            ".{0,256}",
            "[a-z0-9-]{0,36}",
            any::<u32>(),
            any::<bool>(),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
        )
            .prop_map(
                |(kind, sender, recipient, body, transfer_id, seq, last, bin)| Frame {
                    kind,
                    sender,
                    recipient,
                    body,
                    transfer_id,
                    seq,
                    last,
                    bin: bin.map(bytes::Bytes::from),
                },
            )
    }

    proptest! {
        #[test]
        fn prop_frame_roundtrip(frame in frame_strategy()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let encoded = frame.encode().unwrap();
            let mut reader: &[u8] = &encoded;
            let decoded = rt.block_on(read_frame(&mut reader)).unwrap();
            prop_assert_eq!(decoded, Some(frame));
            prop_assert!(reader.is_empty());
        }
    }
}
