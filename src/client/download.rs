//! Download deduplication and reassembly.

use crate::error::{Error, Result};
use crate::protocol::body::DownloadMeta;
use crate::temp_file::TempFileGuard;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Set of files with a download in flight, each with its destination dir.
///
/// At most one request per file id is outstanding; a second request is
/// refused until the first finishes or fails.
#[derive(Debug, Default)]
pub struct DownloadGuard {
    in_flight: Mutex<HashMap<i64, PathBuf>>,
}

impl DownloadGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `file_id`. Returns false if it is already in flight.
    pub fn try_begin(&self, file_id: i64, dest_dir: &Path) -> bool {
        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(&file_id) {
            return false;
        }
        in_flight.insert(file_id, dest_dir.to_path_buf());
        true
    }

    pub fn dest_dir(&self, file_id: i64) -> Option<PathBuf> {
        self.in_flight.lock().get(&file_id).cloned()
    }

    pub fn finish(&self, file_id: i64) {
        self.in_flight.lock().remove(&file_id);
    }

    pub fn is_in_flight(&self, file_id: i64) -> bool {
        self.in_flight.lock().contains_key(&file_id)
    }

    /// Release everything, returning the ids that were still in flight.
    pub fn drain(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.in_flight.lock().drain().map(|(id, _)| id).collect();
        ids.sort_unstable();
        ids
    }
}

/// A download being written to `<dest>/.<name>.part`, renamed on the last chunk.
pub(crate) struct ActiveDownload {
    pub file_id: i64,
    expected_bytes: u64,
    expected_seq: u32,
    written: u64,
    file: File,
    guard: TempFileGuard,
    target: PathBuf,
}

impl ActiveDownload {
    pub async fn start(dest_dir: &Path, meta: &DownloadMeta) -> Result<Self> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let name = safe_file_name(&meta.name, meta.file_id);
        let target = dest_dir.join(&name);
        let staged = dest_dir.join(format!(".{}.{}.part", name, meta.file_id));
        let guard = TempFileGuard::new(&staged);
        let file = File::create(&staged).await?;
        Ok(Self {
            file_id: meta.file_id,
            expected_bytes: meta.bytes,
            expected_seq: 0,
            written: 0,
            file,
            guard,
            target,
        })
    }

    /// Append one chunk in order.
    pub async fn write_chunk(&mut self, seq: u32, data: &Bytes) -> Result<()> {
        if seq != self.expected_seq {
            return Err(Error::ProtocolViolation(format!(
                "download {}: expected chunk {}, got {}",
                self.file_id, self.expected_seq, seq
            )));
        }
        let total = self.written + data.len() as u64;
        if total > self.expected_bytes {
            return Err(Error::ProtocolViolation(format!(
                "download {}: {} bytes exceeds announced {}",
                self.file_id, total, self.expected_bytes
            )));
        }
        self.file.write_all(data).await?;
        self.written = total;
        self.expected_seq += 1;
        Ok(())
    }

    /// Flush and move into place; returns the final path and byte count.
    pub async fn finish(mut self) -> Result<(PathBuf, u64)> {
        if self.written != self.expected_bytes {
            return Err(Error::ProtocolViolation(format!(
                "download {}: got {} of {} bytes",
                self.file_id, self.written, self.expected_bytes
            )));
        }
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(self.guard.path(), &self.target).await?;
        self.guard.defuse();
        Ok((self.target, self.written))
    }
}

/// Last path component of an untrusted name, or a fallback built from the id.
fn safe_file_name(name: &str, file_id: i64) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .unwrap_or_else(|| format!("file-{}", file_id))
}
