//! Guard that deletes a partially written file unless it is defused.
//!
//! Every upload staging file and client download target is wrapped in one of
//! these, so a sink never outlives its transfer: success defuses the guard,
//! while errors, aborts and dropped connections remove the file.

use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Keep the file; returns its path.
    pub fn defuse(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = std::fs::remove_file(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove partial file {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_guard_removes_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("upload.part");
        fs::write(&path, b"partial").unwrap();

        {
            let _guard = TempFileGuard::new(&path);
        }

        assert!(!path.exists());
    }

    #[test]
    fn test_defused_guard_keeps_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("done.bin");
        fs::write(&path, b"complete").unwrap();

        let guard = TempFileGuard::new(&path);
        let kept = guard.defuse();

        assert_eq!(kept, path);
        assert!(path.exists());
    }

    #[test]
    fn test_missing_file_is_fine() {
        let tmp = TempDir::new().unwrap();
        let _guard = TempFileGuard::new(tmp.path().join("never-created"));
    }
}
