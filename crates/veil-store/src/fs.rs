use std::path::{Path, PathBuf};

use veil_core::types::PositionToken;
use veil_observe::time::unix_time_ms;

use crate::{CheckpointStore, StoreError};

/// Durable single-slot checkpoint: one file holding the raw token bytes.
///
/// Writes go through a tmp-file + rename so a crash mid-write leaves either
/// the old token or the new one, never a torn slot.
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    path: PathBuf,
}

impl FsCheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn load(&self) -> Result<Option<PositionToken>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(PositionToken(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    fn save(&self, token: &PositionToken) -> Result<(), StoreError> {
        write_atomic(&self.path, &token.0)?;
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path must have parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let mut tmp = path.to_path_buf();
    let suffix = format!("tmp.{}.{}", std::process::id(), unix_time_ms());
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad filename"))?;
    tmp.set_file_name(format!("{file_name}.{suffix}"));

    {
        let mut f = std::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }

    std::fs::rename(tmp, path)?;
    Ok(())
}
