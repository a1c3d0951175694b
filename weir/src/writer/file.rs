//! Local file rotation target
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::TargetWriter;
use crate::Error;

/// Append-only local file target.
pub struct FileWriter {
    file: File,
    path: PathBuf,
}

impl FileWriter {
    /// Opens (and creates) the file, creating missing parent directories.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path: PathBuf = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::OutputError(format!("create {}: {e}", parent.display())))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::OutputError(format!("open {}: {e}", path.display())))?;
        trace!(path = format!("{}", path.display()), "file target opened");
        Ok(FileWriter { file, path })
    }
}

#[async_trait]
impl TargetWriter for FileWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.file
            .write_all(buf)
            .await
            .map_err(|e| Error::OutputError(format!("write {}: {e}", self.path.display())))?;
        Ok(buf.len())
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.file
            .flush()
            .await
            .map_err(|e| Error::OutputError(format!("flush {}: {e}", self.path.display())))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| Error::OutputError(format!("sync {}: {e}", self.path.display())))
    }

    fn target(&self) -> &Path {
        &self.path
    }
}
