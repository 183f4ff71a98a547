//! Enrollment image files on disk: `<root>/<owner>/<uuid>.<ext>`.

use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write `bytes` for `owner_id`, keeping the upload's extension.
    pub async fn save(&self, owner_id: &str, filename: &str, bytes: &[u8]) -> io::Result<PathBuf> {
        let dir = self.root.join(sanitize(owner_id));
        let path = dir.join(format!("{}.{}", uuid::Uuid::new_v4(), extension_of(filename)));

        // `remove` may delete the owner directory between our create and write.
        match write_in(&dir, &path, bytes).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => write_in(&dir, &path, bytes).await?,
            other => other?,
        }
        tracing::debug!(owner = owner_id, path = %path.display(), bytes = bytes.len(), "image saved");
        Ok(path)
    }

    /// Remove a stored image and its owner directory once empty.
    ///
    /// Paths outside the media root are left alone. A missing file is not an error.
    pub async fn remove(&self, path: &Path) -> io::Result<()> {
        if !path.starts_with(&self.root) {
            tracing::warn!(path = %path.display(), "refusing to remove file outside media root");
            return Ok(());
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        if let Some(dir) = path.parent().filter(|d| *d != self.root) {
            let mut entries = tokio::fs::read_dir(dir).await?;
            if entries.next_entry().await?.is_none() {
                // Another enrollment may have raced us into the directory.
                let _ = tokio::fs::remove_dir(dir).await;
            }
        }
        Ok(())
    }
}

async fn write_in(dir: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, bytes).await
}

fn sanitize(owner_id: &str) -> String {
    let cleaned: String = owner_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "jpg".to_string())
}
