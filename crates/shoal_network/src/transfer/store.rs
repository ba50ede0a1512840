//! Where transferred bytes come from and go to.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use uuid::Uuid;

use crate::error::NetworkError;
use crate::identity::validate_file_name;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A readable snapshot of a shared file. `size_bytes` is fixed when the file
/// is opened and is what the requester is promised.
pub struct SourceFile {
    pub size_bytes: u64,
    pub reader: BoxReader,
}

/// Supplies the bytes of files this peer serves.
#[async_trait]
pub trait ByteSource: Send + Sync {
    /// Open `file_name` for serving. `Ok(None)` when it is not available.
    async fn open(&self, file_name: &str) -> Result<Option<SourceFile>, NetworkError>;
}

/// Receives the bytes of files this peer fetches. Content is staged per
/// transfer and only becomes visible under its real name on `commit`.
#[async_trait]
pub trait ByteSink: Send + Sync {
    async fn begin(&self, transfer_id: Uuid, file_name: &str) -> Result<BoxWriter, NetworkError>;
    async fn commit(&self, transfer_id: Uuid, file_name: &str) -> Result<(), NetworkError>;
    /// Throw away whatever was staged. Never fails.
    async fn discard(&self, transfer_id: Uuid, file_name: &str);
}

/// A flat directory of files, used both to serve and to receive.
#[derive(Debug, Clone)]
pub struct LocalDirectory {
    root: PathBuf,
}

impl LocalDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory if missing.
    pub async fn ensure_exists(&self) -> Result<(), NetworkError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Absolute path for a plain file name.
    pub fn path_of(&self, file_name: &str) -> Result<PathBuf, NetworkError> {
        validate_file_name(file_name)?;
        Ok(self.root.join(file_name))
    }

    /// Size of a regular file in the directory.
    pub async fn file_size(&self, file_name: &str) -> Result<u64, NetworkError> {
        let path = self.path_of(file_name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(meta.len()),
            Ok(_) => Err(NetworkError::NotFound(format!("{file_name} is not a regular file"))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(NetworkError::NotFound(format!("no such file: {}", path.display())))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn part_path(&self, transfer_id: Uuid) -> PathBuf {
        self.root.join(format!(".shoal-{transfer_id}.part"))
    }
}

#[async_trait]
impl ByteSource for LocalDirectory {
    async fn open(&self, file_name: &str) -> Result<Option<SourceFile>, NetworkError> {
        let Ok(path) = self.path_of(file_name) else {
            return Ok(None);
        };
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Ok(None);
        }
        Ok(Some(SourceFile {
            size_bytes: meta.len(),
            reader: Box::new(file),
        }))
    }
}

#[async_trait]
impl ByteSink for LocalDirectory {
    async fn begin(&self, transfer_id: Uuid, file_name: &str) -> Result<BoxWriter, NetworkError> {
        validate_file_name(file_name)?;
        self.ensure_exists().await?;
        let file = tokio::fs::File::create(self.part_path(transfer_id)).await?;
        Ok(Box::new(file))
    }

    async fn commit(&self, transfer_id: Uuid, file_name: &str) -> Result<(), NetworkError> {
        let target = self.path_of(file_name)?;
        tokio::fs::rename(self.part_path(transfer_id), &target).await?;
        debug!("Stored {}", target.display());
        Ok(())
    }

    async fn discard(&self, transfer_id: Uuid, _file_name: &str) {
        let part = self.part_path(transfer_id);
        if let Err(e) = tokio::fs::remove_file(&part).await {
            if e.kind() != ErrorKind::NotFound {
                debug!("Could not remove {}: {e}", part.display());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_open_existing_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("book.pdf"), vec![7u8; 1000]).unwrap();
        let store = LocalDirectory::new(dir.path());

        let mut source = store.open("book.pdf").await.unwrap().unwrap();
        assert_eq!(source.size_bytes, 1000);
        let mut buf = Vec::new();
        source.reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 1000);

        assert!(store.open("missing.txt").await.unwrap().is_none());
        assert!(store.open("../book.pdf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_directories_are_not_served() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let store = LocalDirectory::new(dir.path());
        assert!(store.open("sub").await.unwrap().is_none());
        assert!(matches!(
            store.file_size("sub").await,
            Err(NetworkError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        let store = LocalDirectory::new(dir.path());
        assert_eq!(store.file_size("a.txt").await.unwrap(), 5);
        assert!(matches!(
            store.file_size("b.txt").await,
            Err(NetworkError::NotFound(_))
        ));
        assert!(matches!(
            store.file_size("a/b").await,
            Err(NetworkError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_commit_renames_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirectory::new(dir.path().join("downloads"));
        let id = Uuid::new_v4();

        let mut writer = store.begin(id, "book.pdf").await.unwrap();
        writer.write_all(b"contents").await.unwrap();
        writer.shutdown().await.unwrap();
        drop(writer);
        assert!(!store.root().join("book.pdf").exists());

        store.commit(id, "book.pdf").await.unwrap();
        let got = std::fs::read(store.root().join("book.pdf")).unwrap();
        assert_eq!(got, b"contents");
        assert_eq!(std::fs::read_dir(store.root()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_discard_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDirectory::new(dir.path());
        let id = Uuid::new_v4();

        let mut writer = store.begin(id, "book.pdf").await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);
        store.discard(id, "book.pdf").await;
        // Second discard is a no-op.
        store.discard(id, "book.pdf").await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
