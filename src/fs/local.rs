use std::path::Path;

use async_trait::async_trait;
use tokio::fs;

use super::{EntryKind, FileSystem, FsError, ReadStream, WriteStream};
use crate::core::CandidateFile;

/// The machine's own file system.
#[derive(Debug, Clone, Default)]
pub struct DiskFs;

impl DiskFs {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for DiskFs {
    fn label(&self) -> &str {
        "local"
    }

    async fn kind(&self, path: &Path) -> Result<Option<EntryKind>, FsError> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(EntryKind::Directory)),
            Ok(meta) => Ok(Some(EntryKind::File { length: meta.len() })),
            Err(e) => match FsError::from_io(path, e) {
                FsError::NotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn list_files(&self, dir: &Path) -> Result<Vec<CandidateFile>, FsError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| FsError::from_io(dir, e))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(dir, e))?
        {
            let path = entry.path();
            // Entries can vanish between listing and stat.
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FsError::from_io(&path, e)),
            };
            if !meta.is_file() {
                continue;
            }
            files.push(CandidateFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                length: meta.len(),
            });
        }
        Ok(files)
    }

    async fn open_read(&self, path: &Path) -> Result<ReadStream, FsError> {
        let file = fs::File::open(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &Path) -> Result<WriteStream, FsError> {
        let file = fs::File::create(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        fs::rename(from, to)
            .await
            .map_err(|e| FsError::from_io(from, e))
    }

    async fn remove(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_file(path)
            .await
            .map_err(|e| FsError::from_io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn lists_only_regular_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.csv"), b"abc").unwrap();
        std::fs::create_dir(temp.path().join("nested")).unwrap();
        std::fs::write(temp.path().join("nested/b.csv"), b"b").unwrap();

        let files = DiskFs.list_files(temp.path()).await.unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "a.csv");
        assert_eq!(files[0].length, 3);
    }

    #[tokio::test]
    async fn kind_reports_missing_as_none() {
        let temp = TempDir::new().unwrap();
        let fs = DiskFs::new();

        assert_eq!(
            fs.kind(temp.path()).await.unwrap(),
            Some(EntryKind::Directory)
        );
        assert_eq!(fs.kind(&temp.path().join("nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_file_errors_are_not_found() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope");

        assert!(DiskFs.remove(&missing).await.unwrap_err().is_not_found());
        assert!(
            DiskFs
                .rename(&missing, &temp.path().join("other"))
                .await
                .unwrap_err()
                .is_not_found()
        );
    }
}
