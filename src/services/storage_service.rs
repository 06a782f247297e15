//! src/services/storage_service.rs
//!
//! StorageService — bucket/object persistence on a local filesystem. An
//! object lives at `root/{bucket}/{name}`; there is no metadata store,
//! cache, or index beyond the directory tree itself. Uploads are staged
//! beside the bucket directories and renamed into place, so a partial
//! transfer is never visible at an object path.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

// One filesystem name component.
const MAX_BUCKET_NAME_LEN: usize = 255;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` is not a valid bucket name")]
    InvalidBucketName(String),
    #[error("object name `{0}` has no usable file name")]
    InvalidObjectName(String),
    #[error("upload stream failed: {0}")]
    Upload(#[source] io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// An upload that has been fully received into a staging file but not yet
/// committed to an object path.
#[derive(Debug)]
pub struct StagedUpload {
    tmp_path: PathBuf,
    pub size_bytes: u64,
}

/// StorageService provides the storage core:
/// - resolve a (bucket, name) pair to an on-disk path, creating the bucket
///   directory when absent
/// - stage an incoming byte stream into a temporary file
/// - commit a staged upload to its resolved path (last writer wins)
///
/// The service holds only the immutable storage root; clones share nothing
/// else, so concurrent requests coordinate purely through the filesystem.
#[derive(Clone)]
pub struct StorageService {
    /// Base directory on disk under which all buckets live.
    pub root: PathBuf,
}

impl StorageService {
    /// Create a new StorageService rooted at `root`. The caller is
    /// responsible for the root directory existing before requests arrive.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Reject bucket names that cannot denote a single first-level
    /// directory under the root.
    ///
    /// Retrieval path segments are percent-decoded before they reach us,
    /// so a separator can arrive inside one segment; this check runs on
    /// both the write and read paths.
    fn ensure_bucket_name_safe(&self, bucket: &str) -> StoreResult<()> {
        if bucket.is_empty() || bucket.len() > MAX_BUCKET_NAME_LEN {
            return Err(StoreError::InvalidBucketName(bucket.to_string()));
        }
        if bucket == "." || bucket == ".." {
            return Err(StoreError::InvalidBucketName(bucket.to_string()));
        }
        if bucket
            .bytes()
            .any(|b| b == b'/' || b == b'\\' || b.is_ascii_control())
        {
            return Err(StoreError::InvalidBucketName(bucket.to_string()));
        }
        Ok(())
    }

    /// Physical directory for a bucket. Does not check existence.
    fn bucket_root(&self, bucket: &str) -> PathBuf {
        let mut path = self.root.clone();
        path.push(bucket);
        path
    }

    /// Map (bucket, name) to the object's on-disk path, creating the
    /// bucket directory when absent.
    ///
    /// `name` is reduced to its final path segment before joining, so a
    /// name like `../../etc/x` lands at `{bucket}/x`; a name with no
    /// usable file name at all is rejected. The same reduction runs on
    /// upload and retrieval, which is what makes both sides agree on
    /// object identity.
    pub async fn resolve_object_path(&self, bucket: &str, name: &str) -> StoreResult<PathBuf> {
        self.ensure_bucket_name_safe(bucket)?;
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| StoreError::InvalidObjectName(name.to_string()))?;

        let bucket_root = self.bucket_root(bucket);
        fs::create_dir_all(&bucket_root).await?;
        Ok(bucket_root.join(file_name))
    }

    /// Stream an upload into a staging file beside the bucket directories.
    ///
    /// Chunks are written as they arrive and fsynced before returning; the
    /// staging file is removed on any failure. A stream error means the
    /// client-side transfer broke and is reported as `Upload`, distinct
    /// from local I/O trouble.
    pub async fn stage_object<S>(&self, stream: S) -> StoreResult<StagedUpload>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let tmp_path = self.root.join(format!(".upload-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size_bytes: u64 = 0;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StoreError::Upload(err));
                }
            };
            size_bytes += chunk.len() as u64;
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        Ok(StagedUpload {
            tmp_path,
            size_bytes,
        })
    }

    /// Commit a staged upload to its object path.
    ///
    /// Resolves the destination (creating the bucket directory
    /// transparently) and renames the staging file onto it, so readers
    /// only ever observe complete objects. An existing object at the same
    /// (bucket, name) is silently replaced.
    pub async fn commit_staged(
        &self,
        staged: StagedUpload,
        bucket: &str,
        declared_name: &str,
    ) -> StoreResult<PathBuf> {
        let dest = match self.resolve_object_path(bucket, declared_name).await {
            Ok(dest) => dest,
            Err(err) => {
                let _ = fs::remove_file(&staged.tmp_path).await;
                return Err(err);
            }
        };

        if let Err(err) = fs::rename(&staged.tmp_path, &dest).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&dest).await?;
                fs::rename(&staged.tmp_path, &dest).await?;
            } else {
                let _ = fs::remove_file(&staged.tmp_path).await;
                return Err(StoreError::Io(err));
            }
        }

        debug!(
            "committed {} byte object at {}",
            staged.size_bytes,
            dest.display()
        );
        Ok(dest)
    }

    /// Drop a staged upload that will not be committed.
    pub async fn discard_staged(&self, staged: StagedUpload) {
        if let Err(err) = fs::remove_file(&staged.tmp_path).await {
            if err.kind() != ErrorKind::NotFound {
                debug!(
                    "failed to remove staged upload {}: {}",
                    staged.tmp_path.display(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use tempfile::tempdir;

    fn byte_stream(chunks: Vec<io::Result<Bytes>>) -> impl Stream<Item = io::Result<Bytes>> {
        stream::iter(chunks)
    }

    #[tokio::test]
    async fn resolve_strips_parent_segments() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        let path = service
            .resolve_object_path("photos", "../../etc/passwd")
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("photos").join("passwd"));
        assert!(dir.path().join("photos").is_dir());
    }

    #[tokio::test]
    async fn resolve_creates_bucket_directory() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        assert!(!dir.path().join("fresh").exists());
        service.resolve_object_path("fresh", "a.txt").await.unwrap();
        assert!(dir.path().join("fresh").is_dir());
    }

    #[tokio::test]
    async fn resolve_rejects_bad_bucket_names() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        for bucket in ["", ".", "..", "a/b", "a\\b", "a\nb"] {
            let err = service
                .resolve_object_path(bucket, "obj")
                .await
                .unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidBucketName(_)),
                "bucket {bucket:?}"
            );
        }
    }

    #[tokio::test]
    async fn resolve_rejects_unusable_object_names() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        for name in ["", "..", "uploads/.."] {
            let err = service.resolve_object_path("b", name).await.unwrap_err();
            assert!(
                matches!(err, StoreError::InvalidObjectName(_)),
                "name {name:?}"
            );
        }
    }

    #[tokio::test]
    async fn stage_and_commit_roundtrip() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        let staged = service
            .stage_object(byte_stream(vec![
                Ok(Bytes::from_static(b"hel")),
                Ok(Bytes::from_static(b"lo")),
            ]))
            .await
            .unwrap();
        assert_eq!(staged.size_bytes, 5);

        let dest = service
            .commit_staged(staged, "docs", "notes/hello.txt")
            .await
            .unwrap();

        assert_eq!(dest, dir.path().join("docs").join("hello.txt"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn commit_overwrites_existing_object() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        let staged = service
            .stage_object(byte_stream(vec![Ok(Bytes::from_static(b"hello"))]))
            .await
            .unwrap();
        service.commit_staged(staged, "b", "key").await.unwrap();

        let staged = service
            .stage_object(byte_stream(vec![Ok(Bytes::from_static(b"world!!"))]))
            .await
            .unwrap();
        let dest = service.commit_staged(staged, "b", "key").await.unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"world!!");
    }

    #[tokio::test]
    async fn failed_stream_leaves_no_staging_file() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        let result = service
            .stage_object(byte_stream(vec![
                Ok(Bytes::from_static(b"par")),
                Err(io::Error::new(ErrorKind::UnexpectedEof, "client went away")),
            ]))
            .await;

        assert!(matches!(result, Err(StoreError::Upload(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn commit_to_invalid_bucket_cleans_up_staging_file() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        let staged = service
            .stage_object(byte_stream(vec![Ok(Bytes::from_static(b"data"))]))
            .await
            .unwrap();
        let result = service.commit_staged(staged, "no/slash", "key").await;

        assert!(matches!(result, Err(StoreError::InvalidBucketName(_))));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn discard_removes_staging_file() {
        let dir = tempdir().unwrap();
        let service = StorageService::new(dir.path());

        let staged = service
            .stage_object(byte_stream(vec![Ok(Bytes::from_static(b"data"))]))
            .await
            .unwrap();
        let tmp = staged.tmp_path.clone();
        assert!(tmp.exists());

        service.discard_staged(staged).await;
        assert!(!tmp.exists());
    }
}
