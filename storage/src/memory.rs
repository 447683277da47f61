use std::collections::HashMap;
use std::ops::Range;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use storage_driver::{
    BoxReader, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

#[derive(Debug)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that stores files in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    /// Total number of bytes held across all buckets.
    pub async fn total_bytes(&self) -> u64 {
        let buckets = self.buckets.read().await;
        buckets
            .values()
            .flat_map(|bucket| bucket.values())
            .map(|item| item.data.len() as u64)
            .sum()
    }

    fn bucket_not_found(&self, bucket: &str) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Bucket not found: {bucket}"),
            ),
        )
        .bucket(bucket)
        .context("bucket not found")
        .build()
    }

    fn path_not_found(&self, bucket: &str, remote: &Utf8Path) -> StorageError {
        StorageError::builder(
            self.name(),
            StorageErrorKind::NotFound,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Path not found: {remote}"),
            ),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .context("path not found")
        .build()
    }

    fn io_error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        StorageError::io(self.name(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        Ok(bucket_map
            .get(remote)
            .ok_or_else(|| self.path_not_found(bucket, remote))?
            .into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        bucket_map
            .remove(remote)
            .ok_or_else(|| self.path_not_found(bucket, remote))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        local
            .read_to_end(&mut buf)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let data = {
            let buckets = self.buckets.read().await;
            let bucket_map = buckets
                .get(bucket)
                .ok_or_else(|| self.bucket_not_found(bucket))?;
            bucket_map
                .get(remote)
                .ok_or_else(|| self.path_not_found(bucket, remote))?
                .data
                .clone()
        };

        let mut reader = data.as_slice();
        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        tokio::io::AsyncWriteExt::flush(local)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        Ok(())
    }

    async fn open(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        range: Option<Range<u64>>,
    ) -> Result<BoxReader, StorageError> {
        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        let item = bucket_map
            .get(remote)
            .ok_or_else(|| self.path_not_found(bucket, remote))?;

        let len = item.data.len();
        let (start, end) = match range {
            Some(range) => (
                (range.start as usize).min(len),
                (range.end as usize).min(len),
            ),
            None => (0, len),
        };
        let data = item.data[start..end.max(start)].to_vec();

        Ok(Box::new(std::io::Cursor::new(data)))
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|err| self.io_error(bucket, remote, err))?;

        let out_of_range = || {
            StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("offset {offset} out of range"),
                ),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build()
        };
        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let end = start.checked_add(buf.len()).ok_or_else(out_of_range)?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        let item = bucket_map
            .entry(remote.to_owned())
            .or_insert_with(|| Vec::new().into());

        if item.data.len() < end {
            item.data.resize(end, 0);
        }
        item.data[start..end].copy_from_slice(&buf);

        Ok(buf.len() as u64)
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let bucket_map = buckets
            .get(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets
            .get_mut(bucket)
            .ok_or_else(|| self.bucket_not_found(bucket))?;
        let item = bucket_map
            .remove(from)
            .ok_or_else(|| self.path_not_found(bucket, from))?;
        bucket_map.insert(to.to_owned(), item);
        Ok(())
    }
}
