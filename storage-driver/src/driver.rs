#![allow(clippy::needless_pass_by_ref_mut)]

use std::{fmt, ops::Deref, ops::Range, sync::Arc};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use tokio::io::{self, AsyncReadExt};

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// An owned reader returned by [`Driver::open`].
pub type BoxReader = Box<dyn io::AsyncBufRead + Unpin + Send + Sync + 'static>;

/// File object metadata, which will be generically provided by the driver.
///
/// This struct only provides common metadata fields, and drivers may provide more specific
/// metadata fields directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the file in bytes.
    pub size: u64,

    /// The creation timestamp of the file.
    pub created: DateTime<Utc>,
}

/// A storage driver, which provides the ability to interact with a storage backend.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// Delete a file from the storage, by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for a file, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Upload a file to the storage, using a reader stream to provide the contents.
    ///
    /// Any existing file at `remote` is replaced.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError>;

    /// Download a file from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Open a file for streaming reads, optionally restricted to a byte range.
    ///
    /// The range is clamped to the end of the file.
    async fn open(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        range: Option<Range<u64>>,
    ) -> Result<BoxReader, StorageError>;

    /// Write the reader contents at an absolute offset, creating the file when
    /// it does not exist and zero-filling any gap before `offset`.
    ///
    /// Returns the number of bytes written.
    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError>;

    /// List the files in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;

    /// Check whether a file exists.
    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Append the reader contents to the end of a file, creating it if needed.
    ///
    /// Returns the number of bytes written.
    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let offset = match self.metadata(bucket, remote).await {
            Ok(metadata) => metadata.size,
            Err(error) if error.kind() == StorageErrorKind::NotFound => 0,
            Err(error) => return Err(error),
        };
        self.write_at(bucket, remote, offset, reader).await
    }

    /// Move a file to a new path within the same bucket.
    ///
    /// The default implementation streams the contents and then deletes the source.
    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%from, %to, "Renaming by copy: {bucket}/{from}");
        let mut reader = self.open(bucket, from, None).await?;
        self.upload(bucket, to, &mut *reader).await?;
        self.delete(bucket, from).await
    }

    /// Download a file from storage into memory.
    async fn read_to_vec(&self, bucket: &str, remote: &Utf8Path) -> Result<Vec<u8>, StorageError> {
        let mut reader = self.open(bucket, remote, None).await?;
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await.map_err(|err| {
            StorageError::builder(self.name(), StorageErrorKind::Io, err)
                .bucket(bucket)
                .path(remote.as_str())
                .context("read to end")
                .build()
        })?;
        Ok(data)
    }
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn open(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        range: Option<Range<u64>>,
    ) -> Result<BoxReader, StorageError> {
        self.deref().open(bucket, remote, range).await
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().write_at(bucket, remote, offset, reader).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }

    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(bucket, remote).await
    }

    async fn append(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.deref().append(bucket, remote, reader).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.deref().rename(bucket, from, to).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_obj_safe!(Driver);
}
