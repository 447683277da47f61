use std::io;
use std::ops::Range;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use crate::local::LocalDriver;
use storage_driver::{BoxReader, Driver, Metadata, Reader, StorageError, Writer};

/// A storage driver that stores files in a temporary directory, removed on drop.
#[derive(Debug)]
pub struct TempDriver {
    #[allow(unused)]
    dir: TempDir,
    driver: LocalDriver,
}

impl TempDriver {
    /// Create a new `TempDriver` instance, storing files in a temporary directory.
    pub fn new() -> io::Result<Self> {
        let tmp = TempDir::new()?;
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_owned()).map_err(|path| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("temporary directory is not utf-8: {}", path.display()),
            )
        })?;

        Ok(Self {
            dir: tmp,
            driver: LocalDriver::new(root),
        })
    }
}

#[async_trait::async_trait]
impl Driver for TempDriver {
    fn name(&self) -> &'static str {
        "temp"
    }

    async fn metadata(
        &self,
        bucket: &str,
        remote: &camino::Utf8Path,
    ) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    async fn delete(&self, bucket: &str, remote: &camino::Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &camino::Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        self.driver.upload(bucket, remote, local).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &camino::Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.driver.download(bucket, remote, local).await
    }

    async fn open(
        &self,
        bucket: &str,
        remote: &camino::Utf8Path,
        range: Option<Range<u64>>,
    ) -> Result<BoxReader, StorageError> {
        self.driver.open(bucket, remote, range).await
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &camino::Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        self.driver.write_at(bucket, remote, offset, reader).await
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &camino::Utf8Path,
        to: &camino::Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.rename(bucket, from, to).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&camino::Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }
}
