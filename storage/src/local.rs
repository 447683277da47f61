use std::io::SeekFrom;
use std::ops::Range;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use eyre::{Context, eyre};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::Instrument;

use storage_driver::{
    BoxReader, Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer,
};

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live at `<root>/<bucket>/<remote>`.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver storing buckets as directories below `root`.
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    /// The directory holding every bucket.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let escapes = remote
            .components()
            .any(|c| !matches!(c, Utf8Component::Normal(_)));
        if escapes || bucket.contains(['/', '\\']) || bucket.is_empty() {
            return Err(StorageError::builder(
                self.name(),
                StorageErrorKind::InvalidRequest,
                eyre!("path escapes the bucket root"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }

        Ok(self.root.join(bucket).join(remote))
    }

    fn error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error, context: &str) -> StorageError {
        StorageError::io(self.name(), err)
            .bucket(bucket)
            .path(remote.as_str())
            .context(context)
            .build()
    }

    async fn create_parent(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.error(bucket, path, err, "create_dir_all"))?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err, "metadata"))?;

        // Not every filesystem records a birth time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(|err| self.error(bucket, remote, err, "timestamp"))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(|err| self.error(bucket, remote, err, "remove_file"))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        self.create_parent(bucket, &path).await?;

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&path)
                .await
                .map_err(|err| self.error(bucket, remote, err, "open remote file"))?,
        );

        tokio::io::copy_buf(local, &mut writer)
            .await
            .map_err(|err| self.error(bucket, remote, err, "copy"))?;

        writer
            .shutdown()
            .await
            .map_err(|err| self.error(bucket, remote, err, "shutdown writer"))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut reader = self.open(bucket, remote, None).await?;

        tokio::io::copy_buf(&mut reader, local)
            .await
            .map_err(|err| self.error(bucket, remote, err, "copy"))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, err, "flush writer"))?;

        Ok(())
    }

    async fn open(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        range: Option<Range<u64>>,
    ) -> Result<BoxReader, StorageError> {
        let path = self.path(bucket, remote)?;
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err, "open remote file"))?;

        match range {
            Some(range) => {
                file.seek(SeekFrom::Start(range.start))
                    .await
                    .map_err(|err| self.error(bucket, remote, err, "seek"))?;
                let limit = range.end.saturating_sub(range.start);
                Ok(Box::new(tokio::io::BufReader::new(file.take(limit))))
            }
            None => Ok(Box::new(tokio::io::BufReader::new(file))),
        }
    }

    async fn write_at(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        offset: u64,
        reader: &mut Reader<'_>,
    ) -> Result<u64, StorageError> {
        let path = self.path(bucket, remote)?;
        self.create_parent(bucket, &path).await?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err, "open for write"))?;

        // Seeking past the end leaves a hole which reads back as zeros.
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|err| self.error(bucket, remote, err, "seek"))?;

        let written = tokio::io::copy_buf(reader, &mut file)
            .await
            .map_err(|err| self.error(bucket, remote, err, "copy"))?;

        file.flush()
            .await
            .map_err(|err| self.error(bucket, remote, err, "flush"))?;

        Ok(written)
    }

    async fn rename(
        &self,
        bucket: &str,
        from: &Utf8Path,
        to: &Utf8Path,
    ) -> Result<(), StorageError> {
        let source = self.path(bucket, from)?;
        let target = self.path(bucket, to)?;
        self.create_parent(bucket, &target).await?;

        tokio::fs::rename(&source, &target)
            .await
            .map_err(|err| self.error(bucket, from, err, "rename"))?;
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.root.join(bucket);
        let start = match prefix {
            Some(part) => self.path(bucket, part)?,
            None => base.clone(),
        };

        let items = tokio::task::spawn_blocking(move || collect_list(&base, &start))
            .in_current_span()
            .await
            .wrap_err("local driver")
            .map_err(StorageError::with(self.name(), StorageErrorKind::Other))?
            .map_err(StorageError::with(self.name(), StorageErrorKind::Io))?;

        tracing::debug!("Found {} entries", items.len());

        Ok(items.into_iter().map(|p| p.to_string()).collect())
    }
}

#[tracing::instrument]
fn collect_list(base: &Utf8Path, start: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();

    if start.is_dir() {
        visit(start, &mut files).wrap_err_with(|| format!("walking {start}"))?;
    } else if start.is_file() {
        files.push(start.to_owned());
    }

    let mut files: Vec<Utf8PathBuf> = files
        .into_iter()
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect();
    files.sort();
    Ok(files)
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
