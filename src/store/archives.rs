use crate::store::paths::get_archive_entry;
use crate::store::temps::{self, TempFile};
use async_compression::tokio::{bufread::GzipDecoder, write::GzipEncoder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_lite::StreamExt;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf, Take};
use tokio_tar::{Archive, Builder, EntryType, Header};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

/// Permission bits of the packaged artifact entry.
pub const ENTRY_MODE: u32 = 0o640;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("unknown WAR size")]
    UnknownSize,

    #[error("fail to write tarball")]
    Write(#[source] io::Error),

    #[error("fail to copy war content")]
    Copy(#[source] io::Error),

    #[error("fail to finalize tarball")]
    Finish(#[source] io::Error),

    #[error("fail to spool tarball to disk")]
    Spool(#[source] io::Error),
}

/// Metadata of the single file entry written into an archive.
#[derive(Clone, Debug)]
pub struct ArchiveEntry {
    pub name: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl ArchiveEntry {
    pub fn new(app_name: &str, file_name: &str, size: u64) -> Self {
        Self {
            name: get_archive_entry(app_name, file_name),
            size,
            created_at: Utc::now(),
        }
    }

    fn header(&self) -> Header {
        let timestamp = u64::try_from(self.created_at.timestamp()).unwrap_or_default();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(ENTRY_MODE);
        header.set_size(self.size);
        header.set_mtime(timestamp);

        if let Some(gnu) = header.as_gnu_mut() {
            gnu.set_atime(timestamp);
            gnu.set_ctime(timestamp);
        }

        header
    }
}

/// Yields exactly `size` bytes of the inner reader, failing when it ends early.
struct ExactReader<R> {
    inner: Take<R>,
    remaining: u64,
    failed: bool,
}

impl<R: AsyncRead + Unpin> ExactReader<R> {
    fn new(reader: R, size: u64) -> Self {
        Self {
            inner: reader.take(size),
            remaining: size,
            failed: false,
        }
    }

    async fn ensure_drained(&mut self) -> io::Result<()> {
        let mut probe = [0u8; 1];

        if self.inner.get_mut().read(&mut probe).await? > 0 {
            self.failed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "payload is longer than the declared size",
            ));
        }

        Ok(())
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ExactReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.remaining == 0 || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let filled = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(err)) => {
                this.failed = true;
                Poll::Ready(Err(err))
            }
            Poll::Ready(Ok(())) => {
                let read = (buf.filled().len() - filled) as u64;

                if read == 0 {
                    this.failed = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "payload ended {} bytes short of the declared size",
                            this.remaining
                        ),
                    )));
                }

                this.remaining -= read;

                Poll::Ready(Ok(()))
            }
        }
    }
}

/// Writes `reader` as the single entry of a gzip-compressed tarball into `writer`.
///
/// The tar builder owns the gzip encoder, so the tar trailer is always written
/// before the gzip trailer. The builder is non-terminated: when any step fails
/// both layers are dropped without anything further being written.
pub async fn compress_tar_gz<W, R>(
    writer: W,
    entry: &ArchiveEntry,
    reader: R,
) -> Result<W, ArchiveError>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    if entry.size == 0 {
        return Err(ArchiveError::UnknownSize);
    }

    let mut header = entry.header();
    let mut payload = ExactReader::new(reader, entry.size);
    let mut tar_builder = Builder::new_non_terminated(GzipEncoder::new(writer));

    if let Err(err) = tar_builder
        .append_data(&mut header, &entry.name, &mut payload)
        .await
    {
        return Err(if payload.failed {
            ArchiveError::Copy(err)
        } else {
            ArchiveError::Write(err)
        });
    }

    payload.ensure_drained().await.map_err(ArchiveError::Copy)?;

    tar_builder.finish().await.map_err(ArchiveError::Finish)?;

    let mut encoder = tar_builder.into_inner().await.map_err(ArchiveError::Finish)?;
    encoder.shutdown().await.map_err(ArchiveError::Finish)?;

    debug!("packed archive entry: {} ({} bytes)", entry.name, entry.size);

    Ok(encoder.into_inner())
}

/// Where a packed archive is accumulated before upload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ArchiveSpool {
    #[default]
    Memory,
    TempFile,
}

impl ArchiveSpool {
    pub async fn pack<R>(
        self,
        entry: &ArchiveEntry,
        reader: R,
    ) -> Result<PackedArchive, ArchiveError>
    where
        R: AsyncRead + Unpin + Send,
    {
        if entry.size == 0 {
            return Err(ArchiveError::UnknownSize);
        }

        let archive = match self {
            ArchiveSpool::Memory => {
                let buffer = compress_tar_gz(Vec::new(), entry, reader).await?;

                PackedArchive {
                    size: buffer.len() as u64,
                    data: ArchiveData::Memory(Bytes::from(buffer)),
                }
            }

            ArchiveSpool::TempFile => {
                let (temp, file) = temps::create_file().await.map_err(ArchiveError::Spool)?;
                let file = compress_tar_gz(file, entry, reader).await?;
                let size = file.metadata().await.map_err(ArchiveError::Spool)?.len();

                debug!("spooled archive: {}", temp.path().display());

                PackedArchive {
                    size,
                    data: ArchiveData::File(temp),
                }
            }
        };

        info!("packed archive size: {} bytes", archive.size);

        Ok(archive)
    }
}

#[derive(Debug)]
enum ArchiveData {
    Memory(Bytes),
    File(TempFile),
}

/// A finalized archive whose length is known before it is transferred.
#[derive(Debug)]
pub struct PackedArchive {
    size: u64,
    data: ArchiveData,
}

impl PackedArchive {
    /// Compressed length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub async fn body(&self) -> io::Result<reqwest::Body> {
        match &self.data {
            ArchiveData::Memory(buffer) => Ok(reqwest::Body::from(buffer.clone())),
            ArchiveData::File(temp) => {
                let file = File::open(temp.path()).await?;
                Ok(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        }
    }

    pub async fn read(&self) -> io::Result<Bytes> {
        match &self.data {
            ArchiveData::Memory(buffer) => Ok(buffer.clone()),
            ArchiveData::File(temp) => Ok(Bytes::from(fs::read(temp.path()).await?)),
        }
    }

    pub async fn write_to(&self, path: &Path) -> io::Result<()> {
        match &self.data {
            ArchiveData::Memory(buffer) => fs::write(path, buffer).await,
            ArchiveData::File(temp) => fs::copy(temp.path(), path).await.map(|_| ()),
        }
    }
}

/// An entry read back from a packed archive.
#[derive(Clone, Debug)]
pub struct UnpackedEntry {
    pub path: String,
    pub entry_type: EntryType,
    pub mode: u32,
    pub size: u64,
    pub mtime: u64,
    pub atime: Option<u64>,
    pub ctime: Option<u64>,
    pub data: Vec<u8>,
}

pub async fn unpack_tar_gz(source: &[u8]) -> io::Result<Vec<UnpackedEntry>> {
    let gz_decoder = GzipDecoder::new(BufReader::new(source));
    let mut archive = Archive::new(gz_decoder);
    let mut entries = archive.entries()?;
    let mut unpacked = Vec::new();

    while let Some(entry) = entries.next().await {
        let mut entry = entry?;

        let header = entry.header();
        let entry_type = header.entry_type();
        let mode = header.mode()?;
        let size = header.size()?;
        let mtime = header.mtime()?;
        let atime = header.as_gnu().and_then(|gnu| gnu.atime().ok());
        let ctime = header.as_gnu().and_then(|gnu| gnu.ctime().ok());
        let path = entry.path()?.to_string_lossy().into_owned();

        let mut data = Vec::new();
        entry.read_to_end(&mut data).await?;

        unpacked.push(UnpackedEntry {
            path,
            entry_type,
            mode,
            size,
            mtime,
            atime,
            ctime,
            data,
        });
    }

    Ok(unpacked)
}
