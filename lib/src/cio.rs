//! Blob and tarball IO.

use std::path::Path;

use async_tempfile::TempFile;
use bytes::{Bytes, BytesMut};
use color_eyre::{eyre::Context, Result};
use futures_lite::{Stream, StreamExt};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_tar::{Builder, Header};
use tokio_util::io::ReaderStream;

use crate::{transform::Chunk, Digest};

/// Hash the specified file on disk, returning its digest and size.
pub async fn file_digest(path: &Path) -> Result<(Digest, u64)> {
    let mut hasher = Sha256::new();
    let mut file = tokio::fs::File::open(path).await.context("open file")?;
    let mut buffer = BytesMut::with_capacity(64 * 1024);
    let mut size = 0u64;
    loop {
        let n = file.read_buf(&mut buffer).await.context("read file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        size += n as u64;
        buffer.clear();
    }

    Ok((Digest::from_hash(hasher.finalize().to_vec()), size))
}

/// Stream the contents of a file.
pub async fn read_stream(path: &Path) -> Result<impl Stream<Item = Chunk> + Send + 'static> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {path:?}"))?;
    Ok(ReaderStream::new(file))
}

/// Sink the stream into a temporary file.
#[tracing::instrument(skip(stream))]
pub async fn collect_tmp<E: std::error::Error + Send + Sync + 'static>(
    mut stream: impl Stream<Item = Result<Bytes, E>> + Unpin,
) -> Result<TempFile> {
    let file = TempFile::new().await.context("create temp file")?;
    let mut writer = BufWriter::new(file);

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("read chunk")?;
        writer.write_all(&chunk).await.context("write chunk")?;
    }
    writer.flush().await.context("flush writer")?;

    let file = writer.into_inner();
    file.sync_all().await.context("sync file")?;
    Ok(file)
}

/// Add in-memory content to a tarball as a regular file.
pub async fn append_bytes<W: AsyncWrite + Unpin + Send + 'static>(
    tarball: &mut Builder<W>,
    name: &str,
    content: &[u8],
) -> Result<()> {
    let mut header = Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    tarball
        .append_data(&mut header, name, content)
        .await
        .with_context(|| format!("add {name} to tarball"))
}

/// Add a file on disk to a tarball under a new name.
pub async fn append_file<W: AsyncWrite + Unpin + Send + 'static>(
    tarball: &mut Builder<W>,
    path: &Path,
    name: &str,
) -> Result<()> {
    tarball
        .append_path_with_name(path, name)
        .await
        .with_context(|| format!("add {path:?} to tarball as {name}"))
}
