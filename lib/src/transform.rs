//! Primitives for stream transformations.

use std::pin::Pin;

use async_compression::tokio::bufread::{GzipDecoder, GzipEncoder, ZstdDecoder};
use bytes::Bytes;
use futures_lite::Stream;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::{LayerMediaType, LayerMediaTypeFlag};

/// Convenience alias for a chunk of bytes in a stream.
pub type Chunk = Result<Bytes, std::io::Error>;

/// A boxed stream of chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Chunk> + Send>>;

/// Decompress the stream using gzip.
pub fn gunzip(stream: impl Stream<Item = Chunk> + Send + 'static) -> impl Stream<Item = Chunk> + Send {
    ReaderStream::new(GzipDecoder::new(StreamReader::new(stream)))
}

/// Decompress the stream using zstd.
pub fn unzstd(stream: impl Stream<Item = Chunk> + Send + 'static) -> impl Stream<Item = Chunk> + Send {
    ReaderStream::new(ZstdDecoder::new(StreamReader::new(stream)))
}

/// Compress the stream using gzip.
pub fn gzip(stream: impl Stream<Item = Chunk> + Send + 'static) -> impl Stream<Item = Chunk> + Send {
    ReaderStream::new(GzipEncoder::new(StreamReader::new(stream)))
}

/// Decompress a layer blob into its plain tarball based on its media type.
pub fn decompress(media_type: &LayerMediaType, stream: impl Stream<Item = Chunk> + Send + 'static) -> ChunkStream {
    match media_type {
        LayerMediaType::Docker | LayerMediaType::DockerForeign => Box::pin(gunzip(stream)),
        LayerMediaType::DockerUncompressed => Box::pin(stream),
        LayerMediaType::Oci(flags) | LayerMediaType::OciNonDistributable(flags) => {
            match flags.as_slice() {
                [] => Box::pin(stream),
                [LayerMediaTypeFlag::Gzip] => Box::pin(gunzip(stream)),
                [LayerMediaTypeFlag::Zstd] => Box::pin(unzstd(stream)),
                _ => sequence(stream, flags),
            }
        }
    }
}

/// Apply a sequence of decompressions to the stream based on the media type flags.
fn sequence(stream: impl Stream<Item = Chunk> + Send + 'static, flags: &[LayerMediaTypeFlag]) -> ChunkStream {
    // Left hand side type annotation is required to coerce to dynamic dispatching.
    let mut stream: ChunkStream = Box::pin(stream);

    // Flags are applied outermost first, each consuming the prior stream.
    for flag in flags.iter().rev() {
        match flag {
            LayerMediaTypeFlag::Zstd => stream = Box::pin(unzstd(stream)),
            LayerMediaTypeFlag::Gzip => stream = Box::pin(gunzip(stream)),
            LayerMediaTypeFlag::Foreign => (),
        }
    }

    stream
}
