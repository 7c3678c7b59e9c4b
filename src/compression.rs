use crate::errors::*;
use async_compression::tokio::bufread::{GzipDecoder, XzDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, XzEncoder};
use async_compression::Level;
use std::path::Path;
use std::pin::Pin;
use std::task::Poll;
use tokio::fs::File;
use tokio::io::{self, AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf};

/// Uniform wrapper over the decompressors this crate needs: a plain/gz/xz
/// enum widened to zstd for `primary.xml.zst`.
pub enum Decompressor<R> {
    Plain(R),
    Gz(GzipDecoder<R>),
    Xz(XzDecoder<R>),
    Zstd(ZstdDecoder<R>),
}

impl<R: AsyncBufRead> Decompressor<R> {
    pub fn gz(reader: R) -> Self {
        Decompressor::Gz(GzipDecoder::new(reader))
    }

    pub fn xz(reader: R) -> Self {
        Decompressor::Xz(XzDecoder::new(reader))
    }

    pub fn zstd(reader: R) -> Self {
        Decompressor::Zstd(ZstdDecoder::new(reader))
    }

    pub fn into_inner(self) -> R {
        match self {
            Decompressor::Plain(r) => r,
            Decompressor::Gz(r) => r.into_inner(),
            Decompressor::Xz(r) => r.into_inner(),
            Decompressor::Zstd(r) => r.into_inner(),
        }
    }
}

impl<R: AsyncBufRead + Unpin> AsyncRead for Decompressor<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Decompressor::Plain(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Gz(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Xz(r) => Pin::new(r).poll_read(cx, buf),
            Decompressor::Zstd(r) => Pin::new(r).poll_read(cx, buf),
        }
    }
}

/// Decompress a downloaded metadata blob: try zstd first, fall back to gzip
/// on any decode failure. Has no external state beyond the file it reads.
pub async fn decompress(path: &Path) -> Result<Vec<u8>> {
    let raw = File::open(path).await?;
    let reader = BufReader::new(raw);
    let mut decoder = Decompressor::zstd(reader);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out).await {
        Ok(_) => Ok(out),
        Err(_zstd_err) => {
            let raw = File::open(path).await?;
            let reader = BufReader::new(raw);
            let mut decoder = Decompressor::gz(reader);
            out = Vec::new();
            decoder.read_to_end(&mut out).await?;
            Ok(out)
        }
    }
}

/// Decompress an `.xz`-compressed blob fully into memory (used by the
/// updateinfo rewriter to read the existing section before stripping it).
pub async fn decompress_xz(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = Decompressor::xz(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).await?;
    Ok(out)
}

/// Same zstd-then-gzip fallback as [`decompress`], but over an in-memory
/// buffer — used by `diff_snapshots`, which pulls `primary.xml.gz` straight
/// out of the object store rather than off disk.
pub async fn decompress_bytes(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = Decompressor::zstd(bytes);
    let mut out = Vec::new();
    match decoder.read_to_end(&mut out).await {
        Ok(_) => Ok(out),
        Err(_zstd_err) => {
            let mut decoder = Decompressor::gz(bytes);
            out = Vec::new();
            decoder.read_to_end(&mut out).await?;
            Ok(out)
        }
    }
}

pub async fn compress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzipEncoder::with_quality(Vec::new(), Level::Best);
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

pub async fn compress_xz(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = XzEncoder::with_quality(Vec::new(), Level::Best);
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(encoder.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_gzip_round_trip() {
        let data = b"<metadata>hello world</metadata>".to_vec();
        let compressed = compress_gzip(&data).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("primary.xml.gz");
        tokio::fs::write(&path, &compressed).await.unwrap();

        let roundtripped = decompress(&path).await.unwrap();
        assert_eq!(roundtripped, data);
    }

    #[tokio::test]
    async fn test_xz_round_trip() {
        let data = b"<updateinfo></updateinfo>".to_vec();
        let compressed = compress_xz(&data).await.unwrap();
        let decompressed = decompress_xz(&compressed).await.unwrap();
        assert_eq!(decompressed, data);
    }
}
