use crate::errors::*;
use data_encoding::BASE64;
use md5::{Digest as Md5Digest, Md5};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const READ_CHUNK: usize = 1024 * 1024;

/// `sha256(bytes) -> lowercase hex`, per the checksum utility contract.
pub fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Validate that the file at `path` matches `expected` under `checksum_type`.
///
/// Reads the whole file before comparing — no early-exit on mismatch.
pub async fn validate(path: &std::path::Path, checksum_type: &str, expected: &str) -> Result<()> {
    if checksum_type != "sha256" {
        return Err(Error::UnsupportedChecksum(checksum_type.to_string()));
    }

    let mut file = File::open(path).await?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await?;
    let found = sha256(&buf);

    if found != expected {
        return Err(Error::ChecksumMismatch {
            path: path.display().to_string(),
            expected: expected.to_string(),
            found,
        });
    }
    Ok(())
}

/// The base64-encoded MD5 digest of a file's body, read in 1 MiB chunks, for
/// use as the `Content-MD5` header on S3 `PutObject` requests.
pub async fn content_md5(path: &std::path::Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(BASE64.encode(&hasher.finalize()))
}
