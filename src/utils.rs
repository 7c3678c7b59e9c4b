use crate::errors::*;
use futures::TryStreamExt;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use std::path::Path;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{self, AsyncWriteExt};
use tokio_util::io::StreamReader;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const USER_AGENT: &str = concat!("rpm-s3-mirror/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTPS client used for upstream metadata/package
/// downloads and every object-store request: 5 total attempts, exponential
/// backoff, retried on transient 5xx responses.
///
/// `ExponentialBackoff` doesn't expose a direct `backoff_factor` knob;
/// `retry_bounds` is set to approximate a `0.1 * 2**(n-1)` schedule (0.1s,
/// 0.2s, 0.4s, 0.8s, 1.6s).
pub fn http_client(socks5: Option<&str>) -> Result<ClientWithMiddleware> {
    let mut builder = reqwest::ClientBuilder::new()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT);
    if let Some(socks5) = socks5 {
        builder = builder.proxy(reqwest::Proxy::all(socks5)?);
    }
    let reqwest = builder.build()?;

    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(100), Duration::from_secs(2))
        .build_with_max_retries(5);

    Ok(ClientBuilder::new(reqwest)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Stream `url` to `dest`. Applies the AmazonS3 `+`-sign workaround: a 403
/// on a URL containing a literal `+` is retried once with the `+`
/// percent-encoded as `%2B`, since public-read S3 decodes an unescaped `+`
/// in the path as a space and then reports the (wrong) key missing.
pub async fn download_to_file(http: &ClientWithMiddleware, url: &str, dest: &Path) -> Result<()> {
    let resp = http.get(url).send().await?;
    let resp = if resp.status().as_u16() == 403 && url.contains('+') {
        http.get(url.replace('+', "%2B")).send().await?
    } else {
        resp
    };
    let resp = resp.error_for_status()?;

    let stream = resp.bytes_stream();
    let mut reader = StreamReader::new(stream.map_err(io::Error::other));
    let mut file = File::create(dest).await?;
    io::copy(&mut reader, &mut file).await?;
    file.flush().await?;
    Ok(())
}

/// Fetch `url` fully into memory — used for `repomd.xml`, manifests, and
/// other small documents that are always parsed in their entirety anyway.
pub async fn fetch_bytes(http: &ClientWithMiddleware, url: &str) -> Result<Vec<u8>> {
    let resp = http.get(url).send().await?.error_for_status()?;
    Ok(resp.bytes().await?.to_vec())
}
