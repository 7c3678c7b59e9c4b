//! The object store adapter: `PUT`/`HEAD`/`COPY`/`LIST`/`DELETE` against a
//! bucket, signed with AWS SigV4 presigning (`s3_presign.rs`), against a
//! plain key-per-object layout.

use crate::chksums;
use crate::errors::*;
use crate::s3_presign::{self, Credentials};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_middleware::ClientWithMiddleware;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const EXPIRATION: u64 = 900; // 15 minutes
const SERVICE: &str = "s3";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// The one key-trimming rule every operation applies: a key beginning with
/// `/` is trimmed before use, so callers never accidentally create an extra
/// root directory in the bucket.
fn trim_key(key: &str) -> &str {
    key.strip_prefix('/').unwrap_or(key)
}

#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
}

/// A bucket plus the credentials and HTTP client used to talk to it.
pub struct ObjectStore {
    http: ClientWithMiddleware,
    creds: Credentials,
    bucket: String,
    region: String,
    host: String,
    endpoint: Option<String>,
}

impl ObjectStore {
    pub fn new(http: ClientWithMiddleware, creds: Credentials, bucket: String, region: String) -> Self {
        let host = crate::config::bucket_host(&region);
        ObjectStore {
            http,
            creds,
            bucket,
            region,
            host,
            endpoint: None,
        }
    }

    /// As [`new`](Self::new), but every request is sent to `endpoint_base_url`
    /// (a literal scheme+host, e.g. `http://127.0.0.1:PORT`) instead of the
    /// bucket/region-derived AWS host. Used to point the store at a local
    /// S3-compatible stub server in tests.
    pub fn with_endpoint(
        http: ClientWithMiddleware,
        creds: Credentials,
        bucket: String,
        region: String,
        endpoint_base_url: String,
    ) -> Self {
        let host = crate::config::bucket_host(&region);
        ObjectStore {
            http,
            creds,
            bucket,
            region,
            host,
            endpoint: Some(endpoint_base_url.trim_end_matches('/').to_string()),
        }
    }

    fn url_for(&self, key: &str) -> Result<reqwest::Url> {
        let key = trim_key(key);
        let url = match &self.endpoint {
            Some(endpoint) => format!("{endpoint}/{key}"),
            None => format!(
                "https://{bucket}.{host}/{key}",
                bucket = self.bucket,
                host = self.host,
            ),
        };
        Ok(reqwest::Url::parse(&url)?)
    }

    fn sign(&self, method: &str, url: &reqwest::Url, extra_headers: Vec<(String, String)>) -> Result<String> {
        let now = Utc::now();
        s3_presign::presigned_url(
            &self.creds,
            EXPIRATION,
            url,
            method,
            UNSIGNED_PAYLOAD,
            &self.region,
            &now,
            SERVICE,
            extra_headers,
        )
        .ok_or(Error::S3PresignError)
    }

    /// PUT the contents of `local_path` to `key`. Sends a `Content-MD5`
    /// computed over the file body (1 MiB chunked reads) as an integrity
    /// check, and sets `ACL: public-read` plus the requested cache age.
    pub async fn put_object(&self, local_path: &Path, key: &str, cache_age: u64) -> Result<()> {
        let key = trim_key(key);
        let content_md5 = chksums::content_md5(local_path).await?;
        let url = self.url_for(key)?;
        let signed = self.sign("PUT", &url, Vec::new())?;

        debug!("PUT: {key}");
        let mut file = File::open(local_path).await?;
        let mut body = Vec::new();
        file.read_to_end(&mut body).await?;

        let resp = self
            .http
            .put(&signed)
            .header("x-amz-acl", "public-read")
            .header("Cache-Control", format!("max-age={cache_age}"))
            .header("Content-MD5", content_md5)
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        drop(resp);
        Ok(())
    }

    /// Server-side copy within the same bucket; resets cache-control to
    /// `max-age=0` the way every copy target in this system (manifests,
    /// snapshot sections, archived `repomd.xml`) needs to be immediately
    /// re-fetchable rather than long-cached.
    pub async fn copy_object(&self, src_key: &str, dst_key: &str) -> Result<()> {
        let src_key = trim_key(src_key);
        let dst_key = trim_key(dst_key);
        debug!("COPY: {src_key} -> {dst_key}");

        let url = self.url_for(dst_key)?;
        let copy_source = format!("/{}/{}", self.bucket, src_key);
        let signed = self.sign("PUT", &url, Vec::new())?;

        self.http
            .put(&signed)
            .header("x-amz-acl", "public-read")
            .header("x-amz-copy-source", copy_source)
            .header("Cache-Control", "max-age=0")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// `HEAD` a key, returning its `Last-Modified` timestamp.
    pub async fn head_object(&self, key: &str) -> Result<DateTime<Utc>> {
        let key = trim_key(key);
        debug!("HEAD: {key}");
        let url = self.url_for(key)?;
        let signed = self.sign("HEAD", &url, Vec::new())?;
        let resp = self.http.head(&signed).send().await?.error_for_status()?;
        last_modified(resp.headers())
    }

    /// `true` unless the store reports the key missing (404); any other
    /// error status propagates.
    pub async fn object_exists(&self, key: &str) -> Result<bool> {
        let key = trim_key(key);
        let url = self.url_for(key)?;
        let signed = self.sign("HEAD", &url, Vec::new())?;
        let resp = self.http.head(&signed).send().await?;
        match resp.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            status => Err(Error::Http {
                status,
                url: signed,
            }),
        }
    }

    /// `GET` and return the full body — used for pulling small documents
    /// (`repomd.xml`, archived manifests, snapshot primaries for diffing)
    /// directly out of the mirror bucket.
    pub async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let key = trim_key(key);
        let url = self.url_for(key)?;
        let signed = self.sign("GET", &url, Vec::new())?;
        let resp = self.http.get(&signed).send().await?.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// `ListObjectsV2` under `prefix`. An empty result is `DirectoryNotFound`,
    /// since an empty listing is the only signal this system has for "that
    /// prefix doesn't exist".
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let prefix = trim_key(prefix);
        let mut url = self.url_for("")?;
        url.query_pairs_mut().append_pair("list-type", "2").append_pair("prefix", prefix);
        let signed = self.sign("GET", &url, Vec::new())?;

        let resp = self.http.get(&signed).send().await?.error_for_status()?;
        let body = resp.text().await?;
        let objects = parse_list_bucket_result(&body)?;
        if objects.is_empty() {
            return Err(Error::DirectoryNotFound(prefix.to_string()));
        }
        Ok(objects)
    }

    /// `true` iff `prefix` has at least one object underneath it.
    pub async fn exists(&self, prefix: &str) -> Result<bool> {
        match self.list(prefix).await {
            Ok(_) => Ok(true),
            Err(Error::DirectoryNotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// List then batch-delete every object under `prefix`, quietly (no
    /// per-object response is requested). A missing prefix is treated as
    /// already-deleted by callers (the snapshot rollback path suppresses
    /// `DirectoryNotFound` itself).
    pub async fn delete_subdirectory(&self, prefix: &str) -> Result<()> {
        let objects = self.list(prefix).await?;
        if objects.is_empty() {
            return Ok(());
        }

        let mut body = String::from("<Delete><Quiet>true</Quiet>");
        for object in &objects {
            body.push_str(&format!("<Object><Key>{}</Key></Object>", xml_escape(&object.key)));
        }
        body.push_str("</Delete>");

        let mut url = self.url_for("")?;
        url.query_pairs_mut().append_pair("delete", "");
        let signed = self.sign("POST", &url, Vec::new())?;

        self.http
            .post(&signed)
            .header("Content-Type", "application/xml")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// `HEAD` a repository's live `repomd.xml` under `repo_path` (e.g.
    /// `fedora/39/Everything/x86_64/os/`) and return its `Last-Modified`.
    pub async fn repomd_update_time(&self, repo_path: &str) -> Result<DateTime<Utc>> {
        let key = format!("{}repodata/repomd.xml", repo_path.trim_start_matches('/'));
        self.head_object(&key).await
    }
}

fn last_modified(headers: &HeaderMap) -> Result<DateTime<Utc>> {
    let value = headers
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::UpstreamFormat("response missing Last-Modified header".to_string()))?;
    let parsed = DateTime::parse_from_rfc2822(value)
        .map_err(|_| Error::UpstreamFormat(format!("unparseable Last-Modified header: {value:?}")))?;
    Ok(parsed.to_utc())
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// A minimal `ListBucketResult` reader: just enough to pull `Key` and
/// `LastModified` out of each `<Contents>` entry.
fn parse_list_bucket_result(xml: &str) -> Result<Vec<ObjectSummary>> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut objects = Vec::new();
    let mut buf = Vec::new();
    let mut current_key: Option<String> = None;
    let mut current_last_modified: Option<String> = None;
    let mut in_contents = false;
    let mut field: Option<&'static str> = None;

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) => match tag.local_name().as_ref() {
                b"Contents" => {
                    in_contents = true;
                    current_key = None;
                    current_last_modified = None;
                }
                b"Key" if in_contents => field = Some("key"),
                b"LastModified" if in_contents => field = Some("last_modified"),
                _ => {}
            },
            Event::Text(text) if in_contents => match field {
                Some("key") => current_key = Some(text.unescape()?.into_owned()),
                Some("last_modified") => current_last_modified = Some(text.unescape()?.into_owned()),
                _ => {}
            },
            Event::End(tag) => match tag.local_name().as_ref() {
                b"Contents" => {
                    in_contents = false;
                    if let (Some(key), Some(last_modified)) = (current_key.take(), current_last_modified.take()) {
                        let last_modified = DateTime::parse_from_rfc3339(&last_modified)
                            .map_err(|_| Error::UpstreamFormat(format!("unparseable LastModified: {last_modified:?}")))?
                            .to_utc();
                        objects.push(ObjectSummary { key, last_modified });
                    }
                }
                b"Key" | b"LastModified" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(objects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_key_strips_leading_slash() {
        assert_eq!(trim_key("/repo/repodata/repomd.xml"), "repo/repodata/repomd.xml");
        assert_eq!(trim_key("repo/repodata/repomd.xml"), "repo/repodata/repomd.xml");
    }

    #[test]
    fn test_parse_list_bucket_result() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>my-bucket</Name>
  <Prefix>repo/snapshots/</Prefix>
  <KeyCount>1</KeyCount>
  <Contents>
    <Key>repo/snapshots/2025-Q1/repodata/repomd.xml</Key>
    <LastModified>2025-01-02T03:04:05.000Z</LastModified>
    <ETag>"abc"</ETag>
    <Size>1234</Size>
  </Contents>
</ListBucketResult>
"#;
        let objects = parse_list_bucket_result(xml).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "repo/snapshots/2025-Q1/repodata/repomd.xml");
    }

    #[test]
    fn test_parse_list_bucket_result_empty() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>my-bucket</Name>
  <Prefix>repo/nope/</Prefix>
  <KeyCount>0</KeyCount>
</ListBucketResult>
"#;
        let objects = parse_list_bucket_result(xml).unwrap();
        assert!(objects.is_empty());
    }
}
