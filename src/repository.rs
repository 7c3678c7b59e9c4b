//! The upstream repository client: HEAD/GET against a plain HTTPS YUM/DNF
//! repository. This MAY NOT be an S3 bucket — the mirror talks to arbitrary
//! upstream mirrors over plain HTTPS.

use crate::chksums;
use crate::compression;
use crate::errors::*;
use crate::metadata::repomd::{parse_repomd, RepomdSection};
use crate::metadata::PackageList;
use crate::utils;
use async_tempfile::TempFile;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use reqwest_middleware::ClientWithMiddleware;
use std::path::Path;

/// A validated upstream repository base URL.
///
/// Must be `https://`, must end in `/` (appended if missing), and must not
/// contain a doubled slash in its path (a common copy-paste mistake that
/// silently breaks every relative join downstream).
#[derive(Debug, Clone)]
pub struct Repository {
    pub base_url: String,
    pub path: String,
}

impl Repository {
    pub fn new(base_url: &str) -> Result<Self> {
        if !base_url.starts_with("https://") {
            return Err(Error::Config(format!(
                "only https upstream repositories can be synced from, got {base_url:?}"
            )));
        }
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let path = url::Url::parse(&base_url)?.path().to_string();
        if path.contains("//") {
            return Err(Error::Config(format!("consecutive slashes detected in URL path: {path:?}")));
        }
        Ok(Repository { base_url, path })
    }
}

/// A fully parsed repository snapshot: every `repomd.xml` section plus the
/// lazily-iterable package list extracted from `primary.xml`.
pub struct Metadata {
    pub base_url: String,
    pub repomd_bytes: Vec<u8>,
    pub repodata: IndexMap<String, RepomdSection>,
    pub package_list: PackageList,
}

/// Talks to one upstream [`Repository`] over a shared, retrying HTTP client.
pub struct UpstreamClient {
    http: ClientWithMiddleware,
    pub repository: Repository,
    scratch_dir: std::path::PathBuf,
}

impl UpstreamClient {
    pub fn new(http: ClientWithMiddleware, repository: Repository, scratch_dir: impl Into<std::path::PathBuf>) -> Self {
        UpstreamClient {
            http,
            repository,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.repository.base_url, path)
    }

    /// `true` unless upstream's own `Last-Modified` on `repodata/repomd.xml`
    /// is at or before `since` — conservatively `true` (assume changed) when
    /// the header is absent.
    pub async fn has_updates(&self, since: DateTime<Utc>) -> Result<bool> {
        let url = self.url_for("repodata/repomd.xml");
        let resp = self.http.head(&url).send().await?.error_for_status()?;
        let Some(last_modified) = resp.headers().get(reqwest::header::LAST_MODIFIED) else {
            return Ok(true);
        };
        let last_modified = last_modified
            .to_str()
            .map_err(|_| Error::UpstreamFormat("non-ASCII Last-Modified header".to_string()))?;
        let parsed = DateTime::parse_from_rfc2822(last_modified)
            .map_err(|_| Error::UpstreamFormat(format!("unparseable Last-Modified header: {last_modified:?}")))?
            .to_utc();
        Ok(parsed > since)
    }

    /// `true` iff upstream answers with `200` for `repodata/repomd.xml`. A
    /// public S3-backed upstream answers `403` (not `404`) for a missing
    /// key, so both are treated as "does not exist" rather than surfaced as
    /// transport errors.
    pub async fn exists(&self) -> Result<bool> {
        let url = self.url_for("repodata/repomd.xml");
        let resp = self.http.get(&url).send().await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            403 | 404 => Ok(false),
            status => Err(Error::Http { status, url }),
        }
    }

    pub async fn fetch_repomd_bytes(&self) -> Result<Vec<u8>> {
        self.fetch_bytes("repodata/repomd.xml").await
    }

    pub async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url_for(path);
        utils::fetch_bytes(&self.http, &url).await
    }

    /// Download `section.location` to a scoped temp file, validate its
    /// checksum, and return the path — callers decompress or copy it
    /// themselves depending on what they need next.
    pub async fn download_section(&self, section: &RepomdSection) -> Result<TempFile> {
        let tmp = TempFile::new_in(&self.scratch_dir).await?;
        let path = tmp.file_path().to_path_buf();
        utils::download_to_file(&self.http, &section.absolute_url, &path).await?;
        chksums::validate(&path, &section.checksum_type, &section.checksum).await?;
        Ok(tmp)
    }

    /// Parse `repomd.xml` plus the full package list out of `primary.xml`.
    pub async fn parse_metadata(&self) -> Result<Metadata> {
        let repomd_bytes = self.fetch_repomd_bytes().await?;
        self.parse_metadata_from(repomd_bytes).await
    }

    /// As [`parse_metadata`](Self::parse_metadata), but starting from an
    /// already-downloaded `repomd.xml` body (used by the snapshot builder,
    /// which fetches `repomd.xml` once and reuses the bytes for both the
    /// section table and the eventual rewrite).
    pub async fn parse_metadata_from(&self, repomd_bytes: Vec<u8>) -> Result<Metadata> {
        let repodata = parse_repomd(&repomd_bytes, &self.repository.base_url)?;
        let primary = repodata
            .get("primary")
            .ok_or_else(|| Error::MissingSection("primary".to_string()))?;

        let tmp = self.download_section(primary).await?;
        let xml_bytes = compression::decompress(tmp.file_path()).await?;
        let package_list = PackageList::parse(xml_bytes, &self.repository.base_url)?;

        Ok(Metadata {
            base_url: self.repository.base_url.clone(),
            repomd_bytes,
            repodata,
            package_list,
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_requires_https() {
        let err = Repository::new("http://example.com/repo/").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_repository_appends_trailing_slash() {
        let repo = Repository::new("https://example.com/repo").unwrap();
        assert_eq!(repo.base_url, "https://example.com/repo/");
    }

    #[test]
    fn test_repository_rejects_consecutive_slashes() {
        let err = Repository::new("https://example.com//repo/").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
