//! The mirror controller: orchestrates per-repository
//! sync/bootstrap/snapshot/sync-snapshot/diff flows and the atomic cutover.

use crate::config::{self, MirrorConfig};
use crate::errors::*;
use crate::metadata::primary::Package;
use crate::metadata::repomd::parse_repomd;
use crate::metadata::PackageList;
use crate::metrics::{self, MetricsSink, Tags};
use crate::repository::{Repository, UpstreamClient};
use crate::s3::ObjectStore;
use crate::s3_presign::Credentials;
use crate::snapshot;
use crate::transfer::{self, TransferObject};
use crate::utils;
use chrono::{DateTime, SubsecRound, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub const MANIFEST_LOCATION: &str = "manifests";

/// Persisted after every non-bootstrap sync that produced changes: the
/// archived pre-cutover `repomd.xml`'s key plus the full set of packages
/// transferred in that run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Manifest {
    pub update_time: DateTime<Utc>,
    pub upstream_repository: String,
    pub previous_repomd: String,
    pub synced_packages: Vec<Package>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct VersionRelease {
    pub version: String,
    pub release: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PackageDiff {
    pub before: Option<VersionRelease>,
    pub after: Option<VersionRelease>,
}

#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub repo_path: String,
    pub id: String,
    pub last_modified: DateTime<Utc>,
}

pub struct Mirror {
    config: MirrorConfig,
    http: reqwest_middleware::ClientWithMiddleware,
    store: Arc<ObjectStore>,
    metrics: Arc<dyn MetricsSink>,
    repositories: Vec<Repository>,
    mirror_base_url_override: Option<String>,
}

impl Mirror {
    pub fn new(config: MirrorConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self> {
        let http = utils::http_client(None)?;
        let creds = Credentials::new(&config.aws_access_key_id, &config.aws_secret_access_key, None);
        let store = Arc::new(ObjectStore::new(
            http.clone(),
            creds,
            config.bucket_name.clone(),
            config.bucket_region.clone(),
        ));
        let repositories = config
            .upstream_repositories
            .iter()
            .map(|url| Repository::new(url))
            .collect::<Result<Vec<_>>>()?;

        Ok(Mirror {
            config,
            http,
            store,
            metrics,
            repositories,
            mirror_base_url_override: None,
        })
    }

    /// Construct directly from already-built parts, bypassing the
    /// config-driven HTTP client and `ObjectStore` that [`new`](Self::new)
    /// builds. Used by tests to point the controller at stub HTTP/S3
    /// servers instead of real upstreams and AWS. `mirror_base_url_override`,
    /// if set, replaces the bucket/region-derived URL the controller
    /// otherwise uses to read its own live mirror state back.
    pub fn from_parts(
        config: MirrorConfig,
        http: reqwest_middleware::ClientWithMiddleware,
        store: Arc<ObjectStore>,
        metrics: Arc<dyn MetricsSink>,
        repositories: Vec<Repository>,
        mirror_base_url_override: Option<String>,
    ) -> Self {
        Mirror {
            config,
            http,
            store,
            metrics,
            repositories,
            mirror_base_url_override,
        }
    }

    /// The mirror's own HTTPS URL for the same repository path, used both
    /// as a freshness-comparison source and as the base for every snapshot
    /// the controller builds.
    fn mirror_url_for(&self, upstream: &Repository) -> String {
        match &self.mirror_base_url_override {
            Some(base) => format!("{}{}", base.trim_end_matches('/'), upstream.path),
            None => format!(
                "https://{bucket}.{host}{path}",
                bucket = self.config.bucket_name,
                host = config::bucket_host(&self.config.bucket_region),
                path = upstream.path,
            ),
        }
    }

    /// As `Repository::new(self.mirror_url_for(upstream))`, but when a
    /// `mirror_base_url_override` is set (tests pointing at a plain-HTTP
    /// stub server) the `https://`-only validation is skipped, since the
    /// URL was just built by this controller rather than supplied by a
    /// user.
    fn mirror_repository_for(&self, upstream: &Repository) -> Result<Repository> {
        let mirror_base_url = self.mirror_url_for(upstream);
        if self.mirror_base_url_override.is_some() {
            Ok(Repository {
                base_url: mirror_base_url,
                path: upstream.path.clone(),
            })
        } else {
            Repository::new(&mirror_base_url)
        }
    }

    /// Iterates every configured repository; a per-repository failure is
    /// logged and counted but does not abort the others. Returns `Err` iff
    /// at least one repository failed, so the binary can map it to a
    /// non-zero exit code.
    pub async fn sync(&self, bootstrap: bool) -> Result<()> {
        let start = std::time::Instant::now();
        let mut failures = 0usize;

        for upstream_repository in &self.repositories {
            let mirror_start = std::time::Instant::now();
            match self.sync_one(upstream_repository, bootstrap).await {
                Ok(synced) => {
                    info!("Updated mirror with {synced} packages");
                    self.metrics.gauge(
                        "s3_mirror_sync_seconds",
                        mirror_start.elapsed().as_secs_f64(),
                        &metrics::tag("repo", &upstream_repository.base_url),
                    );
                }
                Err(err) => {
                    error!("Failed to sync {}: {err:#}", upstream_repository.base_url);
                    self.metrics.increment("s3_mirror_sync_failures", &metrics::tag("repo", &upstream_repository.base_url));
                    failures += 1;
                }
            }
        }

        info!("Synced {} repos in {:?}", self.repositories.len(), start.elapsed());
        self.metrics
            .gauge("s3_mirror_sync_seconds_total", start.elapsed().as_secs_f64(), &Tags::new());

        if failures > 0 {
            return Err(Error::SyncFailed(failures));
        }
        Ok(())
    }

    async fn sync_one(&self, upstream_repository: &Repository, bootstrap: bool) -> Result<usize> {
        let update_time = Utc::now().trunc_subsecs(0);
        let upstream_client = UpstreamClient::new(self.http.clone(), upstream_repository.clone(), &self.config.scratch_dir);
        let upstream_metadata = upstream_client.parse_metadata().await?;

        let new_packages: Vec<Package> = if bootstrap {
            info!("Bootstrapping repository: {}", upstream_repository.base_url);
            upstream_metadata.package_list.iter()?
        } else {
            info!("Syncing repository: {}", upstream_repository.base_url);
            let mirror_repository = self.mirror_repository_for(upstream_repository)?;
            let mirror_repo_path = config::repo_path_from_url(&mirror_repository.base_url)?;
            let last_check_time = self.store.repomd_update_time(&mirror_repo_path).await?;

            if !upstream_client.has_updates(last_check_time).await? {
                info!("Skipping repository with no updates since: {last_check_time}");
                return Ok(0);
            }

            let mirror_client = UpstreamClient::new(self.http.clone(), mirror_repository, &self.config.scratch_dir);
            let mirror_metadata = mirror_client.parse_metadata().await?;
            let mirror_set: HashSet<Package> = mirror_metadata.package_list.iter()?.into_iter().collect();
            upstream_metadata
                .package_list
                .iter()?
                .into_iter()
                .filter(|p| !mirror_set.contains(p))
                .collect()
        };

        if new_packages.is_empty() {
            return Ok(0);
        }

        let mut objects: Vec<TransferObject> = new_packages.iter().cloned().map(TransferObject::Package).collect();
        for section in upstream_metadata.repodata.values() {
            objects.push(TransferObject::Section(section.clone()));
        }

        transfer::sync_objects(
            &self.http,
            &self.store,
            &self.config.scratch_dir,
            objects,
            bootstrap,
            self.config.max_workers,
        )
        .await?;

        let repo_path = config::repo_path_from_url(&upstream_repository.base_url)?;
        let live_repomd_key = format!("{repo_path}repodata/repomd.xml");

        if !bootstrap {
            let iso = update_time.to_rfc3339();
            let archive_key = format!("{repo_path}{MANIFEST_LOCATION}/{iso}/repomd.xml");
            self.store.copy_object(&live_repomd_key, &archive_key).await?;

            let manifest = Manifest {
                update_time,
                upstream_repository: upstream_repository.base_url.clone(),
                previous_repomd: archive_key,
                synced_packages: new_packages.clone(),
            };
            self.put_manifest(&repo_path, &iso, &manifest).await?;
        }

        // Cutover: download upstream's repomd.xml afresh and PUT it with
        // max-age=0, only after every section/package PUT above has
        // succeeded.
        let repomd_tmp = async_tempfile::TempFile::new_in(&self.config.scratch_dir).await?;
        let repomd_path = repomd_tmp.file_path().to_path_buf();
        utils::download_to_file(
            &self.http,
            &format!("{}repodata/repomd.xml", upstream_repository.base_url),
            &repomd_path,
        )
        .await?;
        self.store.put_object(&repomd_path, &live_repomd_key, 0).await?;

        Ok(new_packages.len())
    }

    async fn put_manifest(&self, repo_path: &str, iso: &str, manifest: &Manifest) -> Result<()> {
        info!("Writing manifest to: {repo_path}{MANIFEST_LOCATION}/{iso}/manifest.json");
        let manifest_json = serde_json::to_vec_pretty(manifest)?;
        let manifest_tmp = async_tempfile::TempFile::new_in(&self.config.scratch_dir).await?;
        let manifest_path = manifest_tmp.file_path().to_path_buf();
        tokio::fs::write(&manifest_path, &manifest_json).await?;
        let manifest_key = format!("{repo_path}{MANIFEST_LOCATION}/{iso}/manifest.json");
        self.store.put_object(&manifest_path, &manifest_key, 0).await
    }

    /// Builds a named snapshot across every configured repository, with
    /// rollback of every touched `snapshots/<id>/` prefix on failure.
    pub async fn snapshot(&self, id: &str) -> Result<()> {
        snapshot::validate_snapshot_id(id)?;
        let mut touched = Vec::new();

        let result = self.snapshot_all(id, &mut touched).await;
        if let Err(err) = result {
            for snapshot_dir in &touched {
                match self.store.delete_subdirectory(snapshot_dir).await {
                    Ok(()) => debug!("Deleted: {snapshot_dir}"),
                    Err(e) => warn!("Failed to remove snapshot: {snapshot_dir}: {e:#}"),
                }
            }
            return Err(err);
        }
        Ok(())
    }

    async fn snapshot_all(&self, id: &str, touched: &mut Vec<String>) -> Result<()> {
        for upstream_repository in &self.repositories {
            let repo_path = config::repo_path_from_url(&upstream_repository.base_url)?;
            let snapshot_dir = format!("{repo_path}snapshots/{id}/");

            if self.store.exists(&snapshot_dir).await? {
                return Err(Error::InvalidSnapshotId(id.to_string()));
            }
            touched.push(snapshot_dir.clone());

            let mirror_repository = self.mirror_repository_for(upstream_repository)?;
            let mirror_client = UpstreamClient::new(self.http.clone(), mirror_repository, &self.config.scratch_dir);

            let repo_scratch = self.config.scratch_dir.join(format!("snapshot-{id}-{}", uuid::Uuid::new_v4()));
            tokio::fs::create_dir_all(&repo_scratch).await?;
            let build = snapshot::build_snapshot(&mirror_client, &repo_scratch).await?;

            for sync_file in &build.sync_files {
                let dest = snapshot_object_key(&snapshot_dir, sync_file);
                self.store.copy_object(sync_file, &dest).await?;
            }
            for upload_file in &build.upload_files {
                let dest = snapshot_object_key(&snapshot_dir, &upload_file.to_string_lossy());
                let cache_age = if upload_file.file_name().and_then(|n| n.to_str()) == Some("repomd.xml") {
                    0
                } else {
                    transfer::DEFAULT_CACHE_AGE
                };
                self.store.put_object(upload_file, &dest, cache_age).await?;
            }
            let _ = tokio::fs::remove_dir_all(&repo_scratch).await;
        }
        Ok(())
    }

    /// **sync_snapshot(id)** — copy a named snapshot's metadata from
    /// `source_base_url` (another mirror serving the same repository
    /// layout) into this mirror's bucket over plain HTTPS.
    pub async fn sync_snapshot(&self, id: &str, source_base_url: &str) -> Result<()> {
        snapshot::validate_snapshot_id(id)?;
        let source_repo = Repository::new(source_base_url)?;

        for upstream_repository in &self.repositories {
            let repo_path = config::repo_path_from_url(&upstream_repository.base_url)?;
            let snapshot_url = format!("{}{repo_path}snapshots/{id}/", source_repo.base_url);
            let snapshot_repository = Repository::new(&snapshot_url)?;
            let snapshot_client = UpstreamClient::new(self.http.clone(), snapshot_repository, &self.config.scratch_dir);

            let repomd_bytes = snapshot_client.fetch_repomd_bytes().await?;
            let repodata = parse_repomd(&repomd_bytes, &snapshot_client.repository.base_url)?;

            for section in repodata.values() {
                let tmp = snapshot_client.download_section(section).await?;
                self.store
                    .put_object(tmp.file_path(), &section.destination_key, transfer::DEFAULT_CACHE_AGE)
                    .await?;
            }

            // PUT the snapshot's own repomd.xml body, not the last section's
            // local path, as the final write.
            let repomd_tmp = async_tempfile::TempFile::new_in(&self.config.scratch_dir).await?;
            let repomd_path = repomd_tmp.file_path().to_path_buf();
            tokio::fs::write(&repomd_path, &repomd_bytes).await?;
            let repomd_key = format!("{repo_path}snapshots/{id}/repodata/repomd.xml");
            self.store.put_object(&repomd_path, &repomd_key, 0).await?;
        }
        Ok(())
    }

    /// **diff_snapshots(old, new)** — short-circuits on equal `primary`
    /// checksums; otherwise reports `{version, release}` before/after for
    /// every package whose identity key changed, keyed by name.
    pub async fn diff_snapshots(&self, repo_path: &str, old_id: &str, new_id: &str) -> Result<BTreeMap<String, PackageDiff>> {
        snapshot::validate_snapshot_id(old_id)?;
        snapshot::validate_snapshot_id(new_id)?;

        let repo_base = format!(
            "https://{bucket}.{host}/",
            bucket = self.config.bucket_name,
            host = config::bucket_host(&self.config.bucket_region),
        );
        let old_base_url = format!("{repo_base}{repo_path}snapshots/{old_id}/");
        let new_base_url = format!("{repo_base}{repo_path}snapshots/{new_id}/");

        let old_repomd_key = format!("{repo_path}snapshots/{old_id}/repodata/repomd.xml");
        let new_repomd_key = format!("{repo_path}snapshots/{new_id}/repodata/repomd.xml");
        let old_repomd_bytes = self.store.get_object(&old_repomd_key).await?;
        let new_repomd_bytes = self.store.get_object(&new_repomd_key).await?;

        let old_sections = parse_repomd(&old_repomd_bytes, &old_base_url)?;
        let new_sections = parse_repomd(&new_repomd_bytes, &new_base_url)?;
        let old_primary = old_sections.get("primary").ok_or_else(|| Error::MissingSection("primary".to_string()))?;
        let new_primary = new_sections.get("primary").ok_or_else(|| Error::MissingSection("primary".to_string()))?;

        if old_primary.checksum == new_primary.checksum {
            return Ok(BTreeMap::new());
        }

        let old_primary_bytes = self.store.get_object(&old_primary.destination_key).await?;
        let new_primary_bytes = self.store.get_object(&new_primary.destination_key).await?;
        let old_xml = crate::compression::decompress_bytes(&old_primary_bytes).await?;
        let new_xml = crate::compression::decompress_bytes(&new_primary_bytes).await?;

        let old_packages = PackageList::parse(old_xml, &old_base_url)?.iter()?;
        let new_packages = PackageList::parse(new_xml, &new_base_url)?.iter()?;

        let old_by_name: HashMap<String, VersionRelease> = old_packages
            .iter()
            .map(|p| (p.name.clone(), VersionRelease { version: p.version.clone(), release: p.release.clone() }))
            .collect();
        let old_set: HashSet<Package> = old_packages.into_iter().collect();

        let mut diff = BTreeMap::new();
        for package in new_packages.into_iter().filter(|p| !old_set.contains(p)) {
            diff.insert(
                package.name.clone(),
                PackageDiff {
                    before: old_by_name.get(&package.name).cloned(),
                    after: Some(VersionRelease { version: package.version, release: package.release }),
                },
            );
        }
        Ok(diff)
    }

    /// **list_snapshots()** — index every committed snapshot (one whose
    /// `repodata/repomd.xml` key exists) by `(repo_path, id)`.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        let mut out = Vec::new();
        for upstream_repository in &self.repositories {
            let repo_path = config::repo_path_from_url(&upstream_repository.base_url)?;
            let prefix = format!("{repo_path}snapshots/");
            let objects = match self.store.list(&prefix).await {
                Ok(objects) => objects,
                Err(Error::DirectoryNotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            for object in objects {
                if let Some(id) = extract_snapshot_id(&object.key, &prefix) {
                    out.push(SnapshotInfo {
                        repo_path: repo_path.clone(),
                        id,
                        last_modified: object.last_modified,
                    });
                }
            }
        }
        Ok(out)
    }
}

fn extract_snapshot_id(key: &str, prefix: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    let (id, tail) = rest.split_once('/')?;
    (tail == "repodata/repomd.xml").then(|| id.to_string())
}

fn snapshot_object_key(snapshot_dir: &str, file_path: &str) -> String {
    let basename = Path::new(file_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_path);
    format!("{snapshot_dir}repodata/{basename}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_snapshot_id_matches_committed_snapshot() {
        let id = extract_snapshot_id("fedora/39/os/snapshots/2025-Q1/repodata/repomd.xml", "fedora/39/os/snapshots/");
        assert_eq!(id, Some("2025-Q1".to_string()));
    }

    #[test]
    fn test_extract_snapshot_id_ignores_non_repomd_keys() {
        let id = extract_snapshot_id(
            "fedora/39/os/snapshots/2025-Q1/repodata/primary.xml.gz",
            "fedora/39/os/snapshots/",
        );
        assert_eq!(id, None);
    }

    #[test]
    fn test_snapshot_object_key_uses_basename() {
        let key = snapshot_object_key("fedora/39/os/snapshots/2025-Q1/", "/tmp/scratch/deadbeef-primary.xml.gz");
        assert_eq!(key, "fedora/39/os/snapshots/2025-Q1/repodata/deadbeef-primary.xml.gz");
    }
}
