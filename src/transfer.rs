//! The transfer pool: bounded-concurrency fan-out of
//! `(download -> validate -> upload)` tasks, built on a
//! `tokio::sync::Semaphore` + `JoinSet` pair.

use crate::chksums;
use crate::errors::*;
use crate::metadata::primary::Package;
use crate::metadata::repomd::RepomdSection;
use crate::s3::ObjectStore;
use crate::utils;
use async_tempfile::TempFile;
use reqwest_middleware::ClientWithMiddleware;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

pub const DEFAULT_CACHE_AGE: u64 = 31_536_000;

/// Either kind of object the transfer pool moves: a package blob or a
/// repodata section blob. Both carry everything a transfer task needs.
#[derive(Debug, Clone)]
pub enum TransferObject {
    Package(Package),
    Section(RepomdSection),
}

impl TransferObject {
    fn absolute_url(&self) -> &str {
        match self {
            TransferObject::Package(p) => &p.absolute_url,
            TransferObject::Section(s) => &s.absolute_url,
        }
    }

    fn destination_key(&self) -> &str {
        match self {
            TransferObject::Package(p) => &p.destination_key,
            TransferObject::Section(s) => &s.destination_key,
        }
    }

    fn checksum_type(&self) -> &str {
        match self {
            TransferObject::Package(p) => &p.checksum_type,
            TransferObject::Section(s) => &s.checksum_type,
        }
    }

    fn checksum(&self) -> &str {
        match self {
            TransferObject::Package(p) => &p.checksum,
            TransferObject::Section(s) => &s.checksum,
        }
    }
}

/// Drive `objects` through the pool at width `max_workers`. `skip_existing`
/// is set only during bootstrap — outside of bootstrap we expect every
/// object to be genuinely new and skip the extra round-trip.
///
/// Errors from any task propagate to the caller once every in-flight task
/// has finished; the repository's sync is aborted by the caller, not by
/// this pool (partial uploads are left in place — every key is content
/// addressed, so they're harmless).
pub async fn sync_objects(
    http: &ClientWithMiddleware,
    store: &Arc<ObjectStore>,
    scratch_dir: &std::path::Path,
    objects: Vec<TransferObject>,
    skip_existing: bool,
    max_workers: usize,
) -> Result<()> {
    let total = objects.len();
    info!("Beginning sync of {total} objects.");
    let start = std::time::Instant::now();

    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let mut tasks = JoinSet::new();

    for object in objects {
        let http = http.clone();
        let store = Arc::clone(store);
        let scratch_dir = scratch_dir.to_path_buf();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            sync_object(&http, &store, &scratch_dir, object, skip_existing).await
        });
    }

    let mut first_error = None;
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => first_error.get_or_insert(err),
            Err(join_err) => first_error.get_or_insert(join_err.into()),
        };
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    debug!("Completed syncing {total} objects in {:?}", start.elapsed());
    Ok(())
}

async fn sync_object(
    http: &ClientWithMiddleware,
    store: &ObjectStore,
    scratch_dir: &std::path::Path,
    object: TransferObject,
    skip_existing: bool,
) -> Result<()> {
    let destination = object.destination_key();
    let workaround_destination = destination.replace('+', " ");

    if skip_existing {
        // A `+` destination is only "already present" when both variants exist.
        let exists = if destination.contains('+') {
            store.object_exists(&workaround_destination).await? && store.object_exists(destination).await?
        } else {
            store.object_exists(destination).await?
        };
        if exists {
            debug!("SKIP: {destination}");
            return Ok(());
        }
    }

    let tmp = TempFile::new_in(scratch_dir).await?;
    let path = tmp.file_path().to_path_buf();
    utils::download_to_file(http, object.absolute_url(), &path).await?;
    chksums::validate(&path, object.checksum_type(), object.checksum()).await?;

    store.put_object(&path, destination, DEFAULT_CACHE_AGE).await?;
    if destination.contains('+') {
        // Old DNF clients never urlencoded `+` in URLs, and S3 always
        // decodes an unescaped `+` in a key as a space, so both spellings
        // of the key need to exist for every client to resolve the package.
        debug!("Uploading workaround version of package: {destination} -> {workaround_destination}");
        store.put_object(&path, &workaround_destination, DEFAULT_CACHE_AGE).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(destination_key: &str) -> TransferObject {
        TransferObject::Section(RepomdSection {
            section_type: "primary".to_string(),
            location: "repodata/primary.xml.gz".to_string(),
            absolute_url: format!("https://example.com/{destination_key}"),
            destination_key: destination_key.to_string(),
            checksum: "deadbeef".to_string(),
            checksum_type: "sha256".to_string(),
            open_checksum: None,
            size: None,
            open_size: None,
            header_checksum: None,
            header_size: None,
        })
    }

    #[test]
    fn test_destination_key_accessor() {
        let object = section("repo/Packages/g/g++-1.rpm");
        assert_eq!(object.destination_key(), "repo/Packages/g/g++-1.rpm");
    }

    #[test]
    fn test_workaround_destination_replaces_plus_with_space() {
        let destination = "repo/Packages/g/g++-1.rpm";
        assert_eq!(destination.replace('+', " "), "repo/Packages/g/g  -1.rpm");
    }
}
