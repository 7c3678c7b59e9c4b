//! End-to-end coverage of the `Mirror` controller against stubbed upstream,
//! live-mirror, and object-store servers: bootstrap, incremental sync,
//! snapshot-with-rollback, and a two-snapshot diff whose checksums actually
//! differ (the non-short-circuit path `mod tests` in `src/mirror.rs` never
//! reaches).
//!
//! Every `Repository` here is built via its public fields directly, since
//! `wiremock` only speaks plain HTTP and `Repository::new` enforces
//! `https://`. `Mirror::from_parts` and `ObjectStore::with_endpoint` exist
//! for the same reason: they let the controller and its store point at
//! local stub servers instead of real upstreams and AWS.

use pretty_assertions::assert_eq;
use rpm_s3_mirror::compression;
use rpm_s3_mirror::config::MirrorConfig;
use rpm_s3_mirror::chksums;
use rpm_s3_mirror::metrics::NullMetricsSink;
use rpm_s3_mirror::mirror::Mirror;
use rpm_s3_mirror::repository::Repository;
use rpm_s3_mirror::s3::ObjectStore;
use rpm_s3_mirror::s3_presign::Credentials;
use rpm_s3_mirror::utils;
use std::sync::Arc;
use wiremock::matchers::{method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn creds() -> Credentials {
    Credentials::new("AKIAFAKE", "fake-secret", None)
}

fn test_config(repos: Vec<String>, scratch_dir: std::path::PathBuf) -> MirrorConfig {
    MirrorConfig {
        aws_access_key_id: "AKIAFAKE".to_string(),
        aws_secret_access_key: "fake-secret".to_string(),
        bucket_name: "test-mirror".to_string(),
        bucket_region: "us-east-1".to_string(),
        upstream_repositories: repos,
        max_workers: 4,
        scratch_dir,
    }
}

fn repo_at(server: &MockServer, repo_path: &str) -> Repository {
    Repository {
        base_url: format!("{}{repo_path}", server.uri()),
        path: repo_path.to_string(),
    }
}

fn package_entry(name: &str, version: &str, release: &str, location: &str, checksum: &str, size: usize) -> String {
    format!(
        r#"  <package type="rpm">
    <name>{name}</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="{version}" rel="{release}"/>
    <checksum type="sha256" pkgid="YES">{checksum}</checksum>
    <summary>{name}</summary>
    <size package="{size}" installed="{size}" archive="{size}"/>
    <location href="{location}"/>
  </package>
"#
    )
}

fn primary_xml(entries: &[String]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="{}">
{}</metadata>
"#,
        entries.len(),
        entries.join("")
    )
}

/// Gzips `primary_xml_text`, returns `(repomd.xml body, primary.xml.gz body)`.
async fn repomd_and_primary_gz(primary_xml_text: &str, primary_location: &str) -> (String, Vec<u8>) {
    let compressed = compression::compress_gzip(primary_xml_text.as_bytes()).await.unwrap();
    let checksum = chksums::sha256(&compressed);
    let open_checksum = chksums::sha256(primary_xml_text.as_bytes());
    let repomd = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="primary">
    <checksum type="sha256">{checksum}</checksum>
    <open-checksum type="sha256">{open_checksum}</open-checksum>
    <location href="{primary_location}"/>
    <size>{}</size>
    <open-size>{}</open-size>
  </data>
</repomd>
"#,
        compressed.len(),
        primary_xml_text.len(),
    );
    (repomd, compressed)
}

fn list_bucket_result(prefix: &str, keys: &[&str]) -> String {
    if keys.is_empty() {
        return format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>test-mirror</Name>
  <Prefix>{prefix}</Prefix>
  <KeyCount>0</KeyCount>
</ListBucketResult>
"#
        );
    }
    let contents: String = keys
        .iter()
        .map(|key| {
            format!(
                r#"  <Contents>
    <Key>{key}</Key>
    <LastModified>2025-01-02T03:04:05.000Z</LastModified>
    <ETag>"abc"</ETag>
    <Size>123</Size>
  </Contents>
"#
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>test-mirror</Name>
  <Prefix>{prefix}</Prefix>
  <KeyCount>{}</KeyCount>
{contents}</ListBucketResult>
"#,
        keys.len(),
    )
}

#[tokio::test]
async fn test_bootstrap_uploads_every_object_with_existence_check() {
    let upstream = MockServer::start().await;
    let store = MockServer::start().await;

    let package_body = b"bootstrap bash rpm bytes".to_vec();
    let package_checksum = chksums::sha256(&package_body);
    let entry = package_entry(
        "bash",
        "5.2.15",
        "3.fc39",
        "Packages/b/bash-5.2.15-3.fc39.x86_64.rpm",
        &package_checksum,
        package_body.len(),
    );
    let primary = primary_xml(&[entry]);
    let (repomd, primary_gz) = repomd_and_primary_gz(&primary, "repodata/primary.xml.gz").await;

    Mock::given(method("GET"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(repomd))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(primary_gz))
        .expect(2) // once building the package list, once as a transferred section
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/Packages/b/bash-5.2.15-3.fc39.x86_64.rpm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(package_body))
        .expect(1)
        .mount(&upstream)
        .await;

    // Bootstrap still existence-checks every object before transfer; both come back absent.
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(404))
        .expect(2)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repo/Packages/b/bash-5.2.15-3.fc39.x86_64.rpm"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repo/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&store)
        .await;

    let scratch = tempfile::tempdir().unwrap();
    let http = utils::http_client(None).unwrap();
    let store_client = ObjectStore::with_endpoint(http.clone(), creds(), "test-mirror".to_string(), "us-east-1".to_string(), store.uri());
    let config = test_config(vec![], scratch.path().to_path_buf());
    let mirror = Mirror::from_parts(config, http, Arc::new(store_client), Arc::new(NullMetricsSink), vec![repo_at(&upstream, "/repo/")], None);

    mirror.sync(true).await.unwrap();
}

#[tokio::test]
async fn test_incremental_sync_uploads_only_the_new_package() {
    let upstream = MockServer::start().await;
    let mirror_server = MockServer::start().await;
    let store = MockServer::start().await;

    let bash_body = b"already-mirrored bash bytes".to_vec();
    let bash_checksum = chksums::sha256(&bash_body);
    let bash_entry = package_entry("bash", "5.2.15", "3.fc39", "Packages/b/bash-5.2.15-3.fc39.x86_64.rpm", &bash_checksum, bash_body.len());

    let vim_body = b"new vim bytes".to_vec();
    let vim_checksum = chksums::sha256(&vim_body);
    let vim_entry = package_entry("vim", "9.0", "1.fc39", "Packages/v/vim-9.0-1.fc39.x86_64.rpm", &vim_checksum, vim_body.len());

    let mirror_primary = primary_xml(&[bash_entry.clone()]);
    let (mirror_repomd, mirror_primary_gz) = repomd_and_primary_gz(&mirror_primary, "repodata/primary.xml.gz").await;
    let upstream_primary = primary_xml(&[bash_entry, vim_entry]);
    let (upstream_repomd, upstream_primary_gz) = repomd_and_primary_gz(&upstream_primary, "repodata/primary.xml.gz").await;

    Mock::given(method("HEAD"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).insert_header("Last-Modified", "Wed, 01 Jan 2025 00:00:00 GMT"))
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(upstream_repomd))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(upstream_primary_gz))
        .expect(2) // once building the package list, once as a transferred section
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/Packages/v/vim-9.0-1.fc39.x86_64.rpm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vim_body))
        .expect(1)
        .mount(&upstream)
        .await;

    Mock::given(method("GET"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(mirror_repomd))
        .mount(&mirror_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(mirror_primary_gz))
        .mount(&mirror_server)
        .await;

    Mock::given(method("HEAD"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"))
        .expect(1)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repo/Packages/v/vim-9.0-1.fc39.x86_64.rpm"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repo/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/repo/manifests/.*"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2) // archive copy + manifest.json
        .mount(&store)
        .await;
    Mock::given(method("PUT"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&store)
        .await;

    let scratch = tempfile::tempdir().unwrap();
    let http = utils::http_client(None).unwrap();
    let store_client = ObjectStore::with_endpoint(http.clone(), creds(), "test-mirror".to_string(), "us-east-1".to_string(), store.uri());
    let config = test_config(vec![], scratch.path().to_path_buf());
    let mirror = Mirror::from_parts(
        config,
        http,
        Arc::new(store_client),
        Arc::new(NullMetricsSink),
        vec![repo_at(&upstream, "/repo/")],
        Some(mirror_server.uri()),
    );

    // Bootstrap is false: bash is already on the mirror and must never be
    // re-fetched or re-uploaded (no mock is mounted for its store PUT path).
    mirror.sync(false).await.unwrap();
}

#[tokio::test]
async fn test_snapshot_failure_rolls_back_every_touched_prefix() {
    let mirror_server = MockServer::start().await;
    let store = MockServer::start().await;

    let package = package_entry("bash", "5.2.15", "3.fc39", "Packages/b/bash-5.2.15-3.fc39.x86_64.rpm", &chksums::sha256(b"bash"), 4);
    let primary = primary_xml(&[package]);
    let (repomd, primary_gz) = repomd_and_primary_gz(&primary, "repodata/primary.xml.gz").await;

    Mock::given(method("GET"))
        .and(path("/repo1/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(repomd))
        .mount(&mirror_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo1/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(primary_gz))
        .mount(&mirror_server)
        .await;
    // repo2's mirror metadata is unreachable, so its snapshot build fails.
    Mock::given(method("GET"))
        .and(path("/repo2/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mirror_server)
        .await;

    let repo1_prefix = "repo1/snapshots/snap1/";
    let repo2_prefix = "repo2/snapshots/snap1/";

    Mock::given(method("GET"))
        .and(query_param("list-type", "2"))
        .and(query_param("prefix", repo1_prefix))
        .respond_with(ResponseTemplate::new(200).set_body_string(list_bucket_result(repo1_prefix, &[])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(query_param("list-type", "2"))
        .and(query_param("prefix", repo1_prefix))
        .respond_with(ResponseTemplate::new(200).set_body_string(list_bucket_result(
            repo1_prefix,
            &[&format!("{repo1_prefix}repodata/repomd.xml")],
        )))
        .with_priority(2)
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(query_param("list-type", "2"))
        .and(query_param("prefix", repo2_prefix))
        .respond_with(ResponseTemplate::new(200).set_body_string(list_bucket_result(repo2_prefix, &[])))
        .mount(&store)
        .await;

    let repo1_put_regex = format!("^/{repo1_prefix}repodata/.*");
    Mock::given(method("PUT"))
        .and(path_regex(repo1_put_regex.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(3) // synced original primary.xml.gz + rewritten primary.xml.gz + repomd.xml
        .mount(&store)
        .await;
    Mock::given(method("POST"))
        .and(path("/"))
        .and(query_param("delete", ""))
        .respond_with(ResponseTemplate::new(200))
        .expect(1) // only repo1 actually wrote anything to roll back
        .mount(&store)
        .await;

    let scratch = tempfile::tempdir().unwrap();
    let http = utils::http_client(None).unwrap();
    let store_client = ObjectStore::with_endpoint(http.clone(), creds(), "test-mirror".to_string(), "us-east-1".to_string(), store.uri());
    let config = test_config(vec![], scratch.path().to_path_buf());
    let repositories = vec![
        Repository::new("https://repo1.invalid/repo1/").unwrap(),
        Repository::new("https://repo2.invalid/repo2/").unwrap(),
    ];
    let mirror = Mirror::from_parts(
        config,
        http,
        Arc::new(store_client),
        Arc::new(NullMetricsSink),
        repositories,
        Some(mirror_server.uri()),
    );

    let result = mirror.snapshot("snap1").await;
    assert!(result.is_err(), "repo2's unreachable mirror metadata must fail the whole snapshot");
}

#[tokio::test]
async fn test_diff_snapshots_resolves_per_snapshot_destination_keys() {
    let store = MockServer::start().await;

    let old_primary = primary_xml(&[package_entry(
        "bash",
        "1.0",
        "1",
        "Packages/b/bash-1.0-1.x86_64.rpm",
        &chksums::sha256(b"bash-v1"),
        7,
    )]);
    let new_primary = primary_xml(&[
        package_entry("bash", "2.0", "1", "Packages/b/bash-2.0-1.x86_64.rpm", &chksums::sha256(b"bash-v2"), 7),
        package_entry("vim", "9.0", "1", "Packages/v/vim-9.0-1.x86_64.rpm", &chksums::sha256(b"vim-v1"), 6),
    ]);

    let (old_repomd, old_primary_gz) = repomd_and_primary_gz(&old_primary, "repodata/old-primary.xml.gz").await;
    let (new_repomd, new_primary_gz) = repomd_and_primary_gz(&new_primary, "repodata/new-primary.xml.gz").await;

    Mock::given(method("GET"))
        .and(path("/repo1/snapshots/old/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(old_repomd))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo1/snapshots/old/repodata/old-primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(old_primary_gz))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo1/snapshots/new/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(new_repomd))
        .mount(&store)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo1/snapshots/new/repodata/new-primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(new_primary_gz))
        .mount(&store)
        .await;

    let scratch = tempfile::tempdir().unwrap();
    let http = utils::http_client(None).unwrap();
    let store_client = ObjectStore::with_endpoint(http.clone(), creds(), "test-mirror".to_string(), "us-east-1".to_string(), store.uri());
    let config = test_config(vec![], scratch.path().to_path_buf());
    let mirror = Mirror::from_parts(config, http, Arc::new(store_client), Arc::new(NullMetricsSink), vec![], None);

    let diff = mirror.diff_snapshots("repo1/", "old", "new").await.unwrap();

    assert_eq!(diff.len(), 2);
    let bash = diff.get("bash").expect("bash changed version/release between snapshots");
    assert_eq!(bash.before.as_ref().map(|vr| vr.version.as_str()), Some("1.0"));
    assert_eq!(bash.after.as_ref().map(|vr| vr.version.as_str()), Some("2.0"));
    let vim = diff.get("vim").expect("vim is new in the `new` snapshot");
    assert!(vim.before.is_none());
    assert_eq!(vim.after.as_ref().map(|vr| vr.version.as_str()), Some("9.0"));
}
