//! End-to-end coverage of the upstream repository client against a
//! stubbed HTTPS-shaped server, covering retry/freshness/parsing behavior
//! rather than only unit-testing the XML readers in isolation.
//!
//! `wiremock` only speaks plain HTTP, so these tests build `Repository`
//! via its public fields directly instead of `Repository::new` (which
//! enforces the `https://`-only rule covered separately by
//! `repository.rs`'s own unit tests).

use pretty_assertions::assert_eq;
use rpm_s3_mirror::compression;
use rpm_s3_mirror::repository::{Repository, UpstreamClient};
use rpm_s3_mirror::utils;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PRIMARY_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="1">
  <package type="rpm">
    <name>bash</name>
    <arch>x86_64</arch>
    <version epoch="0" ver="5.2.15" rel="3.fc39"/>
    <checksum type="sha256" pkgid="YES">1111111111111111111111111111111111111111111111111111111111111111</checksum>
    <summary>The GNU Bourne Again shell</summary>
    <size package="1806340" installed="6713523" archive="6723672"/>
    <location href="Packages/b/bash-5.2.15-3.fc39.x86_64.rpm"/>
  </package>
</metadata>
"#;

fn repository_for(server: &MockServer) -> Repository {
    Repository {
        base_url: format!("{}/repo/", server.uri()),
        path: "/repo/".to_string(),
    }
}

async fn mount_repomd_and_primary(server: &MockServer) {
    let compressed = compression::compress_gzip(PRIMARY_XML.as_bytes()).await.unwrap();
    let checksum = rpm_s3_mirror::chksums::sha256(&compressed);
    let open_checksum = rpm_s3_mirror::chksums::sha256(PRIMARY_XML.as_bytes());
    let repomd = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <data type="primary">
    <checksum type="sha256">{checksum}</checksum>
    <open-checksum type="sha256">{open_checksum}</open-checksum>
    <location href="repodata/primary.xml.gz"/>
    <size>{}</size>
    <open-size>{}</open-size>
  </data>
</repomd>
"#,
        compressed.len(),
        PRIMARY_XML.len(),
    );

    Mock::given(method("GET"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_string(repomd))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/primary.xml.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(compressed))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_has_updates_true_without_last_modified_header() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let http = utils::http_client(None).unwrap();
    let client = UpstreamClient::new(http, repository_for(&server), std::env::temp_dir());

    let since = chrono::Utc::now();
    let has_updates = client.has_updates(since).await.unwrap();
    assert!(has_updates, "missing Last-Modified must be treated as updated");
}

#[tokio::test]
async fn test_has_updates_compares_last_modified() {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(200).insert_header("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"))
        .mount(&server)
        .await;

    let http = utils::http_client(None).unwrap();
    let client = UpstreamClient::new(http, repository_for(&server), std::env::temp_dir());

    let since = "2024-01-02T00:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap();
    assert!(!client.has_updates(since).await.unwrap());

    let since = "2023-12-31T00:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap();
    assert!(client.has_updates(since).await.unwrap());
}

#[tokio::test]
async fn test_exists_treats_403_and_404_as_absent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/repo/repodata/repomd.xml"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let http = utils::http_client(None).unwrap();
    let client = UpstreamClient::new(http, repository_for(&server), std::env::temp_dir());
    assert!(!client.exists().await.unwrap());
}

#[tokio::test]
async fn test_exists_true_on_200() {
    let server = MockServer::start().await;
    mount_repomd_and_primary(&server).await;

    let http = utils::http_client(None).unwrap();
    let client = UpstreamClient::new(http, repository_for(&server), std::env::temp_dir());
    assert!(client.exists().await.unwrap());
}

#[tokio::test]
async fn test_parse_metadata_round_trips_package_list() {
    let server = MockServer::start().await;
    mount_repomd_and_primary(&server).await;

    let http = utils::http_client(None).unwrap();
    let client = UpstreamClient::new(http, repository_for(&server), std::env::temp_dir());

    let metadata = client.parse_metadata().await.unwrap();
    assert_eq!(metadata.package_list.len(), 1);
    let packages = metadata.package_list.iter().unwrap();
    assert_eq!(packages[0].name, "bash");
    assert_eq!(
        packages[0].absolute_url,
        format!("{}/repo/Packages/b/bash-5.2.15-3.fc39.x86_64.rpm", server.uri())
    );
}
