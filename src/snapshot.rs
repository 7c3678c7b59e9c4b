//! The snapshot builder and the updateinfo-rewriter composition: rewrites
//! metadata into a self-consistent subtree referencing the live mirror's
//! package blobs, and prunes `updateinfo` down to a target architecture set.

use crate::chksums;
use crate::compression;
use crate::errors::*;
use crate::metadata::primary::rewrite_locations;
use crate::metadata::repomd::{parse_repomd, rewrite_section, RewrittenSection};
use crate::metadata::updateinfo::{strip_arches, unzck, zck_compress, zck_read_header, ZckHeader};
use crate::repository::UpstreamClient;
use regex::Regex;
use std::path::PathBuf;
use std::sync::OnceLock;

/// `^[A-Za-z0-9_-]+$`, re-checked for a literal newline rather than trusting
/// the regex anchors alone.
fn snapshot_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap())
}

pub fn validate_snapshot_id(id: &str) -> Result<()> {
    if id.contains('\n') || !snapshot_id_re().is_match(id) {
        return Err(Error::InvalidSnapshotId(id.to_string()));
    }
    Ok(())
}

/// The two file sets a snapshot (or an arch-pruned rewrite) produces:
/// `sync_files` are existing mirror keys to server-side copy unchanged;
/// `upload_files` are newly produced local files to PUT.
pub struct RepoDataFiles {
    pub sync_files: Vec<String>,
    pub upload_files: Vec<PathBuf>,
}

/// Build a self-consistent snapshot subtree: rewrite `primary.xml`'s package
/// locations to point two directories back up at the live mirror, recompute
/// its checksum/size, and patch those into a rewritten `repomd.xml`.
/// `client` is expected to point at the *mirror's own* HTTPS URL
/// (constructed by the caller), not the original upstream.
pub async fn build_snapshot(client: &UpstreamClient, scratch_dir: &std::path::Path) -> Result<RepoDataFiles> {
    let repomd_bytes = client.fetch_repomd_bytes().await?;
    let repodata = parse_repomd(&repomd_bytes, &client.repository.base_url)?;
    let primary = repodata
        .get("primary")
        .ok_or_else(|| Error::MissingSection("primary".to_string()))?;

    let tmp = client.download_section(primary).await?;
    let decompressed = compression::decompress(tmp.file_path()).await?;
    let open_checksum = chksums::sha256(&decompressed);
    let open_size = decompressed.len() as u64;

    let rewritten_xml = rewrite_locations(&decompressed, "../../")?;
    let compressed = compression::compress_gzip(&rewritten_xml).await?;
    let checksum = chksums::sha256(&compressed);
    let size = compressed.len() as u64;

    let primary_path = scratch_dir.join(format!("{checksum}-primary.xml.gz"));
    tokio::fs::write(&primary_path, &compressed).await?;

    let replacement = RewrittenSection {
        checksum: checksum.clone(),
        open_checksum,
        location: format!("repodata/{checksum}-primary.xml.gz"),
        size,
        open_size,
        header_checksum: None,
        header_size: None,
    };
    let rewritten_repomd = rewrite_section(&repomd_bytes, "primary", &replacement)?;
    let repomd_path = scratch_dir.join("repomd.xml");
    tokio::fs::write(&repomd_path, &rewritten_repomd).await?;

    let sync_files = repodata
        .values()
        .filter(|section| {
            section.location.ends_with(".xml.gz")
                || section.location.ends_with("updateinfo.xml.xz")
                || section.location.ends_with("modules.yaml.gz")
        })
        .map(|section| section.destination_key.clone())
        .collect();

    Ok(RepoDataFiles {
        sync_files,
        upload_files: vec![repomd_path, primary_path],
    })
}

/// Strip `updateinfo` down to `target_arches`: re-emit the section with the
/// same compression format it arrived in (`.xz` or `.zck`), recompute its
/// checksum/size from the pre-compression bytes, and patch the result into
/// `repomd.xml` via the same byte-level rewrite the snapshot builder uses.
pub async fn strip_metadata(
    client: &UpstreamClient,
    repomd_bytes: &[u8],
    target_arches: &[String],
    scratch_dir: &std::path::Path,
) -> Result<RepoDataFiles> {
    let repodata = parse_repomd(repomd_bytes, &client.repository.base_url)?;
    let mut repomd_bytes = repomd_bytes.to_vec();
    let mut upload_files = Vec::new();

    for (key, section) in &repodata {
        if !key.starts_with("updateinfo") {
            continue;
        }

        let tmp = client.download_section(section).await?;
        let replacement = if section.location.ends_with(".zck") {
            strip_zck(tmp.file_path(), target_arches, scratch_dir).await?
        } else if section.location.ends_with(".xz") {
            strip_xz(tmp.file_path(), target_arches, scratch_dir).await?
        } else {
            return Err(Error::UpstreamFormat(format!(
                "updateinfo section {key} has unsupported extension: {}",
                section.location
            )));
        };

        repomd_bytes = rewrite_section(&repomd_bytes, key, &replacement.section)?;
        upload_files.push(replacement.local_path);
    }

    let repomd_path = scratch_dir.join("repomd.xml");
    tokio::fs::write(&repomd_path, &repomd_bytes).await?;
    upload_files.push(repomd_path);

    Ok(RepoDataFiles {
        sync_files: Vec::new(),
        upload_files,
    })
}

struct StrippedSection {
    section: RewrittenSection,
    local_path: PathBuf,
}

async fn strip_xz(src: &std::path::Path, target_arches: &[String], scratch_dir: &std::path::Path) -> Result<StrippedSection> {
    let bytes = tokio::fs::read(src).await?;
    let xml = compression::decompress_xz(&bytes).await?;
    let open_size = xml.len() as u64;
    let open_checksum = chksums::sha256(&xml);

    let stripped = strip_arches(&xml, target_arches)?;
    let compressed = compression::compress_xz(&stripped).await?;
    let checksum = chksums::sha256(&compressed);
    let size = compressed.len() as u64;

    let local_path = scratch_dir.join(format!("{checksum}-updateinfo.xml.xz"));
    tokio::fs::write(&local_path, &compressed).await?;

    Ok(StrippedSection {
        section: RewrittenSection {
            checksum,
            open_checksum,
            location: format!("repodata/{checksum}-updateinfo.xml.xz"),
            size,
            open_size,
            header_checksum: None,
            header_size: None,
        },
        local_path,
    })
}

async fn strip_zck(src: &std::path::Path, target_arches: &[String], scratch_dir: &std::path::Path) -> Result<StrippedSection> {
    let raw_path = scratch_dir.join("updateinfo-raw.xml");
    unzck(src, &raw_path).await?;
    let xml = tokio::fs::read(&raw_path).await?;
    let open_size = xml.len() as u64;
    let open_checksum = chksums::sha256(&xml);

    let stripped = strip_arches(&xml, target_arches)?;
    let stripped_path = scratch_dir.join("stripped.xml");
    tokio::fs::write(&stripped_path, &stripped).await?;

    let compressed_path = scratch_dir.join("stripped.xml.zck");
    zck_compress(&stripped_path, &compressed_path).await?;
    let compressed = tokio::fs::read(&compressed_path).await?;
    let checksum = chksums::sha256(&compressed);
    let size = compressed.len() as u64;

    let ZckHeader {
        checksum: header_checksum,
        size: header_size,
    } = zck_read_header(&compressed_path).await?;

    let final_path = scratch_dir.join(format!("{checksum}-updateinfo.xml.zck"));
    tokio::fs::rename(&compressed_path, &final_path).await?;

    Ok(StrippedSection {
        section: RewrittenSection {
            checksum,
            open_checksum,
            location: format!("repodata/{checksum}-updateinfo.xml.zck"),
            size,
            open_size,
            header_checksum: Some(header_checksum),
            header_size: Some(header_size),
        },
        local_path: final_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_snapshot_id_accepts_alphanumeric() {
        validate_snapshot_id("2025-Q1_release").unwrap();
    }

    #[test]
    fn test_validate_snapshot_id_rejects_slash() {
        let err = validate_snapshot_id("../etc/passwd").unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshotId(_)));
    }

    #[test]
    fn test_validate_snapshot_id_rejects_newline() {
        let err = validate_snapshot_id("abc\ndef").unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshotId(_)));
    }
}
