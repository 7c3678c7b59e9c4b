use super::{attr_value, local_name};
use crate::errors::*;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

/// Drop every `<package arch="...">` entry whose `arch` is present and not in
/// `keep_arches`. Packages with no `arch` attribute at all are always kept —
/// `updateinfo.xml` entries frequently omit it for noarch advisories, and an
/// absent attribute is never treated as exclusion.
pub fn strip_arches(xml_bytes: &[u8], keep_arches: &[String]) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(xml_bytes)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut writer = quick_xml::Writer::new(Vec::new());
    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf)?;
        let is_eof = matches!(event, Event::Eof);
        match event {
            Event::Start(tag) if local_name(tag.name())? == "package" => {
                if arch_excluded(&tag, keep_arches)? {
                    skip_to_end(&mut reader, "package")?;
                } else {
                    writer.write_event(Event::Start(tag))?;
                }
            }
            Event::Empty(tag) if local_name(tag.name())? == "package" => {
                if !arch_excluded(&tag, keep_arches)? {
                    writer.write_event(Event::Empty(tag))?;
                }
            }
            other => {
                writer.write_event(other)?;
            }
        }
        if is_eof {
            break;
        }
        buf.clear();
    }

    Ok(writer.into_inner())
}

fn arch_excluded(tag: &quick_xml::events::BytesStart, keep_arches: &[String]) -> Result<bool> {
    Ok(match attr_value(tag, "arch")? {
        Some(arch) => !keep_arches.iter().any(|a| a == &arch),
        None => false,
    })
}

fn skip_to_end(reader: &mut Reader<&[u8]>, name: &str) -> Result<()> {
    let mut depth = 1;
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) if local_name(tag.name())? == name => depth += 1,
            Event::End(tag) if local_name(tag.name())? == name => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            Event::Eof => return Err(Error::UpstreamFormat("unexpected eof stripping <package>".into())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// The parsed output of `zck_read_header`: the zchunk header checksum/size
/// pair that goes into `repomd.xml`'s `<header-checksum>`/`<header-size>`.
#[derive(Debug, Clone, PartialEq)]
pub struct ZckHeader {
    pub checksum: String,
    pub size: u64,
}

/// Decompress a `.zck`-compressed file to `dest` by shelling out to
/// `unzck --stdout` — a format `async-compression` doesn't cover.
pub async fn unzck(src: &Path, dest: &Path) -> Result<()> {
    let output = Command::new("unzck")
        .arg("--stdout")
        .arg(src)
        .stdout(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::ChildExit(output.status));
    }
    tokio::fs::write(dest, &output.stdout).await?;
    Ok(())
}

/// Compress `src` into a zchunk file at `dest` via `zck -o dest src`.
pub async fn zck_compress(src: &Path, dest: &Path) -> Result<()> {
    let status = Command::new("zck")
        .arg("-o")
        .arg(dest)
        .arg(src)
        .stdout(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        return Err(Error::ChildExit(status));
    }
    Ok(())
}

/// Read the zchunk header checksum/size from `zck_read_header <path>`'s
/// stdout, which prints lines of the form `Header checksum: <hex>` and
/// `Header size: <n>`.
pub async fn zck_read_header(path: &Path) -> Result<ZckHeader> {
    let output = Command::new("zck_read_header")
        .arg(path)
        .stdout(Stdio::piped())
        .output()
        .await?;
    if !output.status.success() {
        return Err(Error::ChildExit(output.status));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);

    let checksum_re = Regex::new(r"(?m)^Header checksum:\s*([0-9a-fA-F]+)\s*$").unwrap();
    let size_re = Regex::new(r"(?m)^Header size:\s*(\d+)\s*$").unwrap();

    let checksum = checksum_re
        .captures(&stdout)
        .map(|c| c[1].to_string())
        .ok_or_else(|| Error::UpstreamFormat("zck_read_header: no Header checksum line".into()))?;
    let size: u64 = size_re
        .captures(&stdout)
        .ok_or_else(|| Error::UpstreamFormat("zck_read_header: no Header size line".into()))?[1]
        .parse()?;

    Ok(ZckHeader { checksum, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    const UPDATEINFO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<updates>
  <update status="stable" type="security">
    <id>FEDORA-2024-1111111111</id>
    <title>example update</title>
    <pkglist>
      <collection short="fc39">
        <package name="bash" arch="x86_64" version="5.2.15" release="3.fc39">
          <filename>bash-5.2.15-3.fc39.x86_64.rpm</filename>
        </package>
        <package name="bash" arch="aarch64" version="5.2.15" release="3.fc39">
          <filename>bash-5.2.15-3.fc39.aarch64.rpm</filename>
        </package>
        <package name="bash-doc" version="5.2.15" release="3.fc39">
          <filename>bash-doc-5.2.15-3.fc39.noarch.rpm</filename>
        </package>
      </collection>
    </pkglist>
  </update>
</updates>
"#;

    #[test]
    fn test_strip_arches_drops_unwanted_arch_only() {
        let stripped = strip_arches(UPDATEINFO.as_bytes(), &["x86_64".to_string()]).unwrap();
        let stripped_str = String::from_utf8(stripped).unwrap();
        assert!(stripped_str.contains("bash-5.2.15-3.fc39.x86_64.rpm"));
        assert!(!stripped_str.contains("bash-5.2.15-3.fc39.aarch64.rpm"));
        // no arch attribute at all: always kept regardless of keep_arches
        assert!(stripped_str.contains("bash-doc-5.2.15-3.fc39.noarch.rpm"));
    }

    #[test]
    fn test_strip_arches_keeps_everything_when_arch_listed() {
        let stripped = strip_arches(UPDATEINFO.as_bytes(), &["x86_64".to_string(), "aarch64".to_string()]).unwrap();
        let stripped_str = String::from_utf8(stripped).unwrap();
        assert!(stripped_str.contains("bash-5.2.15-3.fc39.x86_64.rpm"));
        assert!(stripped_str.contains("bash-5.2.15-3.fc39.aarch64.rpm"));
    }
}
