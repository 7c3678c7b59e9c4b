use super::{attr_value, local_name, read_text};
use crate::errors::*;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::hash::{Hash, Hasher};
use url::Url;

/// One `<package type="rpm">` entry from `primary.xml`.
///
/// Identity for diffing package sets is `(name, version, epoch, release,
/// checksum)` — two packages are the same package, not just the same NEVRA,
/// only if their checksums also match.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    pub epoch: String,
    pub release: String,
    pub checksum: String,
    pub checksum_type: String,
    pub package_size: u64,
    pub location: String,
    pub base_url: String,
    pub absolute_url: String,
    pub destination_key: String,
}

impl Package {
    fn identity(&self) -> (&str, &str, &str, &str, &str) {
        (&self.name, &self.version, &self.epoch, &self.release, &self.checksum)
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// A lazily-reparsed view over `primary.xml`: each `iter()` call re-walks the
/// document from scratch rather than holding every `Package` in memory at
/// once, matching the streaming posture the rest of the parsing stack keeps.
pub struct PackageList {
    xml: Vec<u8>,
    base_url: String,
    len: usize,
}

impl PackageList {
    pub fn parse(xml_bytes: Vec<u8>, base_url: &str) -> Result<Self> {
        let len = read_packages_attr(&xml_bytes)?;
        Ok(PackageList {
            xml: xml_bytes,
            base_url: base_url.to_string(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> Result<Vec<Package>> {
        parse_packages(&self.xml, &self.base_url)
    }
}

fn read_packages_attr(xml_bytes: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(xml_bytes)?;
    let mut reader = Reader::from_str(text);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) if local_name(tag.name())? == "metadata" => {
                let packages = attr_value(&tag, "packages")?
                    .ok_or_else(|| Error::UpstreamFormat("<metadata> missing packages attribute".into()))?;
                return Ok(packages.parse()?);
            }
            Event::Eof => {
                return Err(Error::UpstreamFormat("primary.xml missing <metadata> root".into()))
            }
            _ => {}
        }
        buf.clear();
    }
}

fn parse_packages(xml_bytes: &[u8], base_url: &str) -> Result<Vec<Package>> {
    let text = std::str::from_utf8(xml_bytes)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut packages = Vec::new();
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) if local_name(tag.name())? == "package" => {
                if attr_value(&tag, "type")?.as_deref() == Some("rpm") {
                    packages.push(parse_one_package(&mut reader, base_url)?);
                } else {
                    skip_element(&mut reader, "package")?;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(packages)
}

fn skip_element(reader: &mut Reader<&[u8]>, name: &str) -> Result<()> {
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
            Event::Eof => return Err(Error::UpstreamFormat("unexpected eof skipping element".into())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn parse_one_package(reader: &mut Reader<&[u8]>, base_url: &str) -> Result<Package> {
    let mut name = None;
    let mut version = None;
    let mut epoch = None;
    let mut release = None;
    let mut checksum = None;
    let mut checksum_type = None;
    let mut package_size = None;
    let mut location = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) | Event::Empty(tag) => {
                let local = local_name(tag.name())?.to_string();
                match local.as_str() {
                    "name" => {
                        name = Some(read_text(reader)?);
                    }
                    "version" => {
                        version = attr_value(&tag, "ver")?;
                        epoch = attr_value(&tag, "epoch")?;
                        release = attr_value(&tag, "rel")?;
                    }
                    "checksum" => {
                        checksum_type = attr_value(&tag, "type")?;
                        checksum = Some(read_text(reader)?);
                    }
                    "size" => {
                        package_size = attr_value(&tag, "package")?;
                    }
                    "location" => {
                        location = attr_value(&tag, "href")?;
                    }
                    _ => {}
                }
            }
            Event::End(tag) if local_name(tag.name())? == "package" => break,
            Event::Eof => return Err(Error::UpstreamFormat("unexpected eof parsing <package>".into())),
            _ => {}
        }
        buf.clear();
    }

    let name = name.ok_or_else(|| Error::UpstreamFormat("package missing name".into()))?;
    let version = version.ok_or_else(|| Error::UpstreamFormat(format!("package {name} missing version")))?;
    let epoch = epoch.unwrap_or_else(|| "0".to_string());
    let release = release.ok_or_else(|| Error::UpstreamFormat(format!("package {name} missing release")))?;
    let checksum = checksum.ok_or_else(|| Error::UpstreamFormat(format!("package {name} missing checksum")))?;
    let checksum_type =
        checksum_type.ok_or_else(|| Error::UpstreamFormat(format!("package {name} missing checksum type")))?;
    if checksum_type != "sha256" {
        return Err(Error::UnsupportedChecksum(checksum_type));
    }
    let location = location.ok_or_else(|| Error::UpstreamFormat(format!("package {name} missing location")))?;
    let package_size: u64 = package_size
        .ok_or_else(|| Error::UpstreamFormat(format!("package {name} missing size")))?
        .parse()?;

    let absolute_url = Url::parse(base_url)?.join(&location)?.to_string();
    let destination_key = Url::parse(&absolute_url)?.path().trim_start_matches('/').to_string();

    Ok(Package {
        name,
        version,
        epoch,
        release,
        checksum,
        checksum_type,
        package_size,
        location,
        base_url: base_url.to_string(),
        absolute_url,
        destination_key,
    })
}

/// Prefix every `<location href="...">` in `primary.xml` (or `filelists.xml`,
/// `other.xml`) with `prefix`, the way the snapshot builder relocates package
/// references when it copies metadata under a snapshot-scoped path.
pub fn rewrite_locations(xml_bytes: &[u8], prefix: &str) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(xml_bytes)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut writer = quick_xml::Writer::new(Vec::new());
    let mut buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf)?;
        let is_eof = matches!(event, Event::Eof);
        match event {
            Event::Empty(tag) if local_name(tag.name())? == "location" => {
                writer.write_event(Event::Empty(rewrite_href(&tag, prefix)?))?;
            }
            Event::Start(tag) if local_name(tag.name())? == "location" => {
                writer.write_event(Event::Start(rewrite_href(&tag, prefix)?))?;
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

fn rewrite_href(tag: &BytesStart, prefix: &str) -> Result<BytesStart<'static>> {
    let href = attr_value(tag, "href")?.ok_or_else(|| Error::UpstreamFormat("<location> missing href".into()))?;
    let new_href = format!("{prefix}{href}");
    let mut new_tag = BytesStart::new(String::from_utf8_lossy(tag.name().as_ref()).into_owned());
    for attr in tag.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == b"href" {
            new_tag.push_attribute(("href", new_href.as_str()));
        } else {
            new_tag.push_attribute(attr);
        }
    }
    Ok(new_tag)
}
