use super::{attr_value, local_name, read_text};
use crate::errors::*;
use indexmap::IndexMap;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use url::Url;

/// One `<data type="...">` entry from `repomd.xml`.
///
/// `checksum_type` is validated eagerly: anything other than `sha256` is a
/// hard error, never silently tolerated.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct RepomdSection {
    pub section_type: String,
    pub location: String,
    pub absolute_url: String,
    pub destination_key: String,
    pub checksum: String,
    pub checksum_type: String,
    pub open_checksum: Option<String>,
    pub size: Option<u64>,
    pub open_size: Option<u64>,
    pub header_checksum: Option<String>,
    pub header_size: Option<u64>,
}

/// Parse `repomd.xml`, keyed by `data[@type]`, in document order.
///
/// `base_url` is the repository's own base URL (always ending in `/`) and is
/// used to fill in `absolute_url`/`destination_key` for each section.
pub fn parse_repomd(xml_bytes: &[u8], base_url: &str) -> Result<IndexMap<String, RepomdSection>> {
    let text = std::str::from_utf8(xml_bytes)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut sections = IndexMap::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) if local_name(tag.name())? == "data" => {
                let section_type = attr_value(&tag, "type")?
                    .ok_or_else(|| Error::UpstreamFormat("<data> missing type attribute".into()))?;
                let section = parse_data_children(&mut reader, &section_type, base_url)?;
                sections.insert(section_type, section);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(sections)
}

fn parse_data_children(
    reader: &mut Reader<&[u8]>,
    section_type: &str,
    base_url: &str,
) -> Result<RepomdSection> {
    let mut location = None;
    let mut checksum = None;
    let mut checksum_type = None;
    let mut open_checksum = None;
    let mut size = None;
    let mut open_size = None;
    let mut header_checksum = None;
    let mut header_size = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(tag) => {
                let name = local_name(tag.name())?.to_string();
                match name.as_str() {
                    "location" => {
                        location = attr_value(&tag, "href")?;
                    }
                    "checksum" => {
                        checksum_type = attr_value(&tag, "type")?;
                        checksum = Some(read_text(reader)?);
                    }
                    "open-checksum" => {
                        open_checksum = Some(read_text(reader)?);
                    }
                    "size" => {
                        size = Some(read_text(reader)?.parse()?);
                    }
                    "open-size" => {
                        open_size = Some(read_text(reader)?.parse()?);
                    }
                    "header-checksum" => {
                        header_checksum = Some(read_text(reader)?);
                    }
                    "header-size" => {
                        header_size = Some(read_text(reader)?.parse()?);
                    }
                    _ => {
                        // Unknown child: preserved by the byte-level rewrite path,
                        // not required here.
                    }
                }
            }
            Event::Empty(tag) => {
                let name = local_name(tag.name())?.to_string();
                match name.as_str() {
                    "location" => {
                        location = attr_value(&tag, "href")?;
                    }
                    "checksum" => {
                        checksum_type = attr_value(&tag, "type")?;
                        checksum = Some(String::new());
                    }
                    "open-checksum" => {
                        open_checksum = Some(String::new());
                    }
                    "size" => {
                        size = Some(0);
                    }
                    "open-size" => {
                        open_size = Some(0);
                    }
                    "header-checksum" => {
                        header_checksum = Some(String::new());
                    }
                    "header-size" => {
                        header_size = Some(0);
                    }
                    _ => {}
                }
            }
            Event::End(tag) if local_name(tag.name())? == "data" => break,
            Event::Eof => {
                return Err(Error::UpstreamFormat(format!(
                    "unexpected eof parsing <data type={section_type:?}>"
                )))
            }
            _ => {}
        }
        buf.clear();
    }

    let location = location
        .ok_or_else(|| Error::UpstreamFormat(format!("data[{section_type}] missing location")))?;
    let checksum_type = checksum_type
        .ok_or_else(|| Error::UpstreamFormat(format!("data[{section_type}] missing checksum type")))?;
    let checksum = checksum
        .ok_or_else(|| Error::UpstreamFormat(format!("data[{section_type}] missing checksum")))?;

    if checksum_type != "sha256" {
        return Err(Error::UnsupportedChecksum(checksum_type));
    }

    let absolute_url = Url::parse(base_url)?.join(&location)?.to_string();
    let destination_key = Url::parse(&absolute_url)?.path().trim_start_matches('/').to_string();

    Ok(RepomdSection {
        section_type: section_type.to_string(),
        location,
        absolute_url,
        destination_key,
        checksum,
        checksum_type,
        open_checksum,
        size,
        open_size,
        header_checksum,
        header_size,
    })
}

/// Rewrite a single `<data type="{section_type}">` block in an existing
/// `repomd.xml` document to reference `replacement`, leaving every other
/// byte — including unknown child elements — untouched. This is the
/// mechanism both the snapshot builder and the updateinfo rewriter patch
/// through.
pub fn rewrite_section(xml_bytes: &[u8], section_type: &str, replacement: &RewrittenSection) -> Result<Vec<u8>> {
    let text = std::str::from_utf8(xml_bytes)?;
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(false);

    let mut writer = quick_xml::Writer::new(Vec::new());
    let mut buf = Vec::new();
    let mut in_target = false;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let is_eof = matches!(event, Event::Eof);
        match event {
            Event::Start(tag) if local_name(tag.name())? == "data" => {
                in_target = attr_value(&tag, "type")?.as_deref() == Some(section_type);
                writer.write_event(Event::Start(tag))?;
            }
            Event::End(tag) if local_name(tag.name())? == "data" && in_target => {
                in_target = false;
                writer.write_event(Event::End(tag))?;
            }
            Event::Start(tag) if in_target => {
                let name = local_name(tag.name())?.to_string();
                if let Some(text) = replacement.text_for(&name) {
                    write_element_with_text(&mut writer, &tag, &text)?;
                    skip_to_matching_end(&mut reader, &name)?;
                } else if let Some(href) = replacement.href_for(&name) {
                    write_tag_with_href(&mut writer, &tag, &href, true)?;
                    skip_to_matching_end(&mut reader, &name)?;
                } else {
                    writer.write_event(Event::Start(tag))?;
                }
            }
            Event::Empty(tag) if in_target => {
                let name = local_name(tag.name())?.to_string();
                if let Some(text) = replacement.text_for(&name) {
                    write_element_with_text(&mut writer, &tag, &text)?;
                } else if let Some(href) = replacement.href_for(&name) {
                    write_tag_with_href(&mut writer, &tag, &href, false)?;
                } else {
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

fn write_tag_with_href(
    writer: &mut quick_xml::Writer<Vec<u8>>,
    tag: &BytesStart,
    href: &str,
    start: bool,
) -> Result<()> {
    let mut new_tag = BytesStart::new(String::from_utf8_lossy(tag.name().as_ref()).into_owned());
    for attr in tag.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == b"href" {
            new_tag.push_attribute(("href", href));
        } else {
            new_tag.push_attribute(attr);
        }
    }
    if start {
        writer.write_event(Event::Start(new_tag))?;
    } else {
        writer.write_event(Event::Empty(new_tag))?;
    }
    Ok(())
}

fn skip_to_matching_end(reader: &mut Reader<&[u8]>, name: &str) -> Result<()> {
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::End(tag) if local_name(tag.name())? == name => break,
            Event::Eof => return Err(Error::UpstreamFormat("unexpected eof skipping element".into())),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn write_element_with_text(writer: &mut quick_xml::Writer<Vec<u8>>, tag: &BytesStart, text: &str) -> Result<()> {
    let name = String::from_utf8_lossy(tag.name().as_ref()).into_owned();
    writer.write_event(Event::Start(tag.clone()))?;
    writer.write_event(Event::Text(quick_xml::events::BytesText::new(text)))?;
    writer.write_event(Event::End(quick_xml::events::BytesEnd::new(name)))?;
    Ok(())
}

/// The rewritten checksum/size/location fields for one repomd section,
/// produced by the snapshot builder or updateinfo rewriter.
#[derive(Debug, Clone)]
pub struct RewrittenSection {
    pub checksum: String,
    pub open_checksum: String,
    pub location: String,
    pub size: u64,
    pub open_size: u64,
    pub header_checksum: Option<String>,
    pub header_size: Option<u64>,
}

impl RewrittenSection {
    fn text_for(&self, local_name: &str) -> Option<String> {
        match local_name {
            "checksum" => Some(self.checksum.clone()),
            "open-checksum" => Some(self.open_checksum.clone()),
            "size" => Some(self.size.to_string()),
            "open-size" => Some(self.open_size.to_string()),
            "header-checksum" => self.header_checksum.clone(),
            "header-size" => self.header_size.map(|s| s.to_string()),
            _ => None,
        }
    }

    fn href_for(&self, local_name: &str) -> Option<String> {
        if local_name == "location" {
            Some(self.location.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo" xmlns:rpm="http://linux.duke.edu/metadata/rpm">
  <revision>1712990641</revision>
  <data type="primary">
    <checksum type="sha256">fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158</checksum>
    <open-checksum type="sha256">259d84fce5ecb46226a21765561539eb992fff76356df088f9ed3d1d3d44cd28</open-checksum>
    <location href="repodata/fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158-primary.xml.gz"/>
    <timestamp>1712990625</timestamp>
    <size>7587566</size>
    <open-size>49907129</open-size>
  </data>
  <data type="filelists">
    <checksum type="sha256">caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a</checksum>
    <open-checksum type="sha256">a35a9e10b149715434f405d3b5f3a895699d9a2939adb3435358337194bad323</open-checksum>
    <location href="repodata/caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a-filelists.xml.gz"/>
    <timestamp>1712990625</timestamp>
    <size>2013585</size>
    <open-size>7783810</open-size>
  </data>
</repomd>
"#;

    #[test]
    fn test_parse_repomd() {
        let sections = parse_repomd(REPOMD.as_bytes(), "https://example.com/repo/").unwrap();
        assert_eq!(sections.len(), 2);
        let primary = &sections["primary"];
        assert_eq!(primary.checksum_type, "sha256");
        assert_eq!(
            primary.checksum,
            "fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158"
        );
        assert_eq!(
            primary.absolute_url,
            "https://example.com/repo/repodata/fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158-primary.xml.gz"
        );
        assert_eq!(
            primary.destination_key,
            "repo/repodata/fa72c03d43e9ffe131633347045c0c56fbeacbd3281b2b03a6351f487218a158-primary.xml.gz"
        );

        // document order is preserved
        assert_eq!(sections.keys().collect::<Vec<_>>(), vec!["primary", "filelists"]);
    }

    #[test]
    fn test_non_sha256_checksum_is_hard_error() {
        let xml = REPOMD.replace(r#"type="sha256""#, r#"type="sha1""#);
        let err = parse_repomd(xml.as_bytes(), "https://example.com/repo/").unwrap_err();
        assert!(matches!(err, Error::UnsupportedChecksum(_)));
    }

    #[test]
    fn test_rewrite_section_preserves_other_sections() {
        let replacement = RewrittenSection {
            checksum: "deadbeef".into(),
            open_checksum: "cafef00d".into(),
            location: "repodata/deadbeef-primary.xml.gz".into(),
            size: 42,
            open_size: 100,
            header_checksum: None,
            header_size: None,
        };
        let rewritten = rewrite_section(REPOMD.as_bytes(), "primary", &replacement).unwrap();
        let rewritten_str = String::from_utf8(rewritten).unwrap();

        assert!(rewritten_str.contains("deadbeef-primary.xml.gz"));
        assert!(rewritten_str.contains(">deadbeef<"));
        assert!(rewritten_str.contains(">42<"));
        // filelists section must be untouched
        assert!(rewritten_str.contains("caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a-filelists.xml.gz"));

        let sections = parse_repomd(rewritten_str.as_bytes(), "https://example.com/repo/").unwrap();
        assert_eq!(sections["primary"].checksum, "deadbeef");
        assert_eq!(sections["primary"].size, Some(42));
        assert_eq!(
            sections["filelists"].checksum,
            "caf9e9202dbd97fcf4da6ca3f228fd459505f0b17d37fb387240b03c8dc0e84a"
        );
    }
}
