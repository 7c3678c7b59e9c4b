//! The `repomd.xml`/`primary.xml`/`updateinfo.xml` family: parsing,
//! identity, and the targeted rewrite machinery the snapshot builder and
//! updateinfo rewriter both rely on.
//!
//! `quick_xml` never resolves external entities or DTDs — there is no
//! "disable this" switch to get wrong.

pub mod primary;
pub mod repomd;
pub mod updateinfo;

pub use primary::{Package, PackageList};
pub use repomd::{RepomdSection, RewrittenSection};
pub use updateinfo::ZckHeader;

use crate::errors::*;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;

/// Strip any namespace prefix (`repo:data` -> `data`) by partitioning on `}`
/// after Clark-notation expansion; quick-xml gives us the same split
/// directly off the raw tag.
pub(crate) fn local_name(name: QName) -> Result<&str> {
    Ok(std::str::from_utf8(name.local_name().as_ref())?)
}

pub(crate) fn attr_value(tag: &BytesStart, key: &str) -> Result<Option<String>> {
    for attr in tag.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == key.as_bytes() {
            return Ok(Some(attr.unescape_value()?.into_owned()));
        }
    }
    Ok(None)
}

pub(crate) fn read_text(reader: &mut Reader<&[u8]>) -> Result<String> {
    let mut buf = Vec::new();
    let mut text = String::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Text(t) => text.push_str(&t.unescape()?),
            Event::CData(t) => text.push_str(std::str::from_utf8(&t.into_inner())?),
            Event::End(_) => break,
            Event::Eof => return Err(Error::UpstreamFormat("unexpected eof reading text".into())),
            _ => {}
        }
        buf.clear();
    }
    Ok(text)
}
