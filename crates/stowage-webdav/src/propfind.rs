//! PROPFIND multistatus parsing.
//!
//! Servers disagree about namespace prefixes (`D:`, `d:`, `lp1:`, none), so
//! the parser matches on local element names only and tolerates properties
//! it does not know.

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;

use stowage_types::{ErrorCode, Result, StorageError};

/// One `<response>` of a multistatus body.
#[derive(Debug, Clone, Default)]
pub struct DavResource {
    pub href: String,
    pub is_collection: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub quota_available: Option<u64>,
    pub quota_used: Option<u64>,
}

impl DavResource {
    /// Display name: last path segment of the href, percent-decoded.
    pub fn name(&self) -> String {
        let trimmed = self.href.trim_end_matches('/');
        let raw = trimmed.rsplit('/').next().unwrap_or(trimmed);
        percent_decode_str(raw).decode_utf8_lossy().into_owned()
    }
}

fn local_name(qname: &[u8]) -> Vec<u8> {
    match qname.iter().position(|b| *b == b':') {
        Some(idx) => qname[idx + 1..].to_vec(),
        None => qname.to_vec(),
    }
}

/// Parse a `207 Multi-Status` body into resources, in document order.
pub fn parse_multistatus(body: &str) -> Result<Vec<DavResource>> {
    let mut reader = Reader::from_reader(body.as_bytes());

    let mut resources = Vec::new();
    let mut current: Option<DavResource> = None;
    let mut element_stack: Vec<Vec<u8>> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                let name = local_name(start.name().as_ref());
                if name == b"response" {
                    current = Some(DavResource::default());
                }
                if name == b"collection" {
                    if let Some(resource) = current.as_mut() {
                        resource.is_collection = true;
                    }
                }
                element_stack.push(name);
            }
            Ok(Event::Empty(start)) => {
                let name = local_name(start.name().as_ref());
                if name == b"collection" {
                    if let Some(resource) = current.as_mut() {
                        resource.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                let Some(resource) = current.as_mut() else {
                    continue;
                };
                let Some(element) = element_stack.last() else {
                    continue;
                };
                let value = text
                    .unescape()
                    .map(|v| v.into_owned())
                    .unwrap_or_default();
                match element.as_slice() {
                    b"href" => resource.href = value.trim().to_string(),
                    b"getcontentlength" => resource.size = value.trim().parse().ok(),
                    b"getlastmodified" => {
                        resource.modified = DateTime::parse_from_rfc2822(value.trim())
                            .ok()
                            .map(|d| d.with_timezone(&Utc));
                    }
                    b"getetag" => resource.etag = Some(value.trim().to_string()),
                    b"getcontenttype" => resource.content_type = Some(value.trim().to_string()),
                    b"quota-available-bytes" => {
                        resource.quota_available = value.trim().parse().ok();
                    }
                    b"quota-used-bytes" => resource.quota_used = value.trim().parse().ok(),
                    _ => {}
                }
            }
            Ok(Event::End(end)) => {
                let name = local_name(end.name().as_ref());
                if name == b"response" {
                    if let Some(resource) = current.take() {
                        resources.push(resource);
                    }
                }
                while let Some(top) = element_stack.pop() {
                    if top == name {
                        break;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StorageError::new(
                    ErrorCode::InvalidResponse,
                    format!("unparseable multistatus body: {e}"),
                ));
            }
            Ok(_) => {}
        }
        buf.clear();
    }
    Ok(resources)
}

/// The request body for a depth-N listing with the properties we read.
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:resourcetype/>
    <D:getcontentlength/>
    <D:getlastmodified/>
    <D:getetag/>
    <D:getcontenttype/>
  </D:prop>
</D:propfind>"#;

/// RFC 4331 quota probe body.
pub const QUOTA_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:propfind xmlns:D="DAV:">
  <D:prop>
    <D:quota-available-bytes/>
    <D:quota-used-bytes/>
  </D:prop>
</D:propfind>"#;

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/docs/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:getlastmodified>Wed, 21 Oct 2015 07:28:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/docs/report%20final.pdf</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getcontentlength>52428</D:getcontentlength>
        <D:getcontenttype>application/pdf</D:getcontenttype>
        <D:getetag>"abc123"</D:getetag>
        <D:getlastmodified>Wed, 21 Oct 2015 07:28:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn parses_collections_and_files() {
        let resources = parse_multistatus(SAMPLE).expect("parse");
        assert_eq!(resources.len(), 2);

        let dir = &resources[0];
        assert!(dir.is_collection);
        assert_eq!(dir.href, "/dav/docs/");
        assert!(dir.modified.is_some());

        let file = &resources[1];
        assert!(!file.is_collection);
        assert_eq!(file.size, Some(52_428));
        assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
        assert_eq!(file.etag.as_deref(), Some("\"abc123\""));
    }

    #[test]
    fn names_are_percent_decoded() {
        let resources = parse_multistatus(SAMPLE).expect("parse");
        assert_eq!(resources[1].name(), "report final.pdf");
        assert_eq!(resources[0].name(), "docs");
    }

    #[test]
    fn tolerates_foreign_prefixes_and_no_prefix() {
        let body = r#"<?xml version="1.0"?>
<multistatus xmlns="DAV:" xmlns:lp1="DAV:">
  <response>
    <href>/x/a.txt</href>
    <propstat><prop>
      <lp1:getcontentlength>7</lp1:getcontentlength>
      <resourcetype/>
    </prop></propstat>
  </response>
</multistatus>"#;
        let resources = parse_multistatus(body).expect("parse");
        assert_eq!(resources[0].size, Some(7));
        assert!(!resources[0].is_collection);
    }

    #[test]
    fn quota_properties() {
        let body = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/</D:href>
    <D:propstat><D:prop>
      <D:quota-available-bytes>1000000</D:quota-available-bytes>
      <D:quota-used-bytes>250000</D:quota-used-bytes>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        let resources = parse_multistatus(body).expect("parse");
        assert_eq!(resources[0].quota_available, Some(1_000_000));
        assert_eq!(resources[0].quota_used, Some(250_000));
    }

    #[test]
    fn garbage_is_invalid_response() {
        let err = parse_multistatus("<unclosed").expect_err("bad xml");
        assert_eq!(err.code(), ErrorCode::InvalidResponse);
    }
}
