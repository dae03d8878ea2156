//! Sitemap parsing (`<urlset>` and `<sitemapindex>`).

use quick_xml::Reader;
use quick_xml::events::Event;
use sitekb_shared::{Result, SiteKbError};

/// A parsed sitemap document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDoc {
    /// A `<urlset>`: page locations in document order.
    UrlSet(Vec<String>),
    /// A `<sitemapindex>`: child sitemap locations in document order.
    Index(Vec<String>),
}

impl SitemapDoc {
    pub fn locations(&self) -> &[String] {
        match self {
            Self::UrlSet(locs) | Self::Index(locs) => locs,
        }
    }
}

/// Parse a sitemap XML body.
///
/// Returns a parse error when the root element is neither `urlset` nor
/// `sitemapindex` (for example an HTML error page served with status 200).
/// `<loc>` values are trimmed; empty ones are skipped.
pub fn parse_sitemap(xml: &str) -> Result<SitemapDoc> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut is_index: Option<bool> = None;
    let mut in_loc = false;
    let mut current = String::new();
    let mut locations = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name();
                match (is_index, name.as_ref()) {
                    (None, b"urlset") => is_index = Some(false),
                    (None, b"sitemapindex") => is_index = Some(true),
                    (None, other) => {
                        return Err(SiteKbError::parse(format!(
                            "not a sitemap: root element <{}>",
                            String::from_utf8_lossy(other)
                        )));
                    }
                    (Some(_), b"loc") => {
                        in_loc = true;
                        current.clear();
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(t)) if in_loc => {
                let text = t
                    .unescape()
                    .map_err(|e| SiteKbError::parse(format!("sitemap text: {e}")))?;
                current.push_str(&text);
            }
            Ok(Event::CData(c)) if in_loc => {
                current.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(e)) if in_loc && e.local_name().as_ref() == b"loc" => {
                in_loc = false;
                let loc = current.trim();
                if !loc.is_empty() {
                    locations.push(loc.to_string());
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SiteKbError::parse(format!(
                    "sitemap XML error at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    match is_index {
        Some(true) => Ok(SitemapDoc::Index(locations)),
        Some(false) => Ok(SitemapDoc::UrlSet(locations)),
        None => Err(SiteKbError::parse("empty sitemap document")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../../fixtures/xml")
            .join(name);
        std::fs::read_to_string(&path).expect("read sitemap fixture")
    }

    #[test]
    fn parses_urlset_in_document_order() {
        let doc = parse_sitemap(&fixture("sitemap.xml")).unwrap();
        let SitemapDoc::UrlSet(locs) = doc else {
            panic!("expected urlset");
        };
        assert_eq!(locs.len(), 4);
        assert_eq!(locs[0], "https://ex.com/blog/first-post");
        // surrounding whitespace is trimmed, normalization happens later
        assert_eq!(locs[1], "https://ex.com/blog/second-post/");
        assert_eq!(locs[3], "https://elsewhere.org/blog/not-ours");
    }

    #[test]
    fn parses_sitemap_index() {
        let doc = parse_sitemap(&fixture("sitemap_index.xml")).unwrap();
        assert!(matches!(doc, SitemapDoc::Index(_)));
        assert_eq!(doc.locations().len(), 2);
        assert!(doc.locations()[0].ends_with("sitemap-posts.xml"));
    }

    #[test]
    fn rejects_html_error_page() {
        let err = parse_sitemap("<html><body>Not found</body></html>").unwrap_err();
        assert!(err.to_string().contains("not a sitemap"));
    }

    #[test]
    fn rejects_empty_body() {
        assert!(parse_sitemap("").is_err());
    }

    #[test]
    fn unescapes_entities_in_loc() {
        let xml = r#"<?xml version="1.0"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://ex.com/search?a=1&amp;b=2</loc></url>
  <url><loc>   </loc></url>
</urlset>"#;
        let doc = parse_sitemap(xml).unwrap();
        assert_eq!(doc.locations(), ["https://ex.com/search?a=1&b=2".to_string()]);
    }
}
