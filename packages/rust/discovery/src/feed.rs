//! RSS / Atom feed parsing and feed autodiscovery from HTML.

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use scraper::{Html, Selector};
use sitekb_shared::{Result, SiteKbError, resolve_link};
use std::sync::LazyLock;
use url::Url;

static FEED_LINK_SELECTOR: LazyLock<Option<Selector>> =
    LazyLock::new(|| Selector::parse(r#"link[rel~="alternate"][href]"#).ok());

const FEED_MIME_TYPES: &[&str] = &[
    "application/rss+xml",
    "application/atom+xml",
    "application/feed+json",
    "application/xml",
    "text/xml",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedKind {
    Rss,
    Atom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Link,
    Guid,
    Id,
}

/// Per-item state while walking an `<item>` or `<entry>`.
#[derive(Debug, Default)]
struct ItemState {
    link: Option<String>,
    fallback: Option<String>,
}

/// Parse an RSS 2.0, RSS 1.0 (RDF) or Atom feed and return the item links,
/// resolved against `feed_url` and normalized, in document order.
///
/// RSS items use `<link>`, falling back to `<guid>` when it is an absolute
/// URL. Atom entries use the first `<link>` whose `rel` is `alternate` (or
/// absent), falling back to `<id>` when it is an http(s) URL.
pub fn parse_feed(xml: &str, feed_url: &Url) -> Result<Vec<Url>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut kind: Option<FeedKind> = None;
    let mut item: Option<ItemState> = None;
    let mut field: Option<Field> = None;
    let mut text = String::new();
    let mut links = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let Some(k) = kind else {
                    kind = Some(feed_kind(e.local_name().as_ref())?);
                    continue;
                };
                match e.local_name().as_ref() {
                    b"item" | b"entry" => item = Some(ItemState::default()),
                    b"link" if item.is_some() => match k {
                        FeedKind::Rss => start_field(&mut field, &mut text, Field::Link),
                        FeedKind::Atom => take_atom_link(&e, item.as_mut()),
                    },
                    b"guid" if item.is_some() && k == FeedKind::Rss => {
                        start_field(&mut field, &mut text, Field::Guid);
                    }
                    b"id" if item.is_some() && k == FeedKind::Atom => {
                        start_field(&mut field, &mut text, Field::Id);
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => {
                if kind == Some(FeedKind::Atom)
                    && item.is_some()
                    && e.local_name().as_ref() == b"link"
                {
                    take_atom_link(&e, item.as_mut());
                }
            }
            Ok(Event::Text(t)) if field.is_some() => {
                let value = t
                    .unescape()
                    .map_err(|e| SiteKbError::parse(format!("feed text: {e}")))?;
                text.push_str(&value);
            }
            Ok(Event::CData(c)) if field.is_some() => {
                text.push_str(&String::from_utf8_lossy(&c.into_inner()));
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"item" | b"entry" => {
                    if let Some(state) = item.take() {
                        let chosen = state.link.or(state.fallback);
                        if let Some(url) = chosen.and_then(|href| resolve_link(feed_url, &href)) {
                            links.push(url);
                        }
                    }
                    field = None;
                }
                b"link" | b"guid" | b"id" => {
                    if let (Some(f), Some(state)) = (field.take(), item.as_mut()) {
                        finish_field(f, text.trim(), state);
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SiteKbError::parse(format!(
                    "feed XML error at byte {}: {e}",
                    reader.buffer_position()
                )));
            }
            _ => {}
        }
    }

    if kind.is_none() {
        return Err(SiteKbError::parse("empty feed document"));
    }
    Ok(links)
}

fn feed_kind(root: &[u8]) -> Result<FeedKind> {
    match root {
        b"rss" | b"RDF" => Ok(FeedKind::Rss),
        b"feed" => Ok(FeedKind::Atom),
        other => Err(SiteKbError::parse(format!(
            "not a feed: root element <{}>",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn start_field(field: &mut Option<Field>, text: &mut String, which: Field) {
    *field = Some(which);
    text.clear();
}

fn finish_field(field: Field, value: &str, state: &mut ItemState) {
    if value.is_empty() {
        return;
    }
    match field {
        Field::Link => {
            state.link.get_or_insert_with(|| value.to_string());
        }
        Field::Guid | Field::Id => {
            if value.starts_with("http://") || value.starts_with("https://") {
                state.fallback.get_or_insert_with(|| value.to_string());
            }
        }
    }
}

/// Record an Atom `<link>` if it is the entry's alternate link.
fn take_atom_link(e: &BytesStart<'_>, state: Option<&mut ItemState>) {
    let Some(state) = state else { return };
    if state.link.is_some() {
        return;
    }

    let mut rel = None;
    let mut href = None;
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().ok().map(|v| v.into_owned());
        match attr.key.local_name().as_ref() {
            b"rel" => rel = value,
            b"href" => href = value,
            _ => {}
        }
    }

    let is_alternate = rel.as_deref().is_none_or(|r| r.eq_ignore_ascii_case("alternate"));
    if is_alternate {
        state.link = href.filter(|h| !h.trim().is_empty());
    }
}

/// Find feeds advertised with `<link rel="alternate" type="application/rss+xml">`
/// style tags in an HTML page.
pub fn feed_links_from_html(html: &str, base: &Url) -> Vec<Url> {
    let Some(selector) = FEED_LINK_SELECTOR.as_ref() else {
        return Vec::new();
    };
    let document = Html::parse_document(html);

    let mut feeds: Vec<Url> = Vec::new();
    for element in document.select(selector) {
        let mime = element
            .value()
            .attr("type")
            .map(|t| t.trim().to_ascii_lowercase())
            .unwrap_or_default();
        if !FEED_MIME_TYPES.contains(&mime.as_str()) {
            continue;
        }
        if let Some(url) = element
            .value()
            .attr("href")
            .and_then(|href| resolve_link(base, href))
        {
            if !feeds.contains(&url) {
                feeds.push(url);
            }
        }
    }
    feeds
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture(name: &str) -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../../fixtures/xml")
            .join(name);
        std::fs::read_to_string(&path).expect("read feed fixture")
    }

    fn feed_url() -> Url {
        Url::parse("https://ex.com/feed").unwrap()
    }

    #[test]
    fn rss_items_use_link_including_cdata() {
        let links = parse_feed(&fixture("rss.xml"), &feed_url()).unwrap();
        let links: Vec<&str> = links.iter().map(Url::as_str).collect();
        assert_eq!(
            links,
            ["https://ex.com/blog/newest", "https://ex.com/blog/older?ref=rss"]
        );
    }

    #[test]
    fn atom_prefers_alternate_link_then_id() {
        let links = parse_feed(&fixture("atom.xml"), &feed_url()).unwrap();
        let links: Vec<&str> = links.iter().map(Url::as_str).collect();
        // relative alternate href is resolved; entry two falls back to its id
        assert_eq!(
            links,
            ["https://ex.com/posts/entry-one", "https://ex.com/posts/entry-two"]
        );
    }

    #[test]
    fn rss_guid_used_only_when_absolute() {
        let xml = r#"<rss version="2.0"><channel>
            <item><guid>https://ex.com/p/1/</guid></item>
            <item><guid>opaque-id</guid></item>
        </channel></rss>"#;
        let links = parse_feed(xml, &feed_url()).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].as_str(), "https://ex.com/p/1");
    }

    #[test]
    fn rejects_non_feed_documents() {
        assert!(parse_feed("<html><body/></html>", &feed_url()).is_err());
        assert!(parse_feed("", &feed_url()).is_err());
    }

    #[test]
    fn discovers_feeds_in_html_head() {
        let html = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/blog/rss.xml">
            <link rel="alternate" type="application/atom+xml" href="https://ex.com/atom.xml">
            <link rel="alternate" hreflang="de" href="/de/">
            <link rel="stylesheet" href="/style.css">
        </head><body></body></html>"#;
        let base = Url::parse("https://ex.com/").unwrap();
        let feeds = feed_links_from_html(html, &base);
        let feeds: Vec<&str> = feeds.iter().map(Url::as_str).collect();
        assert_eq!(feeds, ["https://ex.com/blog/rss.xml", "https://ex.com/atom.xml"]);
    }
}
