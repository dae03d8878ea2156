//! Boilerplate removal and main-content selection.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Elements that never carry page content.
static ALWAYS_DROP: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse("nav, aside, form, script, style, noscript, iframe, svg, template, button")
        .expect("valid selector")
});

/// Page chrome that is only dropped outside the content container, since
/// articles commonly wrap their own title in a `<header>`.
static CHROME: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("header, footer").expect("valid selector"));

static WITH_CLASS_OR_ID: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[class], [id]").expect("valid selector"));

/// Class/id tokens that mark menus, widgets and other boilerplate.
static BOILERPLATE_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:^|[\s_-])(?:nav|navbar|menu|sidebar|breadcrumbs?|comments?|share|sharing|social|cookies?|consent|gdpr|ads?|advert|advertisement|sponsor|promo|newsletter|subscribe|signup|related|popup|modal|skip-link)(?:[\s_-]|$)",
    )
    .expect("valid regex")
});

/// Semantic containers tried in order before falling back to text density.
static SEMANTIC_CONTAINERS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    [
        "main",
        "[role=\"main\"]",
        ".post-content",
        ".entry-content",
        ".article-content",
        ".article-body",
        ".post-body",
        "#content",
        ".content",
    ]
    .iter()
    .filter_map(|s| Selector::parse(s).ok())
    .collect()
});

static ARTICLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("article").expect("valid selector"));

static BLOCKS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div, section, td, body").expect("valid selector"));

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a").expect("valid selector"));

static PARAGRAPH: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("p").expect("valid selector"));

/// Bonus per `<p>` inside a candidate block.
const PARAGRAPH_BONUS: f64 = 30.0;

/// Blocks with less non-whitespace text than this are never chosen.
const MIN_BLOCK_TEXT: usize = 25;

/// Detach boilerplate subtrees from `doc` in place.
pub(crate) fn strip_boilerplate(doc: &mut Html) {
    let root = doc.root_element();

    let mut doomed: Vec<_> = root.select(&ALWAYS_DROP).map(|el| el.id()).collect();

    doomed.extend(
        root.select(&CHROME)
            .filter(|el| !inside_content(el))
            .map(|el| el.id()),
    );

    doomed.extend(
        root.select(&WITH_CLASS_OR_ID)
            .filter(|el| !matches!(el.value().name(), "html" | "body" | "main" | "article"))
            .filter(|el| {
                let class = el.value().attr("class").unwrap_or("");
                let id = el.value().attr("id").unwrap_or("");
                BOILERPLATE_ATTR_RE.is_match(class) || BOILERPLATE_ATTR_RE.is_match(id)
            })
            .map(|el| el.id()),
    );

    for id in doomed {
        if let Some(mut node) = doc.tree.get_mut(id) {
            node.detach();
        }
    }
}

fn inside_content(el: &ElementRef<'_>) -> bool {
    el.ancestors().any(|node| {
        node.value()
            .as_element()
            .is_some_and(|e| matches!(e.name(), "article" | "main"))
    })
}

/// Choose the main content element of an already-stripped document.
///
/// A single `<article>` wins outright; otherwise the first non-empty semantic
/// container; otherwise the block with the best text-density score.
pub(crate) fn main_content(doc: &Html) -> Option<ElementRef<'_>> {
    let root = doc.root_element();

    let articles: Vec<ElementRef<'_>> = root.select(&ARTICLE).collect();
    if let [only] = articles.as_slice() {
        if text_chars(only) > 0 {
            return Some(*only);
        }
    }

    for selector in SEMANTIC_CONTAINERS.iter() {
        if let Some(el) = root.select(selector).find(|el| text_chars(el) > 0) {
            return Some(el);
        }
    }

    densest_block(root)
}

fn densest_block(root: ElementRef<'_>) -> Option<ElementRef<'_>> {
    let mut best: Option<(ElementRef<'_>, f64)> = None;
    for candidate in root.select(&BLOCKS) {
        let score = density_score(&candidate);
        if score <= 0.0 {
            continue;
        }
        // strictly greater keeps the earliest block on ties
        if best.is_none_or(|(_, s)| score > s) {
            best = Some((candidate, score));
        }
    }
    best.map(|(el, _)| el)
}

/// Non-link text plus a paragraph bonus, scaled down by link density.
pub(crate) fn density_score(el: &ElementRef<'_>) -> f64 {
    let text = text_chars(el);
    if text < MIN_BLOCK_TEXT {
        return 0.0;
    }
    let link: usize = el.select(&ANCHOR).map(|a| text_chars(&a)).sum();
    let link = link.min(text);
    let paragraphs = el.select(&PARAGRAPH).count();

    let link_density = link as f64 / text as f64;
    ((text - link) as f64 + PARAGRAPH_BONUS * paragraphs as f64) * (1.0 - link_density)
}

/// Count of non-whitespace characters in the element's text.
fn text_chars(el: &ElementRef<'_>) -> usize {
    el.text()
        .map(|t| t.chars().filter(|c| !c.is_whitespace()).count())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pick(html: &str) -> String {
        let mut doc = Html::parse_document(html);
        strip_boilerplate(&mut doc);
        main_content(&doc)
            .map(|el| el.text().collect::<String>())
            .unwrap_or_default()
    }

    #[test]
    fn single_article_wins() {
        let text = pick(
            "<html><body><nav>Menu</nav><article><p>The real post body.</p></article>\
             <div>Some unrelated block of text that is fairly long.</div></body></html>",
        );
        assert!(text.contains("The real post body."));
        assert!(!text.contains("unrelated"));
    }

    #[test]
    fn article_keeps_its_own_header() {
        let text = pick(
            "<html><body><header>Site chrome</header><article><header><h1>Post title</h1></header>\
             <p>Body text.</p></article><footer>Site footer</footer></body></html>",
        );
        assert!(text.contains("Post title"));
        assert!(!text.contains("Site chrome"));
    }

    #[test]
    fn drops_widgets_by_class_and_id() {
        let text = pick(
            "<html><body><main><p>Keep this paragraph.</p>\
             <div class=\"share-buttons\">Share on X</div>\
             <div id=\"comments\">Nice post!</div>\
             <div class=\"cookie-banner\">We use cookies.</div></main></body></html>",
        );
        assert!(text.contains("Keep this paragraph."));
        assert!(!text.contains("Share on X"));
        assert!(!text.contains("Nice post!"));
        assert!(!text.contains("cookies"));
    }

    #[test]
    fn class_tokens_do_not_match_substrings() {
        // "downloads" and "shared" contain boilerplate words but are not tokens
        let text = pick(
            "<html><body><main><div class=\"downloads\">Download the installer.</div>\
             <div class=\"shared-state\">Shared state explained.</div></main></body></html>",
        );
        assert!(text.contains("Download the installer."));
        assert!(text.contains("Shared state explained."));
    }

    #[test]
    fn density_prefers_prose_over_link_lists() {
        let text = pick(
            "<html><body>\
             <div class=\"links\"><a href=\"/1\">Link one here</a> <a href=\"/2\">Link two here</a> <a href=\"/3\">Link three here</a></div>\
             <div class=\"prose\"><p>First paragraph with real words in it.</p><p>Second paragraph, also real.</p></div>\
             </body></html>",
        );
        assert!(text.contains("First paragraph"));
        assert!(!text.contains("Link one"));
    }

    #[test]
    fn empty_body_has_no_content() {
        let doc = Html::parse_document("<html><body></body></html>");
        assert!(main_content(&doc).is_none());
    }
}
