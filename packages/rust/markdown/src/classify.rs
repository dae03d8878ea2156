//! Content-type heuristics over the URL and the parsed document.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use sitekb_shared::ContentType;
use url::Url;

static OG_TYPE: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"meta[property="og:type"][content]"#).expect("valid selector")
});

static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));

/// A content type together with how sure the heuristics are (0.0..=1.0).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub content_type: ContentType,
    pub confidence: f32,
}

impl Classification {
    fn new(content_type: ContentType, confidence: f32) -> Self {
        Self {
            content_type,
            confidence,
        }
    }
}

const PODCAST_WORDS: &[&str] = &["podcast", "podcasts", "episode", "episodes", "ep"];
/// Matched anywhere in the path, so `/thepodcast/` and `/episode12` count.
const PODCAST_MARKERS: &[&str] = &["podcast", "episode"];
const CALL_WORDS: &[&str] = &["call", "calls", "meeting", "meetings", "interview", "interviews"];
const BOOK_WORDS: &[&str] = &["book", "books", "chapter", "chapters"];
const BLOG_WORDS: &[&str] = &[
    "blog", "blogs", "post", "posts", "article", "articles", "news", "insights",
];

/// Classify a page. Pure: the same URL and document always give the same
/// answer.
pub fn classify(url: &Url, doc: &Html) -> Classification {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    let path = tokens(url.path());
    let title = doc
        .select(&TITLE)
        .next()
        .map(|t| tokens(&t.text().collect::<String>()))
        .unwrap_or_default();
    let og_type = doc
        .select(&OG_TYPE)
        .next()
        .and_then(|m| m.value().attr("content"))
        .map(|s| s.trim().to_ascii_lowercase());

    let on_host = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

    if on_host("linkedin.com") && (has_any(&path, &["posts", "pulse"]) || url.path().contains("/feed/update/")) {
        return Classification::new(ContentType::LinkedinPost, 0.95);
    }
    if on_host("reddit.com") && has_any(&path, &["comments"]) {
        return Classification::new(ContentType::RedditComment, 0.95);
    }

    let transcript_in_path = has_any(&path, &["transcript", "transcripts"]);
    let transcript_in_title = has_any(&title, &["transcript", "transcripts"]);
    let lower_path = url.path().to_ascii_lowercase();

    if has_any(&path, PODCAST_WORDS) || PODCAST_MARKERS.iter().any(|m| lower_path.contains(m)) {
        let confidence = if transcript_in_path || transcript_in_title { 0.9 } else { 0.7 };
        return Classification::new(ContentType::PodcastTranscript, confidence);
    }
    if (transcript_in_path || transcript_in_title)
        && (has_any(&path, CALL_WORDS) || has_any(&title, CALL_WORDS))
    {
        return Classification::new(ContentType::CallTranscript, 0.8);
    }
    if has_any(&title, PODCAST_WORDS) && transcript_in_title {
        return Classification::new(ContentType::PodcastTranscript, 0.6);
    }
    if has_any(&path, BOOK_WORDS) {
        return Classification::new(ContentType::Book, 0.6);
    }
    if has_any(&path, BLOG_WORDS) {
        return Classification::new(ContentType::Blog, 0.8);
    }
    if og_type.as_deref() == Some("article") {
        return Classification::new(ContentType::Blog, 0.6);
    }

    Classification::new(ContentType::Other, 0.3)
}

/// Lower-cased alphanumeric words of `s`.
fn tokens(s: &str) -> Vec<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

fn has_any(tokens: &[String], words: &[&str]) -> bool {
    tokens.iter().any(|t| words.contains(&t.as_str()))
}
