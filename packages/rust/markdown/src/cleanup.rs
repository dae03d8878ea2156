//! Post-conversion cleanup passes for extracted Markdown.
//!
//! Each pass is a `&str -> String` function applied in sequence. Passes that
//! touch prose skip fenced code blocks.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Run every cleanup pass over raw converter output.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let mut result = md.replace("\r\n", "\n");

    result = normalize_headings(&result);
    result = fix_code_block_languages(&result);
    result = map_prose_lines(&result, strip_html_tags);
    result = map_prose_lines(&result, drop_empty_links);
    result = resolve_links(&result, base_url);
    result = map_prose_lines(&result, normalize_spaces);
    result = collapse_blank_lines(&result);
    trim_document(&result)
}

/// Apply `f` to every line outside fenced code blocks.
fn map_prose_lines(md: &str, f: impl Fn(&str) -> String) -> String {
    let mut in_code = false;
    md.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                in_code = !in_code;
                return line.to_string();
            }
            if in_code { line.to_string() } else { f(line) }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Headings
// ---------------------------------------------------------------------------

/// Keep only the first H1; later ones become H2. Empty headings are dropped.
fn normalize_headings(md: &str) -> String {
    static H_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^(#{1,6})(?:\s+(.*))?$").expect("valid regex"));
    static CLOSING_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s+#+$").expect("valid regex"));

    let mut seen_h1 = false;
    let mut in_code = false;
    let mut lines = Vec::new();

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_code = !in_code;
        }
        let Some(caps) = (!in_code).then(|| H_RE.captures(line)).flatten() else {
            lines.push(line.to_string());
            continue;
        };

        let raw = caps.get(2).map_or("", |m| m.as_str().trim());
        let text = CLOSING_RE.replace(raw, "");
        if text.is_empty() {
            continue;
        }
        if &caps[1] == "#" {
            if seen_h1 {
                lines.push(format!("## {text}"));
                continue;
            }
            seen_h1 = true;
        }
        lines.push(format!("{} {text}", &caps[1]));
    }

    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Code blocks
// ---------------------------------------------------------------------------

/// Turn class-style fence hints (`language-js`, `lang-py`) into plain ones.
fn fix_code_block_languages(md: &str) -> String {
    static LANG_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^(\s*)```(?:language-|lang-|highlight-)([\w+#-]+)").expect("valid regex")
    });

    LANG_PREFIX_RE.replace_all(md, "$1```$2").into_owned()
}

// ---------------------------------------------------------------------------
// Stray HTML
// ---------------------------------------------------------------------------

/// Remove HTML tags the converter passed through, keeping their text.
fn strip_html_tags(line: &str) -> String {
    static HTML_TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|main|font|center|small|sup|sub|u|mark|abbr|time|picture|source|label)(?:\s[^>]*)?/?>",
        )
        .expect("valid regex")
    });
    static COMMENT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<!--.*?-->").expect("valid regex"));

    let without_comments = COMMENT_RE.replace_all(line, "");
    HTML_TAG_RE.replace_all(&without_comments, "").into_owned()
}

// ---------------------------------------------------------------------------
// Links
// ---------------------------------------------------------------------------

/// Links with no visible text (icon links) carry no content.
fn drop_empty_links(line: &str) -> String {
    static EMPTY_LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(^|[^!])\[\s*\]\([^)]*\)").expect("valid regex"));

    EMPTY_LINK_RE.replace_all(line, "$1").into_owned()
}

/// Resolve relative link targets against the page URL. Images and fenced
/// code are left alone.
fn resolve_links(md: &str, base_url: Option<&Url>) -> String {
    let Some(base) = base_url else {
        return md.to_string();
    };

    static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"(!?)\[([^\]]*)\]\(([^)\s]+)((?:\s+"[^"]*")?)\)"#).expect("valid regex")
    });

    map_prose_lines(md, |line| {
        LINK_RE
            .replace_all(line, |caps: &regex::Captures<'_>| {
                let (bang, text, href, title) = (&caps[1], &caps[2], &caps[3], &caps[4]);
                if !bang.is_empty() || is_absolute_or_local(href) {
                    return caps[0].to_string();
                }
                match base.join(href) {
                    Ok(resolved) => format!("[{text}]({resolved}{title})"),
                    Err(_) => caps[0].to_string(),
                }
            })
            .into_owned()
    })
}

fn is_absolute_or_local(href: &str) -> bool {
    href.starts_with('#')
        || href.contains("://")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
}

// ---------------------------------------------------------------------------
// Whitespace
// ---------------------------------------------------------------------------

/// Non-breaking spaces become spaces; trailing whitespace is trimmed.
fn normalize_spaces(line: &str) -> String {
    line.replace('\u{a0}', " ").trim_end().to_string()
}

/// At most one blank line between blocks, outside code fences.
fn collapse_blank_lines(md: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_code = false;
    let mut blank_run = false;

    for line in md.lines() {
        if line.trim_start().starts_with("```") {
            in_code = !in_code;
        }
        let blank = !in_code && line.trim().is_empty();
        if blank && blank_run {
            continue;
        }
        blank_run = blank;
        out.push(if blank { "" } else { line });
    }

    out.join("\n")
}

/// No leading blank lines, exactly one trailing newline.
fn trim_document(md: &str) -> String {
    let trimmed = md.trim_start_matches('\n').trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
