//! Which URLs a crawl may fetch and which it may return.

use regex::Regex;
use sitekb_shared::{CrawlConfig, same_site};
use tracing::warn;
use url::Url;

/// Scope rules for one crawl rooted at `root`.
#[derive(Debug, Clone)]
pub struct CrawlScope {
    root: Url,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl CrawlScope {
    pub fn new(root: &Url, config: &CrawlConfig) -> Self {
        Self {
            root: root.clone(),
            include: config.include_patterns.iter().map(|p| compile_pattern(p)).collect(),
            exclude: config.exclude_patterns.iter().map(|p| compile_pattern(p)).collect(),
        }
    }

    /// Same-site http(s) URL not matching any exclude pattern. Only such URLs
    /// are ever fetched.
    pub fn may_fetch(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && same_site(&self.root, url)
            && !self.exclude.iter().any(|re| re.is_match(url.as_str()))
    }

    /// Whether a fetched URL is returned. With no include patterns every
    /// fetchable URL is accepted; otherwise at least one must match.
    pub fn accepts(&self, url: &Url) -> bool {
        self.may_fetch(url)
            && (self.include.is_empty() || self.include.iter().any(|re| re.is_match(url.as_str())))
    }
}

/// Compile a user pattern as a regex searched anywhere in the URL. Invalid
/// regexes are matched as literal substrings instead.
pub fn compile_pattern(pattern: &str) -> Regex {
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!(pattern, error = %e, "invalid URL pattern, matching literally");
            // an escaped literal always compiles
            Regex::new(&regex::escape(pattern)).unwrap_or_else(|_| never_matches())
        }
    }
}

fn never_matches() -> Regex {
    Regex::new(r"[^\s\S]").expect("valid regex")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(include: &[&str], exclude: &[&str]) -> CrawlScope {
        let config = CrawlConfig {
            include_patterns: include.iter().map(|s| s.to_string()).collect(),
            exclude_patterns: exclude.iter().map(|s| s.to_string()).collect(),
            ..CrawlConfig::default()
        };
        CrawlScope::new(&Url::parse("https://ex.com/").unwrap(), &config)
    }

    fn u(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn off_site_never_fetched() {
        let s = scope(&[], &[]);
        assert!(s.may_fetch(&u("https://www.ex.com/a")));
        assert!(s.may_fetch(&u("https://blog.ex.com/a")));
        assert!(!s.may_fetch(&u("https://other.org/a")));
        assert!(!s.may_fetch(&u("ftp://ex.com/a")));
    }

    #[test]
    fn exclude_beats_include() {
        let s = scope(&["/blog/"], &["/blog/drafts"]);
        assert!(s.accepts(&u("https://ex.com/blog/post")));
        assert!(!s.accepts(&u("https://ex.com/blog/drafts/x")));
        assert!(!s.may_fetch(&u("https://ex.com/blog/drafts/x")));
    }

    #[test]
    fn include_only_gates_acceptance() {
        let s = scope(&["/blog/"], &[]);
        let index = u("https://ex.com/archive");
        assert!(s.may_fetch(&index));
        assert!(!s.accepts(&index));
    }

    #[test]
    fn patterns_are_searched_regexes() {
        let s = scope(&[r"/posts?/\d+"], &[]);
        assert!(s.accepts(&u("https://ex.com/en/post/42")));
        assert!(!s.accepts(&u("https://ex.com/post/latest")));
    }

    #[test]
    fn invalid_regex_matches_literally() {
        let re = compile_pattern("/blog/(draft");
        assert!(re.is_match("https://ex.com/blog/(draft-1"));
        assert!(!re.is_match("https://ex.com/blog/draft-1"));
    }
}
