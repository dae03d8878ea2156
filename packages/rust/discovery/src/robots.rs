//! Minimal robots.txt support: `Sitemap:` lines plus `Allow`/`Disallow`
//! rules for the `*` group (or a group naming our agent).

use regex::Regex;
use url::Url;

/// Agent token matched against `User-agent:` lines.
const AGENT_TOKEN: &str = "sitekb";

/// Parsed robots.txt rules relevant to discovery.
#[derive(Debug, Clone, Default)]
pub struct RobotsRules {
    /// Sitemaps advertised via `Sitemap:` lines, resolved against the origin.
    pub sitemaps: Vec<Url>,
    pub(crate) rules: Vec<Rule>,
}

#[derive(Debug, Clone)]
pub(crate) struct Rule {
    allow: bool,
    /// Length of the original pattern; longest match wins.
    specificity: usize,
    pattern: Regex,
}

impl RobotsRules {
    /// Whether `path` (including any query string) may be fetched.
    pub fn allows(&self, path: &str) -> bool {
        let mut best: Option<&Rule> = None;
        for rule in self.rules.iter().filter(|r| r.pattern.is_match(path)) {
            best = match best {
                None => Some(rule),
                Some(b) if rule.specificity > b.specificity => Some(rule),
                Some(b) if rule.specificity == b.specificity && rule.allow => Some(rule),
                keep => keep,
            };
        }
        best.is_none_or(|r| r.allow)
    }

    /// Whether the URL's path and query may be fetched.
    pub fn allows_url(&self, url: &Url) -> bool {
        match url.query() {
            Some(q) => self.allows(&format!("{}?{q}", url.path())),
            None => self.allows(url.path()),
        }
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }
}

/// Parse a robots.txt body. Never fails; unknown lines are ignored.
pub fn parse_robots(body: &str, origin: &Url) -> RobotsRules {
    let mut parsed = RobotsRules::default();

    let mut group_applies = false;
    let mut in_rules = false;

    for raw in body.lines() {
        let line = raw.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();

        match key.as_str() {
            "user-agent" => {
                if in_rules {
                    // A new group starts after a block of rules.
                    group_applies = false;
                    in_rules = false;
                }
                let agent = value.to_ascii_lowercase();
                if agent == "*" || agent.contains(AGENT_TOKEN) {
                    group_applies = true;
                }
            }
            "allow" | "disallow" => {
                in_rules = true;
                if group_applies && !value.is_empty() {
                    if let Some(pattern) = rule_regex(value) {
                        parsed.rules.push(Rule {
                            allow: key == "allow",
                            specificity: value.len(),
                            pattern,
                        });
                    }
                }
            }
            "sitemap" => {
                if let Ok(url) = origin.join(value) {
                    parsed.sitemaps.push(url);
                }
            }
            _ => {}
        }
    }

    parsed
}

/// Translate a robots path pattern (`*` wildcard, `$` end anchor) to a regex.
fn rule_regex(pattern: &str) -> Option<Regex> {
    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(stripped) => (stripped, true),
        None => (pattern, false),
    };
    let escaped = regex::escape(body).replace(r"\*", ".*");
    let suffix = if anchored { "$" } else { "" };
    Regex::new(&format!("^{escaped}{suffix}")).ok()
}
