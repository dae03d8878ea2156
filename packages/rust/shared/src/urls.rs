//! URL normalization used as the identity of crawl targets.

use std::net::IpAddr;

use url::Url;

/// Normalize a URL for deduplication.
///
/// Scheme and host are lower-cased by the `url` parser and default ports are
/// dropped; on top of that the fragment is stripped and a trailing slash is
/// removed from every path except the root, so `/a` and `/a/` collapse.
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let path = normalized.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed };
        normalized.set_path(trimmed);
    }

    if normalized.query() == Some("") {
        normalized.set_query(None);
    }

    normalized
}

/// Parse and normalize in one step. Returns `None` for unparsable input or
/// non-HTTP schemes.
pub fn parse_normalized(raw: &str) -> Option<Url> {
    let url = Url::parse(raw.trim()).ok()?;
    match url.scheme() {
        "http" | "https" => Some(normalize_url(&url)),
        _ => None,
    }
}

/// Resolve `href` against `base` and normalize. Skips anchors, `javascript:`,
/// `mailto:` and `tel:` links.
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let resolved = base.join(href).ok()?;
    match resolved.scheme() {
        "http" | "https" => Some(normalize_url(&resolved)),
        _ => None,
    }
}

/// Host without a leading `www.`.
pub fn bare_host(url: &Url) -> Option<String> {
    url.host_str()
        .map(|h| h.trim_start_matches("www.").to_ascii_lowercase())
}

/// Whether `candidate` belongs to the same site as `root`: equal hosts
/// (ignoring a leading `www.`) or a subdomain of the root host.
pub fn same_site(root: &Url, candidate: &Url) -> bool {
    let (Some(root_host), Some(host)) = (bare_host(root), bare_host(candidate)) else {
        return false;
    };
    host == root_host || host.ends_with(&format!(".{root_host}"))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Whether a URL targets a loopback, private or otherwise internal host.
/// Non-http(s) schemes count as internal.
pub fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            let host = host.to_ascii_lowercase();
            host == "localhost"
                || host.ends_with(".localhost")
                || host.ends_with(".local")
                || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(&IpAddr::V4(v4)))
        }
    }
}

/// Whether a listing or redirect target may be fetched on behalf of a crawl
/// rooted at `root`. Internal hosts are only reachable from an internal root.
pub fn allowed_from(root: &Url, target: &Url) -> bool {
    !is_ssrf_target(target) || is_ssrf_target(root)
}
