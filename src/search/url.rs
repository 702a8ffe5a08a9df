//! URL and query hygiene shared by the providers and the router.

use url::Url;

/// Maximum query length sent to any provider.
pub const MAX_QUERY_CHARS: usize = 400;

/// Normalize a URL into a deduplication key.
///
/// Lower-cases everything, unifies the scheme to https, strips a leading
/// `www.`, drops query string and fragment, and removes trailing slashes.
/// Returns `None` for anything that does not parse as an absolute http(s)
/// URL with a host.
pub fn normalize_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);

    let mut key = format!("https://{}", host);
    if let Some(port) = parsed.port() {
        key.push_str(&format!(":{}", port));
    }
    key.push_str(parsed.path().trim_end_matches('/'));
    Some(key.to_lowercase())
}

/// Host name used as the human-readable source name (`www.` stripped).
pub fn source_name(raw: &str) -> String {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .map(|h| h.strip_prefix("www.").map(str::to_string).unwrap_or(h))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Collapse whitespace and cap the query length.
pub fn sanitize_query(query: &str) -> String {
    let collapsed = query.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_QUERY_CHARS).collect()
}

/// Clean a list of domain filters into bare, unique host names.
///
/// Accepts full URLs, strips `www.`, drops entries without a dot, and keeps
/// at most `limit` entries in input order.
pub fn sanitize_domains(domains: &[String], limit: usize) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for raw in domains {
        let mut host = raw.trim().to_ascii_lowercase();
        if host.starts_with("http://") || host.starts_with("https://") {
            match Url::parse(&host).ok().and_then(|u| u.host_str().map(str::to_string)) {
                Some(h) => host = h,
                None => continue,
            }
        }
        let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
        if !host.contains('.') || cleaned.contains(&host) {
            continue;
        }
        cleaned.push(host);
        if cleaned.len() >= limit {
            break;
        }
    }
    cleaned
}

/// Truncate on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_trailing_slash_and_fragment() {
        let a = normalize_url("https://example.com/page/").unwrap();
        let b = normalize_url("https://example.com/page#section").unwrap();
        let c = normalize_url("http://WWW.Example.com/page?utm_source=x").unwrap();
        assert_eq!(a, "https://example.com/page");
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_normalize_root_and_port() {
        assert_eq!(normalize_url("https://example.com/").unwrap(), "https://example.com");
        assert_eq!(
            normalize_url("https://example.com:8443/a/").unwrap(),
            "https://example.com:8443/a"
        );
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        assert!(normalize_url("not a url").is_none());
        assert!(normalize_url("ftp://example.com/file").is_none());
        assert!(normalize_url("").is_none());
    }

    #[test]
    fn test_source_name() {
        assert_eq!(source_name("https://www.reuters.com/markets"), "reuters.com");
        assert_eq!(source_name("https://en.wikipedia.org/wiki/Paris"), "en.wikipedia.org");
        assert_eq!(source_name("garbage"), "unknown");
    }

    #[test]
    fn test_sanitize_query() {
        assert_eq!(sanitize_query("  capital   of\nFrance "), "capital of France");
        let long = "a ".repeat(500);
        assert_eq!(sanitize_query(&long).chars().count(), MAX_QUERY_CHARS);
    }

    #[test]
    fn test_sanitize_domains() {
        let domains = vec![
            "https://www.imf.org/en".to_string(),
            "imf.org".to_string(),
            "localhost".to_string(),
            "WorldBank.org".to_string(),
            "oecd.org".to_string(),
        ];
        assert_eq!(sanitize_domains(&domains, 10), vec!["imf.org", "worldbank.org", "oecd.org"]);
        assert_eq!(sanitize_domains(&domains, 1), vec!["imf.org"]);
    }
}
