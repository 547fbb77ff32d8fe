//! Link extraction from message HTML.
//!
//! Candidates are the `href` targets of `<a>` elements that begin with
//! `http`, in document order. Selection prefers a domain substring, then a
//! regex pattern, then falls back to the first candidate.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, warn};

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector is valid"));

/// Link selection preferences.
#[derive(Debug, Clone, Default)]
pub struct LinkOptions {
    /// Prefer the first candidate containing this substring.
    pub domain: Option<String>,
    /// Otherwise prefer the first candidate matching this pattern.
    pub pattern: Option<Regex>,
}

impl LinkOptions {
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }
}

/// Pick the best link from an HTML document.
///
/// Returns `None` when there is no HTML or no `http` link in it.
pub fn extract_link(html: Option<&str>, options: &LinkOptions) -> Option<String> {
    let Some(html) = html.filter(|h| !h.trim().is_empty()) else {
        warn!("No HTML content provided for link extraction");
        return None;
    };

    let links = extract_all_links(Some(html));
    if links.is_empty() {
        warn!("No links found in email HTML");
        return None;
    }

    info!(count = links.len(), "Found link(s) in email");
    debug!(?links, "Link candidates");

    if let Some(domain) = options.domain.as_deref()
        && let Some(link) = links.iter().find(|l| l.contains(domain))
    {
        info!(domain, link = %link, "Selected link by domain");
        return Some(link.clone());
    }

    if let Some(pattern) = options.pattern.as_ref()
        && let Some(link) = links.iter().find(|l| pattern.is_match(l))
    {
        info!(pattern = %pattern, link = %link, "Selected link by pattern");
        return Some(link.clone());
    }

    let first = links.into_iter().next();
    if let Some(link) = &first {
        info!(link = %link, "Selected first link");
    }
    first
}

/// Every `http` link in the document, in order. Empty when there is no HTML.
pub fn extract_all_links(html: Option<&str>) -> Vec<String> {
    let Some(html) = html else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    document
        .select(&ANCHOR)
        .filter_map(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| href.starts_with("http"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEWSLETTER: &str = r#"
        <html><body>
          <p>Hello</p>
          <a href="mailto:help@example.com">Help</a>
          <a class="btn" href="https://tracking.example.com/click?id=1">Track</a>
          <a href='https://www.netflix.com/account/travel/verify?nftoken=abc&amp;lnktrk=EVO'>Verify</a>
          <a href=http://plain.example.org/path>Bare</a>
          <a name="anchor">No href</a>
          <a href="/relative/link">Relative</a>
        </body></html>
    "#;

    // ── extract_all_links ───────────────────────────────────────────

    #[test]
    fn all_links_in_document_order_http_only() {
        let links = extract_all_links(Some(NEWSLETTER));
        assert_eq!(
            links,
            vec![
                "https://tracking.example.com/click?id=1",
                "https://www.netflix.com/account/travel/verify?nftoken=abc&lnktrk=EVO",
                "http://plain.example.org/path",
            ]
        );
    }

    #[test]
    fn all_links_empty_input() {
        assert!(extract_all_links(None).is_empty());
        assert!(extract_all_links(Some("")).is_empty());
    }

    #[test]
    fn abbr_and_area_tags_are_not_anchors() {
        let html = r#"<abbr title="x">A</abbr><area href="https://map.example.com">"#;
        assert!(extract_all_links(Some(html)).is_empty());
    }

    #[test]
    fn data_href_attribute_is_ignored() {
        let html = r#"<a data-href="https://wrong.example.com" href="https://right.example.com">x</a>"#;
        assert_eq!(extract_all_links(Some(html)), vec!["https://right.example.com"]);
    }

    #[test]
    fn uppercase_tags_and_spaced_equals() {
        let html = r#"<A HREF = "https://upper.example.com/x">X</A>"#;
        assert_eq!(extract_all_links(Some(html)), vec!["https://upper.example.com/x"]);
    }

    // ── extract_link ────────────────────────────────────────────────

    #[test]
    fn no_html_yields_none() {
        assert_eq!(extract_link(None, &LinkOptions::default()), None);
        assert_eq!(extract_link(Some("   "), &LinkOptions::default()), None);
    }

    #[test]
    fn no_http_links_yields_none() {
        let html = r#"<a href="mailto:x@y.z">m</a><a href="/rel">r</a><p>https://text.only</p>"#;
        assert_eq!(extract_link(Some(html), &LinkOptions::default()), None);
    }

    #[test]
    fn default_is_first_link() {
        let link = extract_link(Some(NEWSLETTER), &LinkOptions::default());
        assert_eq!(link.as_deref(), Some("https://tracking.example.com/click?id=1"));
    }

    #[test]
    fn domain_selects_first_containing_candidate() {
        let opts = LinkOptions::default().with_domain("netflix.com");
        let link = extract_link(Some(NEWSLETTER), &opts);
        assert_eq!(
            link.as_deref(),
            Some("https://www.netflix.com/account/travel/verify?nftoken=abc&lnktrk=EVO")
        );
    }

    #[test]
    fn unmatched_domain_falls_back_to_pattern() {
        let opts = LinkOptions::default()
            .with_domain("nowhere.invalid")
            .with_pattern(Regex::new(r"plain\.example\.org").unwrap());
        let link = extract_link(Some(NEWSLETTER), &opts);
        assert_eq!(link.as_deref(), Some("http://plain.example.org/path"));
    }

    #[test]
    fn domain_wins_over_pattern() {
        let opts = LinkOptions::default()
            .with_domain("tracking")
            .with_pattern(Regex::new(r"netflix").unwrap());
        let link = extract_link(Some(NEWSLETTER), &opts);
        assert_eq!(link.as_deref(), Some("https://tracking.example.com/click?id=1"));
    }

    #[test]
    fn unmatched_pattern_falls_back_to_first() {
        let opts = LinkOptions::default().with_pattern(Regex::new(r"^ftp://").unwrap());
        let link = extract_link(Some(NEWSLETTER), &opts);
        assert_eq!(link.as_deref(), Some("https://tracking.example.com/click?id=1"));
    }

    // ── markup edge cases ───────────────────────────────────────────

    #[test]
    fn angle_bracket_inside_attribute_keeps_link() {
        let html = r#"<a title="a > b" href="https://real.example.com/x">x</a>"#;
        assert_eq!(extract_all_links(Some(html)), vec!["https://real.example.com/x"]);
    }

    #[test]
    fn commented_out_anchor_is_skipped() {
        let html = r#"<!-- <a href="https://hidden.example.com">old</a> -->
            <a href="https://real.example.com">new</a>"#;
        assert_eq!(
            extract_link(Some(html), &LinkOptions::default()).as_deref(),
            Some("https://real.example.com")
        );
    }

    #[test]
    fn numeric_entities_in_href_are_decoded() {
        let html = r#"<a href="https://x.example.com/?a=1&#38;b=2&#x26;c=3">x</a>"#;
        assert_eq!(
            extract_all_links(Some(html)),
            vec!["https://x.example.com/?a=1&b=2&c=3"]
        );
    }
}
