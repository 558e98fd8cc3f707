use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use scrapeflow_core::config::ParseConfig;
use scrapeflow_core::error::{Result, ScrapeError};
use scrapeflow_core::traits::ContentParser;
use scrapeflow_core::types::{ContentKind, NormalizedContent, RawContent};

const IMAGE_EXTS: &[&str] = &[".jpg", ".jpeg", ".png", ".gif", ".bmp", ".svg", ".webp", ".ico"];

/// Regex-based parser for HTML and text-like content.
///
/// HTML is converted to line-oriented plain text; link and image URLs are
/// harvested from the untouched markup so nothing is lost in conversion.
#[derive(Debug, Default, Clone)]
pub struct HtmlParser;

impl ContentParser for HtmlParser {
    fn parse(&self, raw: &RawContent, options: &ParseConfig) -> Result<NormalizedContent> {
        if !raw.kind.is_textual() {
            return Err(ScrapeError::Parse(format!(
                "no parser for {} content from {}",
                raw.kind.as_str(),
                raw.locator
            )));
        }

        let body = raw.text();
        let is_html = raw.kind == ContentKind::Html
            || (raw.kind == ContentKind::Unknown && looks_like_html(&body));

        let (links, images) = if options.parse_urls {
            extract_urls(&body, &raw.locator)
        } else {
            (vec![], vec![])
        };

        let text = if is_html && options.parse_html {
            html_to_text(&body)
        } else {
            body
        };

        let mut warnings = Vec::new();
        if text.trim().is_empty() && !raw.body.is_empty() {
            warnings.push(format!(
                "no text extracted from {}-byte document",
                raw.body.len()
            ));
        }

        debug!(
            locator = %raw.locator,
            links = links.len(),
            images = images.len(),
            "Parsed document"
        );

        Ok(NormalizedContent {
            text,
            links,
            images,
            warnings,
        })
    }
}

fn looks_like_html(text: &str) -> bool {
    let head = text.trim_start();
    head.starts_with('<')
        && (head.contains("<html") || head.contains("<body") || head.contains("<div"))
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex must compile"))
}

/// Convert HTML into readable plain text, one block element per line.
pub fn html_to_text(html: &str) -> String {
    static SCRIPT: OnceLock<Regex> = OnceLock::new();
    static STYLE: OnceLock<Regex> = OnceLock::new();
    static COMMENT: OnceLock<Regex> = OnceLock::new();
    static BLOCK: OnceLock<Regex> = OnceLock::new();
    static CELL: OnceLock<Regex> = OnceLock::new();
    static TAG: OnceLock<Regex> = OnceLock::new();
    static SPACES: OnceLock<Regex> = OnceLock::new();
    static BLANK_LINES: OnceLock<Regex> = OnceLock::new();

    let cleaned = regex(&SCRIPT, r"(?is)<script[^>]*>.*?</script>").replace_all(html, "");
    let cleaned = regex(&STYLE, r"(?is)<style[^>]*>.*?</style>").replace_all(&cleaned, "");
    let cleaned = regex(&COMMENT, r"(?s)<!--.*?-->").replace_all(&cleaned, "");

    // Block boundaries become line breaks, table cells become separators
    let cleaned = regex(
        &BLOCK,
        r"(?i)<br\s*/?>|</?(p|div|li|ul|ol|tr|table|h[1-6]|section|article|header|footer)\b[^>]*>",
    )
    .replace_all(&cleaned, "\n");
    let cleaned = regex(&CELL, r"(?i)</t[dh]>|</span>").replace_all(&cleaned, " ");
    let text = regex(&TAG, r"<[^>]+>").replace_all(&cleaned, "");

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let text = regex(&SPACES, r"[ \t]+").replace_all(&text, " ");
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let joined = lines.join("\n");
    let text = regex(&BLANK_LINES, r"\n{3,}").replace_all(&joined, "\n\n");

    text.trim().to_string()
}

/// Return `(links, images)` found in `text`, resolved against `source`.
///
/// Looks at `<a href>`, `<img>`/`<source>` source attributes, bare
/// `http(s)://` URLs and markdown `](path)` links. Output is sorted and
/// free of duplicates; a URL classified as image is not repeated as link.
pub fn extract_urls(text: &str, source: &str) -> (Vec<String>, Vec<String>) {
    static ANCHOR: OnceLock<Regex> = OnceLock::new();
    static MEDIA_TAG: OnceLock<Regex> = OnceLock::new();
    static MEDIA_ATTR: OnceLock<Regex> = OnceLock::new();
    static ABSOLUTE: OnceLock<Regex> = OnceLock::new();
    static MARKDOWN: OnceLock<Regex> = OnceLock::new();

    let base = reqwest::Url::parse(source).ok();
    let mut links = BTreeSet::new();
    let mut images = BTreeSet::new();

    let mut categorise = |url: &str| {
        let url = url.trim();
        if url.is_empty() || url == "#" || url == "/" || url.starts_with('#') {
            return;
        }
        let absolute = match reqwest::Url::parse(url) {
            Ok(u) => u.to_string(),
            Err(_) => match base.as_ref().and_then(|b| b.join(url).ok()) {
                Some(u) => u.to_string(),
                None => url.to_string(),
            },
        };
        let without_query = absolute
            .split('?')
            .next()
            .unwrap_or_default()
            .split('#')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if IMAGE_EXTS.iter().any(|ext| without_query.ends_with(ext)) {
            images.insert(absolute);
        } else {
            links.insert(absolute);
        }
    };

    for cap in regex(&ANCHOR, r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']*)["']"#).captures_iter(text) {
        categorise(&cap[1]);
    }

    for tag in regex(&MEDIA_TAG, r"(?is)<(?:img|source)\b[^>]*>").find_iter(text) {
        let attrs = regex(
            &MEDIA_ATTR,
            r#"(?i)\b(src|data-src|data-srcset|srcset)\s*=\s*["']([^"']*)["']"#,
        );
        for cap in attrs.captures_iter(tag.as_str()) {
            let value = &cap[2];
            if cap[1].to_ascii_lowercase().ends_with("set") {
                // srcset holds "url width, url width"
                for part in value.split(',') {
                    if let Some(url) = part.split_whitespace().next() {
                        categorise(url);
                    }
                }
            } else {
                categorise(value);
            }
        }
    }

    for m in regex(&ABSOLUTE, r#"(?i)https?://[^\s)"'<>]+"#).find_iter(text) {
        categorise(m.as_str());
    }

    for cap in regex(&MARKDOWN, r"\]\(([^)]+)\)").captures_iter(text) {
        if let Some(url) = cap[1].split_whitespace().next() {
            categorise(url);
        }
    }

    let links = links.difference(&images).cloned().collect();
    (links, images.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(parse_urls: bool) -> ParseConfig {
        ParseConfig {
            parse_urls,
            ..ParseConfig::default()
        }
    }

    #[test]
    fn test_html_to_text_blocks_and_entities() {
        let html = r#"<html><head><style>p{}</style><script>var x = 1;</script></head>
<body><h1>Shop</h1><ul><li><span>Widget</span><span>$9.99</span></li>
<li>Gadget &amp; Co</li></ul></body></html>"#;
        let text = html_to_text(html);
        assert!(text.contains("Shop"));
        assert!(text.contains("Widget $9.99"));
        assert!(text.contains("Gadget & Co"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("p{}"));
        assert!(!text.contains('<'));
    }

    #[test]
    fn test_extract_urls_resolves_and_splits() {
        let html = r##"<a href="/about">About</a>
<a href="#top">Top</a>
<a href="https://other.org/page?x=1">Other</a>
<img src="img/logo.PNG" alt="logo">
<source srcset="/a.webp 1x, /b.webp 2x">
see https://cdn.example.com/banner.jpg?v=2
![diagram](docs/diagram.svg "title")"##;
        let (links, images) = extract_urls(html, "https://example.com/shop/");
        assert_eq!(
            links,
            vec![
                "https://example.com/about".to_string(),
                "https://other.org/page?x=1".to_string(),
            ]
        );
        assert_eq!(
            images,
            vec![
                "https://cdn.example.com/banner.jpg?v=2".to_string(),
                "https://example.com/a.webp".to_string(),
                "https://example.com/b.webp".to_string(),
                "https://example.com/shop/docs/diagram.svg".to_string(),
                "https://example.com/shop/img/logo.PNG".to_string(),
            ]
        );
    }

    #[test]
    fn test_relative_urls_kept_without_base() {
        let (links, images) = extract_urls(r#"<a href="next.html">n</a>"#, "inline");
        assert_eq!(links, vec!["next.html".to_string()]);
        assert!(images.is_empty());
    }

    #[test]
    fn test_parse_html_document() {
        let raw = RawContent::new(
            "https://example.com",
            ContentKind::Html,
            r#"<div><a href="/p/1">Item</a><img src="/i.png"></div>"#,
        );
        let parsed = HtmlParser.parse(&raw, &options(true)).unwrap();
        assert_eq!(parsed.text, "Item");
        assert_eq!(parsed.links, vec!["https://example.com/p/1".to_string()]);
        assert_eq!(parsed.images, vec!["https://example.com/i.png".to_string()]);
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_parse_skips_urls_when_disabled() {
        let raw = RawContent::new("https://example.com", ContentKind::Html, r#"<a href="/x">x</a>"#);
        let parsed = HtmlParser.parse(&raw, &options(false)).unwrap();
        assert!(parsed.links.is_empty());
        assert!(parsed.images.is_empty());
    }

    #[test]
    fn test_parse_keeps_markup_when_conversion_disabled() {
        let raw = RawContent::new("inline", ContentKind::Html, "<p>raw</p>");
        let opts = ParseConfig {
            parse_html: false,
            ..ParseConfig::default()
        };
        let parsed = HtmlParser.parse(&raw, &opts).unwrap();
        assert_eq!(parsed.text, "<p>raw</p>");
    }

    #[test]
    fn test_empty_extraction_warns() {
        let raw = RawContent::new("inline", ContentKind::Html, "<div><img src='a.png'></div>");
        let parsed = HtmlParser.parse(&raw, &options(false)).unwrap();
        assert!(parsed.text.is_empty());
        assert_eq!(parsed.warnings.len(), 1);
    }

    #[test]
    fn test_binary_content_rejected() {
        let raw = RawContent::new("doc.pdf", ContentKind::Pdf, vec![0x25, 0x50, 0x44, 0x46]);
        let err = HtmlParser.parse(&raw, &options(false)).unwrap_err();
        assert!(matches!(err, ScrapeError::Parse(_)));
    }

    #[test]
    fn test_plain_text_passthrough() {
        let raw = RawContent::new("notes.txt", ContentKind::Text, "just text\nsecond line");
        let parsed = HtmlParser.parse(&raw, &options(false)).unwrap();
        assert_eq!(parsed.text, "just text\nsecond line");
    }
}
