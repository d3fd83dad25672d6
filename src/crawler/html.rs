use once_cell::sync::Lazy;
use scraper::{Html, Node, Selector};
use url::Url;

static LINK_SELECTOR: Lazy<Option<Selector>> = Lazy::new(|| Selector::parse("a[href]").ok());

const HIDDEN_ELEMENTS: [&str; 4] = ["script", "style", "noscript", "template"];

/// Visible text of a document, whitespace-collapsed
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut words: Vec<&str> = Vec::new();

    for node in document.root_element().descendants() {
        let Node::Text(text) = node.value() else {
            continue;
        };

        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map(|element| HIDDEN_ELEMENTS.contains(&element.name()))
                .unwrap_or(false)
        });
        if hidden {
            continue;
        }

        words.extend(text.split_whitespace());
    }

    words.join(" ")
}

/// Whether the page carries a `<noscript>` fallback
pub fn has_noscript(html: &str) -> bool {
    html.to_ascii_lowercase().contains("<noscript")
}

/// Absolute http(s) links found in `html`, resolved against `base_url`
pub fn extract_links(html: &str, base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };
    let Some(selector) = LINK_SELECTOR.as_ref() else {
        return Vec::new();
    };

    let document = Html::parse_document(html);

    document
        .select(selector)
        .filter_map(|element| element.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|url| url.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_text_skips_scripts_and_styles() {
        let html = r#"<html><head><style>body { color: red }</style>
            <script>var x = 1;</script></head>
            <body><h1>Title</h1>
            <p>Some   body
            text</p><noscript>Enable JS</noscript></body></html>"#;

        assert_eq!(extract_text(html), "Title Some body text");
    }

    #[test]
    fn test_has_noscript() {
        assert!(has_noscript("<body><NOSCRIPT>Please enable JS</NOSCRIPT></body>"));
        assert!(!has_noscript("<body><p>plain</p></body>"));
    }

    #[test]
    fn test_extract_links_resolves_relative_urls() {
        let html = r#"<a href="/docs">Docs</a>
            <a href="../up">Up</a>
            <a href="https://other.com/b">Other</a>
            <a href="mailto:me@example.com">Mail</a>
            <a href="javascript:void(0)">JS</a>
            <a>No href</a>"#;

        let links = extract_links(html, "https://example.com/section/page");
        assert_eq!(
            links,
            vec![
                "https://example.com/docs",
                "https://example.com/up",
                "https://other.com/b",
            ]
        );
    }

    #[test]
    fn test_extract_links_with_invalid_base() {
        assert!(extract_links(r#"<a href="/x">x</a>"#, "not a url").is_empty());
    }
}
