use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::config::UrlPatterns;
use crate::crawler::request::CrawlRequest;
use crate::crawler::robots::RobotsTxt;

/// Which discovered links stay in scope, relative to the page they came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EnqueueStrategy {
    All,
    SameOrigin,
    #[default]
    SameHostname,
    /// Compares the last two DNS labels
    SameDomain,
}

/// Why a discovered link was not enqueued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    Invalid,
    Strategy,
    Exclude,
    Filters,
    RobotsTxt,
    Transform,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedLink {
    pub url: String,
    pub reason: SkipReason,
}

/// Glob or regular expression over absolute URLs, with optional metadata
/// attached to the requests it matches
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
    pub label: Option<String>,
    pub user_data: Option<Value>,
}

impl UrlPattern {
    /// `/.../` is a regular expression, anything else a glob
    pub fn new(pattern: &str) -> Result<Self> {
        let expression = match pattern.strip_prefix('/').and_then(|p| p.strip_suffix('/')) {
            Some(regex) if pattern.len() > 1 => regex.to_string(),
            _ => glob_to_regex(pattern),
        };

        let regex = Regex::new(&expression).context(format!("Invalid URL pattern: {}", pattern))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
            label: None,
            user_data: None,
        })
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_user_data(mut self, user_data: Value) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// `**` matches anything, `*` anything but `/`, `?` one character
fn glob_to_regex(glob: &str) -> String {
    let mut expression = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                expression.push_str(".*");
            }
            '*' => expression.push_str("[^/]*"),
            '?' => expression.push('.'),
            other => expression.push_str(&regex::escape(&other.to_string())),
        }
    }

    expression.push('$');
    expression
}

/// Veto (None) or rewrite a request before it is enqueued
pub type TransformHook = Arc<dyn Fn(CrawlRequest) -> Option<CrawlRequest> + Send + Sync>;

pub type SkipHook = Arc<dyn Fn(&SkippedLink) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EnqueueLinksOptions {
    pub strategy: EnqueueStrategy,
    pub include: Vec<UrlPattern>,
    pub exclude: Vec<UrlPattern>,
    pub robots: Option<Arc<RobotsTxt>>,
    /// User agent checked against `robots`
    pub user_agent: String,
    /// Depth assigned to the produced requests
    pub depth: u32,
    pub max_retries: Option<u32>,
    pub label: Option<String>,
    pub user_data: Option<Value>,
    pub transform: Option<TransformHook>,
    pub on_skip: Option<SkipHook>,
}

impl EnqueueLinksOptions {
    pub fn new(strategy: EnqueueStrategy) -> Self {
        Self {
            strategy,
            ..Default::default()
        }
    }

    /// Compile configured include/exclude patterns
    pub fn with_patterns(mut self, patterns: &UrlPatterns) -> Result<Self> {
        self.include = patterns.include.iter().map(|p| UrlPattern::new(p)).collect::<Result<_>>()?;
        self.exclude = patterns.exclude.iter().map(|p| UrlPattern::new(p)).collect::<Result<_>>()?;
        Ok(self)
    }
}

/// Filter discovered `urls` against `base_url` and build the requests to enqueue.
///
/// Checks run in order: URL validity, scope strategy, exclude patterns,
/// include patterns, robots.txt, transform hook. Every discarded link is
/// reported to `on_skip`.
pub fn enqueue_links(urls: &[String], base_url: &str, options: &EnqueueLinksOptions) -> Vec<CrawlRequest> {
    let base = Url::parse(base_url).ok();
    let skip = |url: &str, reason: SkipReason| {
        debug!("Skipping {} ({:?})", url, reason);
        if let Some(on_skip) = &options.on_skip {
            on_skip(&SkippedLink {
                url: url.to_string(),
                reason,
            });
        }
    };

    let mut requests = Vec::new();

    for raw in urls {
        let resolved = match &base {
            Some(base) => base.join(raw),
            None => Url::parse(raw),
        };
        let url = match resolved {
            Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => url,
            _ => {
                skip(raw, SkipReason::Invalid);
                continue;
            }
        };
        let href = url.to_string();

        let allowed = match &base {
            Some(base) => in_scope(options.strategy, base, &url),
            // No page to compare against
            None => options.strategy == EnqueueStrategy::All,
        };
        if !allowed {
            skip(&href, SkipReason::Strategy);
            continue;
        }

        if options.exclude.iter().any(|pattern| pattern.matches(&href)) {
            skip(&href, SkipReason::Exclude);
            continue;
        }

        let matched = options.include.iter().find(|pattern| pattern.matches(&href));
        if !options.include.is_empty() && matched.is_none() {
            skip(&href, SkipReason::Filters);
            continue;
        }

        if let Some(robots) = &options.robots {
            if !robots.is_allowed(&href, &options.user_agent) {
                skip(&href, SkipReason::RobotsTxt);
                continue;
            }
        }

        let mut request = match CrawlRequest::new(href.clone()) {
            Ok(request) => request.with_depth(options.depth),
            Err(_) => {
                skip(&href, SkipReason::Invalid);
                continue;
            }
        };

        let label = matched.and_then(|p| p.label.clone()).or_else(|| options.label.clone());
        let user_data = matched.and_then(|p| p.user_data.clone()).or_else(|| options.user_data.clone());
        request = request.with_label(label);
        if let Some(user_data) = user_data {
            request = request.with_user_data(user_data);
        }
        if let Some(max_retries) = options.max_retries {
            request = request.with_max_retries(max_retries);
        }

        if let Some(transform) = &options.transform {
            match transform(request) {
                Some(transformed) => request = transformed,
                None => {
                    skip(&href, SkipReason::Transform);
                    continue;
                }
            }
        }

        requests.push(request);
    }

    requests
}

fn in_scope(strategy: EnqueueStrategy, base: &Url, url: &Url) -> bool {
    match strategy {
        EnqueueStrategy::All => true,
        EnqueueStrategy::SameOrigin => base.origin() == url.origin(),
        EnqueueStrategy::SameHostname => base.host_str().map(str::to_lowercase) == url.host_str().map(str::to_lowercase),
        EnqueueStrategy::SameDomain => match (base.host_str(), url.host_str()) {
            (Some(a), Some(b)) => registrable_domain(a) == registrable_domain(b),
            _ => false,
        },
    }
}

fn registrable_domain(host: &str) -> String {
    let host = host.to_lowercase();
    let labels: Vec<&str> = host.trim_end_matches('.').split('.').collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    labels[labels.len() - 2..].join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn collecting(options: EnqueueLinksOptions) -> (EnqueueLinksOptions, Arc<Mutex<Vec<SkippedLink>>>) {
        let skipped = Arc::new(Mutex::new(Vec::new()));
        let sink = skipped.clone();
        let options = EnqueueLinksOptions {
            on_skip: Some(Arc::new(move |link: &SkippedLink| sink.lock().unwrap().push(link.clone()))),
            ..options
        };
        (options, skipped)
    }

    #[test]
    fn test_glob_patterns() {
        let pattern = UrlPattern::new("https://example.com/products/*").unwrap();
        assert!(pattern.matches("https://example.com/products/42"));
        assert!(!pattern.matches("https://example.com/products/42/reviews"));

        let deep = UrlPattern::new("https://example.com/**").unwrap();
        assert!(deep.matches("https://example.com/a/b/c"));

        let regex = UrlPattern::new(r"/\/item\/\d+$/").unwrap();
        assert!(regex.matches("https://shop.example.com/item/17"));
        assert!(!regex.matches("https://shop.example.com/item/abc"));
    }

    #[test]
    fn test_strategies() {
        let base = Url::parse("https://www.example.com/").unwrap();
        let same_host = Url::parse("https://www.example.com/a").unwrap();
        let other_scheme = Url::parse("http://www.example.com/a").unwrap();
        let sub = Url::parse("https://blog.example.com/a").unwrap();
        let other = Url::parse("https://other.com/").unwrap();

        assert!(in_scope(EnqueueStrategy::SameOrigin, &base, &same_host));
        assert!(!in_scope(EnqueueStrategy::SameOrigin, &base, &other_scheme));
        assert!(in_scope(EnqueueStrategy::SameHostname, &base, &other_scheme));
        assert!(!in_scope(EnqueueStrategy::SameHostname, &base, &sub));
        assert!(in_scope(EnqueueStrategy::SameDomain, &base, &sub));
        assert!(!in_scope(EnqueueStrategy::SameDomain, &base, &other));
        assert!(in_scope(EnqueueStrategy::All, &base, &other));
    }

    #[test]
    fn test_skip_reasons_in_order() {
        let robots = RobotsTxt::new(
            vec![crate::crawler::robots::RobotsRule {
                user_agent: "*".to_string(),
                disallow: vec!["/private".to_string()],
                ..Default::default()
            }],
            vec![],
        );
        let options = EnqueueLinksOptions {
            exclude: vec![UrlPattern::new("**/logout").unwrap()],
            include: vec![UrlPattern::new("https://example.com/**").unwrap()],
            robots: Some(Arc::new(robots)),
            user_agent: "bot".to_string(),
            transform: Some(Arc::new(|request: CrawlRequest| {
                if request.url.ends_with("/veto") {
                    None
                } else {
                    Some(request)
                }
            })),
            ..EnqueueLinksOptions::new(EnqueueStrategy::SameHostname)
        };
        let (options, skipped) = collecting(options);

        let requests = enqueue_links(
            &urls(&[
                "mailto:me@example.com",
                "https://other.com/x",
                "/logout",
                "https://example.com:8443/elsewhere",
                "/private/area",
                "/veto",
                "/ok",
            ]),
            "https://example.com/",
            &options,
        );

        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://example.com/ok");

        let reasons: Vec<SkipReason> = skipped.lock().unwrap().iter().map(|s| s.reason).collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::Invalid,
                SkipReason::Strategy,
                SkipReason::Exclude,
                SkipReason::Filters,
                SkipReason::RobotsTxt,
                SkipReason::Transform,
            ]
        );
    }

    #[test]
    fn test_unparsable_base_only_passes_unscoped_links() {
        let (options, skipped) = collecting(EnqueueLinksOptions::new(EnqueueStrategy::SameHostname));
        let links = urls(&["https://example.com/a", "https://other.com/b"]);

        assert!(enqueue_links(&links, "not a url", &options).is_empty());
        let skipped = skipped.lock().unwrap();
        assert_eq!(skipped.len(), 2);
        assert!(skipped.iter().all(|s| s.reason == SkipReason::Strategy));

        let requests = enqueue_links(&links, "not a url", &EnqueueLinksOptions::new(EnqueueStrategy::All));
        assert_eq!(requests.len(), 2);
    }

    #[test]
    fn test_pattern_metadata_is_attached() {
        let options = EnqueueLinksOptions {
            include: vec![
                UrlPattern::new("https://example.com/product/*")
                    .unwrap()
                    .with_label("DETAIL")
                    .with_user_data(json!({"kind": "product"})),
                UrlPattern::new("https://example.com/category/*").unwrap(),
            ],
            label: Some("LIST".to_string()),
            depth: 2,
            ..EnqueueLinksOptions::new(EnqueueStrategy::SameHostname)
        };

        let requests = enqueue_links(
            &urls(&["/product/1", "/category/shoes"]),
            "https://example.com/",
            &options,
        );

        assert_eq!(requests[0].label.as_deref(), Some("DETAIL"));
        assert_eq!(requests[0].user_data, json!({"kind": "product"}));
        assert_eq!(requests[1].label.as_deref(), Some("LIST"));
        assert_eq!(requests[1].user_data, Value::Null);
        assert!(requests.iter().all(|r| r.depth == 2));
    }

    #[test]
    fn test_strategy_deserializes_kebab_case() {
        let strategy: EnqueueStrategy = serde_json::from_str("\"same-origin\"").unwrap();
        assert_eq!(strategy, EnqueueStrategy::SameOrigin);
        assert_eq!(serde_json::to_string(&SkipReason::RobotsTxt).unwrap(), "\"robotsTxt\"");
    }
}
