use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// One user-agent group of a robots.txt file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RobotsRule {
    pub user_agent: String,
    pub allow: Vec<String>,
    pub disallow: Vec<String>,
    /// Seconds between requests
    pub crawl_delay: Option<f64>,
}

/// Parsed robots.txt ruleset, supplied by the host
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RobotsTxt {
    pub rules: Vec<RobotsRule>,
    pub sitemaps: Vec<String>,
}

impl RobotsTxt {
    pub fn new(rules: Vec<RobotsRule>, sitemaps: Vec<String>) -> Self {
        Self { rules, sitemaps }
    }

    /// Whether `user_agent` may fetch `url`.
    ///
    /// The most specific matching group wins; inside it, the longest matching
    /// pattern decides, with `allow` winning ties.
    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        let Ok(parsed) = Url::parse(url) else {
            return false;
        };
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };

        let mut target = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            target.push('?');
            target.push_str(query);
        }

        let longest = |patterns: &[String]| {
            patterns
                .iter()
                .filter(|pattern| !pattern.is_empty() && pattern_matches(pattern, &target))
                .map(|pattern| pattern.len())
                .max()
        };

        match (longest(&group.allow), longest(&group.disallow)) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(allow), Some(disallow)) => allow >= disallow,
        }
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<Duration> {
        self.group_for(user_agent)
            .and_then(|group| group.crawl_delay)
            .filter(|delay| delay.is_finite() && *delay >= 0.0)
            .map(Duration::from_secs_f64)
    }

    fn group_for(&self, user_agent: &str) -> Option<&RobotsRule> {
        let agent = user_agent.to_lowercase();

        let specific = self
            .rules
            .iter()
            .filter(|rule| {
                let name = rule.user_agent.trim().to_lowercase();
                name != "*" && !name.is_empty() && agent.contains(&name)
            })
            .max_by_key(|rule| rule.user_agent.trim().len());

        specific.or_else(|| self.rules.iter().find(|rule| rule.user_agent.trim() == "*"))
    }
}

/// Match a robots.txt path pattern supporting `*` and a trailing `$`
fn pattern_matches(pattern: &str, target: &str) -> bool {
    let (body, anchored) = match pattern.strip_suffix('$') {
        Some(body) => (body, true),
        None => (pattern, false),
    };

    let mut expression = String::from("^");
    for (i, part) in body.split('*').enumerate() {
        if i > 0 {
            expression.push_str(".*");
        }
        expression.push_str(&regex::escape(part));
    }
    if anchored {
        expression.push('$');
    }

    Regex::new(&expression)
        .map(|re| re.is_match(target))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(user_agent: &str, allow: &[&str], disallow: &[&str]) -> RobotsRule {
        RobotsRule {
            user_agent: user_agent.to_string(),
            allow: allow.iter().map(|s| s.to_string()).collect(),
            disallow: disallow.iter().map(|s| s.to_string()).collect(),
            crawl_delay: None,
        }
    }

    #[test]
    fn test_longest_match_wins() {
        let robots = RobotsTxt::new(vec![rule("*", &["/private/public"], &["/private"])], vec![]);

        assert!(robots.is_allowed("https://example.com/", "bot"));
        assert!(!robots.is_allowed("https://example.com/private/data", "bot"));
        assert!(robots.is_allowed("https://example.com/private/public/page", "bot"));
    }

    #[test]
    fn test_wildcards() {
        let robots = RobotsTxt::new(vec![rule("*", &[], &["/*.pdf$", "/search*q="])], vec![]);

        assert!(!robots.is_allowed("https://example.com/docs/file.pdf", "bot"));
        assert!(robots.is_allowed("https://example.com/docs/file.pdf.html", "bot"));
        assert!(!robots.is_allowed("https://example.com/search?q=rust", "bot"));
        assert!(robots.is_allowed("https://example.com/search", "bot"));
    }

    #[test]
    fn test_specific_group_overrides_wildcard() {
        let robots = RobotsTxt::new(
            vec![rule("*", &[], &["/"]), rule("GoodBot", &[], &["/admin"])],
            vec![],
        );

        assert!(!robots.is_allowed("https://example.com/page", "OtherBot/1.0"));
        assert!(robots.is_allowed("https://example.com/page", "Mozilla/5.0 (compatible; GoodBot/2.1)"));
        assert!(!robots.is_allowed("https://example.com/admin", "GoodBot"));
    }

    #[test]
    fn test_empty_disallow_allows_everything() {
        let robots = RobotsTxt::new(vec![rule("*", &[], &[""])], vec![]);
        assert!(robots.is_allowed("https://example.com/anything", "bot"));
        assert!(RobotsTxt::default().is_allowed("https://example.com/", "bot"));
    }

    #[test]
    fn test_deserializes_collaborator_format() {
        let robots: RobotsTxt = serde_json::from_str(
            r#"{"rules":[{"userAgent":"*","disallow":["/tmp"],"crawlDelay":1.5}],
                "sitemaps":["https://example.com/sitemap.xml"]}"#,
        )
        .unwrap();

        assert_eq!(robots.crawl_delay("bot"), Some(Duration::from_millis(1500)));
        assert!(!robots.is_allowed("https://example.com/tmp/x", "bot"));
        assert_eq!(robots.sitemaps.len(), 1);
    }
}
