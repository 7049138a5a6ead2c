//! User-Agent analysis.
//!
//! Classifies the raw User-Agent string:
//! - Known crawlers, automation tools and headless defaults
//! - Empty or generic strings
//! - Platform tokens that cannot appear together

use super::{clamp_score, Analysis, Signal};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Crawler, automation and headless signatures.
static CRAWLER_SIGNATURES: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        // Search engines
        (Regex::new(r"(?i)googlebot|google-inspectiontool|adsbot-google|mediapartners-google").unwrap(), "googlebot"),
        (Regex::new(r"(?i)bingbot|msnbot|adidxbot").unwrap(), "bingbot"),
        (Regex::new(r"(?i)yandex(bot|images)").unwrap(), "yandexbot"),
        (Regex::new(r"(?i)baiduspider").unwrap(), "baiduspider"),
        (Regex::new(r"(?i)duckduckbot").unwrap(), "duckduckbot"),
        // Ad and social review crawlers
        (Regex::new(r"(?i)facebookexternalhit|facebookcatalog|meta-externalagent").unwrap(), "facebook_crawler"),
        (Regex::new(r"(?i)twitterbot|linkedinbot|slackbot|telegrambot|whatsapp").unwrap(), "social_crawler"),
        // SEO tools
        (Regex::new(r"(?i)ahrefsbot|semrushbot|mj12bot|dotbot|petalbot").unwrap(), "seo_crawler"),
        // Monitoring
        (Regex::new(r"(?i)uptimerobot|pingdom|statuscake|site24x7").unwrap(), "monitoring"),
        // Command-line tools and libraries
        (Regex::new(r"(?i)^(curl|wget|httpie)/").unwrap(), "cli_tool"),
        (Regex::new(r"(?i)python-requests|python-urllib|aiohttp|go-http-client|okhttp|node-fetch|axios/|java/|libwww-perl|scrapy").unwrap(), "http_library"),
        // Headless defaults
        (Regex::new(r"HeadlessChrome").unwrap(), "headless_chrome"),
        (Regex::new(r"(?i)phantomjs|selenium|puppeteer|playwright|electron/").unwrap(), "automation_framework"),
        // Generic markers
        (Regex::new(r"(?i)\b(bot|crawler|spider|scraper)\b|bot/|spider/").unwrap(), "generic_bot"),
    ]
});

/// Strings that carry no real client information.
static GENERIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        // Bare product token, e.g. "Mozilla/5.0"
        Regex::new(r"^(?i)mozilla/\d(\.\d+)?$").unwrap(),
        // Placeholder values
        Regex::new(r"^(?i)(-|null|undefined|unknown|test|user-agent|agent|browser)$").unwrap(),
    ]
});

/// Pairs of platform tokens that cannot appear in one real User-Agent.
static IMPOSSIBLE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (Regex::new(r"(?i)android.*windows nt|windows nt.*android").unwrap(), "android_windows"),
        (Regex::new(r"(?i)iphone.*android|android.*iphone").unwrap(), "iphone_android"),
        (Regex::new(r"(?i)iphone.*windows nt|windows nt.*iphone").unwrap(), "iphone_windows"),
        (Regex::new(r"(?i)macintosh.*windows nt|windows nt.*macintosh").unwrap(), "mac_windows"),
        (Regex::new(r"(?i)x11; linux.*windows nt|windows nt.*x11; linux").unwrap(), "linux_windows"),
        (Regex::new(r"(?i)(iphone|ipad).*macintosh; intel").unwrap(), "ios_macos"),
        (Regex::new(r"Trident.*Chrome/|Chrome/.*Trident").unwrap(), "trident_chrome"),
        (Regex::new(r"Firefox/.*Chrome/.*Safari/.*Edg").unwrap(), "too_many_engines"),
    ]
});

const CRAWLER_SCORE: u8 = 5;
const EMPTY_SCORE: u8 = 15;
const GENERIC_PENALTY: i32 = 40;
const INCONSISTENCY_PENALTY: i32 = 45;

/// Result of User-Agent analysis. Derived purely from the string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgentAnalysis {
    pub ua_string: String,
    pub is_crawler: bool,
    /// Name of the matched crawler signature
    pub crawler_name: Option<String>,
    pub is_empty_or_generic: bool,
    pub has_inconsistencies: bool,
    pub score: u8,
    pub reasons: Vec<String>,
}

impl Analysis for UserAgentAnalysis {
    const SIGNAL: Signal = Signal::UserAgent;

    fn score(&self) -> u8 {
        self.score
    }

    fn reasons(&self) -> &[String] {
        &self.reasons
    }
}

/// User-Agent analyzer.
#[derive(Debug, Default)]
pub struct UserAgentAnalyzer {
    /// Extra crawler patterns added by the deployment
    extra_crawlers: Vec<Regex>,
}

impl UserAgentAnalyzer {
    /// Create a new User-Agent analyzer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add deployment-specific crawler patterns. Invalid patterns are skipped.
    pub fn with_extra_crawlers<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            match Regex::new(pattern.as_ref()) {
                Ok(re) => self.extra_crawlers.push(re),
                Err(e) => tracing::warn!(
                    pattern = pattern.as_ref(),
                    error = %e,
                    "Skipping invalid crawler pattern"
                ),
            }
        }
        self
    }

    /// Analyze a User-Agent string. Never fails: absent or unparseable input
    /// scores low.
    pub fn analyze(&self, ua: &str) -> UserAgentAnalysis {
        let mut reasons = Vec::new();

        let crawler_name = crawler_signature(ua).map(str::to_string).or_else(|| {
            self.extra_crawlers
                .iter()
                .any(|re| re.is_match(ua))
                .then(|| "custom_crawler".to_string())
        });
        if let Some(ref name) = crawler_name {
            reasons.push(format!("crawler_{}", name));
        }

        let is_empty_or_generic = is_empty_or_generic_ua(ua);
        if ua.trim().is_empty() {
            reasons.push("empty_user_agent".to_string());
        } else if is_empty_or_generic {
            reasons.push("generic_user_agent".to_string());
        }

        let conflicts = inconsistencies(ua);
        let has_inconsistencies = !conflicts.is_empty();
        reasons.extend(conflicts.into_iter().map(|c| format!("inconsistent_{}", c)));

        let is_crawler = crawler_name.is_some();
        let mut score = ua_score(is_crawler, is_empty_or_generic, has_inconsistencies);
        if ua.trim().is_empty() {
            score = score.min(EMPTY_SCORE);
        }

        UserAgentAnalysis {
            ua_string: ua.to_string(),
            is_crawler,
            crawler_name,
            is_empty_or_generic,
            has_inconsistencies,
            score,
            reasons,
        }
    }
}

/// Analyze a User-Agent with the built-in signature lists.
pub fn analyze_user_agent(ua: &str) -> UserAgentAnalysis {
    UserAgentAnalyzer::new().analyze(ua)
}

fn crawler_signature(ua: &str) -> Option<&'static str> {
    CRAWLER_SIGNATURES
        .iter()
        .find(|(re, _)| re.is_match(ua))
        .map(|(_, name)| *name)
}

/// True if the UA matches a known crawler, automation or headless signature.
pub fn is_crawler_ua(ua: &str) -> bool {
    crawler_signature(ua).is_some()
}

/// True if the UA is empty or too generic to describe a real browser.
pub fn is_empty_or_generic_ua(ua: &str) -> bool {
    let ua = ua.trim();
    if ua.is_empty() {
        return true;
    }
    if GENERIC_PATTERNS.iter().any(|re| re.is_match(ua)) {
        return true;
    }
    // Real browsers always carry a platform comment and several tokens
    let looks_like_browser = ua.starts_with("Mozilla/") || ua.starts_with("Opera/");
    looks_like_browser && (!ua.contains('(') || ua.split_whitespace().count() < 3)
}

fn inconsistencies(ua: &str) -> Vec<&'static str> {
    IMPOSSIBLE_PATTERNS
        .iter()
        .filter(|(re, _)| re.is_match(ua))
        .map(|(_, name)| *name)
        .collect()
}

/// True if declared platform tokens conflict.
pub fn has_ua_inconsistencies(ua: &str) -> bool {
    !inconsistencies(ua).is_empty()
}

/// Combine the three User-Agent flags into a score.
///
/// A crawler match dominates; genericness and inconsistency each subtract a
/// fixed penalty from 100.
pub fn ua_score(is_crawler: bool, is_empty_or_generic: bool, has_inconsistencies: bool) -> u8 {
    if is_crawler {
        return CRAWLER_SCORE;
    }
    let mut score = 100;
    if is_empty_or_generic {
        score -= GENERIC_PENALTY;
    }
    if has_inconsistencies {
        score -= INCONSISTENCY_PENALTY;
    }
    clamp_score(score)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHROME_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1";

    #[test]
    fn test_normal_browser() {
        let result = analyze_user_agent(CHROME_MAC);
        assert!(!result.is_crawler);
        assert!(!result.is_empty_or_generic);
        assert!(!result.has_inconsistencies);
        assert_eq!(result.score, 100);

        let result = analyze_user_agent(SAFARI_IPHONE);
        assert_eq!(result.score, 100, "reasons: {:?}", result.reasons);
    }

    #[test]
    fn test_googlebot() {
        let result = analyze_user_agent(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)",
        );
        assert!(result.is_crawler);
        assert_eq!(result.crawler_name.as_deref(), Some("googlebot"));
        assert!(result.score <= 10);

        assert!(is_crawler_ua("Googlebot/2.1"));
    }

    #[test]
    fn test_cli_and_headless() {
        assert!(is_crawler_ua("curl/8.4.0"));
        assert!(is_crawler_ua("python-requests/2.31.0"));
        assert!(is_crawler_ua(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) HeadlessChrome/120.0.0.0 Safari/537.36"
        ));
        assert!(is_crawler_ua("facebookexternalhit/1.1"));
    }

    #[test]
    fn test_empty_and_generic() {
        let empty = analyze_user_agent("");
        assert!(empty.is_empty_or_generic);
        assert!(empty.score <= 30, "empty UA fails closed");

        assert!(is_empty_or_generic_ua("   "));
        assert!(is_empty_or_generic_ua("Mozilla/5.0"));
        assert!(is_empty_or_generic_ua("undefined"));
        assert!(!is_empty_or_generic_ua(CHROME_MAC));

        let generic = analyze_user_agent("Mozilla/5.0");
        assert_eq!(generic.score, 60);
    }

    #[test]
    fn test_inconsistent_platforms() {
        let ua = "Mozilla/5.0 (iPhone; Windows NT 10.0) AppleWebKit/537.36 Chrome/120.0 Safari/537.36";
        assert!(has_ua_inconsistencies(ua));
        let result = analyze_user_agent(ua);
        assert_eq!(result.score, 55);
        assert!(result.reasons.iter().any(|r| r == "inconsistent_iphone_windows"));
    }

    #[test]
    fn test_score_combination() {
        assert_eq!(ua_score(false, false, false), 100);
        assert_eq!(ua_score(false, true, false), 60);
        assert_eq!(ua_score(false, false, true), 55);
        assert_eq!(ua_score(false, true, true), 15);
        assert_eq!(ua_score(true, false, false), 5);
    }

    #[test]
    fn test_extra_crawlers() {
        let analyzer =
            UserAgentAnalyzer::new().with_extra_crawlers(["(?i)acme-reviewer", "(invalid"]);
        let result = analyzer.analyze(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) Acme-Reviewer/1.0 Chrome/120.0 Safari/537.36",
        );
        assert!(result.is_crawler);
        assert_eq!(result.crawler_name.as_deref(), Some("custom_crawler"));
    }

    #[test]
    fn test_idempotent() {
        assert_eq!(analyze_user_agent(CHROME_MAC), analyze_user_agent(CHROME_MAC));
        assert_eq!(analyze_user_agent("wget/1.21"), analyze_user_agent("wget/1.21"));
    }
}
