//! Header analysis.
//!
//! Checks the request headers for:
//! - Missing or malformed browser headers
//! - Automation tool markers
//! - Suspicious referers
//! - Proxy and datacenter indicators

use super::{clamp_score, Analysis, HeadersData, Signal};
use crate::config::HeaderConfig;
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::LazyLock;
use url::Url;

/// Headers that real browsers always send on navigation.
const REQUIRED_HEADERS: [&str; 3] = ["accept", "accept-language", "accept-encoding"];

/// Headers that indicate automation tools.
static AUTOMATION_HEADERS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "x-selenium",
        "x-puppeteer",
        "x-playwright",
        "x-automation",
        "x-headless",
    ])
});

/// Headers only proxies add.
const PROXY_HEADERS: [&str; 5] =
    ["via", "forwarded", "proxy-connection", "x-proxy-id", "x-bluecoat-via"];

static LANGUAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\*|[a-zA-Z]{1,8}(-[a-zA-Z0-9]{1,8})*)(;q=[0-9.]+)?$").unwrap());

static ENCODING_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\*|[a-zA-Z0-9-]+)(;q=[0-9.]+)?$").unwrap());

const MISSING_HEADER_PENALTY: i32 = 15;
const MALFORMED_HEADER_PENALTY: i32 = 10;
const AUTOMATION_PENALTY: i32 = 30;
const REFERER_PENALTY: i32 = 25;
const PROXY_PENALTY: i32 = 20;
const DATACENTER_PENALTY: i32 = 15;

/// Result of header analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadersAnalysis {
    pub has_valid_headers: bool,
    pub suspicious_referer: bool,
    pub proxy_detected: bool,
    /// Client address falls in a configured datacenter range
    pub datacenter_ip: bool,
    pub score: u8,
    pub reasons: Vec<String>,
}

impl Analysis for HeadersAnalysis {
    const SIGNAL: Signal = Signal::Headers;

    fn score(&self) -> u8 {
        self.score
    }

    fn reasons(&self) -> &[String] {
        &self.reasons
    }
}

/// Header analyzer.
pub struct HeaderAnalyzer {
    trusted_referers: Vec<String>,
    blocked_referers: Vec<String>,
    datacenter_ranges: Vec<IpNet>,
    max_forwarded_hops: usize,
}

impl HeaderAnalyzer {
    /// Create a header analyzer from configuration. Invalid CIDR entries are
    /// logged and skipped.
    pub fn new(config: &HeaderConfig) -> Self {
        let datacenter_ranges = config
            .datacenter_ranges
            .iter()
            .filter_map(|cidr| match cidr.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    tracing::warn!(cidr = %cidr, error = %e, "Skipping invalid datacenter range");
                    None
                }
            })
            .collect();

        Self {
            trusted_referers: normalize_domains(&config.trusted_referer_domains),
            blocked_referers: normalize_domains(&config.blocked_referer_domains),
            datacenter_ranges,
            max_forwarded_hops: config.max_forwarded_hops,
        }
    }

    /// Analyze the headers of one request.
    pub fn analyze(&self, headers: &HeadersData) -> HeadersAnalysis {
        let mut reasons = Vec::new();
        let mut score = 100i32;

        let (missing, malformed) = header_problems(headers, &mut reasons);
        score -= missing as i32 * MISSING_HEADER_PENALTY;
        score -= malformed as i32 * MALFORMED_HEADER_PENALTY;

        let automation = automation_markers(headers, &mut reasons);
        if automation {
            score -= AUTOMATION_PENALTY;
        }
        let has_valid_headers = missing == 0 && malformed == 0 && !automation;

        let suspicious_referer = self.has_suspicious_referer(headers, &mut reasons);
        if suspicious_referer {
            score -= REFERER_PENALTY;
        }

        let proxy_detected = self.is_proxy_detected(headers, &mut reasons);
        if proxy_detected {
            score -= PROXY_PENALTY;
        }

        let datacenter_ip = self.is_datacenter_ip(headers);
        if datacenter_ip {
            score -= DATACENTER_PENALTY;
            reasons.push("datacenter_ip".to_string());
        }

        HeadersAnalysis {
            has_valid_headers,
            suspicious_referer,
            proxy_detected,
            datacenter_ip,
            score: clamp_score(score),
            reasons,
        }
    }

    /// Referer present but malformed, not http(s), an IP literal, or on a
    /// blocked domain.
    fn has_suspicious_referer(&self, headers: &HeadersData, reasons: &mut Vec<String>) -> bool {
        let Some(referer) = headers.header("referer") else {
            return false;
        };

        let url = match Url::parse(referer.trim()) {
            Ok(url) => url,
            Err(_) => {
                reasons.push("malformed_referer".to_string());
                return true;
            }
        };

        if url.scheme() != "http" && url.scheme() != "https" {
            reasons.push("non_http_referer".to_string());
            return true;
        }

        let host = match url.host() {
            Some(url::Host::Domain(d)) => d.to_lowercase(),
            Some(_) => {
                reasons.push("ip_literal_referer".to_string());
                return true;
            }
            None => {
                reasons.push("malformed_referer".to_string());
                return true;
            }
        };

        if domain_matches(&host, &self.trusted_referers) {
            return false;
        }
        if domain_matches(&host, &self.blocked_referers) {
            reasons.push("blocked_referer".to_string());
            return true;
        }
        false
    }

    /// Proxy-only headers, long or unparseable forwarding chains, or
    /// contradictory forwarding values.
    fn is_proxy_detected(&self, headers: &HeadersData, reasons: &mut Vec<String>) -> bool {
        let mut detected = false;

        for name in PROXY_HEADERS {
            if headers.contains(name) {
                reasons.push(format!("proxy_header_{}", name.replace('-', "_")));
                detected = true;
            }
        }

        let chain = forwarded_chain(headers);
        if !chain.is_empty() {
            if chain.len() > self.max_forwarded_hops {
                reasons.push("long_forwarded_chain".to_string());
                detected = true;
            }
            if chain.iter().any(|hop| hop.parse::<IpAddr>().is_err()) {
                reasons.push("malformed_forwarded_for".to_string());
                detected = true;
            }
            if let Some(real_ip) = headers.header("x-real-ip") {
                if chain.first().map(String::as_str) != Some(real_ip.trim()) {
                    reasons.push("forwarded_real_ip_mismatch".to_string());
                    detected = true;
                }
            }
        }

        let protos: HashSet<String> = headers
            .values("x-forwarded-proto")
            .iter()
            .flat_map(|v| v.split(','))
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        if protos.len() > 1 {
            reasons.push("conflicting_forwarded_proto".to_string());
            detected = true;
        }

        detected
    }

    fn is_datacenter_ip(&self, headers: &HeadersData) -> bool {
        if self.datacenter_ranges.is_empty() {
            return false;
        }
        client_ip(headers)
            .map(|ip| self.datacenter_ranges.iter().any(|net| net.contains(&ip)))
            .unwrap_or(false)
    }
}

impl Default for HeaderAnalyzer {
    fn default() -> Self {
        Self::new(&HeaderConfig::default())
    }
}

/// Count missing and malformed required headers.
fn header_problems(headers: &HeadersData, reasons: &mut Vec<String>) -> (usize, usize) {
    let mut missing = 0;
    let mut malformed = 0;

    for name in REQUIRED_HEADERS {
        match headers.header(name) {
            None => {
                missing += 1;
                reasons.push(format!("missing_{}", name.replace('-', "_")));
            }
            Some(value) if !is_well_formed(name, value) => {
                malformed += 1;
                reasons.push(format!("malformed_{}", name.replace('-', "_")));
            }
            Some(_) => {}
        }
    }

    // Chrome 89+ sends client hints, but only over HTTPS
    if let Some(version) = headers.user_agent().and_then(extract_chrome_version) {
        if version >= 89
            && is_secure_request(headers)
            && !headers.contains("sec-ch-ua")
            && !is_opera_or_samsung(headers)
        {
            malformed += 1;
            reasons.push("missing_sec_ch_ua_for_chrome".to_string());
        }
    }

    (missing, malformed)
}

fn is_well_formed(name: &str, value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    match name {
        "accept" => value.split(',').all(|part| part.trim().contains('/')),
        "accept-language" => value.split(',').all(|part| LANGUAGE_TAG.is_match(part.trim())),
        "accept-encoding" => value.split(',').all(|part| ENCODING_TOKEN.is_match(part.trim())),
        _ => true,
    }
}

fn automation_markers(headers: &HeadersData, reasons: &mut Vec<String>) -> bool {
    let mut found = false;
    for (name, _) in headers.iter() {
        if AUTOMATION_HEADERS.contains(name) {
            reasons.push(format!("automation_header_{}", name.replace('-', "_")));
            found = true;
        }
    }
    found
}

fn is_opera_or_samsung(headers: &HeadersData) -> bool {
    headers
        .user_agent()
        .map(|ua| ua.contains("OPR/") || ua.contains("SamsungBrowser/"))
        .unwrap_or(false)
}

/// Scheme as reported by the TLS-terminating proxy in front of us.
fn is_secure_request(headers: &HeadersData) -> bool {
    let forwarded_proto = headers
        .header("x-forwarded-proto")
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"));
    forwarded_proto
        || headers.values("forwarded").iter().any(|v| {
            v.split([';', ','])
                .any(|pair| pair.trim().eq_ignore_ascii_case("proto=https"))
        })
}

/// Extract Chrome version from User-Agent string.
fn extract_chrome_version(ua: &str) -> Option<u32> {
    let chrome_idx = ua.find("Chrome/")?;
    let rest = &ua[chrome_idx + 7..];
    let version_end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    rest[..version_end].parse().ok()
}

/// Entries of all X-Forwarded-For headers, in order.
fn forwarded_chain(headers: &HeadersData) -> Vec<String> {
    headers
        .values("x-forwarded-for")
        .iter()
        .flat_map(|v| v.split(','))
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .collect()
}

/// Best guess of the visitor address: first forwarded hop, X-Real-IP, then peer.
pub fn client_ip(headers: &HeadersData) -> Option<IpAddr> {
    forwarded_chain(headers)
        .first()
        .and_then(|hop| hop.parse().ok())
        .or_else(|| headers.header("x-real-ip").and_then(|ip| ip.trim().parse().ok()))
        .or(headers.peer_ip)
}

fn normalize_domains(domains: &[String]) -> Vec<String> {
    domains
        .iter()
        .map(|d| d.trim().trim_start_matches('.').to_lowercase())
        .filter(|d| !d.is_empty())
        .collect()
}

/// Exact match or subdomain match.
fn domain_matches(host: &str, domains: &[String]) -> bool {
    domains
        .iter()
        .any(|d| host == d || host.ends_with(&format!(".{}", d)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIREFOX: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0";

    fn browser_headers() -> HeadersData {
        [
            ("user-agent", FIREFOX),
            ("accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
            ("accept-language", "en-US,en;q=0.5"),
            ("accept-encoding", "gzip, deflate, br"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_browser_headers() {
        let analyzer = HeaderAnalyzer::default();
        let result = analyzer.analyze(&browser_headers());
        assert!(result.has_valid_headers, "reasons: {:?}", result.reasons);
        assert!(!result.proxy_detected);
        assert!(!result.suspicious_referer);
        assert_eq!(result.score, 100);
    }

    #[test]
    fn test_missing_headers() {
        let analyzer = HeaderAnalyzer::default();
        let headers: HeadersData = [("user-agent", "curl/8.4.0"), ("accept", "*/*")]
            .into_iter()
            .collect();
        let result = analyzer.analyze(&headers);
        assert!(!result.has_valid_headers);
        assert_eq!(result.score, 70);
        assert!(result.reasons.contains(&"missing_accept_language".to_string()));
    }

    #[test]
    fn test_malformed_headers() {
        let analyzer = HeaderAnalyzer::default();
        let headers: HeadersData = [
            ("user-agent", FIREFOX),
            ("accept", "html"),
            ("accept-language", "12345!!"),
            ("accept-encoding", "gzip"),
        ]
        .into_iter()
        .collect();
        let result = analyzer.analyze(&headers);
        assert!(!result.has_valid_headers);
        assert_eq!(result.score, 80);
        assert!(result.reasons.contains(&"malformed_accept".to_string()));
        assert!(result.reasons.contains(&"malformed_accept_language".to_string()));
    }

    #[test]
    fn test_automation_headers() {
        let analyzer = HeaderAnalyzer::default();
        let mut headers = browser_headers();
        headers.insert("X-Selenium", "true");
        let result = analyzer.analyze(&headers);
        assert!(!result.has_valid_headers);
        assert_eq!(result.score, 70);
        assert!(result.reasons.iter().any(|r| r.contains("automation")));
    }

    #[test]
    fn test_referer_checks() {
        let analyzer = HeaderAnalyzer::default();

        let mut headers = browser_headers();
        headers.insert("referer", "https://l.facebook.com/l.php?u=x");
        assert!(!analyzer.analyze(&headers).suspicious_referer);

        let mut headers = browser_headers();
        headers.insert("referer", "https://www.semalt.com/crawler");
        assert!(analyzer.analyze(&headers).suspicious_referer);

        let mut headers = browser_headers();
        headers.insert("referer", "not a url");
        assert!(analyzer.analyze(&headers).suspicious_referer);

        let mut headers = browser_headers();
        headers.insert("referer", "http://10.0.0.1/admin");
        assert!(analyzer.analyze(&headers).suspicious_referer);
    }

    #[test]
    fn test_proxy_lowers_but_does_not_block() {
        let analyzer = HeaderAnalyzer::default();
        let mut headers = browser_headers();
        headers.insert("via", "1.1 corporate-proxy");
        let result = analyzer.analyze(&headers);
        assert!(result.proxy_detected);
        assert_eq!(result.score, 80);
    }

    #[test]
    fn test_forwarded_contradictions() {
        let analyzer = HeaderAnalyzer::default();

        let mut headers = browser_headers();
        headers.insert("x-forwarded-for", "203.0.113.7");
        headers.insert("x-real-ip", "198.51.100.2");
        let result = analyzer.analyze(&headers);
        assert!(result.proxy_detected);
        assert!(result.reasons.contains(&"forwarded_real_ip_mismatch".to_string()));

        let mut headers = browser_headers();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1, 10.0.0.2");
        assert!(analyzer.analyze(&headers).proxy_detected);

        let mut headers = browser_headers();
        headers.insert("x-forwarded-for", "203.0.113.7");
        assert!(!analyzer.analyze(&headers).proxy_detected);
    }

    #[test]
    fn test_datacenter_range() {
        let config = HeaderConfig {
            datacenter_ranges: vec!["34.64.0.0/10".to_string(), "garbage".to_string()],
            ..Default::default()
        };
        let analyzer = HeaderAnalyzer::new(&config);

        let mut headers = browser_headers();
        headers.insert("x-forwarded-for", "34.80.1.1");
        let result = analyzer.analyze(&headers);
        assert!(result.datacenter_ip);
        assert_eq!(result.score, 85);

        let headers = browser_headers().with_peer_ip("34.100.0.1".parse().unwrap());
        assert!(analyzer.analyze(&headers).datacenter_ip);
    }

    const CHROME: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

    fn chrome_headers() -> HeadersData {
        [
            ("user-agent", CHROME),
            ("accept", "text/html"),
            ("accept-language", "en-US"),
            ("accept-encoding", "gzip"),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_chrome_client_hints() {
        let analyzer = HeaderAnalyzer::default();
        let missing = "missing_sec_ch_ua_for_chrome".to_string();

        let mut headers = chrome_headers();
        headers.insert("x-forwarded-proto", "https");
        assert!(analyzer.analyze(&headers).reasons.contains(&missing));

        let mut headers = chrome_headers();
        headers.insert("forwarded", "for=203.0.113.7;proto=https");
        assert!(analyzer.analyze(&headers).reasons.contains(&missing));

        let mut headers = chrome_headers();
        headers.insert("x-forwarded-proto", "https");
        headers.insert("sec-ch-ua", "\"Chromium\";v=\"120\"");
        assert!(!analyzer.analyze(&headers).reasons.contains(&missing));
    }

    #[test]
    fn test_plain_http_chrome_keeps_full_score() {
        let analyzer = HeaderAnalyzer::default();

        let result = analyzer.analyze(&chrome_headers());
        assert!(!result.reasons.iter().any(|r| r.contains("sec_ch_ua")));
        assert_eq!(result.score, 100);

        let mut headers = chrome_headers();
        headers.insert("x-forwarded-proto", "http");
        assert_eq!(analyzer.analyze(&headers).score, 100);
    }

    #[test]
    fn test_opera_and_samsung_exempt_from_client_hints() {
        let analyzer = HeaderAnalyzer::default();
        let opera = format!("{CHROME} OPR/105.0.0.0");
        let headers: HeadersData = [
            ("user-agent", opera.as_str()),
            ("accept", "text/html"),
            ("accept-language", "en-US"),
            ("accept-encoding", "gzip"),
            ("x-forwarded-proto", "https"),
        ]
        .into_iter()
        .collect();
        assert!(!analyzer.analyze(&headers).reasons.iter().any(|r| r.contains("sec_ch_ua")));
    }

    #[test]
    fn test_chrome_version_extraction() {
        assert_eq!(extract_chrome_version("Mozilla/5.0 Chrome/120.0.0.0"), Some(120));
        assert_eq!(extract_chrome_version("Mozilla/5.0 Firefox/120"), None);
    }
}
