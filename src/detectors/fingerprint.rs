//! Browser fingerprint analysis.
//!
//! Flags headless-browser defaults, internally contradictory (spoofed)
//! fingerprints and fingerprints replayed too often in a short window.

use super::{clamp_score, Analysis, Signal};
use crate::config::FingerprintConfig;
use crate::store::CounterStore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

/// WebGL renderers of software rasterizers used by headless browsers.
static HEADLESS_RENDERERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)swiftshader|llvmpipe|softpipe|mesa offscreen|virtualbox|vmware svga").unwrap());

/// Screen sizes headless browsers report by default.
const HEADLESS_SCREENS: [(u32, u32); 2] = [(800, 600), (0, 0)];

/// Accepted `getTimezoneOffset()` values (minutes, positive west of UTC) for
/// common zones, standard and daylight time.
const ZONE_OFFSETS: &[(&str, &[i32])] = &[
    ("UTC", &[0]),
    ("Etc/UTC", &[0]),
    ("GMT", &[0]),
    ("Europe/London", &[0, -60]),
    ("Europe/Lisbon", &[0, -60]),
    ("Europe/Paris", &[-60, -120]),
    ("Europe/Berlin", &[-60, -120]),
    ("Europe/Madrid", &[-60, -120]),
    ("Europe/Rome", &[-60, -120]),
    ("Europe/Amsterdam", &[-60, -120]),
    ("Europe/Athens", &[-120, -180]),
    ("Europe/Kyiv", &[-120, -180]),
    ("Europe/Helsinki", &[-120, -180]),
    ("Europe/Moscow", &[-180]),
    ("America/New_York", &[300, 240]),
    ("America/Toronto", &[300, 240]),
    ("America/Chicago", &[360, 300]),
    ("America/Mexico_City", &[360]),
    ("America/Denver", &[420, 360]),
    ("America/Phoenix", &[420]),
    ("America/Los_Angeles", &[480, 420]),
    ("America/Sao_Paulo", &[180]),
    ("America/Argentina/Buenos_Aires", &[180]),
    ("Asia/Dubai", &[-240]),
    ("Asia/Kolkata", &[-330]),
    ("Asia/Shanghai", &[-480]),
    ("Asia/Singapore", &[-480]),
    ("Asia/Tokyo", &[-540]),
    ("Australia/Sydney", &[-600, -660]),
    ("Africa/Lagos", &[-60]),
    ("Africa/Johannesburg", &[-120]),
];

const HEADLESS_SCORE: u8 = 5;
const SPOOF_PENALTY: i32 = 25;
const REPLAY_PENALTY: i32 = 40;

/// Screen information.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub color_depth: u8,
    pub pixel_ratio: f32,
}

/// Device/browser signals collected by the interstitial.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FingerprintInput {
    pub canvas_hash: String,
    pub webgl_renderer: Option<String>,
    pub webgl_vendor: Option<String>,
    pub audio_hash: Option<String>,
    pub screen: ScreenInfo,
    /// IANA zone from `Intl.DateTimeFormat().resolvedOptions().timeZone`
    pub timezone: Option<String>,
    /// `Date.getTimezoneOffset()` in minutes
    pub timezone_offset: Option<i32>,
    pub language: Option<String>,
    pub languages: Vec<String>,
    pub platform: Option<String>,
    /// `navigator.userAgent` as seen by scripts
    pub user_agent: Option<String>,
    pub plugins: Vec<String>,
    pub webdriver: bool,
    pub hardware_concurrency: Option<u32>,
}

/// Result of fingerprint analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintAnalysis {
    pub is_legitimate: bool,
    pub is_headless: bool,
    pub is_spoofed: bool,
    /// Seen more than the allowed number of times in the replay window
    pub is_replayed: bool,
    pub master_hash: String,
    /// Sightings of this hash in the current window, if the store answered
    pub sightings: Option<u64>,
    pub score: u8,
    pub reasons: Vec<String>,
}

impl Analysis for FingerprintAnalysis {
    const SIGNAL: Signal = Signal::Fingerprint;

    fn score(&self) -> u8 {
        self.score
    }

    fn reasons(&self) -> &[String] {
        &self.reasons
    }
}

/// Fingerprint analyzer with replay counting through an injected store.
pub struct FingerprintAnalyzer {
    spoofed_canvas: HashSet<String>,
    max_sightings: u64,
    store: Arc<dyn CounterStore>,
}

impl FingerprintAnalyzer {
    pub fn new(config: &FingerprintConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            spoofed_canvas: config
                .spoofed_canvas_hashes
                .iter()
                .map(|h| h.trim().to_lowercase())
                .collect(),
            max_sightings: config.max_sightings,
            store,
        }
    }

    /// Analyze a fingerprint and record a sighting of its master hash.
    ///
    /// A failing store only drops the replay check.
    pub async fn analyze(&self, input: &FingerprintInput) -> FingerprintAnalysis {
        let mut reasons = Vec::new();
        let master_hash = master_fingerprint_hash(input);

        let headless = headless_markers(input);
        let spoofed = spoof_markers(input, &self.spoofed_canvas);
        let is_headless = !headless.is_empty();
        let is_spoofed = !spoofed.is_empty();
        reasons.extend(headless.iter().map(|m| format!("headless_{}", m)));
        reasons.extend(spoofed.iter().map(|m| format!("spoofed_{}", m)));

        let sightings = match self.store.increment(&replay_key(&master_hash)).await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "Replay store unavailable, skipping replay check");
                reasons.push("replay_check_skipped".to_string());
                None
            }
        };
        let is_replayed = sightings.is_some_and(|c| c > self.max_sightings);
        if is_replayed {
            reasons.push("replayed_fingerprint".to_string());
        }

        let mut score = 100 - spoofed.len() as i32 * SPOOF_PENALTY;
        if is_replayed {
            score -= REPLAY_PENALTY;
        }
        let mut score = clamp_score(score);
        if is_headless {
            score = score.min(HEADLESS_SCORE);
        }

        FingerprintAnalysis {
            is_legitimate: !is_headless && !is_spoofed && !is_replayed,
            is_headless,
            is_spoofed,
            is_replayed,
            master_hash,
            sightings,
            score,
            reasons,
        }
    }

    /// Current sighting count for a master hash.
    pub async fn sightings(&self, master_hash: &str) -> Option<u64> {
        self.store.get(&replay_key(master_hash)).await.ok()
    }
}

fn replay_key(master_hash: &str) -> String {
    format!("fp:{}", master_hash)
}

fn headless_markers(input: &FingerprintInput) -> Vec<&'static str> {
    let mut markers = Vec::new();

    if input.webdriver {
        markers.push("webdriver");
    }
    if input
        .webgl_renderer
        .as_deref()
        .is_some_and(|r| HEADLESS_RENDERERS.is_match(r))
    {
        markers.push("software_renderer");
    }
    if input
        .user_agent
        .as_deref()
        .is_some_and(|ua| ua.contains("HeadlessChrome"))
    {
        markers.push("user_agent");
    }
    let screen = (input.screen.width, input.screen.height);
    if input.plugins.is_empty() && HEADLESS_SCREENS.contains(&screen) {
        markers.push("default_screen");
    }

    markers
}

/// True if the fingerprint matches known headless-browser defaults.
pub fn is_headless_fingerprint(input: &FingerprintInput) -> bool {
    !headless_markers(input).is_empty()
}

fn spoof_markers(input: &FingerprintInput, spoofed_canvas: &HashSet<String>) -> Vec<&'static str> {
    let mut markers = Vec::new();

    let canvas = input.canvas_hash.trim().to_lowercase();
    if canvas.is_empty() {
        markers.push("empty_canvas");
    } else if spoofed_canvas.contains(&canvas) {
        markers.push("known_canvas");
    }

    if let (Some(zone), Some(offset)) = (input.timezone.as_deref(), input.timezone_offset) {
        if let Some((_, offsets)) = ZONE_OFFSETS.iter().find(|(z, _)| *z == zone) {
            if !offsets.contains(&offset) {
                markers.push("timezone_offset");
            }
        }
    }

    if let (Some(language), Some(first)) = (input.language.as_deref(), input.languages.first()) {
        if primary_subtag(language) != primary_subtag(first) {
            markers.push("language_list");
        }
    }

    if let (Some(platform), Some(ua)) = (input.platform.as_deref(), input.user_agent.as_deref()) {
        if platform_conflicts(platform, ua) {
            markers.push("platform");
        }
    }

    if input.hardware_concurrency == Some(0) {
        markers.push("hardware_concurrency");
    }
    if input.screen.pixel_ratio < 0.0 || !input.screen.pixel_ratio.is_finite() {
        markers.push("pixel_ratio");
    }

    markers
}

/// True if the fingerprint contradicts itself or uses a known spoofed canvas.
pub fn is_spoofed_fingerprint(input: &FingerprintInput, config: &FingerprintConfig) -> bool {
    let spoofed: HashSet<String> = config
        .spoofed_canvas_hashes
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    !spoof_markers(input, &spoofed).is_empty()
}

fn primary_subtag(tag: &str) -> String {
    tag.split(['-', '_'])
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// `navigator.platform` against the OS named in the User-Agent.
fn platform_conflicts(platform: &str, ua: &str) -> bool {
    let platform = platform.to_lowercase();
    let claims_windows = ua.contains("Windows NT");
    let claims_mac = ua.contains("Macintosh");
    let claims_ios = ua.contains("iPhone") || ua.contains("iPad");
    let claims_android = ua.contains("Android");

    if platform.starts_with("win") {
        claims_mac || claims_ios || claims_android
    } else if platform.starts_with("mac") {
        claims_windows || claims_android
    } else if platform.starts_with("iphone") || platform.starts_with("ipad") {
        claims_windows || claims_android
    } else if platform.starts_with("linux") {
        // Android reports Linux platforms
        claims_windows || claims_mac || claims_ios
    } else {
        false
    }
}

/// Stable content hash over the normalized fingerprint.
pub fn master_fingerprint_hash(input: &FingerprintInput) -> String {
    fn norm(value: Option<&str>) -> String {
        value.map(|v| v.trim().to_lowercase()).unwrap_or_default()
    }

    let mut plugins: Vec<String> = input.plugins.iter().map(|p| p.trim().to_lowercase()).collect();
    plugins.sort();
    plugins.dedup();

    let fields = [
        input.canvas_hash.trim().to_lowercase(),
        norm(input.webgl_renderer.as_deref()),
        norm(input.webgl_vendor.as_deref()),
        norm(input.audio_hash.as_deref()),
        format!("{}x{}x{}", input.screen.width, input.screen.height, input.screen.color_depth),
        format!("{:.2}", input.screen.pixel_ratio),
        norm(input.timezone.as_deref()),
        input.timezone_offset.map(|o| o.to_string()).unwrap_or_default(),
        norm(input.language.as_deref()),
        norm(input.platform.as_deref()),
        input.hardware_concurrency.map(|c| c.to_string()).unwrap_or_default(),
        plugins.join(","),
    ];

    let mut hasher = Sha256::new();
    for field in &fields {
        hasher.update(field.as_bytes());
        hasher.update([0x1fu8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;
    use std::time::Duration;

    fn store() -> Arc<dyn CounterStore> {
        Arc::new(MemoryCounterStore::new("test", 1_000, Duration::from_secs(60)))
    }

    fn desktop() -> FingerprintInput {
        FingerprintInput {
            canvas_hash: "9f2c81d4e0a7b3c6".to_string(),
            webgl_renderer: Some("ANGLE (NVIDIA, NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0)".to_string()),
            webgl_vendor: Some("Google Inc. (NVIDIA)".to_string()),
            audio_hash: Some("124.04347527516074".to_string()),
            screen: ScreenInfo {
                width: 1920,
                height: 1080,
                color_depth: 24,
                pixel_ratio: 1.0,
            },
            timezone: Some("America/New_York".to_string()),
            timezone_offset: Some(300),
            language: Some("en-US".to_string()),
            languages: vec!["en-US".to_string(), "en".to_string()],
            platform: Some("Win32".to_string()),
            user_agent: Some("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()),
            plugins: vec!["PDF Viewer".to_string(), "Chrome PDF Viewer".to_string()],
            webdriver: false,
            hardware_concurrency: Some(8),
        }
    }

    #[tokio::test]
    async fn test_legitimate_fingerprint() {
        let analyzer = FingerprintAnalyzer::new(&FingerprintConfig::default(), store());
        let result = analyzer.analyze(&desktop()).await;
        assert!(result.is_legitimate, "reasons: {:?}", result.reasons);
        assert_eq!(result.score, 100);
        assert_eq!(result.sightings, Some(1));
        assert_eq!(result.master_hash.len(), 64);
    }

    #[tokio::test]
    async fn test_swiftshader_is_headless() {
        let analyzer = FingerprintAnalyzer::new(&FingerprintConfig::default(), store());
        let mut input = desktop();
        input.webgl_renderer = Some("Google SwiftShader".to_string());

        assert!(is_headless_fingerprint(&input));
        let result = analyzer.analyze(&input).await;
        assert!(result.is_headless);
        assert!(!result.is_legitimate);
        assert!(result.score <= HEADLESS_SCORE);
    }

    #[test]
    fn test_headless_defaults() {
        let mut input = desktop();
        input.webdriver = true;
        assert!(is_headless_fingerprint(&input));

        let mut input = desktop();
        input.plugins.clear();
        input.screen.width = 800;
        input.screen.height = 600;
        assert!(is_headless_fingerprint(&input));

        // Zero plugins alone is normal on mobile
        let mut input = desktop();
        input.plugins.clear();
        assert!(!is_headless_fingerprint(&input));
    }

    #[test]
    fn test_spoof_checks() {
        let config = FingerprintConfig::default();
        assert!(!is_spoofed_fingerprint(&desktop(), &config));

        let mut input = desktop();
        input.timezone_offset = Some(-60);
        assert!(is_spoofed_fingerprint(&input, &config));

        let mut input = desktop();
        input.canvas_hash = "0000000000000000".to_string();
        assert!(is_spoofed_fingerprint(&input, &config));

        let mut input = desktop();
        input.platform = Some("MacIntel".to_string());
        assert!(is_spoofed_fingerprint(&input, &config));

        let mut input = desktop();
        input.languages = vec!["de-DE".to_string()];
        assert!(is_spoofed_fingerprint(&input, &config));

        // Unknown zones are not judged
        let mut input = desktop();
        input.timezone = Some("Pacific/Chatham".to_string());
        input.timezone_offset = Some(-765);
        assert!(!is_spoofed_fingerprint(&input, &config));
    }

    #[tokio::test]
    async fn test_spoof_penalties_stack() {
        let analyzer = FingerprintAnalyzer::new(&FingerprintConfig::default(), store());
        let mut input = desktop();
        input.canvas_hash = String::new();
        input.timezone_offset = Some(0);
        let result = analyzer.analyze(&input).await;
        assert!(result.is_spoofed);
        assert!(!result.is_headless);
        assert_eq!(result.score, 50);
    }

    #[tokio::test]
    async fn test_replay_detection() {
        let config = FingerprintConfig {
            max_sightings: 3,
            ..Default::default()
        };
        let analyzer = FingerprintAnalyzer::new(&config, store());
        let input = desktop();

        for _ in 0..3 {
            assert!(analyzer.analyze(&input).await.is_legitimate);
        }
        let result = analyzer.analyze(&input).await;
        assert!(result.is_replayed);
        assert!(!result.is_legitimate);
        assert_eq!(result.score, 60);
        assert_eq!(analyzer.sightings(&result.master_hash).await, Some(4));
    }

    #[tokio::test]
    async fn test_replay_count_survives_full_store() {
        let config = FingerprintConfig {
            max_sightings: 2,
            ..Default::default()
        };
        let small: Arc<dyn CounterStore> =
            Arc::new(MemoryCounterStore::new("test", 4, Duration::from_secs(60)));
        let analyzer = FingerprintAnalyzer::new(&config, small);
        let input = desktop();

        assert_eq!(analyzer.analyze(&input).await.sightings, Some(1));
        for i in 0..50 {
            let mut other = desktop();
            other.canvas_hash = format!("{:016x}", i + 1);
            analyzer.analyze(&other).await;
        }

        let mut unseen = desktop();
        unseen.canvas_hash = "abcdefabcdefabcd".to_string();
        let skipped = analyzer.analyze(&unseen).await;
        assert_eq!(skipped.sightings, None);
        assert!(skipped.reasons.contains(&"replay_check_skipped".to_string()));

        analyzer.analyze(&input).await;
        let result = analyzer.analyze(&input).await;
        assert_eq!(result.sightings, Some(3));
        assert!(result.is_replayed);
    }

    #[test]
    fn test_master_hash_is_normalized() {
        let a = desktop();
        let mut b = desktop();
        b.canvas_hash = "  9F2C81D4E0A7B3C6 ".to_string();
        b.plugins.reverse();
        assert_eq!(master_fingerprint_hash(&a), master_fingerprint_hash(&b));

        let mut c = desktop();
        c.screen.width = 1366;
        assert_ne!(master_fingerprint_hash(&a), master_fingerprint_hash(&c));
    }
}
