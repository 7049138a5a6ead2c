//! Configuration types for the cloaker.

use crate::error::{CloakerError, Result};
use serde::{Deserialize, Serialize};

/// Main configuration for the cloaker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CloakerConfig {
    /// Score bands for decisions
    pub thresholds: ThresholdConfig,

    /// Signal weights for the blended score
    pub weights: SignalWeights,

    /// Redirect targets per decision
    pub targets: RedirectTargets,

    /// User-Agent analysis settings
    pub user_agent: UserAgentConfig,

    /// Header analysis settings
    pub headers: HeaderConfig,

    /// Behavior telemetry settings
    pub behavior: BehaviorConfig,

    /// Fingerprint analysis settings
    pub fingerprint: FingerprintConfig,

    /// Challenge interstitial settings
    pub challenge: ChallengeConfig,

    /// Network reputation settings
    pub network: NetworkConfig,

    /// Performance settings
    pub performance: PerformanceConfig,

    /// Include score/decision headers in responses
    pub debug_headers: bool,
}

impl CloakerConfig {
    /// Check that thresholds and weights describe a usable scoring setup.
    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        if t.block_max >= t.challenge_max || t.challenge_max >= 100 {
            return Err(CloakerError::Configuration(format!(
                "thresholds must satisfy block_max < challenge_max < 100 (got {} / {})",
                t.block_max, t.challenge_max
            )));
        }
        if t.quick_allow_min <= t.challenge_max || t.quick_allow_min > 100 {
            return Err(CloakerError::Configuration(format!(
                "quick_allow_min must lie in the allow band (got {})",
                t.quick_allow_min
            )));
        }

        let w = &self.weights;
        let all = [w.user_agent, w.headers, w.behavior, w.fingerprint, w.network];
        if all.iter().any(|x| !x.is_finite() || *x < 0.0) {
            return Err(CloakerError::Configuration(
                "signal weights must be finite and non-negative".to_string(),
            ));
        }
        if all.iter().all(|x| *x == 0.0) {
            return Err(CloakerError::Configuration(
                "at least one signal weight must be positive".to_string(),
            ));
        }

        if self.challenge.nonce_store_capacity == 0 || self.fingerprint.store_capacity == 0 {
            return Err(CloakerError::Configuration(
                "store capacities must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Score bands. Scores are 0 (bot) to 100 (human).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Highest score that still blocks
    pub block_max: u8,

    /// Highest score that still challenges
    pub challenge_max: u8,

    /// Quick (UA + headers) score at or above which to allow without a challenge
    pub quick_allow_min: u8,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            block_max: 30,
            challenge_max: 60,
            quick_allow_min: 85,
        }
    }
}

/// Weights for each signal in the blended score.
///
/// Only the weights of signals actually present are summed, so these need not
/// add up to 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub user_agent: f32,
    pub headers: f32,
    pub behavior: f32,
    pub fingerprint: f32,
    pub network: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            user_agent: 0.30,
            headers: 0.20,
            behavior: 0.25,
            fingerprint: 0.25,
            network: 0.20,
        }
    }
}

/// Redirect destination per decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectTargets {
    /// Safe/decoy page for blocked visitors
    pub block_url: Option<String>,

    /// Destination when the score after the challenge is still inconclusive
    pub challenge_url: Option<String>,

    /// Real landing page
    pub allow_url: Option<String>,

    /// Used when the target for a decision is missing
    pub safe_default_url: String,
}

impl Default for RedirectTargets {
    fn default() -> Self {
        Self {
            block_url: None,
            challenge_url: None,
            allow_url: None,
            safe_default_url: "/".to_string(),
        }
    }
}

/// User-Agent analysis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentConfig {
    /// Regexes for crawlers the built-in signatures miss (review bots,
    /// in-house monitors). Invalid patterns are skipped with a warning.
    pub extra_crawler_patterns: Vec<String>,
}

/// Header analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// Referer domains that are always fine (ad networks, own site)
    pub trusted_referer_domains: Vec<String>,

    /// Referer domains that mark the request as suspicious
    pub blocked_referer_domains: Vec<String>,

    /// Datacenter / hosting ranges (CIDR notation)
    pub datacenter_ranges: Vec<String>,

    /// X-Forwarded-For hops above which the chain counts as a proxy
    pub max_forwarded_hops: usize,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            trusted_referer_domains: vec![
                "facebook.com".to_string(),
                "instagram.com".to_string(),
                "google.com".to_string(),
            ],
            blocked_referer_domains: vec![
                "semalt.com".to_string(),
                "buttons-for-website.com".to_string(),
                "adsreview.example".to_string(),
            ],
            datacenter_ranges: vec![],
            max_forwarded_hops: 2,
        }
    }
}

/// Behavior telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Client capture window in milliseconds
    pub capture_window_ms: u64,

    /// Dwell time with zero movement that counts as scripted
    pub robotic_dwell_ms: u64,

    /// Samples needed for a full-confidence analysis
    pub min_samples: usize,

    /// Coefficient of variation of sample intervals below which timing is robotic
    pub timing_cv_threshold: f64,

    /// Maximum samples kept by a tracker
    pub max_samples: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            capture_window_ms: 5_000,
            robotic_dwell_ms: 2_000,
            min_samples: 10,
            timing_cv_threshold: 0.1,
            max_samples: 2_000,
        }
    }
}

/// Fingerprint analysis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Canvas hashes produced by known anti-fingerprinting spoofers
    pub spoofed_canvas_hashes: Vec<String>,

    /// Window for replay counting in seconds
    pub replay_window_seconds: u64,

    /// Sightings of one master hash inside the window before it counts as a farm
    pub max_sightings: u64,

    /// Distinct hashes tracked at once. New hashes beyond this skip the
    /// replay check until older ones expire.
    pub store_capacity: u64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            spoofed_canvas_hashes: vec![
                "0000000000000000".to_string(),
                "ffffffffffffffff".to_string(),
            ],
            replay_window_seconds: 600,
            max_sightings: 20,
            store_capacity: 100_000,
        }
    }
}

/// Challenge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChallengeConfig {
    /// Secret for HMAC token signing
    pub token_secret: String,

    /// Token validity in seconds
    pub token_validity_seconds: u64,

    /// Cookie carrying the challenge token
    pub cookie_name: String,

    /// Path the interstitial posts telemetry to
    pub submit_path: String,

    /// Spent token nonces remembered at once. Submissions beyond this are
    /// scored without their token until older nonces expire.
    pub nonce_store_capacity: u64,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            token_secret: "change-me-in-production".to_string(),
            token_validity_seconds: 120,
            cookie_name: "_cloaker_ct".to_string(),
            submit_path: "/_cloaker/verify".to_string(),
            nonce_store_capacity: 100_000,
        }
    }
}

/// Static network reputation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Look up a reputation score after the challenge
    pub enabled: bool,

    /// CIDR ranges with a known bad reputation
    pub suspicious_ranges: Vec<String>,

    /// Score for addresses in a suspicious range
    pub suspicious_score: u8,

    /// Score for every other address (unset = no opinion)
    pub clean_score: Option<u8>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suspicious_ranges: Vec::new(),
            suspicious_score: 10,
            clean_score: None,
        }
    }
}

/// Performance configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Maximum time for a single analyzer in milliseconds
    pub analyzer_timeout_ms: u64,

    /// Maximum time to wait for the network reputation lookup
    pub network_timeout_ms: u64,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            analyzer_timeout_ms: 50,
            network_timeout_ms: 150,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CloakerConfig::default();
        assert_eq!(config.thresholds.block_max, 30);
        assert_eq!(config.thresholds.challenge_max, 60);
        assert!(config.validate().is_ok());
        assert!(config.targets.allow_url.is_none());
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
thresholds:
  block_max: 25
targets:
  allow_url: "https://shop.example/offer"
  block_url: "https://shop.example/blog"
user_agent:
  extra_crawler_patterns: ["(?i)acme-reviewer"]
debug_headers: true
"#;
        let config: CloakerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.thresholds.block_max, 25);
        assert_eq!(config.thresholds.challenge_max, 60);
        assert_eq!(config.targets.allow_url.as_deref(), Some("https://shop.example/offer"));
        assert_eq!(config.user_agent.extra_crawler_patterns, vec!["(?i)acme-reviewer"]);
        assert!(config.debug_headers);
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = CloakerConfig::default();
        config.thresholds.block_max = 70;
        assert!(matches!(config.validate(), Err(CloakerError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_zero_weights() {
        let mut config = CloakerConfig::default();
        config.weights = SignalWeights {
            user_agent: 0.0,
            headers: 0.0,
            behavior: 0.0,
            fingerprint: 0.0,
            network: 0.0,
        };
        assert!(config.validate().is_err());

        config.weights.headers = -1.0;
        assert!(config.validate().is_err());
    }
}
