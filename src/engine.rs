//! Request orchestration.
//!
//! [`Cloaker`] owns the analyzers and runs the two request paths: the quick
//! pass on the visitor's first request and the full pass when the interstitial
//! posts its telemetry back.

use crate::challenge::ChallengeManager;
use crate::config::CloakerConfig;
use crate::detectors::headers::client_ip;
use crate::detectors::{
    BehaviorAnalyzer, FingerprintAnalysis, FingerprintAnalyzer, FingerprintInput, HeaderAnalyzer,
    HeadersData, Signal, UserAgentAnalyzer,
};
use crate::error::{CloakerError, Result};
use crate::flow::{ChallengeServed, Decided, Unscored};
use crate::network::{NetworkReputation, NoReputation, StaticReputation};
use crate::payload::ChallengeSubmission;
use crate::score::{ScoreCalculator, ScoringInput, ScoringResult};
use crate::store::{CounterStore, MemoryCounterStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of the quick pass.
#[derive(Debug, Clone)]
pub enum QuickOutcome {
    /// Conclusive: redirect now.
    Decided(Decided),
    /// Inconclusive: serve the interstitial.
    Challenge {
        result: ScoringResult,
        token: String,
        page: String,
    },
}

/// The cloaker: analyzers, scoring and challenge handling.
pub struct Cloaker {
    config: CloakerConfig,
    user_agent_analyzer: UserAgentAnalyzer,
    header_analyzer: HeaderAnalyzer,
    behavior_analyzer: BehaviorAnalyzer,
    fingerprint_analyzer: FingerprintAnalyzer,
    score_calculator: ScoreCalculator,
    challenge_manager: ChallengeManager,
    reputation: Arc<dyn NetworkReputation>,
    /// Spent token nonces
    used_tokens: Arc<dyn CounterStore>,
}

impl Cloaker {
    /// Create a cloaker with in-memory stores.
    pub fn new(config: CloakerConfig) -> Result<Self> {
        let fingerprints = Arc::new(MemoryCounterStore::new(
            "fingerprints",
            config.fingerprint.store_capacity,
            Duration::from_secs(config.fingerprint.replay_window_seconds.max(1)),
        ));
        let reputation: Arc<dyn NetworkReputation> = if config.network.enabled {
            Arc::new(StaticReputation::new(&config.network))
        } else {
            Arc::new(NoReputation)
        };
        Self::with_components(config, fingerprints, reputation)
    }

    /// Create a cloaker with an injected replay store and reputation source.
    pub fn with_components(
        config: CloakerConfig,
        fingerprint_store: Arc<dyn CounterStore>,
        reputation: Arc<dyn NetworkReputation>,
    ) -> Result<Self> {
        config.validate()?;

        let used_tokens = Arc::new(MemoryCounterStore::new(
            "challenge_tokens",
            config.challenge.nonce_store_capacity,
            Duration::from_secs(config.challenge.token_validity_seconds.max(1)),
        ));

        Ok(Self {
            user_agent_analyzer: UserAgentAnalyzer::new()
                .with_extra_crawlers(&config.user_agent.extra_crawler_patterns),
            header_analyzer: HeaderAnalyzer::new(&config.headers),
            behavior_analyzer: BehaviorAnalyzer::new(&config.behavior),
            fingerprint_analyzer: FingerprintAnalyzer::new(&config.fingerprint, fingerprint_store),
            score_calculator: ScoreCalculator::from_config(&config),
            challenge_manager: ChallengeManager::new(&config.challenge),
            reputation,
            used_tokens,
            config,
        })
    }

    pub fn config(&self) -> &CloakerConfig {
        &self.config
    }

    pub fn challenge_manager(&self) -> &ChallengeManager {
        &self.challenge_manager
    }

    /// Quick pass over User-Agent and headers.
    pub fn evaluate_request(&self, headers: &HeadersData, path: &str) -> Result<QuickOutcome> {
        let input = self.quick_input(headers);
        let result = self
            .score_calculator
            .quick_decision(input.user_agent.as_ref(), input.headers.as_ref());

        let scored = Unscored::new().quick_scored(result)?;
        if !scored.needs_challenge() {
            let decided = scored.decide(&self.config.targets)?;
            self.log_decision(headers, path, &decided);
            return Ok(QuickOutcome::Decided(decided));
        }

        let result = scored.result().clone();
        let served = scored.serve_challenge()?;
        let token = self
            .challenge_manager
            .generate_token(served.quick_score().unwrap_or(result.final_score));
        let page = self
            .challenge_manager
            .render_interstitial(&token, self.config.behavior.capture_window_ms);

        debug!(
            path = %path,
            quick_score = result.final_score,
            "Serving challenge interstitial"
        );

        Ok(QuickOutcome::Challenge {
            result,
            token,
            page,
        })
    }

    /// Full pass over the telemetry posted by the interstitial.
    pub async fn evaluate_submission(
        &self,
        headers: &HeadersData,
        path: &str,
        body: &[u8],
    ) -> Result<Decided> {
        let submission = match ChallengeSubmission::parse(body, &self.config.behavior) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "Discarding challenge submission");
                ChallengeSubmission::default()
            }
        };
        for issue in &submission.issues {
            warn!(error = %issue, "Dropping part of challenge submission");
        }
        if submission.dropped_samples > 0 {
            debug!(dropped = submission.dropped_samples, "Rejected mouse samples");
        }

        let quick_score = self.redeem_token(headers, submission.token.as_deref()).await;
        let served = ChallengeServed::resume(quick_score);

        let mut input = match served.quick_score() {
            Some(score) => ScoringInput {
                quick_score: Some(score),
                ..Default::default()
            },
            // Token missing or bad: analyze this request instead
            None => self.quick_input(headers),
        };

        input.behavior = submission.behavior.as_ref().map(|data| {
            let analysis = self.behavior_analyzer.analyze(data);
            debug!(
                detector = "behavior",
                score = analysis.score,
                confidence = analysis.confidence,
                "Behavior analysis complete"
            );
            analysis
        });
        if input.behavior.is_none() {
            self.signal_unavailable(Signal::Behavior);
        }

        input.fingerprint = match submission.fingerprint.as_ref() {
            Some(fp) => self.analyze_fingerprint(fp).await,
            None => None,
        };
        if input.fingerprint.is_none() {
            self.signal_unavailable(Signal::Fingerprint);
        }

        let mut result = self.score_calculator.calculate_progressive_score(&input);
        if let Some(network_score) = self.network_score(headers).await {
            result = self
                .score_calculator
                .update_with_network_score(&result, network_score);
        }

        let decided = served.full_scored(result)?.decide(&self.config.targets);
        self.log_decision(headers, path, &decided);
        Ok(decided)
    }

    fn quick_input(&self, headers: &HeadersData) -> ScoringInput {
        let ua = self
            .user_agent_analyzer
            .analyze(headers.user_agent().unwrap_or_default());
        debug!(detector = "user_agent", score = ua.score, "User-Agent analysis complete");

        let hdrs = self.header_analyzer.analyze(headers);
        debug!(detector = "headers", score = hdrs.score, "Header analysis complete");

        ScoringInput::quick(Some(ua), Some(hdrs))
    }

    /// Verify a token and spend its nonce. Returns the carried quick score.
    async fn redeem_token(&self, headers: &HeadersData, token: Option<&str>) -> Option<u8> {
        let token = token.map(str::to_string).or_else(|| {
            headers
                .header("cookie")
                .and_then(|c| self.challenge_manager.extract_token_from_cookies(c))
        })?;

        let Some(verified) = self.challenge_manager.verify_token(&token) else {
            debug!("Challenge token invalid or expired");
            return None;
        };

        match self.used_tokens.increment(&format!("tok:{}", verified.nonce)).await {
            Ok(1) => Some(verified.quick_score),
            Ok(uses) => {
                warn!(uses = uses, "Challenge token reused");
                None
            }
            Err(e) => {
                // Single use cannot be proven, so the token carries nothing
                warn!(error = %e, "Token store unavailable, ignoring token");
                None
            }
        }
    }

    async fn analyze_fingerprint(&self, fp: &FingerprintInput) -> Option<FingerprintAnalysis> {
        let timeout = Duration::from_millis(self.config.performance.analyzer_timeout_ms);
        match tokio::time::timeout(timeout, self.fingerprint_analyzer.analyze(fp)).await {
            Ok(analysis) => {
                debug!(
                    detector = "fingerprint",
                    score = analysis.score,
                    headless = analysis.is_headless,
                    "Fingerprint analysis complete"
                );
                Some(analysis)
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Fingerprint analysis timed out");
                None
            }
        }
    }

    async fn network_score(&self, headers: &HeadersData) -> Option<u8> {
        if !self.config.network.enabled || self.config.weights.network <= 0.0 {
            return None;
        }
        let ip = client_ip(headers)?;
        let timeout = Duration::from_millis(self.config.performance.network_timeout_ms);

        match tokio::time::timeout(timeout, self.reputation.lookup(ip)).await {
            Ok(Ok(score)) => {
                debug!(
                    detector = "network",
                    client_ip = %ip,
                    score = ?score,
                    "Reputation lookup complete"
                );
                score
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Reputation lookup failed");
                None
            }
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Reputation lookup timed out");
                None
            }
        }
    }

    fn signal_unavailable(&self, signal: Signal) {
        debug!(error = %CloakerError::SignalUnavailable(signal), "Scoring without signal");
    }

    fn log_decision(&self, headers: &HeadersData, path: &str, decided: &Decided) {
        let ip = client_ip(headers).map(|ip| ip.to_string()).unwrap_or_default();
        info!(
            client_ip = %ip,
            path = %path,
            final_score = decided.final_score(),
            decision = %decided.decision(),
            phase = ?decided.result().phase,
            confidence = decided.result().confidence,
            "Visitor classified"
        );
    }
}
