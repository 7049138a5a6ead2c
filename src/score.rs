//! Progressive score composition and decision bands.
//!
//! Scores run from 0 (bot) to 100 (human). The blended score is a weighted mean
//! over the signals that are actually present, so a signal that has not
//! arrived yet (or failed) neither drags the score down nor inflates it.

use crate::config::{CloakerConfig, SignalWeights, ThresholdConfig};
use crate::detectors::{
    Analysis, BehaviorAnalysis, FingerprintAnalysis, HeadersAnalysis, Signal, UserAgentAnalysis,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Score used when no signal is available at all. Lands in the challenge band.
pub const NEUTRAL_SCORE: u8 = 50;

/// Routing decision for a visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Redirect to the safe/decoy page
    Block,
    /// Serve the interstitial and re-score
    Challenge,
    /// Redirect to the target page
    Allow,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Block => "block",
            Decision::Challenge => "challenge",
            Decision::Allow => "allow",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ThresholdConfig {
    /// Map a score to its band.
    pub fn decision_for(&self, score: u8) -> Decision {
        if score <= self.block_max {
            Decision::Block
        } else if score <= self.challenge_max {
            Decision::Challenge
        } else {
            Decision::Allow
        }
    }

    pub fn should_block(&self, score: u8) -> bool {
        self.decision_for(score) == Decision::Block
    }

    pub fn should_challenge(&self, score: u8) -> bool {
        self.decision_for(score) == Decision::Challenge
    }

    pub fn should_allow(&self, score: u8) -> bool {
        self.decision_for(score) == Decision::Allow
    }
}

/// True for scores in the default block band (0-30).
pub fn should_block(score: u8) -> bool {
    ThresholdConfig::default().should_block(score)
}

/// True for scores in the default challenge band (31-60).
pub fn should_challenge(score: u8) -> bool {
    ThresholdConfig::default().should_challenge(score)
}

/// True for scores in the default allow band (61-100).
pub fn should_allow(score: u8) -> bool {
    ThresholdConfig::default().should_allow(score)
}

/// Which phase produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringPhase {
    /// User-Agent and headers only
    Quick,
    /// All signals that arrived after the challenge
    Full,
}

/// One signal's input to the blend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalContribution {
    pub signal: Signal,
    pub score: u8,
    /// Configured weight, scaled by the analyzer's confidence where it has one
    pub weight: f32,
}

/// Per-signal contributions behind a blended score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub entries: Vec<SignalContribution>,
    pub reasons: Vec<String>,
}

impl ScoreBreakdown {
    pub fn get(&self, signal: Signal) -> Option<&SignalContribution> {
        self.entries.iter().find(|e| e.signal == signal)
    }

    pub fn contains(&self, signal: Signal) -> bool {
        self.get(signal).is_some()
    }

    pub fn total_weight(&self) -> f32 {
        self.entries.iter().map(|e| e.weight).sum()
    }

    /// Fraction of the blended score carried by one signal.
    pub fn share(&self, signal: Signal) -> Option<f32> {
        let total = self.total_weight();
        if total <= 0.0 {
            return None;
        }
        self.get(signal).map(|e| e.weight / total)
    }

    /// Weighted mean of the entries, unrounded.
    pub fn blend(&self) -> Option<f64> {
        let total: f64 = self.entries.iter().map(|e| e.weight as f64).sum();
        if total <= 0.0 {
            return None;
        }
        let sum: f64 = self
            .entries
            .iter()
            .map(|e| e.score as f64 * e.weight as f64)
            .sum();
        Some(sum / total)
    }

    fn push(&mut self, signal: Signal, score: u8, weight: f32) {
        if weight > 0.0 {
            self.entries.retain(|e| e.signal != signal);
            self.entries.push(SignalContribution {
                signal,
                score: score.min(100),
                weight,
            });
        }
    }
}

/// Analyses available for one evaluation. Any of them may be missing.
#[derive(Debug, Clone, Default)]
pub struct ScoringInput {
    pub user_agent: Option<UserAgentAnalysis>,
    pub headers: Option<HeadersAnalysis>,
    pub behavior: Option<BehaviorAnalysis>,
    pub fingerprint: Option<FingerprintAnalysis>,
    pub network_score: Option<u8>,
    /// Quick-pass score carried over from an earlier request. Stands in for
    /// the User-Agent and header signals when neither analysis is present.
    pub quick_score: Option<u8>,
}

impl ScoringInput {
    /// Input carrying only the synchronously available signals.
    pub fn quick(user_agent: Option<UserAgentAnalysis>, headers: Option<HeadersAnalysis>) -> Self {
        Self {
            user_agent,
            headers,
            ..Default::default()
        }
    }

    /// Hard evidence that overrides the band: crawler UA or headless fingerprint.
    fn hard_block_reason(&self) -> Option<String> {
        if let Some(ua) = self.user_agent.as_ref().filter(|ua| ua.is_crawler) {
            return Some(format!(
                "hard_block_{}",
                ua.crawler_name.as_deref().unwrap_or("crawler")
            ));
        }
        if self.fingerprint.as_ref().is_some_and(|fp| fp.is_headless) {
            return Some("hard_block_headless".to_string());
        }
        None
    }
}

/// Outcome of a scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringResult {
    /// Blended score (0-100)
    pub final_score: u8,
    pub decision: Decision,
    pub breakdown: ScoreBreakdown,
    /// Share of the maximum possible weight that was present (0.0-1.0)
    pub confidence: f32,
    pub phase: ScoringPhase,
    /// Set when hard evidence forced a block regardless of the band
    pub hard_block: Option<String>,
}

/// Combines analyses into a blended score and maps it to a decision.
#[derive(Debug, Clone)]
pub struct ScoreCalculator {
    pub weights: SignalWeights,
    pub thresholds: ThresholdConfig,
    /// Block on crawler UAs and headless fingerprints whatever the blend says
    pub hard_block: bool,
}

impl Default for ScoreCalculator {
    fn default() -> Self {
        Self::new(SignalWeights::default(), ThresholdConfig::default())
    }
}

impl ScoreCalculator {
    pub fn new(weights: SignalWeights, thresholds: ThresholdConfig) -> Self {
        Self {
            weights,
            thresholds,
            hard_block: true,
        }
    }

    /// Calculator built from a full configuration.
    pub fn from_config(config: &CloakerConfig) -> Self {
        Self::new(config.weights.clone(), config.thresholds.clone())
    }

    /// Disable the hard-evidence override; decisions then follow the bands only.
    pub fn without_hard_block(mut self) -> Self {
        self.hard_block = false;
        self
    }

    fn weight_of(&self, signal: Signal) -> f32 {
        match signal {
            Signal::UserAgent => self.weights.user_agent,
            Signal::Headers => self.weights.headers,
            Signal::Behavior => self.weights.behavior,
            Signal::Fingerprint => self.weights.fingerprint,
            Signal::Network => self.weights.network,
        }
    }

    fn max_weight(&self) -> f32 {
        self.weights.user_agent
            + self.weights.headers
            + self.weights.behavior
            + self.weights.fingerprint
            + self.weights.network
    }

    fn push_analysis<A: Analysis>(
        &self,
        breakdown: &mut ScoreBreakdown,
        analysis: Option<&A>,
        scale: f32,
    ) {
        if let Some(a) = analysis {
            breakdown.push(A::SIGNAL, a.score(), self.weight_of(A::SIGNAL) * scale);
            breakdown.reasons.extend(a.reasons().iter().cloned());
        }
    }

    fn breakdown(&self, input: &ScoringInput) -> ScoreBreakdown {
        let mut breakdown = ScoreBreakdown::default();
        self.push_analysis(&mut breakdown, input.user_agent.as_ref(), 1.0);
        self.push_analysis(&mut breakdown, input.headers.as_ref(), 1.0);
        if let (None, None, Some(quick)) = (&input.user_agent, &input.headers, input.quick_score) {
            breakdown.push(Signal::UserAgent, quick, self.weights.user_agent);
            breakdown.push(Signal::Headers, quick, self.weights.headers);
            breakdown.reasons.push("quick_score_carried_over".to_string());
        }
        if let Some(b) = input.behavior.as_ref() {
            let scale = b.confidence.clamp(0.0, 1.0);
            self.push_analysis(&mut breakdown, Some(b), scale);
        }
        self.push_analysis(&mut breakdown, input.fingerprint.as_ref(), 1.0);
        if let Some(score) = input.network_score {
            breakdown.push(Signal::Network, score, self.weights.network);
        }
        breakdown
    }

    /// Build a result from a breakdown. No entries at all yields the neutral
    /// score, which challenges.
    fn finish(
        &self,
        breakdown: ScoreBreakdown,
        phase: ScoringPhase,
        hard_block: Option<String>,
    ) -> ScoringResult {
        let final_score = breakdown
            .blend()
            .map(|b| b.round().clamp(0.0, 100.0) as u8)
            .unwrap_or(NEUTRAL_SCORE);

        let max_weight = self.max_weight();
        let confidence = if max_weight > 0.0 {
            (breakdown.total_weight() / max_weight).min(1.0)
        } else {
            0.0
        };

        let hard_block = hard_block.filter(|_| self.hard_block);
        let decision = match (&hard_block, phase) {
            (Some(_), _) => Decision::Block,
            (None, ScoringPhase::Full) => self.thresholds.decision_for(final_score),
            (None, ScoringPhase::Quick) => self.quick_band(final_score),
        };

        ScoringResult {
            final_score,
            decision,
            breakdown,
            confidence,
            phase,
            hard_block,
        }
    }

    /// Blend every available signal.
    pub fn calculate_progressive_score(&self, input: &ScoringInput) -> ScoringResult {
        self.finish(self.breakdown(input), ScoringPhase::Full, input.hard_block_reason())
    }

    /// Fold a late network reputation score into an earlier result.
    ///
    /// Existing entries stay as they are; only the network entry is added or
    /// replaced and the blend recomputed. The prior's phase keeps its band
    /// rules, so a quick result still needs `quick_allow_min` to allow.
    pub fn update_with_network_score(
        &self,
        prior: &ScoringResult,
        network_score: u8,
    ) -> ScoringResult {
        let mut breakdown = prior.breakdown.clone();
        breakdown.push(Signal::Network, network_score, self.weights.network);
        self.finish(breakdown, prior.phase, prior.hard_block.clone())
    }

    /// Decide from User-Agent and headers alone.
    ///
    /// Blocks at or below the block band, allows at or above `quick_allow_min`,
    /// and asks for a challenge in between.
    pub fn quick_decision(
        &self,
        user_agent: Option<&UserAgentAnalysis>,
        headers: Option<&HeadersAnalysis>,
    ) -> ScoringResult {
        let input = ScoringInput::quick(user_agent.cloned(), headers.cloned());
        self.finish(self.breakdown(&input), ScoringPhase::Quick, input.hard_block_reason())
    }

    /// Quick-pass band: only a conclusive score skips the challenge.
    fn quick_band(&self, score: u8) -> Decision {
        if score <= self.thresholds.block_max {
            Decision::Block
        } else if score >= self.thresholds.quick_allow_min {
            Decision::Allow
        } else {
            Decision::Challenge
        }
    }
}
