//! Two-phase evaluation flow.
//!
//! Each state is its own type and transitions consume the previous state, so a
//! redirect can only be obtained from [`Decided`]:
//!
//! ```text
//! Unscored -> QuickScored -> ChallengeServed -> FullScored -> Decided
//!                  \______________________________________/
//!                          (obvious bot or human)
//! ```

use crate::config::RedirectTargets;
use crate::error::{CloakerError, Result};
use crate::redirect::resolve_redirect;
use crate::score::{Decision, ScoringPhase, ScoringResult};

/// Evaluation that has not seen any signal yet.
#[derive(Debug, Default)]
pub struct Unscored;

impl Unscored {
    pub fn new() -> Self {
        Self
    }

    pub fn quick_scored(self, result: ScoringResult) -> Result<QuickScored> {
        if result.phase != ScoringPhase::Quick {
            return Err(CloakerError::InvalidTransition {
                from: "unscored",
                to: "quick_scored",
            });
        }
        Ok(QuickScored { result })
    }
}

/// Scored from User-Agent and headers.
#[derive(Debug, Clone)]
pub struct QuickScored {
    result: ScoringResult,
}

impl QuickScored {
    pub fn result(&self) -> &ScoringResult {
        &self.result
    }

    pub fn needs_challenge(&self) -> bool {
        self.result.decision == Decision::Challenge
    }

    /// Decide without a challenge. Only valid when the quick pass was conclusive.
    pub fn decide(self, targets: &RedirectTargets) -> Result<Decided> {
        if self.needs_challenge() {
            return Err(CloakerError::InvalidTransition {
                from: "quick_scored",
                to: "decided",
            });
        }
        Ok(Decided::new(self.result, targets))
    }

    /// Serve the interstitial. Only valid when the quick pass was inconclusive.
    pub fn serve_challenge(self) -> Result<ChallengeServed> {
        if !self.needs_challenge() {
            return Err(CloakerError::InvalidTransition {
                from: "quick_scored",
                to: "challenge_served",
            });
        }
        Ok(ChallengeServed {
            quick_score: Some(self.result.final_score),
        })
    }
}

/// Interstitial served, waiting for telemetry.
#[derive(Debug, Clone)]
pub struct ChallengeServed {
    quick_score: Option<u8>,
}

impl ChallengeServed {
    /// Resume after the telemetry round trip. `quick_score` comes from a
    /// verified token, or is `None` when the token did not verify.
    pub fn resume(quick_score: Option<u8>) -> Self {
        Self { quick_score }
    }

    pub fn quick_score(&self) -> Option<u8> {
        self.quick_score
    }

    pub fn full_scored(self, result: ScoringResult) -> Result<FullScored> {
        if result.phase != ScoringPhase::Full {
            return Err(CloakerError::InvalidTransition {
                from: "challenge_served",
                to: "full_scored",
            });
        }
        Ok(FullScored { result })
    }
}

/// All available signals blended.
#[derive(Debug, Clone)]
pub struct FullScored {
    result: ScoringResult,
}

impl FullScored {
    pub fn result(&self) -> &ScoringResult {
        &self.result
    }

    pub fn decide(self, targets: &RedirectTargets) -> Decided {
        Decided::new(self.result, targets)
    }
}

/// Terminal state.
#[derive(Debug, Clone)]
pub struct Decided {
    result: ScoringResult,
    redirect_url: String,
}

impl Decided {
    fn new(result: ScoringResult, targets: &RedirectTargets) -> Self {
        let redirect_url = resolve_redirect(result.decision, targets).to_string();
        Self {
            result,
            redirect_url,
        }
    }

    pub fn decision(&self) -> Decision {
        self.result.decision
    }

    pub fn final_score(&self) -> u8 {
        self.result.final_score
    }

    pub fn result(&self) -> &ScoringResult {
        &self.result
    }

    pub fn redirect_url(&self) -> &str {
        &self.redirect_url
    }
}
