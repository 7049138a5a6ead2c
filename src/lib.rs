//! Visitor cloaker
//!
//! Scores each visitor from 0 (bot) to 100 (human) and routes them to a
//! block, challenge or allow destination.
//!
//! # Features
//!
//! - User-Agent crawler, placeholder and consistency checks
//! - Header presence, format, referer, proxy and datacenter checks
//! - Pointer-movement analysis from a neutral interstitial
//! - Browser fingerprint headless/spoof/replay checks
//! - Progressive scoring: quick decision first, full blend after the challenge
//!
//! # Example
//!
//! ```ignore
//! use cloaker::{Cloaker, CloakerConfig, QuickOutcome};
//!
//! let cloaker = Cloaker::new(CloakerConfig::default())?;
//! match cloaker.evaluate_request(&headers, "/landing")? {
//!     QuickOutcome::Decided(d) => redirect(d.redirect_url()),
//!     QuickOutcome::Challenge { page, .. } => serve(page),
//! }
//! ```

pub mod challenge;
pub mod config;
pub mod detectors;
pub mod engine;
pub mod error;
pub mod flow;
pub mod network;
pub mod payload;
pub mod redirect;
pub mod score;
pub mod server;
pub mod store;

pub use config::CloakerConfig;
pub use detectors::{HeadersData, Signal};
pub use engine::{Cloaker, QuickOutcome};
pub use error::{CloakerError, Result};
pub use flow::Decided;
pub use redirect::{redirect_url, resolve_redirect};
pub use score::{
    should_allow, should_block, should_challenge, Decision, ScoreCalculator, ScoringInput,
    ScoringResult,
};
