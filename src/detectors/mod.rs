//! Signal analyzers.
//!
//! Each analyzer looks at one aspect of a visitor and returns an analysis with a
//! score from 0 (bot-like) to 100 (human-like).

pub mod behavior;
pub mod fingerprint;
pub mod headers;
pub mod user_agent;

pub use behavior::{
    BehaviorAnalysis, BehaviorAnalyzer, BehaviorData, BehaviorTracker, MouseSample, TrackerEvent,
};
pub use fingerprint::{FingerprintAnalysis, FingerprintAnalyzer, FingerprintInput, ScreenInfo};
pub use headers::{HeaderAnalyzer, HeadersAnalysis};
pub use user_agent::{UserAgentAnalysis, UserAgentAnalyzer};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// The signals that feed the blended score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    UserAgent,
    Headers,
    Behavior,
    Fingerprint,
    Network,
}

impl Signal {
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::UserAgent => "user_agent",
            Signal::Headers => "headers",
            Signal::Behavior => "behavior",
            Signal::Fingerprint => "fingerprint",
            Signal::Network => "network",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common view over an analyzer result.
pub trait Analysis {
    /// Which signal this analysis feeds.
    const SIGNAL: Signal;

    /// Score in 0..=100, 100 = human.
    fn score(&self) -> u8;

    /// Reason codes behind the score.
    fn reasons(&self) -> &[String];
}

/// Request headers as seen by the server for one request.
#[derive(Debug, Clone, Default)]
pub struct HeadersData {
    /// Header values keyed by lowercase name
    headers: HashMap<String, Vec<String>>,
    /// Socket peer address, if the caller knows it
    pub peer_ip: Option<IpAddr>,
}

impl HeadersData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header value. Names are case-insensitive.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers
            .entry(name.to_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn with_peer_ip(mut self, ip: IpAddr) -> Self {
        self.peer_ip = Some(ip);
        self
    }

    /// Get a single header value (first if multiple).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_lowercase())
            .and_then(|v| v.first())
            .map(|s| s.as_str())
    }

    /// All values of a header.
    pub fn values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_lowercase())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_lowercase())
    }

    /// Get the User-Agent header.
    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<K, V> FromIterator<(K, V)> for HeadersData
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut data = HeadersData::new();
        for (k, v) in iter {
            data.insert(k.as_ref(), v);
        }
        data
    }
}

/// Clamp an intermediate score into 0..=100.
pub(crate) fn clamp_score(score: i32) -> u8 {
    score.clamp(0, 100) as u8
}
