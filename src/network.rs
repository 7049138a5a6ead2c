//! Network/IP reputation.
//!
//! Reputation arrives after the other signals and is folded in with
//! [`ScoreCalculator::update_with_network_score`](crate::score::ScoreCalculator::update_with_network_score).

use crate::config::NetworkConfig;
use crate::error::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;
use tracing::warn;

/// Source of a network reputation score (0 = hostile, 100 = clean).
#[async_trait]
pub trait NetworkReputation: Send + Sync {
    /// `Ok(None)` means no opinion about this address.
    async fn lookup(&self, ip: IpAddr) -> Result<Option<u8>>;
}

/// Reputation that never has an opinion.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReputation;

#[async_trait]
impl NetworkReputation for NoReputation {
    async fn lookup(&self, _ip: IpAddr) -> Result<Option<u8>> {
        Ok(None)
    }
}

/// Reputation from configured CIDR ranges.
#[derive(Debug, Clone)]
pub struct StaticReputation {
    suspicious: Vec<IpNet>,
    suspicious_score: u8,
    clean_score: Option<u8>,
}

impl StaticReputation {
    pub fn new(config: &NetworkConfig) -> Self {
        let suspicious = config
            .suspicious_ranges
            .iter()
            .filter_map(|range| match range.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!(range = %range, error = %e, "Skipping invalid reputation range");
                    None
                }
            })
            .collect();

        Self {
            suspicious,
            suspicious_score: config.suspicious_score.min(100),
            clean_score: config.clean_score.map(|s| s.min(100)),
        }
    }

    pub fn is_suspicious(&self, ip: &IpAddr) -> bool {
        self.suspicious.iter().any(|net| net.contains(ip))
    }
}

#[async_trait]
impl NetworkReputation for StaticReputation {
    async fn lookup(&self, ip: IpAddr) -> Result<Option<u8>> {
        if self.is_suspicious(&ip) {
            Ok(Some(self.suspicious_score))
        } else {
            Ok(self.clean_score)
        }
    }
}
