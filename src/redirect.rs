//! Decision to redirect target mapping.

use crate::config::RedirectTargets;
use crate::error::{CloakerError, Result};
use crate::score::Decision;
use tracing::warn;

/// Headers every redirect carries so neither browsers nor intermediaries
/// cache a per-visitor routing decision.
pub const NO_CACHE_HEADERS: [(&str, &str); 3] = [
    ("Cache-Control", "no-store, no-cache, must-revalidate"),
    ("Pragma", "no-cache"),
    ("Expires", "0"),
];

/// Configured target for a decision.
pub fn redirect_url(decision: Decision, targets: &RedirectTargets) -> Result<&str> {
    let target = match decision {
        Decision::Block => targets.block_url.as_deref(),
        Decision::Challenge => targets.challenge_url.as_deref(),
        Decision::Allow => targets.allow_url.as_deref(),
    };

    target
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| CloakerError::Configuration(format!("no redirect target for {decision}")))
}

/// Target for a decision, falling back to the safe default when unset.
pub fn resolve_redirect(decision: Decision, targets: &RedirectTargets) -> &str {
    match redirect_url(decision, targets) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, fallback = %targets.safe_default_url, "Using safe default redirect");
            &targets.safe_default_url
        }
    }
}

/// A 302 response with its cache-busting headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResponse {
    pub status: u16,
    pub location: String,
    pub headers: Vec<(String, String)>,
}

impl RedirectResponse {
    pub fn found(location: impl Into<String>) -> Self {
        let location = location.into();
        let mut headers = vec![("Location".to_string(), location.clone())];
        headers.extend(
            NO_CACHE_HEADERS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        Self {
            status: 302,
            location,
            headers,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> RedirectTargets {
        RedirectTargets {
            block_url: Some("/safe".to_string()),
            challenge_url: None,
            allow_url: Some("https://offer.example/landing".to_string()),
            safe_default_url: "/".to_string(),
        }
    }

    #[test]
    fn test_configured_targets() {
        let t = targets();
        assert_eq!(redirect_url(Decision::Block, &t).unwrap(), "/safe");
        assert_eq!(
            redirect_url(Decision::Allow, &t).unwrap(),
            "https://offer.example/landing"
        );
    }

    #[test]
    fn test_missing_target_is_configuration_error() {
        let t = targets();
        assert!(matches!(
            redirect_url(Decision::Challenge, &t),
            Err(CloakerError::Configuration(_))
        ));
        assert_eq!(resolve_redirect(Decision::Challenge, &t), "/");
    }

    #[test]
    fn test_blank_target_falls_back() {
        let mut t = targets();
        t.allow_url = Some("  ".to_string());
        assert_eq!(resolve_redirect(Decision::Allow, &t), "/");
    }

    #[test]
    fn test_response_headers() {
        let response = RedirectResponse::found("/safe");
        assert_eq!(response.status, 302);
        assert_eq!(response.header("location"), Some("/safe"));
        assert_eq!(
            response.header("cache-control"),
            Some("no-store, no-cache, must-revalidate")
        );
        assert_eq!(response.header("Pragma"), Some("no-cache"));
    }
}
