//! Challenge submission parsing.
//!
//! The interstitial posts `{ token, mousePath, dwellTimeMs, scrollEvents,
//! clickEvents, complete, fingerprint }`. Each part is parsed on its own: a
//! broken fingerprint does not take the behavior telemetry down with it.

use crate::config::BehaviorConfig;
use crate::detectors::{
    BehaviorData, BehaviorTracker, FingerprintInput, MouseSample, Signal, TrackerEvent,
};
use crate::error::{CloakerError, Result};
use serde_json::{Map, Value};

/// A parsed submission. Missing or malformed parts are `None`.
#[derive(Debug, Clone, Default)]
pub struct ChallengeSubmission {
    pub token: Option<String>,
    pub behavior: Option<BehaviorData>,
    pub fingerprint: Option<FingerprintInput>,
    /// Parts that were present but could not be used
    pub issues: Vec<CloakerError>,
    /// Mouse samples rejected while rebuilding the path
    pub dropped_samples: usize,
}

impl ChallengeSubmission {
    /// Parse a request body.
    ///
    /// Fails only when the body is not a JSON object at all.
    pub fn parse(body: &[u8], config: &BehaviorConfig) -> Result<Self> {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| CloakerError::MalformedInput(format!("submission is not JSON: {e}")))?;
        let obj = value
            .as_object()
            .ok_or_else(|| {
                CloakerError::MalformedInput("submission is not an object".to_string())
            })?;

        let mut submission = Self {
            token: obj
                .get("token")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
            ..Default::default()
        };

        match parse_behavior(obj, config) {
            Ok(Some((data, dropped))) => {
                submission.behavior = Some(data);
                submission.dropped_samples = dropped;
            }
            Ok(None) => {}
            Err(e) => submission.issues.push(e),
        }

        match parse_fingerprint(obj) {
            Ok(fp) => submission.fingerprint = fp,
            Err(e) => submission.issues.push(e),
        }

        Ok(submission)
    }

    /// Signals the submission cannot provide.
    pub fn missing_signals(&self) -> Vec<Signal> {
        let mut missing = Vec::new();
        if self.behavior.is_none() {
            missing.push(Signal::Behavior);
        }
        if self.fingerprint.is_none() {
            missing.push(Signal::Fingerprint);
        }
        missing
    }
}

fn parse_behavior(
    obj: &Map<String, Value>,
    config: &BehaviorConfig,
) -> Result<Option<(BehaviorData, usize)>> {
    let path = obj.get("mousePath");
    let dwell = obj.get("dwellTimeMs");
    if path.is_none() && dwell.is_none() {
        return Ok(None);
    }

    let mut tracker = BehaviorTracker::start(config);
    let mut rejected = 0;

    match path {
        None | Some(Value::Null) => {}
        Some(Value::Array(samples)) => {
            for raw in samples {
                match serde_json::from_value::<MouseSample>(raw.clone()) {
                    Ok(s) => tracker.record(TrackerEvent::MouseMove {
                        x: s.x,
                        y: s.y,
                        timestamp_ms: s.timestamp_ms,
                    }),
                    Err(_) => rejected += 1,
                }
            }
        }
        Some(_) => {
            return Err(CloakerError::MalformedInput("mousePath is not an array".to_string()));
        }
    }

    match dwell {
        None | Some(Value::Null) => {}
        Some(v) => {
            let ms = v
                .as_f64()
                .filter(|ms| ms.is_finite() && *ms >= 0.0)
                .ok_or_else(|| {
                    CloakerError::MalformedInput("dwellTimeMs is not a duration".to_string())
                })?;
            tracker.observe_dwell(ms as u64);
        }
    }

    tracker.add_interactions(count(obj, "scrollEvents"), count(obj, "clickEvents"));

    let complete = obj.get("complete").and_then(Value::as_bool).unwrap_or(true);
    let dropped = rejected + tracker.dropped();
    Ok(Some((tracker.finish(complete), dropped)))
}

fn count(obj: &Map<String, Value>, key: &str) -> u32 {
    obj.get(key)
        .and_then(Value::as_u64)
        .map(|n| n.min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

fn parse_fingerprint(obj: &Map<String, Value>) -> Result<Option<FingerprintInput>> {
    match obj.get("fingerprint") {
        None | Some(Value::Null) => Ok(None),
        Some(v @ Value::Object(_)) => serde_json::from_value(v.clone())
            .map(Some)
            .map_err(|e| CloakerError::MalformedInput(format!("fingerprint: {e}"))),
        Some(_) => Err(CloakerError::MalformedInput("fingerprint is not an object".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::fingerprint::master_fingerprint_hash;

    fn parse(body: &str) -> ChallengeSubmission {
        ChallengeSubmission::parse(body.as_bytes(), &BehaviorConfig::default()).unwrap()
    }

    #[test]
    fn test_full_submission() {
        let s = parse(
            r#"{
                "token": "abc",
                "mousePath": [{"x": 1, "y": 2, "t": 10}, {"x": 5, "y": 9, "timestampMs": 30}],
                "dwellTimeMs": 4200,
                "scrollEvents": 3,
                "clickEvents": 1,
                "fingerprint": {
                    "canvasHash": "a1b2",
                    "audioHash": "124.04347527516074",
                    "screen": {"width": 1920, "height": 1080}
                }
            }"#,
        );

        assert_eq!(s.token.as_deref(), Some("abc"));
        let behavior = s.behavior.unwrap();
        assert_eq!(behavior.mouse_path.len(), 2);
        assert_eq!(behavior.total_time_on_page_ms, 4200);
        assert_eq!(behavior.scroll_events, 3);
        assert_eq!(behavior.click_events, 1);
        assert!(behavior.complete);
        let fingerprint = s.fingerprint.unwrap();
        assert_eq!(fingerprint.screen.width, 1920);
        assert_eq!(fingerprint.audio_hash.as_deref(), Some("124.04347527516074"));
        assert!(s.issues.is_empty());

        let without_audio = FingerprintInput {
            audio_hash: None,
            ..fingerprint.clone()
        };
        assert_ne!(
            master_fingerprint_hash(&fingerprint),
            master_fingerprint_hash(&without_audio)
        );
    }

    #[test]
    fn test_malformed_fingerprint_keeps_behavior() {
        let s =
            parse(r#"{"mousePath": [], "dwellTimeMs": 3000, "fingerprint": {"screen": "big"}}"#);

        assert!(s.behavior.is_some());
        assert!(s.fingerprint.is_none());
        assert_eq!(s.missing_signals(), vec![Signal::Fingerprint]);
        assert!(matches!(s.issues[0], CloakerError::MalformedInput(_)));
    }

    #[test]
    fn test_malformed_path_keeps_fingerprint() {
        let s = parse(r#"{"mousePath": "nope", "fingerprint": {"canvasHash": "x"}}"#);

        assert!(s.behavior.is_none());
        assert!(s.fingerprint.is_some());
        assert_eq!(s.issues.len(), 1);
    }

    #[test]
    fn test_bad_samples_are_dropped() {
        let s = parse(
            r#"{"mousePath": [{"x": 1, "y": 1, "t": 10}, {"x": "a"}, {"x": 2, "y": 2, "t": 5}, {"x": 3, "y": 3, "t": 999999}]}"#,
        );

        // One unparseable, one out of order, one past the capture window
        assert_eq!(s.behavior.unwrap().mouse_path.len(), 1);
        assert_eq!(s.dropped_samples, 3);
    }

    #[test]
    fn test_empty_object() {
        let s = parse("{}");
        assert!(s.token.is_none());
        assert_eq!(s.missing_signals(), vec![Signal::Behavior, Signal::Fingerprint]);
        assert!(s.issues.is_empty());
    }

    #[test]
    fn test_not_json() {
        let config = BehaviorConfig::default();
        assert!(matches!(
            ChallengeSubmission::parse(b"<html>", &config),
            Err(CloakerError::MalformedInput(_))
        ));
        assert!(ChallengeSubmission::parse(b"[1, 2]", &config).is_err());
    }

    #[test]
    fn test_incomplete_capture_flag() {
        let s = parse(r#"{"dwellTimeMs": 800, "complete": false}"#);
        assert!(!s.behavior.unwrap().complete);
    }
}
