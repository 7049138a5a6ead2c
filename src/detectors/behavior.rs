//! Behavior analysis.
//!
//! Scores client-side interaction telemetry collected during the challenge
//! interstitial:
//! - Mouse path shape (direction entropy, straight-line segments)
//! - Velocity variance
//! - Sample timing regularity
//! - Dwell time plausibility

use super::{clamp_score, Analysis, Signal};
use crate::config::BehaviorConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Direction bins for path entropy.
const DIRECTION_BINS: usize = 8;

/// Segments shorter than this (px) count as jitter, not movement.
const MIN_SEGMENT_PX: f64 = 1.0;

/// One mouse position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MouseSample {
    pub x: f64,
    pub y: f64,
    /// Milliseconds since page load
    #[serde(alias = "t")]
    pub timestamp_ms: u64,
}

/// Interaction telemetry snapshot for one page view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BehaviorData {
    pub mouse_path: Vec<MouseSample>,
    pub total_time_on_page_ms: u64,
    pub scroll_events: u32,
    pub click_events: u32,
    /// False when capture was cut short (visitor navigated away)
    pub complete: bool,
}

/// Result of behavior analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorAnalysis {
    pub is_human: bool,
    pub has_robotic_patterns: bool,
    pub score: u8,
    /// How much the aggregator should trust this score (0.0-1.0)
    pub confidence: f32,
    pub metrics: PathMetrics,
    pub reasons: Vec<String>,
}

impl Analysis for BehaviorAnalysis {
    const SIGNAL: Signal = Signal::Behavior;

    fn score(&self) -> u8 {
        self.score
    }

    fn reasons(&self) -> &[String] {
        &self.reasons
    }
}

/// Features extracted from a mouse path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathMetrics {
    pub sample_count: usize,
    pub moving_segments: usize,
    /// Coefficient of variation of segment velocities
    pub velocity_cv: Option<f64>,
    /// Coefficient of variation of sample intervals
    pub timing_cv: Option<f64>,
    /// Share of consecutive segments that keep the same heading
    pub straight_line_ratio: Option<f64>,
    /// Normalized Shannon entropy of segment headings (0.0-1.0)
    pub direction_entropy: f64,
    pub direction_changes: usize,
}

impl PathMetrics {
    /// Extract features from an ordered mouse path.
    pub fn from_path(path: &[MouseSample]) -> Self {
        let mut metrics = PathMetrics {
            sample_count: path.len(),
            ..Default::default()
        };
        if path.len() < 2 {
            return metrics;
        }

        let mut intervals = Vec::with_capacity(path.len() - 1);
        let mut velocities = Vec::new();
        let mut headings = Vec::new();

        for pair in path.windows(2) {
            let (prev, curr) = (&pair[0], &pair[1]);
            let dt = curr.timestamp_ms.saturating_sub(prev.timestamp_ms) as f64;
            intervals.push(dt);

            let dx = curr.x - prev.x;
            let dy = curr.y - prev.y;
            let distance = (dx * dx + dy * dy).sqrt();
            if distance < MIN_SEGMENT_PX || dt <= 0.0 {
                continue;
            }
            velocities.push(distance / dt * 1000.0);
            headings.push(dy.atan2(dx));
        }

        metrics.moving_segments = headings.len();
        metrics.timing_cv = (intervals.len() >= 3).then(|| coefficient_of_variation(&intervals));
        metrics.velocity_cv =
            (velocities.len() >= 2).then(|| coefficient_of_variation(&velocities));

        if headings.len() >= 2 {
            let mut straight = 0;
            for pair in headings.windows(2) {
                let diff = angle_diff(pair[0], pair[1]);
                if diff > PI / 4.0 {
                    metrics.direction_changes += 1;
                }
                if diff < PI / 36.0 {
                    straight += 1;
                }
            }
            metrics.straight_line_ratio = Some(straight as f64 / (headings.len() - 1) as f64);
        }

        metrics.direction_entropy = direction_entropy(&headings);
        metrics
    }
}

/// Behavior analyzer.
pub struct BehaviorAnalyzer {
    robotic_dwell_ms: u64,
    min_samples: usize,
    timing_cv_threshold: f64,
}

impl BehaviorAnalyzer {
    /// Create a new behavior analyzer.
    pub fn new(config: &BehaviorConfig) -> Self {
        Self {
            robotic_dwell_ms: config.robotic_dwell_ms,
            min_samples: config.min_samples.max(1),
            timing_cv_threshold: config.timing_cv_threshold,
        }
    }

    /// Score a telemetry snapshot. Partial snapshots are scored too, with
    /// reduced confidence.
    pub fn analyze(&self, data: &BehaviorData) -> BehaviorAnalysis {
        let metrics = PathMetrics::from_path(&data.mouse_path);
        let mut reasons = Vec::new();
        let dwell = data.total_time_on_page_ms;
        let interacted = data.scroll_events > 0 || data.click_events > 0;

        // No movement at all
        if metrics.moving_segments == 0 {
            let (score, confidence, robotic) = if dwell > self.robotic_dwell_ms {
                // Interaction softens the score but never clears the flag
                reasons.push("no_movement_with_dwell".to_string());
                if interacted {
                    (20, 0.8, true)
                } else {
                    (10, 1.0, true)
                }
            } else if interacted {
                reasons.push("no_pointer_path".to_string());
                (50, 0.4, false)
            } else {
                reasons.push("insufficient_data".to_string());
                (50, 0.2, false)
            };
            return BehaviorAnalysis {
                is_human: false,
                has_robotic_patterns: robotic,
                score,
                confidence: self.scale_confidence(confidence, data),
                metrics,
                reasons,
            };
        }

        let mut score = 50i32;

        // Path variety
        score += (metrics.direction_entropy * 25.0).round() as i32;
        if let Some(cv) = metrics.velocity_cv {
            score += (cv.min(1.0) * 15.0).round() as i32;
        }

        // Dwell plausibility
        if dwell >= 1_000 {
            score += 10;
        } else if dwell < 300 {
            score -= 20;
            reasons.push("implausibly_short_dwell".to_string());
        }
        if interacted {
            score += 5;
        }

        let mut robotic = false;
        if let Some(cv) = metrics.timing_cv {
            if cv < self.timing_cv_threshold {
                score -= 35;
                robotic = true;
                reasons.push("uniform_sample_timing".to_string());
            }
        }
        if let Some(ratio) = metrics.straight_line_ratio {
            if ratio > 0.95 {
                score -= 30;
                robotic = true;
                reasons.push("straight_line_path".to_string());
            }
        }
        if metrics.velocity_cv.is_some_and(|cv| cv < 0.05) {
            score -= 15;
            robotic = true;
            reasons.push("constant_velocity".to_string());
        }

        let is_human = !robotic
            && dwell > 0
            && metrics.velocity_cv.is_some_and(|cv| cv > 0.3)
            && metrics.straight_line_ratio.map_or(true, |r| r < 0.9);

        let confidence = (metrics.sample_count as f32 / self.min_samples as f32).min(1.0);

        BehaviorAnalysis {
            is_human,
            has_robotic_patterns: robotic,
            score: clamp_score(score),
            confidence: self.scale_confidence(confidence, data),
            metrics,
            reasons,
        }
    }

    fn scale_confidence(&self, confidence: f32, data: &BehaviorData) -> f32 {
        if data.complete {
            confidence
        } else {
            confidence * 0.6
        }
    }
}

impl Default for BehaviorAnalyzer {
    fn default() -> Self {
        Self::new(&BehaviorConfig::default())
    }
}

/// One telemetry event reported by the page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TrackerEvent {
    MouseMove { x: f64, y: f64, timestamp_ms: u64 },
    Scroll { timestamp_ms: u64 },
    Click { timestamp_ms: u64 },
}

impl TrackerEvent {
    fn timestamp_ms(&self) -> u64 {
        match *self {
            TrackerEvent::MouseMove { timestamp_ms, .. }
            | TrackerEvent::Scroll { timestamp_ms }
            | TrackerEvent::Click { timestamp_ms } => timestamp_ms,
        }
    }
}

/// Collects interaction telemetry for one page view.
///
/// Lifecycle: [`BehaviorTracker::start`] → [`record`](BehaviorTracker::record)
/// → [`snapshot`](BehaviorTracker::snapshot) → [`finish`](BehaviorTracker::finish).
/// `finish` consumes the tracker.
#[derive(Debug)]
pub struct BehaviorTracker {
    samples: VecDeque<MouseSample>,
    max_samples: usize,
    window_ms: u64,
    scroll_events: u32,
    click_events: u32,
    dwell_ms: u64,
    dropped: usize,
}

impl BehaviorTracker {
    /// Start a tracker bounded by sample count and capture window.
    pub fn start(config: &BehaviorConfig) -> Self {
        Self {
            samples: VecDeque::with_capacity(config.max_samples.min(256)),
            max_samples: config.max_samples.max(1),
            window_ms: config.capture_window_ms,
            scroll_events: 0,
            click_events: 0,
            dwell_ms: 0,
            dropped: 0,
        }
    }

    /// Record one event. Events past the capture window are dropped, as are
    /// mouse samples that go back in time.
    pub fn record(&mut self, event: TrackerEvent) {
        let ts = event.timestamp_ms();
        if ts > self.window_ms {
            self.dropped += 1;
            return;
        }
        self.dwell_ms = self.dwell_ms.max(ts);

        match event {
            TrackerEvent::MouseMove { x, y, timestamp_ms } => {
                if !x.is_finite() || !y.is_finite() {
                    self.dropped += 1;
                    return;
                }
                if self.samples.back().is_some_and(|s| s.timestamp_ms > timestamp_ms) {
                    self.dropped += 1;
                    return;
                }
                if self.samples.len() >= self.max_samples {
                    self.samples.pop_front();
                }
                self.samples.push_back(MouseSample { x, y, timestamp_ms });
            }
            TrackerEvent::Scroll { .. } => {
                self.scroll_events = self.scroll_events.saturating_add(1)
            }
            TrackerEvent::Click { .. } => self.click_events = self.click_events.saturating_add(1),
        }
    }

    /// Add interaction counts reported in aggregate.
    pub fn add_interactions(&mut self, scrolls: u32, clicks: u32) {
        self.scroll_events = self.scroll_events.saturating_add(scrolls);
        self.click_events = self.click_events.saturating_add(clicks);
    }

    /// Extend the observed dwell time, e.g. from a client-reported value.
    pub fn observe_dwell(&mut self, dwell_ms: u64) {
        self.dwell_ms = self.dwell_ms.max(dwell_ms.min(self.window_ms));
    }

    /// Number of events rejected so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Read the data collected so far without ending capture.
    pub fn snapshot(&self) -> BehaviorData {
        BehaviorData {
            mouse_path: self.samples.iter().copied().collect(),
            total_time_on_page_ms: self.dwell_ms,
            scroll_events: self.scroll_events,
            click_events: self.click_events,
            complete: false,
        }
    }

    /// End capture and hand over the data.
    pub fn finish(self, complete: bool) -> BehaviorData {
        BehaviorData {
            mouse_path: self.samples.into(),
            total_time_on_page_ms: self.dwell_ms,
            scroll_events: self.scroll_events,
            click_events: self.click_events,
            complete,
        }
    }

    /// Drain events from a channel until the capture window elapses or the
    /// sender goes away.
    ///
    /// Always returns; a closed channel before the deadline yields a partial
    /// (incomplete) snapshot.
    pub async fn capture(
        mut self,
        mut events: mpsc::Receiver<TrackerEvent>,
        window: Duration,
    ) -> BehaviorData {
        let deadline = Instant::now() + window;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => self.record(event),
                Ok(None) => {
                    tracing::debug!(
                        samples = self.samples.len(),
                        "Telemetry channel closed before capture window"
                    );
                    return self.finish(false);
                }
                Err(_) => return self.finish(true),
            }
        }
    }
}

/// Create a tracker with default bounds.
pub fn create_behavior_tracker() -> BehaviorTracker {
    BehaviorTracker::start(&BehaviorConfig::default())
}

fn coefficient_of_variation(values: &[f64]) -> f64 {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt() / mean
}

/// Smallest absolute difference between two headings, in 0..=PI.
fn angle_diff(a: f64, b: f64) -> f64 {
    let d = (a - b).abs() % (2.0 * PI);
    if d > PI {
        2.0 * PI - d
    } else {
        d
    }
}

fn direction_entropy(headings: &[f64]) -> f64 {
    if headings.is_empty() {
        return 0.0;
    }
    let mut bins = [0usize; DIRECTION_BINS];
    for h in headings {
        let normalized = (h + PI) / (2.0 * PI);
        let idx = ((normalized * DIRECTION_BINS as f64) as usize).min(DIRECTION_BINS - 1);
        bins[idx] += 1;
    }
    let total = headings.len() as f64;
    let entropy: f64 = bins
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum();
    entropy / (DIRECTION_BINS as f64).log2()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(x: f64, y: f64, t: u64) -> MouseSample {
        MouseSample { x, y, timestamp_ms: t }
    }

    /// Curvy path with irregular timing and speed.
    fn human_path() -> Vec<MouseSample> {
        let mut path = Vec::new();
        let mut t = 0u64;
        let gaps = [16, 33, 12, 48, 20, 95, 17, 31, 64, 15, 22, 140, 18, 27, 40];
        for (i, gap) in gaps.iter().enumerate() {
            let f = i as f64;
            path.push(sample(
                200.0 + 90.0 * (f * 0.7).sin() + f * f,
                150.0 + 60.0 * (f * 1.3).cos(),
                t,
            ));
            t += gap;
        }
        path
    }

    /// Straight line, fixed interval, fixed speed.
    fn scripted_path() -> Vec<MouseSample> {
        (0..20).map(|i| sample(i as f64 * 10.0, i as f64 * 5.0, i * 20)).collect()
    }

    #[test]
    fn test_empty_path_with_dwell_is_robotic() {
        let analyzer = BehaviorAnalyzer::default();
        let data = BehaviorData {
            total_time_on_page_ms: 3_000,
            complete: true,
            ..Default::default()
        };
        let result = analyzer.analyze(&data);
        assert!(result.has_robotic_patterns);
        assert!(!result.is_human);
        assert!(result.score <= 30);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_scroll_without_movement_is_still_robotic() {
        let analyzer = BehaviorAnalyzer::default();
        let data = BehaviorData {
            total_time_on_page_ms: 5_000,
            scroll_events: 1,
            complete: true,
            ..Default::default()
        };
        let result = analyzer.analyze(&data);
        assert!(result.has_robotic_patterns, "reasons: {:?}", result.reasons);
        assert!(!result.is_human);
        assert!(result.score <= 30, "score: {}", result.score);

        let silent = analyzer.analyze(&BehaviorData {
            scroll_events: 0,
            ..data
        });
        assert!(result.score >= silent.score);
    }

    #[test]
    fn test_empty_path_short_dwell_is_inconclusive() {
        let analyzer = BehaviorAnalyzer::default();
        let data = BehaviorData {
            total_time_on_page_ms: 400,
            complete: true,
            ..Default::default()
        };
        let result = analyzer.analyze(&data);
        assert!(!result.has_robotic_patterns);
        assert_eq!(result.score, 50);
        assert!(result.confidence < 0.5);
    }

    #[test]
    fn test_human_path() {
        let analyzer = BehaviorAnalyzer::default();
        let data = BehaviorData {
            mouse_path: human_path(),
            total_time_on_page_ms: 4_200,
            scroll_events: 2,
            click_events: 1,
            complete: true,
        };
        let result = analyzer.analyze(&data);
        assert!(!result.has_robotic_patterns, "reasons: {:?}", result.reasons);
        assert!(result.is_human);
        assert!(result.score > 60, "score: {}", result.score);
    }

    #[test]
    fn test_scripted_path() {
        let analyzer = BehaviorAnalyzer::default();
        let data = BehaviorData {
            mouse_path: scripted_path(),
            total_time_on_page_ms: 400,
            complete: true,
            ..Default::default()
        };
        let result = analyzer.analyze(&data);
        assert!(result.has_robotic_patterns);
        assert!(!result.is_human);
        assert!(result.reasons.contains(&"uniform_sample_timing".to_string()));
        assert!(result.reasons.contains(&"straight_line_path".to_string()));
        assert!(result.score <= 30, "score: {}", result.score);
    }

    #[test]
    fn test_partial_capture_lowers_confidence() {
        let analyzer = BehaviorAnalyzer::default();
        let mut data = BehaviorData {
            mouse_path: human_path(),
            total_time_on_page_ms: 4_200,
            complete: true,
            ..Default::default()
        };
        let full = analyzer.analyze(&data);
        data.complete = false;
        let partial = analyzer.analyze(&data);
        assert_eq!(full.score, partial.score);
        assert!(partial.confidence < full.confidence);
    }

    #[test]
    fn test_path_metrics() {
        let metrics = PathMetrics::from_path(&scripted_path());
        assert_eq!(metrics.sample_count, 20);
        assert_eq!(metrics.moving_segments, 19);
        assert_eq!(metrics.straight_line_ratio, Some(1.0));
        assert!(metrics.timing_cv.unwrap() < 0.01);
        assert!(metrics.direction_entropy < 0.01);

        let metrics = PathMetrics::from_path(&[sample(0.0, 0.0, 0)]);
        assert_eq!(metrics.moving_segments, 0);
        assert!(metrics.velocity_cv.is_none());
    }

    #[test]
    fn test_angle_diff_wraps() {
        assert!((angle_diff(PI - 0.1, -PI + 0.1) - 0.2).abs() < 1e-9);
        assert!(angle_diff(0.0, PI / 2.0) - PI / 2.0 < 1e-9);
    }

    #[test]
    fn test_tracker_lifecycle() {
        let mut tracker = create_behavior_tracker();
        tracker.record(TrackerEvent::MouseMove { x: 1.0, y: 1.0, timestamp_ms: 10 });
        tracker.record(TrackerEvent::MouseMove { x: 5.0, y: 3.0, timestamp_ms: 30 });
        tracker.record(TrackerEvent::MouseMove { x: 4.0, y: 3.0, timestamp_ms: 20 });
        tracker.record(TrackerEvent::Scroll { timestamp_ms: 900 });
        tracker.record(TrackerEvent::Click { timestamp_ms: 60_000 });

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.mouse_path.len(), 2);
        assert_eq!(snapshot.scroll_events, 1);
        assert_eq!(snapshot.click_events, 0);
        assert_eq!(snapshot.total_time_on_page_ms, 900);
        assert_eq!(tracker.dropped(), 2);

        let data = tracker.finish(true);
        assert!(data.complete);
        assert_eq!(data.mouse_path, snapshot.mouse_path);
    }

    #[test]
    fn test_tracker_bounds_samples() {
        let config = BehaviorConfig {
            max_samples: 5,
            ..Default::default()
        };
        let mut tracker = BehaviorTracker::start(&config);
        for i in 0..10 {
            tracker.record(TrackerEvent::MouseMove { x: i as f64, y: 0.0, timestamp_ms: i * 10 });
        }
        let data = tracker.finish(true);
        assert_eq!(data.mouse_path.len(), 5);
        assert_eq!(data.mouse_path[0].timestamp_ms, 50);
    }

    #[tokio::test]
    async fn test_capture_times_out_with_result() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(TrackerEvent::MouseMove { x: 1.0, y: 2.0, timestamp_ms: 5 }).await.unwrap();

        // Sender stays alive, so capture ends on the window
        let data = create_behavior_tracker().capture(rx, Duration::from_millis(30)).await;
        assert!(data.complete);
        assert_eq!(data.mouse_path.len(), 1);
        drop(tx);
    }

    #[tokio::test]
    async fn test_capture_cancelled_early_is_partial() {
        let (tx, rx) = mpsc::channel(16);
        tx.send(TrackerEvent::Click { timestamp_ms: 100 }).await.unwrap();
        drop(tx);

        let data = create_behavior_tracker().capture(rx, Duration::from_secs(5)).await;
        assert!(!data.complete);
        assert_eq!(data.click_events, 1);
    }
}
