//! Recurring failure pattern detection.
//!
//! Records (resource, event type) occurrences and estimates inter-arrival
//! statistics per pair. Regular recurrence with enough occurrences yields
//! a prediction of the next event, surfaced as prompt text.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vigil_common::ids::IdGenerator;
use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};
use vigil_common::timefmt::{duration_ns, format_days};

static EVENT_IDS: IdGenerator = IdGenerator::new("evt");

const PATTERNS_FILE: &str = "ai_patterns.json";
const DEFAULT_MAX_EVENTS: usize = 5000;
const DEFAULT_MIN_OCCURRENCES: usize = 3;
const DEFAULT_PATTERN_WINDOW_DAYS: i64 = 90;
const DEFAULT_PREDICTION_LIMIT_DAYS: i64 = 30;
const MIN_SURFACED_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.95;
const CONTEXT_CHAR_LIMIT: usize = 2000;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternEventType {
    HighMemory,
    HighCpu,
    DiskFull,
    Oom,
    Restart,
    Unresponsive,
    BackupFailed,
}

impl PatternEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternEventType::HighMemory => "high_memory",
            PatternEventType::HighCpu => "high_cpu",
            PatternEventType::DiskFull => "disk_full",
            PatternEventType::Oom => "oom",
            PatternEventType::Restart => "restart",
            PatternEventType::Unresponsive => "unresponsive",
            PatternEventType::BackupFailed => "backup_failed",
        }
    }

    fn event_name(&self) -> &'static str {
        match self {
            PatternEventType::HighMemory => "high memory usage",
            PatternEventType::HighCpu => "high CPU usage",
            PatternEventType::DiskFull => "disk space critical",
            PatternEventType::Oom => "OOM events",
            PatternEventType::Restart => "restarts",
            PatternEventType::Unresponsive => "unresponsive periods",
            PatternEventType::BackupFailed => "backup failures",
        }
    }
}

/// Maps an alert type onto a trackable event type. Unknown alert types are
/// not tracked.
pub fn map_alert_to_event_type(alert_type: &str) -> Option<PatternEventType> {
    match alert_type {
        "memory_warning" | "memory_critical" => Some(PatternEventType::HighMemory),
        "cpu_warning" | "cpu_critical" => Some(PatternEventType::HighCpu),
        "disk_warning" | "disk_critical" => Some(PatternEventType::DiskFull),
        "oom" | "out_of_memory" => Some(PatternEventType::Oom),
        "restart" | "restarted" => Some(PatternEventType::Restart),
        "unresponsive" | "unreachable" => Some(PatternEventType::Unresponsive),
        "backup_failed" => Some(PatternEventType::BackupFailed),
        _ => None,
    }
}

/// One recorded occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalEvent {
    #[serde(default)]
    pub id: String,
    pub resource_id: String,
    pub event_type: PatternEventType,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub resolved: bool,
    #[serde(with = "duration_ns", default = "Duration::zero")]
    pub duration: Duration,
}

/// A detected recurrence with inter-arrival statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub resource_id: String,
    pub event_type: PatternEventType,
    pub occurrences: usize,
    #[serde(with = "duration_ns")]
    pub average_interval: Duration,
    #[serde(with = "duration_ns")]
    pub stddev_interval: Duration,
    pub last_occurrence: DateTime<Utc>,
    pub next_predicted: DateTime<Utc>,
    pub confidence: f64,
    #[serde(with = "duration_ns", default = "Duration::zero")]
    pub average_duration: Duration,
}

/// A predicted future failure derived from a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePrediction {
    pub resource_id: String,
    pub event_type: PatternEventType,
    pub predicted_at: DateTime<Utc>,
    pub days_until: f64,
    pub confidence: f64,
    pub basis: String,
    pub pattern: Pattern,
}

#[derive(Debug, Clone)]
pub struct PatternDetectorConfig {
    pub max_events: usize,
    /// Minimum occurrences before a pattern forms (default 3).
    pub min_occurrences: usize,
    /// Lookback for pattern computation (default 90 days).
    pub pattern_window: Duration,
    /// Horizon for surfaced predictions (default 30 days).
    pub prediction_limit: Duration,
    pub data_dir: Option<PathBuf>,
}

impl Default for PatternDetectorConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            min_occurrences: DEFAULT_MIN_OCCURRENCES,
            pattern_window: Duration::days(DEFAULT_PATTERN_WINDOW_DAYS),
            prediction_limit: Duration::days(DEFAULT_PREDICTION_LIMIT_DAYS),
            data_dir: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PatternFile {
    events: Vec<HistoricalEvent>,
    patterns: HashMap<String, Pattern>,
}

// ==================== Detector ====================

struct State {
    events: Vec<HistoricalEvent>,
    patterns: HashMap<String, Pattern>,
    // Reused across computations so sustained event load does not grow
    // the heap with per-call interval vectors.
    scratch: Vec<(DateTime<Utc>, Duration)>,
}

pub struct PatternDetector {
    state: RwLock<State>,
    max_events: usize,
    min_occurrences: usize,
    pattern_window: Duration,
    prediction_limit: Duration,
    data_dir: Option<PathBuf>,
}

impl PatternDetector {
    pub fn new(cfg: PatternDetectorConfig) -> Self {
        let defaults = PatternDetectorConfig::default();
        let max_events = if cfg.max_events == 0 {
            defaults.max_events
        } else {
            cfg.max_events
        };
        let min_occurrences = if cfg.min_occurrences == 0 {
            defaults.min_occurrences
        } else {
            cfg.min_occurrences
        };
        let pattern_window = if cfg.pattern_window <= Duration::zero() {
            defaults.pattern_window
        } else {
            cfg.pattern_window
        };
        let prediction_limit = if cfg.prediction_limit <= Duration::zero() {
            defaults.prediction_limit
        } else {
            cfg.prediction_limit
        };

        let mut state = State {
            events: Vec::new(),
            patterns: HashMap::new(),
            scratch: Vec::new(),
        };

        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<PatternFile>(
                &dir.join(PATTERNS_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(loaded)) => {
                    state.events = loaded.events;
                    state.patterns = loaded.patterns;

                    let cutoff = Utc::now() - pattern_window;
                    state.events.retain(|e| e.timestamp > cutoff);
                    if state.events.len() > max_events {
                        let excess = state.events.len() - max_events;
                        state.events.drain(..excess);
                    }
                    state.patterns.retain(|_, p| {
                        p.occurrences >= min_occurrences && p.last_occurrence > cutoff
                    });

                    if !state.events.is_empty() {
                        info!(
                            events = state.events.len(),
                            patterns = state.patterns.len(),
                            "loaded pattern history from disk"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load pattern history, starting fresh");
                }
            }
        }

        Self {
            state: RwLock::new(state),
            max_events,
            min_occurrences,
            pattern_window,
            prediction_limit,
            data_dir: cfg.data_dir,
        }
    }

    /// Records an occurrence and recomputes the pattern for its
    /// (resource, event type) pair.
    pub fn record_event(&self, mut event: HistoricalEvent) {
        if event.id.is_empty() {
            event.id = EVENT_IDS.next();
        }
        if event.timestamp == DateTime::<Utc>::default() {
            event.timestamp = Utc::now();
        }

        {
            let mut state = self.write();
            let resource_id = event.resource_id.clone();
            let event_type = event.event_type;
            state.events.push(event);
            self.trim_events(&mut state);

            let key = pattern_key(&resource_id, event_type);
            match self.compute_pattern(&mut state, &resource_id, event_type) {
                Some(pattern) => {
                    state.patterns.insert(key, pattern);
                }
                None => {
                    state.patterns.remove(&key);
                }
            }
        }

        self.save_async();
    }

    /// Records an occurrence from an alert, mapping the alert type onto a
    /// trackable event type. Unknown alert types are ignored.
    pub fn record_from_alert(&self, resource_id: &str, alert_type: &str, timestamp: DateTime<Utc>) {
        let Some(event_type) = map_alert_to_event_type(alert_type) else {
            return;
        };
        self.record_event(HistoricalEvent {
            id: String::new(),
            resource_id: resource_id.to_string(),
            event_type,
            timestamp,
            description: alert_type.to_string(),
            resolved: false,
            duration: Duration::zero(),
        });
    }

    /// Predictions for all tracked resources, soonest first. Only patterns
    /// with enough confidence and occurrences, whose predicted time falls
    /// within the prediction horizon, are surfaced.
    pub fn get_predictions(&self) -> Vec<FailurePrediction> {
        let now = Utc::now();
        let state = self.read();

        let mut predictions: Vec<FailurePrediction> = state
            .patterns
            .values()
            .filter(|p| {
                p.confidence >= MIN_SURFACED_CONFIDENCE
                    && p.occurrences >= self.min_occurrences
                    && p.next_predicted > now
                    && p.next_predicted <= now + self.prediction_limit
            })
            .map(|p| FailurePrediction {
                resource_id: p.resource_id.clone(),
                event_type: p.event_type,
                predicted_at: p.next_predicted,
                days_until: (p.next_predicted - now).num_seconds() as f64 / 86_400.0,
                confidence: p.confidence,
                basis: format_pattern_basis(p, now),
                pattern: p.clone(),
            })
            .collect();

        predictions.sort_by(|a, b| {
            a.days_until
                .partial_cmp(&b.days_until)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions
    }

    pub fn get_predictions_for_resource(&self, resource_id: &str) -> Vec<FailurePrediction> {
        self.get_predictions()
            .into_iter()
            .filter(|p| p.resource_id == resource_id)
            .collect()
    }

    /// All currently detected patterns, keyed by `resource:event_type`.
    pub fn patterns(&self) -> HashMap<String, Pattern> {
        self.read().patterns.clone()
    }

    /// Markdown block of predictions for the prompt, capped at roughly
    /// 2000 characters. Empty string when nothing is predicted.
    pub fn format_for_context(&self, resource_id: &str) -> String {
        let predictions = if resource_id.is_empty() {
            self.get_predictions()
        } else {
            self.get_predictions_for_resource(resource_id)
        };

        if predictions.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n## Failure Predictions\n");
        out.push_str("Based on historical patterns:\n");
        for prediction in &predictions {
            if out.len() > CONTEXT_CHAR_LIMIT {
                out.push_str("\n... and more\n");
                break;
            }
            out.push_str("- ");
            out.push_str(&prediction.basis);
            out.push('\n');
        }
        out
    }

    /// Synchronous save for shutdown paths.
    pub fn flush(&self) {
        if let Err(err) = self.save_now() {
            warn!(error = %format!("{err:#}"), "failed to save pattern history");
        }
    }

    // Interval statistics run in two streaming passes over a reusable
    // timestamp buffer; no per-call interval vector is allocated.
    fn compute_pattern(
        &self,
        state: &mut State,
        resource_id: &str,
        event_type: PatternEventType,
    ) -> Option<Pattern> {
        let cutoff = Utc::now() - self.pattern_window;

        let State {
            events, scratch, ..
        } = state;
        scratch.clear();
        scratch.extend(
            events
                .iter()
                .filter(|e| {
                    e.resource_id == resource_id
                        && e.event_type == event_type
                        && e.timestamp > cutoff
                })
                .map(|e| (e.timestamp, e.duration)),
        );

        let n = scratch.len();
        if n < self.min_occurrences || n < 2 {
            return None;
        }
        scratch.sort_by_key(|(ts, _)| *ts);

        let intervals = (n - 1) as i64;
        // Sum in i128: thousands of 90-day intervals in nanoseconds would
        // overflow i64.
        let mut sum_ns: i128 = 0;
        for pair in scratch.windows(2) {
            sum_ns += (pair[1].0 - pair[0].0).num_nanoseconds().unwrap_or(i64::MAX) as i128;
        }
        let avg_ns = (sum_ns / intervals as i128) as i64;

        let mut sum_squares = 0.0;
        for pair in scratch.windows(2) {
            let interval_ns = (pair[1].0 - pair[0].0).num_nanoseconds().unwrap_or(i64::MAX);
            let diff = (interval_ns - avg_ns) as f64;
            sum_squares += diff * diff;
        }
        let stddev_ns = if intervals >= 2 {
            (sum_squares / (intervals - 1) as f64).sqrt() as i64
        } else {
            0
        };

        let consistency = if avg_ns > 0 {
            1.0 - (stddev_ns as f64 / avg_ns as f64).min(1.0)
        } else {
            1.0
        };
        let occurrence_bonus = (n as f64 / 10.0).min(0.3);
        let confidence = (consistency * 0.7 + occurrence_bonus).clamp(0.0, MAX_CONFIDENCE);

        // Average duration over all but the last occurrence, when known.
        let mut dur_sum: i64 = 0;
        let mut dur_count: i64 = 0;
        for (_, duration) in &scratch[..n - 1] {
            if *duration > Duration::zero() {
                dur_sum += duration.num_nanoseconds().unwrap_or(0);
                dur_count += 1;
            }
        }
        let average_duration = if dur_count > 0 {
            Duration::nanoseconds(dur_sum / dur_count)
        } else {
            Duration::zero()
        };

        let last_occurrence = scratch[n - 1].0;
        let average_interval = Duration::nanoseconds(avg_ns);

        Some(Pattern {
            resource_id: resource_id.to_string(),
            event_type,
            occurrences: n,
            average_interval,
            stddev_interval: Duration::nanoseconds(stddev_ns),
            last_occurrence,
            next_predicted: last_occurrence + average_interval,
            confidence,
            average_duration,
        })
    }

    fn trim_events(&self, state: &mut State) {
        let cutoff = Utc::now() - self.pattern_window;
        state.events.retain(|e| e.timestamp > cutoff);
        if state.events.len() > self.max_events {
            let excess = state.events.len() - self.max_events;
            state.events.drain(..excess);
        }
    }

    fn save_async(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let bytes = {
            let state = self.read();
            let file = PatternFile {
                events: state.events.clone(),
                patterns: state.patterns.clone(),
            };
            match persist::encode_pretty(&file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to encode pattern history");
                    return;
                }
            }
        };
        persist::spawn_write("pattern history", dir.join(PATTERNS_FILE), bytes);
    }

    fn save_now(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let bytes = {
            let state = self.read();
            let file = PatternFile {
                events: state.events.clone(),
                patterns: state.patterns.clone(),
            };
            persist::encode_pretty(&file)?
        };
        persist::write_atomic(&dir.join(PATTERNS_FILE), &bytes)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, State> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, State> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn pattern_key(resource_id: &str, event_type: PatternEventType) -> String {
    format!("{}:{}", resource_id, event_type.as_str())
}

fn format_pattern_basis(pattern: &Pattern, now: DateTime<Utc>) -> String {
    let days_interval = pattern.average_interval.num_seconds() as f64 / 86_400.0;
    let days_since_last = (now - pattern.last_occurrence).num_seconds() as f64 / 86_400.0;
    let days_until_next = (pattern.next_predicted - now).num_seconds() as f64 / 86_400.0;

    let event_name = pattern.event_type.event_name();

    if days_until_next < 0.0 {
        format!(
            "{} typically occurs every ~{} (last: {} ago, overdue)",
            event_name,
            format_days(days_interval),
            format_days(days_since_last)
        )
    } else {
        format!(
            "{} typically occurs every ~{} (next expected in ~{})",
            event_name,
            format_days(days_interval),
            format_days(days_until_next)
        )
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;

    fn event(resource: &str, event_type: PatternEventType, at: DateTime<Utc>) -> HistoricalEvent {
        HistoricalEvent {
            id: String::new(),
            resource_id: resource.to_string(),
            event_type,
            timestamp: at,
            description: String::new(),
            resolved: false,
            duration: Duration::zero(),
        }
    }

    fn detector() -> PatternDetector {
        PatternDetector::new(PatternDetectorConfig::default())
    }

    #[test]
    fn weekly_oom_pattern_predicts_next_occurrence() {
        let d = detector();
        let now = Utc::now();
        for days_ago in [21, 14, 7, 0] {
            d.record_event(event(
                "vm-100",
                PatternEventType::Oom,
                now - Duration::days(days_ago),
            ));
        }

        let predictions = d.get_predictions();
        assert_eq!(predictions.len(), 1);
        let p = &predictions[0];
        assert_eq!(p.resource_id, "vm-100");
        assert_eq!(p.event_type, PatternEventType::Oom);
        assert!(p.days_until >= 5.0 && p.days_until <= 9.0, "days_until = {}", p.days_until);
        assert!(p.confidence >= 0.5);
    }

    #[test]
    fn confidence_is_hard_capped() {
        let d = detector();
        let now = Utc::now();
        // Perfectly regular, many occurrences: raw score exceeds the cap.
        for i in 0..20 {
            d.record_event(event(
                "vm-100",
                PatternEventType::Restart,
                now - Duration::days(40) + Duration::days(2) * i,
            ));
        }

        let patterns = d.patterns();
        let pattern = &patterns["vm-100:restart"];
        assert!(pattern.confidence <= MAX_CONFIDENCE);
        assert!(pattern.confidence > 0.9);
        assert_eq!(
            pattern.next_predicted,
            pattern.last_occurrence + pattern.average_interval
        );
    }

    #[test]
    fn irregular_intervals_lower_confidence() {
        let d = detector();
        let now = Utc::now();
        for days_ago in [50, 49, 20, 1] {
            d.record_event(event(
                "vm-100",
                PatternEventType::HighCpu,
                now - Duration::days(days_ago),
            ));
        }

        let patterns = d.patterns();
        let irregular = patterns["vm-100:high_cpu"].confidence;

        for days_ago in [30, 20, 10, 0] {
            d.record_event(event(
                "vm-101",
                PatternEventType::HighCpu,
                now - Duration::days(days_ago),
            ));
        }
        let patterns = d.patterns();
        let regular = patterns["vm-101:high_cpu"].confidence;

        assert!(regular > irregular);
    }

    #[test]
    fn below_min_occurrences_no_pattern() {
        let d = detector();
        let now = Utc::now();
        d.record_event(event("vm-100", PatternEventType::Oom, now - Duration::days(7)));
        d.record_event(event("vm-100", PatternEventType::Oom, now));

        assert!(d.patterns().is_empty());
        assert!(d.get_predictions().is_empty());
    }

    #[test]
    fn predictions_outside_horizon_are_hidden() {
        let d = PatternDetector::new(PatternDetectorConfig {
            prediction_limit: Duration::days(30),
            ..Default::default()
        });
        let now = Utc::now();
        // Every 60 days: next prediction is past the 30-day horizon.
        for days_ago in [180, 120, 60, 0] {
            d.record_event(event(
                "vm-100",
                PatternEventType::DiskFull,
                now - Duration::days(days_ago),
            ));
        }

        assert!(!d.patterns().is_empty());
        assert!(d.get_predictions().is_empty());
    }

    #[test]
    fn predictions_sorted_soonest_first() {
        let d = detector();
        let now = Utc::now();
        for days_ago in [21, 14, 7, 0] {
            d.record_event(event(
                "vm-100",
                PatternEventType::Oom,
                now - Duration::days(days_ago),
            ));
        }
        for days_ago in [9, 6, 3, 0] {
            d.record_event(event(
                "vm-101",
                PatternEventType::Restart,
                now - Duration::days(days_ago),
            ));
        }

        let predictions = d.get_predictions();
        assert_eq!(predictions.len(), 2);
        assert_eq!(predictions[0].resource_id, "vm-101");
        assert_eq!(predictions[1].resource_id, "vm-100");
    }

    #[test]
    fn alert_mapping() {
        assert_eq!(
            map_alert_to_event_type("memory_critical"),
            Some(PatternEventType::HighMemory)
        );
        assert_eq!(
            map_alert_to_event_type("backup_failed"),
            Some(PatternEventType::BackupFailed)
        );
        assert_eq!(map_alert_to_event_type("something_else"), None);

        let d = detector();
        d.record_from_alert("vm-100", "something_else", Utc::now());
        assert!(d.read().events.is_empty());
    }

    #[test]
    fn event_cap_and_window_trim() {
        let d = PatternDetector::new(PatternDetectorConfig {
            max_events: 10,
            ..Default::default()
        });
        let now = Utc::now();
        // One ancient event falls out of the window entirely.
        d.record_event(event(
            "vm-1",
            PatternEventType::Restart,
            now - Duration::days(200),
        ));
        for i in 0..20 {
            d.record_event(event(
                "vm-1",
                PatternEventType::Restart,
                now - Duration::minutes(20 - i),
            ));
        }
        assert_eq!(d.read().events.len(), 10);
    }

    #[test]
    fn context_block_lists_basis() {
        let d = detector();
        let now = Utc::now();
        for days_ago in [21, 14, 7, 0] {
            d.record_event(event(
                "vm-100",
                PatternEventType::HighCpu,
                now - Duration::days(days_ago),
            ));
        }

        let text = d.format_for_context("");
        assert!(text.contains("## Failure Predictions"));
        assert!(text.contains("Based on historical patterns:"));
        assert!(text.contains("high CPU usage typically occurs every ~7 days"));
        assert!(d.format_for_context("vm-999").is_empty());
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = PatternDetectorConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let d = PatternDetector::new(cfg.clone());
        let now = Utc::now();
        for days_ago in [21, 14, 7, 0] {
            d.record_event(event(
                "vm-100",
                PatternEventType::Oom,
                now - Duration::days(days_ago),
            ));
        }
        d.flush();

        let reloaded = PatternDetector::new(cfg);
        assert_eq!(
            d.format_for_context(""),
            reloaded.format_for_context("")
        );
    }
}
