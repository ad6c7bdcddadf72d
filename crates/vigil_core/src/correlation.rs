//! Cross-resource correlation detection.
//!
//! Tracks events across resources and learns "event on A is followed by
//! event on B" relationships, enabling dependency inference and cascade
//! prediction.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vigil_common::ids::IdGenerator;
use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};
use vigil_common::timefmt::{duration_ns, format_confidence, format_span};

static EVENT_IDS: IdGenerator = IdGenerator::new("cor-evt");

const CORRELATIONS_FILE: &str = "ai_correlations.json";
const DEFAULT_MAX_EVENTS: usize = 10_000;
const DEFAULT_CORRELATION_WINDOW_MINUTES: i64 = 10;
const DEFAULT_MIN_OCCURRENCES: usize = 3;
const DEFAULT_RETENTION_DAYS: i64 = 30;
const MIN_SURFACED_CONFIDENCE: f64 = 0.3;
const MAX_CONFIDENCE: f64 = 0.95;
const CONTEXT_CORRELATION_LIMIT: usize = 10;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationEventType {
    Alert,
    Restart,
    HighCpu,
    HighMem,
    DiskFull,
    Offline,
    Migration,
}

impl CorrelationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorrelationEventType::Alert => "alert",
            CorrelationEventType::Restart => "restart",
            CorrelationEventType::HighCpu => "high_cpu",
            CorrelationEventType::HighMem => "high_mem",
            CorrelationEventType::DiskFull => "disk_full",
            CorrelationEventType::Offline => "offline",
            CorrelationEventType::Migration => "migration",
        }
    }
}

/// A tracked occurrence on one resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationEvent {
    #[serde(default)]
    pub id: String,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    pub event_type: CorrelationEventType,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub value: f64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// A learned "source event is followed by target event" relationship.
/// The event pair is stored as two typed fields; the arrow form only
/// appears in rendered descriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub source_id: String,
    #[serde(default)]
    pub source_name: String,
    #[serde(default)]
    pub source_type: String,
    pub target_id: String,
    #[serde(default)]
    pub target_name: String,
    #[serde(default)]
    pub target_type: String,
    pub source_event: CorrelationEventType,
    pub target_event: CorrelationEventType,
    pub occurrences: usize,
    #[serde(with = "duration_ns")]
    pub avg_delay: Duration,
    pub confidence: f64,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Correlation {
    pub fn pattern(&self) -> String {
        format!("{} -> {}", self.source_event.as_str(), self.target_event.as_str())
    }
}

/// A predicted downstream effect of an event on a source resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadePrediction {
    pub resource_id: String,
    pub resource_name: String,
    pub source_event: CorrelationEventType,
    pub target_event: CorrelationEventType,
    #[serde(with = "duration_ns")]
    pub expected_in: Duration,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct CorrelationDetectorConfig {
    pub max_events: usize,
    /// How long after a source event a target event still correlates
    /// (default 10 minutes).
    pub correlation_window: Duration,
    /// Minimum co-occurrences before a correlation is surfaced (default 3).
    pub min_occurrences: usize,
    /// How long events and idle correlations are kept (default 30 days).
    pub retention_window: Duration,
    pub data_dir: Option<PathBuf>,
}

impl Default for CorrelationDetectorConfig {
    fn default() -> Self {
        Self {
            max_events: DEFAULT_MAX_EVENTS,
            correlation_window: Duration::minutes(DEFAULT_CORRELATION_WINDOW_MINUTES),
            min_occurrences: DEFAULT_MIN_OCCURRENCES,
            retention_window: Duration::days(DEFAULT_RETENTION_DAYS),
            data_dir: None,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
struct CorrelationFile {
    events: Vec<CorrelationEvent>,
    correlations: HashMap<String, Correlation>,
}

// ==================== Detector ====================

struct State {
    events: Vec<CorrelationEvent>,
    // key: source_id:target_id:source_event:target_event
    correlations: HashMap<String, Correlation>,
}

pub struct CorrelationDetector {
    state: RwLock<State>,
    max_events: usize,
    correlation_window: Duration,
    min_occurrences: usize,
    retention_window: Duration,
    data_dir: Option<PathBuf>,
}

impl CorrelationDetector {
    pub fn new(cfg: CorrelationDetectorConfig) -> Self {
        let defaults = CorrelationDetectorConfig::default();
        let max_events = if cfg.max_events == 0 {
            defaults.max_events
        } else {
            cfg.max_events
        };
        let correlation_window = if cfg.correlation_window <= Duration::zero() {
            defaults.correlation_window
        } else {
            cfg.correlation_window
        };
        let min_occurrences = if cfg.min_occurrences == 0 {
            defaults.min_occurrences
        } else {
            cfg.min_occurrences
        };
        let retention_window = if cfg.retention_window <= Duration::zero() {
            defaults.retention_window
        } else {
            cfg.retention_window
        };

        let mut state = State {
            events: Vec::new(),
            correlations: HashMap::new(),
        };

        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<CorrelationFile>(
                &dir.join(CORRELATIONS_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(loaded)) => {
                    state.events = loaded.events;
                    state.correlations = loaded.correlations;

                    trim_events(&mut state.events, max_events, retention_window);
                    let cutoff = Utc::now() - retention_window;
                    state.correlations.retain(|_, c| c.last_seen > cutoff);

                    if !state.events.is_empty() {
                        info!(
                            events = state.events.len(),
                            correlations = state.correlations.len(),
                            "loaded correlation data from disk"
                        );
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load correlation data, starting fresh");
                }
            }
        }

        Self {
            state: RwLock::new(state),
            max_events,
            correlation_window,
            min_occurrences,
            retention_window,
            data_dir: cfg.data_dir,
        }
    }

    /// Records an event and pairs it against recent events on other
    /// resources inside the correlation window.
    pub fn record_event(&self, mut event: CorrelationEvent) {
        if event.id.is_empty() {
            event.id = EVENT_IDS.next();
        }
        if event.timestamp == DateTime::<Utc>::default() {
            event.timestamp = Utc::now();
        }

        {
            let mut state = self.write();
            state.events.push(event.clone());
            trim_events(&mut state.events, self.max_events, self.retention_window);
            self.detect_correlations(&mut state, &event);
        }

        self.save_async();
    }

    // Every in-window event on another resource that precedes the new one
    // counts as a co-occurrence of (old -> new).
    fn detect_correlations(&self, state: &mut State, new_event: &CorrelationEvent) {
        let cutoff = new_event.timestamp - self.correlation_window;

        let State {
            events,
            correlations,
        } = state;

        for old_event in events.iter() {
            if old_event.resource_id == new_event.resource_id {
                continue;
            }
            if old_event.timestamp < cutoff || old_event.timestamp > new_event.timestamp {
                continue;
            }

            let key = correlation_key(
                &old_event.resource_id,
                &new_event.resource_id,
                old_event.event_type,
                new_event.event_type,
            );
            let delay = new_event.timestamp - old_event.timestamp;

            match correlations.get_mut(&key) {
                Some(existing) => {
                    existing.occurrences += 1;
                    existing.avg_delay = running_average(
                        existing.avg_delay,
                        delay,
                        existing.occurrences,
                    );
                    existing.last_seen = new_event.timestamp;
                    existing.confidence = self.calculate_confidence(existing.occurrences);
                    existing.description = format_correlation_description(existing);
                }
                None => {
                    correlations.insert(
                        key,
                        Correlation {
                            source_id: old_event.resource_id.clone(),
                            source_name: old_event.resource_name.clone(),
                            source_type: old_event.resource_type.clone(),
                            target_id: new_event.resource_id.clone(),
                            target_name: new_event.resource_name.clone(),
                            target_type: new_event.resource_type.clone(),
                            source_event: old_event.event_type,
                            target_event: new_event.event_type,
                            occurrences: 1,
                            avg_delay: delay,
                            confidence: 0.1,
                            last_seen: new_event.timestamp,
                            description: String::new(),
                        },
                    );
                }
            }
        }
    }

    fn calculate_confidence(&self, occurrences: usize) -> f64 {
        if occurrences < self.min_occurrences {
            return occurrences as f64 * 0.1;
        }
        let confidence = 0.3 + 0.1 * (occurrences - self.min_occurrences) as f64;
        confidence.min(MAX_CONFIDENCE)
    }

    /// All correlations above the surfacing thresholds, most confident first.
    pub fn get_correlations(&self) -> Vec<Correlation> {
        let state = self.read();
        let mut result: Vec<Correlation> = state
            .correlations
            .values()
            .filter(|c| {
                c.occurrences >= self.min_occurrences && c.confidence >= MIN_SURFACED_CONFIDENCE
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        result
    }

    /// Correlations where the resource appears on either side.
    pub fn get_correlations_for_resource(&self, resource_id: &str) -> Vec<Correlation> {
        let state = self.read();
        state
            .correlations
            .values()
            .filter(|c| {
                (c.source_id == resource_id || c.target_id == resource_id)
                    && c.occurrences >= self.min_occurrences
            })
            .cloned()
            .collect()
    }

    /// Resources whose events follow events on the given resource.
    pub fn get_dependencies(&self, resource_id: &str) -> Vec<String> {
        let state = self.read();
        let deps: HashSet<&str> = state
            .correlations
            .values()
            .filter(|c| c.source_id == resource_id && c.occurrences >= self.min_occurrences)
            .map(|c| c.target_id.as_str())
            .collect();
        deps.into_iter().map(String::from).collect()
    }

    /// Resources whose events precede events on the given resource.
    pub fn get_depends_on(&self, resource_id: &str) -> Vec<String> {
        let state = self.read();
        let deps: HashSet<&str> = state
            .correlations
            .values()
            .filter(|c| c.target_id == resource_id && c.occurrences >= self.min_occurrences)
            .map(|c| c.source_id.as_str())
            .collect();
        deps.into_iter().map(String::from).collect()
    }

    /// What is likely to break next if the given resource sees the given
    /// event, most confident first.
    pub fn predict_cascade(
        &self,
        resource_id: &str,
        event_type: CorrelationEventType,
    ) -> Vec<CascadePrediction> {
        let state = self.read();
        let mut predictions: Vec<CascadePrediction> = state
            .correlations
            .values()
            .filter(|c| {
                c.source_id == resource_id
                    && c.occurrences >= self.min_occurrences
                    && c.source_event == event_type
            })
            .map(|c| CascadePrediction {
                resource_id: c.target_id.clone(),
                resource_name: c.target_name.clone(),
                source_event: c.source_event,
                target_event: c.target_event,
                expected_in: c.avg_delay,
                confidence: c.confidence,
            })
            .collect();

        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        predictions
    }

    /// Markdown block of correlations for the prompt, capped at 10 entries.
    /// Empty string when nothing correlates.
    pub fn format_for_context(&self, resource_id: &str) -> String {
        let correlations = if resource_id.is_empty() {
            self.get_correlations()
        } else {
            self.get_correlations_for_resource(resource_id)
        };

        if correlations.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n## Resource Correlations\n");
        out.push_str("Observed relationships between resources:\n");
        for (i, c) in correlations.iter().enumerate() {
            if i >= CONTEXT_CORRELATION_LIMIT {
                out.push_str("\n... and more\n");
                break;
            }
            if c.description.is_empty() {
                out.push_str(&format!(
                    "- {} ({} confidence)\n",
                    c.pattern(),
                    format_confidence(c.confidence)
                ));
            } else {
                out.push_str(&format!("- {}\n", c.description));
            }
        }
        out
    }

    /// Synchronous save for shutdown paths.
    pub fn flush(&self) {
        if let Err(err) = self.save_now() {
            warn!(error = %format!("{err:#}"), "failed to save correlation data");
        }
    }

    fn save_async(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let bytes = {
            let state = self.read();
            let file = CorrelationFile {
                events: state.events.clone(),
                correlations: state.correlations.clone(),
            };
            match persist::encode_pretty(&file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to encode correlation data");
                    return;
                }
            }
        };
        persist::spawn_write("correlation data", dir.join(CORRELATIONS_FILE), bytes);
    }

    fn save_now(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let bytes = {
            let state = self.read();
            let file = CorrelationFile {
                events: state.events.clone(),
                correlations: state.correlations.clone(),
            };
            persist::encode_pretty(&file)?
        };
        persist::write_atomic(&dir.join(CORRELATIONS_FILE), &bytes)
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

// ==================== Helpers ====================

fn correlation_key(
    source_id: &str,
    target_id: &str,
    source_event: CorrelationEventType,
    target_event: CorrelationEventType,
) -> String {
    format!(
        "{}:{}:{}:{}",
        source_id,
        target_id,
        source_event.as_str(),
        target_event.as_str()
    )
}

fn running_average(avg: Duration, sample: Duration, count: usize) -> Duration {
    let avg_ns = avg.num_nanoseconds().unwrap_or(i64::MAX);
    let sample_ns = sample.num_nanoseconds().unwrap_or(i64::MAX);
    let n = count as i64;
    Duration::nanoseconds((avg_ns * (n - 1) + sample_ns) / n)
}

fn format_correlation_description(c: &Correlation) -> String {
    let source_name = if c.source_name.is_empty() {
        &c.source_id
    } else {
        &c.source_name
    };
    let target_name = if c.target_name.is_empty() {
        &c.target_id
    } else {
        &c.target_name
    };

    format!(
        "When {} experiences {}, {} often follows within {}",
        source_name,
        c.source_event.as_str(),
        target_name,
        format_span(c.avg_delay)
    )
}

fn trim_events(events: &mut Vec<CorrelationEvent>, max_events: usize, retention: Duration) {
    if events.len() > max_events {
        let excess = events.len() - max_events;
        events.drain(..excess);
    }
    let cutoff = Utc::now() - retention;
    events.retain(|e| e.timestamp > cutoff);
}

// ==================== Tests ====================
