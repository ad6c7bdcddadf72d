//! Root-cause analysis across related resources.
//!
//! Given a trigger event, walks the resource topology for events that
//! preceded it on related resources, scores each as a candidate cause,
//! and produces an explained causal chain. Topology and event lookup are
//! injected through provider traits.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use vigil_common::ids::IdGenerator;

static ANALYSIS_IDS: IdGenerator = IdGenerator::new("rca");

const DEFAULT_WINDOW_MINUTES: i64 = 5;
const DEFAULT_MAX_CHAIN_LENGTH: usize = 5;
const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;
const MAX_RETAINED_ANALYSES: usize = 100;
const MAX_CONFIDENCE: f64 = 0.95;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// VM runs on a node.
    RunsOn,
    /// Guest uses a storage pool.
    UsesStorage,
    /// Guest uses a network.
    UsesNetwork,
    /// Node contains guests.
    Contains,
    /// Storage backed by physical disks.
    BackedBy,
    /// Container hosted on a runtime.
    Hosted,
    /// Generic dependency.
    DependsOn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRelationship {
    pub source_id: String,
    pub source_type: String,
    pub target_id: String,
    pub target_type: String,
    pub relationship: RelationshipType,
}

/// An event on a resource, as supplied by the event provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelatedEvent {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
    #[serde(default)]
    pub resource_type: String,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metric: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub id: String,
    pub trigger_event: RelatedEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<RelatedEvent>,
    pub related_events: Vec<RelatedEvent>,
    pub causal_chain: Vec<String>,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: String,
    pub timestamp: DateTime<Utc>,
}

/// Resource topology lookup.
pub trait TopologyProvider: Send + Sync {
    fn relationships(&self, resource_id: &str) -> Vec<ResourceRelationship>;
    fn resource_type(&self, resource_id: &str) -> String;
    fn resource_name(&self, resource_id: &str) -> String;
}

/// Recent-event lookup per resource.
pub trait EventProvider: Send + Sync {
    fn recent_events(&self, resource_id: &str, window: Duration) -> Vec<RelatedEvent>;
}

#[derive(Debug, Clone)]
pub struct RootCauseEngineConfig {
    /// Lookback for events on related resources (default 5 minutes).
    pub correlation_window: Duration,
    /// Maximum causal chain length including endpoints (default 5).
    pub max_chain_length: usize,
    /// Confidence floor for prompt output (default 0.5).
    pub min_confidence: f64,
}

impl Default for RootCauseEngineConfig {
    fn default() -> Self {
        Self {
            correlation_window: Duration::minutes(DEFAULT_WINDOW_MINUTES),
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }
}

// ==================== Engine ====================

struct Inner {
    topology: Option<Arc<dyn TopologyProvider>>,
    events: Option<Arc<dyn EventProvider>>,
    recent: Vec<RootCauseAnalysis>,
}

pub struct RootCauseEngine {
    config: RootCauseEngineConfig,
    inner: RwLock<Inner>,
}

impl RootCauseEngine {
    pub fn new(cfg: RootCauseEngineConfig) -> Self {
        let defaults = RootCauseEngineConfig::default();
        let config = RootCauseEngineConfig {
            correlation_window: if cfg.correlation_window <= Duration::zero() {
                defaults.correlation_window
            } else {
                cfg.correlation_window
            },
            max_chain_length: if cfg.max_chain_length == 0 {
                defaults.max_chain_length
            } else {
                cfg.max_chain_length
            },
            min_confidence: if cfg.min_confidence <= 0.0 {
                defaults.min_confidence
            } else {
                cfg.min_confidence
            },
        };

        Self {
            config,
            inner: RwLock::new(Inner {
                topology: None,
                events: None,
                recent: Vec::new(),
            }),
        }
    }

    pub fn set_topology_provider(&self, provider: Arc<dyn TopologyProvider>) {
        self.write().topology = Some(provider);
    }

    pub fn set_event_provider(&self, provider: Arc<dyn EventProvider>) {
        self.write().events = Some(provider);
    }

    /// Analyzes a trigger event against events on topologically related
    /// resources. Returns `None` until both providers are wired.
    pub fn analyze(&self, trigger: RelatedEvent) -> Option<RootCauseAnalysis> {
        let (topology, events) = {
            let inner = self.read();
            (inner.topology.clone()?, inner.events.clone()?)
        };

        let mut analysis = RootCauseAnalysis {
            id: ANALYSIS_IDS.next(),
            trigger_event: trigger.clone(),
            root_cause: None,
            related_events: Vec::new(),
            causal_chain: Vec::new(),
            confidence: 0.0,
            explanation: String::new(),
            timestamp: Utc::now(),
        };

        let relationships = topology.relationships(&trigger.resource_id);

        let mut related: Vec<RelatedEvent> = Vec::new();
        for rel in &relationships {
            // Relationships can point either way; follow the far end.
            let other_id = if rel.target_id == trigger.resource_id {
                &rel.source_id
            } else {
                &rel.target_id
            };

            for mut evt in events.recent_events(other_id, self.config.correlation_window) {
                if evt.timestamp < trigger.timestamp {
                    evt.resource_name = topology.resource_name(&evt.resource_id);
                    evt.resource_type = topology.resource_type(&evt.resource_id);
                    related.push(evt);
                }
            }
        }
        related.sort_by_key(|e| e.timestamp);
        analysis.related_events = related;

        if !analysis.related_events.is_empty() {
            if let Some(root_cause) =
                self.identify_root_cause(&trigger, &analysis.related_events, &relationships)
            {
                analysis.causal_chain =
                    self.build_causal_chain(&root_cause, &trigger, &analysis.related_events);
                analysis.root_cause = Some(root_cause);
                analysis.confidence = self.calculate_confidence(&analysis);
                analysis.explanation = generate_explanation(&analysis);
            }
        }

        {
            let mut inner = self.write();
            inner.recent.push(analysis.clone());
            if inner.recent.len() > MAX_RETAINED_ANALYSES {
                let excess = inner.recent.len() - MAX_RETAINED_ANALYSES;
                inner.recent.drain(..excess);
            }
        }

        Some(analysis)
    }

    fn identify_root_cause(
        &self,
        trigger: &RelatedEvent,
        related: &[RelatedEvent],
        relationships: &[ResourceRelationship],
    ) -> Option<RelatedEvent> {
        related
            .iter()
            .map(|event| (event, score_as_root_cause(event, trigger, relationships)))
            .filter(|(_, score)| *score > 0.0)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(event, _)| event.clone())
    }

    // Chain runs root cause, intermediates in time order, trigger.
    fn build_causal_chain(
        &self,
        root_cause: &RelatedEvent,
        trigger: &RelatedEvent,
        related: &[RelatedEvent],
    ) -> Vec<String> {
        let mut chain = vec![format_event_for_chain(root_cause)];

        for event in related {
            if event.resource_id == root_cause.resource_id {
                continue;
            }
            if event.timestamp > root_cause.timestamp && event.timestamp < trigger.timestamp {
                chain.push(format_event_for_chain(event));
                if chain.len() >= self.config.max_chain_length - 1 {
                    break;
                }
            }
        }

        chain.push(format_event_for_chain(trigger));
        chain
    }

    fn calculate_confidence(&self, analysis: &RootCauseAnalysis) -> f64 {
        let Some(root_cause) = &analysis.root_cause else {
            return 0.0;
        };

        let mut confidence: f64 = 0.5;

        if analysis.related_events.len() >= 3 {
            confidence += 0.1;
        }
        if analysis.related_events.len() >= 5 {
            confidence += 0.1;
        }

        if (2..=4).contains(&analysis.causal_chain.len()) {
            confidence += 0.1;
        }

        let time_diff = analysis.trigger_event.timestamp - root_cause.timestamp;
        if time_diff < Duration::minutes(1) {
            confidence += 0.15;
        } else if time_diff < Duration::minutes(2) {
            confidence += 0.1;
        }

        confidence.min(MAX_CONFIDENCE)
    }

    /// Most recent analyses, oldest first. `limit == 0` returns all retained.
    pub fn recent_analyses(&self, limit: usize) -> Vec<RootCauseAnalysis> {
        let inner = self.read();
        let limit = if limit == 0 || limit > inner.recent.len() {
            inner.recent.len()
        } else {
            limit
        };
        inner.recent[inner.recent.len() - limit..].to_vec()
    }

    /// Analyses where the resource is the trigger or the identified cause.
    pub fn analyses_for_resource(&self, resource_id: &str) -> Vec<RootCauseAnalysis> {
        let inner = self.read();
        inner
            .recent
            .iter()
            .filter(|a| {
                a.trigger_event.resource_id == resource_id
                    || a.root_cause
                        .as_ref()
                        .is_some_and(|rc| rc.resource_id == resource_id)
            })
            .cloned()
            .collect()
    }

    /// Markdown block of confident analyses involving the resource.
    pub fn format_for_context(&self, resource_id: &str) -> String {
        let analyses = self.analyses_for_resource(resource_id);
        if analyses.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n## Root Cause Analysis\n");
        out.push_str("Identified root causes for recent issues:\n\n");

        let mut any = false;
        for analysis in &analyses {
            if analysis.confidence < self.config.min_confidence {
                continue;
            }
            any = true;
            out.push_str(&format!(
                "- {} ({:.0}% confidence)\n",
                analysis.explanation,
                analysis.confidence * 100.0
            ));
            if !analysis.causal_chain.is_empty() {
                out.push_str("  Chain: ");
                out.push_str(&analysis.causal_chain.join(" -> "));
                out.push('\n');
            }
        }

        if !any {
            return String::new();
        }
        out
    }

    /// Patrol digest of confident analyses from the last hour.
    pub fn format_for_patrol(&self) -> String {
        let cutoff = Utc::now() - Duration::hours(1);
        let inner = self.read();

        let recent: Vec<&RootCauseAnalysis> = inner
            .recent
            .iter()
            .filter(|a| a.timestamp > cutoff && a.confidence >= self.config.min_confidence)
            .collect();

        if recent.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n## Root Cause Correlations\n");
        out.push_str("Recent issues with identified root causes:\n\n");

        for analysis in recent {
            out.push_str(&format!("### {}\n", analysis.trigger_event.description));
            out.push_str(&format!("Root cause: {}\n", analysis.explanation));
            out.push_str(&format!("Confidence: {:.0}%\n", analysis.confidence * 100.0));
            if !analysis.causal_chain.is_empty() {
                out.push_str("Causal chain:\n");
                for (i, step) in analysis.causal_chain.iter().enumerate() {
                    out.push_str(&format!("  {}. {}\n", i + 1, step));
                }
            }
            out.push('\n');
        }
        out
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ==================== Scoring ====================

fn score_as_root_cause(
    candidate: &RelatedEvent,
    trigger: &RelatedEvent,
    relationships: &[ResourceRelationship],
) -> f64 {
    let mut score = 0.0;

    for rel in relationships {
        if rel.source_id == candidate.resource_id || rel.target_id == candidate.resource_id {
            score += match rel.relationship {
                // Host problems cascade hardest into guests.
                RelationshipType::RunsOn => 0.4,
                RelationshipType::UsesStorage => 0.35,
                RelationshipType::BackedBy => 0.3,
                RelationshipType::Contains => 0.25,
                _ => 0.2,
            };
            break;
        }
    }

    score += match candidate.resource_type.as_str() {
        "node" => 0.25,
        "storage" => 0.2,
        "network" => 0.15,
        _ => 0.0,
    };

    let time_diff = trigger.timestamp - candidate.timestamp;
    if time_diff < Duration::seconds(30) {
        score += 0.2;
    } else if time_diff < Duration::minutes(1) {
        score += 0.15;
    } else if time_diff < Duration::minutes(2) {
        score += 0.1;
    }

    if !candidate.metric.is_empty()
        && !trigger.metric.is_empty()
        && is_related_metric(&candidate.metric, &trigger.metric)
    {
        score += 0.15;
    }

    score
}

fn metric_group(metric: &str) -> Option<u8> {
    match metric.to_lowercase().as_str() {
        "io" | "disk" | "storage" | "latency" => Some(0),
        "cpu" | "load" | "iowait" => Some(1),
        "memory" | "mem" | "swap" => Some(2),
        "network" | "net" | "bandwidth" => Some(3),
        // Unknown metrics never match, even against themselves.
        _ => None,
    }
}

fn is_related_metric(a: &str, b: &str) -> bool {
    match (metric_group(a), metric_group(b)) {
        (Some(ga), Some(gb)) => ga == gb,
        _ => false,
    }
}

fn format_event_for_chain(event: &RelatedEvent) -> String {
    let name = if event.resource_name.is_empty() {
        &event.resource_id
    } else {
        &event.resource_name
    };

    if !event.metric.is_empty() && event.value > 0.0 {
        format!("{} {} ({:.1})", name, event.metric, event.value)
    } else {
        format!("{}: {}", name, event.description)
    }
}

fn generate_explanation(analysis: &RootCauseAnalysis) -> String {
    let Some(root_cause) = &analysis.root_cause else {
        return "No clear root cause identified".to_string();
    };

    let root_name = if root_cause.resource_name.is_empty() {
        &root_cause.resource_id
    } else {
        &root_cause.resource_name
    };
    let trigger_name = if analysis.trigger_event.resource_name.is_empty() {
        &analysis.trigger_event.resource_id
    } else {
        &analysis.trigger_event.resource_name
    };

    let mut explanation = format!(
        "{} on {} was likely caused by {} on {}",
        analysis.trigger_event.description, trigger_name, root_cause.description, root_name
    );

    let time_diff = analysis.trigger_event.timestamp - root_cause.timestamp;
    if time_diff < Duration::minutes(1) {
        explanation.push_str(" (occurred within 1 minute)");
    } else {
        explanation.push_str(&format!(
            " (occurred {} minutes earlier)",
            time_diff.num_minutes()
        ));
    }

    explanation
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StaticTopology {
        relationships: Vec<ResourceRelationship>,
        types: HashMap<String, String>,
        names: HashMap<String, String>,
    }

    impl TopologyProvider for StaticTopology {
        fn relationships(&self, resource_id: &str) -> Vec<ResourceRelationship> {
            self.relationships
                .iter()
                .filter(|r| r.source_id == resource_id || r.target_id == resource_id)
                .cloned()
                .collect()
        }

        fn resource_type(&self, resource_id: &str) -> String {
            self.types.get(resource_id).cloned().unwrap_or_default()
        }

        fn resource_name(&self, resource_id: &str) -> String {
            self.names.get(resource_id).cloned().unwrap_or_default()
        }
    }

    struct StaticEvents {
        events: Mutex<HashMap<String, Vec<RelatedEvent>>>,
    }

    impl EventProvider for StaticEvents {
        fn recent_events(&self, resource_id: &str, _window: Duration) -> Vec<RelatedEvent> {
            self.events
                .lock()
                .unwrap()
                .get(resource_id)
                .cloned()
                .unwrap_or_default()
        }
    }

    fn related_event(
        resource_id: &str,
        resource_type: &str,
        metric: &str,
        description: &str,
        at: DateTime<Utc>,
    ) -> RelatedEvent {
        RelatedEvent {
            resource_id: resource_id.to_string(),
            resource_name: String::new(),
            resource_type: resource_type.to_string(),
            event_type: "alert".to_string(),
            metric: metric.to_string(),
            value: 0.0,
            timestamp: at,
            description: description.to_string(),
        }
    }

    fn vm_on_node_engine(node_events: Vec<RelatedEvent>) -> RootCauseEngine {
        let engine = RootCauseEngine::new(RootCauseEngineConfig::default());
        engine.set_topology_provider(Arc::new(StaticTopology {
            relationships: vec![ResourceRelationship {
                source_id: "vm-100".to_string(),
                source_type: "vm".to_string(),
                target_id: "node-1".to_string(),
                target_type: "node".to_string(),
                relationship: RelationshipType::RunsOn,
            }],
            types: HashMap::from([
                ("node-1".to_string(), "node".to_string()),
                ("vm-100".to_string(), "vm".to_string()),
            ]),
            names: HashMap::from([
                ("node-1".to_string(), "pve1".to_string()),
                ("vm-100".to_string(), "webserver".to_string()),
            ]),
        }));
        engine.set_event_provider(Arc::new(StaticEvents {
            events: Mutex::new(HashMap::from([("node-1".to_string(), node_events)])),
        }));
        engine
    }

    #[test]
    fn no_providers_returns_none() {
        let engine = RootCauseEngine::new(RootCauseEngineConfig::default());
        let trigger = related_event("vm-100", "vm", "cpu", "high CPU", Utc::now());
        assert!(engine.analyze(trigger).is_none());
    }

    #[test]
    fn host_event_identified_as_root_cause() {
        let now = Utc::now();
        let engine = vm_on_node_engine(vec![related_event(
            "node-1",
            "node",
            "iowait",
            "high IO wait",
            now - Duration::seconds(45),
        )]);

        let trigger = related_event("vm-100", "vm", "cpu", "high CPU", now);
        let analysis = engine.analyze(trigger).unwrap();

        let root_cause = analysis.root_cause.as_ref().unwrap();
        assert_eq!(root_cause.resource_id, "node-1");
        assert_eq!(root_cause.resource_name, "pve1");
        assert!(analysis.confidence >= 0.5);
        assert!(analysis
            .explanation
            .contains("high CPU on webserver was likely caused by high IO wait on pve1"));
        assert!(analysis.explanation.contains("(occurred within 1 minute)"));
        assert_eq!(analysis.causal_chain.len(), 2);
        assert_eq!(analysis.causal_chain[0], "pve1: high IO wait");
        assert_eq!(analysis.causal_chain[1], "webserver: high CPU");
    }

    #[test]
    fn events_after_trigger_are_ignored() {
        let now = Utc::now();
        let engine = vm_on_node_engine(vec![related_event(
            "node-1",
            "node",
            "iowait",
            "high IO wait",
            now + Duration::seconds(30),
        )]);

        let trigger = related_event("vm-100", "vm", "cpu", "high CPU", now);
        let analysis = engine.analyze(trigger).unwrap();
        assert!(analysis.root_cause.is_none());
        assert!(analysis.related_events.is_empty());
        assert_eq!(analysis.confidence, 0.0);
    }

    #[test]
    fn earliest_strongest_candidate_wins() {
        let now = Utc::now();
        let engine = vm_on_node_engine(vec![
            related_event(
                "node-1",
                "node",
                "memory",
                "memory pressure",
                now - Duration::minutes(3),
            ),
            // Closer in time and metric-related to the trigger.
            related_event(
                "node-1",
                "node",
                "load",
                "load spike",
                now - Duration::seconds(20),
            ),
        ]);

        let trigger = related_event("vm-100", "vm", "cpu", "high CPU", now);
        let analysis = engine.analyze(trigger).unwrap();
        assert_eq!(analysis.root_cause.unwrap().description, "load spike");
    }

    #[test]
    fn metric_affinity() {
        assert!(is_related_metric("cpu", "load"));
        assert!(is_related_metric("IO", "latency"));
        assert!(is_related_metric("mem", "swap"));
        assert!(!is_related_metric("cpu", "memory"));
        // Unknown metrics never match, not even themselves.
        assert!(!is_related_metric("temperature", "temperature"));
    }

    #[test]
    fn retained_analyses_are_bounded() {
        let now = Utc::now();
        let engine = vm_on_node_engine(vec![]);
        for i in 0..120 {
            let trigger = related_event("vm-100", "vm", "cpu", &format!("event {i}"), now);
            engine.analyze(trigger).unwrap();
        }

        let recent = engine.recent_analyses(0);
        assert_eq!(recent.len(), 100);
        assert_eq!(recent.last().unwrap().trigger_event.description, "event 119");
        assert_eq!(engine.recent_analyses(5).len(), 5);
    }

    #[test]
    fn context_block_requires_confidence() {
        let now = Utc::now();
        let engine = vm_on_node_engine(vec![related_event(
            "node-1",
            "node",
            "iowait",
            "high IO wait",
            now - Duration::seconds(45),
        )]);
        let trigger = related_event("vm-100", "vm", "cpu", "high CPU", now);
        engine.analyze(trigger).unwrap();

        let text = engine.format_for_context("vm-100");
        assert!(text.contains("## Root Cause Analysis"));
        assert!(text.contains("Chain: pve1: high IO wait -> webserver: high CPU"));

        let by_cause = engine.format_for_context("node-1");
        assert!(!by_cause.is_empty());

        assert!(engine.format_for_context("vm-999").is_empty());
    }

    #[test]
    fn patrol_digest_covers_last_hour() {
        let now = Utc::now();
        let engine = vm_on_node_engine(vec![related_event(
            "node-1",
            "node",
            "iowait",
            "high IO wait",
            now - Duration::seconds(45),
        )]);
        let trigger = related_event("vm-100", "vm", "cpu", "high CPU", now);
        engine.analyze(trigger).unwrap();

        let text = engine.format_for_patrol();
        assert!(text.contains("## Root Cause Correlations"));
        assert!(text.contains("### high CPU"));
        assert!(text.contains("Causal chain:\n  1. pve1: high IO wait\n  2. webserver: high CPU\n"));
    }
}
