//! Cross-run operational memory.
//!
//! Holds what the patrol has learned between runs: free-form memories by
//! type, per-resource notes, incident learnings and named operational
//! patterns. Relevance rises on recall and decays with disuse, so stale
//! memories age out of the prompt.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use vigil_common::ids::IdGenerator;
use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};

static MEMORY_IDS: IdGenerator = IdGenerator::new("mem");
static INCIDENT_MEMORY_IDS: IdGenerator = IdGenerator::new("inc-mem");
static PATTERN_MEMORY_IDS: IdGenerator = IdGenerator::new("pat-mem");

const CONTEXT_FILE: &str = "ai_context.json";
const DEFAULT_MAX_MEMORIES_PER_TYPE: usize = 1000;
const DEFAULT_MAX_RESOURCE_NOTES: usize = 20;
const DEFAULT_RETENTION_DAYS: i64 = 90;
const DEFAULT_DECAY_START_DAYS: i64 = 7;
const MIN_RELEVANCE: f64 = 0.1;
const USE_RELEVANCE_BOOST: f64 = 0.1;
const PATROL_RESOURCE_LIMIT: usize = 10;
const PATROL_INCIDENT_LIMIT: usize = 5;
const PATROL_PATTERN_LIMIT: usize = 5;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    /// Per-resource notes.
    Resource,
    /// Learnings from past incidents.
    Incident,
    /// Learned operational patterns.
    Pattern,
    /// User preferences.
    Preference,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Resource => "resource",
            MemoryType::Incident => "incident",
            MemoryType::Pattern => "pattern",
            MemoryType::Preference => "preference",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    #[serde(rename = "type")]
    pub memory_type: MemoryType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    pub content: String,
    /// "ai", "user" or "system".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u32,
    /// 0 to 1, boosted on recall, decays with disuse.
    pub relevance: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceMemory {
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    pub notes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patterns: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IncidentMemory {
    #[serde(default)]
    pub id: String,
    pub resource_id: String,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_cause: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resolution: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub lessons_learned: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternMemory {
    #[serde(default)]
    pub id: String,
    pub pattern: String,
    pub description: String,
    pub occurrences: usize,
    #[serde(default)]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub example: String,
}

#[derive(Debug, Clone, Default)]
pub struct ContextStoreConfig {
    pub data_dir: Option<PathBuf>,
    pub max_memories_per_type: Option<usize>,
    pub max_resource_notes: Option<usize>,
    pub retention_days: Option<i64>,
    /// Days of disuse before relevance starts decaying (default 7).
    pub relevance_decay_days: Option<i64>,
}

#[derive(Serialize, Deserialize, Default)]
struct ContextFile {
    memories: HashMap<MemoryType, HashMap<String, Memory>>,
    resource_memories: HashMap<String, ResourceMemory>,
    incident_memories: HashMap<String, IncidentMemory>,
    pattern_memories: HashMap<String, PatternMemory>,
}

// ==================== Store ====================

struct State {
    memories: HashMap<MemoryType, HashMap<String, Memory>>,
    resources: HashMap<String, ResourceMemory>,
    incidents: HashMap<String, IncidentMemory>,
    patterns: HashMap<String, PatternMemory>,
    dirty: bool,
}

pub struct ContextStore {
    state: RwLock<State>,
    max_memories_per_type: usize,
    max_resource_notes: usize,
    retention: Duration,
    decay_start: Duration,
    data_dir: Option<PathBuf>,
}

impl ContextStore {
    pub fn new(cfg: ContextStoreConfig) -> Self {
        let max_memories_per_type = match cfg.max_memories_per_type {
            Some(0) | None => DEFAULT_MAX_MEMORIES_PER_TYPE,
            Some(n) => n,
        };
        let max_resource_notes = match cfg.max_resource_notes {
            Some(0) | None => DEFAULT_MAX_RESOURCE_NOTES,
            Some(n) => n,
        };
        let retention = Duration::days(match cfg.retention_days {
            Some(d) if d > 0 => d,
            _ => DEFAULT_RETENTION_DAYS,
        });
        let decay_start = Duration::days(match cfg.relevance_decay_days {
            Some(d) if d > 0 => d,
            _ => DEFAULT_DECAY_START_DAYS,
        });

        let mut state = State {
            memories: HashMap::new(),
            resources: HashMap::new(),
            incidents: HashMap::new(),
            patterns: HashMap::new(),
            dirty: false,
        };

        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<ContextFile>(
                &dir.join(CONTEXT_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(loaded)) => {
                    state.memories = loaded.memories;
                    state.resources = loaded.resource_memories;
                    state.incidents = loaded.incident_memories;
                    state.patterns = loaded.pattern_memories;

                    let total =
                        state.resources.len() + state.incidents.len() + state.patterns.len();
                    if total > 0 {
                        info!(total_memories = total, "loaded context store from disk");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load context store, starting fresh");
                }
            }
        }

        Self {
            state: RwLock::new(state),
            max_memories_per_type,
            max_resource_notes,
            retention,
            decay_start,
            data_dir: cfg.data_dir,
        }
    }

    /// Stores a memory and returns its id. Resource and pattern memories
    /// about a resource also land in that resource's note list.
    pub fn remember(
        &self,
        resource_id: &str,
        content: &str,
        source: &str,
        memory_type: MemoryType,
        tags: Vec<String>,
    ) -> String {
        let now = Utc::now();
        let memory = Memory {
            id: MEMORY_IDS.next(),
            memory_type,
            resource_id: resource_id.to_string(),
            content: content.to_string(),
            source: source.to_string(),
            created_at: now,
            last_used: now,
            use_count: 1,
            relevance: 1.0,
            tags,
            related_ids: Vec::new(),
        };
        let id = memory.id.clone();

        {
            let mut state = self.write();
            state
                .memories
                .entry(memory_type)
                .or_default()
                .insert(id.clone(), memory);

            if !resource_id.is_empty()
                && matches!(memory_type, MemoryType::Resource | MemoryType::Pattern)
            {
                self.add_resource_note_locked(&mut state, resource_id, content);
            }
            state.dirty = true;
        }

        self.save_if_dirty();
        debug!(
            memory_id = %id,
            r#type = memory_type.as_str(),
            resource = resource_id,
            "stored new memory"
        );
        id
    }

    fn add_resource_note_locked(&self, state: &mut State, resource_id: &str, note: &str) {
        if resource_id.is_empty() || note.is_empty() {
            return;
        }

        let mem = state
            .resources
            .entry(resource_id.to_string())
            .or_insert_with(|| ResourceMemory {
                resource_id: resource_id.to_string(),
                resource_name: String::new(),
                resource_type: String::new(),
                notes: Vec::new(),
                patterns: Vec::new(),
                last_updated: Utc::now(),
            });

        if mem.notes.iter().any(|n| n == note) {
            return;
        }

        mem.notes.push(note.to_string());
        mem.last_updated = Utc::now();
        if mem.notes.len() > self.max_resource_notes {
            let excess = mem.notes.len() - self.max_resource_notes;
            mem.notes.drain(..excess);
        }
    }

    pub fn add_resource_note(
        &self,
        resource_id: &str,
        resource_name: &str,
        resource_type: &str,
        note: &str,
    ) {
        {
            let mut state = self.write();
            self.add_resource_note_locked(&mut state, resource_id, note);
            if let Some(mem) = state.resources.get_mut(resource_id) {
                if !resource_name.is_empty() {
                    mem.resource_name = resource_name.to_string();
                }
                if !resource_type.is_empty() {
                    mem.resource_type = resource_type.to_string();
                }
            }
            state.dirty = true;
        }
        self.save_if_dirty();
    }

    /// Stores an incident learning, mirrored as a recallable memory.
    pub fn add_incident_memory(&self, mut incident: IncidentMemory) -> String {
        if incident.id.is_empty() {
            incident.id = INCIDENT_MEMORY_IDS.next();
        }
        if incident.timestamp == DateTime::<Utc>::default() {
            incident.timestamp = Utc::now();
        }

        let mut content = incident.summary.clone();
        if !incident.root_cause.is_empty() {
            content.push_str(&format!(" Root cause: {}", incident.root_cause));
        }
        if !incident.resolution.is_empty() {
            content.push_str(&format!(" Resolution: {}", incident.resolution));
        }

        let id = incident.id.clone();
        {
            let mut state = self.write();
            let memory = Memory {
                id: MEMORY_IDS.next(),
                memory_type: MemoryType::Incident,
                resource_id: incident.resource_id.clone(),
                content,
                source: "system".to_string(),
                created_at: incident.timestamp,
                last_used: Utc::now(),
                use_count: 1,
                relevance: 1.0,
                tags: Vec::new(),
                related_ids: Vec::new(),
            };
            state
                .memories
                .entry(MemoryType::Incident)
                .or_default()
                .insert(memory.id.clone(), memory);
            state.incidents.insert(id.clone(), incident);
            state.dirty = true;
        }

        self.save_if_dirty();
        id
    }

    /// Stores a named pattern, or bumps an existing one with the same
    /// pattern string. Confidence follows the occurrence count.
    pub fn add_pattern_memory(&self, mut pattern: PatternMemory) {
        {
            let mut state = self.write();

            if let Some(existing) = state
                .patterns
                .values_mut()
                .find(|p| p.pattern == pattern.pattern)
            {
                existing.occurrences += 1;
                existing.last_seen = Utc::now();
                existing.confidence = pattern_confidence(existing.occurrences);
                state.dirty = true;
            } else {
                if pattern.id.is_empty() {
                    pattern.id = PATTERN_MEMORY_IDS.next();
                }
                pattern.last_seen = Utc::now();
                pattern.confidence = pattern_confidence(pattern.occurrences);
                state.patterns.insert(pattern.id.clone(), pattern);
                state.dirty = true;
            }
        }
        self.save_if_dirty();
    }

    /// Memories about a resource across the resource, incident and
    /// pattern families, most relevant first. Recalling counts as use and
    /// boosts relevance.
    pub fn recall(&self, resource_id: &str) -> Vec<Memory> {
        let mut result = Vec::new();
        {
            let mut state = self.write();
            for family in [
                MemoryType::Resource,
                MemoryType::Incident,
                MemoryType::Pattern,
            ] {
                if let Some(memories) = state.memories.get_mut(&family) {
                    for mem in memories.values_mut() {
                        if mem.resource_id == resource_id {
                            mark_used(mem);
                            result.push(mem.clone());
                        }
                    }
                }
            }
            if !result.is_empty() {
                state.dirty = true;
            }
        }

        result.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        result
    }

    pub fn recall_by_type(&self, memory_type: MemoryType, limit: usize) -> Vec<Memory> {
        let mut result = Vec::new();
        {
            let mut state = self.write();
            if let Some(memories) = state.memories.get_mut(&memory_type) {
                for mem in memories.values_mut() {
                    mark_used(mem);
                    result.push(mem.clone());
                }
            }
            if !result.is_empty() {
                state.dirty = true;
            }
        }

        result.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        if limit > 0 {
            result.truncate(limit);
        }
        result
    }

    pub fn resource_memory(&self, resource_id: &str) -> Option<ResourceMemory> {
        self.read().resources.get(resource_id).cloned()
    }

    /// Incident memories, most recent first.
    pub fn recent_incidents(&self, limit: usize) -> Vec<IncidentMemory> {
        let state = self.read();
        recent_incidents_of(&state, limit)
    }

    /// Patterns at or above the confidence threshold, most confident first.
    pub fn patterns(&self, min_confidence: f64) -> Vec<PatternMemory> {
        let state = self.read();
        patterns_of(&state, min_confidence)
    }

    /// Decays relevance of unused memories: 10% per week once the decay
    /// window has passed, floored at 0.1.
    pub fn decay_relevance(&self) {
        let now = Utc::now();
        let mut state = self.write();

        for memories in state.memories.values_mut() {
            for mem in memories.values_mut() {
                let age = now - mem.last_used;
                if age > self.decay_start {
                    let weeks = (age - self.decay_start).num_seconds() as f64 / (7.0 * 86_400.0);
                    mem.relevance = (mem.relevance - 0.1 * weeks).max(MIN_RELEVANCE);
                }
            }
        }
        state.dirty = true;
    }

    /// Removes memories past retention or below minimum relevance, and
    /// trims each family to its cap keeping the most relevant. Returns
    /// the number removed.
    pub fn cleanup(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut removed = 0;

        {
            let mut state = self.write();
            for memories in state.memories.values_mut() {
                let before = memories.len();
                memories.retain(|_, mem| {
                    mem.created_at >= cutoff && mem.relevance >= MIN_RELEVANCE
                });
                removed += before - memories.len();

                if memories.len() > self.max_memories_per_type {
                    let mut ranked: Vec<(f64, String)> = memories
                        .values()
                        .map(|m| (m.relevance, m.id.clone()))
                        .collect();
                    ranked.sort_by(|a, b| {
                        b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    let keep: std::collections::HashSet<String> = ranked
                        .into_iter()
                        .take(self.max_memories_per_type)
                        .map(|(_, id)| id)
                        .collect();
                    let before = memories.len();
                    memories.retain(|id, _| keep.contains(id));
                    removed += before - memories.len();
                }
            }
            if removed > 0 {
                state.dirty = true;
            }
        }

        if removed > 0 {
            self.save_if_dirty();
        }
        removed
    }

    /// Markdown digest for the patrol prompt: resource notes, recent
    /// incidents and confident patterns.
    pub fn format_for_patrol(&self) -> String {
        let state = self.read();
        let mut out = String::new();

        let mut noted: Vec<&ResourceMemory> = state
            .resources
            .values()
            .filter(|m| !m.notes.is_empty())
            .collect();
        if !noted.is_empty() {
            noted.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
            out.push_str("\n## Resource Notes\n");
            out.push_str("Notes about specific resources from previous observations:\n\n");
            for mem in noted.into_iter().take(PATROL_RESOURCE_LIMIT) {
                let name = if mem.resource_name.is_empty() {
                    &mem.resource_id
                } else {
                    &mem.resource_name
                };
                out.push_str(&format!("### {name}\n"));
                for note in &mem.notes {
                    out.push_str(&format!("- {note}\n"));
                }
            }
        }

        let incidents = recent_incidents_of(&state, PATROL_INCIDENT_LIMIT);
        if !incidents.is_empty() {
            out.push_str("\n## Recent Incidents\n");
            out.push_str("Past incidents that may be relevant:\n\n");
            for incident in &incidents {
                out.push_str(&format!(
                    "- {}: {}",
                    incident.timestamp.format("%Y-%m-%d"),
                    incident.summary
                ));
                if !incident.root_cause.is_empty() {
                    out.push_str(&format!(" (Root cause: {})", incident.root_cause));
                }
                out.push('\n');
            }
        }

        let patterns = patterns_of(&state, 0.5);
        if !patterns.is_empty() {
            out.push_str("\n## Learned Patterns\n");
            out.push_str("Operational patterns observed over time:\n\n");
            for pattern in patterns.iter().take(PATROL_PATTERN_LIMIT) {
                out.push_str(&format!(
                    "- {} ({:.0}% confidence)\n",
                    pattern.description,
                    pattern.confidence * 100.0
                ));
            }
        }

        out
    }

    /// Markdown block of notes and observed patterns for one resource.
    pub fn format_for_resource(&self, resource_id: &str) -> String {
        let state = self.read();
        let Some(mem) = state.resources.get(resource_id) else {
            return String::new();
        };
        if mem.notes.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n## Resource Memory\n");
        out.push_str(&format!("Notes about {}:\n", mem.resource_name));
        for note in &mem.notes {
            out.push_str(&format!("- {note}\n"));
        }

        if !mem.patterns.is_empty() {
            out.push_str("\nObserved patterns:\n");
            for pattern in &mem.patterns {
                out.push_str(&format!("- {pattern}\n"));
            }
        }

        out
    }

    /// Synchronous save for shutdown paths.
    pub fn flush(&self) {
        {
            let mut state = self.write();
            state.dirty = false;
        }
        if let Err(err) = self.save_now() {
            warn!(error = %format!("{err:#}"), "failed to save context store");
        }
    }

    fn save_if_dirty(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let bytes = {
            let mut state = self.write();
            if !state.dirty {
                return;
            }
            state.dirty = false;
            let file = ContextFile {
                memories: state.memories.clone(),
                resource_memories: state.resources.clone(),
                incident_memories: state.incidents.clone(),
                pattern_memories: state.patterns.clone(),
            };
            match persist::encode_pretty(&file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    // Leave dirty set so the next mutation retries the save.
                    state.dirty = true;
                    warn!(error = %format!("{err:#}"), "failed to encode context store");
                    return;
                }
            }
        };
        persist::spawn_write("context store", dir.join(CONTEXT_FILE), bytes);
    }

    fn save_now(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let bytes = {
            let state = self.read();
            let file = ContextFile {
                memories: state.memories.clone(),
                resource_memories: state.resources.clone(),
                incident_memories: state.incidents.clone(),
                pattern_memories: state.patterns.clone(),
            };
            persist::encode_pretty(&file)?
        };
        persist::write_atomic(&dir.join(CONTEXT_FILE), &bytes)
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

fn mark_used(mem: &mut Memory) {
    mem.last_used = Utc::now();
    mem.use_count += 1;
    mem.relevance = (mem.relevance + USE_RELEVANCE_BOOST).min(1.0);
}

fn recent_incidents_of(state: &State, limit: usize) -> Vec<IncidentMemory> {
    let mut result: Vec<IncidentMemory> = state.incidents.values().cloned().collect();
    result.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    if limit > 0 {
        result.truncate(limit);
    }
    result
}

fn patterns_of(state: &State, min_confidence: f64) -> Vec<PatternMemory> {
    let mut result: Vec<PatternMemory> = state
        .patterns
        .values()
        .filter(|p| p.confidence >= min_confidence)
        .cloned()
        .collect();
    result.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    result
}

// Confidence ladder: 0.15 per occurrence up to three, then 0.1 per
// additional occurrence, capped at 0.95.
fn pattern_confidence(occurrences: usize) -> f64 {
    if occurrences < 3 {
        return occurrences as f64 * 0.15;
    }
    (0.45 + 0.1 * (occurrences - 3) as f64).min(0.95)
}

// ==================== Tests ====================
