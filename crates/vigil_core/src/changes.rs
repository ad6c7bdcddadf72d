//! Infrastructure change detection.
//!
//! Diffs successive resource snapshots into a typed, bounded change
//! journal so the patrol prompt can say "this VM was migrated two hours
//! ago" instead of reasoning from a single snapshot.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use vigil_common::ids::IdGenerator;
use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};
use vigil_common::resource::ResourceSnapshot;
use vigil_common::timefmt::{format_ago, format_bytes};

static CHANGE_IDS: IdGenerator = IdGenerator::new("chg");

const CHANGES_FILE: &str = "ai_changes.json";
const DEFAULT_MAX_CHANGES: usize = 1000;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Deleted,
    Config,
    Status,
    Migrated,
    Restarted,
    BackedUp,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Created => "created",
            ChangeType::Deleted => "deleted",
            ChangeType::Config => "config",
            ChangeType::Status => "status",
            ChangeType::Migrated => "migrated",
            ChangeType::Restarted => "restarted",
            ChangeType::BackedUp => "backed_up",
        }
    }
}

/// A detected change to one resource, with free-form before/after values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub resource_id: String,
    pub resource_type: String,
    pub resource_name: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub detected_at: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChangeDetectorConfig {
    /// Maximum changes retained (default 1000).
    pub max_changes: usize,
    /// Persistence directory; `None` keeps the detector in-memory only.
    pub data_dir: Option<PathBuf>,
}

// ==================== Detector ====================

struct State {
    previous: HashMap<String, ResourceSnapshot>,
    changes: Vec<Change>,
}

#[derive(Default)]
struct SaveFlags {
    running: bool,
    requested: bool,
}

struct Inner {
    state: RwLock<State>,
    data_dir: Option<PathBuf>,
    save_flags: Mutex<SaveFlags>,
}

pub struct ChangeDetector {
    inner: Arc<Inner>,
    max_changes: usize,
}

impl ChangeDetector {
    pub fn new(cfg: ChangeDetectorConfig) -> Self {
        let max_changes = if cfg.max_changes == 0 {
            DEFAULT_MAX_CHANGES
        } else {
            cfg.max_changes
        };

        let mut changes = Vec::new();
        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<Vec<Change>>(
                &dir.join(CHANGES_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(mut loaded)) => {
                    loaded.sort_by_key(|c| c.detected_at);
                    if loaded.len() > max_changes {
                        loaded.drain(..loaded.len() - max_changes);
                    }
                    if !loaded.is_empty() {
                        info!(count = loaded.len(), "loaded change history from disk");
                    }
                    changes = loaded;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load change history, starting fresh");
                }
            }
        }

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State {
                    previous: HashMap::new(),
                    changes,
                }),
                data_dir: cfg.data_dir,
                save_flags: Mutex::new(SaveFlags::default()),
            }),
            max_changes,
        }
    }

    /// Compares the current snapshot set to the previous one and records
    /// every detected change. A resource missing from `current` is treated
    /// as deleted and forgotten.
    pub fn detect_changes(&self, current: &[ResourceSnapshot]) -> Vec<Change> {
        let now = Utc::now();
        let mut new_changes = Vec::new();

        {
            let mut state = match self.inner.state.write() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };

            let mut current_ids: Vec<&str> = Vec::with_capacity(current.len());
            for snapshot in current {
                current_ids.push(&snapshot.id);

                match state.previous.get(&snapshot.id) {
                    None => new_changes.push(Change {
                        id: CHANGE_IDS.next(),
                        resource_id: snapshot.id.clone(),
                        resource_type: snapshot.resource_type.clone(),
                        resource_name: snapshot.name.clone(),
                        change_type: ChangeType::Created,
                        before: None,
                        after: Some(serde_json::to_value(snapshot).unwrap_or_default()),
                        detected_at: now,
                        description: format!(
                            "{} '{}' created",
                            snapshot.resource_type, snapshot.name
                        ),
                    }),
                    Some(prev) => diff_resource(prev, snapshot, now, &mut new_changes),
                }

                state.previous.insert(snapshot.id.clone(), snapshot.clone());
            }

            let deleted: Vec<String> = state
                .previous
                .keys()
                .filter(|id| !current_ids.contains(&id.as_str()))
                .cloned()
                .collect();
            for id in deleted {
                if let Some(prev) = state.previous.remove(&id) {
                    new_changes.push(Change {
                        id: CHANGE_IDS.next(),
                        resource_id: id,
                        resource_type: prev.resource_type.clone(),
                        resource_name: prev.name.clone(),
                        change_type: ChangeType::Deleted,
                        before: Some(serde_json::to_value(&prev).unwrap_or_default()),
                        after: None,
                        detected_at: now,
                        description: format!("{} '{}' deleted", prev.resource_type, prev.name),
                    });
                }
            }

            if !new_changes.is_empty() {
                state.changes.extend(new_changes.iter().cloned());
                let len = state.changes.len();
                if len > self.max_changes {
                    state.changes.drain(..len - self.max_changes);
                }
            }
        }

        if !new_changes.is_empty() {
            self.request_async_save();
        }

        new_changes
    }

    /// Most recent changes for one resource, newest first.
    pub fn changes_for_resource(&self, resource_id: &str, limit: usize) -> Vec<Change> {
        let state = match self.inner.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .changes
            .iter()
            .rev()
            .filter(|c| c.resource_id == resource_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recent changes across all resources, newest first.
    pub fn recent_changes(&self, limit: usize, since: DateTime<Utc>) -> Vec<Change> {
        let state = match self.inner.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state
            .changes
            .iter()
            .rev()
            .filter(|c| c.detected_at > since)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Bullet list of recent changes for the patrol prompt. Empty string
    /// when nothing changed.
    pub fn changes_summary(&self, since: DateTime<Utc>, max_changes: usize) -> String {
        let changes = self.recent_changes(max_changes, since);
        let now = Utc::now();
        let mut out = String::new();
        for change in &changes {
            out.push_str("- ");
            out.push_str(&change.description);
            out.push_str(" (");
            out.push_str(&format_ago(now - change.detected_at));
            out.push_str(" ago)\n");
        }
        out
    }

    /// Writes the journal out synchronously. Intended for shutdown paths;
    /// regular mutation relies on the coalescing writer.
    pub fn flush(&self) {
        if let Err(err) = save_to_disk(&self.inner) {
            warn!(error = %format!("{err:#}"), "failed to save change history");
        }
    }

    // A mutation sets the request flag; the first one also starts the
    // writer thread. The writer drains the flag in a loop, so bursts of
    // detect cycles coalesce into few writes and thread count stays at
    // most one.
    fn request_async_save(&self) {
        if self.inner.data_dir.is_none() {
            return;
        }

        {
            let mut flags = match self.inner.save_flags.lock() {
                Ok(flags) => flags,
                Err(poisoned) => poisoned.into_inner(),
            };
            flags.requested = true;
            if flags.running {
                return;
            }
            flags.running = true;
        }

        let inner = Arc::clone(&self.inner);
        std::thread::spawn(move || run_save_loop(&inner));
    }
}

fn run_save_loop(inner: &Inner) {
    loop {
        {
            let mut flags = match inner.save_flags.lock() {
                Ok(flags) => flags,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !flags.requested {
                flags.running = false;
                return;
            }
            flags.requested = false;
        }

        if let Err(err) = save_to_disk(inner) {
            warn!(error = %format!("{err:#}"), "failed to save change history");
        }
    }
}

fn save_to_disk(inner: &Inner) -> anyhow::Result<()> {
    let Some(dir) = &inner.data_dir else {
        return Ok(());
    };

    let bytes = {
        let state = match inner.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        persist::encode_pretty(&state.changes)?
    };

    persist::write_atomic(&dir.join(CHANGES_FILE), &bytes)
}

fn diff_resource(
    prev: &ResourceSnapshot,
    current: &ResourceSnapshot,
    now: DateTime<Utc>,
    out: &mut Vec<Change>,
) {
    let base = |change_type, before, after, description| Change {
        id: CHANGE_IDS.next(),
        resource_id: current.id.clone(),
        resource_type: current.resource_type.clone(),
        resource_name: current.name.clone(),
        change_type,
        before,
        after,
        detected_at: now,
        description,
    };

    if prev.status != current.status {
        out.push(base(
            ChangeType::Status,
            Some(json!(prev.status)),
            Some(json!(current.status)),
            format!(
                "'{}' status changed: {} → {}",
                current.name, prev.status, current.status
            ),
        ));
    }

    if !prev.node.is_empty() && !current.node.is_empty() && prev.node != current.node {
        out.push(base(
            ChangeType::Migrated,
            Some(json!(prev.node)),
            Some(json!(current.node)),
            format!(
                "'{}' migrated from {} to {}",
                current.name, prev.node, current.node
            ),
        ));
    }

    if prev.cpu_cores > 0 && current.cpu_cores > 0 && prev.cpu_cores != current.cpu_cores {
        let direction = if current.cpu_cores < prev.cpu_cores {
            "decreased"
        } else {
            "increased"
        };
        out.push(base(
            ChangeType::Config,
            Some(json!({ "cpu_cores": prev.cpu_cores })),
            Some(json!({ "cpu_cores": current.cpu_cores })),
            format!(
                "'{}' CPU {}: {} → {} cores",
                current.name, direction, prev.cpu_cores, current.cpu_cores
            ),
        ));
    }

    if prev.memory_bytes > 0 && current.memory_bytes > 0 {
        let pct = (current.memory_bytes - prev.memory_bytes) as f64 / prev.memory_bytes as f64;
        if pct.abs() > 0.05 {
            let direction = if current.memory_bytes < prev.memory_bytes {
                "decreased"
            } else {
                "increased"
            };
            out.push(base(
                ChangeType::Config,
                Some(json!({ "memory_bytes": prev.memory_bytes })),
                Some(json!({ "memory_bytes": current.memory_bytes })),
                format!(
                    "'{}' memory {}: {} → {}",
                    current.name,
                    direction,
                    format_bytes(prev.memory_bytes),
                    format_bytes(current.memory_bytes)
                ),
            ));
        }
    }

    if let (Some(prev_backup), Some(cur_backup)) = (prev.last_backup, current.last_backup) {
        if cur_backup > prev_backup {
            out.push(base(
                ChangeType::BackedUp,
                Some(json!(prev_backup)),
                Some(json!(cur_backup)),
                format!(
                    "'{}' backup completed at {}",
                    current.name,
                    cur_backup.format("%Y-%m-%d %H:%M")
                ),
            ));
        }
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(id: &str, name: &str, status: &str) -> ResourceSnapshot {
        ResourceSnapshot {
            id: id.to_string(),
            name: name.to_string(),
            resource_type: "vm".to_string(),
            status: status.to_string(),
            node: "pve-1".to_string(),
            cpu_cores: 2,
            memory_bytes: 4 << 30,
            snapshot_time: Utc::now(),
            ..Default::default()
        }
    }

    fn detector() -> ChangeDetector {
        ChangeDetector::new(ChangeDetectorConfig::default())
    }

    #[test]
    fn new_resource_is_created() {
        let d = detector();
        let changes = d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Created);
        assert_eq!(changes[0].description, "vm 'postgres' created");
    }

    #[test]
    fn status_change_detected() {
        let d = detector();
        d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);
        let changes = d.detect_changes(&[snapshot("vm-100", "postgres", "stopped")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Status);
        assert_eq!(
            changes[0].description,
            "'postgres' status changed: running → stopped"
        );
    }

    #[test]
    fn migration_detected() {
        let d = detector();
        d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);
        let mut moved = snapshot("vm-100", "postgres", "running");
        moved.node = "pve-2".to_string();
        let changes = d.detect_changes(&[moved]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::Migrated);
        assert_eq!(
            changes[0].description,
            "'postgres' migrated from pve-1 to pve-2"
        );
    }

    #[test]
    fn cpu_and_memory_config_changes() {
        let d = detector();
        d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);

        let mut resized = snapshot("vm-100", "postgres", "running");
        resized.cpu_cores = 4;
        resized.memory_bytes = 8 << 30;
        let changes = d.detect_changes(&[resized]);

        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .any(|c| c.description == "'postgres' CPU increased: 2 → 4 cores"));
        assert!(changes
            .iter()
            .any(|c| c.description == "'postgres' memory increased: 4 GB → 8 GB"));
    }

    #[test]
    fn small_memory_drift_ignored() {
        let d = detector();
        d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);

        let mut drifted = snapshot("vm-100", "postgres", "running");
        drifted.memory_bytes = (4 << 30) + (4 << 30) / 50; // +2%
        assert!(d.detect_changes(&[drifted]).is_empty());
    }

    #[test]
    fn backup_completion_detected() {
        let t0 = Utc::now() - Duration::days(1);
        let mut first = snapshot("vm-100", "postgres", "running");
        first.last_backup = Some(t0);

        let d = detector();
        d.detect_changes(&[first.clone()]);

        let mut second = first;
        second.last_backup = Some(t0 + Duration::hours(12));
        let changes = d.detect_changes(&[second]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].change_type, ChangeType::BackedUp);
    }

    #[test]
    fn empty_snapshot_set_deletes_everything() {
        let d = detector();
        d.detect_changes(&[
            snapshot("vm-100", "postgres", "running"),
            snapshot("vm-101", "redis", "running"),
        ]);

        let changes = d.detect_changes(&[]);
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.change_type == ChangeType::Deleted));
        assert!(d.detect_changes(&[]).is_empty());
    }

    #[test]
    fn journal_respects_cap() {
        let d = ChangeDetector::new(ChangeDetectorConfig {
            max_changes: 10,
            data_dir: None,
        });
        for i in 0..50 {
            let status = if i % 2 == 0 { "running" } else { "stopped" };
            d.detect_changes(&[snapshot("vm-100", "postgres", status)]);
        }
        let recent = d.recent_changes(100, Utc::now() - Duration::hours(1));
        assert_eq!(recent.len(), 10);
    }

    #[test]
    fn summary_lists_descriptions() {
        let d = detector();
        d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);
        let summary = d.changes_summary(Utc::now() - Duration::hours(1), 10);
        assert!(summary.contains("- vm 'postgres' created (just now ago)"));
    }

    #[test]
    fn journal_round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = ChangeDetectorConfig {
            max_changes: 0,
            data_dir: Some(dir.path().to_path_buf()),
        };

        let d = ChangeDetector::new(cfg.clone());
        d.detect_changes(&[snapshot("vm-100", "postgres", "running")]);
        d.flush();

        let reloaded = ChangeDetector::new(cfg);
        let changes = reloaded.recent_changes(10, Utc::now() - Duration::hours(1));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].description, "vm 'postgres' created");
    }

    #[test]
    fn oversize_history_file_starts_fresh() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CHANGES_FILE);
        std::fs::write(&path, vec![b'['; (MAX_HISTORY_FILE_BYTES + 1) as usize]).unwrap();

        let d = ChangeDetector::new(ChangeDetectorConfig {
            max_changes: 0,
            data_dir: Some(dir.path().to_path_buf()),
        });
        assert!(d
            .recent_changes(10, Utc::now() - Duration::days(365))
            .is_empty());
    }
}
