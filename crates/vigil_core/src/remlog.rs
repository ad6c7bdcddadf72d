//! Remediation outcome journal.
//!
//! Append-only record of fix attempts. When the patrol meets a problem it
//! has seen before, keyword similarity over past problem descriptions
//! surfaces what was tried and whether it worked.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use vigil_common::ids::IdGenerator;
use vigil_common::keywords;
use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};
use vigil_common::timefmt::{duration_ns, format_ago};

static RECORD_IDS: IdGenerator = IdGenerator::new("rem");

const REMEDIATIONS_FILE: &str = "ai_remediations.json";
const DEFAULT_MAX_RECORDS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemediationOutcome {
    Resolved,
    Partial,
    Failed,
    #[default]
    Unknown,
}

impl RemediationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationOutcome::Resolved => "resolved",
            RemediationOutcome::Partial => "partial",
            RemediationOutcome::Failed => "failed",
            RemediationOutcome::Unknown => "unknown",
        }
    }
}

/// One executed fix attempt and how it turned out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default)]
    pub finding_id: String,
    pub problem: String,
    pub action: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub outcome: RemediationOutcome,
    #[serde(default)]
    pub note: String,
    #[serde(with = "duration_ns", default = "Duration::zero")]
    pub duration: Duration,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct RemediationLogConfig {
    /// Maximum records retained (default 500).
    pub max_records: usize,
    /// Persistence directory; `None` keeps the log in-memory only.
    pub data_dir: Option<PathBuf>,
}

pub struct RemediationLog {
    records: RwLock<Vec<RemediationRecord>>,
    max_records: usize,
    data_dir: Option<PathBuf>,
}

impl RemediationLog {
    pub fn new(cfg: RemediationLogConfig) -> Self {
        let max_records = if cfg.max_records == 0 {
            DEFAULT_MAX_RECORDS
        } else {
            cfg.max_records
        };

        let mut records = Vec::new();
        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<Vec<RemediationRecord>>(
                &dir.join(REMEDIATIONS_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(mut loaded)) => {
                    loaded.sort_by_key(|r| r.timestamp);
                    if loaded.len() > max_records {
                        loaded.drain(..loaded.len() - max_records);
                    }
                    records = loaded;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load remediation log, starting fresh");
                }
            }
        }

        Self {
            records: RwLock::new(records),
            max_records,
            data_dir: cfg.data_dir,
        }
    }

    /// Appends a record, assigning an ID and timestamp when unset, and
    /// schedules a background save.
    pub fn log(&self, mut record: RemediationRecord) {
        if record.id.is_empty() {
            record.id = RECORD_IDS.next();
        }
        if record.timestamp == DateTime::<Utc>::default() {
            record.timestamp = Utc::now();
        }

        {
            let mut records = self.write_records();
            records.push(record);
            let len = records.len();
            if len > self.max_records {
                records.drain(..len - self.max_records);
            }
        }

        self.save_async();
    }

    /// Records whose problem text shares keywords with `problem`, ordered
    /// by match count then recency. Empty when the query has no keywords.
    pub fn get_similar(&self, problem: &str, limit: usize) -> Vec<RemediationRecord> {
        let query = keywords::extract(problem);
        if query.is_empty() {
            return Vec::new();
        }

        let records = self.read_records();
        let mut scored: Vec<(usize, &RemediationRecord)> = records
            .iter()
            .filter_map(|r| {
                let matches = keywords::count_matches(&query, &keywords::extract(&r.problem));
                (matches > 0).then_some((matches, r))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.timestamp.cmp(&a.1.timestamp)));
        scored
            .into_iter()
            .take(limit)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Similar records restricted to outcomes that actually helped.
    pub fn get_successful(&self, problem: &str, limit: usize) -> Vec<RemediationRecord> {
        self.get_similar(problem, self.max_records)
            .into_iter()
            .filter(|r| {
                matches!(
                    r.outcome,
                    RemediationOutcome::Resolved | RemediationOutcome::Partial
                )
            })
            .take(limit)
            .collect()
    }

    /// Most recent records for one resource, newest first.
    pub fn get_for_resource(&self, resource_id: &str, limit: usize) -> Vec<RemediationRecord> {
        let records = self.read_records();
        records
            .iter()
            .rev()
            .filter(|r| r.resource_id == resource_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Counts by outcome plus automatic/manual split for records newer
    /// than `since`.
    pub fn recent_stats(&self, since: DateTime<Utc>) -> HashMap<&'static str, usize> {
        let records = self.read_records();
        let mut stats: HashMap<&'static str, usize> = HashMap::from([
            ("resolved", 0),
            ("partial", 0),
            ("failed", 0),
            ("unknown", 0),
            ("automatic", 0),
            ("manual", 0),
        ]);

        for record in records.iter().filter(|r| r.timestamp > since) {
            *stats.entry(record.outcome.as_str()).or_default() += 1;
            let kind = if record.automatic { "automatic" } else { "manual" };
            *stats.entry(kind).or_default() += 1;
        }
        stats
    }

    /// Lifetime counts by outcome.
    pub fn stats(&self) -> HashMap<&'static str, usize> {
        let records = self.read_records();
        let mut stats: HashMap<&'static str, usize> = HashMap::new();
        for record in records.iter() {
            *stats.entry(record.outcome.as_str()).or_default() += 1;
        }
        stats
    }

    /// Markdown block of past attempts on a resource for the prompt.
    /// Empty string when there is no history.
    pub fn format_for_context(&self, resource_id: &str, limit: usize) -> String {
        let records = self.get_for_resource(resource_id, limit);
        if records.is_empty() {
            return String::new();
        }

        let now = Utc::now();
        let mut out = String::from("## Past Remediations\n");
        for record in &records {
            out.push_str(&format!(
                "- [{} ago] {}: {} (outcome: {})\n",
                format_ago(now - record.timestamp),
                record.problem,
                record.action,
                record.outcome.as_str()
            ));
            if !record.note.is_empty() {
                out.push_str(&format!("  Note: {}\n", record.note));
            }
        }
        out
    }

    /// Synchronous save for shutdown paths.
    pub fn flush(&self) {
        if let Err(err) = self.save_now() {
            warn!(error = %format!("{err:#}"), "failed to save remediation log");
        }
    }

    fn save_async(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let bytes = {
            let records = self.read_records();
            match persist::encode_pretty(&*records) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to encode remediation log");
                    return;
                }
            }
        };
        persist::spawn_write("remediation log", dir.join(REMEDIATIONS_FILE), bytes);
    }

    fn save_now(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let bytes = {
            let records = self.read_records();
            persist::encode_pretty(&*records)?
        };
        persist::write_atomic(&dir.join(REMEDIATIONS_FILE), &bytes)
    }

    fn read_records(&self) -> std::sync::RwLockReadGuard<'_, Vec<RemediationRecord>> {
        match self.records.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_records(&self) -> std::sync::RwLockWriteGuard<'_, Vec<RemediationRecord>> {
        match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(problem: &str, action: &str, outcome: RemediationOutcome) -> RemediationRecord {
        RemediationRecord {
            problem: problem.to_string(),
            action: action.to_string(),
            outcome,
            ..Default::default()
        }
    }

    #[test]
    fn log_assigns_id_and_timestamp() {
        let log = RemediationLog::new(RemediationLogConfig::default());
        log.log(record("p", "a", RemediationOutcome::Unknown));

        let all = log.get_similar("problem", 5);
        assert!(all.is_empty()); // "p" has no keywords

        let stats = log.stats();
        assert_eq!(stats["unknown"], 1);
    }

    #[test]
    fn similar_requires_keywords() {
        let log = RemediationLog::new(RemediationLogConfig::default());
        log.log(record("memory issue", "restart", RemediationOutcome::Resolved));
        assert!(log.get_similar("a b c", 5).is_empty());
        assert_eq!(log.get_similar("memory leak", 5).len(), 1);
    }

    #[test]
    fn similar_ranks_by_match_count() {
        let log = RemediationLog::new(RemediationLogConfig::default());
        log.log(record("disk almost full", "prune", RemediationOutcome::Resolved));
        log.log(record(
            "disk full on backup volume",
            "rotate",
            RemediationOutcome::Resolved,
        ));

        let similar = log.get_similar("backup disk full", 5);
        assert_eq!(similar.len(), 2);
        assert_eq!(similar[0].action, "rotate");
    }

    #[test]
    fn successful_filters_outcomes() {
        let log = RemediationLog::new(RemediationLogConfig::default());
        log.log(record("memory issue", "a1", RemediationOutcome::Partial));
        log.log(record("memory issue", "a2", RemediationOutcome::Failed));

        let success = log.get_successful("memory issue", 5);
        assert_eq!(success.len(), 1);
        assert_eq!(success[0].outcome, RemediationOutcome::Partial);
    }

    #[test]
    fn recent_stats_counts_outcomes_and_mode() {
        let log = RemediationLog::new(RemediationLogConfig::default());
        log.log(record("unknown thing", "a", RemediationOutcome::Unknown));
        let mut auto = record("disk full", "prune", RemediationOutcome::Resolved);
        auto.automatic = true;
        log.log(auto);

        let stats = log.recent_stats(Utc::now() - Duration::hours(1));
        assert_eq!(stats["unknown"], 1);
        assert_eq!(stats["resolved"], 1);
        assert_eq!(stats["automatic"], 1);
        assert_eq!(stats["manual"], 1);
    }

    #[test]
    fn format_includes_notes() {
        let log = RemediationLog::new(RemediationLogConfig::default());
        let mut r = record("issue keeps happening", "action", RemediationOutcome::Unknown);
        r.resource_id = "res-1".to_string();
        r.note = "needs kernel upgrade".to_string();
        log.log(r);

        let formatted = log.format_for_context("res-1", 5);
        assert!(formatted.contains("## Past Remediations"));
        assert!(formatted.contains("Note: needs kernel upgrade"));
        assert!(log.format_for_context("res-2", 5).is_empty());
    }

    #[test]
    fn cap_keeps_most_recent() {
        let log = RemediationLog::new(RemediationLogConfig {
            max_records: 3,
            data_dir: None,
        });
        for i in 0..10 {
            let mut r = record("disk full", &format!("action-{i}"), RemediationOutcome::Resolved);
            r.resource_id = "res-1".to_string();
            log.log(r);
        }
        let recent = log.get_for_resource("res-1", 10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].action, "action-9");
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = RemediationLogConfig {
            max_records: 0,
            data_dir: Some(dir.path().to_path_buf()),
        };

        let log = RemediationLog::new(cfg.clone());
        let mut r = record("disk full on pve-1", "pruned backups", RemediationOutcome::Resolved);
        r.resource_id = "storage-1".to_string();
        log.log(r);
        log.flush();

        let reloaded = RemediationLog::new(cfg);
        let before = log.format_for_context("storage-1", 5);
        let after = reloaded.format_for_context("storage-1", 5);
        assert_eq!(before, after);
    }
}
