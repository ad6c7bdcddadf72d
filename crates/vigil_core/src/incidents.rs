//! Incident timelines.
//!
//! One incident per alert occurrence, carrying an append-only event
//! timeline (fired, acknowledged, analysis, commands, runbooks, notes).
//! Multiple incidents may exist per alert ID across time; lookups pick
//! the latest, or the one closest to a given start time.

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use vigil_common::alert::Alert;
use vigil_common::ids::IdGenerator;
use vigil_common::persist::{self, MAX_INCIDENT_FILE_BYTES};

static INCIDENT_IDS: IdGenerator = IdGenerator::new("inc");
static EVENT_IDS: IdGenerator = IdGenerator::new("inc-evt");

const INCIDENTS_FILE: &str = "ai_incidents.json";
const DEFAULT_MAX_INCIDENTS: usize = 500;
const DEFAULT_MAX_EVENTS: usize = 120;
const DEFAULT_MAX_AGE_DAYS: i64 = 90;
const START_MATCH_TOLERANCE_MINUTES: i64 = 10;
const COMMAND_OUTPUT_EXCERPT: usize = 500;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Open => "open",
            IncidentStatus::Resolved => "resolved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentEventType {
    AlertFired,
    AlertAcknowledged,
    AlertUnacknowledged,
    AlertResolved,
    AiAnalysis,
    Command,
    Runbook,
    Note,
}

impl IncidentEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentEventType::AlertFired => "alert_fired",
            IncidentEventType::AlertAcknowledged => "alert_acknowledged",
            IncidentEventType::AlertUnacknowledged => "alert_unacknowledged",
            IncidentEventType::AlertResolved => "alert_resolved",
            IncidentEventType::AiAnalysis => "ai_analysis",
            IncidentEventType::Command => "command",
            IncidentEventType::Runbook => "runbook",
            IncidentEventType::Note => "note",
        }
    }
}

/// A single timeline entry within an incident.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: IncidentEventType,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Map<String, Value>>,
}

/// An alert occurrence and its timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: String,
    pub alert_id: String,
    #[serde(default)]
    pub alert_type: String,
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub resource_id: String,
    #[serde(default)]
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub status: IncidentStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ack_user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<IncidentEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct IncidentStoreConfig {
    pub data_dir: Option<PathBuf>,
    pub max_incidents: usize,
    pub max_events_per_incident: usize,
    pub max_age_days: i64,
}

// ==================== Store ====================

pub struct IncidentStore {
    incidents: RwLock<Vec<Incident>>,
    max_incidents: usize,
    max_events: usize,
    max_age: Duration,
    data_dir: Option<PathBuf>,
}

impl IncidentStore {
    pub fn new(cfg: IncidentStoreConfig) -> Self {
        let max_incidents = if cfg.max_incidents == 0 {
            DEFAULT_MAX_INCIDENTS
        } else {
            cfg.max_incidents
        };
        let max_events = if cfg.max_events_per_incident == 0 {
            DEFAULT_MAX_EVENTS
        } else {
            cfg.max_events_per_incident
        };
        let max_age = Duration::days(if cfg.max_age_days <= 0 {
            DEFAULT_MAX_AGE_DAYS
        } else {
            cfg.max_age_days
        });

        let mut incidents = Vec::new();
        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<Vec<Incident>>(
                &dir.join(INCIDENTS_FILE),
                MAX_INCIDENT_FILE_BYTES,
            ) {
                Ok(Some(loaded)) => {
                    incidents = loaded;
                    trim(&mut incidents, max_age, max_incidents);
                    if !incidents.is_empty() {
                        info!(count = incidents.len(), "loaded incident history from disk");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load incident history, starting fresh");
                }
            }
        }

        Self {
            incidents: RwLock::new(incidents),
            max_incidents,
            max_events,
            max_age,
            data_dir: cfg.data_dir,
        }
    }

    /// Opens an incident for a fired alert, or refreshes the mutable
    /// fields of the already-open one. Re-fires while open never append a
    /// second `alert_fired` event.
    pub fn record_alert_fired(&self, alert: &Alert) {
        {
            let mut incidents = self.write();
            match find_open(&incidents, &alert.id) {
                Some(idx) => update_from_alert(&mut incidents[idx], alert),
                None => {
                    let mut incident = incident_from_alert(alert);
                    let mut details = Map::new();
                    details.insert("type".into(), Value::from(alert.alert_type.clone()));
                    details.insert("level".into(), Value::from(alert.level.clone()));
                    details.insert("value".into(), Value::from(alert.value));
                    details.insert("threshold".into(), Value::from(alert.threshold));
                    self.add_event(
                        &mut incident,
                        IncidentEventType::AlertFired,
                        format_alert_summary(alert),
                        Some(details),
                    );
                    incidents.push(incident);
                }
            }
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    pub fn record_alert_acknowledged(&self, alert: &Alert, user: &str) {
        {
            let mut incidents = self.write();
            let idx = self.ensure_incident(&mut incidents, alert);

            incidents[idx].acknowledged = true;
            incidents[idx].ack_time = alert.ack_time.or_else(|| Some(Utc::now()));
            incidents[idx].ack_user = user.to_string();

            let mut details = Map::new();
            details.insert("user".into(), Value::from(user));
            let incident = &mut incidents[idx];
            self.add_event(
                incident,
                IncidentEventType::AlertAcknowledged,
                "Alert acknowledged".to_string(),
                Some(details),
            );
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    pub fn record_alert_unacknowledged(&self, alert: &Alert, user: &str) {
        {
            let mut incidents = self.write();
            let idx = self.ensure_incident(&mut incidents, alert);

            incidents[idx].acknowledged = false;
            incidents[idx].ack_time = None;
            incidents[idx].ack_user = String::new();

            let mut details = Map::new();
            details.insert("user".into(), Value::from(user));
            let incident = &mut incidents[idx];
            self.add_event(
                incident,
                IncidentEventType::AlertUnacknowledged,
                "Alert unacknowledged".to_string(),
                Some(details),
            );
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    /// Closes the latest open incident for the alert (creating one if none
    /// exists) at `resolved_at`, defaulting to now.
    pub fn record_alert_resolved(&self, alert: &Alert, resolved_at: Option<DateTime<Utc>>) {
        {
            let mut incidents = self.write();
            let idx = match find_open(&incidents, &alert.id) {
                Some(idx) => idx,
                None => {
                    incidents.push(incident_from_alert(alert));
                    incidents.len() - 1
                }
            };

            let at = resolved_at.unwrap_or_else(Utc::now);
            incidents[idx].status = IncidentStatus::Resolved;
            incidents[idx].closed_at = Some(at);

            let mut details = Map::new();
            details.insert("resolved_at".into(), Value::from(at.to_rfc3339()));
            let incident = &mut incidents[idx];
            self.add_event(
                incident,
                IncidentEventType::AlertResolved,
                "Alert resolved".to_string(),
                Some(details),
            );
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    /// Appends an analysis event to the latest incident for the alert,
    /// creating a bare incident when none exists.
    pub fn record_analysis(&self, alert_id: &str, summary: &str, details: Option<Map<String, Value>>) {
        if alert_id.is_empty() {
            return;
        }
        {
            let mut incidents = self.write();
            let idx = Self::latest_or_bare(&mut incidents, alert_id);
            let summary = if summary.is_empty() {
                "Patrol analysis completed".to_string()
            } else {
                summary.to_string()
            };
            let incident = &mut incidents[idx];
            self.add_event(incident, IncidentEventType::AiAnalysis, summary, details);
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    /// Appends a command execution event; output is excerpted to 500 chars.
    pub fn record_command(
        &self,
        alert_id: &str,
        command: &str,
        success: bool,
        output: &str,
        details: Option<Map<String, Value>>,
    ) {
        if alert_id.is_empty() || command.is_empty() {
            return;
        }
        {
            let mut incidents = self.write();
            let idx = Self::latest_or_bare(&mut incidents, alert_id);

            let mut details = details.unwrap_or_default();
            details.insert("command".into(), Value::from(command));
            details.insert("success".into(), Value::from(success));
            if !output.is_empty() {
                details.insert(
                    "output_excerpt".into(),
                    Value::from(truncate_output(output, COMMAND_OUTPUT_EXCERPT)),
                );
            }

            let status = if success { "succeeded" } else { "failed" };
            let summary = format!("Command {status}: {command}");
            let incident = &mut incidents[idx];
            self.add_event(incident, IncidentEventType::Command, summary, Some(details));
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    /// Appends a runbook execution event.
    pub fn record_runbook(
        &self,
        alert_id: &str,
        runbook_id: &str,
        title: &str,
        outcome: &str,
        automatic: bool,
        message: &str,
    ) {
        if alert_id.is_empty() || runbook_id.is_empty() {
            return;
        }
        {
            let mut incidents = self.write();
            let idx = Self::latest_or_bare(&mut incidents, alert_id);

            let mut details = Map::new();
            details.insert("runbook_id".into(), Value::from(runbook_id));
            details.insert("outcome".into(), Value::from(outcome));
            details.insert("automatic".into(), Value::from(automatic));
            if !message.is_empty() {
                details.insert("message".into(), Value::from(message));
            }

            let summary = format!("Runbook {title} ({outcome})");
            let incident = &mut incidents[idx];
            self.add_event(incident, IncidentEventType::Runbook, summary, Some(details));
            trim(&mut incidents, self.max_age, self.max_incidents);
        }
        self.save_async();
    }

    /// Appends a user note, addressed by incident ID or alert ID. Returns
    /// false for blank notes or when no incident matches.
    pub fn record_note(&self, alert_id: &str, incident_id: &str, note: &str, user: &str) -> bool {
        let note = note.trim();
        if note.is_empty() {
            return false;
        }

        let recorded = {
            let mut incidents = self.write();
            let idx = if !incident_id.is_empty() {
                incidents.iter().rposition(|i| i.id == incident_id)
            } else if !alert_id.is_empty() {
                find_latest(&incidents, alert_id)
            } else {
                None
            };

            match idx {
                None => false,
                Some(idx) => {
                    let summary = if user.is_empty() {
                        "Note added".to_string()
                    } else {
                        format!("Note added by {user}")
                    };
                    let mut details = Map::new();
                    details.insert("note".into(), Value::from(note));
                    details.insert("user".into(), Value::from(user));
                    let incident = &mut incidents[idx];
                    self.add_event(incident, IncidentEventType::Note, summary, Some(details));
                    trim(&mut incidents, self.max_age, self.max_incidents);
                    true
                }
            }
        };

        if recorded {
            self.save_async();
        }
        recorded
    }

    /// The most recent incident for the alert, cloned.
    pub fn timeline_by_alert(&self, alert_id: &str) -> Option<Incident> {
        if alert_id.is_empty() {
            return None;
        }
        let incidents = self.read();
        find_latest(&incidents, alert_id).map(|idx| incidents[idx].clone())
    }

    /// The incident whose opening time is closest to `started_at`, within
    /// a 10-minute tolerance.
    pub fn timeline_by_alert_at(
        &self,
        alert_id: &str,
        started_at: Option<DateTime<Utc>>,
    ) -> Option<Incident> {
        if alert_id.is_empty() {
            return None;
        }
        let Some(started_at) = started_at else {
            return self.timeline_by_alert(alert_id);
        };

        let incidents = self.read();
        let best = incidents
            .iter()
            .filter(|i| i.alert_id == alert_id)
            .map(|i| {
                let delta = (i.opened_at - started_at).abs();
                (delta, i)
            })
            .min_by_key(|(delta, _)| *delta)?;

        if best.0 > Duration::minutes(START_MATCH_TOLERANCE_MINUTES) {
            return None;
        }
        Some(best.1.clone())
    }

    /// Recent incidents for a resource, newest first.
    pub fn incidents_for_resource(&self, resource_id: &str, limit: usize) -> Vec<Incident> {
        if resource_id.is_empty() {
            return Vec::new();
        }
        let incidents = self.read();
        incidents
            .iter()
            .rev()
            .filter(|i| i.resource_id == resource_id)
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect()
    }

    /// Condensed timeline for one alert, for prompt injection.
    pub fn format_for_alert(&self, alert_id: &str, max_events: usize) -> String {
        let Some(incident) = self.timeline_by_alert(alert_id) else {
            return String::new();
        };

        let mut out = String::from("\n\n## Incident Memory\n");
        out.push_str(&format!(
            "Alert incident for {} ({}, {})\n",
            incident.resource_name, incident.alert_type, incident.level
        ));
        out.push_str(&format!("Status: {}\n", incident.status.as_str()));

        let events = if max_events > 0 && incident.events.len() > max_events {
            &incident.events[incident.events.len() - max_events..]
        } else {
            &incident.events[..]
        };
        for event in events {
            out.push_str(&format!(
                "- {}: {}\n",
                event.timestamp.to_rfc3339(),
                event.summary
            ));
        }
        out
    }

    /// Condensed incident history for one resource.
    pub fn format_for_resource(&self, resource_id: &str, limit: usize) -> String {
        let incidents = self.incidents_for_resource(resource_id, limit);
        if incidents.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n\n## Incident Memory\n");
        out.push_str("Recent incidents for this resource:\n");
        for incident in &incidents {
            out.push_str(&format!(
                "- {}: {}",
                incident.opened_at.to_rfc3339(),
                incident.alert_type
            ));
            if !incident.level.is_empty() {
                out.push_str(&format!(" ({})", incident.level));
            }
            out.push_str(&format!(" - {}\n", display_status(incident)));
        }
        out
    }

    /// Condensed incident history across all resources for patrol prompts.
    pub fn format_for_patrol(&self, limit: usize) -> String {
        let limit = if limit == 0 { 8 } else { limit };
        let incidents = self.read();
        if incidents.is_empty() {
            return String::new();
        }

        let mut out = String::from("\n\n## Incident Memory\n");
        out.push_str("Recent incidents across infrastructure:\n");

        for incident in incidents.iter().rev().take(limit) {
            out.push_str(&format!("- {}: ", incident.opened_at.to_rfc3339()));
            if !incident.resource_name.is_empty() {
                out.push_str(&incident.resource_name);
                out.push_str(" - ");
            }
            out.push_str(&incident.alert_type);
            if !incident.level.is_empty() {
                out.push_str(&format!(" ({})", incident.level));
            }
            out.push_str(&format!(" - {}", display_status(incident)));
            if let Some(last) = incident.events.last() {
                out.push_str(&format!(" - last: {}", truncate_output(&last.summary, 80)));
            } else if !incident.message.is_empty() {
                out.push_str(&format!(" - {}", truncate_output(&incident.message, 80)));
            }
            out.push('\n');
        }
        out
    }

    /// Synchronous save for shutdown paths.
    pub fn flush(&self) {
        if let Err(err) = self.save_now() {
            warn!(error = %format!("{err:#}"), "failed to save incident history");
        }
    }

    fn ensure_incident(&self, incidents: &mut Vec<Incident>, alert: &Alert) -> usize {
        let idx = match find_latest(incidents, &alert.id) {
            Some(idx) => idx,
            None => {
                incidents.push(incident_from_alert(alert));
                incidents.len() - 1
            }
        };
        update_from_alert(&mut incidents[idx], alert);
        idx
    }

    fn latest_or_bare(incidents: &mut Vec<Incident>, alert_id: &str) -> usize {
        match find_latest(incidents, alert_id) {
            Some(idx) => idx,
            None => {
                incidents.push(Incident {
                    id: INCIDENT_IDS.next(),
                    alert_id: alert_id.to_string(),
                    alert_type: String::new(),
                    level: String::new(),
                    resource_id: String::new(),
                    resource_name: String::new(),
                    resource_type: String::new(),
                    node: String::new(),
                    instance: String::new(),
                    message: String::new(),
                    status: IncidentStatus::Open,
                    opened_at: Utc::now(),
                    closed_at: None,
                    acknowledged: false,
                    ack_user: String::new(),
                    ack_time: None,
                    events: Vec::new(),
                });
                incidents.len() - 1
            }
        }
    }

    fn add_event(
        &self,
        incident: &mut Incident,
        event_type: IncidentEventType,
        summary: String,
        details: Option<Map<String, Value>>,
    ) {
        let summary = if summary.is_empty() {
            event_type.as_str().to_string()
        } else {
            summary
        };
        incident.events.push(IncidentEvent {
            id: EVENT_IDS.next(),
            event_type,
            timestamp: Utc::now(),
            summary,
            details,
        });
        if self.max_events > 0 && incident.events.len() > self.max_events {
            let excess = incident.events.len() - self.max_events;
            incident.events.drain(..excess);
        }
    }

    fn save_async(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let bytes = {
            let incidents = self.read();
            match persist::encode_pretty(&*incidents) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to encode incident history");
                    return;
                }
            }
        };
        persist::spawn_write("incident history", dir.join(INCIDENTS_FILE), bytes);
    }

    fn save_now(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let bytes = {
            let incidents = self.read();
            persist::encode_pretty(&*incidents)?
        };
        persist::write_atomic(&dir.join(INCIDENTS_FILE), &bytes)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Incident>> {
        match self.incidents.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Incident>> {
        match self.incidents.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// ==================== Helpers ====================

fn incident_from_alert(alert: &Alert) -> Incident {
    Incident {
        id: INCIDENT_IDS.next(),
        alert_id: alert.id.clone(),
        alert_type: alert.alert_type.clone(),
        level: alert.level.clone(),
        resource_id: alert.resource_id.clone(),
        resource_name: alert.resource_name.clone(),
        resource_type: String::new(),
        node: alert.node.clone(),
        instance: alert.instance.clone(),
        message: alert.message.clone(),
        status: IncidentStatus::Open,
        opened_at: alert.start_time.unwrap_or_else(Utc::now),
        closed_at: None,
        acknowledged: alert.acknowledged,
        ack_user: alert.ack_user.clone(),
        ack_time: alert.ack_time,
        events: Vec::new(),
    }
}

fn update_from_alert(incident: &mut Incident, alert: &Alert) {
    incident.alert_type = alert.alert_type.clone();
    incident.level = alert.level.clone();
    incident.resource_id = alert.resource_id.clone();
    incident.resource_name = alert.resource_name.clone();
    incident.node = alert.node.clone();
    incident.instance = alert.instance.clone();
    incident.message = alert.message.clone();
    incident.acknowledged = alert.acknowledged;
    incident.ack_user = alert.ack_user.clone();
    incident.ack_time = alert.ack_time;
}

fn find_open(incidents: &[Incident], alert_id: &str) -> Option<usize> {
    if alert_id.is_empty() {
        return None;
    }
    incidents
        .iter()
        .rposition(|i| i.alert_id == alert_id && i.status == IncidentStatus::Open)
}

fn find_latest(incidents: &[Incident], alert_id: &str) -> Option<usize> {
    if alert_id.is_empty() {
        return None;
    }
    incidents.iter().rposition(|i| i.alert_id == alert_id)
}

fn trim(incidents: &mut Vec<Incident>, max_age: Duration, max_incidents: usize) {
    let cutoff = Utc::now() - max_age;
    incidents.retain(|i| i.closed_at.unwrap_or(i.opened_at) > cutoff);

    if max_incidents > 0 && incidents.len() > max_incidents {
        incidents.sort_by_key(|i| i.opened_at);
        let excess = incidents.len() - max_incidents;
        incidents.drain(..excess);
    }
}

fn display_status(incident: &Incident) -> &'static str {
    if incident.acknowledged && incident.status == IncidentStatus::Open {
        "acknowledged"
    } else {
        incident.status.as_str()
    }
}

fn truncate_output(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push_str("...");
    out
}

fn format_alert_summary(alert: &Alert) -> String {
    if alert.value > 0.0 || alert.threshold > 0.0 {
        format!(
            "Alert triggered: {} ({} {:.1} >= {:.1})",
            alert.alert_type, alert.level, alert.value, alert.threshold
        )
    } else {
        format!("Alert triggered: {} ({})", alert.alert_type, alert.level)
    }
}

// ==================== Tests ====================
