//! Human-in-the-loop command approval.
//!
//! Commands the assistant wants to run are parked here until a user
//! approves or denies them. Approvals are single-use and bound to the
//! exact command and target through a SHA-256 hash, so an approval id
//! cannot be replayed for a different command. Conversation state can be
//! parked alongside so the flow resumes after the decision.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};
use vigil_common::safety::{self, CommandRisk};

const APPROVALS_FILE: &str = "ai_approvals.json";
const EXECUTIONS_FILE: &str = "ai_executions.json";
const DEFAULT_TIMEOUT_MINUTES: i64 = 5;
const DEFAULT_MAX_PENDING: usize = 100;
const DECIDED_RETENTION_HOURS: i64 = 24;
const SAVE_DEBOUNCE: StdDuration = StdDuration::from_secs(5);
const CLEANUP_INTERVAL: StdDuration = StdDuration::from_secs(60);
const LOG_COMMAND_CHARS: usize = 50;

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    #[default]
    Pending,
    Approved,
    Denied,
    Expired,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Denied => "denied",
            ApprovalStatus::Expired => "expired",
        }
    }
}

/// A command awaiting a user decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    #[serde(default)]
    pub id: String,
    /// Groups related approvals of one assistant execution.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub execution_id: String,
    /// Tool call id from the LLM turn that requested the command.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_id: String,
    pub command: String,
    pub target_type: String,
    pub target_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_name: String,
    /// Why the assistant wants to run this.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<CommandRisk>,
    #[serde(default)]
    pub status: ApprovalStatus,
    #[serde(default)]
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub decided_by: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deny_reason: String,
    /// SHA-256 over command, target type and target id; replay protection.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command_hash: String,
    /// Set once the approval has been used. Approvals are single-use.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub consumed: bool,
}

/// Parked conversation state, resumed after the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionState {
    pub id: String,
    #[serde(default)]
    pub original_request: Map<String, Value>,
    #[serde(default)]
    pub messages: Vec<Map<String, Value>>,
    #[serde(default)]
    pub pending_tool_call: Map<String, Value>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApprovalStats {
    pub pending: usize,
    pub approved: usize,
    pub denied: usize,
    pub expired: usize,
    pub executions: usize,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(String),
    #[error("approval request is not pending (status: {status})")]
    NotPending { status: ApprovalStatus },
    #[error("approval request is not approved (status: {status})")]
    NotApproved { status: ApprovalStatus },
    #[error("approval request {0} has expired")]
    Expired(String),
    #[error("approval request {0} has already been consumed")]
    AlreadyConsumed(String),
    #[error("approval command mismatch: this approval is for a different command or target")]
    CommandMismatch,
    #[error("maximum pending approvals ({0}) reached")]
    CapacityReached(usize),
    #[error("invalid target id: {0}")]
    InvalidTargetId(String),
    #[error("execution id is required")]
    MissingExecutionId,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalStoreConfig {
    /// `None` disables persistence (tests, ephemeral flows).
    pub data_dir: Option<PathBuf>,
    /// How long approvals and executions stay valid (default 5 minutes).
    pub default_timeout: Option<Duration>,
    /// Maximum concurrently pending approvals (default 100).
    pub max_pending: Option<usize>,
}

// ==================== Store ====================

struct State {
    approvals: HashMap<String, ApprovalRequest>,
    executions: HashMap<String, ExecutionState>,
}

struct SaveState {
    pending: bool,
}

struct Inner {
    state: RwLock<State>,
    save: Mutex<SaveState>,
    data_dir: Option<PathBuf>,
    default_timeout: Duration,
    max_pending: usize,
}

#[derive(Clone)]
pub struct ApprovalStore {
    inner: Arc<Inner>,
}

impl ApprovalStore {
    pub fn new(cfg: ApprovalStoreConfig) -> Self {
        let default_timeout = cfg
            .default_timeout
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(|| Duration::minutes(DEFAULT_TIMEOUT_MINUTES));
        let max_pending = match cfg.max_pending {
            Some(0) | None => DEFAULT_MAX_PENDING,
            Some(n) => n,
        };

        let mut state = State {
            approvals: HashMap::new(),
            executions: HashMap::new(),
        };

        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<Vec<ApprovalRequest>>(
                &dir.join(APPROVALS_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(approvals)) => {
                    for a in approvals {
                        state.approvals.insert(a.id.clone(), a);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load approvals, starting fresh");
                }
            }
            match persist::load_json_capped::<Vec<ExecutionState>>(
                &dir.join(EXECUTIONS_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(executions)) => {
                    for e in executions {
                        state.executions.insert(e.id.clone(), e);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load executions, starting fresh");
                }
            }
        }

        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                save: Mutex::new(SaveState { pending: false }),
                data_dir: cfg.data_dir,
                default_timeout,
                max_pending,
            }),
        }
    }

    /// Parks a command for approval. Fills in id, timestamps, risk level
    /// and the binding command hash when they are unset.
    pub fn create_approval(
        &self,
        mut req: ApprovalRequest,
    ) -> Result<ApprovalRequest, ApprovalError> {
        if !req.target_id.is_empty() && !safety::TARGET_ID_RE.is_match(&req.target_id) {
            return Err(ApprovalError::InvalidTargetId(req.target_id));
        }

        let stored = {
            let mut state = self.inner.write();

            let pending = state
                .approvals
                .values()
                .filter(|a| a.status == ApprovalStatus::Pending)
                .count();
            if pending >= self.inner.max_pending {
                return Err(ApprovalError::CapacityReached(self.inner.max_pending));
            }

            if req.id.is_empty() {
                req.id = Uuid::new_v4().to_string();
            }
            req.status = ApprovalStatus::Pending;
            req.requested_at = Utc::now();
            if req.expires_at == DateTime::<Utc>::default() {
                req.expires_at = req.requested_at + self.inner.default_timeout;
            }
            if req.risk_level.is_none() {
                req.risk_level = Some(safety::assess_command_risk(&req.command, &req.target_type));
            }
            if req.command_hash.is_empty() {
                req.command_hash =
                    safety::command_hash(&req.command, &req.target_type, &req.target_id);
            }

            state.approvals.insert(req.id.clone(), req.clone());
            req
        };

        self.inner.schedule_save();

        info!(
            id = %stored.id,
            command = %truncate_command(&stored.command, LOG_COMMAND_CHARS),
            risk = stored.risk_level.map(|r| r.as_str()).unwrap_or("low"),
            "created approval request"
        );

        Ok(stored)
    }

    /// Looks up an approval. A pending approval past its deadline is
    /// reported as expired without being mutated; the cleanup pass
    /// persists the transition.
    pub fn get_approval(&self, id: &str) -> Option<ApprovalRequest> {
        let state = self.inner.read();
        let req = state.approvals.get(id)?;
        if req.status == ApprovalStatus::Pending && Utc::now() > req.expires_at {
            let mut copy = req.clone();
            copy.status = ApprovalStatus::Expired;
            return Some(copy);
        }
        Some(req.clone())
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalRequest> {
        let now = Utc::now();
        let state = self.inner.read();
        state
            .approvals
            .values()
            .filter(|a| a.status == ApprovalStatus::Pending && now < a.expires_at)
            .cloned()
            .collect()
    }

    pub fn approvals_by_execution(&self, execution_id: &str) -> Vec<ApprovalRequest> {
        let state = self.inner.read();
        state
            .approvals
            .values()
            .filter(|a| a.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// Approves a pending request. Approving an already-approved request
    /// succeeds without change, so double-clicks are harmless.
    pub fn approve(&self, id: &str, username: &str) -> Result<ApprovalRequest, ApprovalError> {
        let result = {
            let mut state = self.inner.write();
            let req = state
                .approvals
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;

            if req.status == ApprovalStatus::Approved {
                return Ok(req.clone());
            }
            if req.status != ApprovalStatus::Pending {
                return Err(ApprovalError::NotPending { status: req.status });
            }
            if Utc::now() > req.expires_at {
                req.status = ApprovalStatus::Expired;
                drop(state);
                self.inner.schedule_save();
                return Err(ApprovalError::Expired(id.to_string()));
            }

            req.status = ApprovalStatus::Approved;
            req.decided_at = Some(Utc::now());
            req.decided_by = username.to_string();
            req.clone()
        };

        self.inner.schedule_save();
        info!(
            id,
            by = username,
            command = %truncate_command(&result.command, LOG_COMMAND_CHARS),
            "approval request approved"
        );
        Ok(result)
    }

    pub fn deny(
        &self,
        id: &str,
        username: &str,
        reason: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let result = {
            let mut state = self.inner.write();
            let req = state
                .approvals
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;

            if req.status != ApprovalStatus::Pending {
                return Err(ApprovalError::NotPending { status: req.status });
            }

            req.status = ApprovalStatus::Denied;
            req.decided_at = Some(Utc::now());
            req.decided_by = username.to_string();
            req.deny_reason = reason.to_string();
            req.clone()
        };

        self.inner.schedule_save();
        info!(id, by = username, reason, "approval request denied");
        Ok(result)
    }

    /// Validates and consumes an approved request for the exact command it
    /// was approved for. The hash check rejects replays against a
    /// different command or target; consumption makes it single-use.
    pub fn consume_approval(
        &self,
        id: &str,
        command: &str,
        target_type: &str,
        target_id: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let result = {
            let mut state = self.inner.write();
            let req = state
                .approvals
                .get_mut(id)
                .ok_or_else(|| ApprovalError::NotFound(id.to_string()))?;

            if req.status != ApprovalStatus::Approved {
                return Err(ApprovalError::NotApproved { status: req.status });
            }
            if req.consumed {
                return Err(ApprovalError::AlreadyConsumed(id.to_string()));
            }
            if Utc::now() > req.expires_at {
                req.status = ApprovalStatus::Expired;
                drop(state);
                self.inner.schedule_save();
                return Err(ApprovalError::Expired(id.to_string()));
            }

            let expected = safety::command_hash(command, target_type, target_id);
            if !req.command_hash.is_empty() && req.command_hash != expected {
                warn!(id, "approval command hash mismatch, possible replay attempt");
                return Err(ApprovalError::CommandMismatch);
            }

            req.consumed = true;
            req.clone()
        };

        self.inner.schedule_save();
        info!(
            id,
            command = %truncate_command(command, LOG_COMMAND_CHARS),
            "approval consumed"
        );
        Ok(result)
    }

    /// Parks conversation state for resumption after the decision.
    pub fn store_execution(&self, mut state: ExecutionState) -> Result<(), ApprovalError> {
        if state.id.is_empty() {
            return Err(ApprovalError::MissingExecutionId);
        }

        state.created_at = Utc::now();
        if state.expires_at == DateTime::<Utc>::default() {
            state.expires_at = state.created_at + self.inner.default_timeout;
        }

        self.inner
            .write()
            .executions
            .insert(state.id.clone(), state);
        self.inner.schedule_save();
        Ok(())
    }

    /// Returns the execution state unless it has expired.
    pub fn get_execution(&self, id: &str) -> Option<ExecutionState> {
        let state = self.inner.read();
        let exec = state.executions.get(id)?;
        if Utc::now() > exec.expires_at {
            return None;
        }
        Some(exec.clone())
    }

    pub fn delete_execution(&self, id: &str) {
        self.inner.write().executions.remove(id);
        self.inner.schedule_save();
    }

    /// Expires overdue pending approvals, drops decided approvals older
    /// than 24 hours and removes expired executions. Returns the number of
    /// items touched.
    pub fn cleanup_expired(&self) -> usize {
        let cleaned = self.inner.cleanup_expired();
        if cleaned > 0 {
            self.inner.schedule_save();
        }
        cleaned
    }

    pub fn stats(&self) -> ApprovalStats {
        let state = self.inner.read();
        let mut stats = ApprovalStats {
            executions: state.executions.len(),
            ..Default::default()
        };
        for req in state.approvals.values() {
            match req.status {
                ApprovalStatus::Pending => stats.pending += 1,
                ApprovalStatus::Approved => stats.approved += 1,
                ApprovalStatus::Denied => stats.denied += 1,
                ApprovalStatus::Expired => stats.expired += 1,
            }
        }
        stats
    }

    /// Saves immediately, cancelling any pending debounced save. For
    /// shutdown paths.
    pub fn flush(&self) {
        {
            let mut save = self.inner.save_lock();
            save.pending = false;
        }
        self.inner.save_now();
    }

    /// Expires and prunes stale entries once a minute until the token is
    /// cancelled. Requires a tokio runtime.
    pub fn start_cleanup(&self, token: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("approval store cleanup loop stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        let cleaned = store.cleanup_expired();
                        if cleaned > 0 {
                            debug!(count = cleaned, "cleaned up expired approval items");
                        }
                    }
                }
            }
        });
    }
}

impl Inner {
    fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut cleaned = 0;
        let mut state = self.write();

        for req in state.approvals.values_mut() {
            if req.status == ApprovalStatus::Pending && now > req.expires_at {
                req.status = ApprovalStatus::Expired;
                cleaned += 1;
            }
        }

        let cutoff = now - Duration::hours(DECIDED_RETENTION_HOURS);
        let before = state.approvals.len();
        state.approvals.retain(|_, req| {
            !(req.status != ApprovalStatus::Pending
                && req.decided_at.is_some_and(|at| at < cutoff))
        });
        cleaned += before - state.approvals.len();

        let before = state.executions.len();
        state.executions.retain(|_, exec| now <= exec.expires_at);
        cleaned += before - state.executions.len();

        cleaned
    }

    // At most one write per debounce interval; bursts of mutations
    // coalesce into the already-scheduled save.
    fn schedule_save(self: &Arc<Self>) {
        if self.data_dir.is_none() {
            return;
        }
        {
            let mut save = self.save_lock();
            if save.pending {
                return;
            }
            save.pending = true;
        }

        let inner = Arc::clone(self);
        std::thread::spawn(move || {
            std::thread::sleep(SAVE_DEBOUNCE);
            {
                let mut save = inner.save_lock();
                if !save.pending {
                    // Flush already wrote the state.
                    return;
                }
                save.pending = false;
            }
            inner.save_now();
        });
    }

    fn save_now(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };

        let (approvals, executions) = {
            let state = self.read();
            let approvals: Vec<ApprovalRequest> = state.approvals.values().cloned().collect();
            let executions: Vec<ExecutionState> = state.executions.values().cloned().collect();
            (approvals, executions)
        };

        match persist::encode_pretty(&approvals) {
            Ok(bytes) => {
                if let Err(err) = persist::write_atomic(&dir.join(APPROVALS_FILE), &bytes) {
                    warn!(error = %format!("{err:#}"), "failed to save approvals");
                }
            }
            Err(err) => warn!(error = %format!("{err:#}"), "failed to encode approvals"),
        }
        match persist::encode_pretty(&executions) {
            Ok(bytes) => {
                if let Err(err) = persist::write_atomic(&dir.join(EXECUTIONS_FILE), &bytes) {
                    warn!(error = %format!("{err:#}"), "failed to save executions");
                }
            }
            Err(err) => warn!(error = %format!("{err:#}"), "failed to encode executions"),
        }
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

    fn save_lock(&self) -> std::sync::MutexGuard<'_, SaveState> {
        match self.save.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn truncate_command(cmd: &str, max_chars: usize) -> String {
    if cmd.chars().count() <= max_chars {
        return cmd.to_string();
    }
    let truncated: String = cmd.chars().take(max_chars).collect();
    format!("{truncated}...")
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ApprovalStore {
        ApprovalStore::new(ApprovalStoreConfig::default())
    }

    fn request(command: &str, target_id: &str) -> ApprovalRequest {
        ApprovalRequest {
            command: command.to_string(),
            target_type: "container".to_string(),
            target_id: target_id.to_string(),
            target_name: "webserver".to_string(),
            context: "service is unhealthy".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn create_fills_defaults() {
        let s = store();
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();

        assert!(!req.id.is_empty());
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert_eq!(req.risk_level, Some(CommandRisk::Medium));
        assert!(!req.command_hash.is_empty());
        assert!(req.expires_at > req.requested_at);
        assert_eq!(s.pending_approvals().len(), 1);
    }

    #[test]
    fn approved_consume_is_single_use() {
        let s = store();
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();

        s.approve(&req.id, "admin").unwrap();
        let consumed = s
            .consume_approval(&req.id, "systemctl restart nginx", "container", "ct-101")
            .unwrap();
        assert!(consumed.consumed);

        let second = s.consume_approval(&req.id, "systemctl restart nginx", "container", "ct-101");
        assert!(matches!(second, Err(ApprovalError::AlreadyConsumed(_))));
    }

    #[test]
    fn consume_rejects_different_command() {
        let s = store();
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();
        s.approve(&req.id, "admin").unwrap();

        let err = s
            .consume_approval(&req.id, "rm -rf /var/www", "container", "ct-101")
            .unwrap_err();
        assert!(matches!(err, ApprovalError::CommandMismatch));

        // A different target is just as bad.
        let err = s
            .consume_approval(&req.id, "systemctl restart nginx", "container", "ct-999")
            .unwrap_err();
        assert!(matches!(err, ApprovalError::CommandMismatch));

        // The original command still works.
        s.consume_approval(&req.id, "systemctl restart nginx", "container", "ct-101")
            .unwrap();
    }

    #[test]
    fn consume_requires_approval_first() {
        let s = store();
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();

        let err = s
            .consume_approval(&req.id, "systemctl restart nginx", "container", "ct-101")
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::NotApproved {
                status: ApprovalStatus::Pending
            }
        ));
    }

    #[test]
    fn approve_is_idempotent_deny_is_not() {
        let s = store();
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();

        s.approve(&req.id, "admin").unwrap();
        let again = s.approve(&req.id, "someone-else").unwrap();
        assert_eq!(again.decided_by, "admin");

        let err = s.deny(&req.id, "admin", "changed my mind").unwrap_err();
        assert!(matches!(err, ApprovalError::NotPending { .. }));
    }

    #[test]
    fn deny_records_reason() {
        let s = store();
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();

        let denied = s.deny(&req.id, "admin", "not during business hours").unwrap();
        assert_eq!(denied.status, ApprovalStatus::Denied);
        assert_eq!(denied.deny_reason, "not during business hours");
        assert!(s.pending_approvals().is_empty());
    }

    #[test]
    fn expired_approval_cannot_be_approved_or_consumed() {
        let s = store();
        let mut req = request("systemctl restart nginx", "ct-101");
        req.expires_at = Utc::now() - Duration::seconds(1);
        let req = s.create_approval(req).unwrap();

        // Reads report it as expired without mutating.
        assert_eq!(
            s.get_approval(&req.id).unwrap().status,
            ApprovalStatus::Expired
        );
        assert!(s.pending_approvals().is_empty());

        let err = s.approve(&req.id, "admin").unwrap_err();
        assert!(matches!(err, ApprovalError::Expired(_)));
    }

    #[test]
    fn capacity_limit() {
        let s = ApprovalStore::new(ApprovalStoreConfig {
            max_pending: Some(2),
            ..Default::default()
        });
        s.create_approval(request("uptime", "ct-1")).unwrap();
        s.create_approval(request("uptime", "ct-2")).unwrap();

        let err = s.create_approval(request("uptime", "ct-3")).unwrap_err();
        assert!(matches!(err, ApprovalError::CapacityReached(2)));
    }

    #[test]
    fn target_id_validation() {
        let s = store();
        let err = s
            .create_approval(request("uptime", "ct-101; rm -rf /"))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidTargetId(_)));
    }

    #[test]
    fn cleanup_expires_and_prunes() {
        let s = store();

        let mut overdue = request("uptime", "ct-1");
        overdue.expires_at = Utc::now() - Duration::seconds(1);
        let overdue = s.create_approval(overdue).unwrap();

        let mut old = request("uptime", "ct-2");
        old.id = "old-decision".to_string();
        let old = s.create_approval(old).unwrap();
        s.approve(&old.id, "admin").unwrap();
        {
            // Age the decision past the retention window.
            let mut state = s.inner.write();
            let req = state.approvals.get_mut(&old.id).unwrap();
            req.decided_at = Some(Utc::now() - Duration::hours(25));
        }

        let cleaned = s.cleanup_expired();
        assert_eq!(cleaned, 2);
        assert_eq!(
            s.get_approval(&overdue.id).unwrap().status,
            ApprovalStatus::Expired
        );
        assert!(s.get_approval(&old.id).is_none());
    }

    #[test]
    fn execution_state_lifecycle() {
        let s = store();
        assert!(matches!(
            s.store_execution(ExecutionState::default()),
            Err(ApprovalError::MissingExecutionId)
        ));

        let mut exec = ExecutionState {
            id: "exec-1".to_string(),
            ..Default::default()
        };
        exec.pending_tool_call
            .insert("name".to_string(), Value::String("run_command".to_string()));
        s.store_execution(exec).unwrap();

        let loaded = s.get_execution("exec-1").unwrap();
        assert_eq!(loaded.pending_tool_call["name"], "run_command");
        assert_eq!(s.stats().executions, 1);

        s.delete_execution("exec-1");
        assert!(s.get_execution("exec-1").is_none());

        // Expired executions read as absent.
        let expired = ExecutionState {
            id: "exec-2".to_string(),
            expires_at: Utc::now() - Duration::seconds(1),
            ..Default::default()
        };
        s.store_execution(expired).unwrap();
        assert!(s.get_execution("exec-2").is_none());
    }

    #[test]
    fn stats_by_status() {
        let s = store();
        let a = s.create_approval(request("uptime", "ct-1")).unwrap();
        let b = s.create_approval(request("uptime", "ct-2")).unwrap();
        s.create_approval(request("uptime", "ct-3")).unwrap();

        s.approve(&a.id, "admin").unwrap();
        s.deny(&b.id, "admin", "no").unwrap();

        let stats = s.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.approved, 1);
        assert_eq!(stats.denied, 1);
        assert_eq!(stats.expired, 0);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = ApprovalStoreConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let s = ApprovalStore::new(cfg.clone());
        let req = s
            .create_approval(request("systemctl restart nginx", "ct-101"))
            .unwrap();
        s.approve(&req.id, "admin").unwrap();
        s.store_execution(ExecutionState {
            id: "exec-1".to_string(),
            ..Default::default()
        })
        .unwrap();
        s.flush();

        let reloaded = ApprovalStore::new(cfg);
        let loaded = reloaded.get_approval(&req.id).unwrap();
        assert_eq!(loaded.status, ApprovalStatus::Approved);
        assert_eq!(loaded.decided_by, "admin");
        assert!(reloaded.get_execution("exec-1").is_some());
    }
}
