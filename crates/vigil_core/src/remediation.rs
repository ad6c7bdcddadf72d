//! Guided fix plans with safe execution.
//!
//! Plans are validated against the blocked-command list, risk-assessed
//! from their step commands, and categorized by how much human oversight
//! they need. An approved plan runs through an injected executor with a
//! per-step timeout; failed executions can be rolled back in reverse
//! step order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vigil_common::ids::IdGenerator;
use vigil_common::persist::{self, MAX_HISTORY_FILE_BYTES};
use vigil_common::safety;
use vigil_common::timefmt::duration_ns;

static PLAN_IDS: IdGenerator = IdGenerator::new("plan");
static EXECUTION_IDS: IdGenerator = IdGenerator::new("exec");
static RULE_IDS: IdGenerator = IdGenerator::new("rule");

const REMEDIATION_FILE: &str = "remediation.json";
const DEFAULT_MAX_EXECUTIONS: usize = 100;
const DEFAULT_PLAN_EXPIRY_HOURS: i64 = 24;
const DEFAULT_STEP_TIMEOUT_MINUTES: i64 = 5;
const MAX_STEP_OUTPUT_CHARS: usize = 10_000;

const HIGH_RISK_KEYWORDS: &[&str] = &["delete", "remove", "destroy", "format", "wipe", "reset"];
const MEDIUM_RISK_KEYWORDS: &[&str] = &["restart", "stop", "kill", "force", "override"];

// ==================== Types ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanCategory {
    /// Advice only, nothing executable.
    Informational,
    /// Commands for the user to copy and run.
    Guided,
    /// Executable with a single approval.
    OneClick,
    /// Executable under a pre-approval rule.
    Autonomous,
}

impl PlanCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanCategory::Informational => "informational",
            PlanCategory::Guided => "guided",
            PlanCategory::OneClick => "one_click",
            PlanCategory::Autonomous => "autonomous",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRisk {
    #[default]
    Low,
    Medium,
    High,
    /// Could cause data loss or an outage.
    Critical,
}

impl PlanRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanRisk::Low => "low",
            PlanRisk::Medium => "medium",
            PlanRisk::High => "high",
            PlanRisk::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Approved,
    Running,
    Completed,
    Failed,
    RolledBack,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Approved => "approved",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationStep {
    pub order: i32,
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    /// Resource or host the command runs on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rollback: String,
    #[serde(with = "duration_ns", default = "Duration::zero")]
    pub wait_after: Duration,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemediationPlan {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finding_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<PlanCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<PlanRisk>,
    pub steps: Vec<RemediationStep>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RemediationPlan {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(with = "duration_ns")]
    pub duration: Duration,
    pub run_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationExecution {
    pub id: String,
    pub plan_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approved_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_results: Vec<StepResult>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rollback_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verified: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verification_note: String,
}

/// Pre-approved action classes for autonomous execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalRule {
    #[serde(default)]
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<PlanCategory>,
    /// Empty matches any resource type.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub action_type: String,
    #[serde(default)]
    pub max_risk_level: PlanRisk,
    pub enabled: bool,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
}

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("plan title is required")]
    MissingTitle,
    #[error("plan must have at least one step")]
    NoSteps,
    #[error("plan contains blocked command: {0}")]
    BlockedCommand(String),
    #[error("plan not found: {0}")]
    PlanNotFound(String),
    #[error("plan has expired")]
    PlanExpired,
    #[error("execution not found: {0}")]
    ExecutionNotFound(String),
    #[error("execution is not approved (status: {status})")]
    NotApproved { status: ExecutionStatus },
    #[error("no command executor configured")]
    NoExecutor,
    #[error("remediation step {step} failed: {message}")]
    StepFailed { step: usize, message: String },
    #[error("execution cancelled")]
    Cancelled,
    #[error("rollback had errors: {0}")]
    RollbackFailed(String),
}

/// Runs a command on a target system.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, target: &str, command: &str) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub data_dir: Option<PathBuf>,
    /// Executions kept in history (default 100).
    pub max_executions: Option<usize>,
    /// How long plans stay actionable (default 24 hours).
    pub plan_expiry: Option<Duration>,
    /// Per-step timeout (default 5 minutes).
    pub step_timeout: Option<Duration>,
}

// ==================== Engine ====================

#[derive(Serialize, Deserialize, Default)]
struct EngineFile {
    plans: HashMap<String, RemediationPlan>,
    executions: HashMap<String, RemediationExecution>,
    approval_rules: HashMap<String, ApprovalRule>,
}

struct State {
    plans: HashMap<String, RemediationPlan>,
    executions: HashMap<String, RemediationExecution>,
    rules: HashMap<String, ApprovalRule>,
}

pub struct RemediationEngine {
    state: RwLock<State>,
    executor: RwLock<Option<Arc<dyn CommandExecutor>>>,
    max_executions: usize,
    plan_expiry: Duration,
    step_timeout: Duration,
    data_dir: Option<PathBuf>,
}

impl RemediationEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        let max_executions = match cfg.max_executions {
            Some(0) | None => DEFAULT_MAX_EXECUTIONS,
            Some(n) => n,
        };
        let plan_expiry = cfg
            .plan_expiry
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(|| Duration::hours(DEFAULT_PLAN_EXPIRY_HOURS));
        let step_timeout = cfg
            .step_timeout
            .filter(|d| *d > Duration::zero())
            .unwrap_or_else(|| Duration::minutes(DEFAULT_STEP_TIMEOUT_MINUTES));

        let mut state = State {
            plans: HashMap::new(),
            executions: HashMap::new(),
            rules: HashMap::new(),
        };

        if let Some(dir) = &cfg.data_dir {
            match persist::load_json_capped::<EngineFile>(
                &dir.join(REMEDIATION_FILE),
                MAX_HISTORY_FILE_BYTES,
            ) {
                Ok(Some(loaded)) => {
                    state.plans = loaded.plans;
                    state.executions = loaded.executions;
                    state.rules = loaded.approval_rules;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to load remediation data, starting fresh");
                }
            }
        }

        Self {
            state: RwLock::new(state),
            executor: RwLock::new(None),
            max_executions,
            plan_expiry,
            step_timeout,
            data_dir: cfg.data_dir,
        }
    }

    pub fn set_command_executor(&self, executor: Arc<dyn CommandExecutor>) {
        match self.executor.write() {
            Ok(mut guard) => *guard = Some(executor),
            Err(poisoned) => *poisoned.into_inner() = Some(executor),
        }
    }

    /// Validates and stores a plan, filling in id, expiry, risk and
    /// category when unset. A new plan for a finding supersedes any
    /// earlier active plan for the same finding.
    pub fn create_plan(
        &self,
        mut plan: RemediationPlan,
    ) -> Result<RemediationPlan, RemediationError> {
        if plan.title.is_empty() {
            return Err(RemediationError::MissingTitle);
        }
        if plan.steps.is_empty() {
            return Err(RemediationError::NoSteps);
        }
        for step in &plan.steps {
            if safety::is_blocked(&step.command) {
                return Err(RemediationError::BlockedCommand(step.command.clone()));
            }
        }

        if plan.id.is_empty() {
            plan.id = PLAN_IDS.next();
        }
        if plan.created_at == DateTime::<Utc>::default() {
            plan.created_at = Utc::now();
        }
        if plan.expires_at.is_none() {
            plan.expires_at = Some(plan.created_at + self.plan_expiry);
        }
        if plan.risk_level.is_none() {
            plan.risk_level = Some(assess_plan_risk(&plan));
        }
        if plan.category.is_none() {
            plan.category = Some(categorize(&plan));
        }

        let stored = {
            let mut state = self.write();

            // Supersede earlier active plans for the same finding.
            if !plan.finding_id.is_empty() {
                let now = Utc::now();
                for existing in state.plans.values_mut() {
                    if existing.finding_id == plan.finding_id
                        && existing.id != plan.id
                        && !existing.is_expired(now)
                    {
                        existing.expires_at = Some(now);
                        debug!(
                            superseded = %existing.id,
                            by = %plan.id,
                            "superseded remediation plan"
                        );
                    }
                }
            }

            state.plans.insert(plan.id.clone(), plan.clone());
            plan
        };

        info!(
            plan_id = %stored.id,
            finding_id = %stored.finding_id,
            category = stored.category.map(|c| c.as_str()).unwrap_or(""),
            risk = stored.risk_level.map(|r| r.as_str()).unwrap_or(""),
            "created remediation plan"
        );

        self.save_async();
        Ok(stored)
    }

    pub fn get_plan(&self, plan_id: &str) -> Option<RemediationPlan> {
        self.read().plans.get(plan_id).cloned()
    }

    /// The active (non-expired) plan for a finding, if any.
    pub fn get_plan_for_finding(&self, finding_id: &str) -> Option<RemediationPlan> {
        let now = Utc::now();
        let state = self.read();
        state
            .plans
            .values()
            .filter(|p| p.finding_id == finding_id && !p.is_expired(now))
            .max_by_key(|p| p.created_at)
            .cloned()
    }

    /// Active plans, newest first. `limit == 0` means the default of 100.
    pub fn list_plans(&self, limit: usize) -> Vec<RemediationPlan> {
        let limit = if limit == 0 { 100 } else { limit };
        let now = Utc::now();
        let state = self.read();
        let mut plans: Vec<RemediationPlan> = state
            .plans
            .values()
            .filter(|p| !p.is_expired(now))
            .cloned()
            .collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        plans.truncate(limit);
        plans
    }

    /// Approves a plan, creating an execution ready to run.
    pub fn approve_plan(
        &self,
        plan_id: &str,
        approved_by: &str,
    ) -> Result<RemediationExecution, RemediationError> {
        let execution = {
            let mut state = self.write();
            let plan = state
                .plans
                .get(plan_id)
                .ok_or_else(|| RemediationError::PlanNotFound(plan_id.to_string()))?;
            if plan.is_expired(Utc::now()) {
                return Err(RemediationError::PlanExpired);
            }

            let execution = RemediationExecution {
                id: EXECUTION_IDS.next(),
                plan_id: plan_id.to_string(),
                status: ExecutionStatus::Approved,
                approved_by: approved_by.to_string(),
                approved_at: Some(Utc::now()),
                started_at: None,
                completed_at: None,
                current_step: 0,
                step_results: Vec::new(),
                error: String::new(),
                rollback_error: String::new(),
                verified: None,
                verification_note: String::new(),
            };
            state
                .executions
                .insert(execution.id.clone(), execution.clone());
            self.trim_executions(&mut state);
            execution
        };

        info!(
            execution_id = %execution.id,
            plan_id,
            approved_by,
            "remediation plan approved"
        );

        self.save_async();
        Ok(execution)
    }

    /// Runs an approved execution step by step. Each step gets its own
    /// timeout; a failed step stops the run. Cancelling the token aborts
    /// between steps and during post-step waits.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        execution_id: &str,
    ) -> Result<(), RemediationError> {
        let (steps, executor) = {
            let state = self.read();
            let execution = state
                .executions
                .get(execution_id)
                .ok_or_else(|| RemediationError::ExecutionNotFound(execution_id.to_string()))?;
            if execution.status != ExecutionStatus::Approved {
                return Err(RemediationError::NotApproved {
                    status: execution.status,
                });
            }
            let plan = state
                .plans
                .get(&execution.plan_id)
                .ok_or_else(|| RemediationError::PlanNotFound(execution.plan_id.clone()))?;
            (plan.steps.clone(), self.current_executor())
        };
        let executor = executor.ok_or(RemediationError::NoExecutor)?;

        self.update_execution(execution_id, |exec| {
            exec.status = ExecutionStatus::Running;
            exec.started_at = Some(Utc::now());
        });

        let step_timeout = self
            .step_timeout
            .to_std()
            .unwrap_or(std::time::Duration::from_secs(300));

        let mut last_error: Option<RemediationError> = None;
        for (i, step) in steps.iter().enumerate() {
            if step.command.is_empty() {
                continue;
            }
            if token.is_cancelled() {
                last_error = Some(RemediationError::Cancelled);
                break;
            }

            self.update_execution(execution_id, |exec| exec.current_step = i);

            let start = Utc::now();
            let outcome =
                tokio::time::timeout(step_timeout, executor.execute(&step.target, &step.command))
                    .await;
            let duration = Utc::now() - start;

            let mut result = StepResult {
                step: i,
                success: false,
                output: String::new(),
                error: String::new(),
                duration,
                run_at: start,
            };

            let step_error = match outcome {
                Ok(Ok(output)) => {
                    result.success = true;
                    result.output = truncate_output(&output, MAX_STEP_OUTPUT_CHARS);
                    None
                }
                Ok(Err(err)) => Some(format!("{err:#}")),
                Err(_) => Some("step timed out".to_string()),
            };
            if let Some(message) = &step_error {
                result.error = message.clone();
            }

            self.update_execution(execution_id, |exec| exec.step_results.push(result));

            if let Some(message) = step_error {
                warn!(execution_id, step = i, error = %message, "remediation step failed");
                last_error = Some(RemediationError::StepFailed { step: i, message });
                break;
            }

            if step.wait_after > Duration::zero() {
                let wait = step
                    .wait_after
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::select! {
                    _ = token.cancelled() => {
                        last_error = Some(RemediationError::Cancelled);
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }

            debug!(execution_id, step = i, "completed remediation step");
        }

        let failed = last_error.is_some();
        let error_text = last_error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_default();
        self.update_execution(execution_id, |exec| {
            exec.completed_at = Some(Utc::now());
            if failed {
                exec.status = ExecutionStatus::Failed;
                exec.error = error_text.clone();
            } else {
                exec.status = ExecutionStatus::Completed;
            }
        });

        info!(
            execution_id,
            status = if failed { "failed" } else { "completed" },
            "remediation execution finished"
        );

        self.save_async();
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs the rollback commands of the successfully executed steps, in
    /// reverse order.
    pub async fn rollback(&self, execution_id: &str) -> Result<(), RemediationError> {
        let (steps, results, executor) = {
            let state = self.read();
            let execution = state
                .executions
                .get(execution_id)
                .ok_or_else(|| RemediationError::ExecutionNotFound(execution_id.to_string()))?;
            let plan = state
                .plans
                .get(&execution.plan_id)
                .ok_or_else(|| RemediationError::PlanNotFound(execution.plan_id.clone()))?;
            (
                plan.steps.clone(),
                execution.step_results.clone(),
                self.current_executor(),
            )
        };
        let executor = executor.ok_or(RemediationError::NoExecutor)?;

        let mut rollback_errors: Vec<String> = Vec::new();
        for result in results.iter().rev() {
            if !result.success {
                continue;
            }
            let Some(step) = steps.get(result.step) else {
                continue;
            };
            if step.rollback.is_empty() {
                continue;
            }

            if let Err(err) = executor.execute(&step.target, &step.rollback).await {
                rollback_errors.push(format!("step {}: {err:#}", result.step));
                warn!(execution_id, step = result.step, error = %format!("{err:#}"), "rollback step failed");
            }
        }

        let joined = rollback_errors.join("; ");
        self.update_execution(execution_id, |exec| {
            if rollback_errors.is_empty() {
                exec.status = ExecutionStatus::RolledBack;
            } else {
                exec.rollback_error = joined.clone();
            }
        });

        self.save_async();
        if rollback_errors.is_empty() {
            Ok(())
        } else {
            Err(RemediationError::RollbackFailed(joined))
        }
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<RemediationExecution> {
        self.read().executions.get(execution_id).cloned()
    }

    /// The most recent execution of a plan, by completion, start or
    /// approval time.
    pub fn latest_execution_for_plan(&self, plan_id: &str) -> Option<RemediationExecution> {
        let state = self.read();
        state
            .executions
            .values()
            .filter(|e| e.plan_id == plan_id)
            .max_by_key(|e| e.completed_at.or(e.started_at).or(e.approved_at))
            .cloned()
    }

    /// Records whether the fix actually took, from a later verification
    /// pass over the resource.
    pub fn set_execution_verification(&self, execution_id: &str, verified: bool, note: &str) {
        self.update_execution(execution_id, |exec| {
            exec.verified = Some(verified);
            exec.verification_note = note.to_string();
        });
        self.save_async();
    }

    /// Recent executions, most recently approved first. `limit == 0`
    /// returns all retained.
    pub fn list_executions(&self, limit: usize) -> Vec<RemediationExecution> {
        let state = self.read();
        let mut result: Vec<RemediationExecution> = state.executions.values().cloned().collect();
        result.sort_by(|a, b| b.approved_at.cmp(&a.approved_at));
        if limit > 0 {
            result.truncate(limit);
        }
        result
    }

    pub fn add_approval_rule(&self, mut rule: ApprovalRule) -> ApprovalRule {
        if rule.id.is_empty() {
            rule.id = RULE_IDS.next();
        }
        if rule.created_at == DateTime::<Utc>::default() {
            rule.created_at = Utc::now();
        }
        self.write().rules.insert(rule.id.clone(), rule.clone());
        self.save_async();
        rule
    }

    /// Whether an enabled pre-approval rule covers this plan's category
    /// and risk.
    pub fn is_auto_approved(&self, plan: &RemediationPlan) -> bool {
        let plan_risk = plan.risk_level.unwrap_or_default();
        let state = self.read();
        state.rules.values().any(|rule| {
            rule.enabled
                && rule.category.map_or(true, |c| Some(c) == plan.category)
                && plan_risk <= rule.max_risk_level
        })
    }

    /// Markdown rendering of a plan for the prompt.
    pub fn format_plan_for_context(plan: &RemediationPlan) -> String {
        let mut out = format!("\n## Remediation Plan: {}\n", plan.title);
        out.push_str(&format!(
            "Category: {} | Risk: {}\n",
            plan.category.map(|c| c.as_str()).unwrap_or("guided"),
            plan.risk_level.unwrap_or_default().as_str()
        ));
        out.push_str(&format!("Description: {}\n\n", plan.description));

        if !plan.prerequisites.is_empty() {
            out.push_str("Prerequisites:\n");
            for prereq in &plan.prerequisites {
                out.push_str(&format!("- {prereq}\n"));
            }
            out.push('\n');
        }

        out.push_str("Steps:\n");
        for (i, step) in plan.steps.iter().enumerate() {
            out.push_str(&format!("{}. {}\n", i + 1, step.description));
            if !step.command.is_empty() {
                out.push_str(&format!("   Command: {}\n", step.command));
            }
            if !step.rollback.is_empty() {
                out.push_str(&format!("   Rollback: {}\n", step.rollback));
            }
        }

        if !plan.warnings.is_empty() {
            out.push_str("\nWarnings:\n");
            for warning in &plan.warnings {
                out.push_str(&format!("- {warning}\n"));
            }
        }

        out
    }

    /// Synchronous save for shutdown paths.
    pub fn flush(&self) {
        if let Err(err) = self.save_now() {
            warn!(error = %format!("{err:#}"), "failed to save remediation data");
        }
    }

    fn trim_executions(&self, state: &mut State) {
        if state.executions.len() <= self.max_executions {
            return;
        }
        let mut ids: Vec<(Option<DateTime<Utc>>, String)> = state
            .executions
            .values()
            .map(|e| (e.approved_at, e.id.clone()))
            .collect();
        ids.sort();
        let excess = state.executions.len() - self.max_executions;
        for (_, id) in ids.into_iter().take(excess) {
            state.executions.remove(&id);
        }
    }

    fn update_execution(&self, execution_id: &str, f: impl FnOnce(&mut RemediationExecution)) {
        let mut state = self.write();
        if let Some(exec) = state.executions.get_mut(execution_id) {
            f(exec);
        }
    }

    fn current_executor(&self) -> Option<Arc<dyn CommandExecutor>> {
        match self.executor.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn save_async(&self) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        let bytes = {
            let state = self.read();
            let file = EngineFile {
                plans: state.plans.clone(),
                executions: state.executions.clone(),
                approval_rules: state.rules.clone(),
            };
            match persist::encode_pretty(&file) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(error = %format!("{err:#}"), "failed to encode remediation data");
                    return;
                }
            }
        };
        persist::spawn_write("remediation data", dir.join(REMEDIATION_FILE), bytes);
    }

    fn save_now(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.data_dir else {
            return Ok(());
        };
        let bytes = {
            let state = self.read();
            let file = EngineFile {
                plans: state.plans.clone(),
                executions: state.executions.clone(),
                approval_rules: state.rules.clone(),
            };
            persist::encode_pretty(&file)?
        };
        persist::write_atomic(&dir.join(REMEDIATION_FILE), &bytes)
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

fn assess_plan_risk(plan: &RemediationPlan) -> PlanRisk {
    let mut risk = PlanRisk::Low;
    for step in &plan.steps {
        let cmd = step.command.to_lowercase();
        if HIGH_RISK_KEYWORDS.iter().any(|k| cmd.contains(k)) {
            return PlanRisk::High;
        }
        if MEDIUM_RISK_KEYWORDS.iter().any(|k| cmd.contains(k)) {
            risk = PlanRisk::Medium;
        }
    }
    risk
}

fn categorize(plan: &RemediationPlan) -> PlanCategory {
    let has_commands = plan.steps.iter().any(|s| !s.command.is_empty());
    if !has_commands {
        return PlanCategory::Informational;
    }

    let risk = plan.risk_level.unwrap_or_default();
    if risk >= PlanRisk::High {
        return PlanCategory::Guided;
    }
    if risk == PlanRisk::Low && plan.steps.len() <= 3 {
        return PlanCategory::OneClick;
    }
    PlanCategory::Guided
}

fn truncate_output(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max_chars).collect();
    format!("{truncated}...")
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingExecutor {
        calls: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
    }

    impl RecordingExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_on: None,
            })
        }

        fn failing_on(command: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_on: Some(command.to_string()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn execute(&self, target: &str, command: &str) -> anyhow::Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((target.to_string(), command.to_string()));
            if self.fail_on.as_deref() == Some(command) {
                anyhow::bail!("command failed");
            }
            Ok(format!("ran: {command}"))
        }
    }

    fn step(order: i32, description: &str, command: &str, rollback: &str) -> RemediationStep {
        RemediationStep {
            order,
            description: description.to_string(),
            command: command.to_string(),
            target: "ct-101".to_string(),
            rollback: rollback.to_string(),
            ..Default::default()
        }
    }

    fn plan(finding_id: &str, steps: Vec<RemediationStep>) -> RemediationPlan {
        RemediationPlan {
            finding_id: finding_id.to_string(),
            resource_id: "ct-101".to_string(),
            title: "Restart unhealthy service".to_string(),
            description: "nginx is wedged".to_string(),
            steps,
            ..Default::default()
        }
    }

    fn engine() -> RemediationEngine {
        RemediationEngine::new(EngineConfig::default())
    }

    #[test]
    fn create_validates_plan() {
        let e = engine();

        let mut no_title = plan("f-1", vec![step(0, "check", "uptime", "")]);
        no_title.title = String::new();
        assert!(matches!(
            e.create_plan(no_title),
            Err(RemediationError::MissingTitle)
        ));

        assert!(matches!(
            e.create_plan(plan("f-1", vec![])),
            Err(RemediationError::NoSteps)
        ));

        let blocked = plan("f-1", vec![step(0, "clean up", "rm -rf /var/lib/vz", "")]);
        assert!(matches!(
            e.create_plan(blocked),
            Err(RemediationError::BlockedCommand(_))
        ));
    }

    #[test]
    fn create_fills_risk_category_and_expiry() {
        let e = engine();

        let informational = e
            .create_plan(plan("f-1", vec![step(0, "check disk usage manually", "", "")]))
            .unwrap();
        assert_eq!(informational.category, Some(PlanCategory::Informational));
        assert_eq!(informational.risk_level, Some(PlanRisk::Low));
        assert!(informational.expires_at.is_some());

        let one_click = e
            .create_plan(plan("f-2", vec![step(0, "check uptime", "uptime", "")]))
            .unwrap();
        assert_eq!(one_click.category, Some(PlanCategory::OneClick));

        let guided = e
            .create_plan(plan(
                "f-3",
                vec![step(0, "restart", "systemctl restart nginx", "")],
            ))
            .unwrap();
        assert_eq!(guided.risk_level, Some(PlanRisk::Medium));
        assert_eq!(guided.category, Some(PlanCategory::Guided));

        let high = e
            .create_plan(plan(
                "f-4",
                vec![step(0, "clear cache", "find /tmp -name '*.cache' -delete", "")],
            ))
            .unwrap();
        assert_eq!(high.risk_level, Some(PlanRisk::High));
        assert_eq!(high.category, Some(PlanCategory::Guided));
    }

    #[test]
    fn new_plan_supersedes_active_plan_for_finding() {
        let e = engine();
        let first = e
            .create_plan(plan("f-1", vec![step(0, "check", "uptime", "")]))
            .unwrap();
        let second = e
            .create_plan(plan("f-1", vec![step(0, "check again", "uptime", "")]))
            .unwrap();

        let active = e.get_plan_for_finding("f-1").unwrap();
        assert_eq!(active.id, second.id);

        // The first plan still exists but is expired.
        let first = e.get_plan(&first.id).unwrap();
        assert!(first.is_expired(Utc::now() + Duration::seconds(1)));
        assert_eq!(e.list_plans(0).len(), 1);
    }

    #[test]
    fn approve_requires_active_plan() {
        let e = engine();
        assert!(matches!(
            e.approve_plan("missing", "admin"),
            Err(RemediationError::PlanNotFound(_))
        ));

        let mut expired = plan("f-1", vec![step(0, "check", "uptime", "")]);
        expired.expires_at = Some(Utc::now() - Duration::seconds(1));
        let expired = e.create_plan(expired).unwrap();
        assert!(matches!(
            e.approve_plan(&expired.id, "admin"),
            Err(RemediationError::PlanExpired)
        ));
    }

    #[tokio::test]
    async fn execute_runs_steps_in_order() {
        let e = engine();
        let executor = RecordingExecutor::new();
        e.set_command_executor(executor.clone());

        let p = e
            .create_plan(plan(
                "f-1",
                vec![
                    step(0, "reload", "systemctl reload nginx", ""),
                    step(1, "verify", "curl -fsS localhost/healthz", ""),
                ],
            ))
            .unwrap();
        let exec = e.approve_plan(&p.id, "admin").unwrap();

        let token = CancellationToken::new();
        e.execute(&token, &exec.id).await.unwrap();

        let finished = e.get_execution(&exec.id).unwrap();
        assert_eq!(finished.status, ExecutionStatus::Completed);
        assert_eq!(finished.step_results.len(), 2);
        assert!(finished.step_results.iter().all(|r| r.success));
        assert!(finished.step_results[0].output.contains("systemctl reload"));

        let calls = executor.calls();
        assert_eq!(calls[0].1, "systemctl reload nginx");
        assert_eq!(calls[1].1, "curl -fsS localhost/healthz");

        // A finished execution cannot run again.
        assert!(matches!(
            e.execute(&token, &exec.id).await,
            Err(RemediationError::NotApproved { .. })
        ));
    }

    #[tokio::test]
    async fn failed_step_stops_execution() {
        let e = engine();
        e.set_command_executor(RecordingExecutor::failing_on("systemctl reload nginx"));

        let p = e
            .create_plan(plan(
                "f-1",
                vec![
                    step(0, "reload", "systemctl reload nginx", ""),
                    step(1, "verify", "curl -fsS localhost/healthz", ""),
                ],
            ))
            .unwrap();
        let exec = e.approve_plan(&p.id, "admin").unwrap();

        let token = CancellationToken::new();
        let err = e.execute(&token, &exec.id).await.unwrap_err();
        assert!(matches!(err, RemediationError::StepFailed { step: 0, .. }));

        let finished = e.get_execution(&exec.id).unwrap();
        assert_eq!(finished.status, ExecutionStatus::Failed);
        assert_eq!(finished.step_results.len(), 1);
        assert!(!finished.step_results[0].success);
        assert!(finished.error.contains("command failed"));
    }

    #[tokio::test]
    async fn execute_without_executor_fails() {
        let e = engine();
        let p = e
            .create_plan(plan("f-1", vec![step(0, "check", "uptime", "")]))
            .unwrap();
        let exec = e.approve_plan(&p.id, "admin").unwrap();

        let token = CancellationToken::new();
        assert!(matches!(
            e.execute(&token, &exec.id).await,
            Err(RemediationError::NoExecutor)
        ));
    }

    #[tokio::test]
    async fn rollback_runs_in_reverse_order() {
        let e = engine();
        let executor = RecordingExecutor::new();
        e.set_command_executor(executor.clone());

        let p = e
            .create_plan(plan(
                "f-1",
                vec![
                    step(0, "scale down", "docker stop worker", "docker start worker"),
                    step(1, "reload", "systemctl reload nginx", "systemctl reload nginx"),
                ],
            ))
            .unwrap();
        let exec = e.approve_plan(&p.id, "admin").unwrap();

        let token = CancellationToken::new();
        e.execute(&token, &exec.id).await.unwrap();
        e.rollback(&exec.id).await.unwrap();

        let finished = e.get_execution(&exec.id).unwrap();
        assert_eq!(finished.status, ExecutionStatus::RolledBack);

        let calls = executor.calls();
        // Forward steps then rollbacks, last step rolled back first.
        assert_eq!(calls[2].1, "systemctl reload nginx");
        assert_eq!(calls[3].1, "docker start worker");
    }

    #[test]
    fn auto_approval_rules() {
        let e = engine();
        let low = e
            .create_plan(plan("f-1", vec![step(0, "check", "uptime", "")]))
            .unwrap();
        let medium = e
            .create_plan(plan(
                "f-2",
                vec![step(0, "restart", "systemctl restart nginx", "")],
            ))
            .unwrap();

        assert!(!e.is_auto_approved(&low));

        e.add_approval_rule(ApprovalRule {
            description: "allow low-risk one-click fixes".to_string(),
            category: Some(PlanCategory::OneClick),
            max_risk_level: PlanRisk::Low,
            enabled: true,
            ..Default::default()
        });

        assert!(e.is_auto_approved(&low));
        assert!(!e.is_auto_approved(&medium));

        // Disabled rules never match.
        let e2 = engine();
        e2.add_approval_rule(ApprovalRule {
            description: "disabled".to_string(),
            max_risk_level: PlanRisk::Critical,
            enabled: false,
            ..Default::default()
        });
        assert!(!e2.is_auto_approved(&low));
    }

    #[test]
    fn verification_and_listing() {
        let e = engine();
        let p = e
            .create_plan(plan("f-1", vec![step(0, "check", "uptime", "")]))
            .unwrap();
        let first = e.approve_plan(&p.id, "admin").unwrap();
        let second = e.approve_plan(&p.id, "admin").unwrap();

        e.set_execution_verification(&second.id, true, "service healthy again");

        let latest = e.latest_execution_for_plan(&p.id).unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.verified, Some(true));
        assert_eq!(latest.verification_note, "service healthy again");

        let listed = e.list_executions(0);
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
        assert_eq!(e.list_executions(1).len(), 1);
    }

    #[test]
    fn plan_context_rendering() {
        let mut p = plan(
            "f-1",
            vec![step(0, "restart the service", "systemctl restart nginx", "true")],
        );
        p.category = Some(PlanCategory::Guided);
        p.risk_level = Some(PlanRisk::Medium);
        p.prerequisites = vec!["confirm a recent backup exists".to_string()];
        p.warnings = vec!["brief downtime while nginx restarts".to_string()];

        let text = RemediationEngine::format_plan_for_context(&p);
        assert!(text.contains("## Remediation Plan: Restart unhealthy service"));
        assert!(text.contains("Category: guided | Risk: medium"));
        assert!(text.contains("1. restart the service"));
        assert!(text.contains("   Command: systemctl restart nginx"));
        assert!(text.contains("   Rollback: true"));
        assert!(text.contains("- confirm a recent backup exists"));
        assert!(text.contains("- brief downtime while nginx restarts"));
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = EngineConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

        let e = RemediationEngine::new(cfg.clone());
        e.set_command_executor(RecordingExecutor::new());
        let p = e
            .create_plan(plan("f-1", vec![step(0, "check", "uptime", "")]))
            .unwrap();
        let exec = e.approve_plan(&p.id, "admin").unwrap();
        let token = CancellationToken::new();
        e.execute(&token, &exec.id).await.unwrap();
        e.flush();

        let reloaded = RemediationEngine::new(cfg);
        assert_eq!(reloaded.get_plan(&p.id).unwrap().title, p.title);
        let loaded_exec = reloaded.get_execution(&exec.id).unwrap();
        assert_eq!(loaded_exec.status, ExecutionStatus::Completed);
        assert_eq!(loaded_exec.step_results.len(), 1);
    }
}
