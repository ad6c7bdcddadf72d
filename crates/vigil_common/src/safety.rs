//! Command risk policy.
//!
//! Three layers, used by the approval store and the remediation engine:
//! a replay-protection hash binding an approval to an exact
//! (command, target) pair, a risk ladder for approval classification, and
//! a blocked-command matcher for commands that must never reach an
//! executor regardless of approval.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Potential impact of a command, as assessed for approval tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CommandRisk {
    #[default]
    Low,
    Medium,
    High,
}

impl CommandRisk {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandRisk::Low => "low",
            CommandRisk::Medium => "medium",
            CommandRisk::High => "high",
        }
    }
}

/// hex(SHA-256(command|targetType|targetID)). An approved ticket can only
/// be consumed for the exact command and target it was approved for.
pub fn command_hash(command: &str, target_type: &str, target_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(command.as_bytes());
    hasher.update(b"|");
    hasher.update(target_type.as_bytes());
    hasher.update(b"|");
    hasher.update(target_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Valid target identifiers: hostnames, VMIDs, storage names.
pub static TARGET_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid regex"));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
}

// Destructive or system-wide impact.
static HIGH_RISK: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\brm\s+(-rf?|--recursive)\s",
        r"(?i)\bdd\s+.*of=/dev/",
        r"(?i)\bmkfs\b",
        r"(?i)\bchmod\s+(-R\s+)?777\b",
        r"(?i)\bapt\s+(remove|purge)\b",
        r"(?i)\byum\s+(remove|erase)\b",
        r"(?i)\bdnf\s+remove\b",
        r"(?i)\bpacman\s+-R",
        r"(?i)\biptables\s+-F\b",
        r"(?i)\bsystemctl\s+(disable|mask)\b",
        r"(?i)\bkill\s+-9\s",
        r"(?i)\bpkill\s+-9\b",
        r"(?i)\bdocker\s+rm\s+-f",
        r"(?i)\bdocker\s+system\s+prune",
        r"(?i)\bpct\s+destroy\b",
        r"(?i)\bqm\s+destroy\b",
    ])
});

// Service impact but recoverable.
static MEDIUM_RISK: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)\bsystemctl\s+(restart|stop|start)\b",
        r"(?i)\bservice\s+\S+\s+(restart|stop|start)\b",
        r"(?i)\bdocker\s+(restart|stop|start|kill)\b",
        r"(?i)\bapt\s+(update|upgrade|install)\b",
        r"(?i)\byum\s+(update|install)\b",
        r"(?i)\bdnf\s+(update|install)\b",
        r"(?i)\bpct\s+(start|stop|reboot|resize)\b",
        r"(?i)\bqm\s+(start|stop|reboot|resize)\b",
        r"(?i)\bkill\b",
        r"(?i)\bpkill\b",
        r"(?i)\bchmod\b",
        r"(?i)\bchown\b",
        r"(?i)\bmv\s",
        r"(?i)\bcp\s+-r",
    ])
});

// Never executable, even with approval. Matched against the normalized
// (lowercased, whitespace-collapsed, sudo-stripped) command.
static BLOCKED: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\brm\s+-[a-z]*r[a-z]*f",
        r"\brm\s+-[a-z]*f[a-z]*r",
        r"\bmkfs(\.\w+)?\b",
        r"\bdd\s+.*of=/dev/[a-z]",
        r">\s*/dev/[sh]d[a-z]",
        r"\b(shutdown|poweroff|halt)\b",
        r"\binit\s+0\b",
        r"\bapt(-get)?\s+(remove|purge)\s+.*(pve|proxmox|kernel)",
        r"\bchmod\s+(-r\s+)?777\s+/\S*",
        r"\bchown\s+-r\s+\S+\s+/\s*$",
        r"\b(curl|wget)\b.*\|\s*(ba|z|da)?sh\b",
        r"\b(xmrig|minerd|cryptonight|stratum\+tcp)\b",
        r":\(\)\s*\{\s*:\|:&\s*\}\s*;\s*:",
        r">\s*/var/log/\S+",
        r"\btruncate\s+.*-s\s*0\s+/var/log",
        r"\bdrop\s+(database|table)\b",
    ])
});

fn normalize(command: &str) -> String {
    let collapsed = command
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    match collapsed.strip_prefix("sudo ") {
        Some(rest) => rest.to_string(),
        None => collapsed,
    }
}

/// True when the command may never be executed by the remediation engine.
pub fn is_blocked(command: &str) -> bool {
    let normalized = normalize(command);
    if normalized.is_empty() {
        return false;
    }
    BLOCKED.iter().any(|p| p.is_match(&normalized))
}

/// Classifies a command for the approval surface. Service-impact commands
/// on a node target are promoted to high: a node restart takes every guest
/// on it down.
pub fn assess_command_risk(command: &str, target_type: &str) -> CommandRisk {
    if HIGH_RISK.iter().any(|p| p.is_match(command)) {
        return CommandRisk::High;
    }
    if MEDIUM_RISK.iter().any(|p| p.is_match(command)) {
        if target_type == "node" {
            return CommandRisk::High;
        }
        return CommandRisk::Medium;
    }
    CommandRisk::Low
}
