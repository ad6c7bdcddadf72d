//! Operational memory for an AI-assisted infrastructure monitor.
//!
//! Each module is one store: an in-memory state behind a lock, a bounded
//! history, atomic JSON persistence under a shared data directory, and a
//! prompt-formatting projection the patrol orchestrator splices into LLM
//! context. Stores own their data exclusively and never reference each
//! other's mutable state.

pub mod approval;
pub mod changes;
pub mod context;
pub mod correlation;
pub mod incidents;
pub mod patterns;
pub mod remediation;
pub mod remlog;
pub mod rootcause;
