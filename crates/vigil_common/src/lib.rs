//! Shared primitives for the vigil operational memory stores.
//!
//! Everything here is consumed by `vigil_core`: ID generation, bounded JSON
//! persistence, human-readable formatters, keyword similarity, and the
//! command risk policy shared by the approval store and remediation engine.

pub mod alert;
pub mod ids;
pub mod keywords;
pub mod persist;
pub mod resource;
pub mod safety;
pub mod timefmt;
