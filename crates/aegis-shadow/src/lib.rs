//! Shadow-environment manager for AEGIS
//!
//! A shadow environment is an ephemeral, quota-bounded, network-isolated
//! clone of a production workload. Candidate fixes are exercised here behind
//! the security gate chain before anything touches the source namespace.

pub mod changes;
pub mod health;
pub mod manager;

pub use changes::{ChangeOp, ChangeSet};
pub use health::{HealthMonitor, HealthVerdict, PASS_THRESHOLD};
pub use manager::{strip_cluster_fields, ShadowManager, SHADOW_LABEL};
