//! Operator loop for AEGIS
//!
//! Wires the watcher, incident queue, analysis pipeline, shadow manager,
//! security gate chain, approval gate, and rollback watcher into the
//! incident-to-production flow, and exposes the `aegis` CLI.

pub mod approval;
pub mod executor;
pub mod processor;
pub mod rollback;
pub mod watcher;

pub use approval::{approval_required, ApprovalDecision, Approver, StaticApprover, TerminalApprover};
pub use executor::FixExecutor;
pub use processor::{candidate_changes, IncidentProcessor, ProcessOutcome};
pub use rollback::{RollbackOutcome, RollbackWatcher};
pub use watcher::{classify_deployment, classify_pod, Detection, EventWatcher};
