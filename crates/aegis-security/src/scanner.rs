//! Scanner seam for the security gate chain

use aegis_common::{ResourceKind, ScanOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// How a scanner's verdict is treated when the scanner cannot run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    /// Missing tool yields `skipped`, which never blocks.
    Open,
    /// Missing tool blocks the gate.
    Closed,
}

/// Everything a scanner may need about the verification in progress
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub shadow_namespace: String,
    pub source_kind: ResourceKind,
    /// New image reference carried by the candidate changes, if any.
    pub image: Option<String>,
    /// Service URL resolved from the shadow namespace, if any.
    pub service_url: Option<String>,
    /// Manifests the fix proposal wants to deploy.
    pub manifests: BTreeMap<String, String>,
    pub verification_start: DateTime<Utc>,
}

impl ScanContext {
    pub fn new(shadow_namespace: impl Into<String>, source_kind: ResourceKind) -> Self {
        Self {
            shadow_namespace: shadow_namespace.into(),
            source_kind,
            image: None,
            service_url: None,
            manifests: BTreeMap::new(),
            verification_start: Utc::now(),
        }
    }
}

/// One stage of the security gate chain.
///
/// `scan` never returns an error: a scanner either produces a verdict
/// (findings or a clean pass) or reports `skipped` when it cannot run. The
/// chain turns a skipped outcome from a fail-closed scanner into a block, so
/// the skip-vs-fail policy lives in one place.
#[async_trait]
pub trait Scanner: Send + Sync {
    fn id(&self) -> &'static str;

    /// How the chain treats this scanner when it produced no verdict.
    fn fail_mode(&self) -> FailMode;

    /// Whether this scanner applies to the verification at hand.
    fn should_run(&self, context: &ScanContext) -> bool;

    async fn scan(&self, context: &ScanContext) -> ScanOutcome;
}
