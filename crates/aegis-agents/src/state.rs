//! Stage routing for the analysis pipeline
//!
//! The pipeline is a static three-node DAG; every stage returns where to go
//! next rather than mutating any router state.

use aegis_common::PipelineStage;

/// Outcome of one stage run
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Continue with the named stage.
    Next(PipelineStage),
    /// Analysis complete; the state carries the results.
    Finish,
    /// Stop the pipeline; the reason lands in `PipelineState::error`.
    Abort(String),
}

impl Transition {
    pub fn abort(reason: impl Into<String>) -> Self {
        Transition::Abort(reason.into())
    }
}
