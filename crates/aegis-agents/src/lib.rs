//! Analysis stages for AEGIS
//!
//! Turns a collected fault context into a vetted fix proposal and, when the
//! fault warrants it, a verification plan: RCA → Fix → Verify over a shared
//! per-incident state.

pub mod guardrails;
pub mod pipeline;
pub mod prompts;
pub mod stages;
pub mod state;

pub use pipeline::AgentPipeline;
pub use stages::{FixStage, RcaStage, VerifyStage, MIN_RCA_CONFIDENCE};
pub use state::Transition;
