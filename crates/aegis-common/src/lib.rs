//! Common types and utilities for AEGIS
//!
//! This crate provides the shared domain model, configuration, error
//! taxonomy, and metric instruments used across all components of the
//! incident-to-production pipeline.

pub mod config;
pub mod error;
pub mod metrics;
pub mod retry;
pub mod types;
pub mod utils;

pub use config::{ApprovalPolicy, Config};
pub use error::{Error, Result};
pub use retry::{retry_transient, RetryConfig, SHADOW_RETRY_DELAYS};
pub use types::*;
