//! Structured-output language-model client for AEGIS
//!
//! The pipeline never consumes free-form model text; every completion is
//! constrained by a response schema and deserialized into a domain type
//! before any downstream stage sees it.

mod client;
pub mod testing;

pub use client::{
    extract_content, extract_fenced_json, HttpLlmClient, LlmBackend, LlmRequest, StructuredClient,
};
