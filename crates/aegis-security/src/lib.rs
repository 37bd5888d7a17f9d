//! Security gate chain for AEGIS shadow verification
//!
//! Four scanners run in a fixed order (image vulnerabilities, runtime
//! alerts, dynamic web scan, pre-deploy manifest scan), each with a declared
//! fail-open or fail-closed policy, aggregated into one `SecurityReport`
//! that governs whether a shadow verification may pass.

pub mod image_scan;
pub mod manifest_scan;
pub mod pipeline;
pub mod runtime_alerts;
pub mod scanner;
pub mod severity;
pub mod web_scan;

pub use image_scan::ImageScanner;
pub use manifest_scan::ManifestScanner;
pub use pipeline::{aggregate, SecurityPipeline};
pub use runtime_alerts::RuntimeAlertScanner;
pub use scanner::{FailMode, ScanContext, Scanner};
pub use severity::AlertPriority;
pub use web_scan::WebScanner;
