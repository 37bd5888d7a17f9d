//! Cluster API adapter and diagnostic collector for AEGIS
//!
//! The pipeline consumes the orchestrator through the narrow [`ClusterOps`]
//! trait; [`KubeCluster`] talks to a live API server and [`MockCluster`]
//! backs offline demos and tests.

pub mod diagnostics;
pub mod kube_client;
pub mod mock;
pub mod ops;

pub use diagnostics::DiagnosticCollector;
pub use kube_client::KubeCluster;
pub use mock::{MockCluster, PodFixture};
pub use ops::ClusterOps;
