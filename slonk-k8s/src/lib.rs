//! Slonk Kubernetes Integration
//!
//! Provides the Kubernetes client and the node operator implementing the
//! orchestration boundary of `slonk-core`.

pub mod client;
pub mod node_ops;

pub use client::K8sClient;
pub use node_ops::NodeOperator;
