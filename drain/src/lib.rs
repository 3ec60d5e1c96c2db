//! Safely removes the workloads from the Kubernetes Nodes of a nodegroup, similar to running `kubectl drain`
//! against each of them.
pub mod client;
pub mod cordon;
pub mod evictor;
pub mod nodegroup;

#[cfg(test)]
mod test_util;

pub use client::{DrainClient, K8SDrainClient};
pub use evictor::{DaemonSetRef, Evictor, EvictorConfig, K8SEvictor};
pub use nodegroup::{DrainError, DrainerConfig, NodeGroupDrainer};
