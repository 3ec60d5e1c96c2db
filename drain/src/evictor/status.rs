use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use snafu::Snafu;

use std::collections::BTreeMap;

const UNEXPECTED_ERROR_MESSAGE: &str = "unexpected error";

/// The outcome of running a Pod through a delete filter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PodDeleteStatusType {
    Okay,
    Skip,
    Warning,
    Error,
}

/// A per-Pod decision made while preparing to drain a Node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PodDeleteStatus {
    pub delete: bool,
    pub reason: PodDeleteStatusType,
    pub message: Option<String>,
}

impl PodDeleteStatus {
    pub fn okay() -> Self {
        PodDeleteStatus {
            delete: true,
            reason: PodDeleteStatusType::Okay,
            message: None,
        }
    }

    pub fn skip() -> Self {
        PodDeleteStatus {
            delete: false,
            reason: PodDeleteStatusType::Skip,
            message: None,
        }
    }

    pub fn warning(delete: bool, message: impl Into<String>) -> Self {
        PodDeleteStatus {
            delete,
            reason: PodDeleteStatusType::Warning,
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PodDeleteStatus {
            delete: false,
            reason: PodDeleteStatusType::Error,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PodDelete {
    pub pod: Pod,
    pub status: PodDeleteStatus,
}

/// All Pods found on a Node, each paired with the decision made about it.
#[derive(Clone, Debug, Default)]
pub struct PodDeleteList {
    pub items: Vec<PodDelete>,
}

/// Pods which cannot be deleted for the same reason.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(display("cannot delete {}: {}", message, pods.join(", ")))]
pub struct PodDeleteError {
    pub message: String,
    pub pods: Vec<String>,
}

impl PodDeleteList {
    pub fn new(items: Vec<PodDelete>) -> Self {
        PodDeleteList { items }
    }

    /// Returns the Pods which should be evicted or deleted.
    pub fn pods(&self) -> Vec<&Pod> {
        self.items
            .iter()
            .filter(|item| item.status.delete)
            .map(|item| &item.pod)
            .collect()
    }

    /// Summarizes the warnings raised for this Node, grouping Pods by warning message.
    pub fn warnings(&self) -> String {
        group_by_message(&self.items, PodDeleteStatusType::Warning)
            .into_iter()
            .map(|(message, pods)| format!("{}: {}", message, pods.join(", ")))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Returns one error for every distinct reason that Pods on this Node cannot be deleted.
    pub fn errors(&self) -> Vec<PodDeleteError> {
        group_by_message(&self.items, PodDeleteStatusType::Error)
            .into_iter()
            .map(|(message, pods)| PodDeleteError { message, pods })
            .collect()
    }
}

/// `namespace/name` of a Pod, as shown in drain messages.
pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

fn group_by_message(
    items: &[PodDelete],
    reason: PodDeleteStatusType,
) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in items.iter().filter(|item| item.status.reason == reason) {
        let message = match item.status.message.as_deref() {
            Some(message) if !message.is_empty() => message.to_string(),
            _ => UNEXPECTED_ERROR_MESSAGE.to_string(),
        };
        groups.entry(message).or_default().push(pod_key(&item.pod));
    }
    groups
}
