use super::status::{PodDeleteError, PodDeleteList};
use crate::client::ClientError;

use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum EvictorError {
    #[snafu(display("Unable to discover whether the cluster serves the Eviction API: '{}'", source))]
    Discovery { source: ClientError },

    #[snafu(display("Unable to list Pods on Node '{}': '{}'", node_name, source))]
    ListPods {
        source: ClientError,
        node_name: String,
    },

    #[snafu(display("{}", errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")))]
    PodsNotDeletable {
        node_name: String,
        errors: Vec<PodDeleteError>,
        pods: PodDeleteList,
    },

    #[snafu(display("Unable to evict Pod '{}': '{}'", pod, source))]
    EvictPod { source: ClientError, pod: String },

    #[snafu(display("Unable to delete Pod '{}': '{}'", pod, source))]
    DeletePod { source: ClientError, pod: String },
}

impl EvictorError {
    /// Whether removing the Pod may succeed if attempted again later.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::EvictPod { source, .. } | Self::DeletePod { source, .. } => {
                source.is_recoverable()
            }
            _ => false,
        }
    }
}
