//! Marks Nodes as (un)schedulable.
//!
//! `kube-rs` provides `Api::cordon()`, but that always sends a patch. The helper here only touches a Node when
//! its current state differs from the desired one, and can fall back to replacing the whole object.
use crate::client::{ClientError, DrainClient};

use k8s_openapi::api::core::v1::{Node, NodeSpec};
use kube::ResourceExt;
use snafu::ResultExt;
use tracing::{event, instrument, Level};

pub use self::error::CordonError;
type Result<T> = std::result::Result<T, CordonError>;

/// Wraps a Node together with the schedulability we want it to have.
pub struct CordonHelper {
    node: Node,
    desired: bool,
}

impl CordonHelper {
    /// `desired` is `true` to cordon the Node and `false` to uncordon it.
    pub fn new(node: &Node, desired: bool) -> Self {
        CordonHelper {
            node: node.clone(),
            desired,
        }
    }

    pub fn node_name(&self) -> String {
        self.node.name_any()
    }

    fn unschedulable(&self) -> bool {
        self.node
            .spec
            .as_ref()
            .and_then(|spec| spec.unschedulable)
            .unwrap_or(false)
    }

    /// Returns whether the Node's current schedulability disagrees with the desired state.
    pub fn is_update_required(&self) -> bool {
        self.unschedulable() != self.desired
    }

    fn desired_node(&self) -> Node {
        let mut node = self.node.clone();
        node.spec
            .get_or_insert_with(NodeSpec::default)
            .unschedulable = Some(self.desired);
        node
    }

    fn compute_patch(&self, desired_node: &Node) -> Result<json_patch::Patch> {
        let node_name = self.node_name();
        let current = serde_json::to_value(&self.node).context(error::SerializeNodeSnafu {
            node_name: node_name.clone(),
        })?;
        let desired = serde_json::to_value(desired_node)
            .context(error::SerializeNodeSnafu { node_name })?;

        Ok(json_patch::diff(&current, &desired))
    }

    /// Sends the schedulability change to the cluster.
    ///
    /// The first element is the outcome of the API call. The second holds the reason a patch could not be
    /// computed, in which case the Node was replaced wholesale instead of patched.
    #[instrument(skip(self, client), fields(node = %self.node_name(), desired = self.desired))]
    pub async fn patch_or_replace<C: DrainClient>(
        &self,
        client: &C,
    ) -> (Result<()>, Option<CordonError>) {
        let desired_node = self.desired_node();
        let patch = self.compute_patch(&desired_node);
        self.apply(client, patch, &desired_node).await
    }

    async fn apply<C: DrainClient>(
        &self,
        client: &C,
        patch: Result<json_patch::Patch>,
        desired_node: &Node,
    ) -> (Result<()>, Option<CordonError>) {
        let node_name = self.node_name();

        match patch {
            Ok(patch) => {
                let result = client
                    .patch_node(&node_name, &patch)
                    .await
                    .context(error::ApplySnafu { node_name });
                (result, None)
            }
            Err(patch_error) => {
                event!(
                    Level::DEBUG,
                    "Could not compute a patch, replacing the Node instead: '{}'",
                    patch_error
                );
                let result = client
                    .replace_node(desired_node)
                    .await
                    .context(error::ApplySnafu { node_name });
                (result, Some(patch_error))
            }
        }
    }
}

/// Describes a schedulability value for log messages.
pub fn cordon_status(desired: bool) -> &'static str {
    if desired {
        "cordon"
    } else {
        "uncordon"
    }
}

pub mod error {
    use super::ClientError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum CordonError {
        #[snafu(display("Unable to serialize Node '{}' to compute a patch: '{}'", node_name, source))]
        SerializeNode {
            source: serde_json::Error,
            node_name: String,
        },

        #[snafu(display("Unable to update schedulability of Node '{}': '{}'", node_name, source))]
        Apply {
            source: ClientError,
            node_name: String,
        },
    }
}
