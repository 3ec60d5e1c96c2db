use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::DaemonSet,
    core::v1::{Node, Pod},
    policy::v1::Eviction,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroupList, APIResourceList, DeleteOptions, ObjectMeta,
};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use snafu::{OptionExt, ResultExt};
use std::sync::Arc;
use tracing::instrument;

pub use self::error::ClientError;
type Result<T> = std::result::Result<T, ClientError>;

#[async_trait]
/// The Kubernetes API calls needed to drain a nodegroup. This is provided as a trait in order to allow
/// mocks to be used for testing purposes.
pub trait DrainClient: Send + Sync {
    /// List the Nodes matching a label selector.
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;
    /// Apply a JSON patch to a Node.
    async fn patch_node(&self, node_name: &str, patch: &json_patch::Patch) -> Result<()>;
    /// Overwrite a Node with the given object.
    async fn replace_node(&self, node: &Node) -> Result<()>;
    /// List the Pods scheduled on a Node, optionally narrowed by a label selector. An empty selector
    /// matches every Pod.
    async fn list_pods(&self, label_selector: &str, node_name: &str) -> Result<Vec<Pod>>;
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet>;
    /// Create an Eviction for a Pod, using the discovered version of the `policy` API group.
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        policy_group_version: &str,
        grace_period_seconds: u32,
    ) -> Result<()>;
    /// Delete a Pod outright, bypassing PodDisruptionBudgets.
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: u32)
        -> Result<()>;
    /// Discovery: the API groups served by the cluster.
    async fn server_groups(&self) -> Result<APIGroupList>;
    /// Discovery: the resources served for a group version. `v1` refers to the core group.
    async fn server_resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<APIResourceList>;
}

#[async_trait]
impl<T> DrainClient for Arc<T>
where
    T: DrainClient,
{
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        (**self).list_nodes(label_selector).await
    }

    async fn patch_node(&self, node_name: &str, patch: &json_patch::Patch) -> Result<()> {
        (**self).patch_node(node_name, patch).await
    }

    async fn replace_node(&self, node: &Node) -> Result<()> {
        (**self).replace_node(node).await
    }

    async fn list_pods(&self, label_selector: &str, node_name: &str) -> Result<Vec<Pod>> {
        (**self).list_pods(label_selector, node_name).await
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        (**self).get_daemon_set(namespace, name).await
    }

    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        policy_group_version: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        (**self)
            .evict_pod(namespace, name, policy_group_version, grace_period_seconds)
            .await
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        (**self)
            .delete_pod(namespace, name, grace_period_seconds)
            .await
    }

    async fn server_groups(&self) -> Result<APIGroupList> {
        (**self).server_groups().await
    }

    async fn server_resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<APIResourceList> {
        (**self)
            .server_resources_for_group_version(group_version)
            .await
    }
}

const EVICTION_SUBRESOURCE_NAME: &str = "eviction";

/// Serializes the Eviction posted for a Pod.
///
/// `kube::Api::evict` always sends `policy/v1` and drops the delete options, so the body is built here with the
/// discovered API version and the grace period in `deleteOptions`.
pub(crate) fn eviction_body(
    namespace: &str,
    name: &str,
    policy_group_version: &str,
    grace_period_seconds: u32,
) -> serde_json::Result<Vec<u8>> {
    let eviction = Eviction {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        delete_options: Some(DeleteOptions {
            grace_period_seconds: Some(grace_period_seconds.into()),
            ..Default::default()
        }),
    };

    let mut body = serde_json::to_value(&eviction)?;
    body["apiVersion"] = serde_json::Value::from(policy_group_version);
    serde_json::to_vec(&body)
}

#[derive(Clone)]
/// Concrete implementation of the `DrainClient` trait. This implementation will almost
/// certainly be used in any case that isn't a unit test.
pub struct K8SDrainClient {
    k8s_client: kube::Client,
}

impl K8SDrainClient {
    pub fn new(k8s_client: kube::Client) -> Self {
        K8SDrainClient { k8s_client }
    }
}

impl From<kube::Client> for K8SDrainClient {
    fn from(k8s_client: kube::Client) -> Self {
        K8SDrainClient::new(k8s_client)
    }
}

#[async_trait]
impl DrainClient for K8SDrainClient {
    #[instrument(skip(self), err)]
    async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        let node_list = nodes
            .list(&ListParams::default().labels(label_selector))
            .await
            .context(error::ListNodesSnafu {
                selector: label_selector,
            })?;

        Ok(node_list.items)
    }

    #[instrument(skip(self, patch), err)]
    async fn patch_node(&self, node_name: &str, patch: &json_patch::Patch) -> Result<()> {
        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .patch(
                node_name,
                &PatchParams::default(),
                &Patch::Json::<()>(patch.clone()),
            )
            .await
            .context(error::PatchNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self, node), err)]
    async fn replace_node(&self, node: &Node) -> Result<()> {
        let node_name = node
            .metadata
            .name
            .as_deref()
            .context(error::MissingNodeNameSnafu)?;

        let nodes: Api<Node> = Api::all(self.k8s_client.clone());
        nodes
            .replace(node_name, &PostParams::default(), node)
            .await
            .context(error::ReplaceNodeSnafu { node_name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_pods(&self, label_selector: &str, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.k8s_client.clone());

        let mut list_params =
            ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        if !label_selector.is_empty() {
            list_params = list_params.labels(label_selector);
        }

        let pod_list = pods
            .list(&list_params)
            .await
            .context(error::ListPodsSnafu { node_name })?;

        Ok(pod_list.items)
    }

    #[instrument(skip(self), err)]
    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        let daemon_sets: Api<DaemonSet> = Api::namespaced(self.k8s_client.clone(), namespace);
        daemon_sets
            .get(name)
            .await
            .context(error::GetDaemonSetSnafu { namespace, name })
    }

    #[instrument(skip(self), err)]
    async fn evict_pod(
        &self,
        namespace: &str,
        name: &str,
        policy_group_version: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        let eviction = eviction_body(namespace, name, policy_group_version, grace_period_seconds)
            .context(error::SerializeEvictionSnafu { namespace, name })?;

        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        pods.create_subresource::<serde_json::Value>(
            EVICTION_SUBRESOURCE_NAME,
            name,
            &PostParams::default(),
            eviction,
        )
        .await
        .context(error::EvictPodSnafu { namespace, name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: u32,
    ) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.k8s_client.clone(), namespace);
        let delete_params = DeleteParams {
            grace_period_seconds: Some(grace_period_seconds),
            ..Default::default()
        };

        pods.delete(name, &delete_params)
            .await
            .context(error::DeletePodSnafu { namespace, name })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn server_groups(&self) -> Result<APIGroupList> {
        self.k8s_client
            .list_api_groups()
            .await
            .context(error::ServerGroupsSnafu)
    }

    #[instrument(skip(self), err)]
    async fn server_resources_for_group_version(
        &self,
        group_version: &str,
    ) -> Result<APIResourceList> {
        // Core resources are served under `/api`, everything else under `/apis`.
        let resources = if group_version.contains('/') {
            self.k8s_client
                .list_api_group_resources(group_version)
                .await
        } else {
            self.k8s_client.list_core_api_resources(group_version).await
        };

        resources.context(error::ServerResourcesSnafu { group_version })
    }
}

#[cfg(any(feature = "mockall", test))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A Mock DrainClient for use in tests.
        pub DrainClient {}
        #[async_trait]
        impl DrainClient for DrainClient {
            async fn list_nodes(&self, label_selector: &str) -> Result<Vec<Node>>;
            async fn patch_node(&self, node_name: &str, patch: &json_patch::Patch) -> Result<()>;
            async fn replace_node(&self, node: &Node) -> Result<()>;
            async fn list_pods(&self, label_selector: &str, node_name: &str) -> Result<Vec<Pod>>;
            async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet>;
            async fn evict_pod(
                &self,
                namespace: &str,
                name: &str,
                policy_group_version: &str,
                grace_period_seconds: u32,
            ) -> Result<()>;
            async fn delete_pod(
                &self,
                namespace: &str,
                name: &str,
                grace_period_seconds: u32,
            ) -> Result<()>;
            async fn server_groups(&self) -> Result<APIGroupList>;
            async fn server_resources_for_group_version(
                &self,
                group_version: &str,
            ) -> Result<APIResourceList>;
        }
    }
}

pub mod error {
    use http::StatusCode;
    use kube::core::ErrorResponse;
    use snafu::Snafu;

    // `Status.reason` values which mark a timed out request.
    const REASON_SERVER_TIMEOUT: &str = "ServerTimeout";
    const REASON_TIMEOUT: &str = "Timeout";

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum ClientError {
        #[snafu(display("Unable to list Nodes matching '{}': '{}'", selector, source))]
        ListNodes {
            source: kube::Error,
            selector: String,
        },

        #[snafu(display("Unable to patch Node '{}': '{}'", node_name, source))]
        PatchNode {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Unable to replace Node '{}': '{}'", node_name, source))]
        ReplaceNode {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Cannot replace a Node object which has no name"))]
        MissingNodeName,

        #[snafu(display("Unable to list Pods on Node '{}': '{}'", node_name, source))]
        ListPods {
            source: kube::Error,
            node_name: String,
        },

        #[snafu(display("Unable to get DaemonSet '{}/{}': '{}'", namespace, name, source))]
        GetDaemonSet {
            source: kube::Error,
            namespace: String,
            name: String,
        },

        #[snafu(display("Unable to build the Eviction for Pod '{}/{}': '{}'", namespace, name, source))]
        SerializeEviction {
            source: serde_json::Error,
            namespace: String,
            name: String,
        },

        #[snafu(display("Unable to evict Pod '{}/{}': '{}'", namespace, name, source))]
        EvictPod {
            source: kube::Error,
            namespace: String,
            name: String,
        },

        #[snafu(display("Unable to delete Pod '{}/{}': '{}'", namespace, name, source))]
        DeletePod {
            source: kube::Error,
            namespace: String,
            name: String,
        },

        #[snafu(display("Unable to discover server API groups: '{}'", source))]
        ServerGroups { source: kube::Error },

        #[snafu(display(
            "Unable to discover server resources for '{}': '{}'",
            group_version,
            source
        ))]
        ServerResources {
            source: kube::Error,
            group_version: String,
        },
    }

    impl ClientError {
        /// The error status returned by the API server, if the request reached it.
        pub fn api_error(&self) -> Option<&ErrorResponse> {
            let source = match self {
                Self::ListNodes { source, .. }
                | Self::PatchNode { source, .. }
                | Self::ReplaceNode { source, .. }
                | Self::ListPods { source, .. }
                | Self::GetDaemonSet { source, .. }
                | Self::EvictPod { source, .. }
                | Self::DeletePod { source, .. }
                | Self::ServerGroups { source }
                | Self::ServerResources { source, .. } => source,
                Self::MissingNodeName | Self::SerializeEviction { .. } => return None,
            };

            match source {
                kube::Error::Api(response) => Some(response),
                _ => None,
            }
        }

        /// The HTTP status of the failed request, if the API server answered.
        pub fn status_code(&self) -> Option<StatusCode> {
            self.api_error()
                .and_then(|response| StatusCode::from_u16(response.code).ok())
        }

        pub fn is_not_found(&self) -> bool {
            self.status_code() == Some(StatusCode::NOT_FOUND)
        }

        /// Whether a failed eviction is worth retrying later: the Pod is already gone, the server is
        /// overloaded, or a PodDisruptionBudget currently forbids the eviction.
        pub fn is_recoverable(&self) -> bool {
            let timed_out = self.api_error().map_or(false, |response| {
                response.reason == REASON_SERVER_TIMEOUT || response.reason == REASON_TIMEOUT
            });

            timed_out
                || matches!(
                    self.status_code(),
                    Some(
                        StatusCode::NOT_FOUND
                            | StatusCode::GONE
                            | StatusCode::TOO_MANY_REQUESTS
                            | StatusCode::SERVICE_UNAVAILABLE
                            | StatusCode::GATEWAY_TIMEOUT
                    )
                )
        }
    }

}
