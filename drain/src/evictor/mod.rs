//! Removes Pods from a Node, similar to the Pod handling of `kubectl drain`.
//!
//! Pods are removed with the Eviction API when the cluster serves it, which respects PodDisruptionBudgets
//! (PDBs). Otherwise, or when evictions are disabled, Pods are deleted outright. Which Pods may be removed at all
//! is decided by the filter chain in [`filter`].
mod filter;
pub mod status;

use crate::client::DrainClient;
use status::{pod_key, PodDelete, PodDeleteList};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use models::constants::{
    CORE_API_VERSION, DEFAULT_IGNORED_DAEMONSETS, DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS,
    EVICTION_KIND, EVICTION_SUBRESOURCE, POLICY_API_GROUP,
};
use snafu::{ensure, ResultExt};
use tokio::time::Duration;
use tracing::{event, instrument, Level};

pub use self::error::EvictorError;
type Result<T> = std::result::Result<T, EvictorError>;

pub mod error;

/// The default upper bound on the grace period given to a Pod being removed.
pub const DEFAULT_MAX_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

/// A DaemonSet whose Pods are left on the Node. An empty namespace matches the DaemonSet in any namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DaemonSetRef {
    pub namespace: String,
    pub name: String,
}

impl DaemonSetRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        DaemonSetRef {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Settings which decide which Pods are removed from a Node, and how.
#[derive(Clone, Debug)]
pub struct EvictorConfig {
    /// Label selector narrowing the Pods considered on each Node. Empty selects every Pod.
    pub pod_selector: String,
    /// Remove Pods which are not managed by a controller, and orphaned DaemonSet Pods.
    pub force: bool,
    /// Remove Pods using `emptyDir` volumes.
    pub delete_local_data: bool,
    /// Leave every DaemonSet-managed Pod in place rather than failing on them.
    pub ignore_all_daemon_sets: bool,
    pub ignore_daemon_sets: Vec<DaemonSetRef>,
    pub max_grace_period: Duration,
    /// Always delete Pods, even if the cluster serves the Eviction API.
    pub disable_eviction: bool,
}

impl Default for EvictorConfig {
    fn default() -> Self {
        EvictorConfig {
            pod_selector: String::new(),
            force: true,
            delete_local_data: true,
            ignore_all_daemon_sets: true,
            ignore_daemon_sets: DEFAULT_IGNORED_DAEMONSETS
                .iter()
                .map(|(namespace, name)| DaemonSetRef::new(*namespace, *name))
                .collect(),
            max_grace_period: DEFAULT_MAX_GRACE_PERIOD,
            disable_eviction: false,
        }
    }
}

/// How Pods are removed from the cluster, as learned through API discovery.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EvictionSupport {
    Supported { policy_group_version: String },
    Unsupported,
}

#[async_trait]
/// Removes the Pods of a single Node. This is provided as a trait in order to allow mocks to be used for
/// testing purposes.
pub trait Evictor: Send + Sync {
    /// Checks whether the cluster serves the Eviction API and remembers the answer.
    async fn can_use_evictions(&mut self) -> Result<()>;
    /// Evicts the Pod if evictions are available, otherwise deletes it.
    async fn evict_or_delete_pod(&self, pod: &Pod) -> Result<()>;
    /// Lists the Pods on a Node along with whether each may be removed. Fails if any Pod can never be removed, the
    /// error then carries the classified list.
    async fn get_pods_for_eviction(&self, node_name: &str) -> Result<PodDeleteList>;
}

/// Concrete implementation of the `Evictor` trait, backed by a `DrainClient`.
pub struct K8SEvictor<C: DrainClient> {
    client: C,
    config: EvictorConfig,
    eviction_support: Option<EvictionSupport>,
}

impl<C: DrainClient> K8SEvictor<C> {
    pub fn new(client: C, config: EvictorConfig) -> Self {
        K8SEvictor {
            client,
            config,
            eviction_support: None,
        }
    }

    /// The result of the last `can_use_evictions` call, if there was one.
    pub fn eviction_support(&self) -> Option<&EvictionSupport> {
        self.eviction_support.as_ref()
    }

    /// Seconds given to the Pod to terminate: its own grace period, capped at the configured maximum.
    fn grace_period_seconds(&self, pod: &Pod) -> u32 {
        let requested = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.termination_grace_period_seconds)
            .unwrap_or(DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS)
            .max(0) as u64;
        let capped = requested.min(self.config.max_grace_period.as_secs());
        u32::try_from(capped).unwrap_or(u32::MAX)
    }

    async fn discover_eviction_support(&self) -> Result<EvictionSupport> {
        let groups = self
            .client
            .server_groups()
            .await
            .context(error::DiscoverySnafu)?;

        let policy_group_version = groups
            .groups
            .iter()
            .find(|group| group.name == POLICY_API_GROUP)
            .and_then(|group| {
                group
                    .preferred_version
                    .as_ref()
                    .or_else(|| group.versions.first())
                    .map(|version| version.group_version.clone())
            });
        let policy_group_version = match policy_group_version {
            Some(group_version) => group_version,
            None => return Ok(EvictionSupport::Unsupported),
        };

        let resources = self
            .client
            .server_resources_for_group_version(CORE_API_VERSION)
            .await
            .context(error::DiscoverySnafu)?;
        let serves_eviction = resources
            .resources
            .iter()
            .any(|resource| {
                resource.name == EVICTION_SUBRESOURCE && resource.kind == EVICTION_KIND
            });

        if serves_eviction {
            Ok(EvictionSupport::Supported {
                policy_group_version,
            })
        } else {
            Ok(EvictionSupport::Unsupported)
        }
    }
}

#[async_trait]
impl<C: DrainClient> Evictor for K8SEvictor<C> {
    #[instrument(skip(self), err)]
    async fn can_use_evictions(&mut self) -> Result<()> {
        if self.eviction_support.is_some() {
            return Ok(());
        }

        let support = if self.config.disable_eviction {
            event!(Level::INFO, "Evictions are disabled, Pods will be deleted");
            EvictionSupport::Unsupported
        } else {
            self.discover_eviction_support().await?
        };

        match &support {
            EvictionSupport::Supported {
                policy_group_version,
            } => event!(
                Level::DEBUG,
                "Cluster serves the Eviction API via '{}'",
                policy_group_version
            ),
            EvictionSupport::Unsupported => {
                event!(Level::DEBUG, "Pods will be removed by deletion")
            }
        }
        self.eviction_support = Some(support);
        Ok(())
    }

    #[instrument(skip(self, pod), fields(pod = %pod_key(pod)), err)]
    async fn evict_or_delete_pod(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let grace_period_seconds = self.grace_period_seconds(pod);

        match &self.eviction_support {
            Some(EvictionSupport::Supported {
                policy_group_version,
            }) => self
                .client
                .evict_pod(&namespace, &name, policy_group_version, grace_period_seconds)
                .await
                .context(error::EvictPodSnafu { pod: pod_key(pod) }),
            _ => self
                .client
                .delete_pod(&namespace, &name, grace_period_seconds)
                .await
                .context(error::DeletePodSnafu { pod: pod_key(pod) }),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_pods_for_eviction(&self, node_name: &str) -> Result<PodDeleteList> {
        let pods = self
            .client
            .list_pods(&self.config.pod_selector, node_name)
            .await
            .context(error::ListPodsSnafu { node_name })?;

        let mut items = Vec::with_capacity(pods.len());
        for pod in pods {
            let status = self.classify_pod(&pod).await;
            items.push(PodDelete { pod, status });
        }
        let list = PodDeleteList::new(items);

        // The error carries the classified list.
        let errors = list.errors();
        ensure!(
            errors.is_empty(),
            error::PodsNotDeletableSnafu {
                node_name,
                errors,
                pods: list,
            }
        );

        Ok(list)
    }
}

#[cfg(any(feature = "mockall", test))]
pub mod mock {
    use super::*;
    use mockall::mock;

    mock! {
        /// A Mock Evictor for use in tests.
        pub Evictor {}
        #[async_trait]
        impl Evictor for Evictor {
            async fn can_use_evictions(&mut self) -> Result<()>;
            async fn evict_or_delete_pod(&self, pod: &Pod) -> Result<()>;
            async fn get_pods_for_eviction(&self, node_name: &str) -> Result<PodDeleteList>;
        }
    }
}
