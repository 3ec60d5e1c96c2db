//! Drains every Node of a nodegroup.
//!
//! The drainer repeatedly lists the nodegroup's Nodes, cordons them and removes their Pods until no Node has any
//! removable Pod left, or until the wait timeout elapses. Nodes joining the nodegroup while a drain is in progress
//! are picked up on the next pass.
use crate::client::DrainClient;
use crate::cordon::{cordon_status, CordonHelper};
use crate::evictor::status::{pod_key, PodDeleteList};
use crate::evictor::{Evictor, EvictorConfig, EvictorError, K8SEvictor};
use models::nodegroup::KubeNodeGroup;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use snafu::ResultExt;
use std::collections::BTreeSet;
use tokio::time::{sleep, timeout, Duration, Instant};
use tracing::{event, instrument, Level};

pub use self::error::DrainError;
type Result<T> = std::result::Result<T, DrainError>;

/// Delay before retrying a Node whose eviction pass failed, or a failed Node listing.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(25 * 60);
pub const DEFAULT_POD_EVICTION_WAIT_PERIOD: Duration = Duration::from_secs(10);

// The count of Pods remaining on a Node is useful but noisy, so it is reported at most this often.
const PENDING_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Settings for the drain loop itself.
#[derive(Clone, Debug)]
pub struct DrainerConfig {
    /// Total time allowed for the whole nodegroup to be drained.
    pub wait_timeout: Duration,
    /// Pause between draining two Nodes.
    pub node_drain_wait_period: Duration,
    /// Pause between rounds of evictions on a single Node.
    pub pod_eviction_wait_period: Duration,
    pub retry_delay: Duration,
    /// Uncordon the nodegroup's Nodes instead of draining them.
    pub undo: bool,
}

impl Default for DrainerConfig {
    fn default() -> Self {
        DrainerConfig {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            node_drain_wait_period: Duration::ZERO,
            pod_eviction_wait_period: DEFAULT_POD_EVICTION_WAIT_PERIOD,
            retry_delay: RETRY_DELAY,
            undo: false,
        }
    }
}

/// Drains the Nodes of a single nodegroup.
pub struct NodeGroupDrainer<C: DrainClient, E: Evictor> {
    client: C,
    evictor: E,
    nodegroup_name: String,
    label_selector: String,
    config: DrainerConfig,
}

impl<C: DrainClient + Clone> NodeGroupDrainer<C, K8SEvictor<C>> {
    pub fn new(
        client: C,
        nodegroup: &dyn KubeNodeGroup,
        evictor_config: EvictorConfig,
        config: DrainerConfig,
    ) -> Self {
        let evictor = K8SEvictor::new(client.clone(), evictor_config);
        Self::with_evictor(client, evictor, nodegroup, config)
    }
}

impl<C: DrainClient, E: Evictor> NodeGroupDrainer<C, E> {
    pub fn with_evictor(
        client: C,
        evictor: E,
        nodegroup: &dyn KubeNodeGroup,
        config: DrainerConfig,
    ) -> Self {
        NodeGroupDrainer {
            client,
            evictor,
            nodegroup_name: nodegroup.name().to_string(),
            label_selector: nodegroup.label_selector(),
            config,
        }
    }

    /// Drains the nodegroup, returning the names of the Nodes which were drained.
    ///
    /// In undo mode the nodegroup's Nodes are uncordoned instead and no Node is reported as drained.
    #[instrument(skip(self), fields(nodegroup = %self.nodegroup_name), err)]
    pub async fn drain(&mut self) -> Result<BTreeSet<String>> {
        self.evictor
            .can_use_evictions()
            .await
            .context(error::EvictionSupportSnafu)?;

        let nodes = self
            .client
            .list_nodes(&self.label_selector)
            .await
            .context(error::ListNodesSnafu {
                nodegroup: &self.nodegroup_name,
            })?;

        if nodes.is_empty() {
            event!(
                Level::WARN,
                "No Nodes found in nodegroup '{}' (label selector: '{}')",
                self.nodegroup_name,
                self.label_selector
            );
            return Ok(BTreeSet::new());
        }

        if self.config.undo {
            for node in &nodes {
                self.toggle_cordon(node, false).await;
            }
            return Ok(BTreeSet::new());
        }

        timeout(self.config.wait_timeout, self.drain_until_empty())
            .await
            .map_err(|_| DrainError::Timeout {
                nodegroup: self.nodegroup_name.clone(),
                timeout: self.config.wait_timeout,
            })
    }

    /// Keeps cordoning and evicting until every listed Node has been drained. Never gives up on its own, the
    /// caller bounds it with a timeout.
    async fn drain_until_empty(&self) -> BTreeSet<String> {
        let mut drained = BTreeSet::new();

        loop {
            let nodes = match self.client.list_nodes(&self.label_selector).await {
                Ok(nodes) => nodes,
                Err(err) => {
                    event!(
                        Level::WARN,
                        "Unable to list Nodes of nodegroup '{}', retrying in {}: '{}'",
                        self.nodegroup_name,
                        humantime::format_duration(self.config.retry_delay),
                        err
                    );
                    sleep(self.config.retry_delay).await;
                    continue;
                }
            };

            let pending_nodes: Vec<&Node> = nodes
                .iter()
                .filter(|node| !drained.contains(&node.name_any()))
                .collect();
            for node in &pending_nodes {
                self.toggle_cordon(node, true).await;
            }

            let pending: Vec<String> = pending_nodes
                .iter()
                .map(|node| node.name_any())
                .collect();
            if pending.is_empty() {
                event!(
                    Level::INFO,
                    "Drained {} Node(s) in nodegroup '{}'",
                    drained.len(),
                    self.nodegroup_name
                );
                return drained;
            }
            event!(Level::DEBUG, ?pending, "Nodes waiting to be drained");

            for node_name in &pending {
                if let Err(err) = self.evict_pods(node_name).await {
                    event!(
                        Level::WARN,
                        "Pod eviction error on Node '{}', retrying in {}: '{}'",
                        node_name,
                        humantime::format_duration(self.config.retry_delay),
                        err
                    );
                    sleep(self.config.retry_delay).await;
                    continue;
                }

                event!(Level::INFO, node = %node_name, "Drained Node");
                drained.insert(node_name.clone());

                if !self.config.node_drain_wait_period.is_zero() {
                    event!(
                        Level::INFO,
                        "Waiting {} after draining Node '{}'",
                        humantime::format_duration(self.config.node_drain_wait_period),
                        node_name
                    );
                    sleep(self.config.node_drain_wait_period).await;
                }
            }
        }
    }

    /// Removes Pods from a Node until none are left to remove.
    ///
    /// Pods are listed again after every round, as Pods may still be terminating or new ones may have been
    /// scheduled before the cordon took effect.
    #[instrument(skip(self), err)]
    async fn evict_pods(&self, node_name: &str) -> Result<()> {
        let mut last_report = Instant::now();

        loop {
            let list = match self.evictor.get_pods_for_eviction(node_name).await {
                Ok(list) => list,
                Err(err) => {
                    if let EvictorError::PodsNotDeletable { pods, .. } = &err {
                        log_warnings(pods);
                    }
                    return Err(err).context(error::PodsForEvictionSnafu { node_name });
                }
            };

            let pods = list.pods();
            if pods.is_empty() {
                return Ok(());
            }

            if last_report.elapsed() > PENDING_REPORT_INTERVAL {
                event!(
                    Level::WARN,
                    "{} Pod(s) are unevictable from Node '{}'",
                    pods.len(),
                    node_name
                );
                last_report = Instant::now();
            }
            event!(
                Level::DEBUG,
                "{} Pod(s) to be evicted from Node '{}'",
                pods.len(),
                node_name
            );

            log_warnings(&list);

            for pod in pods {
                if pod.metadata.deletion_timestamp.is_some() {
                    event!(Level::TRACE, pod = %pod_key(pod), "Pod is already terminating");
                    continue;
                }

                match self.evictor.evict_or_delete_pod(pod).await {
                    Ok(()) => {}
                    Err(err) if err.is_recoverable() => {
                        event!(
                            Level::DEBUG,
                            "Recoverable error evicting Pod '{}', will retry: '{}'",
                            pod_key(pod),
                            err
                        );
                    }
                    Err(err) => {
                        return Err(err).context(error::UnrecoverableEvictionSnafu {
                            pod: pod_key(pod),
                        });
                    }
                }
            }

            sleep(self.config.pod_eviction_wait_period).await;
        }
    }

    /// Brings the Node's schedulability to `desired`. Failures are logged, the next pass will try again.
    async fn toggle_cordon(&self, node: &Node, desired: bool) {
        let helper = CordonHelper::new(node, desired);
        if !helper.is_update_required() {
            event!(
                Level::DEBUG,
                "No need to {} Node '{}'",
                cordon_status(desired),
                helper.node_name()
            );
            return;
        }

        let (result, patch_error) = helper.patch_or_replace(&self.client).await;
        if let Some(patch_error) = patch_error {
            event!(Level::WARN, "{}", patch_error);
        }
        match result {
            Ok(()) => event!(
                Level::INFO,
                "{}ed Node '{}'",
                cordon_status(desired),
                helper.node_name()
            ),
            Err(err) => event!(Level::ERROR, "{}", err),
        }
    }
}

fn log_warnings(list: &PodDeleteList) {
    let warnings = list.warnings();
    if !warnings.is_empty() {
        event!(Level::WARN, "{}", warnings);
    }
}

pub mod error {
    use crate::client::ClientError;
    use crate::evictor::EvictorError;

    use snafu::Snafu;
    use tokio::time::Duration;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum DrainError {
        #[snafu(display("checking if cluster implements policy API: {}", source))]
        EvictionSupport { source: EvictorError },

        #[snafu(display("Unable to list Nodes of nodegroup '{}': '{}'", nodegroup, source))]
        ListNodes {
            source: ClientError,
            nodegroup: String,
        },

        #[snafu(display(
            "timed out (after {}) waiting for nodegroup \"{}\" to be drained",
            humantime::format_duration(*timeout),
            nodegroup
        ))]
        Timeout {
            nodegroup: String,
            timeout: Duration,
        },

        #[snafu(display("Unable to determine which Pods to evict from Node '{}': {}", node_name, source))]
        PodsForEviction {
            source: EvictorError,
            node_name: String,
        },

        #[snafu(display("unrecoverable error evicting Pod '{}': {}", pod, source))]
        UnrecoverableEviction { source: EvictorError, pod: String },
    }
}
