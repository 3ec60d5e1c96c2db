use drain::evictor::DEFAULT_MAX_GRACE_PERIOD;
use drain::nodegroup::{DEFAULT_POD_EVICTION_WAIT_PERIOD, DEFAULT_WAIT_TIMEOUT};
use drain::{DrainerConfig, EvictorConfig, K8SDrainClient, NodeGroupDrainer};
use models::nodegroup::{NodeGroup, NodeGroupKind};
use models::telemetry;

use argh::FromArgs;
use snafu::{ensure, ResultExt};
use std::process;
use std::time::Duration;
use tracing::{event, Level};

type Result<T> = std::result::Result<T, error::Error>;

#[derive(FromArgs, Debug)]
/// Cordon the Nodes of one or more nodegroups and evict their Pods.
struct Args {
    /// name of a nodegroup to drain, may be given more than once
    #[argh(option)]
    nodegroup: Vec<String>,

    /// the nodegroups are EKS managed nodegroups which were not created by eksctl
    #[argh(switch)]
    managed_unowned: bool,

    /// uncordon the nodegroups' Nodes instead of draining them
    #[argh(switch)]
    undo: bool,

    /// delete Pods instead of using the Eviction API, bypassing PodDisruptionBudgets
    #[argh(switch)]
    disable_eviction: bool,

    /// upper bound on the grace period given to each Pod (default: 10m)
    #[argh(option, default = "DEFAULT_MAX_GRACE_PERIOD", from_str_fn(parse_duration))]
    max_grace_period: Duration,

    /// pause between rounds of evictions on a Node (default: 10s)
    #[argh(
        option,
        default = "DEFAULT_POD_EVICTION_WAIT_PERIOD",
        from_str_fn(parse_duration)
    )]
    pod_eviction_wait_period: Duration,

    /// pause between draining two Nodes (default: 0s)
    #[argh(option, default = "Duration::ZERO", from_str_fn(parse_duration))]
    node_drain_wait_period: Duration,

    /// give up if a nodegroup is not drained within this time (default: 25m)
    #[argh(option, default = "DEFAULT_WAIT_TIMEOUT", from_str_fn(parse_duration))]
    timeout: Duration,

    /// only consider Pods matching this label selector
    #[argh(option, default = "String::new()")]
    pod_selector: String,

    /// remove Pods which are not managed by a controller (default: true)
    #[argh(option, default = "true")]
    force: bool,

    /// remove Pods using emptyDir volumes (default: true)
    #[argh(option, default = "true")]
    delete_local_data: bool,

    /// leave every DaemonSet-managed Pod in place (default: true)
    #[argh(option, default = "true")]
    ignore_daemonsets: bool,
}

impl Args {
    fn nodegroups(&self) -> Vec<NodeGroup> {
        let kind = if self.managed_unowned {
            NodeGroupKind::UnownedManaged
        } else {
            NodeGroupKind::Unmanaged
        };
        self.nodegroup
            .iter()
            .map(|name| NodeGroup::new(name, kind))
            .collect()
    }

    fn evictor_config(&self) -> EvictorConfig {
        EvictorConfig {
            pod_selector: self.pod_selector.clone(),
            force: self.force,
            delete_local_data: self.delete_local_data,
            ignore_all_daemon_sets: self.ignore_daemonsets,
            max_grace_period: self.max_grace_period,
            disable_eviction: self.disable_eviction,
            ..Default::default()
        }
    }

    fn drainer_config(&self) -> DrainerConfig {
        DrainerConfig {
            wait_timeout: self.timeout,
            node_drain_wait_period: self.node_drain_wait_period,
            pod_eviction_wait_period: self.pod_eviction_wait_period,
            undo: self.undo,
            ..Default::default()
        }
    }
}

fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| format!("invalid duration '{}': {}", value, e))
}

#[tokio::main]
async fn main() {
    let args: Args = argh::from_env();

    if let Err(e) = run(args).await {
        eprintln!("{}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    telemetry::init_telemetry_from_env().context(error::TelemetryInitSnafu)?;

    ensure!(!args.nodegroup.is_empty(), error::NoNodeGroupsSnafu);

    let k8s_client = kube::Client::try_default()
        .await
        .context(error::ClientCreateSnafu)?;
    let client = K8SDrainClient::new(k8s_client);

    for nodegroup in args.nodegroups() {
        event!(Level::INFO, %nodegroup, undo = args.undo, "Draining nodegroup");

        let mut drainer = NodeGroupDrainer::new(
            client.clone(),
            &nodegroup,
            args.evictor_config(),
            args.drainer_config(),
        );
        let drained = drainer.drain().await.context(error::DrainSnafu {
            nodegroup: nodegroup.name.clone(),
        })?;

        event!(
            Level::INFO,
            ?drained,
            "Finished with nodegroup '{}'",
            nodegroup.name
        );
    }

    Ok(())
}

pub mod error {
    use drain::DrainError;
    use models::telemetry::TelemetryConfigError;
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Error configuring tracing: '{}'", source))]
        TelemetryInit { source: TelemetryConfigError },

        #[snafu(display("At least one --nodegroup must be given"))]
        NoNodeGroups,

        #[snafu(display("Unable to create Kubernetes client: '{}'", source))]
        ClientCreate { source: kube::Error },

        #[snafu(display("Unable to drain nodegroup '{}': {}", nodegroup, source))]
        Drain {
            source: DrainError,
            nodegroup: String,
        },
    }
}
