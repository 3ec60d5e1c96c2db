//! The ordered set of rules deciding whether a Pod may be removed from a Node, mirroring `kubectl drain`.
use super::status::PodDeleteStatus;
use super::K8SEvictor;
use crate::client::DrainClient;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use models::constants::{
    DAEMONSET_KIND, DRAIN_POD_ANNOTATION, DRAIN_POD_ANNOTATION_FORCE, DRAIN_POD_ANNOTATION_IGNORE,
    DRAIN_POD_ANNOTATION_NEVER, MIRROR_POD_ANNOTATION, NAMESPACE_ALL, POD_PHASE_FAILED,
    POD_PHASE_SUCCEEDED, STORAGE_MEDIUM_MEMORY,
};

pub(crate) const DAEMONSET_FATAL: &str = "DaemonSet-managed Pods (use --ignore-daemonsets to ignore)";
pub(crate) const DAEMONSET_WARNING: &str = "ignoring DaemonSet-managed Pods";
pub(crate) const LOCAL_STORAGE_FATAL: &str =
    "Pods with local storage (use --delete-local-data to override)";
pub(crate) const LOCAL_STORAGE_WARNING: &str = "deleting Pods with local storage";
pub(crate) const UNMANAGED_FATAL: &str = "Pods not managed by ReplicationController, ReplicaSet, Job, DaemonSet or StatefulSet (use --force to override)";
pub(crate) const UNMANAGED_WARNING: &str =
    "deleting Pods not managed by ReplicationController, ReplicaSet, Job, DaemonSet or StatefulSet";

/// A single rule in the filter chain.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum PodFilter {
    Annotation,
    DaemonSet,
    MirrorPod,
    LocalStorage,
    Unreplicated,
}

/// Filters run in this order for every Pod.
pub(crate) const POD_FILTERS: [PodFilter; 5] = [
    PodFilter::Annotation,
    PodFilter::DaemonSet,
    PodFilter::MirrorPod,
    PodFilter::LocalStorage,
    PodFilter::Unreplicated,
];

impl<C: DrainClient> K8SEvictor<C> {
    /// Runs a Pod through the filter chain.
    ///
    /// The first filter refusing deletion decides the outcome. Otherwise the Pod is deleted, carrying the
    /// last warning raised along the way, if any.
    pub(crate) async fn classify_pod(&self, pod: &Pod) -> PodDeleteStatus {
        let mut status = PodDeleteStatus::okay();
        for filter in POD_FILTERS {
            let filter_status = self.apply_filter(filter, pod).await;
            if !filter_status.delete {
                return filter_status;
            }
            if filter_status.message.is_some() {
                status = filter_status;
            }
        }
        status
    }

    pub(crate) async fn apply_filter(&self, filter: PodFilter, pod: &Pod) -> PodDeleteStatus {
        match filter {
            PodFilter::Annotation => annotation_filter(pod),
            PodFilter::DaemonSet => self.daemon_set_filter(pod).await,
            PodFilter::MirrorPod => mirror_pod_filter(pod),
            PodFilter::LocalStorage => self.local_storage_filter(pod),
            PodFilter::Unreplicated => self.unreplicated_filter(pod),
        }
    }

    async fn daemon_set_filter(&self, pod: &Pod) -> PodDeleteStatus {
        // DaemonSet Pods are never deleted, regardless of flags, as the DaemonSet controller does not respect
        // cordons. The exception is orphaned Pods whose DaemonSet is gone, which are deleted when forcing.
        let controller_ref = match controller_of(pod) {
            Some(controller_ref) if controller_ref.kind == DAEMONSET_KIND => controller_ref,
            _ => return PodDeleteStatus::okay(),
        };
        if is_finished(pod) {
            return PodDeleteStatus::okay();
        }

        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        if let Err(err) = self
            .client
            .get_daemon_set(namespace, &controller_ref.name)
            .await
        {
            if err.is_not_found() && self.config.force {
                return PodDeleteStatus::warning(true, err.to_string());
            }
            return PodDeleteStatus::error(err.to_string());
        }

        let ignored = self.config.ignore_daemon_sets.iter().any(|daemon_set| {
            daemon_set.name == controller_ref.name
                && (daemon_set.namespace == namespace || daemon_set.namespace == NAMESPACE_ALL)
        });
        if ignored || self.config.ignore_all_daemon_sets {
            return PodDeleteStatus::warning(false, DAEMONSET_WARNING);
        }

        PodDeleteStatus::error(DAEMONSET_FATAL)
    }

    fn local_storage_filter(&self, pod: &Pod) -> PodDeleteStatus {
        if !has_local_storage(pod) || is_finished(pod) {
            return PodDeleteStatus::okay();
        }
        if !self.config.delete_local_data {
            return PodDeleteStatus::error(LOCAL_STORAGE_FATAL);
        }
        PodDeleteStatus::warning(true, LOCAL_STORAGE_WARNING)
    }

    fn unreplicated_filter(&self, pod: &Pod) -> PodDeleteStatus {
        if is_finished(pod) || controller_of(pod).is_some() {
            return PodDeleteStatus::okay();
        }
        if self.config.force {
            return PodDeleteStatus::warning(true, UNMANAGED_WARNING);
        }
        PodDeleteStatus::error(UNMANAGED_FATAL)
    }
}

fn annotation_filter(pod: &Pod) -> PodDeleteStatus {
    let value = match pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(DRAIN_POD_ANNOTATION))
    {
        Some(value) => value,
        None => return PodDeleteStatus::okay(),
    };

    let annotation = format!("due to annotation {}={}", DRAIN_POD_ANNOTATION, value);
    match value.as_str() {
        DRAIN_POD_ANNOTATION_FORCE => PodDeleteStatus::warning(true, format!("forced {}", annotation)),
        DRAIN_POD_ANNOTATION_IGNORE => {
            PodDeleteStatus::warning(false, format!("ignored {}", annotation))
        }
        DRAIN_POD_ANNOTATION_NEVER => {
            PodDeleteStatus::error(format!("cannot be drained {}", annotation))
        }
        _ => PodDeleteStatus::okay(),
    }
}

/// Static Pods are managed by the kubelet, the API server only holds a mirror of them.
fn mirror_pod_filter(pod: &Pod) -> PodDeleteStatus {
    let is_mirror = pod
        .metadata
        .annotations
        .as_ref()
        .map_or(false, |annotations| annotations.contains_key(MIRROR_POD_ANNOTATION));
    if is_mirror {
        PodDeleteStatus::skip()
    } else {
        PodDeleteStatus::okay()
    }
}

fn controller_of(pod: &Pod) -> Option<&OwnerReference> {
    pod.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|reference| reference.controller == Some(true))
}

fn is_finished(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .map_or(false, |phase| {
            phase == POD_PHASE_SUCCEEDED || phase == POD_PHASE_FAILED
        })
}

/// Whether the Pod keeps data in an `emptyDir` backed by the Node's disk.
fn has_local_storage(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.volumes.as_ref())
        .map_or(false, |volumes| {
            volumes.iter().any(|volume| {
                volume.empty_dir.as_ref().map_or(false, |empty_dir| {
                    empty_dir.medium.as_deref() != Some(STORAGE_MEDIUM_MEMORY)
                })
            })
        })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{mock::MockDrainClient, ClientError};
    use crate::evictor::status::PodDeleteStatusType;
    use crate::evictor::{DaemonSetRef, EvictorConfig};
    use crate::test_util::{api_error, fake_owned_pod, fake_pod, with_phase};

    use k8s_openapi::api::apps::v1::DaemonSet;
    use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, Volume};
    use maplit::btreemap;

    fn strict_config() -> EvictorConfig {
        EvictorConfig {
            force: false,
            delete_local_data: false,
            ignore_all_daemon_sets: false,
            ignore_daemon_sets: vec![],
            ..Default::default()
        }
    }

    fn evictor_with(client: MockDrainClient, config: EvictorConfig) -> K8SEvictor<MockDrainClient> {
        K8SEvictor::new(client, config)
    }

    fn daemon_set_exists() -> MockDrainClient {
        let mut client = MockDrainClient::new();
        client
            .expect_get_daemon_set()
            .returning(|_, _| Ok(DaemonSet::default()));
        client
    }

    fn daemon_set_missing() -> MockDrainClient {
        let mut client = MockDrainClient::new();
        client
            .expect_get_daemon_set()
            .returning(|namespace, name| {
                Err(ClientError::GetDaemonSet {
                    source: api_error(404, "NotFound"),
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })
            });
        client
    }

    fn annotated(mut pod: Pod, key: &str, value: &str) -> Pod {
        pod.metadata.annotations = Some(btreemap! { key.to_string() => value.to_string() });
        pod
    }

    fn with_empty_dir(mut pod: Pod, medium: Option<&str>) -> Pod {
        pod.spec.get_or_insert_with(Default::default).volumes = Some(vec![Volume {
            name: "scratch".to_string(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: medium.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        pod
    }

    #[test]
    fn test_annotation_filter() {
        let base = fake_owned_pod("default", "web-1", "ReplicaSet", "web");
        let test_cases = vec![
            ("force", true, PodDeleteStatusType::Warning),
            ("ignore", false, PodDeleteStatusType::Warning),
            ("never", false, PodDeleteStatusType::Error),
            ("sometimes", true, PodDeleteStatusType::Okay),
        ];

        for (value, delete, reason) in test_cases {
            let status = annotation_filter(&annotated(base.clone(), DRAIN_POD_ANNOTATION, value));
            assert_eq!(status.delete, delete, "{}", value);
            assert_eq!(status.reason, reason, "{}", value);
        }
    }

    #[tokio::test]
    async fn test_never_annotation_message() {
        let evictor = evictor_with(MockDrainClient::new(), EvictorConfig::default());
        let pod = annotated(
            fake_owned_pod("default", "web-1", "ReplicaSet", "web"),
            DRAIN_POD_ANNOTATION,
            "never",
        );

        let status = evictor.classify_pod(&pod).await;
        assert_eq!(
            status,
            PodDeleteStatus::error("cannot be drained due to annotation pod.alpha.kubernetes.io/drain=never")
        );
    }

    #[tokio::test]
    async fn test_running_daemon_set_pod_is_fatal_in_strict_mode() {
        let evictor = evictor_with(daemon_set_exists(), strict_config());
        for phase in ["Pending", "Running", "Unknown"] {
            let pod = with_phase(
                fake_owned_pod("monitoring", "agent-x1", "DaemonSet", "agent"),
                phase,
            );
            let status = evictor.classify_pod(&pod).await;
            assert_eq!(status, PodDeleteStatus::error(DAEMONSET_FATAL), "{}", phase);
        }
    }

    #[tokio::test]
    async fn test_daemon_set_ignore_list() {
        let config = EvictorConfig {
            ignore_daemon_sets: vec![
                DaemonSetRef::new("kube-system", "aws-node"),
                DaemonSetRef::new("", "node-exporter"),
            ],
            ..strict_config()
        };
        let evictor = evictor_with(daemon_set_exists(), config);

        let test_cases = vec![
            (fake_owned_pod("kube-system", "aws-node-1", "DaemonSet", "aws-node"), false),
            (fake_owned_pod("default", "aws-node-1", "DaemonSet", "aws-node"), true),
            (fake_owned_pod("monitoring", "ne-1", "DaemonSet", "node-exporter"), false),
        ];

        for (pod, fatal) in test_cases {
            let status = evictor.classify_pod(&pod).await;
            if fatal {
                assert_eq!(status, PodDeleteStatus::error(DAEMONSET_FATAL));
            } else {
                assert_eq!(status, PodDeleteStatus::warning(false, DAEMONSET_WARNING));
            }
        }
    }

    #[tokio::test]
    async fn test_ignore_all_daemon_sets() {
        let config = EvictorConfig {
            ignore_all_daemon_sets: true,
            ..strict_config()
        };
        let evictor = evictor_with(daemon_set_exists(), config);
        let pod = fake_owned_pod("monitoring", "agent-x1", "DaemonSet", "agent");

        assert_eq!(
            evictor.classify_pod(&pod).await,
            PodDeleteStatus::warning(false, DAEMONSET_WARNING)
        );
    }

    #[tokio::test]
    async fn test_orphaned_daemon_set_pod() {
        let pod = fake_owned_pod("monitoring", "agent-x1", "DaemonSet", "agent");

        let forced = evictor_with(
            daemon_set_missing(),
            EvictorConfig {
                force: true,
                ..strict_config()
            },
        );
        let status = forced.classify_pod(&pod).await;
        assert!(status.delete);
        assert_eq!(status.reason, PodDeleteStatusType::Warning);

        let strict = evictor_with(daemon_set_missing(), strict_config());
        let status = strict.classify_pod(&pod).await;
        assert!(!status.delete);
        assert_eq!(status.reason, PodDeleteStatusType::Error);
    }

    #[tokio::test]
    async fn test_daemon_set_lookup_failure_is_fatal_even_when_forcing() {
        let pod = fake_owned_pod("monitoring", "agent-x1", "DaemonSet", "agent");
        let config = EvictorConfig {
            force: true,
            ..strict_config()
        };

        for (code, reason) in [(403, "Forbidden"), (500, "InternalError")] {
            let mut client = MockDrainClient::new();
            client
                .expect_get_daemon_set()
                .times(1)
                .returning(move |namespace, name| {
                    Err(ClientError::GetDaemonSet {
                        source: api_error(code, reason),
                        namespace: namespace.to_string(),
                        name: name.to_string(),
                    })
                });
            let evictor = evictor_with(client, config.clone());

            let status = evictor.classify_pod(&pod).await;
            assert!(!status.delete, "{}", code);
            assert_eq!(status.reason, PodDeleteStatusType::Error, "{}", code);
            let message = status.message.unwrap_or_default();
            assert!(message.contains("monitoring/agent"), "{}", message);
        }
    }

    #[tokio::test]
    async fn test_mirror_pods_are_skipped() {
        let evictor = evictor_with(MockDrainClient::new(), strict_config());
        let test_cases = vec![
            fake_pod("kube-system", "kube-apiserver-node-1"),
            with_empty_dir(fake_pod("kube-system", "etcd-node-1"), None),
            with_phase(fake_pod("kube-system", "static-job-node-1"), "Succeeded"),
        ];

        for pod in test_cases {
            let pod = annotated(pod, MIRROR_POD_ANNOTATION, "checksum");
            assert_eq!(evictor.classify_pod(&pod).await, PodDeleteStatus::skip());
        }
    }

    #[tokio::test]
    async fn test_local_storage_filter() {
        let pod = with_empty_dir(fake_owned_pod("default", "cache-1", "ReplicaSet", "cache"), None);
        let in_memory = with_empty_dir(
            fake_owned_pod("default", "cache-2", "ReplicaSet", "cache"),
            Some("Memory"),
        );

        let strict = evictor_with(MockDrainClient::new(), strict_config());
        assert_eq!(
            strict.classify_pod(&pod).await,
            PodDeleteStatus::error(LOCAL_STORAGE_FATAL)
        );
        assert_eq!(strict.classify_pod(&in_memory).await, PodDeleteStatus::okay());

        let permissive = evictor_with(
            MockDrainClient::new(),
            EvictorConfig {
                delete_local_data: true,
                ..strict_config()
            },
        );
        assert_eq!(
            permissive.classify_pod(&pod).await,
            PodDeleteStatus::warning(true, LOCAL_STORAGE_WARNING)
        );
    }

    #[tokio::test]
    async fn test_unreplicated_filter() {
        let pod = fake_pod("default", "bare-1");

        let strict = evictor_with(MockDrainClient::new(), strict_config());
        assert_eq!(
            strict.classify_pod(&pod).await,
            PodDeleteStatus::error(UNMANAGED_FATAL)
        );

        let forced = evictor_with(
            MockDrainClient::new(),
            EvictorConfig {
                force: true,
                ..strict_config()
            },
        );
        assert_eq!(
            forced.classify_pod(&pod).await,
            PodDeleteStatus::warning(true, UNMANAGED_WARNING)
        );
    }

    #[tokio::test]
    async fn test_finished_pods_pass_every_filter() {
        // The DaemonSet lookup is not reached for finished Pods.
        let evictor = evictor_with(MockDrainClient::new(), strict_config());
        let test_cases = vec![
            fake_pod("default", "bare-1"),
            fake_owned_pod("monitoring", "agent-x1", "DaemonSet", "agent"),
            with_empty_dir(fake_pod("default", "scratch-1"), None),
            with_empty_dir(
                fake_owned_pod("default", "job-1", "Job", "nightly"),
                Some(""),
            ),
        ];

        for phase in ["Succeeded", "Failed"] {
            for pod in test_cases.iter().cloned() {
                let pod = with_phase(pod, phase);
                for filter in POD_FILTERS {
                    assert_eq!(
                        evictor.apply_filter(filter, &pod).await,
                        PodDeleteStatus::okay(),
                        "{:?} {}",
                        filter,
                        phase
                    );
                }
            }
        }
    }

    #[tokio::test]
    async fn test_warning_survives_later_filters() {
        let evictor = evictor_with(MockDrainClient::new(), EvictorConfig::default());
        let pod = annotated(
            fake_owned_pod("default", "web-1", "ReplicaSet", "web"),
            DRAIN_POD_ANNOTATION,
            "force",
        );

        let status = evictor.classify_pod(&pod).await;
        assert!(status.delete);
        assert_eq!(status.reason, PodDeleteStatusType::Warning);
    }
}
