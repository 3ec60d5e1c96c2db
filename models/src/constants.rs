/// Helper macro to avoid retyping the domain-like prefix eksctl uses for its own labels. When given no
/// parameters, this returns the prefix. When given a string literal parameter it adds `/parameter` to the end.
#[macro_export]
macro_rules! eksctl_domain {
    () => {
        "alpha.eksctl.io"
    };
    ($s:literal) => {
        concat!($crate::eksctl_domain!(), "/", $s)
    };
}

// Node label keys used to select the members of a nodegroup.
pub const NODEGROUP_NAME_LABEL: &str = eksctl_domain!("nodegroup-name");
pub const EKS_NODEGROUP_NAME_LABEL: &str = "eks.amazonaws.com/nodegroup";

// Pod annotations consulted while draining.
pub const DRAIN_POD_ANNOTATION: &str = "pod.alpha.kubernetes.io/drain";
pub const DRAIN_POD_ANNOTATION_FORCE: &str = "force";
pub const DRAIN_POD_ANNOTATION_IGNORE: &str = "ignore";
pub const DRAIN_POD_ANNOTATION_NEVER: &str = "never";
pub const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

// Pod phases after which a pod can always be removed.
pub const POD_PHASE_SUCCEEDED: &str = "Succeeded";
pub const POD_PHASE_FAILED: &str = "Failed";

pub const DAEMONSET_KIND: &str = "DaemonSet";
pub const STORAGE_MEDIUM_MEMORY: &str = "Memory";

// Eviction discovery.
pub const POLICY_API_GROUP: &str = "policy";
pub const EVICTION_KIND: &str = "Eviction";
pub const EVICTION_SUBRESOURCE: &str = "pods/eviction";
pub const CORE_API_VERSION: &str = "v1";

/// Matches DaemonSets in every namespace when used as the namespace of an ignore entry.
pub const NAMESPACE_ALL: &str = "";
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Used when a pod does not declare `terminationGracePeriodSeconds`.
pub const DEFAULT_TERMINATION_GRACE_PERIOD_SECONDS: i64 = 30;

/// DaemonSets whose pods are left in place when draining, as `(namespace, name)` pairs.
pub const DEFAULT_IGNORED_DAEMONSETS: &[(&str, &str)] = &[
    (KUBE_SYSTEM_NAMESPACE, "aws-node"),
    (KUBE_SYSTEM_NAMESPACE, "kube-proxy"),
    (NAMESPACE_ALL, "node-exporter"),
    (NAMESPACE_ALL, "prom-node-exporter"),
    (NAMESPACE_ALL, "weave-scope"),
    (NAMESPACE_ALL, "weave-scope-agent"),
    (NAMESPACE_ALL, "weave-net"),
];
