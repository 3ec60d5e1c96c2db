//! Fixtures shared by the unit tests of this crate.
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    APIGroupList, APIResourceList, ObjectMeta, OwnerReference,
};
use kube::core::ErrorResponse;

pub(crate) fn api_error(code: u16, reason: &str) -> kube::Error {
    let response: ErrorResponse = serde_json::from_value(serde_json::json!({
        "status": "Failure",
        "message": format!("request failed: {}", reason),
        "reason": reason,
        "code": code,
    }))
    .unwrap();
    kube::Error::Api(response)
}

pub(crate) fn fake_node(name: &str, unschedulable: Option<bool>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(NodeSpec {
            unschedulable,
            ..Default::default()
        }),
        status: None,
    }
}

pub(crate) fn fake_pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec::default()),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// A Pod controlled by a workload resource of the given kind.
pub(crate) fn fake_owned_pod(namespace: &str, name: &str, owner_kind: &str, owner: &str) -> Pod {
    let mut pod = fake_pod(namespace, name);
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: owner_kind.to_string(),
        name: owner.to_string(),
        uid: format!("{}-uid", owner),
        controller: Some(true),
        ..Default::default()
    }]);
    pod
}

pub(crate) fn with_phase(mut pod: Pod, phase: &str) -> Pod {
    pod.status = Some(PodStatus {
        phase: Some(phase.to_string()),
        ..Default::default()
    });
    pod
}

/// An `/apis` discovery response serving the given `(group, preferred group version)` pairs.
pub(crate) fn server_groups(groups: &[(&str, &str)]) -> APIGroupList {
    let groups: Vec<_> = groups
        .iter()
        .map(|(name, group_version)| {
            let version = group_version.rsplit('/').next().unwrap_or_default();
            serde_json::json!({
                "name": name,
                "versions": [{ "groupVersion": group_version, "version": version }],
                "preferredVersion": { "groupVersion": group_version, "version": version },
            })
        })
        .collect();

    serde_json::from_value(serde_json::json!({
        "kind": "APIGroupList",
        "apiVersion": "v1",
        "groups": groups,
    }))
    .unwrap()
}

/// The core `v1` resource list, optionally serving the Eviction subresource of Pods.
pub(crate) fn core_resources(serves_eviction: bool) -> APIResourceList {
    let mut resources = vec![serde_json::json!({
        "name": "pods",
        "singularName": "",
        "namespaced": true,
        "kind": "Pod",
        "verbs": ["create", "delete", "get", "list"],
    })];
    if serves_eviction {
        resources.push(serde_json::json!({
            "name": "pods/eviction",
            "singularName": "",
            "namespaced": true,
            "group": "policy",
            "version": "v1",
            "kind": "Eviction",
            "verbs": ["create"],
        }));
    }

    serde_json::from_value(serde_json::json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": "v1",
        "resources": resources,
    }))
    .unwrap()
}
