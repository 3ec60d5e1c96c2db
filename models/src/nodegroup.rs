use crate::constants::{EKS_NODEGROUP_NAME_LABEL, NODEGROUP_NAME_LABEL};

use serde::{Deserialize, Serialize};

use std::fmt;

/// A set of Kubernetes Nodes which are drained together.
pub trait KubeNodeGroup: Send + Sync {
    /// Returns the name of the nodegroup.
    fn name(&self) -> &str;
    /// Returns the label selector used to list the Nodes belonging to this nodegroup.
    fn label_selector(&self) -> String;
}

/// Describes who created a nodegroup, which determines how its Nodes are labelled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeGroupKind {
    /// Self-managed nodegroups created by eksctl.
    #[default]
    Unmanaged,
    /// EKS managed nodegroups created by eksctl.
    Managed,
    /// EKS managed nodegroups which eksctl did not create, and so carry no eksctl labels.
    UnownedManaged,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    #[serde(default)]
    pub kind: NodeGroupKind,
}

impl NodeGroup {
    pub fn new(name: impl Into<String>, kind: NodeGroupKind) -> Self {
        NodeGroup {
            name: name.into(),
            kind,
        }
    }

    pub fn unmanaged(name: impl Into<String>) -> Self {
        Self::new(name, NodeGroupKind::Unmanaged)
    }
}

impl KubeNodeGroup for NodeGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn label_selector(&self) -> String {
        match self.kind {
            NodeGroupKind::Unmanaged | NodeGroupKind::Managed => {
                format!("{}={}", NODEGROUP_NAME_LABEL, self.name)
            }
            NodeGroupKind::UnownedManaged => {
                format!("{}={}", EKS_NODEGROUP_NAME_LABEL, self.name)
            }
        }
    }
}

impl fmt::Display for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.label_selector())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_label_selector() {
        let test_cases = vec![
            (
                NodeGroup::unmanaged("ng-1"),
                "alpha.eksctl.io/nodegroup-name=ng-1",
            ),
            (
                NodeGroup::new("ng-2", NodeGroupKind::Managed),
                "alpha.eksctl.io/nodegroup-name=ng-2",
            ),
            (
                NodeGroup::new("ng-3", NodeGroupKind::UnownedManaged),
                "eks.amazonaws.com/nodegroup=ng-3",
            ),
        ];

        for (nodegroup, expected) in test_cases {
            assert_eq!(nodegroup.label_selector(), expected);
        }
    }

    #[test]
    fn test_kind_from_str() {
        let kind: NodeGroupKind = serde_plain::from_str("unownedmanaged").unwrap();
        assert_eq!(kind, NodeGroupKind::UnownedManaged);
        assert!(serde_plain::from_str::<NodeGroupKind>("fargate").is_err());
    }
}
