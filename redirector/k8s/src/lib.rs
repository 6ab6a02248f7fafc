#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod node;
pub mod pods;

pub use self::{
    node::{NodeMarker, UNHEALTHY_TAINT},
    pods::{PodEvent, PodLister, PodSource},
};
pub use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod, PodSpec, PodStatus, Taint};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client,
};

/// Identifies the pods whose metadata traffic this node redirects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    node_name: String,
    host_ip: String,
}

// === impl Scope ===

impl Scope {
    pub fn new(node_name: impl Into<String>, host_ip: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            host_ip: host_ip.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// A field selector matching pods scheduled to this node.
    pub fn field_selector(&self) -> String {
        format!("spec.nodeName={}", self.node_name)
    }

    /// Indicates whether the pod is scheduled to this node, regardless of its IP.
    pub fn on_node(&self, pod: &Pod) -> bool {
        node_name(pod) == Some(self.node_name.as_str())
    }

    /// Returns the pod's IP if the pod is scheduled to this node, has been assigned an IP, and
    /// does not share the node's network.
    pub fn pod_ip<'p>(&self, pod: &'p Pod) -> Option<&'p str> {
        if !self.on_node(pod) {
            return None;
        }
        pod_ip(pod).filter(|ip| *ip != self.host_ip)
    }
}

pub fn node_name(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref()?.node_name.as_deref()
}

/// The pod's primary IP, if one has been assigned.
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .pod_ip
        .as_deref()
        .filter(|ip| !ip.is_empty())
}

#[cfg(test)]
pub(crate) fn mk_pod(name: &str, node: &str, ip: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: ip.map(Into::into),
            ..Default::default()
        }),
    }
}
