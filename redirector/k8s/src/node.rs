//! Demotes an unhealthy node by tainting it so that no new pods are scheduled to it.

use crate::{Node, NodeSpec, Taint};
use anyhow::Result;
use kube::api::{Api, PostParams};
use tracing::{debug, info};

pub const UNHEALTHY_TAINT: &str = "metadata-redirector.io/unhealthy";
const NO_SCHEDULE: &str = "NoSchedule";

/// Reads and writes node objects.
#[async_trait::async_trait]
pub trait NodeMarker: Send + Sync {
    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn update_node(&self, node: &Node) -> Result<Node>;
}

#[async_trait::async_trait]
impl<M: NodeMarker + ?Sized> NodeMarker for std::sync::Arc<M> {
    async fn get_node(&self, name: &str) -> Result<Node> {
        (**self).get_node(name).await
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        (**self).update_node(node).await
    }
}

#[async_trait::async_trait]
impl NodeMarker for Api<Node> {
    async fn get_node(&self, name: &str) -> Result<Node> {
        Ok(self.get(name).await?)
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("node has no name"))?;
        Ok(self.replace(name, &PostParams::default(), node).await?)
    }
}

/// Adds the unhealthy taint to the named node, if it is not already present.
///
/// Returns true if the node was updated.
pub async fn mark_unschedulable<M: NodeMarker + ?Sized>(marker: &M, name: &str) -> Result<bool> {
    let mut node = marker.get_node(name).await?;
    if !add_taint(&mut node) {
        debug!(node = %name, "Node already marked unschedulable");
        return Ok(false);
    }
    marker.update_node(&node).await?;
    info!(node = %name, taint = UNHEALTHY_TAINT, "Marked node unschedulable");
    Ok(true)
}

/// Removes the unhealthy taint from the named node, if present.
///
/// Returns true if the node was updated.
pub async fn clear_unschedulable<M: NodeMarker + ?Sized>(marker: &M, name: &str) -> Result<bool> {
    let mut node = marker.get_node(name).await?;
    if !remove_taint(&mut node) {
        return Ok(false);
    }
    marker.update_node(&node).await?;
    info!(node = %name, taint = UNHEALTHY_TAINT, "Cleared unschedulable mark");
    Ok(true)
}

fn is_unhealthy(taint: &Taint) -> bool {
    taint.key == UNHEALTHY_TAINT && taint.effect == NO_SCHEDULE
}

fn add_taint(node: &mut Node) -> bool {
    let spec = node.spec.get_or_insert_with(NodeSpec::default);
    let taints = spec.taints.get_or_insert_with(Vec::new);
    if taints.iter().any(is_unhealthy) {
        return false;
    }
    taints.push(Taint {
        key: UNHEALTHY_TAINT.to_string(),
        effect: NO_SCHEDULE.to_string(),
        ..Default::default()
    });
    true
}

fn remove_taint(node: &mut Node) -> bool {
    let Some(taints) = node.spec.as_mut().and_then(|s| s.taints.as_mut()) else {
        return false;
    };
    let before = taints.len();
    taints.retain(|t| !is_unhealthy(t));
    before != taints.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectMeta;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct FakeNodes {
        node: Mutex<Node>,
        updates: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl NodeMarker for FakeNodes {
        async fn get_node(&self, name: &str) -> Result<Node> {
            let node = self.node.lock().clone();
            anyhow::ensure!(node.metadata.name.as_deref() == Some(name), "not found");
            Ok(node)
        }

        async fn update_node(&self, node: &Node) -> Result<Node> {
            *self.updates.lock() += 1;
            *self.node.lock() = node.clone();
            Ok(node.clone())
        }
    }

    fn taint(key: &str, effect: &str) -> Taint {
        Taint {
            key: key.to_string(),
            effect: effect.to_string(),
            ..Default::default()
        }
    }

    fn nodes(taints: Option<Vec<Taint>>) -> FakeNodes {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("node-a".to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec {
                taints,
                ..Default::default()
            }),
            status: None,
        };
        FakeNodes {
            node: Mutex::new(node),
            ..Default::default()
        }
    }

    fn taints(nodes: &FakeNodes) -> Vec<Taint> {
        nodes
            .node
            .lock()
            .spec
            .clone()
            .and_then(|s| s.taints)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn mark_adds_taint_once() {
        let other = taint("node.kubernetes.io/disk-pressure", "NoSchedule");
        let nodes = nodes(Some(vec![other.clone()]));

        assert!(mark_unschedulable(&nodes, "node-a").await.unwrap());
        assert!(!mark_unschedulable(&nodes, "node-a").await.unwrap());

        assert_eq!(taints(&nodes), vec![other, taint(UNHEALTHY_TAINT, "NoSchedule")]);
        assert_eq!(*nodes.updates.lock(), 1);
    }

    #[tokio::test]
    async fn clear_removes_only_its_taint() {
        let other = taint("dedicated", "NoExecute");
        let same_key_other_effect = taint(UNHEALTHY_TAINT, "PreferNoSchedule");
        let nodes = nodes(Some(vec![
            other.clone(),
            taint(UNHEALTHY_TAINT, "NoSchedule"),
            same_key_other_effect.clone(),
        ]));

        assert!(clear_unschedulable(&nodes, "node-a").await.unwrap());
        assert_eq!(taints(&nodes), vec![other, same_key_other_effect]);
    }

    #[tokio::test]
    async fn clear_without_taint_does_not_update() {
        let nodes = nodes(None);
        assert!(!clear_unschedulable(&nodes, "node-a").await.unwrap());
        assert_eq!(*nodes.updates.lock(), 0);
    }

    #[tokio::test]
    async fn missing_node_is_an_error() {
        let nodes = nodes(None);
        assert!(mark_unschedulable(&nodes, "node-b").await.is_err());
        assert_eq!(*nodes.updates.lock(), 0);
    }
}
