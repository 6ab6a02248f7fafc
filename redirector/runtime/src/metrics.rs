use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

/// Per-pod policy counters.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
    attempted: Family<PodLabels, Counter>,
    failed: Family<PodLabels, Counter>,
    mismatch: Family<PodLabels, Counter>,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct PodLabels {
    pod_ip: String,
    node: String,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let metrics = Self::default();
        reg.register(
            "policy_apply_attempted",
            "Total number of attempts to apply a pod's redirect policy",
            metrics.attempted.clone(),
        );
        reg.register(
            "policy_apply_failed",
            "Total number of failed attempts to apply a pod's redirect policy",
            metrics.failed.clone(),
        );
        reg.register(
            "policy_mismatch",
            "Total number of health checks that found a pod without its redirect policy",
            metrics.mismatch.clone(),
        );
        metrics
    }

    pub fn apply_attempted(&self, pod_ip: &str, node: &str) {
        self.attempted.get_or_create(&labels(pod_ip, node)).inc();
    }

    pub fn apply_failed(&self, pod_ip: &str, node: &str) {
        self.failed.get_or_create(&labels(pod_ip, node)).inc();
    }

    pub fn mismatch(&self, pod_ip: &str, node: &str) {
        self.mismatch.get_or_create(&labels(pod_ip, node)).inc();
    }

    #[cfg(test)]
    pub(crate) fn counts(&self, pod_ip: &str, node: &str) -> [u64; 3] {
        let labels = labels(pod_ip, node);
        [&self.attempted, &self.failed, &self.mismatch].map(|f| f.get_or_create(&labels).get())
    }
}

fn labels(pod_ip: &str, node: &str) -> PodLabels {
    PodLabels {
        pod_ip: pod_ip.to_string(),
        node: node.to_string(),
    }
}
