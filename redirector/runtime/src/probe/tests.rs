use super::*;
use http_body_util::BodyExt;
use metadata_redirector_core::Backoff;
use metadata_redirector_hns::{
    gateway::{Request as HnsRequest, Response as HnsResponse},
    Operation,
};
use metadata_redirector_k8s::{
    Node, NodeSpec, ObjectMeta, Pod, PodSpec, PodStatus, UNHEALTHY_TAINT,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

const NODE: &str = "node-a";

/// A host network service that is either unreachable or returns a fixed enumeration.
#[derive(Default)]
struct FakeService {
    endpoints: Mutex<Option<Value>>,
    enumerations: Mutex<usize>,
}

#[async_trait::async_trait]
impl Transport for FakeService {
    async fn invoke(&self, req: HnsRequest) -> HnsResponse {
        assert_eq!(req.operation, Operation::Enumerate, "probes never modify");
        *self.enumerations.lock() += 1;
        match self.endpoints.lock().clone() {
            Some(endpoints) => HnsResponse::ok(endpoints),
            None => HnsResponse::error("hcnproxy: connection refused"),
        }
    }
}

#[derive(Default)]
struct FakePods(Mutex<Option<Vec<Pod>>>);

#[async_trait::async_trait]
impl PodSource for FakePods {
    async fn list_pods(&self) -> Result<Vec<Pod>> {
        self.0
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("connection refused"))
    }
}

struct FakeNodes(Mutex<Node>);

#[async_trait::async_trait]
impl NodeMarker for FakeNodes {
    async fn get_node(&self, _: &str) -> Result<Node> {
        Ok(self.0.lock().clone())
    }

    async fn update_node(&self, node: &Node) -> Result<Node> {
        *self.0.lock() = node.clone();
        Ok(node.clone())
    }
}

impl FakeNodes {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(Node {
            metadata: ObjectMeta {
                name: Some(NODE.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        })))
    }

    fn tainted(&self) -> bool {
        self.0
            .lock()
            .spec
            .as_ref()
            .and_then(|s| s.taints.as_ref())
            .is_some_and(|taints| taints.iter().any(|t| t.key == UNHEALTHY_TAINT))
    }
}

type TestProbe = Extended<FakeService, Arc<FakePods>, Arc<FakeNodes>>;

struct Fixture {
    svc: Arc<FakeService>,
    pods: Arc<FakePods>,
    nodes: Arc<FakeNodes>,
    metrics: Metrics,
    initialized: watch::Sender<bool>,
    probe: TestProbe,
}

fn fixture(marker: bool) -> Fixture {
    let svc = Arc::new(FakeService::default());
    let pods = Arc::new(FakePods(Mutex::new(Some(vec![]))));
    let nodes = FakeNodes::new();
    let metrics = Metrics::default();
    let (initialized, rx) = watch::channel(false);
    let probe = Extended::new(
        rx,
        Gateway::new(svc.clone(), Backoff::default()),
        pods.clone(),
        marker.then(|| nodes.clone()),
        Scope::new(NODE, "10.240.0.4"),
        "169.254.169.254".parse().unwrap(),
        metrics.clone(),
    );
    Fixture {
        svc,
        pods,
        nodes,
        metrics,
        initialized,
        probe,
    }
}

fn mk_pod(name: &str, ip: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(NODE.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            pod_ip: Some(ip.to_string()),
            ..Default::default()
        }),
    }
}

#[tokio::test]
async fn minimal_reports_initialization() {
    let (tx, rx) = watch::channel(false);
    let probe = Minimal::new(rx);
    assert_eq!(probe.probe().await, (StatusCode::OK, "Not Active"));

    tx.send_replace(true);
    assert_eq!(probe.probe().await, (StatusCode::OK, "Active"));
}

#[tokio::test(start_paused = true)]
async fn unreachable_service_fails_and_taints_node() {
    let fx = fixture(true);
    fx.initialized.send_replace(true);

    assert_eq!(
        fx.probe.probe().await,
        (StatusCode::INTERNAL_SERVER_ERROR, "Active")
    );
    assert_eq!(*fx.svc.enumerations.lock(), 1, "probes do not retry");
    assert!(fx.nodes.tainted());
}

#[tokio::test(start_paused = true)]
async fn reachable_service_clears_taint() {
    let fx = fixture(true);
    fx.probe.probe().await;
    assert!(fx.nodes.tainted());

    *fx.svc.endpoints.lock() = Some(json!([]));
    assert_eq!(fx.probe.probe().await, (StatusCode::OK, "Not Active"));
    assert!(!fx.nodes.tainted());
}

#[tokio::test(start_paused = true)]
async fn unmarked_probe_never_taints() {
    let fx = fixture(false);
    assert_eq!(
        fx.probe.probe().await.0,
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert!(!fx.nodes.tainted());
}

#[tokio::test(start_paused = true)]
async fn counts_pods_missing_their_policy() {
    let fx = fixture(false);
    *fx.pods.0.lock() = Some(vec![
        mk_pod("redirected", "10.244.1.7"),
        mk_pod("drifted", "10.244.1.8"),
        mk_pod("no-endpoint", "10.244.1.9"),
    ]);
    *fx.svc.endpoints.lock() = Some(json!([
        {
            "ID": "ep-7",
            "IPAddress": "10.244.1.7",
            "Policies": [{"Type": "PROXY", "IP": "169.254.169.254", "Port": "80", "Destination": "10.240.0.4:2579"}],
        },
        {"ID": "ep-8", "IPAddress": "10.244.1.8", "Policies": [{"Type": "ACL"}]},
    ]));

    assert_eq!(fx.probe.probe().await.0, StatusCode::OK);
    assert_eq!(fx.metrics.counts("10.244.1.7", NODE)[2], 0);
    assert_eq!(fx.metrics.counts("10.244.1.8", NODE)[2], 1);
    assert_eq!(fx.metrics.counts("10.244.1.9", NODE)[2], 0);
}

#[tokio::test(start_paused = true)]
async fn listing_failure_does_not_change_status() {
    let fx = fixture(false);
    *fx.pods.0.lock() = None;
    *fx.svc.endpoints.lock() = Some(json!([]));
    assert_eq!(fx.probe.probe().await.0, StatusCode::OK);
}

async fn get(method: Method, path: &str) -> (StatusCode, String) {
    let (tx, rx) = watch::channel(true);
    let probe = Minimal::new(rx);
    let req = Request::builder()
        .method(method)
        .uri(path)
        .body(())
        .unwrap();
    let rsp = handle(&probe, req).await;
    drop(tx);
    let status = rsp.status();
    let body = rsp.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

#[tokio::test]
async fn serves_probe_at_healthz() {
    assert_eq!(
        get(Method::GET, "/healthz").await,
        (StatusCode::OK, "Active".to_string())
    );
    assert_eq!(get(Method::HEAD, "/healthz").await.0, StatusCode::OK);
    assert_eq!(get(Method::GET, "/metrics").await.0, StatusCode::NOT_FOUND);
    assert_eq!(
        get(Method::POST, "/healthz").await.0,
        StatusCode::METHOD_NOT_ALLOWED
    );
}
