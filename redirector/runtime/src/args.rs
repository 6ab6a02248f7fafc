use crate::{
    endpoint::EndpointRedirector,
    metrics::Metrics,
    probe,
    redirector::{self, Signals},
    ruleset::RulesetRedirector,
};
use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use metadata_redirector_core::{Backoff, Exit, Redirect};
use metadata_redirector_hns::{Gateway, PipeTransport, RoutePolicy};
use metadata_redirector_iptables::{self as iptables, Iptables};
use metadata_redirector_k8s::{pods, Api, Node, Pod, PodLister, Scope};
use prometheus_client::registry::Registry;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
    time::Duration,
};
use tracing::{error, info, info_span, Instrument};

#[cfg(unix)]
const DEFAULT_BACKEND_ADDR: &str = "/var/run/hcnproxy.sock";
#[cfg(windows)]
const DEFAULT_BACKEND_ADDR: &str = r"\\.\pipe\hcnproxy";

#[derive(Debug, Parser)]
#[clap(
    name = "metadata-redirector",
    about = "Redirects pods' metadata traffic to a node-local proxy"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "metadata_redirector=info,warn",
        env = "METADATA_REDIRECTOR_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The name of the node this agent runs on.
    #[clap(long, env = "NODE_NAME")]
    node_name: String,

    /// The node's IP, where the proxy listens.
    #[clap(long, env = "HOST_IP")]
    host_ip: IpAddr,

    #[clap(long, default_value = "169.254.169.254")]
    metadata_ip: IpAddr,

    #[clap(long, default_value = "80")]
    metadata_port: u16,

    /// The node-local proxy port that metadata traffic is redirected to.
    #[clap(long, default_value = "2579")]
    proxy_port: u16,

    #[clap(long, default_value = "0.0.0.0:8085")]
    probe_addr: SocketAddr,

    #[clap(long, value_enum, default_value = "endpoint-policy")]
    redirector: Strategy,

    /// How often the iptables rules are reasserted.
    #[clap(long, default_value = "60s", value_parser = parse_period)]
    iptables_update_interval: Duration,

    /// The host network service agent's socket (or named pipe on Windows).
    #[clap(long, default_value = DEFAULT_BACKEND_ADDR)]
    backend_addr: PathBuf,

    /// Taints the node while the host network service is unavailable.
    #[clap(long)]
    mark_unhealthy_node: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
enum Strategy {
    /// Attach a proxy policy to each pod's network endpoint.
    EndpointPolicy,
    /// Install one node-wide NAT rule.
    Iptables,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<Exit> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<Exit> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            node_name,
            host_ip,
            metadata_ip,
            metadata_port,
            proxy_port,
            probe_addr,
            redirector: strategy,
            iptables_update_interval,
            backend_addr,
            mark_unhealthy_node,
        } = self;

        let scope = Scope::new(node_name, host_ip.to_string());
        let redirect = Redirect {
            metadata: SocketAddr::new(metadata_ip, metadata_port),
            destination: SocketAddr::new(host_ip, proxy_port),
        };

        let mut prom = <Registry>::default();
        let metrics = Metrics::register(prom.sub_registry_with_prefix("redirector"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        info!(node = %scope.node_name(), ?redirect, ?strategy, "Starting");

        // Tasks the reconciler depends on. When any of them stops, the reconciler is shut down.
        let (shutdown_tx, shutdown_rx) = drain::channel();
        let signals = Signals {
            terminate: runtime.shutdown_handle(),
            shutdown: shutdown_rx,
        };
        let mut support = JoinSet::new();
        let (initialized_tx, initialized_rx) = watch::channel(false);

        let reconciler = match strategy {
            Strategy::EndpointPolicy => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let pods = runtime.watch_all::<Pod>(
                    watcher::Config::default().fields(&scope.field_selector()),
                );
                support.spawn(
                    pods::forward(pods, events_tx)
                        .map(|()| Err(anyhow!("pod watch ended")))
                        .instrument(info_span!("pods")),
                );

                let gateway = Gateway::new(
                    Arc::new(PipeTransport::new(backend_addr)),
                    Backoff::default(),
                );
                let lister = PodLister::new(runtime.client(), &scope);
                let marker = mark_unhealthy_node.then(|| Api::<Node>::all(runtime.client()));
                let probe = probe::Extended::new(
                    initialized_rx,
                    gateway.clone(),
                    lister.clone(),
                    marker,
                    scope.clone(),
                    metadata_ip,
                    metrics.clone(),
                );
                support.spawn(probe::serve(
                    probe_addr,
                    Arc::new(probe),
                    runtime.shutdown_handle(),
                ));

                let routes = RoutePolicy::new(gateway, Backoff::default(), redirect);
                let endpoints = EndpointRedirector::new(routes, lister, events_rx, scope, metrics);
                tokio::spawn(
                    redirector::run(endpoints, initialized_tx, signals)
                        .instrument(info_span!("endpoint_policy")),
                )
            }

            Strategy::Iptables => {
                let probe = probe::Minimal::new(initialized_rx);
                support.spawn(probe::serve(
                    probe_addr,
                    Arc::new(probe),
                    runtime.shutdown_handle(),
                ));

                let ruleset = Iptables::new(iptables::Command::default(), &redirect);
                let rules = RulesetRedirector::new(ruleset, iptables_update_interval);
                tokio::spawn(
                    redirector::run(rules, initialized_tx, signals)
                        .instrument(info_span!("iptables")),
                )
            }
        };

        tokio::spawn(async move {
            match support.join_next().await {
                Some(Ok(Ok(()))) => info!("Support task completed"),
                Some(Ok(Err(error))) => error!(%error, "Support task failed"),
                Some(Err(error)) => error!(%error, "Support task panicked"),
                None => return,
            }
            shutdown_tx.drain().await;
        });

        // Block on either the reconciler exiting on its own or the shutdown signal. Once the
        // signal fires, the runtime waits for the reconciler to complete its teardown.
        tokio::pin!(reconciler);
        let exit = tokio::select! {
            res = &mut reconciler => res??,
            res = runtime.run() => {
                if res.is_err() {
                    bail!("Aborted");
                }
                reconciler.await??
            }
        };

        info!(code = exit.code(), "Exiting");
        Ok(exit)
    }
}

/// Parses a non-zero period like `500ms`, `60s`, or `5m`.
fn parse_period(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (value, unit) = s.split_at(split);
    let value = value
        .parse::<u64>()
        .with_context(|| format!("invalid period {s:?}"))?;

    let secs_per_unit = match unit {
        "ms" => return non_zero(Duration::from_millis(value)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => bail!("invalid period unit {unit:?} (expected one of 'ms', 's', 'm', or 'h')"),
    };
    let secs = value
        .checked_mul(secs_per_unit)
        .ok_or_else(|| anyhow!("period {s:?} is too large"))?;
    non_zero(Duration::from_secs(secs))
}

fn non_zero(period: Duration) -> Result<Duration> {
    if period.is_zero() {
        bail!("period must be non-zero");
    }
    Ok(period)
}
