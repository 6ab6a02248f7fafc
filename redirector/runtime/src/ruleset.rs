use crate::redirector::{Redirector, GRACE_PERIOD};
use anyhow::{Context, Result};
use metadata_redirector_core::Exit;
use metadata_redirector_iptables::Ruleset;
use tokio::time;
use tracing::{error, info, warn};

/// Redirects all pods on the node with a single node-wide rule set, periodically reasserted.
pub struct RulesetRedirector<R> {
    ruleset: R,
    interval: time::Interval,
}

// === impl RulesetRedirector ===

impl<R: Ruleset> RulesetRedirector<R> {
    pub fn new(ruleset: R, period: time::Duration) -> Self {
        let mut interval = time::interval_at(time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        Self { ruleset, interval }
    }
}

#[async_trait::async_trait]
impl<R: Ruleset> Redirector for RulesetRedirector<R> {
    type Update = ();

    async fn start(&mut self) -> Result<()> {
        self.ruleset
            .ensure()
            .await
            .context("failed to install metadata redirect rules")?;
        if let Err(error) = self.ruleset.log().await {
            warn!(%error, "Failed to list rules");
        }
        Ok(())
    }

    async fn next(&mut self) -> Option<()> {
        self.interval.tick().await;
        Some(())
    }

    async fn sync(&mut self, _: ()) {
        self.reconcile_all().await
    }

    async fn reconcile_all(&mut self) {
        match self.ruleset.ensure().await {
            Ok(()) => {
                if let Err(error) = self.ruleset.log().await {
                    warn!(%error, "Failed to list rules");
                }
            }
            Err(error) => warn!(%error, "Failed to reassert rules; retrying on next tick"),
        }
    }

    async fn teardown(&mut self) -> Exit {
        let exit = match self.ruleset.remove().await {
            Ok(()) => Exit::Success,
            Err(error) => {
                error!(%error, "Failed to remove metadata redirect rules");
                Exit::Failure
            }
        };

        info!(grace = ?GRACE_PERIOD, "Waiting for connections to complete");
        time::sleep(GRACE_PERIOD).await;
        exit
    }
}
