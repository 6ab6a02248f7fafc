use anyhow::Result;
use metadata_redirector_core::Exit;
use tokio::sync::watch;
use tracing::{info, instrument};

/// The time given to in-flight connections after redirection is removed.
pub const GRACE_PERIOD: tokio::time::Duration = tokio::time::Duration::from_secs(10);

/// A strategy for keeping metadata traffic redirected on this node.
#[async_trait::async_trait]
pub trait Redirector: Send {
    type Update: Send;

    /// Establishes redirection for the node's current state.
    ///
    /// An error aborts start-up.
    async fn start(&mut self) -> Result<()>;

    /// Waits for the next update to process, or returns `None` when no more updates can arrive.
    ///
    /// Must be cancel-safe.
    async fn next(&mut self) -> Option<Self::Update>;

    async fn sync(&mut self, update: Self::Update);

    /// Drives the node's entire desired state.
    async fn reconcile_all(&mut self);

    /// Removes redirection and waits out the grace period.
    async fn teardown(&mut self) -> Exit;
}

/// Shutdown signals observed by the reconciler.
pub struct Signals {
    /// Fired by the process runtime on SIGINT/SIGTERM.
    pub terminate: drain::Watch,
    /// Fired when a task the reconciler depends on has stopped.
    pub shutdown: drain::Watch,
}

/// Runs a redirector until it is signaled or its updates end, then tears it down.
///
/// `initialized` is set once start-up completes. Shutdown is held until teardown completes.
#[instrument(skip_all)]
pub async fn run<R: Redirector>(
    mut redirector: R,
    initialized: watch::Sender<bool>,
    Signals {
        terminate,
        shutdown,
    }: Signals,
) -> Result<Exit> {
    redirector.start().await?;
    initialized.send_replace(true);
    info!("Redirector initialized");

    let terminate = terminate.signaled();
    let shutdown = shutdown.signaled();
    tokio::pin!(terminate, shutdown);

    let _release = loop {
        tokio::select! {
            biased;
            handle = &mut terminate => {
                info!("Terminating");
                break Some(handle);
            }
            handle = &mut shutdown => {
                info!("Dependent task stopped; shutting down");
                break Some(handle);
            }
            update = redirector.next() => match update {
                Some(update) => redirector.sync(update).await,
                None => {
                    info!("Updates ended; shutting down");
                    break None;
                }
            },
        }
    };

    Ok(redirector.teardown().await)
}
