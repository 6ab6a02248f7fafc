//! A node-wide metadata redirect expressed as one `nat` table chain.
//!
//! Traffic that enters the node (i.e. from pods) and targets the metadata address is DNATed to
//! the node-local proxy. Host-originated traffic never traverses `PREROUTING`, and the rule
//! additionally excludes the host IP as a source.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use metadata_redirector_core::Redirect;
use std::io;
use thiserror::Error;
use tracing::{debug, info, instrument};


pub const CHAIN: &str = "metadata-redirect";
const TABLE: &str = "nat";
const ENTRY_CHAIN: &str = "PREROUTING";

/// Exit status used by iptables when a checked rule or listed chain does not exist.
const NOT_FOUND: i32 = 1;

/// A node-wide rule set that may be asserted repeatedly and removed.
#[async_trait::async_trait]
pub trait Ruleset: Send + Sync {
    /// Idempotently installs the rule set, replacing drifted rules.
    async fn ensure(&self) -> Result<(), Error>;

    /// Logs the installed rules.
    async fn log(&self) -> Result<(), Error>;

    async fn remove(&self) -> Result<(), Error>;
}

#[async_trait::async_trait]
impl<R: Ruleset + ?Sized> Ruleset for std::sync::Arc<R> {
    async fn ensure(&self) -> Result<(), Error> {
        (**self).ensure().await
    }

    async fn log(&self) -> Result<(), Error> {
        (**self).log().await
    }

    async fn remove(&self) -> Result<(), Error> {
        (**self).remove().await
    }
}

/// Runs an iptables command.
#[async_trait::async_trait]
pub trait Exec: Send + Sync {
    async fn exec(&self, args: &[String]) -> io::Result<Output>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Executes the `iptables` binary.
#[derive(Clone, Debug)]
pub struct Command {
    program: String,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run iptables {args}: {source}")]
    Spawn {
        args: String,
        #[source]
        source: io::Error,
    },

    #[error("iptables {args} failed ({code:?}): {stderr}")]
    Failed {
        args: String,
        code: Option<i32>,
        stderr: String,
    },
}

pub struct Iptables<E = Command> {
    exec: E,
    rule: Vec<String>,
}

// === impl Command ===

impl Default for Command {
    fn default() -> Self {
        Self {
            program: "iptables".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Exec for Command {
    async fn exec(&self, args: &[String]) -> io::Result<Output> {
        let out = tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await?;
        Ok(Output {
            code: out.status.code(),
            stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        })
    }
}

// === impl Iptables ===

impl<E: Exec> Iptables<E> {
    pub fn new(exec: E, redirect: &Redirect) -> Self {
        let host = redirect.destination.ip().to_string();
        let metadata_ip = redirect.metadata.ip().to_string();
        let metadata_port = redirect.metadata.port().to_string();
        let destination = redirect.destination.to_string();
        let rule = [
            "!",
            "-s",
            host.as_str(),
            "-p",
            "tcp",
            "-d",
            metadata_ip.as_str(),
            "--dport",
            metadata_port.as_str(),
            "-j",
            "DNAT",
            "--to-destination",
            destination.as_str(),
        ]
        .into_iter()
        .map(String::from)
        .collect();
        Self { exec, rule }
    }

    /// The redirect rule's match and target arguments.
    pub fn rule(&self) -> &[String] {
        &self.rule
    }

    fn args<'a>(
        op: &'a str,
        chain: &'a str,
        rest: impl IntoIterator<Item = &'a str>,
    ) -> Vec<String> {
        ["-w", "-t", TABLE, op, chain]
            .into_iter()
            .chain(rest)
            .map(String::from)
            .collect()
    }

    fn jump() -> [&'static str; 2] {
        ["-j", CHAIN]
    }

    async fn output(&self, args: Vec<String>) -> Result<Output, Error> {
        debug!(?args, "Running iptables");
        self.exec.exec(&args).await.map_err(|source| Error::Spawn {
            args: args.join(" "),
            source,
        })
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, Error> {
        let out = self.output(args.clone()).await?;
        if out.code != Some(0) {
            return Err(Error::Failed {
                args: args.join(" "),
                code: out.code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(out)
    }

    /// Runs a command for which exit status 1 means "absent".
    async fn probe(&self, args: Vec<String>) -> Result<bool, Error> {
        let out = self.output(args.clone()).await?;
        match out.code {
            Some(0) => Ok(true),
            Some(NOT_FOUND) => Ok(false),
            code => Err(Error::Failed {
                args: args.join(" "),
                code,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    async fn chain_exists(&self) -> Result<bool, Error> {
        self.probe(Self::args("-L", CHAIN, ["-n"])).await
    }

    async fn rule_exists(&self) -> Result<bool, Error> {
        let rule = self.rule.iter().map(String::as_str);
        self.probe(Self::args("-C", CHAIN, rule)).await
    }

    async fn jump_exists(&self) -> Result<bool, Error> {
        self.probe(Self::args("-C", ENTRY_CHAIN, Self::jump()))
            .await
    }

    async fn rules(&self) -> Result<Vec<String>, Error> {
        let out = self.run(Self::args("-S", CHAIN, [])).await?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| l.starts_with("-A "))
            .map(String::from)
            .collect())
    }
}

#[async_trait::async_trait]
impl<E: Exec> Ruleset for Iptables<E> {
    #[instrument(skip(self), fields(chain = CHAIN))]
    async fn ensure(&self) -> Result<(), Error> {
        if !self.chain_exists().await? {
            info!("Creating chain");
            self.run(Self::args("-N", CHAIN, [])).await?;
        }

        if !self.rule_exists().await? || self.rules().await?.len() != 1 {
            info!(rule = ?self.rule, "Replacing chain rules");
            self.run(Self::args("-F", CHAIN, [])).await?;
            let rule = self.rule.iter().map(String::as_str);
            self.run(Self::args("-A", CHAIN, rule)).await?;
        }

        if !self.jump_exists().await? {
            info!("Adding jump from {ENTRY_CHAIN}");
            let jump = std::iter::once("1").chain(Self::jump());
            self.run(Self::args("-I", ENTRY_CHAIN, jump)).await?;
        }

        Ok(())
    }

    async fn log(&self) -> Result<(), Error> {
        for rule in self.rules().await? {
            info!(chain = CHAIN, %rule);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(chain = CHAIN))]
    async fn remove(&self) -> Result<(), Error> {
        while self.jump_exists().await? {
            self.run(Self::args("-D", ENTRY_CHAIN, Self::jump())).await?;
        }

        if self.chain_exists().await? {
            self.run(Self::args("-F", CHAIN, [])).await?;
            self.run(Self::args("-X", CHAIN, [])).await?;
            info!("Deleted chain");
        }

        Ok(())
    }
}
