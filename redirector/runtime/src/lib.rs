#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
pub mod endpoint;
pub mod metrics;
pub mod probe;
pub mod redirector;
pub mod ruleset;

pub use self::{
    args::Args,
    endpoint::EndpointRedirector,
    redirector::{Redirector, Signals},
    ruleset::RulesetRedirector,
};
pub use metadata_redirector_core as core;
pub use metadata_redirector_hns as hns;
pub use metadata_redirector_iptables as iptables;
pub use metadata_redirector_k8s as k8s;
