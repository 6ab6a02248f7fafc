#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod retry;

pub use self::retry::Backoff;
use std::net::SocketAddr;

/// The address that metadata requests target and the node-local proxy they are sent to
/// instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Redirect {
    pub metadata: SocketAddr,
    pub destination: SocketAddr,
}

/// How the process should exit once the redirector has been torn down.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Exit {
    Success,
    Failure,
}

// === impl Exit ===

impl Exit {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
        }
    }
}
