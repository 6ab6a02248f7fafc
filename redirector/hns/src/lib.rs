//! Per-endpoint redirection policy, managed through the host network service.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod endpoint;
pub mod gateway;
mod locate;
mod pipe;
mod policy;


pub use self::{
    endpoint::{Endpoint, ProxyPolicy},
    gateway::{Entity, Gateway, Operation, Request, Response, Transport},
    locate::{LocateError, Locator},
    pipe::PipeTransport,
    policy::{Editor, ErrorKind, PodRoutes, PolicyError, RoutePolicy},
};
