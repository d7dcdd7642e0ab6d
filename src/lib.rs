//! Single-session RDMA: connection setup through the RDMA connection
//! manager, exchange of remote-access credentials, one-sided WRITE and READ
//! into the peer's memory, and an orderly teardown.
//!
//! Every device and connection-manager call goes through the [`Fabric`]
//! trait. Two fabrics ship with the crate:
//!
//! - [`fabric::verbs::Verbs`] (feature `verbs`) drives librdmacm and
//!   libibverbs;
//! - [`fabric::sim::SimFabric`] runs both peers inside one process, which
//!   is what the tests use.
//!
//! On top of the fabric sit owning wrappers of each resource ([`rdma`]) and
//! the [`Session`] that sequences them.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::thread;
//!
//! use roce_session::fabric::sim::SimFabric;
//! use roce_session::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let sim = SimFabric::new();
//!     let acceptor = sim.endpoint("acceptor");
//!     let server = thread::spawn(move || {
//!         let bind: SocketAddr = "0.0.0.0:4791".parse().unwrap();
//!         run_acceptor(&acceptor, bind, SessionConfig::default())
//!     });
//!
//!     let dst: SocketAddr = "127.0.0.1:4791".parse()?;
//!     let payload = build_payload(Some("AAAA"), None)?;
//!     let report = run_initiator(&sim.endpoint("initiator"), dst, payload, SessionConfig::default())?;
//!     assert!(report.verified);
//!
//!     server.join().unwrap()?;
//!     Ok(())
//! }
//! ```
//!
//! [`Fabric`]: fabric::Fabric
//! [`Session`]: session::Session

#[macro_use]
mod utils;

#[cfg(feature = "verbs")]
mod bindings;

pub mod config;
pub mod error;
pub mod fabric;
pub mod prelude;
pub mod rdma;
pub mod session;

pub use config::SessionConfig;
pub use error::{Error, Result};
