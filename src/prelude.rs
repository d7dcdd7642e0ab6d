//! The session prelude.
//!
//! The purpose of this module is to alleviate imports of common session
//! functionalities.

pub use crate::config::SessionConfig;
pub use crate::error::{Error, Result};
pub use crate::fabric::{Fabric, PortSpace, QpCaps, Wc, WcStatus};
pub use crate::rdma::cm::{CmId, ConnState, DisconnectMode, EventChannel};
pub use crate::rdma::cq::{CompChannel, Cq};
pub use crate::rdma::mr::{BufferDescriptor, Permission, Region};
pub use crate::rdma::pd::Pd;
pub use crate::rdma::qp::Qp;
pub use crate::session::{
    build_payload, run_acceptor, run_initiator, AcceptReport, Role, Session, TeardownReport,
    TransferReport,
};
