//! Owning wrappers of RDMA resources.
//!
//! Each wrapper releases its resource exactly once: through an explicit
//! `destroy`, which reports failure, or on drop, which logs it.

pub mod cm;
pub mod cq;
pub mod mr;
pub mod pd;
pub mod qp;
