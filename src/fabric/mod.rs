//! The device and connection-manager interface a session runs on.
//!
//! [`Fabric`] mirrors the librdmacm and libibverbs calls the session needs,
//! one method per verb, with handles as associated `Copy` types. The RAII
//! wrappers in [`crate::rdma`] own those handles; nothing above this module
//! touches a raw handle directly.
//!
//! Two fabrics are provided:
//!
//! - [`sim::SimFabric`], an in-process software fabric that runs both ends
//!   of a session inside one process;
//! - `verbs::Verbs` (feature `verbs`), the FFI binding to the system RDMA
//!   stack.

mod types;
mod wc;

pub mod sim;
#[cfg(feature = "verbs")]
pub mod verbs;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

pub use self::types::*;
pub use self::wc::*;
use crate::rdma::mr::Permission;

/// A provider of connection-manager and verbs resources.
///
/// Every method is a thin, synchronous call. Methods that wait
/// ([`get_cm_event`](Fabric::get_cm_event) and
/// [`get_cq_event`](Fabric::get_cq_event)) block the calling thread; no
/// method spawns work in the background.
///
/// Implementations are cheap handles: cloning one yields another reference
/// to the same underlying provider.
pub trait Fabric: Clone {
    type EventChannel: Copy + fmt::Debug;
    type CmId: Copy + fmt::Debug + PartialEq;
    type CmEvent: Copy + fmt::Debug;
    type Pd: Copy + fmt::Debug;
    type CompChannel: Copy + fmt::Debug;
    type Cq: Copy + fmt::Debug + PartialEq;
    type Mr: Copy + fmt::Debug;

    // Connection manager.

    fn create_event_channel(&self) -> io::Result<Self::EventChannel>;
    fn destroy_event_channel(&self, channel: Self::EventChannel) -> io::Result<()>;

    /// Block until the next connection event arrives on the channel.
    fn get_cm_event(&self, channel: Self::EventChannel) -> io::Result<Self::CmEvent>;
    fn cm_event_info(&self, event: Self::CmEvent) -> CmEventInfo<Self::CmId>;
    /// Release a connection event. Every event returned by
    /// [`get_cm_event`](Fabric::get_cm_event) must be acknowledged exactly once.
    fn ack_cm_event(&self, event: Self::CmEvent) -> io::Result<()>;

    fn create_id(&self, channel: Self::EventChannel, ps: PortSpace) -> io::Result<Self::CmId>;
    fn destroy_id(&self, id: Self::CmId) -> io::Result<()>;
    fn resolve_addr(&self, id: Self::CmId, dst: SocketAddr, timeout: Duration) -> io::Result<()>;
    fn resolve_route(&self, id: Self::CmId, timeout: Duration) -> io::Result<()>;
    fn bind_addr(&self, id: Self::CmId, addr: SocketAddr) -> io::Result<()>;
    fn listen(&self, id: Self::CmId, backlog: i32) -> io::Result<()>;
    fn connect(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()>;
    fn accept(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()>;
    fn disconnect(&self, id: Self::CmId) -> io::Result<()>;
    fn peer_addr(&self, id: Self::CmId) -> Option<SocketAddr>;

    // Verbs.

    fn alloc_pd(&self, id: Self::CmId) -> io::Result<Self::Pd>;
    fn dealloc_pd(&self, pd: Self::Pd) -> io::Result<()>;

    fn create_comp_channel(&self, id: Self::CmId) -> io::Result<Self::CompChannel>;
    fn destroy_comp_channel(&self, channel: Self::CompChannel) -> io::Result<()>;

    fn create_cq(
        &self,
        id: Self::CmId,
        capacity: u32,
        channel: Self::CompChannel,
    ) -> io::Result<Self::Cq>;
    fn destroy_cq(&self, cq: Self::Cq) -> io::Result<()>;
    /// Arm the CQ so that its next completion produces a channel event.
    fn req_notify_cq(&self, cq: Self::Cq, solicited_only: bool) -> io::Result<()>;
    /// Block until an armed CQ on the channel produces an event.
    fn get_cq_event(&self, channel: Self::CompChannel) -> io::Result<Self::Cq>;
    fn ack_cq_events(&self, cq: Self::Cq, count: u32);
    /// Non-blockingly poll into `wc`. Return the number of entries filled.
    fn poll_cq(&self, cq: Self::Cq, wc: &mut [Wc]) -> io::Result<usize>;

    /// Create the queue pair of a connection identifier.
    fn create_qp(
        &self,
        id: Self::CmId,
        pd: Self::Pd,
        attr: &QpInitAttr<Self::Cq>,
    ) -> io::Result<()>;
    fn destroy_qp(&self, id: Self::CmId) -> io::Result<()>;
    fn post_send(&self, id: Self::CmId, wr: &SendWr<'_>) -> io::Result<()>;
    fn post_recv(&self, id: Self::CmId, wr: &RecvWr<'_>) -> io::Result<()>;

    /// Register `len` bytes starting at `addr`.
    ///
    /// # Safety
    ///
    /// The memory must stay valid, and must not be moved or freed, until the
    /// returned region is deregistered.
    unsafe fn reg_mr(
        &self,
        pd: Self::Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Self::Mr>;
    /// Local and remote key of a registered region.
    fn mr_keys(&self, mr: Self::Mr) -> (LKey, RKey);
    fn dereg_mr(&self, mr: Self::Mr) -> io::Result<()>;
}
