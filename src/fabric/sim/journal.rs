use super::Handle;
use crate::fabric::{CmEventType, WrId, WrOpcode};

/// A successful call into the simulated fabric, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreateEventChannel,
    DestroyEventChannel,
    GetCmEvent(CmEventType),
    AckCmEvent(CmEventType),
    CreateId,
    DestroyId,
    ResolveAddr,
    ResolveRoute,
    BindAddr,
    Listen,
    Connect,
    Accept,
    Disconnect,
    AllocPd,
    DeallocPd,
    CreateCompChannel,
    DestroyCompChannel,
    CreateCq,
    DestroyCq,
    ReqNotifyCq,
    GetCqEvent,
    AckCqEvents(u32),
    /// Non-empty polls only.
    PollCq(usize),
    CreateQp,
    DestroyQp,
    PostSend(WrId, WrOpcode),
    PostRecv(WrId),
    RegMr { mr: Handle, len: usize },
    DeregMr(Handle),
    /// A marker placed by the caller, see [`SimFabric::note`](super::SimFabric::note).
    Note(&'static str),
}

impl Op {
    /// Whether this is a one-sided RDMA operation being posted.
    pub fn is_one_sided(&self) -> bool {
        matches!(
            self,
            Op::PostSend(_, WrOpcode::RdmaWrite) | Op::PostSend(_, WrOpcode::RdmaRead)
        )
    }
}

/// Fault injected into one endpoint of a simulated fabric. Every fault fires
/// once and is then cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next connection request delivered to this endpoint carries the
    /// given non-zero status. The requesting side is rejected.
    ConnectRequestStatus(i32),

    /// The next SEND this endpoint posts is lost on the wire: the sender gets
    /// a transport-retry-exceeded completion and the peer receives nothing.
    DropSend,

    /// The next memory registration on this endpoint fails with `ENOMEM`.
    FailRegistration,
}
