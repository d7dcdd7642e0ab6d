use std::fmt;

use serde::{Deserialize, Serialize};

/// [`u64`]: **Work request identifier**, designated by the poster to correlate completions.
pub type WrId = u64;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, authorizes one-sided access to a memory region.
pub type RKey = u32;

/// Connection-manager port space.
///
/// The session historically addresses peers in the UDP port space while
/// running a reliable-connected queue pair; RDMA-CM only uses the port space
/// for addressing, so that pairing is kept as the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortSpace {
    /// `RDMA_PS_TCP`.
    Tcp,
    /// `RDMA_PS_UDP`.
    #[default]
    Udp,
}

impl PortSpace {
    /// Value of `enum rdma_port_space`.
    pub const fn raw(self) -> u32 {
        match self {
            PortSpace::Tcp => 0x0106,
            PortSpace::Udp => 0x0111,
        }
    }
}

/// Connection event type.
///
/// Discriminants follow `enum rdma_cm_event_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CmEventType {
    AddrResolved = 0,
    AddrError = 1,
    RouteResolved = 2,
    RouteError = 3,
    ConnectRequest = 4,
    ConnectResponse = 5,
    ConnectError = 6,
    Unreachable = 7,
    Rejected = 8,
    Established = 9,
    Disconnected = 10,
    DeviceRemoval = 11,
    MulticastJoin = 12,
    MulticastError = 13,
    AddrChange = 14,
    TimewaitExit = 15,
}

impl CmEventType {
    /// Decode an `rdma_cm_event_type` value.
    pub fn from_raw(event: u32) -> Option<Self> {
        use CmEventType::*;
        const ALL: [CmEventType; 16] = [
            AddrResolved,
            AddrError,
            RouteResolved,
            RouteError,
            ConnectRequest,
            ConnectResponse,
            ConnectError,
            Unreachable,
            Rejected,
            Established,
            Disconnected,
            DeviceRemoval,
            MulticastJoin,
            MulticastError,
            AddrChange,
            TimewaitExit,
        ];
        ALL.get(event as usize).copied()
    }
}

impl fmt::Display for CmEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Fields of a connection event the session consumes.
#[derive(Debug, Clone, Copy)]
pub struct CmEventInfo<Id> {
    /// Event type.
    pub kind: CmEventType,
    /// Zero on success, a negative errno (or reject reason) otherwise.
    pub status: i32,
    /// The identifier this event is about. For a connection request, the
    /// newly created identifier of the incoming connection.
    pub id: Id,
    /// The listening identifier, for connection requests only.
    pub listen_id: Option<Id>,
}

/// Parameters for `connect` and `accept`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnParam {
    /// Outstanding RDMA reads/atomics this side issues.
    pub initiator_depth: u8,
    /// Outstanding RDMA reads/atomics this side serves.
    pub responder_resources: u8,
    /// Transport retries after a timeout.
    pub retry_count: u8,
    /// Retries after a receiver-not-ready NAK.
    pub rnr_retry_count: u8,
}

/// Queue pair capability attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpCaps {
    /// Outstanding work requests on the send queue.
    pub max_send_wr: u32,

    /// Outstanding work requests on the receive queue.
    pub max_recv_wr: u32,

    /// Scatter/gather entries per send work request.
    pub max_send_sge: u32,

    /// Scatter/gather entries per receive work request.
    pub max_recv_sge: u32,

    /// Largest message that may be posted inline. Zero disables inlining.
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    /// 8 outstanding send/recv work requests and 2 SGEs per request, no
    /// inline data.
    fn default() -> Self {
        QpCaps {
            max_send_wr: 8,
            max_recv_wr: 8,
            max_send_sge: 2,
            max_recv_sge: 2,
            max_inline_data: 0,
        }
    }
}

/// Initialization attributes of a reliable-connected queue pair.
#[derive(Debug, Clone, Copy)]
pub struct QpInitAttr<Cq> {
    /// Send completion queue.
    pub send_cq: Cq,
    /// Receive completion queue. The session uses the send CQ for both.
    pub recv_cq: Cq,
    /// Capabilities.
    pub caps: QpCaps,
    /// Whether every send work request is signaled regardless of its flags.
    pub sq_sig_all: bool,
}

/// Scatter/gather entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Send-queue operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrOpcode {
    /// Two-sided send, consumed by a posted receive.
    Send,
    /// One-sided write into the remote region.
    RdmaWrite,
    /// One-sided read from the remote region.
    RdmaRead,
}

impl WrOpcode {
    /// Value of `enum ibv_wr_opcode`.
    pub const fn raw(self) -> u32 {
        match self {
            WrOpcode::RdmaWrite => 0,
            WrOpcode::Send => 2,
            WrOpcode::RdmaRead => 4,
        }
    }
}

/// Target of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteAddr {
    pub addr: u64,
    pub rkey: RKey,
}

/// Send work request.
#[derive(Debug, Clone, Copy)]
pub struct SendWr<'a> {
    pub wr_id: WrId,
    pub opcode: WrOpcode,
    pub sgl: &'a [Sge],
    /// Produce a completion for this request.
    pub signaled: bool,
    /// Required for one-sided opcodes, ignored for [`WrOpcode::Send`].
    pub remote: Option<RemoteAddr>,
}

/// Receive work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr<'a> {
    pub wr_id: WrId,
    pub sgl: &'a [Sge],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_decode_by_position() {
        assert_eq!(CmEventType::from_raw(4), Some(CmEventType::ConnectRequest));
        assert_eq!(CmEventType::from_raw(10), Some(CmEventType::Disconnected));
        assert_eq!(CmEventType::from_raw(16), None);
        for raw in 0..16 {
            assert_eq!(CmEventType::from_raw(raw).map(|e| e as u32), Some(raw));
        }
    }

    #[test]
    fn port_space_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Holder {
            ps: PortSpace,
        }
        let holder: Holder = toml::from_str("ps = \"tcp\"").unwrap();
        assert_eq!(holder.ps, PortSpace::Tcp);
        assert_eq!(PortSpace::default().raw(), 0x0111);
    }
}
