//! The system RDMA stack, over librdmacm and libibverbs.

use std::fmt;
use std::io::{self, Error as IoError};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::time::Duration;

use super::*;
use crate::bindings::*;
use crate::rdma::mr::Permission;
use crate::utils::interop::{from_c_ret, from_cm_ret};

/// Non-null pointer to a C object owned by librdmacm or libibverbs.
#[repr(transparent)]
pub struct Raw<T>(NonNull<T>);

impl<T> Raw<T> {
    /// Wrap a pointer returned by a C call, turning null into the OS error.
    fn new(ptr: *mut T) -> io::Result<Self> {
        NonNull::new(ptr).map(Raw).ok_or_else(IoError::last_os_error)
    }

    #[inline]
    pub fn as_ptr(self) -> *mut T {
        self.0.as_ptr()
    }
}

impl<T> Clone for Raw<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Raw<T> {}

impl<T> PartialEq for Raw<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl<T> fmt::Debug for Raw<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0)
    }
}

// SAFETY: the pointees are thread-safe library objects.
unsafe impl<T> Send for Raw<T> {}
unsafe impl<T> Sync for Raw<T> {}

fn timeout_ms(timeout: Duration) -> c_int {
    c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX)
}

fn to_sockaddr(addr: SocketAddr) -> libc::sockaddr_storage {
    // SAFETY: all-zero is a valid `sockaddr_storage`.
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in>();
            // SAFETY: `sockaddr_storage` is large and aligned enough for any address.
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                };
            }
        }
        SocketAddr::V6(a) => {
            let sin6 = ptr::addr_of_mut!(storage).cast::<libc::sockaddr_in6>();
            // SAFETY: as above.
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                (*sin6).sin6_scope_id = a.scope_id();
            }
        }
    }
    storage
}

/// # Safety
///
/// `sa` must point to a valid socket address.
unsafe fn from_sockaddr(sa: *const libc::sockaddr) -> Option<SocketAddr> {
    match (*sa).sa_family as c_int {
        libc::AF_INET => {
            let sin = &*sa.cast::<libc::sockaddr_in>();
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)).into())
        }
        libc::AF_INET6 => {
            let sin6 = &*sa.cast::<libc::sockaddr_in6>();
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(
                SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )
                .into(),
            )
        }
        _ => None,
    }
}

/// The system RDMA stack.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verbs;

impl Fabric for Verbs {
    type EventChannel = Raw<rdma_event_channel>;
    type CmId = Raw<rdma_cm_id>;
    type CmEvent = Raw<rdma_cm_event>;
    type Pd = Raw<ibv_pd>;
    type CompChannel = Raw<ibv_comp_channel>;
    type Cq = Raw<ibv_cq>;
    type Mr = Raw<ibv_mr>;

    fn create_event_channel(&self) -> io::Result<Self::EventChannel> {
        // SAFETY: FFI.
        Raw::new(unsafe { rdma_create_event_channel() })
    }

    fn destroy_event_channel(&self, channel: Self::EventChannel) -> io::Result<()> {
        // SAFETY: FFI; the wrapper destroys each channel once.
        unsafe { rdma_destroy_event_channel(channel.as_ptr()) };
        Ok(())
    }

    fn get_cm_event(&self, channel: Self::EventChannel) -> io::Result<Self::CmEvent> {
        let mut event = ptr::null_mut();
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_get_cm_event(channel.as_ptr(), &mut event) })?;
        Raw::new(event)
    }

    fn cm_event_info(&self, event: Self::CmEvent) -> CmEventInfo<Self::CmId> {
        // SAFETY: the event is valid until acknowledged, and librdmacm
        // always sets its `id`.
        unsafe {
            let ev = event.as_ptr();
            CmEventInfo {
                kind: CmEventType::from_raw((*ev).event).unwrap_or(CmEventType::ConnectError),
                status: (*ev).status,
                id: Raw(NonNull::new_unchecked((*ev).id)),
                listen_id: NonNull::new((*ev).listen_id).map(Raw),
            }
        }
    }

    fn ack_cm_event(&self, event: Self::CmEvent) -> io::Result<()> {
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_ack_cm_event(event.as_ptr()) })
    }

    fn create_id(&self, channel: Self::EventChannel, ps: PortSpace) -> io::Result<Self::CmId> {
        let mut id = ptr::null_mut();
        // SAFETY: FFI.
        from_cm_ret(unsafe {
            rdma_create_id(channel.as_ptr(), &mut id, ptr::null_mut(), ps.raw())
        })?;
        Raw::new(id)
    }

    fn destroy_id(&self, id: Self::CmId) -> io::Result<()> {
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_destroy_id(id.as_ptr()) })
    }

    fn resolve_addr(&self, id: Self::CmId, dst: SocketAddr, timeout: Duration) -> io::Result<()> {
        let mut dst = to_sockaddr(dst);
        // SAFETY: FFI; librdmacm copies the address.
        from_cm_ret(unsafe {
            rdma_resolve_addr(
                id.as_ptr(),
                ptr::null_mut(),
                ptr::addr_of_mut!(dst).cast(),
                timeout_ms(timeout),
            )
        })
    }

    fn resolve_route(&self, id: Self::CmId, timeout: Duration) -> io::Result<()> {
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_resolve_route(id.as_ptr(), timeout_ms(timeout)) })
    }

    fn bind_addr(&self, id: Self::CmId, addr: SocketAddr) -> io::Result<()> {
        let mut addr = to_sockaddr(addr);
        // SAFETY: FFI; librdmacm copies the address.
        from_cm_ret(unsafe { rdma_bind_addr(id.as_ptr(), ptr::addr_of_mut!(addr).cast()) })
    }

    fn listen(&self, id: Self::CmId, backlog: i32) -> io::Result<()> {
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_listen(id.as_ptr(), backlog) })
    }

    fn connect(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()> {
        let mut param = rdma_conn_param {
            initiator_depth: param.initiator_depth,
            responder_resources: param.responder_resources,
            retry_count: param.retry_count,
            rnr_retry_count: param.rnr_retry_count,
            ..Default::default()
        };
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_connect(id.as_ptr(), &mut param) })
    }

    fn accept(&self, id: Self::CmId, param: &ConnParam) -> io::Result<()> {
        let mut param = rdma_conn_param {
            initiator_depth: param.initiator_depth,
            responder_resources: param.responder_resources,
            ..Default::default()
        };
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_accept(id.as_ptr(), &mut param) })
    }

    fn disconnect(&self, id: Self::CmId) -> io::Result<()> {
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_disconnect(id.as_ptr()) })
    }

    fn peer_addr(&self, id: Self::CmId) -> Option<SocketAddr> {
        // SAFETY: the route of a live identifier stays valid.
        unsafe { from_sockaddr(rdma_get_peer_addr(id.as_ptr())) }
    }

    fn alloc_pd(&self, id: Self::CmId) -> io::Result<Self::Pd> {
        // SAFETY: FFI; `verbs` is set once the address is bound or resolved.
        Raw::new(unsafe { ibv_alloc_pd((*id.as_ptr()).verbs) })
    }

    fn dealloc_pd(&self, pd: Self::Pd) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dealloc_pd(pd.as_ptr()) })
    }

    fn create_comp_channel(&self, id: Self::CmId) -> io::Result<Self::CompChannel> {
        // SAFETY: FFI.
        Raw::new(unsafe { ibv_create_comp_channel((*id.as_ptr()).verbs) })
    }

    fn destroy_comp_channel(&self, channel: Self::CompChannel) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_comp_channel(channel.as_ptr()) })
    }

    fn create_cq(
        &self,
        id: Self::CmId,
        capacity: u32,
        channel: Self::CompChannel,
    ) -> io::Result<Self::Cq> {
        // SAFETY: FFI.
        Raw::new(unsafe {
            ibv_create_cq(
                (*id.as_ptr()).verbs,
                capacity as c_int,
                ptr::null_mut(),
                channel.as_ptr(),
                0,
            )
        })
    }

    fn destroy_cq(&self, cq: Self::Cq) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_destroy_cq(cq.as_ptr()) })
    }

    fn req_notify_cq(&self, cq: Self::Cq, solicited_only: bool) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_req_notify_cq(cq.as_ptr(), solicited_only as c_int) })
    }

    fn get_cq_event(&self, channel: Self::CompChannel) -> io::Result<Self::Cq> {
        let mut cq = ptr::null_mut();
        let mut ctx = ptr::null_mut();
        // SAFETY: FFI.
        from_cm_ret(unsafe { ibv_get_cq_event(channel.as_ptr(), &mut cq, &mut ctx) })?;
        Raw::new(cq)
    }

    fn ack_cq_events(&self, cq: Self::Cq, count: u32) {
        // SAFETY: FFI.
        unsafe { ibv_ack_cq_events(cq.as_ptr(), count) }
    }

    fn poll_cq(&self, cq: Self::Cq, wc: &mut [Wc]) -> io::Result<usize> {
        let mut raw = vec![ibv_wc::default(); wc.len()];
        // SAFETY: FFI; `raw` holds `wc.len()` entries.
        let n = unsafe { ibv_poll_cq(cq.as_ptr(), raw.len() as c_int, raw.as_mut_ptr()) };
        if n < 0 {
            return Err(IoError::from_raw_os_error(-n));
        }
        let n = n as usize;
        for (dst, src) in wc.iter_mut().zip(&raw[..n]) {
            *dst = Wc {
                wr_id: src.wr_id,
                status: WcStatus::from_raw(src.status),
                opcode: WcOpcode::from_raw(src.opcode),
                byte_len: src.byte_len,
            };
        }
        Ok(n)
    }

    fn create_qp(
        &self,
        id: Self::CmId,
        pd: Self::Pd,
        attr: &QpInitAttr<Self::Cq>,
    ) -> io::Result<()> {
        let mut init = ibv_qp_init_attr {
            send_cq: attr.send_cq.as_ptr(),
            recv_cq: attr.recv_cq.as_ptr(),
            cap: ibv_qp_cap {
                max_send_wr: attr.caps.max_send_wr,
                max_recv_wr: attr.caps.max_recv_wr,
                max_send_sge: attr.caps.max_send_sge,
                max_recv_sge: attr.caps.max_recv_sge,
                max_inline_data: attr.caps.max_inline_data,
            },
            qp_type: ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: attr.sq_sig_all as c_int,
            ..Default::default()
        };
        // SAFETY: FFI.
        from_cm_ret(unsafe { rdma_create_qp(id.as_ptr(), pd.as_ptr(), &mut init) })
    }

    fn destroy_qp(&self, id: Self::CmId) -> io::Result<()> {
        // SAFETY: FFI; `rdma_destroy_qp` reports nothing.
        unsafe { rdma_destroy_qp(id.as_ptr()) };
        Ok(())
    }

    fn post_send(&self, id: Self::CmId, wr: &SendWr<'_>) -> io::Result<()> {
        let mut sgl = wr
            .sgl
            .iter()
            .map(|sge| ibv_sge {
                addr: sge.addr,
                length: sge.length,
                lkey: sge.lkey,
            })
            .collect::<Vec<_>>();

        let mut raw = ibv_send_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: sgl.as_mut_ptr(),
            num_sge: sgl.len() as c_int,
            opcode: wr.opcode.raw(),
            send_flags: if wr.signaled {
                ibv_send_flags::IBV_SEND_SIGNALED.0
            } else {
                0
            },
            ..Default::default()
        };
        if let Some(remote) = wr.remote {
            // SAFETY: `rdma` is the active member for one-sided opcodes.
            unsafe {
                raw.wr.rdma.remote_addr = remote.addr;
                raw.wr.rdma.rkey = remote.rkey;
            }
        }

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the QP of a live identifier is valid and `sgl`
        // outlives the call.
        from_c_ret(unsafe { ibv_post_send((*id.as_ptr()).qp, &mut raw, &mut bad_wr) })
    }

    fn post_recv(&self, id: Self::CmId, wr: &RecvWr<'_>) -> io::Result<()> {
        let mut sgl = wr
            .sgl
            .iter()
            .map(|sge| ibv_sge {
                addr: sge.addr,
                length: sge.length,
                lkey: sge.lkey,
            })
            .collect::<Vec<_>>();

        let mut raw = ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: sgl.as_mut_ptr(),
            num_sge: sgl.len() as c_int,
        };
        let mut bad_wr = ptr::null_mut();
        // SAFETY: as for `post_send`.
        from_c_ret(unsafe { ibv_post_recv((*id.as_ptr()).qp, &mut raw, &mut bad_wr) })
    }

    unsafe fn reg_mr(
        &self,
        pd: Self::Pd,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Self::Mr> {
        Raw::new(ibv_reg_mr(pd.as_ptr(), addr.cast(), len, perm.into()))
    }

    fn mr_keys(&self, mr: Self::Mr) -> (LKey, RKey) {
        // SAFETY: the MR is valid until deregistered.
        unsafe { ((*mr.as_ptr()).lkey, (*mr.as_ptr()).rkey) }
    }

    fn dereg_mr(&self, mr: Self::Mr) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_dereg_mr(mr.as_ptr()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_addresses_convert_both_ways() {
        for addr in ["10.0.0.7:4791", "[fe80::1]:20886"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let storage = to_sockaddr(addr);
            let back = unsafe { from_sockaddr(ptr::addr_of!(storage).cast()) };
            assert_eq!(back, Some(addr));
        }
    }
}
