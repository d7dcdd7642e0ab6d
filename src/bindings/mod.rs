//! Bindings of librdmacm and libibverbs C interfaces.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod private {
    use libc::{in6_addr, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, timespec};
    include!(concat!(env!("OUT_DIR"), "/rdma_bindings.rs"));
}

pub(crate) use self::private::*;

use libc::ENOSYS;

/// Poll a CQ for work completions.
///
/// If the return value is < 0, an error occurred. If the return value is
/// >= 0, it is the number of completions returned. If the return value is
/// non-negative and strictly less than `num_entries`, the CQ was emptied.
#[inline]
pub unsafe fn ibv_poll_cq(
    cq: *mut ibv_cq,
    num_entries: ::std::os::raw::c_int,
    wc: *mut ibv_wc,
) -> ::std::os::raw::c_int {
    match (*(*cq).context).ops.poll_cq {
        Some(poll_cq) => poll_cq(cq, num_entries, wc),
        None => -ENOSYS,
    }
}

/// Request completion notification on a CQ.
///
/// An event will be added to the completion channel associated with the CQ
/// when an entry is added to the CQ.
#[inline]
pub unsafe fn ibv_req_notify_cq(
    cq: *mut ibv_cq,
    solicited_only: ::std::os::raw::c_int,
) -> ::std::os::raw::c_int {
    match (*(*cq).context).ops.req_notify_cq {
        Some(req_notify_cq) => req_notify_cq(cq, solicited_only),
        None => ENOSYS,
    }
}

/// Post a list of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> ::std::os::raw::c_int {
    match (*(*qp).context).ops.post_send {
        Some(post_send) => post_send(qp, wr, bad_wr),
        None => ENOSYS,
    }
}

/// Post a list of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> ::std::os::raw::c_int {
    match (*(*qp).context).ops.post_recv {
        Some(post_recv) => post_recv(qp, wr, bad_wr),
        None => ENOSYS,
    }
}

/// Address of the peer of a connected identifier.
#[inline]
pub unsafe fn rdma_get_peer_addr(id: *mut rdma_cm_id) -> *mut libc::sockaddr {
    std::ptr::addr_of_mut!((*id).route.addr.__bindgen_anon_2.dst_addr)
}
