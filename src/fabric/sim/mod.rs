//! In-process software fabric.
//!
//! [`SimFabric`] runs both ends of a session inside one process. Endpoints
//! created with [`SimFabric::endpoint`] share one fabric; a listener is found
//! by port alone. SEND/RECV and one-sided WRITE/READ are executed by copying
//! between registered regions, with key, bound and access-right checks on
//! every scatter/gather entry.
//!
//! The simulation enforces the resource rules of the real stack that a
//! session can get wrong:
//!
//! - a CM id, CQ or event channel with acquired but unacknowledged events
//!   cannot be destroyed (`EBUSY`);
//! - a region referenced by a posted receive cannot be deregistered
//!   (`EBUSY`, and a violation is recorded);
//! - a SEND that finds no posted receive completes with
//!   [`WcStatus::RnrRetryExcErr`];
//! - disconnecting flushes outstanding receives of both queue pairs with
//!   [`WcStatus::WrFlushErr`].
//!
//! Every successful call is journaled per endpoint ([`SimFabric::journal`]).
//! Blocking waits give up with `ETIMEDOUT` after the fabric's deadline.

mod journal;

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fmt, io, mem, ptr, slice, thread};

use parking_lot::{Condvar, Mutex, MutexGuard};

pub use self::journal::*;
use super::*;
use crate::rdma::mr::Permission;

/// Opaque handle of a simulated resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

/// A connection event acquired from a simulated event channel.
#[derive(Clone, Copy, Debug)]
pub struct SimEvent {
    handle: Handle,
    info: CmEventInfo<Handle>,
}

#[inline]
fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    AddrResolved,
    RouteResolved,
    Bound,
    Listening,
    Connecting,
    Requested,
    Established,
    Disconnected,
    Closed,
}

struct ChannelState {
    tag: &'static str,
    queue: VecDeque<Handle>,
}

struct EventState {
    channel: Handle,
    info: CmEventInfo<Handle>,
    delivered: bool,
}

struct PostedRecv {
    wr_id: WrId,
    sgl: Vec<Sge>,
}

struct QpState {
    pd: Handle,
    send_cq: Handle,
    recv_cq: Handle,
    caps: QpCaps,
    sq_sig_all: bool,
    recvs: VecDeque<PostedRecv>,
}

struct IdState {
    tag: &'static str,
    channel: Handle,
    phase: Phase,
    local: Option<SocketAddr>,
    dst: Option<SocketAddr>,
    peer: Option<Handle>,
    peer_addr: Option<SocketAddr>,
    qp: Option<QpState>,
}

struct PdState {
    tag: &'static str,
}

struct CompChannelState {
    tag: &'static str,
    queue: VecDeque<Handle>,
}

struct CqState {
    tag: &'static str,
    channel: Handle,
    capacity: u32,
    entries: VecDeque<Wc>,
    armed: bool,
    unacked: u32,
    empty_since: Option<Instant>,
}

struct MrState {
    tag: &'static str,
    pd: Handle,
    addr: u64,
    len: usize,
    perm: Permission,
    key: u32,
}

impl MrState {
    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.addr
            && addr
                .checked_add(len as u64)
                .is_some_and(|end| end <= self.addr + self.len as u64)
    }
}

/// Result of executing a send work request against the peer.
struct Outcome {
    status: WcStatus,
    byte_len: u32,
}

impl Outcome {
    fn failed(status: WcStatus) -> Self {
        Self {
            status,
            byte_len: 0,
        }
    }
}

#[derive(Default)]
struct State {
    next_handle: u64,
    next_key: u32,
    next_port: u16,
    journal: Vec<(&'static str, Op)>,
    violations: Vec<String>,
    faults: Vec<(&'static str, Fault)>,
    channels: HashMap<Handle, ChannelState>,
    events: HashMap<Handle, EventState>,
    ids: HashMap<Handle, IdState>,
    listeners: HashMap<u16, Handle>,
    pds: HashMap<Handle, PdState>,
    comp_channels: HashMap<Handle, CompChannelState>,
    cqs: HashMap<Handle, CqState>,
    mrs: HashMap<Handle, MrState>,
}

impl State {
    fn alloc(&mut self) -> Handle {
        self.next_handle += 1;
        Handle(self.next_handle)
    }

    fn record(&mut self, tag: &'static str, op: Op) {
        self.journal.push((tag, op));
    }

    fn take_fault(&mut self, tag: &'static str, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let pos = self
            .faults
            .iter()
            .position(|(t, f)| *t == tag && pred(f))?;
        Some(self.faults.remove(pos).1)
    }

    fn id(&self, id: Handle) -> io::Result<&IdState> {
        self.ids.get(&id).ok_or_else(|| errno(libc::EINVAL))
    }

    fn id_mut(&mut self, id: Handle) -> io::Result<&mut IdState> {
        self.ids.get_mut(&id).ok_or_else(|| errno(libc::EINVAL))
    }

    fn push_event(&mut self, channel: Handle, info: CmEventInfo<Handle>) {
        let handle = self.alloc();
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.queue.push_back(handle);
            self.events.insert(
                handle,
                EventState {
                    channel,
                    info,
                    delivered: false,
                },
            );
        }
    }

    fn push_simple_event(&mut self, id: Handle, kind: CmEventType, status: i32) {
        if let Some(channel) = self.ids.get(&id).map(|s| s.channel) {
            self.push_event(
                channel,
                CmEventInfo {
                    kind,
                    status,
                    id,
                    listen_id: None,
                },
            );
        }
    }

    /// Append a completion to a CQ and fire its channel if armed.
    fn complete(&mut self, cq: Handle, wc: Wc) {
        let Some(state) = self.cqs.get_mut(&cq) else {
            self.violations
                .push(format!("completion {:?} for destroyed CQ {:?}", wc, cq));
            return;
        };
        if state.entries.len() >= state.capacity as usize {
            self.violations.push(format!("CQ {:?} overrun", cq));
        }
        state.entries.push_back(wc);
        if mem::take(&mut state.armed) {
            let channel = state.channel;
            if let Some(ch) = self.comp_channels.get_mut(&channel) {
                ch.queue.push_back(cq);
            }
        }
    }

    /// Flush every posted receive of the id's QP.
    fn flush_recvs(&mut self, id: Handle) {
        let Some(qp) = self.ids.get_mut(&id).and_then(|s| s.qp.as_mut()) else {
            return;
        };
        let cq = qp.recv_cq;
        let flushed = mem::take(&mut qp.recvs);
        for recv in flushed {
            self.complete(
                cq,
                Wc {
                    wr_id: recv.wr_id,
                    status: WcStatus::WrFlushErr,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                },
            );
        }
    }

    fn find_mr(
        &self,
        pd: Handle,
        key: u32,
        addr: u64,
        len: usize,
        need: Permission,
    ) -> Option<&MrState> {
        self.mrs
            .values()
            .find(|mr| mr.pd == pd && mr.key == key && mr.covers(addr, len))
            .filter(|mr| mr.perm.contains(need))
    }

    /// Copy out the bytes a local scatter/gather list references.
    fn gather(&self, pd: Handle, sgl: &[Sge]) -> Option<Vec<u8>> {
        let mut data = Vec::new();
        for sge in sgl {
            self.find_mr(pd, sge.lkey, sge.addr, sge.length as usize, Permission::EMPTY)?;
            // SAFETY: the range lies within a live registration, whose memory
            // the registrant keeps valid until deregistration.
            let src = unsafe { slice::from_raw_parts(sge.addr as *const u8, sge.length as usize) };
            data.extend_from_slice(src);
        }
        Some(data)
    }

    /// Scatter `data` into a local scatter/gather list. Return `None` on a
    /// protection error and `Some(false)` if the list is too short.
    fn scatter(&self, pd: Handle, sgl: &[Sge], data: &[u8]) -> Option<bool> {
        for sge in sgl {
            self.find_mr(
                pd,
                sge.lkey,
                sge.addr,
                sge.length as usize,
                Permission::LOCAL_WRITE,
            )?;
        }
        let room = sgl.iter().map(|sge| sge.length as usize).sum::<usize>();
        if room < data.len() {
            return Some(false);
        }

        let mut rest = data;
        for sge in sgl {
            let n = rest.len().min(sge.length as usize);
            // SAFETY: the range lies within a live, locally writable registration.
            unsafe { ptr::copy(rest.as_ptr(), sge.addr as *mut u8, n) };
            rest = &rest[n..];
        }
        Some(true)
    }

    /// Execute a send work request posted on `id`, delivering to the peer.
    fn execute(&mut self, tag: &'static str, id: Handle, wr: &SendWr<'_>) -> Outcome {
        let Some((pd, peer)) = self
            .ids
            .get(&id)
            .and_then(|s| Some((s.qp.as_ref()?.pd, s.peer)))
        else {
            return Outcome::failed(WcStatus::LocQpOpErr);
        };
        let Some((peer, peer_pd, peer_rcq)) = peer.and_then(|p| {
            let qp = self.ids.get(&p)?.qp.as_ref()?;
            Some((p, qp.pd, qp.recv_cq))
        }) else {
            return Outcome::failed(WcStatus::RetryExcErr);
        };

        match wr.opcode {
            WrOpcode::Send => {
                let Some(data) = self.gather(pd, wr.sgl) else {
                    return Outcome::failed(WcStatus::LocProtErr);
                };
                if self.take_fault(tag, |f| *f == Fault::DropSend).is_some() {
                    return Outcome::failed(WcStatus::RetryExcErr);
                }
                let Some(recv) = self
                    .ids
                    .get_mut(&peer)
                    .and_then(|s| s.qp.as_mut())
                    .and_then(|qp| qp.recvs.pop_front())
                else {
                    return Outcome::failed(WcStatus::RnrRetryExcErr);
                };

                let (recv_status, send_status) = match self.scatter(peer_pd, &recv.sgl, &data) {
                    Some(true) => (WcStatus::Success, WcStatus::Success),
                    Some(false) => (WcStatus::LocLenErr, WcStatus::RemInvReqErr),
                    None => (WcStatus::LocProtErr, WcStatus::RemOpErr),
                };
                self.complete(
                    peer_rcq,
                    Wc {
                        wr_id: recv.wr_id,
                        status: recv_status,
                        opcode: WcOpcode::Recv,
                        byte_len: data.len() as u32,
                    },
                );
                Outcome {
                    status: send_status,
                    byte_len: 0,
                }
            }
            WrOpcode::RdmaWrite => {
                let Some(remote) = wr.remote else {
                    return Outcome::failed(WcStatus::RemInvReqErr);
                };
                let Some(data) = self.gather(pd, wr.sgl) else {
                    return Outcome::failed(WcStatus::LocProtErr);
                };
                if self
                    .find_mr(
                        peer_pd,
                        remote.rkey,
                        remote.addr,
                        data.len(),
                        Permission::REMOTE_WRITE,
                    )
                    .is_none()
                {
                    return Outcome::failed(WcStatus::RemAccessErr);
                }
                // SAFETY: the target lies within a live, remotely writable registration.
                unsafe { ptr::copy(data.as_ptr(), remote.addr as *mut u8, data.len()) };
                Outcome {
                    status: WcStatus::Success,
                    byte_len: data.len() as u32,
                }
            }
            WrOpcode::RdmaRead => {
                let Some(remote) = wr.remote else {
                    return Outcome::failed(WcStatus::RemInvReqErr);
                };
                let len = wr.sgl.iter().map(|sge| sge.length as usize).sum::<usize>();
                if self
                    .find_mr(peer_pd, remote.rkey, remote.addr, len, Permission::REMOTE_READ)
                    .is_none()
                {
                    return Outcome::failed(WcStatus::RemAccessErr);
                }
                // SAFETY: the source lies within a live, remotely readable registration.
                let data = unsafe { slice::from_raw_parts(remote.addr as *const u8, len) }.to_vec();
                match self.scatter(pd, wr.sgl, &data) {
                    Some(true) => Outcome {
                        status: WcStatus::Success,
                        byte_len: len as u32,
                    },
                    _ => Outcome::failed(WcStatus::LocProtErr),
                }
            }
        }
    }
}

struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    deadline: Duration,
}

/// In-process simulated fabric.
///
/// Cloning yields another handle to the same fabric and endpoint; use
/// [`endpoint`](SimFabric::endpoint) to act as a different endpoint.
#[derive(Clone)]
pub struct SimFabric {
    shared: Arc<Shared>,
    tag: &'static str,
}

impl fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SimFabric<{}>", self.tag)
    }
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl SimFabric {
    /// Default deadline of blocking waits.
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10);

    /// First port handed out to resolved identifiers.
    const EPHEMERAL_PORT_BASE: u16 = 49152;

    /// Create a new fabric with the default wait deadline.
    pub fn new() -> Self {
        Self::with_deadline(Self::DEFAULT_DEADLINE)
    }

    /// Create a new fabric whose blocking waits fail with `ETIMEDOUT` after
    /// `deadline`.
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_key: 0x100,
                    next_port: Self::EPHEMERAL_PORT_BASE,
                    ..Default::default()
                }),
                cond: Condvar::new(),
                deadline,
            }),
            tag: "sim",
        }
    }

    /// Another endpoint on the same fabric. Resources it creates are
    /// journaled under `tag`.
    pub fn endpoint(&self, tag: &'static str) -> Self {
        Self {
            shared: self.shared.clone(),
            tag,
        }
    }

    /// Tag of this endpoint.
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Inject a one-shot fault into this endpoint.
    pub fn inject(&self, fault: Fault) {
        self.shared.state.lock().faults.push((self.tag, fault));
    }

    /// Place a marker in this endpoint's journal.
    pub fn note(&self, label: &'static str) {
        self.shared.state.lock().record(self.tag, Op::Note(label));
    }

    /// Journal of every successful call made by endpoint `tag`, in order.
    pub fn journal(&self, tag: &str) -> Vec<Op> {
        let state = self.shared.state.lock();
        state
            .journal
            .iter()
            .filter(|(t, _)| *t == tag)
            .map(|(_, op)| *op)
            .collect()
    }

    /// Resource-rule violations observed so far, across all endpoints.
    pub fn violations(&self) -> Vec<String> {
        self.shared.state.lock().violations.clone()
    }

    /// Connection events endpoint `tag` has acquired but not acknowledged.
    pub fn unacked_cm_events(&self, tag: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .events
            .values()
            .filter(|e| e.delivered)
            .filter(|e| state.channels.get(&e.channel).is_some_and(|c| c.tag == tag))
            .count()
    }

    /// Number of resources endpoint `tag` still holds.
    pub fn live_resources(&self, tag: &str) -> usize {
        let state = self.shared.state.lock();
        state.channels.values().filter(|s| s.tag == tag).count()
            + state.ids.values().filter(|s| s.tag == tag).count()
            + state
                .ids
                .values()
                .filter(|s| s.tag == tag && s.qp.is_some())
                .count()
            + state.pds.values().filter(|s| s.tag == tag).count()
            + state.comp_channels.values().filter(|s| s.tag == tag).count()
            + state.cqs.values().filter(|s| s.tag == tag).count()
            + state.mrs.values().filter(|s| s.tag == tag).count()
    }

    /// Append completions to a CQ as if the device produced them.
    pub fn inject_completions(&self, cq: Handle, wcs: &[Wc]) {
        let mut state = self.shared.state.lock();
        for wc in wcs {
            state.complete(cq, *wc);
        }
        drop(state);
        self.shared.cond.notify_all();
    }

    /// Block until some endpoint listens on `port`. Return whether it did
    /// before `timeout`.
    pub fn wait_listening(&self, port: u16, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            if state.listeners.contains_key(&port) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.shared.cond.wait_for(&mut state, deadline - now);
        }
    }

    /// Run `f` on the locked state, then wake every waiter.
    fn locked<T>(&self, f: impl FnOnce(&mut State, &'static str) -> io::Result<T>) -> io::Result<T> {
        let mut state = self.shared.state.lock();
        let ret = f(&mut *state, self.tag);
        drop(state);
        self.shared.cond.notify_all();
        ret
    }

    /// Block until `pop` yields a value or the deadline passes.
    fn wait<T>(
        &self,
        mut pop: impl FnMut(&mut State) -> io::Result<Option<T>>,
    ) -> io::Result<T> {
        let deadline = Instant::now() + self.shared.deadline;
        let mut state: MutexGuard<'_, State> = self.shared.state.lock();
        loop {
            if let Some(v) = pop(&mut *state)? {
                return Ok(v);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(errno(libc::ETIMEDOUT));
            }
            self.shared.cond.wait_for(&mut state, deadline - now);
        }
    }
}

impl Fabric for SimFabric {
    type EventChannel = Handle;
    type CmId = Handle;
    type CmEvent = SimEvent;
    type Pd = Handle;
    type CompChannel = Handle;
    type Cq = Handle;
    type Mr = Handle;

    fn create_event_channel(&self) -> io::Result<Handle> {
        self.locked(|st, tag| {
            let h = st.alloc();
            st.channels.insert(
                h,
                ChannelState {
                    tag,
                    queue: VecDeque::new(),
                },
            );
            st.record(tag, Op::CreateEventChannel);
            Ok(h)
        })
    }

    fn destroy_event_channel(&self, channel: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            if !st.channels.contains_key(&channel) {
                return Err(errno(libc::EINVAL));
            }
            if st.ids.values().any(|s| s.channel == channel)
                || st.events.values().any(|e| e.channel == channel && e.delivered)
            {
                return Err(errno(libc::EBUSY));
            }
            st.channels.remove(&channel);
            st.events.retain(|_, e| e.channel != channel);
            st.record(tag, Op::DestroyEventChannel);
            Ok(())
        })
    }

    fn get_cm_event(&self, channel: Handle) -> io::Result<SimEvent> {
        let tag = self.tag;
        self.wait(|st| {
            let ch = st.channels.get_mut(&channel).ok_or_else(|| errno(libc::EINVAL))?;
            let Some(handle) = ch.queue.pop_front() else {
                return Ok(None);
            };
            let Some(event) = st.events.get_mut(&handle) else {
                return Ok(None);
            };
            event.delivered = true;
            let info = event.info;
            st.record(tag, Op::GetCmEvent(info.kind));
            Ok(Some(SimEvent { handle, info }))
        })
    }

    fn cm_event_info(&self, event: SimEvent) -> CmEventInfo<Handle> {
        event.info
    }

    fn ack_cm_event(&self, event: SimEvent) -> io::Result<()> {
        self.locked(|st, tag| match st.events.remove(&event.handle) {
            Some(e) if e.delivered => {
                st.record(tag, Op::AckCmEvent(e.info.kind));
                Ok(())
            }
            _ => {
                st.violations
                    .push(format!("{:?} event acknowledged twice", event.info.kind));
                Err(errno(libc::EINVAL))
            }
        })
    }

    fn create_id(&self, channel: Handle, _ps: PortSpace) -> io::Result<Handle> {
        self.locked(|st, tag| {
            if !st.channels.contains_key(&channel) {
                return Err(errno(libc::EINVAL));
            }
            let h = st.alloc();
            st.ids.insert(
                h,
                IdState {
                    tag,
                    channel,
                    phase: Phase::Idle,
                    local: None,
                    dst: None,
                    peer: None,
                    peer_addr: None,
                    qp: None,
                },
            );
            st.record(tag, Op::CreateId);
            Ok(h)
        })
    }

    fn destroy_id(&self, id: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id(id)?;
            if state.qp.is_some() {
                return Err(errno(libc::EBUSY));
            }
            let refers = |info: &CmEventInfo<Handle>| info.id == id || info.listen_id == Some(id);
            if st.events.values().any(|e| e.delivered && refers(&e.info)) {
                return Err(errno(libc::EBUSY));
            }

            let queued = st
                .events
                .iter()
                .filter(|(_, e)| refers(&e.info))
                .map(|(h, _)| *h)
                .collect::<Vec<_>>();
            for h in queued {
                st.events.remove(&h);
                for ch in st.channels.values_mut() {
                    ch.queue.retain(|q| *q != h);
                }
            }

            if let Some(state) = st.ids.remove(&id) {
                if state.phase == Phase::Listening {
                    if let Some(port) = state.local.map(|a| a.port()) {
                        st.listeners.remove(&port);
                    }
                }
                if let Some(peer) = state.peer.and_then(|p| st.ids.get_mut(&p)) {
                    peer.peer = None;
                }
            }
            st.record(tag, Op::DestroyId);
            Ok(())
        })
    }

    fn resolve_addr(&self, id: Handle, dst: SocketAddr, _timeout: Duration) -> io::Result<()> {
        self.locked(|st, tag| {
            let port = st.next_port;
            let state = st.id_mut(id)?;
            if state.phase != Phase::Idle {
                return Err(errno(libc::EINVAL));
            }
            state.phase = Phase::AddrResolved;
            state.dst = Some(dst);
            state.local = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
            st.next_port = st.next_port.wrapping_add(1).max(Self::EPHEMERAL_PORT_BASE);
            st.push_simple_event(id, CmEventType::AddrResolved, 0);
            st.record(tag, Op::ResolveAddr);
            Ok(())
        })
    }

    fn resolve_route(&self, id: Handle, _timeout: Duration) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id_mut(id)?;
            if state.phase != Phase::AddrResolved {
                return Err(errno(libc::EINVAL));
            }
            state.phase = Phase::RouteResolved;
            st.push_simple_event(id, CmEventType::RouteResolved, 0);
            st.record(tag, Op::ResolveRoute);
            Ok(())
        })
    }

    fn bind_addr(&self, id: Handle, addr: SocketAddr) -> io::Result<()> {
        self.locked(|st, tag| {
            if st.listeners.contains_key(&addr.port()) {
                return Err(errno(libc::EADDRINUSE));
            }
            let state = st.id_mut(id)?;
            if state.phase != Phase::Idle {
                return Err(errno(libc::EINVAL));
            }
            state.phase = Phase::Bound;
            state.local = Some(addr);
            st.record(tag, Op::BindAddr);
            Ok(())
        })
    }

    fn listen(&self, id: Handle, _backlog: i32) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id(id)?;
            let (Phase::Bound, Some(local)) = (state.phase, state.local) else {
                return Err(errno(libc::EINVAL));
            };
            if st.listeners.contains_key(&local.port()) {
                return Err(errno(libc::EADDRINUSE));
            }
            st.id_mut(id)?.phase = Phase::Listening;
            st.listeners.insert(local.port(), id);
            st.record(tag, Op::Listen);
            Ok(())
        })
    }

    fn connect(&self, id: Handle, _param: &ConnParam) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id(id)?;
            let (Phase::RouteResolved, Some(dst), true) =
                (state.phase, state.dst, state.qp.is_some())
            else {
                return Err(errno(libc::EINVAL));
            };
            let local = state.local;
            st.record(tag, Op::Connect);

            let Some((listener, ltag, lchannel, llocal)) =
                st.listeners.get(&dst.port()).and_then(|l| {
                    let s = st.ids.get(l)?;
                    Some((*l, s.tag, s.channel, s.local))
                })
            else {
                st.id_mut(id)?.phase = Phase::Closed;
                st.push_simple_event(id, CmEventType::Rejected, libc::ECONNREFUSED);
                return Ok(());
            };

            if let Some(Fault::ConnectRequestStatus(status)) =
                st.take_fault(ltag, |f| matches!(f, Fault::ConnectRequestStatus(_)))
            {
                st.push_event(
                    lchannel,
                    CmEventInfo {
                        kind: CmEventType::ConnectRequest,
                        status,
                        id: listener,
                        listen_id: Some(listener),
                    },
                );
                st.id_mut(id)?.phase = Phase::Closed;
                st.push_simple_event(id, CmEventType::Rejected, status.saturating_abs().max(1));
                return Ok(());
            }

            let conn = st.alloc();
            st.ids.insert(
                conn,
                IdState {
                    tag: ltag,
                    channel: lchannel,
                    phase: Phase::Requested,
                    local: llocal,
                    dst: None,
                    peer: Some(id),
                    peer_addr: local,
                    qp: None,
                },
            );
            let state = st.id_mut(id)?;
            state.phase = Phase::Connecting;
            state.peer = Some(conn);
            state.peer_addr = llocal;
            st.push_event(
                lchannel,
                CmEventInfo {
                    kind: CmEventType::ConnectRequest,
                    status: 0,
                    id: conn,
                    listen_id: Some(listener),
                },
            );
            Ok(())
        })
    }

    fn accept(&self, id: Handle, _param: &ConnParam) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id(id)?;
            let (Phase::Requested, true, Some(peer)) =
                (state.phase, state.qp.is_some(), state.peer)
            else {
                return Err(errno(libc::EINVAL));
            };
            match st.ids.get_mut(&peer) {
                Some(p) if p.phase == Phase::Connecting => p.phase = Phase::Established,
                _ => return Err(errno(libc::ECONNABORTED)),
            }
            st.id_mut(id)?.phase = Phase::Established;
            st.push_simple_event(id, CmEventType::Established, 0);
            st.push_simple_event(peer, CmEventType::Established, 0);
            st.record(tag, Op::Accept);
            Ok(())
        })
    }

    fn disconnect(&self, id: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id(id)?;
            let (phase, peer) = (state.phase, state.peer);
            match phase {
                Phase::Established => {}
                // Already torn down by the peer; our event is queued.
                Phase::Disconnected => {
                    st.record(tag, Op::Disconnect);
                    return Ok(());
                }
                _ => return Err(errno(libc::EINVAL)),
            }
            st.id_mut(id)?.phase = Phase::Disconnected;
            st.push_simple_event(id, CmEventType::Disconnected, 0);
            st.flush_recvs(id);

            if let Some(peer) = peer {
                if let Some(p) = st.ids.get_mut(&peer).filter(|p| p.phase == Phase::Established) {
                    p.phase = Phase::Disconnected;
                    st.push_simple_event(peer, CmEventType::Disconnected, 0);
                    st.flush_recvs(peer);
                }
            }
            st.record(tag, Op::Disconnect);
            Ok(())
        })
    }

    fn peer_addr(&self, id: Handle) -> Option<SocketAddr> {
        self.shared.state.lock().ids.get(&id).and_then(|s| s.peer_addr)
    }

    fn alloc_pd(&self, id: Handle) -> io::Result<Handle> {
        self.locked(|st, tag| {
            st.id(id)?;
            let h = st.alloc();
            st.pds.insert(h, PdState { tag });
            st.record(tag, Op::AllocPd);
            Ok(h)
        })
    }

    fn dealloc_pd(&self, pd: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            if !st.pds.contains_key(&pd) {
                return Err(errno(libc::EINVAL));
            }
            let qp_uses = st
                .ids
                .values()
                .any(|s| s.qp.as_ref().is_some_and(|qp| qp.pd == pd));
            if qp_uses || st.mrs.values().any(|mr| mr.pd == pd) {
                return Err(errno(libc::EBUSY));
            }
            st.pds.remove(&pd);
            st.record(tag, Op::DeallocPd);
            Ok(())
        })
    }

    fn create_comp_channel(&self, id: Handle) -> io::Result<Handle> {
        self.locked(|st, tag| {
            st.id(id)?;
            let h = st.alloc();
            st.comp_channels.insert(
                h,
                CompChannelState {
                    tag,
                    queue: VecDeque::new(),
                },
            );
            st.record(tag, Op::CreateCompChannel);
            Ok(h)
        })
    }

    fn destroy_comp_channel(&self, channel: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            if !st.comp_channels.contains_key(&channel) {
                return Err(errno(libc::EINVAL));
            }
            if st.cqs.values().any(|cq| cq.channel == channel) {
                return Err(errno(libc::EBUSY));
            }
            st.comp_channels.remove(&channel);
            st.record(tag, Op::DestroyCompChannel);
            Ok(())
        })
    }

    fn create_cq(&self, id: Handle, capacity: u32, channel: Handle) -> io::Result<Handle> {
        self.locked(|st, tag| {
            st.id(id)?;
            if capacity == 0 || !st.comp_channels.contains_key(&channel) {
                return Err(errno(libc::EINVAL));
            }
            let h = st.alloc();
            st.cqs.insert(
                h,
                CqState {
                    tag,
                    channel,
                    capacity,
                    entries: VecDeque::new(),
                    armed: false,
                    unacked: 0,
                    empty_since: None,
                },
            );
            st.record(tag, Op::CreateCq);
            Ok(h)
        })
    }

    fn destroy_cq(&self, cq: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.cqs.get(&cq).ok_or_else(|| errno(libc::EINVAL))?;
            let qp_uses = st.ids.values().any(|s| {
                s.qp
                    .as_ref()
                    .is_some_and(|qp| qp.send_cq == cq || qp.recv_cq == cq)
            });
            if qp_uses || state.unacked > 0 {
                return Err(errno(libc::EBUSY));
            }
            let channel = state.channel;
            st.cqs.remove(&cq);
            if let Some(ch) = st.comp_channels.get_mut(&channel) {
                ch.queue.retain(|c| *c != cq);
            }
            st.record(tag, Op::DestroyCq);
            Ok(())
        })
    }

    fn req_notify_cq(&self, cq: Handle, _solicited_only: bool) -> io::Result<()> {
        self.locked(|st, tag| {
            st.cqs.get_mut(&cq).ok_or_else(|| errno(libc::EINVAL))?.armed = true;
            st.record(tag, Op::ReqNotifyCq);
            Ok(())
        })
    }

    fn get_cq_event(&self, channel: Handle) -> io::Result<Handle> {
        let tag = self.tag;
        self.wait(|st| {
            let ch = st
                .comp_channels
                .get_mut(&channel)
                .ok_or_else(|| errno(libc::EINVAL))?;
            let Some(cq) = ch.queue.pop_front() else {
                return Ok(None);
            };
            if let Some(state) = st.cqs.get_mut(&cq) {
                state.unacked += 1;
            }
            st.record(tag, Op::GetCqEvent);
            Ok(Some(cq))
        })
    }

    fn ack_cq_events(&self, cq: Handle, count: u32) {
        let _ = self.locked(|st, tag| {
            match st.cqs.get_mut(&cq) {
                Some(state) if state.unacked >= count => state.unacked -= count,
                Some(state) => {
                    state.unacked = 0;
                    st.violations
                        .push(format!("CQ {:?} over-acknowledged by {}", cq, count));
                }
                None => st
                    .violations
                    .push(format!("CQ {:?} acknowledged after destruction", cq)),
            }
            st.record(tag, Op::AckCqEvents(count));
            Ok(())
        });
    }

    fn poll_cq(&self, cq: Handle, wc: &mut [Wc]) -> io::Result<usize> {
        let deadline = self.shared.deadline;
        let mut st = self.shared.state.lock();
        let state = st.cqs.get_mut(&cq).ok_or_else(|| errno(libc::EINVAL))?;
        let n = wc.len().min(state.entries.len());
        for slot in &mut wc[..n] {
            if let Some(entry) = state.entries.pop_front() {
                *slot = entry;
            }
        }

        if n > 0 {
            state.empty_since = None;
            let tag = self.tag;
            st.record(tag, Op::PollCq(n));
            return Ok(n);
        }

        let since = *state.empty_since.get_or_insert_with(Instant::now);
        drop(st);
        if since.elapsed() >= deadline {
            return Err(errno(libc::ETIMEDOUT));
        }
        thread::yield_now();
        Ok(0)
    }

    fn create_qp(&self, id: Handle, pd: Handle, attr: &QpInitAttr<Handle>) -> io::Result<()> {
        self.locked(|st, tag| {
            if !st.pds.contains_key(&pd)
                || !st.cqs.contains_key(&attr.send_cq)
                || !st.cqs.contains_key(&attr.recv_cq)
            {
                return Err(errno(libc::EINVAL));
            }
            let state = st.id_mut(id)?;
            if state.qp.is_some() {
                return Err(errno(libc::EEXIST));
            }
            state.qp = Some(QpState {
                pd,
                send_cq: attr.send_cq,
                recv_cq: attr.recv_cq,
                caps: attr.caps,
                sq_sig_all: attr.sq_sig_all,
                recvs: VecDeque::new(),
            });
            st.record(tag, Op::CreateQp);
            Ok(())
        })
    }

    fn destroy_qp(&self, id: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            st.id_mut(id)?.qp.take().ok_or_else(|| errno(libc::EINVAL))?;
            st.record(tag, Op::DestroyQp);
            Ok(())
        })
    }

    fn post_send(&self, id: Handle, wr: &SendWr<'_>) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id(id)?;
            let phase = state.phase;
            let qp = state.qp.as_ref().ok_or_else(|| errno(libc::EINVAL))?;
            if wr.sgl.len() > qp.caps.max_send_sge as usize {
                return Err(errno(libc::EINVAL));
            }
            if wr.opcode != WrOpcode::Send && wr.remote.is_none() {
                return Err(errno(libc::EINVAL));
            }
            let (send_cq, signaled) = (qp.send_cq, wr.signaled || qp.sq_sig_all);
            let outcome = match phase {
                Phase::Established => {
                    st.record(tag, Op::PostSend(wr.wr_id, wr.opcode));
                    st.execute(tag, id, wr)
                }
                Phase::Disconnected => {
                    st.record(tag, Op::PostSend(wr.wr_id, wr.opcode));
                    Outcome::failed(WcStatus::WrFlushErr)
                }
                _ => return Err(errno(libc::EINVAL)),
            };

            if signaled || outcome.status != WcStatus::Success {
                let opcode = match wr.opcode {
                    WrOpcode::Send => WcOpcode::Send,
                    WrOpcode::RdmaWrite => WcOpcode::RdmaWrite,
                    WrOpcode::RdmaRead => WcOpcode::RdmaRead,
                };
                st.complete(
                    send_cq,
                    Wc {
                        wr_id: wr.wr_id,
                        status: outcome.status,
                        opcode,
                        byte_len: outcome.byte_len,
                    },
                );
            }
            Ok(())
        })
    }

    fn post_recv(&self, id: Handle, wr: &RecvWr<'_>) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.id_mut(id)?;
            let disconnected = state.phase == Phase::Disconnected;
            let qp = state.qp.as_mut().ok_or_else(|| errno(libc::EINVAL))?;
            if wr.sgl.len() > qp.caps.max_recv_sge as usize {
                return Err(errno(libc::EINVAL));
            }
            if qp.recvs.len() >= qp.caps.max_recv_wr as usize {
                return Err(errno(libc::ENOMEM));
            }
            qp.recvs.push_back(PostedRecv {
                wr_id: wr.wr_id,
                sgl: wr.sgl.to_vec(),
            });
            st.record(tag, Op::PostRecv(wr.wr_id));
            if disconnected {
                st.flush_recvs(id);
            }
            Ok(())
        })
    }

    unsafe fn reg_mr(
        &self,
        pd: Handle,
        addr: *mut u8,
        len: usize,
        perm: Permission,
    ) -> io::Result<Handle> {
        self.locked(|st, tag| {
            if !st.pds.contains_key(&pd) || len == 0 {
                return Err(errno(libc::EINVAL));
            }
            if addr.is_null() {
                return Err(errno(libc::EFAULT));
            }
            if st
                .take_fault(tag, |f| *f == Fault::FailRegistration)
                .is_some()
            {
                return Err(errno(libc::ENOMEM));
            }
            let h = st.alloc();
            st.next_key += 1;
            let key = st.next_key;
            st.mrs.insert(
                h,
                MrState {
                    tag,
                    pd,
                    addr: addr as u64,
                    len,
                    perm,
                    key,
                },
            );
            st.record(tag, Op::RegMr { mr: h, len });
            Ok(h)
        })
    }

    fn mr_keys(&self, mr: Handle) -> (LKey, RKey) {
        let st = self.shared.state.lock();
        st.mrs.get(&mr).map_or((0, 0), |mr| (mr.key, mr.key))
    }

    fn dereg_mr(&self, mr: Handle) -> io::Result<()> {
        self.locked(|st, tag| {
            let state = st.mrs.get(&mr).ok_or_else(|| errno(libc::EINVAL))?;
            let (pd, key) = (state.pd, state.key);
            let referenced = st.ids.values().filter_map(|s| s.qp.as_ref()).any(|qp| {
                qp.pd == pd
                    && qp
                        .recvs
                        .iter()
                        .any(|r| r.sgl.iter().any(|sge| sge.lkey == key))
            });
            if referenced {
                st.violations.push(format!(
                    "MR {:?} deregistered while a posted receive references it",
                    mr
                ));
                return Err(errno(libc::EBUSY));
            }
            st.mrs.remove(&mr);
            st.record(tag, Op::DeregMr(mr));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn blocking_waits_time_out() {
        let sim = SimFabric::with_deadline(Duration::from_millis(20));
        let ch = sim.create_event_channel().unwrap();
        let err = sim.get_cm_event(ch).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ETIMEDOUT));
    }

    #[test]
    fn unacked_event_pins_id() {
        let sim = SimFabric::new().endpoint("a");
        let ch = sim.create_event_channel().unwrap();
        let id = sim.create_id(ch, PortSpace::Udp).unwrap();
        sim.resolve_addr(id, addr(1), Duration::from_secs(1)).unwrap();

        let ev = sim.get_cm_event(ch).unwrap();
        assert_eq!(sim.cm_event_info(ev).kind, CmEventType::AddrResolved);
        assert_eq!(sim.unacked_cm_events("a"), 1);
        assert_eq!(sim.destroy_id(id).unwrap_err().raw_os_error(), Some(libc::EBUSY));

        sim.ack_cm_event(ev).unwrap();
        assert!(sim.ack_cm_event(ev).is_err());
        assert_eq!(sim.violations().len(), 1);
        sim.destroy_id(id).unwrap();
        sim.destroy_event_channel(ch).unwrap();
        assert_eq!(sim.live_resources("a"), 0);
    }

    #[test]
    fn armed_cq_fires_once() {
        let sim = SimFabric::new();
        let ch = sim.create_event_channel().unwrap();
        let id = sim.create_id(ch, PortSpace::Udp).unwrap();
        let cc = sim.create_comp_channel(id).unwrap();
        let cq = sim.create_cq(id, 4, cc).unwrap();
        sim.req_notify_cq(cq, false).unwrap();

        let mut st = sim.shared.state.lock();
        st.complete(cq, Wc::default());
        st.complete(cq, Wc::default());
        assert_eq!(st.comp_channels[&cc].queue.len(), 1);
        drop(st);

        assert_eq!(sim.get_cq_event(cc).unwrap(), cq);
        assert_eq!(sim.destroy_cq(cq).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        sim.ack_cq_events(cq, 1);

        let mut wc = [Wc::default(); 4];
        assert_eq!(sim.poll_cq(cq, &mut wc).unwrap(), 2);
        sim.destroy_cq(cq).unwrap();
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn registration_fault_fires_once() {
        let sim = SimFabric::new().endpoint("a");
        let ch = sim.create_event_channel().unwrap();
        let id = sim.create_id(ch, PortSpace::Udp).unwrap();
        let pd = sim.alloc_pd(id).unwrap();
        let mut buf = vec![0u8; 64];

        sim.inject(Fault::FailRegistration);
        let err = unsafe { sim.reg_mr(pd, buf.as_mut_ptr(), buf.len(), Permission::LOCAL) };
        assert_eq!(err.unwrap_err().raw_os_error(), Some(libc::ENOMEM));

        let mr = unsafe { sim.reg_mr(pd, buf.as_mut_ptr(), buf.len(), Permission::LOCAL) }.unwrap();
        assert_eq!(sim.dealloc_pd(pd).unwrap_err().raw_os_error(), Some(libc::EBUSY));
        sim.dereg_mr(mr).unwrap();
        sim.dealloc_pd(pd).unwrap();
    }
}
