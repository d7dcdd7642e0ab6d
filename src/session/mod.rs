//! A single RDMA session between an initiator and an acceptor.
//!
//! A session runs four phases, each a method of [`Session`]:
//!
//! 1. setup: [`Session::connect`] (initiator) or [`Session::accept`]
//!    (acceptor) drive the connection state machine and build the queue
//!    pair, its completion queue and the registered regions;
//! 2. [`Session::exchange`] swaps buffer descriptors over SEND/RECV;
//! 3. [`Session::transfer`] (initiator only) WRITEs the payload into the
//!    peer's region and READs it back;
//! 4. [`Session::teardown`] releases everything in reverse creation order.
//!
//! [`run_initiator`] and [`run_acceptor`] chain the phases and own the
//! teardown on every exit path. A session that is dropped half-built tears
//! itself down as well.

mod exchange;
mod payload;
mod teardown;
mod transfer;

#[cfg(test)]
mod tests;

use std::fmt;
use std::net::SocketAddr;

use log::{debug, info, warn};

pub use self::payload::build_payload;
pub use self::teardown::TeardownReport;
pub use self::transfer::TransferReport;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, WrId};
use crate::rdma::cm::{CmId, ConnState, DisconnectMode, EventChannel};
use crate::rdma::cq::{CompChannel, Cq};
use crate::rdma::mr::{BufferDescriptor, Permission, Region};
use crate::rdma::pd::Pd;
use crate::rdma::qp::Qp;

/// Work request identifiers. Completions are matched on these, never on
/// their position in the queue.
pub(crate) const WR_RECV_META: WrId = 1;
pub(crate) const WR_SEND_META: WrId = 2;
pub(crate) const WR_WRITE: WrId = 3;
pub(crate) const WR_READ: WrId = 4;

/// Side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Resolves the peer, connects, and runs the one-sided transfer.
    Initiator,
    /// Listens, accepts one connection, and exposes a buffer.
    Acceptor,
}

/// Error for a phase run before the phase that sets up what it needs.
fn missing(what: &str) -> Error {
    Error::violation(format!("{} set up", what), "none")
}

/// One end of an RDMA session.
///
/// Every resource is optional so that a session can be torn down from
/// whatever state a failed phase left it in.
pub struct Session<F: Fabric> {
    role: Role,
    config: SessionConfig,

    channel: Option<EventChannel<F>>,
    listener: Option<CmId<F>>,
    id: Option<CmId<F>>,
    pd: Option<Pd<F>>,
    comp_channel: Option<CompChannel<F>>,
    cq: Option<Cq<F>>,
    qp: Option<Qp<F>>,

    /// Receives the peer's descriptor.
    peer_meta: Option<Region<F>>,
    /// Holds the descriptor of `data` that is sent to the peer.
    local_meta: Option<Region<F>>,
    /// Exposed to the peer: the payload on the initiator, the target buffer
    /// on the acceptor.
    data: Option<Region<F>>,
    /// Initiator only: destination of the READ back.
    recv: Option<Region<F>>,

    peer: Option<BufferDescriptor>,
}

impl<F: Fabric> Session<F> {
    fn empty(role: Role, config: SessionConfig) -> Self {
        Self {
            role,
            config,
            channel: None,
            listener: None,
            id: None,
            pd: None,
            comp_channel: None,
            cq: None,
            qp: None,
            peer_meta: None,
            local_meta: None,
            data: None,
            recv: None,
            peer: None,
        }
    }

    /// Connect to the acceptor at `dst` and register `payload` for the
    /// transfer.
    ///
    /// On return the connection is established and the receive for the
    /// peer's descriptor is posted. On failure every resource acquired so
    /// far has been released.
    pub fn connect(
        fabric: &F,
        dst: SocketAddr,
        payload: Vec<u8>,
        config: SessionConfig,
    ) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::Config("payload must not be empty".into()));
        }
        let mut session = Self::empty(Role::Initiator, config);

        let channel = session.channel.insert(EventChannel::new(fabric)?);
        let id = session
            .id
            .insert(CmId::new(channel, session.config.port_space)?);
        let timeout = session.config.resolve_timeout();
        id.resolve_addr(channel, dst, timeout)?;
        id.resolve_route(channel, timeout)?;

        session.create_resources()?;
        let pd = session.pd.as_ref().ok_or_else(|| missing("protection domain"))?;
        let len = payload.len();
        session.data = Some(Region::register(
            pd,
            payload.into_boxed_slice(),
            Permission::EXPOSED,
        )?);
        session.recv = Some(Region::allocate(pd, len, Permission::EXPOSED)?);
        session.prepare_exchange()?;

        let param = session.config.connect_param();
        let (channel, id) = session.conn()?;
        id.connect(channel, &param)?;
        info!("connected to {}", dst);
        Ok(session)
    }

    /// Listen on `bind`, accept one connection and expose
    /// `config.buffer_len` bytes to it.
    ///
    /// On return the connection is established and the receive for the
    /// peer's descriptor is posted. On failure every resource acquired so
    /// far has been released.
    pub fn accept(fabric: &F, bind: SocketAddr, config: SessionConfig) -> Result<Self> {
        let mut session = Self::empty(Role::Acceptor, config);

        let channel = session.channel.insert(EventChannel::new(fabric)?);
        let listener = session
            .listener
            .insert(CmId::new(channel, session.config.port_space)?);
        listener.listen(bind, session.config.listen_backlog)?;
        session.id = Some(listener.take_request(channel)?);

        session.create_resources()?;
        let pd = session.pd.as_ref().ok_or_else(|| missing("protection domain"))?;
        session.data = Some(Region::allocate(
            pd,
            session.config.buffer_len,
            Permission::EXPOSED,
        )?);
        session.prepare_exchange()?;

        let param = session.config.accept_param();
        let (channel, id) = session.conn()?;
        id.accept(channel, &param)?;
        match id.peer_addr() {
            Some(peer) => info!("accepted connection from {}", peer),
            None => info!("accepted connection"),
        }
        Ok(session)
    }

    /// Create the protection domain, the completion channel, the CQ (armed
    /// once) and the queue pair on the connection identifier.
    fn create_resources(&mut self) -> Result<()> {
        let id = self.id.as_ref().ok_or_else(|| missing("connection id"))?;
        let pd = self.pd.insert(Pd::new(id)?);
        let comp_channel = self.comp_channel.insert(CompChannel::new(id)?);
        let cq = self
            .cq
            .insert(Cq::new(id, self.config.cq_capacity, comp_channel)?);
        cq.req_notify()?;
        self.qp = Some(Qp::new(id, pd, cq, self.config.caps)?);
        debug!("queue pair created with {:?}", self.config.caps);
        Ok(())
    }

    fn conn(&mut self) -> Result<(&EventChannel<F>, &mut CmId<F>)> {
        match (&self.channel, &mut self.id) {
            (Some(channel), Some(id)) => Ok((channel, id)),
            _ => Err(missing("connection")),
        }
    }

    /// Leave the established state. With [`DisconnectMode::AwaitPeer`] this
    /// blocks until the peer disconnects.
    pub fn disconnect(&mut self, mode: DisconnectMode) -> Result<()> {
        let (channel, id) = self.conn()?;
        id.disconnect(channel, mode)?;
        info!("disconnected");
        Ok(())
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Connection state, if a connection identifier exists.
    pub fn state(&self) -> Option<ConnState> {
        self.id.as_ref().map(|id| id.state())
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.id.as_ref()?.peer_addr()
    }

    /// Region the peer advertised, once descriptors are exchanged.
    #[inline]
    pub fn peer(&self) -> Option<BufferDescriptor> {
        self.peer
    }

    /// Contents of the exposed data buffer.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|r| r.as_slice())
    }

    /// Contents of the READ destination (initiator only).
    pub fn received(&self) -> Option<&[u8]> {
        self.recv.as_ref().map(|r| r.as_slice())
    }
}

impl<F: Fabric> fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("peer", &self.peer)
            .finish()
    }
}

/// Outcome of a successful acceptor run.
#[derive(Debug, Clone)]
pub struct AcceptReport {
    /// Region the initiator advertised.
    pub peer: BufferDescriptor,
    /// Address of the initiator.
    pub peer_addr: Option<SocketAddr>,
    /// The exposed buffer as the initiator left it.
    pub exposed: Vec<u8>,
}

/// Run the initiator side of a session end to end: connect, exchange,
/// transfer, tear down.
pub fn run_initiator<F: Fabric>(
    fabric: &F,
    dst: SocketAddr,
    payload: Vec<u8>,
    config: SessionConfig,
) -> Result<TransferReport> {
    let mut session = Session::connect(fabric, dst, payload, config)?;
    let ret = session.exchange().and_then(|_| session.transfer());
    session.teardown(DisconnectMode::Initiate);
    ret
}

/// Run the acceptor side of a session end to end: accept, exchange, wait
/// for the initiator to disconnect, tear down.
pub fn run_acceptor<F: Fabric>(
    fabric: &F,
    bind: SocketAddr,
    config: SessionConfig,
) -> Result<AcceptReport> {
    let mut session = Session::accept(fabric, bind, config)?;
    let peer = match session.exchange() {
        Ok(peer) => peer,
        Err(e) => {
            session.teardown(DisconnectMode::Initiate);
            return Err(e);
        }
    };

    if let Err(e) = session.disconnect(DisconnectMode::AwaitPeer) {
        warn!("peer did not disconnect cleanly: {}", e);
    }
    let report = AcceptReport {
        peer,
        peer_addr: session.peer_addr(),
        exposed: session.data().map(<[u8]>::to_vec).unwrap_or_default(),
    };
    session.teardown(DisconnectMode::AwaitPeer);
    Ok(report)
}
