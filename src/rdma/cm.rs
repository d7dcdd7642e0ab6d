//! Connection manager: event channel, identifiers and the connection state
//! machine.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fabric::{CmEventInfo, CmEventType, ConnParam, Fabric, PortSpace};

fabric_resource! {
    /// Connection event channel.
    ///
    /// All connection events of the identifiers created on this channel are
    /// delivered here, one blocking [`next_event`](EventChannel::next_event)
    /// at a time.
    EventChannel, EventChannel, destroy_event_channel, "event channel"
}

impl<F: Fabric> EventChannel<F> {
    /// Create a new event channel.
    pub fn new(fabric: &F) -> Result<Self> {
        let raw = fabric
            .create_event_channel()
            .map_err(Error::transport("create event channel"))?;
        Ok(Self::from_raw(fabric.clone(), raw))
    }

    /// Block until the next connection event arrives.
    pub fn next_event(&self) -> Result<CmEvent<F>> {
        let raw = self
            .fabric
            .get_cm_event(self.raw)
            .map_err(Error::transport("get CM event"))?;
        let info = self.fabric.cm_event_info(raw);
        debug!("CM event {} (status {})", info.kind, info.status);
        Ok(CmEvent {
            fabric: self.fabric.clone(),
            raw,
            info,
            acked: false,
        })
    }

    /// Block until the next connection event arrives and check that it is of
    /// the `expected` type with a zero status.
    ///
    /// On a non-zero status this fails with [`Error::Transport`]; on a type
    /// mismatch with [`Error::ProtocolViolation`]. Either way the event is
    /// acknowledged before returning. A matching event is handed back for the
    /// caller to consume and acknowledge.
    pub fn await_event(&self, expected: CmEventType) -> Result<CmEvent<F>> {
        let event = self.next_event()?;
        let err = if event.status() != 0 {
            Error::event_status(event.kind(), event.status())
        } else if event.kind() != expected {
            Error::violation(expected.to_string(), event.kind().to_string())
        } else {
            return Ok(event);
        };

        if let Err(e) = event.ack() {
            warn!("cannot acknowledge rejected CM event: {}", e);
        }
        Err(err)
    }
}

/// A connection event acquired from an [`EventChannel`].
///
/// The event is acknowledged exactly once: by [`ack`](CmEvent::ack), or on
/// drop if it was never acknowledged explicitly.
pub struct CmEvent<F: Fabric> {
    fabric: F,
    raw: F::CmEvent,
    info: CmEventInfo<F::CmId>,
    acked: bool,
}

impl<F: Fabric> CmEvent<F> {
    /// Event type.
    #[inline]
    pub fn kind(&self) -> CmEventType {
        self.info.kind
    }

    /// Event status. Zero on success.
    #[inline]
    pub fn status(&self) -> i32 {
        self.info.status
    }

    /// The identifier this event is about.
    #[inline]
    pub fn id(&self) -> F::CmId {
        self.info.id
    }

    /// The listening identifier of a connection request.
    #[inline]
    pub fn listen_id(&self) -> Option<F::CmId> {
        self.info.listen_id
    }

    /// Acknowledge the event.
    pub fn ack(mut self) -> Result<()> {
        self.acked = true;
        self.fabric
            .ack_cm_event(self.raw)
            .map_err(Error::transport("acknowledge CM event"))
    }
}

impl<F: Fabric> Drop for CmEvent<F> {
    fn drop(&mut self) {
        if !self.acked {
            if let Err(e) = self.fabric.ack_cm_event(self.raw) {
                warn!("cannot acknowledge {} event on drop: {}", self.info.kind, e);
            }
        }
    }
}

impl<F: Fabric> fmt::Debug for CmEvent<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmEvent")
            .field("kind", &self.info.kind)
            .field("status", &self.info.status)
            .finish()
    }
}

/// Connection state of a [`CmId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Init,
    AddrResolved,
    RouteResolved,
    Connecting,
    Listening,
    /// A connection request was taken but not yet accepted.
    ConnectRequest,
    Established,
    Disconnected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Init => "INIT",
            ConnState::AddrResolved => "ADDR_RESOLVED",
            ConnState::RouteResolved => "ROUTE_RESOLVED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Listening => "LISTENING",
            ConnState::ConnectRequest => "CONNECT_REQUEST",
            ConnState::Established => "ESTABLISHED",
            ConnState::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// How a session leaves the ESTABLISHED state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Disconnect, then wait for the resulting event.
    Initiate,
    /// Wait for the peer to disconnect.
    AwaitPeer,
}

/// Connection identifier.
///
/// Each transition blocks on the event channel until the event that
/// completes it arrives and has been acknowledged.
pub struct CmId<F: Fabric> {
    fabric: F,
    raw: F::CmId,
    state: ConnState,
    live: bool,
}

impl<F: Fabric> CmId<F> {
    /// Create a new identifier on the channel.
    pub fn new(channel: &EventChannel<F>, ps: PortSpace) -> Result<Self> {
        let fabric = channel.fabric().clone();
        let raw = fabric
            .create_id(channel.as_raw(), ps)
            .map_err(Error::transport("create CM id"))?;
        Ok(Self {
            fabric,
            raw,
            state: ConnState::Init,
            live: true,
        })
    }

    /// Get the underlying fabric handle.
    #[inline]
    pub fn as_raw(&self) -> F::CmId {
        self.raw
    }

    /// Get the fabric this identifier lives on.
    #[inline]
    pub fn fabric(&self) -> &F {
        &self.fabric
    }

    /// Current connection state.
    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    fn expect_state(&self, expected: ConnState) -> Result<()> {
        if self.state != expected {
            return Err(Error::violation(
                format!("{} state", expected),
                format!("{} state", self.state),
            ));
        }
        Ok(())
    }

    /// Resolve the destination address. `INIT -> ADDR_RESOLVED`.
    pub fn resolve_addr(
        &mut self,
        channel: &EventChannel<F>,
        dst: SocketAddr,
        timeout: Duration,
    ) -> Result<()> {
        self.expect_state(ConnState::Init)?;
        self.fabric
            .resolve_addr(self.raw, dst, timeout)
            .map_err(Error::transport(format!("resolve address {}", dst)))?;
        channel.await_event(CmEventType::AddrResolved)?.ack()?;
        self.state = ConnState::AddrResolved;
        info!("address {} resolved", dst);
        Ok(())
    }

    /// Resolve the route. `ADDR_RESOLVED -> ROUTE_RESOLVED`.
    pub fn resolve_route(&mut self, channel: &EventChannel<F>, timeout: Duration) -> Result<()> {
        self.expect_state(ConnState::AddrResolved)?;
        self.fabric
            .resolve_route(self.raw, timeout)
            .map_err(Error::transport("resolve route"))?;
        channel.await_event(CmEventType::RouteResolved)?.ack()?;
        self.state = ConnState::RouteResolved;
        debug!("route resolved");
        Ok(())
    }

    /// Connect to the resolved peer and wait until the connection is
    /// established. `ROUTE_RESOLVED -> CONNECTING -> ESTABLISHED`.
    ///
    /// The queue pair must exist, and every receive the peer may consume
    /// must be posted, before calling this.
    pub fn connect(&mut self, channel: &EventChannel<F>, param: &ConnParam) -> Result<()> {
        self.expect_state(ConnState::RouteResolved)?;
        self.fabric
            .connect(self.raw, param)
            .map_err(Error::transport("connect"))?;
        self.state = ConnState::Connecting;
        channel.await_event(CmEventType::Established)?.ack()?;
        self.state = ConnState::Established;
        Ok(())
    }

    /// Bind to a local address and start listening. `INIT -> LISTENING`.
    pub fn listen(&mut self, addr: SocketAddr, backlog: i32) -> Result<()> {
        self.expect_state(ConnState::Init)?;
        self.fabric
            .bind_addr(self.raw, addr)
            .map_err(Error::transport(format!("bind {}", addr)))?;
        self.fabric
            .listen(self.raw, backlog)
            .map_err(Error::transport("listen"))?;
        self.state = ConnState::Listening;
        info!("listening on {}", addr);
        Ok(())
    }

    /// Take the next connection request of this listener.
    ///
    /// The identifier carried by the request becomes the owning handle of
    /// the new connection and is returned in the `CONNECT_REQUEST` state;
    /// this listener stays in `LISTENING`.
    pub fn take_request(&self, channel: &EventChannel<F>) -> Result<CmId<F>> {
        self.expect_state(ConnState::Listening)?;
        let event = channel.await_event(CmEventType::ConnectRequest)?;
        if event.listen_id().is_some_and(|l| l != self.raw) {
            return Err(Error::violation(
                "connection request for this listener",
                "request for another listener",
            ));
        }
        let conn = CmId {
            fabric: self.fabric.clone(),
            raw: event.id(),
            state: ConnState::ConnectRequest,
            live: true,
        };
        event.ack()?;
        debug!("connection request taken");
        Ok(conn)
    }

    /// Accept the pending connection request and wait until the connection
    /// is established. `CONNECT_REQUEST -> ESTABLISHED`.
    pub fn accept(&mut self, channel: &EventChannel<F>, param: &ConnParam) -> Result<()> {
        self.expect_state(ConnState::ConnectRequest)?;
        self.fabric
            .accept(self.raw, param)
            .map_err(Error::transport("accept"))?;
        channel.await_event(CmEventType::Established)?.ack()?;
        self.state = ConnState::Established;
        Ok(())
    }

    /// Leave the established state and drain the `DISCONNECTED` event.
    /// `ESTABLISHED -> DISCONNECTED`.
    pub fn disconnect(&mut self, channel: &EventChannel<F>, mode: DisconnectMode) -> Result<()> {
        self.expect_state(ConnState::Established)?;
        if mode == DisconnectMode::Initiate {
            self.fabric
                .disconnect(self.raw)
                .map_err(Error::transport("disconnect"))?;
        }
        let event = channel.await_event(CmEventType::Disconnected);
        self.state = ConnState::Disconnected;
        event?.ack()
    }

    /// Address of the connected peer.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.fabric.peer_addr(self.raw)
    }

    /// Destroy the identifier, reporting failure.
    pub fn destroy(mut self) -> Result<()> {
        self.live = false;
        self.fabric
            .destroy_id(self.raw)
            .map_err(Error::transport("destroy CM id"))
    }
}

impl<F: Fabric> Drop for CmId<F> {
    fn drop(&mut self) {
        if self.live {
            if let Err(e) = self.fabric.destroy_id(self.raw) {
                warn!("cannot destroy CM id {:?} on drop: {}", self.raw, e);
            }
        }
    }
}

impl<F: Fabric> fmt::Debug for CmId<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CmId<{:?}, {}>", self.raw, self.state)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::fabric::sim::{Op, SimFabric};

    fn local(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn unexpected_event_is_acked_and_rejected() {
        let sim = SimFabric::new().endpoint("a");
        let channel = EventChannel::new(&sim).unwrap();
        let id = CmId::new(&channel, PortSpace::Udp).unwrap();
        sim.resolve_addr(id.as_raw(), local(7000), Duration::from_secs(1))
            .unwrap();

        let err = channel.await_event(CmEventType::RouteResolved).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }), "{}", err);
        assert_eq!(sim.unacked_cm_events("a"), 0);
        assert_eq!(
            sim.journal("a")
                .iter()
                .filter(|op| matches!(op, Op::AckCmEvent(CmEventType::AddrResolved)))
                .count(),
            1
        );
    }

    #[test]
    fn dropped_event_is_acked_once() {
        let sim = SimFabric::new().endpoint("a");
        let channel = EventChannel::new(&sim).unwrap();
        let mut id = CmId::new(&channel, PortSpace::Udp).unwrap();
        id.resolve_addr(&channel, local(7000), Duration::from_secs(1))
            .unwrap();
        sim.resolve_route(id.as_raw(), Duration::from_secs(1)).unwrap();

        let event = channel.await_event(CmEventType::RouteResolved).unwrap();
        assert_eq!(sim.unacked_cm_events("a"), 1);
        drop(event);
        assert_eq!(sim.unacked_cm_events("a"), 0);
        assert!(sim.violations().is_empty());
    }

    #[test]
    fn transitions_are_checked() {
        let sim = SimFabric::new();
        let channel = EventChannel::new(&sim).unwrap();
        let mut id = CmId::new(&channel, PortSpace::Udp).unwrap();

        let err = id.resolve_route(&channel, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(id.state(), ConnState::Init);

        id.resolve_addr(&channel, local(7000), Duration::from_secs(1))
            .unwrap();
        id.resolve_route(&channel, Duration::from_secs(1)).unwrap();
        assert_eq!(id.state(), ConnState::RouteResolved);

        // No queue pair yet: the fabric refuses to connect.
        let err = id.connect(&channel, &ConnParam::default()).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));

        id.destroy().unwrap();
        channel.destroy().unwrap();
    }

    #[test]
    fn listener_binds_once_per_port() {
        let sim = SimFabric::new();
        let channel = EventChannel::new(&sim).unwrap();
        let mut first = CmId::new(&channel, PortSpace::Udp).unwrap();
        let mut second = CmId::new(&channel, PortSpace::Udp).unwrap();

        first.listen(local(7001), 8).unwrap();
        assert_eq!(first.state(), ConnState::Listening);
        assert!(sim.wait_listening(7001, Duration::ZERO));

        let err = second.listen(local(7001), 8).unwrap_err();
        assert!(matches!(err, Error::Transport { .. }));
    }
}
