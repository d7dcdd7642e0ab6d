use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use super::teardown::release_regions;
use super::*;
use crate::fabric::sim::{Fault, Op, SimFabric};
use crate::fabric::{CmEventType, WrOpcode};
use crate::rdma::mr::StableMem;

const INITIATOR: &str = "initiator";
const ACCEPTOR: &str = "acceptor";

fn config(port: u16, buffer_len: usize) -> SessionConfig {
    SessionConfig {
        port,
        buffer_len,
        ..Default::default()
    }
}

fn target(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

struct Outcome {
    sim: SimFabric,
    initiator: Result<TransferReport>,
    acceptor: Result<AcceptReport>,
}

/// Run both roles against one simulated fabric, the acceptor on its own
/// thread. `prepare` may inject faults into the initiator and acceptor
/// endpoints before anything runs.
fn run_pair(
    port: u16,
    payload: Vec<u8>,
    exposed: usize,
    prepare: impl FnOnce(&SimFabric, &SimFabric),
) -> Outcome {
    let sim = SimFabric::new();
    let (initiator, acceptor) = (sim.endpoint(INITIATOR), sim.endpoint(ACCEPTOR));
    prepare(&initiator, &acceptor);

    let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let handle = thread::spawn(move || run_acceptor(&acceptor, bind, config(port, exposed)));
    assert!(sim.wait_listening(port, Duration::from_secs(5)));

    let initiator = run_initiator(&initiator, target(port), payload, config(port, exposed));
    let acceptor = handle.join().unwrap();
    Outcome {
        sim,
        initiator,
        acceptor,
    }
}

/// Every endpoint released all it held, acknowledged every event and broke
/// no resource rule.
fn assert_released(sim: &SimFabric) {
    assert!(sim.violations().is_empty(), "{:?}", sim.violations());
    for tag in [INITIATOR, ACCEPTOR] {
        assert_eq!(sim.unacked_cm_events(tag), 0, "{}", tag);
        assert_eq!(sim.live_resources(tag), 0, "{}", tag);

        let journal = sim.journal(tag);
        let gets = journal.iter().filter(|op| **op == Op::GetCqEvent).count();
        let acked: u32 = journal
            .iter()
            .filter_map(|op| match op {
                Op::AckCqEvents(n) => Some(*n),
                _ => None,
            })
            .sum();
        assert_eq!(gets, acked as usize, "{}", tag);
    }
}

fn position(journal: &[Op], op: Op) -> usize {
    journal
        .iter()
        .position(|o| *o == op)
        .unwrap_or_else(|| panic!("{:?} not in journal", op))
}

fn polled(journal: &[Op]) -> usize {
    journal
        .iter()
        .map(|op| match op {
            Op::PollCq(n) => *n,
            _ => 0,
        })
        .sum()
}

/// Resource operations from the first disconnect on, by name.
fn teardown_ops(journal: &[Op]) -> Vec<&'static str> {
    journal
        .iter()
        .filter_map(|op| match op {
            Op::Disconnect => Some("disconnect"),
            Op::DestroyQp => Some("qp"),
            Op::DestroyId => Some("id"),
            Op::DestroyCq => Some("cq"),
            Op::DestroyCompChannel => Some("comp_channel"),
            Op::DeregMr(_) => Some("mr"),
            Op::DeallocPd => Some("pd"),
            Op::DestroyEventChannel => Some("channel"),
            _ => None,
        })
        .collect()
}

#[test]
fn short_message_round_trips() {
    let out = run_pair(4791, b"AAAA".to_vec(), 4096, |_, _| {});

    let report = out.initiator.unwrap();
    assert_eq!(report.bytes, 4);
    assert!(report.verified);

    let accepted = out.acceptor.unwrap();
    assert_eq!(accepted.peer.len(), 4);
    assert_eq!(&accepted.exposed[..4], b"AAAA");
    assert!(accepted.exposed[4..].iter().all(|b| *b == 0));
    assert!(accepted.peer_addr.is_some());

    let initiator = out.sim.journal(INITIATOR);
    let acceptor = out.sim.journal(ACCEPTOR);

    // Exchange takes two completions per side, each one-sided phase one.
    assert_eq!(polled(&initiator), 4);
    assert_eq!(polled(&acceptor), 2);

    // Receives for the descriptor are posted before the peer can send.
    assert!(position(&initiator, Op::PostRecv(WR_RECV_META)) < position(&initiator, Op::Connect));
    assert!(position(&acceptor, Op::PostRecv(WR_RECV_META)) < position(&acceptor, Op::Accept));

    // SEND, then WRITE, then READ.
    let send = position(&initiator, Op::PostSend(WR_SEND_META, WrOpcode::Send));
    let write = position(&initiator, Op::PostSend(WR_WRITE, WrOpcode::RdmaWrite));
    let read = position(&initiator, Op::PostSend(WR_READ, WrOpcode::RdmaRead));
    assert!(send < write && write < read);
    assert!(!acceptor.iter().any(Op::is_one_sided));

    assert_released(&out.sim);
}

#[test]
fn teardown_runs_in_reverse_creation_order() {
    let out = run_pair(4792, b"ordering".to_vec(), 64, |_, _| {});
    out.initiator.unwrap();
    out.acceptor.unwrap();

    let initiator = out.sim.journal(INITIATOR);
    let from = position(&initiator, Op::Disconnect);
    assert_eq!(
        teardown_ops(&initiator[from..]),
        [
            "disconnect",
            "qp",
            "id",
            "cq",
            "comp_channel",
            "mr",
            "mr",
            "mr",
            "mr",
            "pd",
            "channel"
        ]
    );
    let drained = position(&initiator, Op::AckCmEvent(CmEventType::Disconnected));
    assert!(from < drained && drained < position(&initiator, Op::DestroyQp));

    // Registered as data, recv, local descriptor, peer descriptor;
    // deregistered descriptors first.
    let registered = initiator
        .iter()
        .filter_map(|op| match op {
            Op::RegMr { mr, .. } => Some(*mr),
            _ => None,
        })
        .collect::<Vec<_>>();
    let deregistered = initiator
        .iter()
        .filter_map(|op| match op {
            Op::DeregMr(mr) => Some(*mr),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(
        deregistered,
        [registered[3], registered[2], registered[0], registered[1]]
    );

    // The acceptor waits for the peer instead of disconnecting, and
    // destroys its listener after the protection domain.
    let acceptor = out.sim.journal(ACCEPTOR);
    assert!(!acceptor.contains(&Op::Disconnect));
    let from = position(&acceptor, Op::AckCmEvent(CmEventType::Disconnected));
    assert_eq!(
        teardown_ops(&acceptor[from..]),
        ["qp", "id", "cq", "comp_channel", "mr", "mr", "mr", "pd", "id", "channel"]
    );
    assert_released(&out.sim);
}

#[test]
fn megabyte_payload_round_trips() {
    let payload = build_payload(None, Some(1 << 20)).unwrap();
    let out = run_pair(4793, payload.clone(), 4 << 20, |_, _| {});

    let report = out.initiator.unwrap();
    assert_eq!(report.bytes, 1 << 20);
    assert!(report.verified);
    assert!(report.write_mbps() > 0.0);
    assert!(report.read_mbps() > 0.0);

    let accepted = out.acceptor.unwrap();
    assert_eq!(&accepted.exposed[..1 << 20], &payload[..]);

    let initiator = out.sim.journal(INITIATOR);
    assert_eq!(initiator.iter().filter(|op| op.is_one_sided()).count(), 2);
    assert_released(&out.sim);
}

#[test]
fn failed_connect_request_is_acked_and_fatal() {
    let out = run_pair(4794, b"AAAA".to_vec(), 4096, |_, acceptor| {
        acceptor.inject(Fault::ConnectRequestStatus(-libc::ECONNRESET));
    });

    let err = out.acceptor.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "{}", err);
    assert_eq!(err.exit_code(), libc::ECONNRESET as u8);

    let err = out.initiator.unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "{}", err);

    let acceptor = out.sim.journal(ACCEPTOR);
    assert!(acceptor.contains(&Op::AckCmEvent(CmEventType::ConnectRequest)));
    assert!(!acceptor.contains(&Op::AllocPd));
    let initiator = out.sim.journal(INITIATOR);
    assert!(initiator.contains(&Op::AckCmEvent(CmEventType::Rejected)));
    assert_released(&out.sim);
}

#[test]
fn dropped_send_fails_exchange_without_transfer() {
    let out = run_pair(4795, b"AAAA".to_vec(), 4096, |initiator, _| {
        initiator.inject(Fault::DropSend);
    });

    match out.initiator.unwrap_err() {
        Error::MetadataExchangeFailed {
            expected,
            got,
            source,
        } => {
            assert_eq!(expected, 2);
            assert!(got < 2);
            assert!(matches!(
                source.as_deref(),
                Some(Error::OperationFailed {
                    wr_id: WR_SEND_META,
                    ..
                })
            ));
        }
        other => panic!("unexpected error: {}", other),
    }
    let err = out.acceptor.unwrap_err();
    assert!(
        matches!(err, Error::MetadataExchangeFailed { .. }),
        "{}",
        err
    );
    assert_ne!(err.exit_code(), 0);

    for tag in [INITIATOR, ACCEPTOR] {
        assert!(!out.sim.journal(tag).iter().any(Op::is_one_sided), "{}", tag);
    }
    assert_released(&out.sim);
}

#[test]
fn oversized_payload_is_refused_before_writing() {
    let out = run_pair(4796, vec![7u8; 64], 32, |_, _| {});

    let err = out.initiator.unwrap_err();
    assert!(matches!(err, Error::ProtocolViolation { .. }), "{}", err);
    assert!(!out.sim.journal(INITIATOR).iter().any(Op::is_one_sided));

    // The exchange itself succeeded, so the acceptor saw a normal session.
    let accepted = out.acceptor.unwrap();
    assert_eq!(accepted.peer.len(), 64);
    assert!(accepted.exposed.iter().all(|b| *b == 0));
    assert_released(&out.sim);
}

#[test]
fn refused_connection_reports_errno() {
    let sim = SimFabric::new().endpoint(INITIATOR);
    let err = run_initiator(&sim, target(4797), b"x".to_vec(), config(4797, 64)).unwrap_err();
    assert!(matches!(err, Error::Transport { .. }), "{}", err);
    assert_eq!(err.exit_code(), libc::ECONNREFUSED as u8);
    assert_eq!(sim.live_resources(INITIATOR), 0);
    assert_eq!(sim.unacked_cm_events(INITIATOR), 0);
    assert!(sim.violations().is_empty());
}

#[test]
fn half_built_session_releases_on_drop() {
    let sim = SimFabric::new().endpoint(INITIATOR);
    sim.inject(Fault::FailRegistration);

    let err = Session::connect(&sim, target(4798), b"xy".to_vec(), config(4798, 64)).unwrap_err();
    assert!(matches!(err, Error::Registration { len: 2, .. }), "{}", err);

    let journal = sim.journal(INITIATOR);
    assert!(journal.contains(&Op::CreateQp));
    assert!(!journal.contains(&Op::Connect));
    assert_eq!(sim.live_resources(INITIATOR), 0);
    assert!(sim.violations().is_empty());
}

#[test]
fn empty_payload_is_rejected_up_front() {
    let sim = SimFabric::new().endpoint(INITIATOR);
    let err = Session::connect(&sim, target(4799), Vec::new(), config(4799, 64)).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
    assert!(sim.journal(INITIATOR).is_empty());
}

/// Heap bytes that leave a note in the journal when released.
struct Noted(Box<[u8]>, SimFabric);

impl AsRef<[u8]> for Noted {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl AsMut<[u8]> for Noted {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

// SAFETY: wraps a boxed slice.
unsafe impl StableMem for Noted {}

impl Drop for Noted {
    fn drop(&mut self) {
        self.1.note("free");
    }
}

#[test]
fn memory_is_released_after_every_deregistration() {
    use crate::fabric::PortSpace;
    use crate::rdma::cm::{CmId, EventChannel};
    use crate::rdma::mr::Permission;
    use crate::rdma::pd::Pd;

    let sim = SimFabric::new().endpoint("mr");
    let channel = EventChannel::new(&sim).unwrap();
    let id = CmId::new(&channel, PortSpace::Udp).unwrap();
    let pd = Pd::new(&id).unwrap();

    let regions = (0..3)
        .map(|_| {
            let mem = Noted(vec![0u8; 16].into_boxed_slice(), sim.clone());
            Region::register(&pd, mem, Permission::LOCAL).unwrap()
        })
        .collect::<Vec<_>>();

    let mut report = TeardownReport::default();
    release_regions(regions, &mut report);
    assert!(report.is_clean());

    let journal = sim.journal("mr");
    let last_dereg = journal
        .iter()
        .rposition(|op| matches!(op, Op::DeregMr(_)))
        .unwrap();
    let first_free = position(&journal, Op::Note("free"));
    assert!(last_dereg < first_free);
    assert_eq!(
        journal.iter().filter(|op| **op == Op::Note("free")).count(),
        3
    );
}
