//! Completion channel, completion queue and the completion reactor.

use std::hint;

use log::{debug, warn};

use super::cm::CmId;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, Wc};

fabric_resource! {
    /// Completion event channel.
    ///
    /// An armed [`Cq`] bound to this channel produces one event when its next
    /// completion arrives.
    CompChannel, CompChannel, destroy_comp_channel, "completion channel"
}

fabric_resource! {
    /// Completion queue.
    Cq, Cq, destroy_cq, "completion queue"
}

/// Acknowledges one completion event of a CQ when dropped.
struct CqEventAck<'a, F: Fabric> {
    fabric: &'a F,
    cq: F::Cq,
}

impl<F: Fabric> Drop for CqEventAck<'_, F> {
    fn drop(&mut self) {
        self.fabric.ack_cq_events(self.cq, 1);
    }
}

impl<F: Fabric> CompChannel<F> {
    /// Create a completion channel on the device the identifier is bound to.
    pub fn new(id: &CmId<F>) -> Result<Self> {
        let fabric = id.fabric().clone();
        let raw = fabric
            .create_comp_channel(id.as_raw())
            .map_err(Error::transport("create completion channel"))?;
        Ok(Self::from_raw(fabric, raw))
    }

    /// Block until `n` completions of `cq` have been collected.
    ///
    /// Waits for one channel event, re-arms `cq`, then polls until `n`
    /// completions are in. Completions are appended to `out` in the order
    /// the queue drains them. The first completion with a non-success status
    /// fails the call with [`Error::OperationFailed`]; it and everything
    /// polled before it are still appended.
    ///
    /// Exactly one channel event is acknowledged per call, on every path
    /// after the event was obtained.
    pub fn wait_completions(&self, cq: &Cq<F>, n: usize, out: &mut Vec<Wc>) -> Result<()> {
        if n == 0 {
            return Ok(());
        }

        let raw = self
            .fabric
            .get_cq_event(self.raw)
            .map_err(Error::transport("get CQ event"))?;
        let _ack = CqEventAck {
            fabric: &self.fabric,
            cq: raw,
        };
        if raw != cq.as_raw() {
            return Err(Error::violation(
                format!("event for CQ {:?}", cq.as_raw()),
                format!("event for CQ {:?}", raw),
            ));
        }

        // Re-arm before draining: a completion landing after the last poll
        // must still produce an event.
        cq.req_notify()?;

        let mut wc = vec![Wc::default(); n];
        let mut got = 0;
        while got < n {
            let polled = cq.poll(&mut wc[..n - got])?;
            if polled == 0 {
                hint::spin_loop();
                continue;
            }
            debug!("polled {} completion(s), {}/{}", polled, got + polled, n);

            for c in &wc[..polled] {
                out.push(*c);
                if let Err(status) = c.ok() {
                    warn!("work request {} completed with {}", c.wr_id, status);
                    return Err(Error::OperationFailed {
                        wr_id: c.wr_id,
                        status,
                    });
                }
            }
            got += polled;
        }
        Ok(())
    }
}

impl<F: Fabric> Cq<F> {
    /// Create a completion queue bound to `channel`.
    pub fn new(id: &CmId<F>, capacity: u32, channel: &CompChannel<F>) -> Result<Self> {
        let fabric = id.fabric().clone();
        let raw = fabric
            .create_cq(id.as_raw(), capacity, channel.as_raw())
            .map_err(Error::transport(format!("create CQ of {} entries", capacity)))?;
        Ok(Self::from_raw(fabric, raw))
    }

    /// Arm the CQ: its next completion produces a channel event.
    pub fn req_notify(&self) -> Result<()> {
        self.fabric
            .req_notify_cq(self.raw, false)
            .map_err(Error::transport("request CQ notification"))
    }

    /// Non-blockingly poll the completion queue into `wc`.
    /// Return the number of entries filled.
    ///
    /// It is the caller's responsibility to check the status codes of the
    /// returned work completion entries.
    pub fn poll(&self, wc: &mut [Wc]) -> Result<usize> {
        self.fabric
            .poll_cq(self.raw, wc)
            .map_err(Error::transport("poll CQ"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::fabric::sim::{Op, SimFabric};
    use crate::fabric::{PortSpace, WcOpcode, WcStatus};
    use crate::rdma::cm::EventChannel;

    struct Fixture {
        sim: SimFabric,
        cq: Option<Cq<SimFabric>>,
        channel: Option<CompChannel<SimFabric>>,
        _id: CmId<SimFabric>,
        _ec: EventChannel<SimFabric>,
    }

    impl Fixture {
        fn new() -> Self {
            let sim = SimFabric::with_deadline(Duration::from_millis(200)).endpoint("r");
            let ec = EventChannel::new(&sim).unwrap();
            let id = CmId::new(&ec, PortSpace::Udp).unwrap();
            let channel = CompChannel::new(&id).unwrap();
            let cq = Cq::new(&id, 16, &channel).unwrap();
            cq.req_notify().unwrap();
            Self {
                sim,
                cq: Some(cq),
                channel: Some(channel),
                _id: id,
                _ec: ec,
            }
        }

        fn cq(&self) -> &Cq<SimFabric> {
            self.cq.as_ref().unwrap()
        }

        fn channel(&self) -> &CompChannel<SimFabric> {
            self.channel.as_ref().unwrap()
        }

        /// Inject completions as if the device produced them.
        fn produce(&self, wcs: &[Wc]) {
            let raw = self.cq().as_raw();
            self.sim.inject_completions(raw, wcs);
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            self.cq.take().unwrap().destroy().unwrap();
            self.channel.take().unwrap().destroy().unwrap();
        }
    }

    fn wc(wr_id: u64, status: WcStatus) -> Wc {
        Wc {
            wr_id,
            status,
            opcode: WcOpcode::Send,
            byte_len: 0,
        }
    }

    #[test]
    fn collects_at_least_n() {
        let fx = Fixture::new();
        fx.produce(&[wc(1, WcStatus::Success), wc(2, WcStatus::Success)]);

        let mut out = Vec::new();
        fx.channel().wait_completions(fx.cq(), 2, &mut out).unwrap();
        assert_eq!(out.iter().map(|w| w.wr_id).collect::<Vec<_>>(), [1, 2]);

        let journal = fx.sim.journal("r");
        let gets = journal.iter().filter(|op| **op == Op::GetCqEvent).count();
        let acks = journal
            .iter()
            .filter(|op| matches!(op, Op::AckCqEvents(_)))
            .count();
        assert_eq!((gets, acks), (1, 1));

        // Re-armed before draining.
        let get = journal.iter().position(|op| *op == Op::GetCqEvent).unwrap();
        let rearm = journal.iter().rposition(|op| *op == Op::ReqNotifyCq).unwrap();
        let poll = journal
            .iter()
            .position(|op| matches!(op, Op::PollCq(_)))
            .unwrap();
        assert!(get < rearm && rearm < poll);
    }

    #[test]
    fn first_failure_aborts_the_wait() {
        let fx = Fixture::new();
        fx.produce(&[
            wc(1, WcStatus::Success),
            wc(2, WcStatus::RemAccessErr),
            wc(3, WcStatus::Success),
        ]);

        let mut out = Vec::new();
        let err = fx
            .channel()
            .wait_completions(fx.cq(), 3, &mut out)
            .unwrap_err();
        match err {
            Error::OperationFailed { wr_id, status } => {
                assert_eq!((wr_id, status), (2, WcStatus::RemAccessErr))
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(out.len(), 2);
        assert!(fx.sim.violations().is_empty());
    }

    #[test]
    fn event_is_acked_when_polling_fails() {
        let fx = Fixture::new();
        fx.produce(&[wc(1, WcStatus::Success)]);

        // Only one completion will ever arrive: the sim gives up polling.
        let mut out = Vec::new();
        let err = fx
            .channel()
            .wait_completions(fx.cq(), 2, &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::Transport { .. }), "{}", err);
        assert_eq!(out.len(), 1);
        assert!(fx
            .sim
            .journal("r")
            .iter()
            .any(|op| *op == Op::AckCqEvents(1)));
    }
}
