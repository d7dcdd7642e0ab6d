use log::{debug, warn};

use super::Session;
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::rdma::cm::{ConnState, DisconnectMode};
use crate::rdma::mr::{Region, StableMem};

/// Failures met while tearing a session down.
///
/// Teardown never stops at a failed step; every failure is logged and
/// recorded here instead.
#[derive(Debug, Default)]
pub struct TeardownReport {
    failures: Vec<(&'static str, Error)>,
}

impl TeardownReport {
    /// Whether every step succeeded.
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Failed steps and their errors, in teardown order.
    #[inline]
    pub fn failures(&self) -> &[(&'static str, Error)] {
        &self.failures
    }

    fn step(&mut self, what: &'static str, ret: Result<()>) {
        if let Err(e) = ret {
            warn!("teardown: cannot {}: {}", what, e);
            self.failures.push((what, e));
        }
    }
}

/// Deregister every region, then release their memory.
///
/// No memory is released before all deregistrations have been attempted.
/// Memory whose deregistration fails is leaked.
pub(super) fn release_regions<F: Fabric, M: StableMem>(
    regions: impl IntoIterator<Item = Region<F, M>>,
    report: &mut TeardownReport,
) {
    let mut released = Vec::new();
    for region in regions {
        match region.deregister() {
            Ok(mem) => released.push(mem),
            Err(e) => report.step("deregister memory region", Err(e)),
        }
    }
    drop(released);
}

impl<F: Fabric> Session<F> {
    /// Tear the session down.
    ///
    /// If the connection is established it is first left with `mode`, and
    /// the resulting DISCONNECTED event is drained. Then the queue pair,
    /// connection identifier, CQ and completion channel are destroyed, all
    /// regions are deregistered before any of their memory is released,
    /// and finally the protection domain, listener and event channel go.
    pub fn teardown(mut self, mode: DisconnectMode) -> TeardownReport {
        self.release(mode)
    }

    fn release(&mut self, mode: DisconnectMode) -> TeardownReport {
        let mut report = TeardownReport::default();

        if self.state() == Some(ConnState::Established) {
            report.step("disconnect", self.disconnect(mode));
        }

        if let Some(qp) = self.qp.take() {
            report.step("destroy queue pair", qp.destroy());
        }
        if let Some(id) = self.id.take() {
            report.step("destroy connection id", id.destroy());
        }
        if let Some(cq) = self.cq.take() {
            report.step("destroy completion queue", cq.destroy());
        }
        if let Some(comp_channel) = self.comp_channel.take() {
            report.step("destroy completion channel", comp_channel.destroy());
        }

        let regions = [
            self.peer_meta.take(),
            self.local_meta.take(),
            self.data.take(),
            self.recv.take(),
        ];
        release_regions(regions.into_iter().flatten(), &mut report);

        if let Some(pd) = self.pd.take() {
            report.step("deallocate protection domain", pd.destroy());
        }
        if let Some(listener) = self.listener.take() {
            report.step("destroy listener", listener.destroy());
        }
        if let Some(channel) = self.channel.take() {
            report.step("destroy event channel", channel.destroy());
        }

        debug!(
            "{:?} session torn down with {} failure(s)",
            self.role,
            report.failures.len()
        );
        report
    }
}

impl<F: Fabric> Drop for Session<F> {
    fn drop(&mut self) {
        if self.channel.is_some() {
            self.release(DisconnectMode::Initiate);
        }
    }
}
