use std::time::Duration;

use log::{info, warn};
use quanta::Instant;

use super::{missing, Role, Session, WR_READ, WR_WRITE};
use crate::error::{Error, Result};
use crate::fabric::{Fabric, WrId};
use crate::rdma::cq::{CompChannel, Cq};

/// Outcome of a one-sided transfer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferReport {
    /// Bytes written, then read back.
    pub bytes: usize,
    /// From posting the WRITE to its completion.
    pub write: Duration,
    /// From posting the READ to its completion.
    pub read: Duration,
    /// Whether the bytes read back equal the bytes written.
    pub verified: bool,
}

impl TransferReport {
    /// WRITE throughput in MB/s.
    pub fn write_mbps(&self) -> f64 {
        throughput(self.bytes, self.write)
    }

    /// READ throughput in MB/s.
    pub fn read_mbps(&self) -> f64 {
        throughput(self.bytes, self.read)
    }
}

fn throughput(bytes: usize, elapsed: Duration) -> f64 {
    bytes as f64 / (elapsed.as_secs_f64().max(1e-9) * 1e6)
}

/// Post one signaled work request and wait for its completion.
/// Return the time from posting to completion.
fn complete_one<F: Fabric>(
    comp_channel: &CompChannel<F>,
    cq: &Cq<F>,
    wr_id: WrId,
    post: impl FnOnce() -> Result<()>,
) -> Result<Duration> {
    let start = Instant::now();
    post()?;
    let mut wcs = Vec::with_capacity(1);
    comp_channel.wait_completions(cq, 1, &mut wcs)?;
    let elapsed = start.elapsed();

    match wcs.first() {
        Some(wc) if wc.wr_id == wr_id => Ok(elapsed),
        other => Err(Error::violation(
            format!("completion of WR {}", wr_id),
            format!("{:?}", other),
        )),
    }
}

impl<F: Fabric> Session<F> {
    /// WRITE the payload into the peer's region, then READ it back.
    ///
    /// The WRITE completes before the READ is posted. Fails with
    /// [`Error::ProtocolViolation`] on an acceptor, before the exchange, or
    /// if the payload exceeds what the peer advertised.
    pub fn transfer(&mut self) -> Result<TransferReport> {
        if self.role != Role::Initiator {
            return Err(Error::violation("initiator session", "acceptor session"));
        }
        let peer = self.peer.ok_or_else(|| missing("peer descriptor"))?;
        let (Some(qp), Some(comp_channel), Some(cq), Some(data), Some(recv)) = (
            &self.qp,
            &self.comp_channel,
            &self.cq,
            &self.data,
            &self.recv,
        ) else {
            return Err(missing("transfer"));
        };

        let bytes = data.len();
        if bytes > peer.len() {
            return Err(Error::violation(
                format!("payload of at most {} bytes", peer.len()),
                format!("{} bytes", bytes),
            ));
        }

        let write = complete_one(comp_channel, cq, WR_WRITE, || {
            qp.write(WR_WRITE, data.sge(), peer.at(0))
        })?;
        info!("WRITE throughput: {:.3} MB/s", throughput(bytes, write));

        let read = complete_one(comp_channel, cq, WR_READ, || {
            qp.read(WR_READ, recv.sge(), peer.at(0))
        })?;
        info!("READ throughput: {:.3} MB/s", throughput(bytes, read));

        let verified = self.verify();
        if verified {
            info!("functional check passed");
        } else {
            warn!("functional check failed: bytes read back differ from bytes written");
        }
        Ok(TransferReport {
            bytes,
            write,
            read,
            verified,
        })
    }

    /// Whether the READ destination holds exactly the payload.
    pub fn verify(&self) -> bool {
        match (&self.data, &self.recv) {
            (Some(data), Some(recv)) => data.as_slice() == recv.as_slice(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throughput_is_positive_for_instant_transfers() {
        assert!(throughput(4, Duration::ZERO) > 0.0);
        let mbps = throughput(2_000_000, Duration::from_secs(1));
        assert!((mbps - 2.0).abs() < 1e-9);
    }
}
