use log::debug;

use super::cm::CmId;
use super::cq::Cq;
use super::pd::Pd;
use crate::error::{Error, Result};
use crate::fabric::{Fabric, QpCaps, QpInitAttr, RecvWr, RemoteAddr, SendWr, Sge, WrId, WrOpcode};

fabric_resource! {
    /// Reliable-connected queue pair of a connection identifier.
    ///
    /// The queue pair is addressed through its identifier, which must
    /// outlive it.
    Qp, CmId, destroy_qp, "queue pair"
}

impl<F: Fabric> Qp<F> {
    /// Create the queue pair of `id`, with `cq` serving both queues.
    pub fn new(id: &CmId<F>, pd: &Pd<F>, cq: &Cq<F>, caps: QpCaps) -> Result<Self> {
        let fabric = id.fabric().clone();
        let attr = QpInitAttr {
            send_cq: cq.as_raw(),
            recv_cq: cq.as_raw(),
            caps,
            sq_sig_all: false,
        };
        fabric
            .create_qp(id.as_raw(), pd.as_raw(), &attr)
            .map_err(Error::transport("create QP"))?;
        Ok(Self::from_raw(fabric, id.as_raw()))
    }

    /// Post a send work request.
    pub fn post_send(&self, wr: &SendWr<'_>) -> Result<()> {
        debug!("post {:?} wr_id={}", wr.opcode, wr.wr_id);
        self.fabric
            .post_send(self.raw, wr)
            .map_err(Error::transport(format!("post {:?}", wr.opcode)))
    }

    /// Post a receive work request.
    pub fn post_recv(&self, wr: &RecvWr<'_>) -> Result<()> {
        debug!("post RECV wr_id={}", wr.wr_id);
        self.fabric
            .post_recv(self.raw, wr)
            .map_err(Error::transport("post RECV"))
    }

    /// Post a receive into `sge`.
    #[inline]
    pub fn recv(&self, wr_id: WrId, sge: Sge) -> Result<()> {
        self.post_recv(&RecvWr {
            wr_id,
            sgl: &[sge],
        })
    }

    /// Post a signaled two-sided send of `sge`.
    #[inline]
    pub fn send(&self, wr_id: WrId, sge: Sge) -> Result<()> {
        self.post_send(&SendWr {
            wr_id,
            opcode: WrOpcode::Send,
            sgl: &[sge],
            signaled: true,
            remote: None,
        })
    }

    /// Post a signaled one-sided write of `sge` to `remote`.
    #[inline]
    pub fn write(&self, wr_id: WrId, sge: Sge, remote: RemoteAddr) -> Result<()> {
        self.post_send(&SendWr {
            wr_id,
            opcode: WrOpcode::RdmaWrite,
            sgl: &[sge],
            signaled: true,
            remote: Some(remote),
        })
    }

    /// Post a signaled one-sided read from `remote` into `sge`.
    #[inline]
    pub fn read(&self, wr_id: WrId, sge: Sge, remote: RemoteAddr) -> Result<()> {
        self.post_send(&SendWr {
            wr_id,
            opcode: WrOpcode::RdmaRead,
            sgl: &[sge],
            signaled: true,
            remote: Some(remote),
        })
    }
}
