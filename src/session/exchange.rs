use log::{debug, info};

use super::{missing, Session, WR_RECV_META, WR_SEND_META};
use crate::error::{Error, Result};
use crate::fabric::Fabric;
use crate::rdma::mr::{BufferDescriptor, Permission, Region};

/// Completions one exchange waits for: our SEND and the peer's.
const EXCHANGE_COMPLETIONS: usize = 2;

impl<F: Fabric> Session<F> {
    /// Register the descriptor regions and post the receive for the peer's
    /// descriptor.
    ///
    /// Must run before the connection is established: from then on the
    /// peer may SEND at any time.
    pub(super) fn prepare_exchange(&mut self) -> Result<()> {
        let pd = self.pd.as_ref().ok_or_else(|| missing("protection domain"))?;
        let qp = self.qp.as_ref().ok_or_else(|| missing("queue pair"))?;
        let data = self.data.as_ref().ok_or_else(|| missing("data region"))?;
        let desc = data.descriptor().ok_or_else(|| {
            Error::violation(
                "remotely accessible data region",
                format!("region with {:?}", data.perm()),
            )
        })?;

        let mut local_meta = Region::allocate(pd, BufferDescriptor::SIZE, Permission::LOCAL)?;
        local_meta.as_mut_slice().copy_from_slice(&desc.to_bytes());
        self.local_meta = Some(local_meta);

        let peer_meta = self.peer_meta.insert(Region::allocate(
            pd,
            BufferDescriptor::SIZE,
            Permission::LOCAL,
        )?);
        qp.recv(WR_RECV_META, peer_meta.sge())?;
        debug!("advertising {:?}", desc);
        Ok(())
    }

    /// Send our descriptor, receive the peer's, and return it.
    ///
    /// Waits for exactly one SEND and one RECV completion. Anything else
    /// fails with [`Error::MetadataExchangeFailed`] carrying the number of
    /// successful completions and the underlying cause.
    pub fn exchange(&mut self) -> Result<BufferDescriptor> {
        let failed = |got: usize, source: Error| Error::MetadataExchangeFailed {
            expected: EXCHANGE_COMPLETIONS,
            got,
            source: Some(Box::new(source)),
        };

        let (Some(qp), Some(comp_channel), Some(cq), Some(local_meta), Some(peer_meta)) = (
            &self.qp,
            &self.comp_channel,
            &self.cq,
            &self.local_meta,
            &self.peer_meta,
        ) else {
            return Err(missing("descriptor exchange"));
        };

        qp.send(WR_SEND_META, local_meta.sge())
            .map_err(|e| failed(0, e))?;

        let mut wcs = Vec::with_capacity(EXCHANGE_COMPLETIONS);
        let ret = comp_channel.wait_completions(cq, EXCHANGE_COMPLETIONS, &mut wcs);
        let got = wcs.iter().filter(|wc| wc.ok().is_ok()).count();
        ret.map_err(|e| failed(got, e))?;

        let sent = wcs.iter().any(|wc| wc.wr_id == WR_SEND_META);
        let recv = wcs.iter().find(|wc| wc.wr_id == WR_RECV_META);
        let (true, Some(recv)) = (sent, recv) else {
            let ids = wcs.iter().map(|wc| wc.wr_id).collect::<Vec<_>>();
            return Err(failed(
                got,
                Error::violation(
                    format!("completions of WR {} and {}", WR_SEND_META, WR_RECV_META),
                    format!("completions of WR {:?}", ids),
                ),
            ));
        };
        if recv.byte_len as usize != BufferDescriptor::SIZE {
            return Err(failed(
                got,
                Error::violation(
                    format!("{}-byte descriptor", BufferDescriptor::SIZE),
                    format!("{} bytes", recv.byte_len),
                ),
            ));
        }

        let peer = BufferDescriptor::from_bytes(peer_meta.as_slice()).ok_or_else(|| {
            failed(
                got,
                Error::violation("descriptor region", "short descriptor region"),
            )
        })?;
        info!("descriptors exchanged, peer exposes {} bytes", peer.len());
        self.peer = Some(peer);
        Ok(peer)
    }
}
