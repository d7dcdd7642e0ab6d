use std::fmt;

use thiserror::Error;

use super::WrId;

/// Opcode of a work completion.
///
/// Values follow `enum ibv_wc_opcode`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    Send,
    /// RDMA write request.
    RdmaWrite,
    /// RDMA read request.
    RdmaRead,
    /// RDMA compare-and-swap request.
    CompSwap,
    /// RDMA fetch-and-add request.
    FetchAdd,
    /// Memory window bind request.
    BindMw,
    /// Receive request.
    Recv,
    /// Receive request with immediate data.
    RecvRdmaImm,
    /// Anything this crate does not post.
    Unknown,
}

impl WcOpcode {
    /// Decode an `ibv_wc_opcode` value.
    pub fn from_raw(opcode: u32) -> Self {
        match opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            _ => WcOpcode::Unknown,
        }
    }
}

/// Status of a work completion.
///
/// Discriminants follow `enum ibv_wc_status`, so a status converts to the
/// numeric code the device reported with `as`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// The work request and all unsignaled requests before it finished.
    #[error("success")]
    Success = 0,

    /// A message did not fit the port's maximum message size or the posted
    /// receive buffer.
    #[error("local length error")]
    LocLenErr = 1,

    /// Internal QP consistency error while processing the work request.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    /// Unused: RD QPs only.
    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// A local scatter/gather entry does not reference a memory region valid
    /// for the operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// The work request was outstanding when the QP entered the error state.
    #[error("WR flush error")]
    WrFlushErr = 5,

    /// Memory window binding failed.
    #[error("memory window bind error")]
    MwBindErr = 6,

    /// The responder returned an unexpected transport opcode.
    #[error("bad response error")]
    BadRespErr = 7,

    /// Protection error on a local buffer targeted by the remote side.
    #[error("local access error")]
    LocAccessErr = 8,

    /// The responder found the request invalid.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// Remote key, bounds or access rights did not allow the one-sided
    /// operation.
    #[error("remote access error")]
    RemAccessErr = 10,

    /// The responder could not complete the operation.
    #[error("remote operation error")]
    RemOpErr = 11,

    /// The transport retry counter was exceeded without an ACK or NAK.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// The peer never posted a receive for the incoming message.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    /// Unused: RD QPs only.
    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    /// Unused: RD QPs only.
    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    /// The responder aborted the operation.
    #[error("remote aborted error")]
    RemAbortErr = 16,

    /// Unused: RD QPs only.
    #[error("invalid EE context number")]
    InvEecnErr = 17,

    /// Unused: RD QPs only.
    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    /// Fatal, possibly unrecoverable device error.
    #[error("fatal error")]
    FatalErr = 19,

    /// A response timed out.
    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// Any other error.
    #[error("general error")]
    GeneralErr = 21,
}

impl WcStatus {
    /// Decode an `ibv_wc_status` value. Codes this crate does not know are
    /// reported as [`WcStatus::GeneralErr`].
    pub fn from_raw(status: u32) -> Self {
        use WcStatus::*;
        const ALL: [WcStatus; 22] = [
            Success,
            LocLenErr,
            LocQpOpErr,
            LocEecOpErr,
            LocProtErr,
            WrFlushErr,
            MwBindErr,
            BadRespErr,
            LocAccessErr,
            RemInvReqErr,
            RemAccessErr,
            RemOpErr,
            RetryExcErr,
            RnrRetryExcErr,
            LocRddViolErr,
            RemInvRdReqErr,
            RemAbortErr,
            InvEecnErr,
            InvEecStateErr,
            FatalErr,
            RespTimeoutErr,
            GeneralErr,
        ];
        ALL.get(status as usize).copied().unwrap_or(GeneralErr)
    }
}

/// Work completion entry.
///
/// A backend-neutral copy of the fields of `ibv_wc` that the session reads.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Wc {
    /// Identifier of the completed work request.
    pub wr_id: WrId,
    /// Completion status.
    pub status: WcStatus,
    /// Operation that completed. Only meaningful on success.
    pub opcode: WcOpcode,
    /// Bytes transferred. Only meaningful for receives.
    pub byte_len: u32,
}

impl Wc {
    /// Get the completion status as a `Result`.
    ///
    /// - If the status is success, return the number of bytes transferred.
    /// - Otherwise, return the status.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.byte_len as usize),
            status => Err(status),
        }
    }
}

impl Default for Wc {
    fn default() -> Self {
        Self {
            wr_id: 0,
            status: WcStatus::Success,
            opcode: WcOpcode::Unknown,
            byte_len: 0,
        }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_roundtrip_through_raw_values() {
        assert_eq!(WcStatus::from_raw(0), WcStatus::Success);
        assert_eq!(WcStatus::from_raw(10), WcStatus::RemAccessErr);
        assert_eq!(WcStatus::from_raw(13), WcStatus::RnrRetryExcErr);
        assert_eq!(WcStatus::from_raw(21), WcStatus::GeneralErr);
        assert_eq!(WcStatus::from_raw(999), WcStatus::GeneralErr);
        assert_eq!(WcStatus::WrFlushErr as u32, 5);
    }

    #[test]
    fn receive_opcodes_are_offset() {
        assert_eq!(WcOpcode::from_raw(128), WcOpcode::Recv);
        assert_eq!(WcOpcode::from_raw(2), WcOpcode::RdmaRead);
        assert_eq!(WcOpcode::from_raw(77), WcOpcode::Unknown);
    }

    #[test]
    fn failed_completion_yields_status() {
        let wc = Wc {
            wr_id: 9,
            status: WcStatus::RemAccessErr,
            opcode: WcOpcode::RdmaWrite,
            byte_len: 0,
        };
        assert_eq!(wc.ok(), Err(WcStatus::RemAccessErr));
        let wc = Wc {
            status: WcStatus::Success,
            byte_len: 16,
            ..wc
        };
        assert_eq!(wc.ok(), Ok(16));
    }
}
