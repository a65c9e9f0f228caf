//! Attribute Protocol ([Vol 3] Part F).

pub use {consts::*, handle::*, pdu::*, perm::*, uuid::*};

mod consts;
mod handle;
mod pdu;
mod perm;
mod uuid;

/// `ATT_ERROR_RSP` PDU ([Vol 3] Part F, Section 3.4.1.1).
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("ATT {req:#04X}{} failed with {err}", .hdl.map_or(String::new(), |h| format!(" for handle {:#06X}", u16::from(h))))]
pub struct ErrorRsp {
    /// Raw request opcode. Unknown opcodes must still be reported.
    pub req: u8,
    pub hdl: Option<Handle>,
    pub err: ErrorCode,
}

impl ErrorRsp {
    /// Creates a new error response.
    #[inline]
    #[must_use]
    pub const fn new(req: u8, hdl: Option<Handle>, err: ErrorCode) -> Self {
        Self { req, hdl, err }
    }

    /// Encodes the error response PDU.
    #[must_use]
    pub fn to_pdu(&self) -> Vec<u8> {
        let [lo, hi] = self.hdl.map_or(0, u16::from).to_le_bytes();
        vec![Opcode::ErrorRsp as u8, self.req, lo, hi, self.err as u8]
    }

    /// Decodes an `ATT_ERROR_RSP` PDU, including the opcode.
    #[must_use]
    pub fn from_pdu(pdu: &[u8]) -> Option<Self> {
        let mut p = structbuf::Unpacker::new(pdu);
        if p.u8() != Opcode::ErrorRsp as u8 {
            return None;
        }
        let (req, hdl, err) = (p.u8(), Handle::new(p.u16()), p.u8());
        p.is_ok().then(|| Self {
            req,
            hdl,
            err: ErrorCode::try_from(err).unwrap_or(ErrorCode::UnlikelyError),
        })
    }
}

/// PDU response result.
pub type RspResult<T> = std::result::Result<T, ErrorRsp>;

/// Error returned when a PDU write would exceed the remaining budget.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, thiserror::Error)]
#[error("PDU budget exceeded")]
pub struct NoResources;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_rsp_pdu() {
        let e = ErrorRsp::new(0x0A, Handle::new(0x0102), ErrorCode::InvalidHandle);
        let pdu = e.to_pdu();
        assert_eq!(pdu, [0x01, 0x0A, 0x02, 0x01, 0x01]);
        assert_eq!(ErrorRsp::from_pdu(&pdu), Some(e));
        assert_eq!(ErrorRsp::from_pdu(&pdu[..3]), None);
        assert_eq!(
            e.to_string(),
            "ATT 0x0A for handle 0x0102 failed with InvalidHandle"
        );
    }
}
