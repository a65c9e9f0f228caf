use super::*;

/// Default LE ATT_MTU ([Vol 3] Part F, Section 3.2.8).
pub const DEFAULT_MTU: u16 = 23;

/// Largest ATT_MTU accepted by this implementation.
pub const MAX_MTU: u16 = 517;

/// Maximum attribute value length ([Vol 3] Part F, Section 3.2.9).
pub const MAX_VAL_LEN: usize = 512;

/// Authentication signature length ([Vol 3] Part F, Section 3.3.1).
pub const SIGNATURE_LEN: usize = 12;

/// Attribute opcode ([Vol 3] Part F, Section 3.3.1 and
/// [Vol 3] Part F, Section 3.4.8).
#[derive(
    Clone, Copy, Debug, Eq, Hash, PartialEq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum Opcode {
    ErrorRsp = 0x01,
    ExchangeMtuReq = 0x02,
    ExchangeMtuRsp = 0x03,
    FindInformationReq = 0x04,
    FindInformationRsp = 0x05,
    FindByTypeValueReq = 0x06,
    FindByTypeValueRsp = 0x07,
    ReadByTypeReq = 0x08,
    ReadByTypeRsp = 0x09,
    ReadReq = 0x0A,
    ReadRsp = 0x0B,
    ReadBlobReq = 0x0C,
    ReadBlobRsp = 0x0D,
    ReadMultipleReq = 0x0E,
    ReadMultipleRsp = 0x0F,
    ReadByGroupTypeReq = 0x10,
    ReadByGroupTypeRsp = 0x11,
    WriteReq = 0x12,
    WriteRsp = 0x13,
    WriteCmd = 0x52,
    PrepareWriteReq = 0x16,
    PrepareWriteRsp = 0x17,
    ExecuteWriteReq = 0x18,
    ExecuteWriteRsp = 0x19,
    HandleValueNtf = 0x1B,
    HandleValueInd = 0x1D,
    HandleValueCfm = 0x1E,
    SignedWriteCmd = 0xD2,
}

impl Opcode {
    /// Returns whether the raw opcode has the Command Flag set.
    #[inline]
    #[must_use]
    pub const fn is_cmd(op: u8) -> bool {
        op & (1 << 6) != 0
    }

    /// Returns whether the Authentication Signature Flag is set.
    #[inline]
    #[must_use]
    pub const fn is_signed(self) -> bool {
        self as u8 & (1 << 7) != 0
    }

    /// Returns whether the opcode never occupies the server command slot and
    /// never receives an error response.
    #[inline]
    #[must_use]
    pub const fn is_unacked(self) -> bool {
        matches!(self, Self::WriteCmd | Self::SignedWriteCmd | Self::HandleValueCfm)
    }

    /// Returns a non-handle error response.
    #[inline]
    pub const fn err<R>(self, err: ErrorCode) -> RspResult<R> {
        Err(ErrorRsp::new(self as _, None, err))
    }

    /// Returns a handle-specific error response.
    #[inline]
    pub const fn hdl_err<R>(self, err: ErrorCode, hdl: Handle) -> RspResult<R> {
        Err(ErrorRsp::new(self as _, Some(hdl), err))
    }

    /// Returns the PDU type. Requests have even opcodes and their responses
    /// follow them.
    #[must_use]
    pub const fn typ(self) -> PduType {
        match self {
            Self::WriteCmd | Self::SignedWriteCmd => PduType::Cmd,
            Self::HandleValueNtf => PduType::Ntf,
            Self::HandleValueInd => PduType::Ind,
            Self::HandleValueCfm => PduType::Cfm,
            _ if self as u8 & 1 == 0 => PduType::Req,
            _ => PduType::Rsp,
        }
    }

    /// Returns the expected response/confirmation opcode or [`None`] if `self`
    /// is not a request or indication.
    #[inline]
    #[must_use]
    pub fn rsp(self) -> Option<Self> {
        use {num_enum::TryFromPrimitive, PduType::*};
        match self.typ() {
            Cmd | Rsp | Ntf | Cfm => None,
            Req | Ind => Self::try_from_primitive(self as u8 + 1).ok(),
        }
    }
}

/// Attribute PDU type ([Vol 3] Part F, Section 3.3).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PduType {
    /// Client to server, unanswered.
    Cmd,
    /// Client to server, answered by a response.
    Req,
    Rsp,
    /// Server to client, unanswered.
    Ntf,
    /// Server to client, answered by a confirmation.
    Ind,
    Cfm,
}

/// Error codes carried by `ATT_ERROR_RSP` ([Vol 3] Part F, Section 3.4.1.1),
/// including the common profile codes (\[CSS\] Part B, Section 1.2).
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    serde::Deserialize,
    serde::Serialize,
    thiserror::Error,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    /// Handle is zero, outside a range, or not in the database.
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    /// Malformed or oversized PDU.
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    RequestNotSupported = 0x06,
    /// Read or write offset past the end of the value.
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    /// The prepare write queue of the link is full.
    PrepareQueueFull = 0x09,
    /// Nothing matched within the requested range.
    AttributeNotFound = 0x0A,
    /// The attribute type cannot be read with `ATT_READ_BLOB_REQ`.
    AttributeNotLong = 0x0B,
    EncryptionKeySizeTooShort = 0x0C,
    InvalidAttributeValueLength = 0x0D,
    /// Catch-all for internal failures.
    UnlikelyError = 0x0E,
    InsufficientEncryption = 0x0F,
    UnsupportedGroupType = 0x10,
    InsufficientResources = 0x11,
    DatabaseOutOfSync = 0x12,
    ValueNotAllowed = 0x13,
    WriteRequestRejected = 0xFC,
    CccdImproperlyConfigured = 0xFD,
    ProcedureAlreadyInProgress = 0xFE,
    OutOfRange = 0xFF,
}

crate::impl_display_via_debug! { Opcode, ErrorCode }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_flags() {
        assert!(Opcode::is_cmd(Opcode::WriteCmd as u8));
        assert!(Opcode::is_cmd(Opcode::SignedWriteCmd as u8));
        assert!(!Opcode::is_cmd(Opcode::WriteReq as u8));
        assert!(Opcode::SignedWriteCmd.is_signed());
        assert!(!Opcode::WriteCmd.is_signed());
        assert_eq!(Opcode::ReadReq.rsp(), Some(Opcode::ReadRsp));
        assert_eq!(Opcode::HandleValueInd.rsp(), Some(Opcode::HandleValueCfm));
        assert_eq!(Opcode::WriteCmd.rsp(), None);
        assert_eq!(Opcode::ReadRsp.rsp(), None);
        assert_eq!(Opcode::ErrorRsp.typ(), PduType::Rsp);
        assert_eq!(Opcode::ExecuteWriteReq.typ(), PduType::Req);
        assert_eq!(Opcode::HandleValueCfm.typ(), PduType::Cfm);
        assert_eq!(Opcode::SignedWriteCmd.typ(), PduType::Cmd);
    }
}
