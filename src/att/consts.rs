use std::fmt::Debug;

use crate::util::impl_display_via_debug;

/// Maximum attribute value length ([Vol 3] Part F, Section 3.2.9).
pub const MAX_VAL_LEN: usize = 512;

/// Minimum `ATT_MTU` for an LE bearer ([Vol 3] Part F, Section 3.2.8).
pub const MIN_MTU: u16 = 23;

/// Maximum `ATT_MTU` supported by the engine.
pub const MAX_MTU: u16 = 517;

/// Attribute opcode ([Vol 3] Part F, Section 3.4.8). The engine uses opcodes
/// to correlate responses with requests and to report failed requests.
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
    PrepareWriteReq = 0x16,
    PrepareWriteRsp = 0x17,
    ExecuteWriteReq = 0x18,
    ExecuteWriteRsp = 0x19,
    HandleValueNtf = 0x1B,
    HandleValueInd = 0x1D,
    HandleValueCfm = 0x1E,
    WriteCmd = 0x52,
}

impl Opcode {
    /// Returns whether the opcode has the Command Flag set. Commands are
    /// never answered.
    #[inline]
    #[must_use]
    pub const fn is_cmd(self) -> bool {
        self as u8 & (1 << 6) != 0
    }

    /// Returns the opcode that answers `self` or [`None`] if the peer does
    /// not reply to it. Requests are answered by the next opcode and
    /// indications by a confirmation.
    #[must_use]
    pub const fn rsp(self) -> Option<Self> {
        use Opcode::*;
        Some(match self {
            ExchangeMtuReq => ExchangeMtuRsp,
            FindInformationReq => FindInformationRsp,
            FindByTypeValueReq => FindByTypeValueRsp,
            ReadByTypeReq => ReadByTypeRsp,
            ReadReq => ReadRsp,
            ReadBlobReq => ReadBlobRsp,
            ReadMultipleReq => ReadMultipleRsp,
            ReadByGroupTypeReq => ReadByGroupTypeRsp,
            WriteReq => WriteRsp,
            PrepareWriteReq => PrepareWriteRsp,
            ExecuteWriteReq => ExecuteWriteRsp,
            HandleValueInd => HandleValueCfm,
            _ => return None,
        })
    }
}

/// ATT and Common Profile and Service error codes
/// ([Vol 3] Part F, Section 3.4.1.1 and \[CSS\] Part B, Section 1.2).
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
)]
#[non_exhaustive]
#[repr(u8)]
pub enum ErrorCode {
    /// Handle outside of any started service.
    InvalidHandle = 0x01,
    ReadNotPermitted = 0x02,
    WriteNotPermitted = 0x03,
    InvalidPdu = 0x04,
    InsufficientAuthentication = 0x05,
    /// Request opcode not supported by the server or by the bearer type.
    RequestNotSupported = 0x06,
    /// Read or write offset past the end of the value.
    InvalidOffset = 0x07,
    InsufficientAuthorization = 0x08,
    PrepareQueueFull = 0x09,
    /// Ends every discovery procedure.
    AttributeNotFound = 0x0A,
    AttributeNotLong = 0x0B,
    EncryptionKeySizeTooShort = 0x0C,
    InvalidAttributeValueLength = 0x0D,
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

impl std::error::Error for ErrorCode {}

impl_display_via_debug! { Opcode, ErrorCode }
