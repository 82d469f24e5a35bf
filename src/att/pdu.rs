use crate::Uuid;

use super::*;

/// Client request sent to a peer server. The codec turns this into an ATT
/// PDU ([Vol 3] Part F, Section 3.4).
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Req {
    ExchangeMtu { mtu: u16 },
    FindInformation { range: HandleRange },
    FindByTypeValue { range: HandleRange, typ: Uuid, value: Vec<u8> },
    ReadByType { range: HandleRange, typ: Uuid },
    ReadByGroupType { range: HandleRange, typ: Uuid },
    Read { hdl: Handle },
    ReadBlob { hdl: Handle, off: u16 },
    ReadMultiple { hdls: Vec<Handle> },
    Write { hdl: Handle, val: Vec<u8> },
    WriteCmd { hdl: Handle, val: Vec<u8> },
    PrepareWrite { hdl: Handle, off: u16, val: Vec<u8> },
    ExecuteWrite { execute: bool },
}

impl Req {
    /// Returns the request opcode.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match *self {
            Self::ExchangeMtu { .. } => Opcode::ExchangeMtuReq,
            Self::FindInformation { .. } => Opcode::FindInformationReq,
            Self::FindByTypeValue { .. } => Opcode::FindByTypeValueReq,
            Self::ReadByType { .. } => Opcode::ReadByTypeReq,
            Self::ReadByGroupType { .. } => Opcode::ReadByGroupTypeReq,
            Self::Read { .. } => Opcode::ReadReq,
            Self::ReadBlob { .. } => Opcode::ReadBlobReq,
            Self::ReadMultiple { .. } => Opcode::ReadMultipleReq,
            Self::Write { .. } => Opcode::WriteReq,
            Self::WriteCmd { .. } => Opcode::WriteCmd,
            Self::PrepareWrite { .. } => Opcode::PrepareWriteReq,
            Self::ExecuteWrite { .. } => Opcode::ExecuteWriteReq,
        }
    }
}

/// Parsed response received from a peer server.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Rsp {
    /// `ATT_ERROR_RSP` ([Vol 3] Part F, Section 3.4.1.1).
    Error {
        req: Opcode,
        hdl: Option<Handle>,
        err: ErrorCode,
    },
    ExchangeMtu { mtu: u16 },
    /// Handle and attribute type pairs.
    FindInformation(Vec<(Handle, Uuid)>),
    /// Found attribute and group end handles.
    FindByTypeValue(Vec<HandleRange>),
    /// Handle and value pairs.
    ReadByType(Vec<(Handle, Vec<u8>)>),
    Read(Vec<u8>),
    ReadBlob(Vec<u8>),
    ReadMultiple(Vec<u8>),
    /// Group handle range and value pairs.
    ReadByGroupType(Vec<(HandleRange, Vec<u8>)>),
    Write,
    PrepareWrite { hdl: Handle, off: u16, val: Vec<u8> },
    ExecuteWrite,
}

impl Rsp {
    /// Returns the response opcode.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match *self {
            Self::Error { .. } => Opcode::ErrorRsp,
            Self::ExchangeMtu { .. } => Opcode::ExchangeMtuRsp,
            Self::FindInformation(_) => Opcode::FindInformationRsp,
            Self::FindByTypeValue(_) => Opcode::FindByTypeValueRsp,
            Self::ReadByType(_) => Opcode::ReadByTypeRsp,
            Self::Read(_) => Opcode::ReadRsp,
            Self::ReadBlob(_) => Opcode::ReadBlobRsp,
            Self::ReadMultiple(_) => Opcode::ReadMultipleRsp,
            Self::ReadByGroupType(_) => Opcode::ReadByGroupTypeRsp,
            Self::Write => Opcode::WriteRsp,
            Self::PrepareWrite { .. } => Opcode::PrepareWriteRsp,
            Self::ExecuteWrite => Opcode::ExecuteWriteRsp,
        }
    }

    /// Returns whether this PDU is a valid response to request `req`
    /// ([Vol 3] Part F, Section 3.4.9).
    #[must_use]
    pub fn answers(&self, req: Opcode) -> bool {
        match *self {
            Self::Error { req: r, .. } => r == req,
            _ => req.rsp() == Some(self.opcode()),
        }
    }
}

/// Request or command received from a peer client. Discovery-type requests
/// are answered by the codec from [`crate::gatt::Gatt::attributes`].
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum PeerReq {
    ExchangeMtu { mtu: u16 },
    Read { hdl: Handle },
    ReadBlob { hdl: Handle, off: u16 },
    Write { hdl: Handle, val: Vec<u8> },
    WriteCmd { hdl: Handle, val: Vec<u8> },
    PrepareWrite { hdl: Handle, off: u16, val: Vec<u8> },
    ExecuteWrite { execute: bool },
}

impl PeerReq {
    /// Returns the request opcode.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match *self {
            Self::ExchangeMtu { .. } => Opcode::ExchangeMtuReq,
            Self::Read { .. } => Opcode::ReadReq,
            Self::ReadBlob { .. } => Opcode::ReadBlobReq,
            Self::Write { .. } => Opcode::WriteReq,
            Self::WriteCmd { .. } => Opcode::WriteCmd,
            Self::PrepareWrite { .. } => Opcode::PrepareWriteReq,
            Self::ExecuteWrite { .. } => Opcode::ExecuteWriteReq,
        }
    }

    /// Returns the target attribute handle, if any.
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        match *self {
            Self::Read { hdl }
            | Self::ReadBlob { hdl, .. }
            | Self::Write { hdl, .. }
            | Self::WriteCmd { hdl, .. }
            | Self::PrepareWrite { hdl, .. } => Some(hdl),
            Self::ExchangeMtu { .. } | Self::ExecuteWrite { .. } => None,
        }
    }
}

/// Server response sent to a peer client.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SrvRsp {
    Error {
        req: Opcode,
        hdl: Option<Handle>,
        err: ErrorCode,
    },
    ExchangeMtu { mtu: u16 },
    Read(Vec<u8>),
    ReadBlob(Vec<u8>),
    Write,
    PrepareWrite { hdl: Handle, off: u16, val: Vec<u8> },
    ExecuteWrite,
}

impl SrvRsp {
    /// Returns an error response for the specified request.
    #[inline]
    pub const fn error(req: Opcode, hdl: Option<Handle>, err: ErrorCode) -> Self {
        Self::Error { req, hdl, err }
    }
}
