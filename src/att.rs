//! Attribute Protocol ([Vol 3] Part F).
//!
//! The engine never encodes or decodes PDUs. This module defines the handle
//! types and the already-parsed PDU fields exchanged with the external codec.

pub use {consts::*, handle::*, pdu::*};

mod consts;
mod handle;
mod pdu;
