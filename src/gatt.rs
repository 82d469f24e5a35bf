//! Generic Attribute Profile ([Vol 3] Part G).
//!
//! [`Gatt`] is the protocol engine. It owns every registry and control block
//! and is driven from a single task: API calls, transport events, and timer
//! expirations all mutate it through `&mut self`, so there is no internal
//! locking. [`EventLoop`] provides such a task on top of tokio.

use std::fmt::{Debug, Display, Formatter};

pub use {
    app::*, client::*, config::*, consts::*, db::*, engine::*, event_loop::*, ext::*, ind::*,
    registry::*, server::*,
};

use crate::att::ErrorCode;

mod app;
mod bg;
mod client;
mod config;
mod consts;
mod db;
mod directory;
mod engine;
mod event_loop;
mod ext;
mod ind;
mod registry;
mod server;
mod slots;
mod tcb;
mod timer;

#[cfg(test)]
mod tests;

/// Error type returned synchronously by engine calls. A call that returns an
/// error leaves the engine state unchanged.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed handle, UUID, length, or identifier.
    #[error("illegal parameter")]
    IllegalParameter,
    /// An operation is already outstanding on the connection.
    #[error("operation already in progress")]
    Busy,
    /// A fixed-capacity table or queue is full.
    #[error("no resources")]
    NoResources,
    /// Unknown application, service, link, or transaction.
    #[error("not found")]
    NotFound,
    /// Conflicting attribute type or missing included service.
    #[error("internal error")]
    Internal,
    /// The 16-bit attribute handle space cannot fit the service.
    #[error("out of attribute handles")]
    OutOfHandles,
    /// The bearer failed to transmit.
    #[error("link failure")]
    Link,
}

/// Common GATT result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of an asynchronous operation reported through [`Callbacks`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Status {
    Success,
    /// Peer or transport failure, including timeouts and link loss.
    Error,
    /// The peer replied with `ATT_ERROR_RSP`.
    Att(ErrorCode),
}

impl Status {
    /// Returns whether the status indicates success.
    #[inline(always)]
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Success => f.write_str("success"),
            Self::Error => f.write_str("error"),
            Self::Att(e) => write!(f, "ATT {e}"),
        }
    }
}

/// Application interface identifier. Registered applications are assigned
/// dense identifiers starting at 1. Identifier 0 belongs to the built-in GATT
/// service and is never registered or deregistered.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct AppId(u8);

impl AppId {
    /// Built-in service owner.
    pub const BUILTIN: Self = Self(0);

    /// Wraps a raw interface identifier.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u8) -> Self {
        Self(v)
    }

    /// Returns the raw interface identifier.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Returns the identifier for registry slot `i`.
    #[inline]
    #[must_use]
    pub(crate) const fn from_index(i: usize) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self(i as u8 + 1)
    }

    /// Returns the registry slot index or [`None`] for the built-in owner.
    #[inline]
    #[must_use]
    pub(crate) const fn index(self) -> Option<usize> {
        match self.0 {
            0 => None,
            v => Some(v as usize - 1),
        }
    }

    /// Returns the link holder bit of the application.
    #[inline(always)]
    #[must_use]
    pub(crate) const fn bit(self) -> u64 {
        1 << self.0
    }
}

impl Display for AppId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "App({})", self.0)
    }
}

/// Connection identifier combining a link index with an application
/// interface identifier. Every per-connection API call recovers both the
/// transport control block and the application from this one value.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct ConnId(u16);

impl ConnId {
    /// Creates a connection identifier.
    #[inline]
    #[must_use]
    pub const fn new(tcb: u8, app: AppId) -> Self {
        Self((tcb as u16) << 8 | app.0 as u16)
    }

    /// Returns the transport control block index.
    #[inline(always)]
    #[must_use]
    pub const fn tcb_idx(self) -> u8 {
        (self.0 >> 8) as u8
    }

    /// Returns the application interface identifier.
    #[inline(always)]
    #[must_use]
    pub const fn app(self) -> AppId {
        #[allow(clippy::cast_possible_truncation)]
        AppId(self.0 as u8)
    }

    /// Returns the raw identifier.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u16 {
        self.0
    }
}

impl Debug for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnId({:#06X})", self.0)
    }
}

impl Display for ConnId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Server transaction identifier used to match an application response to a
/// peer request.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct TransId(pub(crate) u32);

impl TransId {
    /// Returns the raw identifier.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// HCI disconnection reason ([Vol 1] Part F, Section 1.3).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct Reason(pub u8);

impl Reason {
    /// Link established.
    pub const NONE: Self = Self(0x00);
    /// Connection timeout.
    pub const TIMEOUT: Self = Self(0x08);
    /// Remote user terminated connection.
    pub const REMOTE_USER: Self = Self(0x13);
    /// Connection terminated by local host.
    pub const LOCAL_HOST: Self = Self(0x16);
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn conn_id() {
        let c = ConnId::new(3, AppId::new(7));
        assert_eq!(c.raw(), 0x0307);
        assert_eq!(c.tcb_idx(), 3);
        assert_eq!(c.app(), AppId::new(7));
        assert_eq!(AppId::from_index(0), AppId::new(1));
        assert_eq!(AppId::new(1).index(), Some(0));
        assert_eq!(AppId::BUILTIN.index(), None);
    }
}
