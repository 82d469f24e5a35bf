//! Link-level types shared with the host stack.

use std::fmt::{Debug, Display, Formatter};

/// Bluetooth device address ([Vol 6] Part B, Section 1.3).
#[allow(clippy::exhaustive_enums)]
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub enum Addr {
    Public(RawAddr),
    Random(RawAddr),
}

impl Addr {
    /// Constructs a peer address from type and raw components. Returns
    /// [`None`] if the address type is unknown.
    #[inline]
    #[must_use]
    pub const fn peer(typ: u8, raw: RawAddr) -> Option<Self> {
        // [Vol 4] Part E, Sections 7.7.65.1 and 7.7.65.10
        match typ {
            // Public Device Address or Public Identity Address
            0x00 | 0x02 => Some(Self::Public(raw)),
            // Random Device Address or Random (Static) Identity Address
            0x01 | 0x03 => Some(Self::Random(raw)),
            _ => None,
        }
    }

    /// Returns the raw 48-bit address.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> RawAddr {
        match self {
            Self::Public(addr) | Self::Random(addr) => addr,
        }
    }
}

impl Default for Addr {
    #[inline]
    fn default() -> Self {
        Self::Public(RawAddr::default())
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Public(ref raw) => write!(f, "{raw}"),
            Self::Random(ref raw) => write!(f, "{raw} (random)"),
        }
    }
}

/// 48-bit untyped device address stored in little-endian byte order.
#[derive(
    Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct RawAddr([u8; 6]);

impl RawAddr {
    /// Creates an address from little-endian bytes.
    #[inline(always)]
    #[must_use]
    pub const fn from_le_bytes(v: [u8; 6]) -> Self {
        Self(v)
    }

    /// Returns the address as little-endian bytes.
    #[inline(always)]
    #[must_use]
    pub const fn as_le_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl From<[u8; 6]> for RawAddr {
    #[inline]
    fn from(v: [u8; 6]) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for RawAddr {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Debug for RawAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // [Vol 3] Part C, Section 3.2.1.3
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[5], self.0[4], self.0[3], self.0[2], self.0[1], self.0[0]
        )
    }
}

impl Display for RawAddr {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Physical transport of a link.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize,
)]
pub enum Transport {
    /// Basic Rate/Enhanced Data Rate (classic).
    BrEdr,
    /// Low Energy.
    #[default]
    Le,
}

/// Logical link to a remote device. A peer may be connected over both
/// transports at the same time, each one with its own link.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Link {
    pub peer: Addr,
    pub transport: Transport,
}

impl Link {
    /// Creates a link identifier.
    #[inline(always)]
    #[must_use]
    pub const fn new(peer: Addr, transport: Transport) -> Self {
        Self { peer, transport }
    }

    /// Creates an LE link identifier.
    #[inline(always)]
    #[must_use]
    pub const fn le(peer: Addr) -> Self {
        Self::new(peer, Transport::Le)
    }
}

impl Display for Link {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{:?}]", self.peer, self.transport)
    }
}
