use bitflags::bitflags;

use crate::uuid::{uuid16, Uuid16};

/// Generic Access service.
pub const GAP_SERVICE: Uuid16 = uuid16(0x1800);
/// Generic Attribute service.
pub const GATT_SERVICE: Uuid16 = uuid16(0x1801);

/// Primary service declaration ([Vol 3] Part G, Section 3.1).
pub const PRIMARY_SERVICE: Uuid16 = uuid16(0x2800);
/// Secondary service declaration ([Vol 3] Part G, Section 3.1).
pub const SECONDARY_SERVICE: Uuid16 = uuid16(0x2801);
/// Include declaration ([Vol 3] Part G, Section 3.2).
pub const INCLUDE: Uuid16 = uuid16(0x2802);
/// Characteristic declaration ([Vol 3] Part G, Section 3.3.1).
pub const CHARACTERISTIC: Uuid16 = uuid16(0x2803);

/// Client Characteristic Configuration descriptor
/// ([Vol 3] Part G, Section 3.3.3.3).
pub const CLIENT_CHAR_CONFIG: Uuid16 = uuid16(0x2902);

/// Service Changed characteristic ([Vol 3] Part G, Section 7.1).
pub const SERVICE_CHANGED: Uuid16 = uuid16(0x2A05);

/// Attribute types that only the engine may create.
pub(crate) const RESERVED_TYPES: [Uuid16; 4] =
    [PRIMARY_SERVICE, SECONDARY_SERVICE, INCLUDE, CHARACTERISTIC];

bitflags! {
    /// Characteristic properties ([Vol 3] Part G, Section 3.3.1.1).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Prop: u8 {
        /// Permits broadcasts of the Characteristic Value using Server
        /// Characteristic Configuration Descriptor.
        const BROADCAST = 0x01;
        /// Permits reads of the Characteristic Value.
        const READ = 0x02;
        /// Permit writes of the Characteristic Value without response.
        const WRITE_CMD = 0x04;
        /// Permits writes of the Characteristic Value with response.
        const WRITE = 0x08;
        /// Permits notifications of a Characteristic Value without
        /// acknowledgment.
        const NOTIFY = 0x10;
        /// Permits indications of a Characteristic Value with acknowledgment.
        const INDICATE = 0x20;
        /// Permits signed writes to the Characteristic Value.
        const SIGNED_WRITE_CMD = 0x40;
        /// Additional characteristic properties are defined in the
        /// Characteristic Extended Properties Descriptor.
        const EXT_PROPS = 0x80;
    }
}

bitflags! {
    /// Attribute access permissions.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Perms: u16 {
        const READ = 1 << 0;
        const READ_ENCRYPTED = 1 << 1;
        const READ_ENCRYPTED_MITM = 1 << 2;
        const WRITE = 1 << 4;
        const WRITE_ENCRYPTED = 1 << 5;
        const WRITE_ENCRYPTED_MITM = 1 << 6;
        const WRITE_SIGNED = 1 << 7;
        const WRITE_SIGNED_MITM = 1 << 8;

        const ANY_READ = Self::READ.bits()
            | Self::READ_ENCRYPTED.bits()
            | Self::READ_ENCRYPTED_MITM.bits();
        const ANY_WRITE = Self::WRITE.bits()
            | Self::WRITE_ENCRYPTED.bits()
            | Self::WRITE_ENCRYPTED_MITM.bits()
            | Self::WRITE_SIGNED.bits()
            | Self::WRITE_SIGNED_MITM.bits();
    }
}

impl Perms {
    /// Returns whether any read permission is granted.
    #[inline]
    #[must_use]
    pub const fn readable(self) -> bool {
        self.intersects(Self::ANY_READ)
    }

    /// Returns whether any write permission is granted.
    #[inline]
    #[must_use]
    pub const fn writable(self) -> bool {
        self.intersects(Self::ANY_WRITE)
    }
}

bitflags! {
    /// Client Characteristic Configuration descriptor value
    /// ([Vol 3] Part G, Section 3.3.3.3).
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct Cccd: u16 {
        /// The Characteristic Value shall be notified.
        const NOTIFY = 1 << 0;
        /// The Characteristic Value shall be indicated.
        const INDICATE = 1 << 1;
    }
}
