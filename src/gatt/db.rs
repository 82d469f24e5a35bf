use structbuf::{Pack, Packer, StructBuf, Unpack};
use tracing::info;

use crate::att::{Handle, HandleRange};
use crate::uuid::Uuid16;
use crate::Uuid;

use super::*;

/// Service definition element passed to [`Gatt::add_service`]. The first
/// element must be a [`Element::Service`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Element {
    /// Primary or secondary service declaration.
    Service { uuid: Uuid, primary: bool },
    /// Reference to another service identified by its start handle.
    Include { start: Handle },
    /// Characteristic declaration and value.
    Characteristic { uuid: Uuid, props: Prop, perms: Perms },
    /// Characteristic descriptor.
    Descriptor { uuid: Uuid, perms: Perms },
}

impl Element {
    /// Creates a primary service element.
    #[inline]
    #[must_use]
    pub fn primary(uuid: impl Into<Uuid>) -> Self {
        Self::Service {
            uuid: uuid.into(),
            primary: true,
        }
    }

    /// Creates a secondary service element.
    #[inline]
    #[must_use]
    pub fn secondary(uuid: impl Into<Uuid>) -> Self {
        Self::Service {
            uuid: uuid.into(),
            primary: false,
        }
    }

    /// Creates a characteristic element.
    #[inline]
    #[must_use]
    pub fn characteristic(uuid: impl Into<Uuid>, props: Prop, perms: Perms) -> Self {
        Self::Characteristic {
            uuid: uuid.into(),
            props,
            perms,
        }
    }

    /// Creates a descriptor element.
    #[inline]
    #[must_use]
    pub fn descriptor(uuid: impl Into<Uuid>, perms: Perms) -> Self {
        Self::Descriptor {
            uuid: uuid.into(),
            perms,
        }
    }

    /// Returns the number of handles occupied by the element.
    #[inline]
    #[must_use]
    pub const fn handle_count(&self) -> usize {
        match *self {
            Self::Characteristic { .. } => 2,
            Self::Service { .. } | Self::Include { .. } | Self::Descriptor { .. } => 1,
        }
    }
}

/// Attribute record ([Vol 3] Part F, Section 3.2).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attr {
    hdl: Handle,
    typ: Uuid,
    perms: Perms,
    /// Declaration value. Characteristic values and descriptors are owned by
    /// the application.
    val: Option<Vec<u8>>,
}

impl Attr {
    /// Returns the attribute handle.
    #[inline(always)]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.hdl
    }

    /// Returns the attribute type.
    #[inline(always)]
    #[must_use]
    pub const fn typ(&self) -> Uuid {
        self.typ
    }

    /// Returns the attribute permissions.
    #[inline(always)]
    #[must_use]
    pub const fn perms(&self) -> Perms {
        self.perms
    }

    /// Returns the value of a GATT profile declaration or [`None`] for
    /// application-owned attributes.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        self.val.as_deref()
    }

    /// Returns whether the attribute is a GATT profile declaration.
    #[inline]
    #[must_use]
    pub const fn is_decl(&self) -> bool {
        self.val.is_some()
    }
}

/// Attribute database of one service. Attributes are stored in handle order
/// starting with the service declaration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Db {
    attrs: Vec<Attr>,
}

impl Db {
    /// Creates a database containing the service declaration at `start`
    /// ([Vol 3] Part G, Section 3.1).
    #[must_use]
    pub(super) fn new(start: Handle, uuid: Uuid, primary: bool) -> Self {
        let typ = if primary {
            PRIMARY_SERVICE
        } else {
            SECONDARY_SERVICE
        };
        let mut db = Self {
            attrs: Vec::with_capacity(8),
        };
        db.push_decl(start, typ, |v| {
            v.put(uuid.to_short_bytes());
        });
        db
    }

    /// Adds an include declaration for the service occupying `inc`
    /// ([Vol 3] Part G, Section 3.2). The service UUID is part of the value
    /// only if it has a 16-bit form.
    pub(super) fn include(&mut self, inc: HandleRange, uuid: Uuid) -> Option<Handle> {
        let hdl = self.next_handle()?;
        let uuid16 = uuid.as_uuid16();
        Some(self.push_decl(hdl, INCLUDE, |v| {
            v.u16(inc.start()).u16(inc.end());
            if let Some(u) = uuid16 {
                v.u16(u);
            }
        }))
    }

    /// Adds characteristic and characteristic value declarations
    /// ([Vol 3] Part G, Section 3.3). Returns the value handle.
    pub(super) fn characteristic(&mut self, uuid: Uuid, props: Prop, perms: Perms) -> Option<Handle> {
        let hdl = self.next_handle()?;
        let vhdl = hdl.next()?;
        self.push_decl(hdl, CHARACTERISTIC, |v| {
            v.u8(props.bits()).u16(vhdl).put(uuid.to_short_bytes());
        });
        Some(self.push(vhdl, uuid, perms, None))
    }

    /// Adds a characteristic descriptor ([Vol 3] Part G, Section 3.3.3).
    pub(super) fn descriptor(&mut self, uuid: Uuid, perms: Perms) -> Option<Handle> {
        let hdl = self.next_handle()?;
        Some(self.push(hdl, uuid, perms, None))
    }

    /// Returns the handle range occupied by the service.
    #[inline]
    pub fn range(&self) -> HandleRange {
        let (first, last) = (self.attrs.first(), self.attrs.last());
        match (first, last) {
            (Some(f), Some(l)) => HandleRange::new(f.hdl, l.hdl),
            _ => HandleRange::ALL,
        }
    }

    /// Returns the attribute at the specified handle.
    #[must_use]
    pub fn get(&self, hdl: Handle) -> Option<&Attr> {
        (self.attrs.binary_search_by_key(&hdl, |at| at.hdl).ok()).map(|i| &self.attrs[i])
    }

    /// Returns an iterator over all attributes in handle order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<Attr> {
        self.attrs.iter()
    }

    /// Returns the number of attributes.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Returns whether the database is empty. Always `false` for a database
    /// created by [`Db::new`].
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Logs database contents.
    pub fn dump(&self) {
        macro_rules! log {
            ($at:ident, $fmt:expr$(, $($args:tt)*)?) => {
                info!("[{:#06X}] {}", u16::from($at.hdl), format_args!($fmt$(, $($args)*)?))
            };
        }
        let mut vhdl = None;
        for at in &self.attrs {
            let Some(ref v) = at.val else {
                if Some(at.hdl) == vhdl {
                    log!(at, "    |__ [Value <{}>]", at.typ);
                } else {
                    log!(at, "    |__ Descriptor <{}>", at.typ);
                }
                continue;
            };
            let mut p = v.unpack();
            match at.typ.as_uuid16() {
                Some(t) if t == PRIMARY_SERVICE || t == SECONDARY_SERVICE => {
                    let sec = if t == SECONDARY_SERVICE {
                        "(Secondary) "
                    } else {
                        ""
                    };
                    match Uuid::try_from(v.as_slice()) {
                        Ok(u) => log!(at, "{sec}Service <{u}>"),
                        Err(_) => log!(at, "{sec}Service <invalid>"),
                    }
                }
                Some(t) if t == INCLUDE => {
                    log!(at, "|__ [Include {:#06X}..={:#06X}]", p.u16(), p.u16());
                }
                Some(t) if t == CHARACTERISTIC => {
                    let props = Prop::from_bits_truncate(p.u8());
                    vhdl = Handle::new(p.u16());
                    log!(at, "|__ Characteristic {props:?}");
                }
                _ => log!(at, "Unexpected <{}>", at.typ),
            }
        }
    }

    /// Appends a read-only GATT profile declaration with value set by `val`.
    fn push_decl(&mut self, hdl: Handle, typ: Uuid16, val: impl FnOnce(&mut Packer)) -> Handle {
        // Maximum length of the Characteristic declaration value, which is the
        // longest value stored in the database ([Vol 3] Part G, Section 3.3.1).
        let mut b = StructBuf::new(1 + 2 + 16);
        val(&mut b.append());
        self.push(hdl, typ.as_uuid(), Perms::READ, Some(b.to_vec()))
    }

    /// Appends a new attribute.
    fn push(&mut self, hdl: Handle, typ: Uuid, perms: Perms, val: Option<Vec<u8>>) -> Handle {
        debug_assert!(self.attrs.last().map_or(true, |at| at.hdl < hdl));
        self.attrs.push(Attr {
            hdl,
            typ,
            perms,
            val,
        });
        hdl
    }

    /// Returns the next unused handle.
    #[inline]
    fn next_handle(&self) -> Option<Handle> {
        self.attrs.last().and_then(|at| at.hdl.next())
    }
}

impl<'a> IntoIterator for &'a Db {
    type Item = &'a Attr;
    type IntoIter = std::slice::Iter<'a, Attr>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.attrs.iter()
    }
}

#[cfg(test)]
mod tests {
    use crate::uuid::uuid16;

    use super::*;

    #[test]
    fn declarations() {
        let h = |v| Handle::new(v).unwrap();
        let mut db = Db::new(h(0x0040), uuid16(0x180F).as_uuid(), true);
        let inc = db
            .include(HandleRange::new(h(0x0010), h(0x0012)), uuid16(0x1801).as_uuid())
            .unwrap();
        let vhdl = db
            .characteristic(uuid16(0x2A19).as_uuid(), Prop::READ | Prop::NOTIFY, Perms::READ)
            .unwrap();
        let cccd = (db.descriptor(CLIENT_CHAR_CONFIG.as_uuid(), Perms::READ | Perms::WRITE))
            .unwrap();
        assert_eq!((inc, vhdl, cccd), (h(0x0041), h(0x0043), h(0x0044)));
        assert_eq!(db.range(), HandleRange::new(h(0x0040), h(0x0044)));
        assert_eq!(db.len(), 5);

        assert_eq!(db.get(h(0x0040)).unwrap().value(), Some(&[0x0F, 0x18][..]));
        assert_eq!(
            db.get(inc).unwrap().value(),
            Some(&[0x10, 0x00, 0x12, 0x00, 0x01, 0x18][..])
        );
        assert_eq!(
            db.get(h(0x0042)).unwrap().value(),
            Some(&[0x12, 0x43, 0x00, 0x19, 0x2A][..])
        );
        let v = db.get(vhdl).unwrap();
        assert!(!v.is_decl());
        assert_eq!(v.typ(), uuid16(0x2A19));
        assert!(db.get(h(0x0045)).is_none());
        db.dump();
    }
}
