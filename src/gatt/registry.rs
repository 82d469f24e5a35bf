use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::att::{Handle, HandleRange};
use crate::Uuid;

use super::*;

/// Attribute handle range assigned to one service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ServiceRange {
    /// Owning application UUID.
    pub app: Uuid,
    /// Service UUID.
    pub svc: Uuid,
    pub range: HandleRange,
    pub primary: bool,
}

impl ServiceRange {
    /// Returns whether the range belongs to one of the singleton GATT or GAP
    /// services, which use fixed start handles.
    #[inline]
    #[must_use]
    pub fn is_system(&self) -> bool {
        self.svc == GATT_SERVICE || self.svc == GAP_SERVICE
    }
}

/// Registered service with its attribute database.
#[derive(Clone, Debug)]
pub(super) struct Entry {
    pub info: ServiceRange,
    pub db: Arc<Db>,
}

/// Handle range registry ordered by descending start handle. Ranges never
/// overlap.
#[derive(Debug, Default)]
pub(super) struct Registry(Vec<Entry>);

impl Registry {
    /// Returns the start handle for a new service of `count` handles.
    /// Singleton system services use their fixed start handle. All other
    /// services are placed above every existing range, but no lower than
    /// `floor`.
    pub fn alloc(&self, svc: Uuid, count: usize, cfg: &Config) -> Result<HandleRange> {
        let fixed = if svc == GATT_SERVICE {
            Some(cfg.gatt_start)
        } else if svc == GAP_SERVICE {
            Some(cfg.gap_start)
        } else {
            None
        };
        let n = count.saturating_sub(1);
        if let Some(start) = fixed {
            let r = (Handle::new(start).and_then(|s| Some(HandleRange::new(s, s.offset(n)?))))
                .ok_or(Error::Internal)?;
            if self.0.iter().any(|e| e.info.range.overlaps(r)) {
                warn!("Fixed range {r:?} for {svc} is already in use");
                return Err(Error::Internal);
            }
            return Ok(r);
        }
        // Entries are sorted by start handle and never overlap, so the first
        // one has the highest end handle.
        let floor = match self.0.first() {
            Some(e) => u16::from(e.info.range.end()).checked_add(1),
            None => Some(1),
        };
        let start = floor.map(|f| f.max(cfg.app_start)).and_then(Handle::new);
        (start.and_then(|s| Some(HandleRange::new(s, s.offset(n)?)))).ok_or(Error::OutOfHandles)
    }

    /// Inserts a new entry, maintaining descending start handle order.
    pub fn insert(&mut self, e: Entry) {
        let start = e.info.range.start();
        let i = (self.0.iter())
            .position(|o| o.info.range.start() < start)
            .unwrap_or(self.0.len());
        self.0.insert(i, e);
    }

    /// Returns the index of the entry owned by `app` that starts at `start`
    /// and has UUID `svc`. A [`None`] service UUID matches any service.
    #[must_use]
    pub fn position(&self, app: Uuid, svc: Option<Uuid>, start: Handle) -> Option<usize> {
        (self.0.iter()).position(|e| {
            e.info.app == app
                && e.info.range.start() == start
                && Uuid::matches(Some(e.info.svc), svc)
        })
    }

    /// Returns the entry starting at the specified handle.
    #[must_use]
    pub fn get_by_start(&self, start: Handle) -> Option<&Entry> {
        self.0.iter().find(|e| e.info.range.start() == start)
    }

    /// Returns the entry at index `i`.
    #[inline]
    #[must_use]
    pub fn get(&self, i: usize) -> Option<&Entry> {
        self.0.get(i)
    }

    /// Removes the entry at index `i`.
    #[inline]
    pub fn remove(&mut self, i: usize) -> Entry {
        self.0.remove(i)
    }

    /// Removes and returns all entries owned by `app`.
    pub fn free_all_for_app(&mut self, app: Uuid) -> Vec<Entry> {
        let mut out = Vec::new();
        self.0.retain(|e| {
            if e.info.app == app {
                out.push(e.clone());
                return false;
            }
            true
        });
        out
    }

    /// Returns an iterator over all entries in descending handle order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<Entry> {
        self.0.iter()
    }
}

impl Gatt {
    /// Adds a service described by `elems` and returns the handle assigned to
    /// each element. The first returned handle is the service start handle.
    /// Characteristic elements are assigned their value handle. A primary
    /// service is started immediately.
    pub fn add_service(&mut self, app: AppId, elems: &[Element]) -> Result<Vec<Handle>> {
        let app_uuid = self.app_uuid(app).ok_or(Error::NotFound)?;
        let Some(&Element::Service { uuid: svc, primary }) = elems.first() else {
            return Err(Error::IllegalParameter);
        };
        let count: usize = elems.iter().map(Element::handle_count).sum();
        let range = self.registry.alloc(svc, count, &self.cfg)?;

        // Build the database before inserting the range so that a failure
        // leaves the registry untouched.
        let mut db = Db::new(range.start(), svc, primary);
        let mut hdls = Vec::with_capacity(elems.len());
        hdls.push(range.start());
        for e in &elems[1..] {
            let hdl = match *e {
                Element::Service { .. } => return Err(Error::IllegalParameter),
                Element::Include { start } => {
                    let Some(inc) = self.registry.get_by_start(start) else {
                        warn!("Included service {start} does not exist");
                        return Err(Error::Internal);
                    };
                    db.include(inc.info.range, inc.info.svc)
                }
                Element::Characteristic { uuid, props, perms } => {
                    Self::check_attr_type(uuid)?;
                    db.characteristic(uuid, props, perms)
                }
                Element::Descriptor { uuid, perms } => {
                    Self::check_attr_type(uuid)?;
                    db.descriptor(uuid, perms)
                }
            };
            hdls.push(hdl.ok_or(Error::OutOfHandles)?);
        }
        debug_assert_eq!(db.range(), range);

        let info = ServiceRange {
            app: app_uuid,
            svc,
            range,
            primary,
        };
        info!("Added service {svc} at {range:?} for {app}");
        db.dump();
        let db = Arc::new(db);
        self.registry.insert(Entry {
            info,
            db: Arc::clone(&db),
        });
        if !info.is_system() {
            if let Some(s) = self.store.as_mut() {
                s.handle_range_changed(true, &info);
            }
        }
        if primary {
            self.start_entry(app, info, db);
        }
        if !info.is_system() {
            self.service_changed();
        }
        Ok(hdls)
    }

    /// Deletes the service owned by `app` that starts at `start`. A [`None`]
    /// service UUID matches any service. The service is stopped first if it
    /// was started.
    pub fn delete_service(&mut self, app: AppId, svc: Option<Uuid>, start: Handle) -> Result<()> {
        let app_uuid = self.app_uuid(app).ok_or(Error::NotFound)?;
        let i = (self.registry.position(app_uuid, svc, start)).ok_or(Error::NotFound)?;
        let Some(info) = self.registry.get(i).map(|e| e.info) else {
            return Err(Error::NotFound);
        };
        if self.dir.is_active(app_uuid, Some(info.svc), start) {
            self.stop_entry(start);
        }
        if !info.is_system() {
            if let Some(s) = self.store.as_mut() {
                s.handle_range_changed(false, &info);
            }
        }
        self.registry.remove(i);
        info!("Deleted service {} at {:?} for {app}", info.svc, info.range);
        if !info.is_system() {
            self.service_changed();
        }
        Ok(())
    }

    /// Returns all registered service ranges in descending handle order.
    pub fn services(&self) -> impl Iterator<Item = &ServiceRange> {
        self.registry.iter().map(|e| &e.info)
    }

    /// Removes every service range owned by `app`. Started services must
    /// already be stopped.
    pub(super) fn free_all_for_app(&mut self, app: Uuid) {
        for e in self.registry.free_all_for_app(app) {
            debug!("Freed service {} at {:?}", e.info.svc, e.info.range);
            if !e.info.is_system() {
                if let Some(s) = self.store.as_mut() {
                    s.handle_range_changed(false, &e.info);
                }
            }
        }
    }

    /// Rejects attribute types reserved for GATT profile declarations.
    fn check_attr_type(uuid: Uuid) -> Result<()> {
        if RESERVED_TYPES.iter().any(|&t| t == uuid) {
            warn!("Attribute type {uuid} is reserved");
            return Err(Error::Internal);
        }
        Ok(())
    }
}
