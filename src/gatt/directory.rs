use std::sync::Arc;

use tracing::{debug, info};

use crate::att::Handle;
use crate::Uuid;

use super::registry::Entry;
use super::*;

/// Started service visible to peers.
#[derive(Clone, Debug)]
pub(super) struct Started {
    pub app: AppId,
    pub info: ServiceRange,
    /// SDP record handle of a primary service.
    pub sdp: Option<u32>,
    pub db: Arc<Db>,
}

/// Started services ordered by ascending start handle.
#[derive(Debug, Default)]
pub(super) struct Directory {
    list: Vec<Started>,
    /// Start handle of the last primary service.
    last_primary: Option<Handle>,
}

impl Directory {
    /// Inserts a started service, maintaining ascending start handle order.
    pub fn insert(&mut self, s: Started) {
        let start = s.info.range.start();
        let i = (self.list.iter())
            .position(|o| o.info.range.start() > start)
            .unwrap_or(self.list.len());
        self.list.insert(i, s);
        self.update_last_primary();
    }

    /// Removes the service whose range contains `hdl`.
    pub fn remove(&mut self, hdl: Handle) -> Option<Started> {
        let i = (self.list.iter()).position(|s| s.info.range.contains_handle(hdl))?;
        let s = self.list.remove(i);
        self.update_last_primary();
        Some(s)
    }

    /// Returns the service whose range contains `hdl`. Ranges are disjoint,
    /// so the first match is the only one.
    #[must_use]
    pub fn find_owner(&self, hdl: Handle) -> Option<&Started> {
        self.list.iter().find(|s| s.info.range.contains_handle(hdl))
    }

    /// Returns whether the specified service is started. A [`None`] service
    /// UUID matches any service.
    #[must_use]
    pub fn is_active(&self, app: Uuid, svc: Option<Uuid>, start: Handle) -> bool {
        self.list.iter().any(|s| {
            s.info.app == app
                && s.info.range.start() == start
                && Uuid::matches(Some(s.info.svc), svc)
        })
    }

    /// Returns the start handle of the last primary service.
    #[inline(always)]
    #[must_use]
    pub const fn last_primary(&self) -> Option<Handle> {
        self.last_primary
    }

    /// Returns the start handles of all services started by `app`.
    #[must_use]
    pub fn owned_by(&self, app: AppId) -> Vec<Handle> {
        (self.list.iter().filter(|s| s.app == app))
            .map(|s| s.info.range.start())
            .collect()
    }

    /// Returns an iterator over started services in handle order.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<Started> {
        self.list.iter()
    }

    fn update_last_primary(&mut self) {
        self.last_primary = (self.list.iter().filter(|s| s.info.primary))
            .map(|s| s.info.range.start())
            .max();
    }
}

impl Gatt {
    /// Starts a registered service owned by `app`, making it visible to
    /// peers. Returns [`Error::Busy`] if the service is already started.
    pub fn start_service(&mut self, app: AppId, start: Handle) -> Result<()> {
        let app_uuid = self.app_uuid(app).ok_or(Error::NotFound)?;
        let e = (self.registry.get_by_start(start))
            .filter(|e| e.info.app == app_uuid)
            .cloned()
            .ok_or(Error::NotFound)?;
        if self.dir.find_owner(start).is_some() {
            return Err(Error::Busy);
        }
        let Entry { info, db } = e;
        self.start_entry(app, info, db);
        Ok(())
    }

    /// Stops a started service owned by `app`.
    pub fn stop_service(&mut self, app: AppId, start: Handle) -> Result<()> {
        let app_uuid = self.app_uuid(app).ok_or(Error::NotFound)?;
        if !self.dir.is_active(app_uuid, None, start) {
            return Err(Error::NotFound);
        }
        self.stop_entry(start);
        Ok(())
    }

    /// Returns an iterator over the attributes of all started services in
    /// handle order. The codec uses this to answer discovery-type requests.
    pub fn attributes(&self) -> impl Iterator<Item = &Attr> {
        self.dir.iter().flat_map(|s| s.db.iter())
    }

    /// Adds a registered service to the directory and publishes its SDP
    /// record if it is primary.
    pub(super) fn start_entry(&mut self, app: AppId, info: ServiceRange, db: Arc<Db>) {
        let sdp = if info.primary {
            (self.sdp.as_mut()).and_then(|s| s.create_record(info.svc, info.range))
        } else {
            None
        };
        info!("Started service {} at {:?}", info.svc, info.range);
        self.dir.insert(Started { app, info, sdp, db });
    }

    /// Removes the started service containing `hdl` and deletes its SDP
    /// record.
    pub(super) fn stop_entry(&mut self, hdl: Handle) {
        let Some(s) = self.dir.remove(hdl) else { return };
        if let (Some(rec), Some(sdp)) = (s.sdp, self.sdp.as_mut()) {
            sdp.delete_record(rec);
        }
        info!("Stopped service {} at {:?}", s.info.svc, s.info.range);
        debug!("Last primary service: {:?}", self.dir.last_primary());
    }
}
