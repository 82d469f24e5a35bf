use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::att::{ErrorCode, Handle, PeerReq};
use crate::le::Link;
use crate::Uuid;

use super::*;

/// Application callback interface. Every method has an empty default
/// implementation. Callbacks are invoked from the engine task and must not
/// block.
#[allow(unused_variables)]
pub trait Callbacks: Send + Sync {
    /// Called when a link is established or lost. Every registered
    /// application receives exactly one call per transition.
    fn on_connection(&self, conn: ConnId, link: Link, connected: bool, reason: Reason) {}

    /// Called once when a read, write, execute-write, or MTU exchange
    /// completes.
    fn on_op_complete(&self, conn: ConnId, op: OpKind, status: Status, data: Option<OpData>) {}

    /// Called for each item found during discovery.
    fn on_discovery_result(&self, conn: ConnId, typ: DiscType, r: &DiscResult) {}

    /// Called once when a discovery procedure completes.
    fn on_discovery_complete(&self, conn: ConnId, typ: DiscType, status: Status) {}

    /// Called for a peer request addressed to an attribute of a service
    /// owned by the application. Requests other than write commands must be
    /// answered with [`Gatt::send_response`].
    fn on_request(&self, conn: ConnId, trans: TransId, req: &PeerReq) {}

    /// Called when the peer sends a notification or indication. Indications
    /// must be acknowledged with [`Gatt::confirm`].
    fn on_value(&self, conn: ConnId, hdl: Handle, val: &[u8], ind: bool) {}

    /// Called when the peer confirms an indication or the confirmation times
    /// out.
    fn on_indication_confirmed(&self, conn: ConnId, hdl: Handle, status: Status) {}
}

/// Registered application.
#[derive(Clone)]
pub(super) struct App {
    pub uuid: Uuid,
    pub cb: Arc<dyn Callbacks>,
}

impl Debug for App {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").field("uuid", &self.uuid).finish_non_exhaustive()
    }
}

/// Application registry indexed by interface identifier.
#[derive(Debug)]
pub(super) struct Apps(Vec<Option<App>>);

impl Apps {
    /// UUID identifying the built-in service owner.
    pub const BUILTIN_UUID: Uuid = GATT_SERVICE.as_uuid();

    /// Creates a registry with `n` slots.
    #[must_use]
    pub fn new(n: usize) -> Self {
        Self(vec![None; n])
    }

    /// Returns the registered application with the specified identifier.
    #[inline]
    #[must_use]
    pub fn get(&self, id: AppId) -> Option<&App> {
        id.index().and_then(|i| self.0.get(i)?.as_ref())
    }

    /// Returns an iterator over registered applications.
    pub fn iter(&self) -> impl Iterator<Item = (AppId, &App)> {
        (self.0.iter().enumerate()).filter_map(|(i, a)| Some((AppId::from_index(i), a.as_ref()?)))
    }

    /// Returns the callbacks of all registered applications.
    #[must_use]
    pub fn all_callbacks(&self) -> Vec<(AppId, Arc<dyn Callbacks>)> {
        self.iter().map(|(id, a)| (id, Arc::clone(&a.cb))).collect()
    }
}

impl Gatt {
    /// Registers an application. Returns [`Error::IllegalParameter`] if the
    /// UUID is already registered or [`Error::NoResources`] if the registry
    /// is full.
    pub fn register(&mut self, uuid: Uuid, cb: Arc<dyn Callbacks>) -> Result<AppId> {
        if uuid == Apps::BUILTIN_UUID || self.apps.iter().any(|(_, a)| a.uuid == uuid) {
            warn!("Application {uuid} is already registered");
            return Err(Error::IllegalParameter);
        }
        let Some(i) = self.apps.0.iter().position(Option::is_none) else {
            warn!("Application registry is full");
            return Err(Error::NoResources);
        };
        self.apps.0[i] = Some(App { uuid, cb });
        let id = AppId::from_index(i);
        info!("Registered application {uuid} as {id}");
        Ok(id)
    }

    /// Deregisters an application. All of its services are stopped and
    /// deleted, its outstanding client operations are dropped without
    /// callbacks, and its link holds and background connections are
    /// released.
    pub fn deregister(&mut self, app: AppId) -> Result<()> {
        if app == AppId::BUILTIN {
            return Err(Error::IllegalParameter);
        }
        let uuid = self.app_uuid(app).ok_or(Error::NotFound)?;
        for start in self.dir.owned_by(app) {
            self.stop_entry(start);
        }
        self.free_all_for_app(uuid);

        for k in self.clcbs.keys_where(|c| c.conn.app() == app) {
            self.free_clcb(k);
        }
        for k in self.tcbs.keys_where(|_| true) {
            let Some(o) = self.tcbs.get_mut(k).map(|t| t.forget_app(app)) else {
                continue;
            };
            if let Some(r) = o.srv_req {
                self.reject_srv_req(k, &r, ErrorCode::UnlikelyError);
            }
            if let Some(x) = o.exec_req {
                let _ = self.finish_execute_write(k, x.err);
            }
            if o.cfm {
                self.confirm_value(k);
            }
            let released = self.update_app_link_hold(app, k, false, true);
            if released || self.tcbs.get(k).map_or(false, |t| t.release_when_idle) {
                self.check_idle(k);
            }
        }
        for peer in self.bg.remove_app(app) {
            debug!("Background connection to {peer} no longer needed");
            if let Err(e) = self.bearer.background_connect(peer, false) {
                warn!("Failed to remove {peer} from background list: {e}");
            }
        }
        if let Some(i) = app.index() {
            self.apps.0[i] = None;
        }
        info!("Deregistered application {uuid} ({app})");
        Ok(())
    }

    /// Replays connection callbacks for every connected link so that a late
    /// registering application observes existing links.
    pub fn start_if(&mut self, app: AppId) -> Result<()> {
        let cb = self.callbacks(app).ok_or(Error::NotFound)?;
        for (k, t) in self.tcbs.iter() {
            if t.is_connected() {
                #[allow(clippy::cast_possible_truncation)]
                cb.on_connection(ConnId::new(k.idx() as u8, app), t.link, true, Reason::NONE);
            }
        }
        Ok(())
    }

    /// Returns the UUID of a registered application or the built-in owner.
    #[must_use]
    pub(super) fn app_uuid(&self, app: AppId) -> Option<Uuid> {
        if app == AppId::BUILTIN {
            return Some(Apps::BUILTIN_UUID);
        }
        self.apps.get(app).map(|a| a.uuid)
    }

    /// Returns the callbacks of a registered application.
    #[must_use]
    pub(super) fn callbacks(&self, app: AppId) -> Option<Arc<dyn Callbacks>> {
        self.apps.get(app).map(|a| Arc::clone(&a.cb))
    }
}
