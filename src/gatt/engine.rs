use std::fmt::{Debug, Formatter};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::le::Link;

use super::app::Apps;
use super::bg::BgConns;
use super::client::Clcb;
use super::directory::Directory;
use super::ind::SrvChg;
use super::registry::Registry;
use super::slots::Slots;
use super::tcb::Tcb;
use super::*;

/// Observer of the number of applications holding a link open. Called with
/// zero when the link is released.
pub type LinkObserver = Box<dyn FnMut(Link, usize) + Send>;

/// GATT protocol engine.
pub struct Gatt {
    pub(super) cfg: Config,
    pub(super) bearer: Box<dyn Bearer>,
    pub(super) security: Option<Box<dyn Security>>,
    pub(super) sdp: Option<Box<dyn Sdp>>,
    pub(super) store: Option<Box<dyn Store>>,
    pub(super) link_observer: Option<LinkObserver>,
    pub(super) registry: Registry,
    pub(super) dir: Directory,
    pub(super) apps: Apps,
    pub(super) tcbs: Slots<Tcb>,
    pub(super) clcbs: Slots<Clcb>,
    pub(super) bg: BgConns,
    pub(super) srv_chg: SrvChg,
}

impl Gatt {
    /// Creates an engine that transmits PDUs via `bearer`. The built-in GATT
    /// service is added if enabled by the configuration.
    #[must_use]
    pub fn new(cfg: Config, bearer: Box<dyn Bearer>) -> Self {
        let cfg = cfg.sanitized();
        let mut g = Self {
            cfg,
            bearer,
            security: None,
            sdp: None,
            store: None,
            link_observer: None,
            registry: Registry::default(),
            dir: Directory::default(),
            apps: Apps::new(cfg.max_apps),
            tcbs: Slots::with_capacity(cfg.max_links),
            clcbs: Slots::with_capacity(cfg.max_client_ops),
            bg: BgConns::new(cfg.max_bg_conns),
            srv_chg: SrvChg::default(),
        };
        if cfg.builtin_gatt_service {
            g.add_builtin_service();
        }
        info!("GATT engine ready ({} link(s), {} application(s))", cfg.max_links, cfg.max_apps);
        g
    }

    /// Sets the security admission check for client operations.
    #[must_use]
    pub fn with_security(mut self, s: Box<dyn Security>) -> Self {
        self.security = Some(s);
        self
    }

    /// Sets the SDP record publisher.
    #[must_use]
    pub fn with_sdp(mut self, s: Box<dyn Sdp>) -> Self {
        self.sdp = Some(s);
        self
    }

    /// Sets the persistent store and loads the saved service-changed clients.
    #[must_use]
    pub fn with_store(mut self, mut s: Box<dyn Store>) -> Self {
        for c in s.load_srv_chg_clients() {
            if !self.srv_chg.clients.iter().any(|o| o.peer == c.peer) {
                debug!("Loaded service-changed client {}", c.peer);
                self.srv_chg.clients.push(c);
            }
        }
        self.store = Some(s);
        self
    }

    /// Sets the link holder observer.
    #[must_use]
    pub fn with_link_observer(mut self, f: LinkObserver) -> Self {
        self.link_observer = Some(f);
        self
    }

    /// Returns the effective configuration.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns the earliest armed timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let clcb = (self.clcbs.iter()).filter_map(|(_, c)| c.timer.deadline());
        let tcb = (self.tcbs.iter())
            .flat_map(|(_, t)| [t.conf_timer.deadline(), t.ind_ack_timer.deadline()])
            .flatten();
        clcb.chain(tcb).min()
    }

    /// Handles every timer whose deadline is at or before `now`.
    pub fn on_timer(&mut self, now: Instant) {
        let due = |d: Option<Instant>| d.map_or(false, |d| d <= now);
        for c in self.clcbs.keys_where(|c| due(c.timer.deadline())) {
            if (self.clcbs.get_mut(c)).map_or(false, |c| c.timer.take_expired(now)) {
                self.rsp_timeout(c);
            }
        }
        for k in self.tcbs.keys_where(|_| true) {
            if (self.tcbs.get_mut(k)).map_or(false, |t| t.conf_timer.take_expired(now)) {
                self.conf_timeout(k);
            }
            if (self.tcbs.get_mut(k)).map_or(false, |t| t.ind_ack_timer.take_expired(now)) {
                self.ind_ack_timeout(k);
            }
        }
    }

    /// Adds the GATT service with the Service Changed characteristic
    /// ([Vol 3] Part G, Section 7).
    fn add_builtin_service(&mut self) {
        let elems = [
            Element::primary(GATT_SERVICE),
            Element::characteristic(SERVICE_CHANGED, Prop::INDICATE, Perms::empty()),
            Element::descriptor(CLIENT_CHAR_CONFIG, Perms::READ | Perms::WRITE),
        ];
        match self.add_service(AppId::BUILTIN, &elems) {
            Ok(hdls) => self.srv_chg.hdl = hdls.get(1).copied(),
            Err(e) => warn!("Failed to add GATT service: {e}"),
        }
    }
}

impl Debug for Gatt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatt")
            .field("cfg", &self.cfg)
            .field("registry", &self.registry)
            .field("dir", &self.dir)
            .field("apps", &self.apps)
            .field("tcbs", &self.tcbs.len())
            .field("clcbs", &self.clcbs.len())
            .field("srv_chg", &self.srv_chg)
            .finish_non_exhaustive()
    }
}
