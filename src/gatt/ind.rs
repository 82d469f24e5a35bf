use tracing::{debug, error, info, warn};

use crate::att::Handle;
use crate::le::{Addr, Link};

use super::slots::Key;
use super::tcb::PendingInd;
use super::*;

/// Service Changed characteristic state of the built-in GATT service
/// ([Vol 3] Part G, Section 7.1).
#[derive(Debug, Default)]
pub(super) struct SrvChg {
    /// Value handle of the Service Changed characteristic.
    pub hdl: Option<Handle>,
    pub clients: Vec<SrvChgClient>,
}

impl Gatt {
    /// Sends `ATT_HANDLE_VALUE_NTF` for an attribute of a service owned by
    /// the application identified by `conn`.
    pub fn notify(&mut self, conn: ConnId, hdl: Handle, val: &[u8]) -> Result<()> {
        let link = self.check_value(conn, hdl, val)?;
        self.bearer.send_ntf(link, hdl, val)
    }

    /// Sends `ATT_HANDLE_VALUE_IND`. At most one indication per link awaits
    /// confirmation ([Vol 3] Part F, Section 3.4.7.2). While one is
    /// outstanding, further indications are queued in FIFO order. The queue
    /// is drained by [`Self::send_pending_indication`] and by subsequent
    /// calls to this method. An error means that `val` was neither sent nor
    /// queued.
    pub fn indicate(&mut self, conn: ConnId, hdl: Handle, val: Vec<u8>) -> Result<()> {
        self.check_value(conn, hdl, &val)?;
        let Some(k) = self.tcb_by_conn(conn) else {
            return Err(Error::IllegalParameter);
        };
        let Some(t) = self.tcbs.get_mut(k) else {
            return Err(Error::IllegalParameter);
        };
        if t.ind_active.is_none() && t.pending_ind.is_empty() {
            return self.send_ind(k, conn, hdl, &val);
        }
        t.pending_ind.push_back(PendingInd { conn, hdl, val });
        debug!(
            "Queued indication for {hdl} on {} ({} pending)",
            t.link,
            t.pending_ind.len()
        );
        if let Err(e) = self.drain_ind(k) {
            warn!("Failed to send queued indication: {e}");
        }
        Ok(())
    }

    /// Sends the next queued indication if none is awaiting confirmation.
    /// Returns whether an indication was sent.
    pub fn send_pending_indication(&mut self, link: Link) -> Result<bool> {
        let k = self.tcb_by_link(link).ok_or(Error::NotFound)?;
        self.drain_ind(k)
    }

    /// Returns the number of queued indications for `link`.
    #[must_use]
    pub fn pending_indications(&self, link: Link) -> usize {
        (self.tcb_by_link(link))
            .and_then(|k| self.tcbs.get(k))
            .map_or(0, |t| t.pending_ind.len())
    }

    /// Handles `ATT_HANDLE_VALUE_CFM` from the peer. The queue of pending
    /// indications is not drained here.
    pub fn on_confirmation(&mut self, link: Link) {
        let Some(k) = self.tcb_by_link(link) else {
            warn!("Confirmation from unknown link {link}");
            return;
        };
        let Some(t) = self.tcbs.get_mut(k) else { return };
        let Some((conn, hdl)) = t.ind_active.take() else {
            warn!("Unexpected confirmation from {link}");
            return;
        };
        t.conf_timer.stop();
        debug!("Indication for {hdl} confirmed by {link}");
        if conn.app() == AppId::BUILTIN && Some(hdl) == self.srv_chg.hdl {
            self.srv_chg_confirmed(link.peer);
        } else if let Some(cb) = self.callbacks(conn.app()) {
            cb.on_indication_confirmed(conn, hdl, Status::Success);
        }
    }

    /// Returns whether a Service Changed indication to `link` is awaiting
    /// confirmation or queued.
    #[must_use]
    pub fn is_srv_chg_ind_pending(&self, link: Link) -> bool {
        let (Some(hdl), Some(t)) = (
            self.srv_chg.hdl,
            self.tcb_by_link(link).and_then(|k| self.tcbs.get(k)),
        ) else {
            return false;
        };
        let srv_chg = |conn: ConnId, h: Handle| conn.app() == AppId::BUILTIN && h == hdl;
        t.ind_active.map_or(false, |(c, h)| srv_chg(c, h))
            || t.pending_ind.iter().any(|p| srv_chg(p.conn, p.hdl))
    }

    /// Marks every service-changed client as owing an indication.
    pub fn mark_service_changed(&mut self) {
        for c in &mut self.srv_chg.clients {
            c.pending = true;
            if let Some(s) = self.store.as_mut() {
                s.srv_chg_client_updated(SrvChgCmd::Update, c);
            }
        }
    }

    /// Adds a peer to the service-changed client list.
    pub fn add_srv_chg_client(&mut self, peer: Addr) {
        if self.srv_chg.clients.iter().any(|c| c.peer == peer) {
            return;
        }
        let c = SrvChgClient {
            peer,
            pending: false,
        };
        info!("{peer} subscribed to Service Changed");
        self.srv_chg.clients.push(c);
        if let Some(s) = self.store.as_mut() {
            s.srv_chg_client_updated(SrvChgCmd::Add, &c);
        }
    }

    /// Removes a peer from the service-changed client list.
    pub fn remove_srv_chg_client(&mut self, peer: Addr) {
        let Some(i) = self.srv_chg.clients.iter().position(|c| c.peer == peer) else {
            return;
        };
        let c = self.srv_chg.clients.remove(i);
        info!("{peer} unsubscribed from Service Changed");
        if let Some(s) = self.store.as_mut() {
            s.srv_chg_client_updated(SrvChgCmd::Remove, &c);
        }
    }

    /// Returns the service-changed clients.
    #[inline]
    #[must_use]
    pub fn srv_chg_clients(&self) -> &[SrvChgClient] {
        &self.srv_chg.clients
    }

    /// Marks all clients and indicates the change to every connected one.
    pub(super) fn service_changed(&mut self) {
        if self.srv_chg.hdl.is_none() {
            return;
        }
        self.mark_service_changed();
        let peers: Vec<_> = self.srv_chg.clients.iter().map(|c| c.peer).collect();
        let keys = (self.tcbs).keys_where(|t| t.is_connected() && peers.contains(&t.link.peer));
        for k in keys {
            self.send_srv_chg_ind(k);
        }
    }

    /// Returns whether `link` belongs to a service-changed client that is
    /// owed an indication.
    #[must_use]
    pub(super) fn srv_chg_pending_for(&self, link: Link) -> bool {
        (self.srv_chg.clients.iter()).any(|c| c.peer == link.peer && c.pending)
    }

    /// Indicates that the entire handle range may have changed.
    pub(super) fn send_srv_chg_ind(&mut self, k: Key) {
        let (Some(hdl), Some(t)) = (self.srv_chg.hdl, self.tcbs.get(k)) else {
            return;
        };
        let link = t.link;
        if self.is_srv_chg_ind_pending(link) {
            return;
        }
        let mut val = Vec::with_capacity(4);
        val.extend_from_slice(&0x0001_u16.to_le_bytes());
        val.extend_from_slice(&0xFFFF_u16.to_le_bytes());
        #[allow(clippy::cast_possible_truncation)]
        let conn = ConnId::new(k.idx() as u8, AppId::BUILTIN);
        info!("Indicating Service Changed to {link}");
        if let Err(e) = self.indicate(conn, hdl, val) {
            warn!("Failed to indicate Service Changed to {link}: {e}");
        }
    }

    /// Handles an expired indication confirmation timer. The link is
    /// considered unusable and is disconnected ([Vol 3] Part F, Section
    /// 3.3.3).
    pub(super) fn conf_timeout(&mut self, k: Key) {
        let Some(t) = self.tcbs.get_mut(k) else { return };
        let Some((conn, hdl)) = t.ind_active.take() else { return };
        error!("Indication for {hdl} on {} was not confirmed", t.link);
        if let Some(cb) = self.callbacks(conn.app()) {
            cb.on_indication_confirmed(conn, hdl, Status::Error);
        }
        self.force_disconnect(k, Reason::TIMEOUT);
    }

    /// Validates a notification or indication request and returns its link.
    fn check_value(&self, conn: ConnId, hdl: Handle, val: &[u8]) -> Result<Link> {
        let app = conn.app();
        if app != AppId::BUILTIN && self.apps.get(app).is_none() {
            return Err(Error::IllegalParameter);
        }
        let Some(t) = (self.tcb_by_conn(conn)).and_then(|k| self.tcbs.get(k)) else {
            return Err(Error::IllegalParameter);
        };
        if !t.is_connected() || val.len() > usize::from(t.mtu) - 3 {
            return Err(Error::IllegalParameter);
        }
        if !self.dir.find_owner(hdl).map_or(false, |s| s.app == app) {
            warn!("{hdl} is not in a started service of {app}");
            return Err(Error::IllegalParameter);
        }
        Ok(t.link)
    }

    /// Sends the next queued indication. The indication stays at the head of
    /// the queue if the bearer fails to send it.
    fn drain_ind(&mut self, k: Key) -> Result<bool> {
        let Some(t) = self.tcbs.get_mut(k) else {
            return Ok(false);
        };
        if !t.is_connected() || t.ind_active.is_some() {
            return Ok(false);
        }
        let Some(p) = t.pending_ind.pop_front() else {
            return Ok(false);
        };
        if let Err(e) = self.send_ind(k, p.conn, p.hdl, &p.val) {
            if let Some(t) = self.tcbs.get_mut(k) {
                t.pending_ind.push_front(p);
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Transmits an indication and starts the confirmation timer.
    fn send_ind(&mut self, k: Key, conn: ConnId, hdl: Handle, val: &[u8]) -> Result<()> {
        let Some(t) = self.tcbs.get_mut(k) else {
            return Err(Error::NotFound);
        };
        self.bearer.send_ind(t.link, hdl, val)?;
        t.ind_active = Some((conn, hdl));
        t.conf_timer.start(self.cfg.conf_timeout);
        Ok(())
    }

    /// Clears the pending flag of a service-changed client.
    fn srv_chg_confirmed(&mut self, peer: Addr) {
        let Some(c) = self.srv_chg.clients.iter_mut().find(|c| c.peer == peer) else {
            return;
        };
        c.pending = false;
        if let Some(s) = self.store.as_mut() {
            s.srv_chg_client_updated(SrvChgCmd::Update, c);
        }
    }
}
