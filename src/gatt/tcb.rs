use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::att::{ErrorCode, Handle, PeerReq, Req};
use crate::le::{Link, Transport};

use super::slots::Key;
use super::timer::Timer;
use super::*;

/// Link state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum LinkState {
    /// Direct connection requested.
    Connecting,
    Connected,
    /// Disconnection requested.
    Closing,
}

/// Client request queued for transmission. ATT allows only one outstanding
/// request per bearer ([Vol 3] Part F, Section 3.3.2).
#[derive(Clone, Debug)]
pub(super) struct Cmd {
    /// Operation that issued the request. [`None`] if the operation ended
    /// after the request was sent.
    pub clcb: Option<Key>,
    pub req: Req,
    pub sent: bool,
}

/// Indication waiting for the previous one to be confirmed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct PendingInd {
    pub conn: ConnId,
    pub hdl: Handle,
    pub val: Vec<u8>,
}

/// Peer request awaiting an application response.
#[derive(Clone, Debug)]
pub(super) struct SrvReq {
    pub trans: TransId,
    pub app: AppId,
    pub req: PeerReq,
}

/// Execute write request fanned out to every application with prepared
/// writes.
#[derive(Clone, Copy, Debug)]
pub(super) struct ExecReq {
    pub trans: TransId,
    /// Holder bits of the applications that have not responded yet.
    pub waiting: u64,
    pub err: Option<(Option<Handle>, ErrorCode)>,
}

/// Transport control block.
#[derive(Debug)]
pub(super) struct Tcb {
    pub link: Link,
    pub state: LinkState,
    /// Applications holding the link open, one bit per [`AppId`].
    pub holders: u64,
    pub mtu: u16,
    /// Client request queue. The head is the only request that may be sent.
    pub cmd_q: VecDeque<Cmd>,
    /// Client operations waiting for a security procedure.
    pub pending_sec: VecDeque<Key>,
    /// Indications waiting for the active one to be confirmed.
    pub pending_ind: VecDeque<PendingInd>,
    /// Indication awaiting peer confirmation. The connection refers to the
    /// built-in owner if the sending application was deregistered.
    pub ind_active: Option<(ConnId, Handle)>,
    pub conf_timer: Timer,
    pub srv_req: Option<SrvReq>,
    pub exec_req: Option<ExecReq>,
    /// Prepared write counts per application.
    pub prep_cnt: Vec<u16>,
    /// Holder bits of the applications that still have to confirm a
    /// received indication.
    pub ind_waiting: u64,
    pub ind_ack_timer: Timer,
    /// Disconnect once the last client operation ends.
    pub release_when_idle: bool,
    next_trans: u32,
}

impl Tcb {
    /// Creates a new transport control block.
    #[must_use]
    fn new(link: Link, state: LinkState, mtu: u16, max_apps: usize) -> Self {
        Self {
            link,
            state,
            holders: 0,
            mtu,
            cmd_q: VecDeque::new(),
            pending_sec: VecDeque::new(),
            pending_ind: VecDeque::new(),
            ind_active: None,
            conf_timer: Timer::default(),
            srv_req: None,
            exec_req: None,
            prep_cnt: vec![0; max_apps + 1],
            ind_waiting: 0,
            ind_ack_timer: Timer::default(),
            release_when_idle: false,
            next_trans: 0,
        }
    }

    /// Returns whether the link is established.
    #[inline(always)]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Returns a new server transaction identifier.
    pub fn next_trans(&mut self) -> TransId {
        self.next_trans = self.next_trans.wrapping_add(1).max(1);
        TransId(self.next_trans)
    }

    /// Returns whether `app` holds the link.
    #[inline]
    #[must_use]
    pub const fn is_held_by(&self, app: AppId) -> bool {
        self.holders & app.bit() != 0
    }

    /// Removes the per-application state of `app` and returns the peer
    /// transactions that can no longer be completed by it.
    pub fn forget_app(&mut self, app: AppId) -> Orphans {
        let mut o = Orphans::default();
        if let Some(n) = self.prep_cnt.get_mut(usize::from(app.raw())) {
            *n = 0;
        }
        self.pending_ind.retain(|p| p.conn.app() != app);
        if let Some((conn, _)) = self.ind_active.as_mut().filter(|(c, _)| c.app() == app) {
            *conn = ConnId::new(conn.tcb_idx(), AppId::BUILTIN);
        }
        if self.ind_waiting & app.bit() != 0 {
            self.ind_waiting &= !app.bit();
            o.cfm = self.ind_waiting == 0;
        }
        if let Some(x) = (self.exec_req.as_mut()).filter(|x| x.waiting & app.bit() != 0) {
            x.waiting &= !app.bit();
            x.err.get_or_insert((None, ErrorCode::UnlikelyError));
            if x.waiting == 0 {
                o.exec_req = self.exec_req.take();
            }
        }
        if self.srv_req.as_ref().map_or(false, |r| r.app == app) {
            o.srv_req = self.srv_req.take();
        }
        o
    }
}

/// Peer transactions left without an application by deregistration.
#[derive(Debug, Default)]
pub(super) struct Orphans {
    /// Request that was waiting for the application's response.
    pub srv_req: Option<SrvReq>,
    /// Execute write that no longer waits for any application.
    pub exec_req: Option<ExecReq>,
    /// Received indication that no longer waits for any application.
    pub cfm: bool,
}

impl Gatt {
    /// Initiates a connection to `link` on behalf of `app`. A direct
    /// connection is attempted immediately. A background connection adds the
    /// peer to the controller's background list until the application
    /// cancels it.
    pub fn connect(&mut self, app: AppId, link: Link, direct: bool) -> Result<()> {
        if self.apps.get(app).is_none() {
            return Err(Error::IllegalParameter);
        }
        if !direct {
            if link.transport != Transport::Le {
                return Err(Error::IllegalParameter);
            }
            if self.bg.add(link.peer, app)? {
                if let Err(e) = self.bearer.background_connect(link.peer, true) {
                    warn!("Failed to add {} to background list: {e}", link.peer);
                    let _ = self.bg.remove(link.peer, app);
                    return Err(e);
                }
            }
            if let Some(k) = self.tcb_by_link(link) {
                self.hold_and_report(app, k);
            }
            return Ok(());
        }
        if let Some(k) = self.tcb_by_link(link) {
            self.hold_and_report(app, k);
            return Ok(());
        }
        let k = self.allocate_or_find(link, LinkState::Connecting)?;
        if let Err(e) = self.bearer.connect(link) {
            warn!("Failed to connect to {link}: {e}");
            self.tcbs.remove(k);
            return Err(e);
        }
        debug!("Connecting to {link}");
        self.update_app_link_hold(app, k, true, true);
        Ok(())
    }

    /// Cancels a direct or background connection request of `app`.
    pub fn cancel_connect(&mut self, app: AppId, link: Link, direct: bool) -> Result<()> {
        if !direct {
            if self.bg.remove(link.peer, app)? {
                if let Err(e) = self.bearer.background_connect(link.peer, false) {
                    warn!("Failed to remove {} from background list: {e}", link.peer);
                }
            }
            return Ok(());
        }
        let k = self.tcb_by_link(link).ok_or(Error::NotFound)?;
        let Some(t) = self.tcbs.get(k) else {
            return Err(Error::NotFound);
        };
        if t.state != LinkState::Connecting || !t.is_held_by(app) {
            return Err(Error::NotFound);
        }
        self.update_app_link_hold(app, k, false, true);
        if self.count_holders(k) == 0 {
            debug!("Canceling connection to {link}");
            self.tcbs.remove(k);
            return self.bearer.cancel_connect(link);
        }
        Ok(())
    }

    /// Releases the link hold of the application identified by `conn`. The
    /// link is disconnected once no application holds it and no client
    /// operations are outstanding.
    pub fn disconnect(&mut self, conn: ConnId) -> Result<()> {
        let k = self.tcb_by_conn(conn).ok_or(Error::NotFound)?;
        if !self.tcbs.get(k).map_or(false, Tcb::is_connected) {
            return Err(Error::NotFound);
        }
        if self.update_app_link_hold(conn.app(), k, false, true) {
            self.check_idle(k);
        }
        Ok(())
    }

    /// Handles link establishment reported by the transport. Every registered
    /// application is notified.
    pub fn on_link_up(&mut self, link: Link) -> Result<()> {
        let k = self.allocate_or_find(link, LinkState::Connected)?;
        let Some(t) = self.tcbs.get_mut(k) else {
            return Err(Error::Internal);
        };
        t.state = LinkState::Connected;
        t.mtu = self.cfg.default_mtu;
        info!("Link up: {link}");
        let bg: Vec<_> = self.bg.apps(link.peer).to_vec();
        for app in bg {
            self.update_app_link_hold(app, k, true, true);
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = k.idx() as u8;
        for (app, cb) in self.apps.all_callbacks() {
            cb.on_connection(ConnId::new(idx, app), link, true, Reason::NONE);
        }
        if self.srv_chg_pending_for(link) {
            self.send_srv_chg_ind(k);
        }
        Ok(())
    }

    /// Handles link loss reported by the transport. Every client operation
    /// on the link ends with [`Status::Error`], all timers and queues are
    /// released, and every registered application is notified.
    pub fn on_link_down(&mut self, link: Link, reason: Reason) {
        let Some(k) = self.tcb_by_link(link) else {
            warn!("Link down for unknown link {link}");
            return;
        };
        if let Some(t) = self.tcbs.get_mut(k) {
            t.state = LinkState::Closing;
        }
        info!("Link down: {link} ({reason:?})");
        for c in self.clcbs.keys_where(|c| c.tcb == k) {
            self.end_op(c, Status::Error, None);
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = k.idx() as u8;
        for (app, cb) in self.apps.all_callbacks() {
            cb.on_connection(ConnId::new(idx, app), link, false, reason);
        }
        if let Some(t) = self.tcbs.remove(k) {
            debug!(
                "Released {link} with {} pending indication(s)",
                t.pending_ind.len()
            );
        }
        if let Some(f) = self.link_observer.as_mut() {
            f(link, 0);
        }
        if self.bg.contains(link.peer) {
            debug!("Re-arming background connection to {}", link.peer);
            if let Err(e) = self.bearer.background_connect(link.peer, true) {
                warn!("Failed to re-arm background connection: {e}");
            }
        }
    }

    /// Returns the negotiated `ATT_MTU` of a connection.
    #[must_use]
    pub fn mtu(&self, conn: ConnId) -> Option<u16> {
        self.tcb_by_conn(conn).and_then(|k| Some(self.tcbs.get(k)?.mtu))
    }

    /// Returns the connection identifier of `app` on a connected link.
    #[must_use]
    pub fn conn_id(&self, app: AppId, link: Link) -> Option<ConnId> {
        let k = self.tcb_by_link(link)?;
        #[allow(clippy::cast_possible_truncation)]
        (self.tcbs.get(k)?.is_connected()).then(|| ConnId::new(k.idx() as u8, app))
    }

    /// Returns whether `link` is connected.
    #[must_use]
    pub fn is_connected(&self, link: Link) -> bool {
        (self.tcb_by_link(link)).map_or(false, |k| {
            self.tcbs.get(k).map_or(false, Tcb::is_connected)
        })
    }

    /// Returns the number of applications holding the link.
    #[must_use]
    pub(super) fn count_holders(&self, k: Key) -> usize {
        (self.tcbs.get(k)).map_or(0, |t| t.holders.count_ones() as usize)
    }

    /// Sets or clears the link hold bit of `app`. Returns whether the bit
    /// changed. The link observer is informed of the new holder count if
    /// `notify` is set.
    pub(super) fn update_app_link_hold(&mut self, app: AppId, k: Key, hold: bool, notify: bool) -> bool {
        let Some(t) = self.tcbs.get_mut(k) else {
            return false;
        };
        let old = t.holders;
        if hold {
            t.holders |= app.bit();
            t.release_when_idle = false;
        } else {
            t.holders &= !app.bit();
        }
        if t.holders == old {
            return false;
        }
        let (link, n) = (t.link, t.holders.count_ones() as usize);
        debug!("{app} {} {link} ({n} holder(s))", if hold { "holds" } else { "released" });
        if notify {
            if let Some(f) = self.link_observer.as_mut() {
                f(link, n);
            }
        }
        true
    }

    /// Disconnects a link that has no holders and no outstanding client
    /// operations. If operations are outstanding, the disconnect is deferred
    /// until the last one ends.
    pub(super) fn check_idle(&mut self, k: Key) {
        let busy = self.clcbs.iter().any(|(_, c)| c.tcb == k);
        let holders = self.count_holders(k);
        let Some(t) = self.tcbs.get_mut(k) else { return };
        if !t.is_connected() || holders != 0 {
            return;
        }
        if busy {
            t.release_when_idle = true;
            return;
        }
        t.release_when_idle = false;
        self.force_disconnect(k, Reason::LOCAL_HOST);
    }

    /// Requests link termination. The control block is released when the
    /// transport reports the link down.
    pub(super) fn force_disconnect(&mut self, k: Key, reason: Reason) {
        let Some(t) = self.tcbs.get_mut(k) else { return };
        if t.state == LinkState::Closing {
            return;
        }
        t.state = LinkState::Closing;
        let link = t.link;
        info!("Disconnecting {link} ({reason:?})");
        if let Err(e) = self.bearer.disconnect(link, reason) {
            warn!("Failed to disconnect {link}: {e}");
        }
    }

    /// Returns the control block for `link` or allocates a new one.
    pub(super) fn allocate_or_find(&mut self, link: Link, state: LinkState) -> Result<Key> {
        if let Some(k) = self.tcb_by_link(link) {
            return Ok(k);
        }
        let (mtu, max_apps) = (self.cfg.default_mtu, self.cfg.max_apps);
        (self.tcbs.insert_with(|_| Tcb::new(link, state, mtu, max_apps))).ok_or_else(|| {
            warn!("No free transport control block for {link}");
            Error::NoResources
        })
    }

    /// Returns the control block key for `link`.
    #[must_use]
    pub(super) fn tcb_by_link(&self, link: Link) -> Option<Key> {
        (self.tcbs.iter()).find_map(|(k, t)| (t.link == link).then_some(k))
    }

    /// Returns the control block key for `conn`.
    #[inline]
    #[must_use]
    pub(super) fn tcb_by_conn(&self, conn: ConnId) -> Option<Key> {
        self.tcbs.key_at(usize::from(conn.tcb_idx()))
    }

    /// Sets the link hold of `app` and reports an established link.
    fn hold_and_report(&mut self, app: AppId, k: Key) {
        self.update_app_link_hold(app, k, true, true);
        let Some(t) = self.tcbs.get(k) else { return };
        if t.is_connected() {
            if let Some(cb) = self.callbacks(app) {
                #[allow(clippy::cast_possible_truncation)]
                cb.on_connection(ConnId::new(k.idx() as u8, app), t.link, true, Reason::NONE);
            }
        }
    }
}
