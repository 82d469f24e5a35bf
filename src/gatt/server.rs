use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::att::{ErrorCode, Handle, Opcode, PeerReq, SrvRsp, MIN_MTU};
use crate::le::{Link, Transport};

use super::slots::Key;
use super::tcb::{ExecReq, SrvReq};
use super::*;

impl Gatt {
    /// Handles a request or command received from a peer client.
    /// `ATT_EXCHANGE_MTU_REQ` is answered by the engine. Requests for
    /// attribute values are routed to the application that owns the started
    /// service containing the handle.
    pub fn on_request(&mut self, link: Link, req: PeerReq) {
        let Some(k) = self.connected_tcb(link) else {
            warn!("{} from unknown link {link}", req.opcode());
            return;
        };
        let Some(t) = self.tcbs.get(k) else { return };
        let op = req.opcode();
        if !op.is_cmd() && (t.srv_req.is_some() || t.exec_req.is_some()) {
            warn!("{op} from {link} while another request is outstanding");
            return;
        }
        trace!("{op} from {link}");
        match req {
            PeerReq::ExchangeMtu { mtu } => self.srv_exchange_mtu(k, mtu),
            PeerReq::ExecuteWrite { execute } => self.srv_execute_write(k, execute),
            req => self.srv_attr_req(k, req),
        }
    }

    /// Sends an application response to a peer request identified by
    /// `trans`. `Ok` carries the value for read requests and is ignored for
    /// writes. `Err` sends `ATT_ERROR_RSP`.
    pub fn send_response(
        &mut self,
        conn: ConnId,
        trans: TransId,
        rsp: std::result::Result<Vec<u8>, ErrorCode>,
    ) -> Result<()> {
        let k = self.tcb_by_conn(conn).ok_or(Error::NotFound)?;
        let app = conn.app();
        let t = self.tcbs.get_mut(k).ok_or(Error::NotFound)?;
        let max = usize::from(t.mtu) - 1;

        if let Some(x) = (t.exec_req.as_mut()).filter(|x| x.trans == trans && x.waiting & app.bit() != 0) {
            x.waiting &= !app.bit();
            if let Err(err) = rsp {
                x.err.get_or_insert((None, err));
            }
            if x.waiting != 0 {
                return Ok(());
            }
            let x = t.exec_req.take();
            return self.finish_execute_write(k, x.and_then(|x| x.err));
        }

        if !(t.srv_req.as_ref()).map_or(false, |r| r.trans == trans && r.app == app) {
            warn!("No outstanding request for {trans:?} on {conn}");
            return Err(Error::NotFound);
        }
        let Some(r) = t.srv_req.take() else {
            return Err(Error::NotFound);
        };
        let rsp = match (r.req, rsp) {
            (req, Err(err)) => SrvRsp::error(req.opcode(), req.handle(), err),
            (PeerReq::Read { .. }, Ok(mut v)) => {
                v.truncate(max);
                SrvRsp::Read(v)
            }
            (PeerReq::ReadBlob { .. }, Ok(mut v)) => {
                v.truncate(max);
                SrvRsp::ReadBlob(v)
            }
            (PeerReq::Write { .. }, Ok(_)) => SrvRsp::Write,
            (PeerReq::PrepareWrite { hdl, off, val }, Ok(_)) => SrvRsp::PrepareWrite { hdl, off, val },
            (req, Ok(_)) => SrvRsp::error(req.opcode(), req.handle(), ErrorCode::UnlikelyError),
        };
        self.send_srv_rsp(k, &rsp)
    }

    /// Handles a notification or indication received from the peer server.
    /// Every registered application receives the value. An indication is
    /// confirmed once every application confirms it or the acknowledgment
    /// timer expires.
    pub fn on_value(&mut self, link: Link, hdl: Handle, val: &[u8], ind: bool) {
        let Some(k) = self.connected_tcb(link) else {
            warn!("Value for {hdl} from unknown link {link}");
            return;
        };
        let cbs = self.apps.all_callbacks();
        if ind {
            let tmo = self.cfg.ind_ack_timeout;
            let Some(t) = self.tcbs.get_mut(k) else { return };
            if t.ind_waiting != 0 {
                warn!("Indication from {link} before the previous one was confirmed");
            }
            t.ind_waiting = cbs.iter().fold(0, |w, (app, _)| w | app.bit());
            if cbs.is_empty() {
                if let Err(e) = self.bearer.send_cfm(link) {
                    warn!("Failed to confirm indication from {link}: {e}");
                }
            } else {
                t.ind_ack_timer.start(tmo);
            }
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = k.idx() as u8;
        for (app, cb) in cbs {
            cb.on_value(ConnId::new(idx, app), hdl, val, ind);
        }
    }

    /// Confirms a received indication on behalf of an application. The
    /// confirmation is sent to the peer once all applications confirmed.
    /// Returns [`Error::NotFound`] if the application has no indication to
    /// confirm.
    pub fn confirm(&mut self, conn: ConnId) -> Result<()> {
        let k = self.tcb_by_conn(conn).ok_or(Error::NotFound)?;
        let t = self.tcbs.get_mut(k).ok_or(Error::NotFound)?;
        let bit = conn.app().bit();
        if t.ind_waiting & bit == 0 {
            return Err(Error::NotFound);
        }
        t.ind_waiting &= !bit;
        if t.ind_waiting != 0 {
            return Ok(());
        }
        t.ind_ack_timer.stop();
        debug!("Confirming indication from {}", t.link);
        self.bearer.send_cfm(t.link)
    }

    /// Handles an expired indication acknowledgment timer by confirming the
    /// indication on behalf of the remaining applications.
    pub(super) fn ind_ack_timeout(&mut self, k: Key) {
        let Some(t) = self.tcbs.get(k) else { return };
        warn!(
            "{} application(s) did not confirm indication from {}",
            t.ind_waiting.count_ones(),
            t.link
        );
        self.confirm_value(k);
    }

    /// Sends `ATT_HANDLE_VALUE_CFM` for a received indication that no longer
    /// waits for any application.
    pub(super) fn confirm_value(&mut self, k: Key) {
        let Some(t) = self.tcbs.get_mut(k) else { return };
        t.ind_waiting = 0;
        t.ind_ack_timer.stop();
        if let Err(e) = self.bearer.send_cfm(t.link) {
            warn!("Failed to confirm indication from {}: {e}", t.link);
        }
    }

    /// Sends `ATT_ERROR_RSP` for an outstanding peer request that will not
    /// be answered by its application.
    pub(super) fn reject_srv_req(&mut self, k: Key, r: &SrvReq, err: ErrorCode) {
        self.reject(k, r.req.opcode(), r.req.handle(), err);
    }

    /// Returns the key of a connected link.
    pub(super) fn connected_tcb(&self, link: Link) -> Option<Key> {
        (self.tcb_by_link(link)).filter(|&k| self.tcbs.get(k).map_or(false, |t| t.is_connected()))
    }

    /// Answers `ATT_EXCHANGE_MTU_REQ` ([Vol 3] Part F, Section 3.4.2.1).
    fn srv_exchange_mtu(&mut self, k: Key, mtu: u16) {
        let max = self.cfg.max_mtu;
        let Some(t) = self.tcbs.get_mut(k) else { return };
        if t.link.transport != Transport::Le {
            return self.reject(k, Opcode::ExchangeMtuReq, None, ErrorCode::RequestNotSupported);
        }
        t.mtu = mtu.clamp(MIN_MTU, max);
        debug!("ATT_MTU for {} is {}", t.link, t.mtu);
        let _ = self.send_srv_rsp(k, &SrvRsp::ExchangeMtu { mtu: max });
    }

    /// Fans `ATT_EXECUTE_WRITE_REQ` out to every application with prepared
    /// writes.
    fn srv_execute_write(&mut self, k: Key, execute: bool) {
        let Some(t) = self.tcbs.get_mut(k) else { return };
        let mut apps = Vec::new();
        for (i, n) in t.prep_cnt.iter_mut().enumerate() {
            if *n > 0 {
                *n = 0;
                #[allow(clippy::cast_possible_truncation)]
                apps.push(AppId::new(i as u8));
            }
        }
        let trans = t.next_trans();
        let cbs: Vec<_> = (apps.into_iter())
            .filter_map(|app| Some((app, self.callbacks(app)?)))
            .collect();
        if cbs.is_empty() {
            let _ = self.finish_execute_write(k, None);
            return;
        }
        let waiting = cbs.iter().fold(0, |w, (app, _)| w | app.bit());
        if let Some(t) = self.tcbs.get_mut(k) {
            t.exec_req = Some(ExecReq {
                trans,
                waiting,
                err: None,
            });
        }
        debug!("Execute write fanned out to {} application(s)", cbs.len());
        #[allow(clippy::cast_possible_truncation)]
        let idx = k.idx() as u8;
        let req = PeerReq::ExecuteWrite { execute };
        for (app, cb) in cbs {
            cb.on_request(ConnId::new(idx, app), trans, &req);
        }
    }

    /// Sends the execute write response once every application responded.
    pub(super) fn finish_execute_write(
        &mut self,
        k: Key,
        err: Option<(Option<Handle>, ErrorCode)>,
    ) -> Result<()> {
        let rsp = match err {
            Some((hdl, err)) => SrvRsp::error(Opcode::ExecuteWriteReq, hdl, err),
            None => SrvRsp::ExecuteWrite,
        };
        self.send_srv_rsp(k, &rsp)
    }

    /// Routes a peer request for an attribute value.
    fn srv_attr_req(&mut self, k: Key, req: PeerReq) {
        let op = req.opcode();
        let Some(hdl) = req.handle() else { return };
        let Some(s) = self.dir.find_owner(hdl) else {
            return self.reject(k, op, Some(hdl), ErrorCode::InvalidHandle);
        };
        let (app, db) = (s.app, Arc::clone(&s.db));
        let Some(at) = db.get(hdl) else {
            return self.reject(k, op, Some(hdl), ErrorCode::InvalidHandle);
        };
        let read = matches!(req, PeerReq::Read { .. } | PeerReq::ReadBlob { .. });
        if read && !at.perms().readable() {
            return self.reject(k, op, Some(hdl), ErrorCode::ReadNotPermitted);
        }
        if !read && (at.is_decl() || !at.perms().writable()) {
            return self.reject(k, op, Some(hdl), ErrorCode::WriteNotPermitted);
        }
        if let Some(v) = at.value() {
            return self.srv_read_value(k, &req, v);
        }
        if app == AppId::BUILTIN {
            return self.builtin_req(k, at.typ(), req);
        }
        let Some(cb) = self.callbacks(app) else {
            return self.reject(k, op, Some(hdl), ErrorCode::UnlikelyError);
        };
        let Some(t) = self.tcbs.get_mut(k) else { return };
        let trans = t.next_trans();
        if let PeerReq::PrepareWrite { .. } = req {
            if let Some(n) = t.prep_cnt.get_mut(usize::from(app.raw())) {
                *n = n.saturating_add(1);
            }
        }
        if !op.is_cmd() {
            t.srv_req = Some(SrvReq {
                trans,
                app,
                req: req.clone(),
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        cb.on_request(ConnId::new(k.idx() as u8, app), trans, &req);
    }

    /// Answers a read of a GATT profile declaration.
    fn srv_read_value(&mut self, k: Key, req: &PeerReq, v: &[u8]) {
        let max = self.tcbs.get(k).map_or(usize::from(MIN_MTU), |t| usize::from(t.mtu)) - 1;
        let rsp = match *req {
            PeerReq::Read { .. } => SrvRsp::Read(v[..v.len().min(max)].to_vec()),
            PeerReq::ReadBlob { hdl, off } => {
                let off = usize::from(off);
                if off > v.len() {
                    return self.reject(k, req.opcode(), Some(hdl), ErrorCode::InvalidOffset);
                }
                let v = &v[off..];
                SrvRsp::ReadBlob(v[..v.len().min(max)].to_vec())
            }
            _ => return self.reject(k, req.opcode(), req.handle(), ErrorCode::RequestNotSupported),
        };
        let _ = self.send_srv_rsp(k, &rsp);
    }

    /// Handles requests for attributes of the built-in GATT service. A write
    /// to the Service Changed CCCD subscribes or unsubscribes the peer.
    fn builtin_req(&mut self, k: Key, typ: crate::Uuid, req: PeerReq) {
        let Some(peer) = self.tcbs.get(k).map(|t| t.link.peer) else { return };
        let (op, hdl) = (req.opcode(), req.handle());
        if typ != CLIENT_CHAR_CONFIG {
            return self.reject(k, op, hdl, ErrorCode::RequestNotSupported);
        }
        match req {
            PeerReq::Read { .. } | PeerReq::ReadBlob { .. } => {
                let cfg = if self.srv_chg_clients().iter().any(|c| c.peer == peer) {
                    Cccd::INDICATE
                } else {
                    Cccd::empty()
                };
                self.srv_read_value(k, &req, &cfg.bits().to_le_bytes());
            }
            PeerReq::Write { ref val, .. } | PeerReq::WriteCmd { ref val, .. } => {
                let Ok(raw) = <[u8; 2]>::try_from(val.as_slice()) else {
                    return self.reject(k, op, hdl, ErrorCode::InvalidAttributeValueLength);
                };
                let cfg = Cccd::from_bits_truncate(u16::from_le_bytes(raw));
                if cfg.contains(Cccd::INDICATE) {
                    self.add_srv_chg_client(peer);
                } else {
                    self.remove_srv_chg_client(peer);
                }
                if op == Opcode::WriteReq {
                    let _ = self.send_srv_rsp(k, &SrvRsp::Write);
                }
            }
            _ => self.reject(k, op, hdl, ErrorCode::RequestNotSupported),
        }
    }

    /// Sends `ATT_ERROR_RSP`. Commands are dropped silently
    /// ([Vol 3] Part F, Section 3.4.5.3).
    fn reject(&mut self, k: Key, op: Opcode, hdl: Option<Handle>, err: ErrorCode) {
        if op.is_cmd() {
            debug!("Ignored {op} for {hdl:?} ({err})");
            return;
        }
        debug!("Rejecting {op} for {hdl:?} with {err}");
        let _ = self.send_srv_rsp(k, &SrvRsp::error(op, hdl, err));
    }

    /// Sends a server response to the peer.
    fn send_srv_rsp(&mut self, k: Key, rsp: &SrvRsp) -> Result<()> {
        let Some(link) = self.tcbs.get(k).map(|t| t.link) else {
            return Err(Error::NotFound);
        };
        self.bearer.send_rsp(link, rsp).map_err(|e| {
            warn!("Failed to send response to {link}: {e}");
            e
        })
    }
}
