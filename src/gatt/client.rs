use structbuf::Unpack;
use tracing::{debug, error, trace, warn};

use crate::att::{ErrorCode, Handle, HandleRange, Req, Rsp, MAX_VAL_LEN, MIN_MTU};
use crate::le::{Link, Transport};
use crate::uuid::Uuid16;
use crate::Uuid;

use super::slots::Key;
use super::tcb::Cmd;
use super::timer::Timer;
use super::*;

/// Discovery procedure ([Vol 3] Part G, Section 4.4 to 4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscType {
    /// Discover all primary services.
    PrimaryAll,
    /// Discover primary services by service UUID.
    PrimaryByUuid(Uuid),
    /// Find included services.
    Included,
    /// Discover all characteristics of a service.
    Characteristics,
    /// Discover characteristics by UUID.
    CharacteristicsByUuid(Uuid),
    /// Discover all characteristic descriptors.
    Descriptors,
}

/// Item found by a discovery procedure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DiscResult {
    Service {
        range: HandleRange,
        uuid: Uuid,
    },
    /// Include declaration. The UUID of an included service that only has a
    /// 128-bit form is not part of the declaration value and is reported as
    /// [`None`].
    Include {
        hdl: Handle,
        range: HandleRange,
        uuid: Option<Uuid>,
    },
    Characteristic {
        hdl: Handle,
        props: Prop,
        vhdl: Handle,
        uuid: Uuid,
    },
    Descriptor {
        hdl: Handle,
        uuid: Uuid,
    },
}

/// Read procedure ([Vol 3] Part G, Section 4.8).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadType {
    /// Read a characteristic value. A value that fills the response is
    /// continued with `ATT_READ_BLOB_REQ` until the whole value is read.
    ByHandle(Handle),
    /// Read part of a long value starting at an offset.
    Blob { hdl: Handle, off: u16 },
    /// Read the first value of the specified type in a handle range.
    ByType { range: HandleRange, typ: Uuid },
    /// Read multiple values at once.
    Multiple(Vec<Handle>),
}

/// Write procedure ([Vol 3] Part G, Section 4.9).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteType {
    /// Write without response. The operation completes once the command is
    /// sent.
    NoRsp,
    /// Write with response. Values that do not fit in one request are written
    /// with prepare and execute write requests.
    Request,
    /// Single prepare write of a reliable write. The echoed value is
    /// returned.
    Prepare { off: u16 },
}

/// Client operation kind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
    Discover,
    Read,
    Write,
    ExecuteWrite,
    ConfigureMtu,
}

/// Payload of a completed client operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OpData {
    /// Value read from the peer or echoed by a prepare write.
    Value {
        hdl: Option<Handle>,
        off: u16,
        val: Vec<u8>,
    },
    /// Negotiated `ATT_MTU`.
    Mtu(u16),
    /// Value written to the attribute.
    Written(Handle),
}

/// Operation state.
#[derive(Clone, Debug)]
enum Op {
    Discover {
        typ: DiscType,
        /// Remaining handle range.
        range: HandleRange,
    },
    Read {
        typ: ReadType,
        buf: Vec<u8>,
    },
    Write {
        typ: WriteType,
        hdl: Handle,
        val: Vec<u8>,
        /// Number of bytes confirmed by the peer.
        done: usize,
        /// Final status once queued writes are canceled.
        cancel: Option<Status>,
    },
    ExecuteWrite(bool),
    ConfigureMtu(u16),
}

impl Op {
    const fn kind(&self) -> OpKind {
        match *self {
            Self::Discover { .. } => OpKind::Discover,
            Self::Read { .. } => OpKind::Read,
            Self::Write { .. } => OpKind::Write,
            Self::ExecuteWrite(_) => OpKind::ExecuteWrite,
            Self::ConfigureMtu(_) => OpKind::ConfigureMtu,
        }
    }

    /// Returns the first request of the operation.
    fn first_req(&self, mtu: u16) -> Req {
        match *self {
            Self::Discover { typ, range } => disc_req(typ, range),
            Self::Read { ref typ, .. } => match *typ {
                ReadType::ByHandle(hdl) => Req::Read { hdl },
                ReadType::Blob { hdl, off } => Req::ReadBlob { hdl, off },
                ReadType::ByType { range, typ } => Req::ReadByType { range, typ },
                ReadType::Multiple(ref hdls) => Req::ReadMultiple { hdls: hdls.clone() },
            },
            Self::Write {
                typ, hdl, ref val, ..
            } => match typ {
                WriteType::NoRsp => Req::WriteCmd {
                    hdl,
                    val: val.clone(),
                },
                WriteType::Request if val.len() <= usize::from(mtu) - 3 => Req::Write {
                    hdl,
                    val: val.clone(),
                },
                WriteType::Request => Req::PrepareWrite {
                    hdl,
                    off: 0,
                    val: prep_chunk(val, 0, mtu).to_vec(),
                },
                WriteType::Prepare { off } => Req::PrepareWrite {
                    hdl,
                    off,
                    val: val.clone(),
                },
            },
            Self::ExecuteWrite(execute) => Req::ExecuteWrite { execute },
            Self::ConfigureMtu(mtu) => Req::ExchangeMtu { mtu },
        }
    }
}

/// Client operation control block.
#[derive(Debug)]
pub(super) struct Clcb {
    pub conn: ConnId,
    pub tcb: Key,
    op: Op,
    pub timer: Timer,
    retries: u8,
}

/// Next step of an operation after a response.
enum Next {
    Done(Status, Option<OpData>),
    Send(Req),
    /// Cancel queued prepared writes and complete with the status.
    Cancel(Status),
}

impl Gatt {
    /// Starts a discovery procedure within `range`. Results are reported via
    /// [`Callbacks::on_discovery_result`] followed by one
    /// [`Callbacks::on_discovery_complete`].
    pub fn discover(&mut self, conn: ConnId, typ: DiscType, range: HandleRange) -> Result<()> {
        self.issue(conn, Op::Discover { typ, range })
    }

    /// Starts a read procedure.
    pub fn read(&mut self, conn: ConnId, typ: ReadType) -> Result<()> {
        if let ReadType::Multiple(ref hdls) = typ {
            if hdls.len() < 2 {
                return Err(Error::IllegalParameter);
            }
        }
        self.issue(
            conn,
            Op::Read {
                typ,
                buf: Vec::new(),
            },
        )
    }

    /// Starts a write procedure.
    pub fn write(&mut self, conn: ConnId, typ: WriteType, hdl: Handle, val: Vec<u8>) -> Result<()> {
        let mtu = usize::from(self.mtu(conn).ok_or(Error::IllegalParameter)?);
        let max = match typ {
            WriteType::NoRsp => mtu - 3,
            WriteType::Request => MAX_VAL_LEN,
            WriteType::Prepare { .. } => mtu - 5,
        };
        if val.len() > max {
            return Err(Error::IllegalParameter);
        }
        self.issue(
            conn,
            Op::Write {
                typ,
                hdl,
                val,
                done: 0,
                cancel: None,
            },
        )
    }

    /// Executes or cancels all prepared writes on the peer.
    pub fn execute_write(&mut self, conn: ConnId, execute: bool) -> Result<()> {
        self.issue(conn, Op::ExecuteWrite(execute))
    }

    /// Exchanges `ATT_MTU` with the peer ([Vol 3] Part G, Section 4.3.1).
    /// Only valid on LE links.
    pub fn configure_mtu(&mut self, conn: ConnId, mtu: u16) -> Result<()> {
        let k = self.tcb_by_conn(conn).ok_or(Error::IllegalParameter)?;
        let le = (self.tcbs.get(k)).map_or(false, |t| t.link.transport == Transport::Le);
        if !le || mtu < MIN_MTU {
            return Err(Error::IllegalParameter);
        }
        self.issue(conn, Op::ConfigureMtu(mtu.min(self.cfg.max_mtu)))
    }

    /// Resumes client operations that were waiting for a security procedure
    /// on `link`.
    pub fn on_security_complete(&mut self, link: Link, granted: bool) {
        let Some(tk) = self.tcb_by_link(link) else {
            warn!("Security completion for unknown link {link}");
            return;
        };
        let pending: Vec<Key> =
            (self.tcbs.get_mut(tk)).map_or_else(Vec::new, |t| t.pending_sec.drain(..).collect());
        debug!("Security {} for {link} ({} pending)", if granted { "granted" } else { "denied" }, pending.len());
        for c in pending {
            if granted {
                self.clcb_start(c);
            } else {
                self.end_op(c, Status::Att(ErrorCode::InsufficientAuthentication), None);
            }
        }
    }

    /// Handles a response received from the peer server. The response is
    /// matched against the request at the head of the link's queue.
    pub fn on_response(&mut self, link: Link, rsp: Rsp) {
        let Some(tk) = self.tcb_by_link(link) else {
            warn!("{} from unknown link {link}", rsp.opcode());
            return;
        };
        let Some(t) = self.tcbs.get_mut(tk) else { return };
        let matched = (t.cmd_q.front()).map_or(false, |c| c.sent && rsp.answers(c.req.opcode()));
        if !matched {
            warn!("Unexpected {} from {link}", rsp.opcode());
            return;
        }
        let Some(cmd) = t.cmd_q.pop_front() else { return };
        trace!("{} from {link}", rsp.opcode());
        match cmd.clcb {
            Some(c) => {
                if let Some(cl) = self.clcbs.get_mut(c) {
                    cl.timer.stop();
                }
                self.process_rsp(c, cmd.req, rsp);
            }
            None => debug!("Dropped response to abandoned {}", cmd.req.opcode()),
        }
        self.send_next(tk);
    }

    /// Handles an expired response timer. Primary service discovery is
    /// retried. Any other timeout ends the operation and the link.
    pub(super) fn rsp_timeout(&mut self, c: Key) {
        let limit = self.cfg.disc_retry_limit;
        let Some(cl) = self.clcbs.get_mut(c) else { return };
        let (conn, tk) = (cl.conn, cl.tcb);
        let retry = matches!(
            cl.op,
            Op::Discover {
                typ: DiscType::PrimaryAll,
                ..
            }
        ) && cl.retries < limit;
        if retry {
            cl.retries += 1;
            cl.timer.start(self.cfg.rsp_timeout);
            warn!("Retrying primary service discovery on {conn} ({})", cl.retries);
            let Some(t) = self.tcbs.get(tk) else { return };
            if let Some(cmd) = (t.cmd_q.front()).filter(|cmd| cmd.sent && cmd.clcb == Some(c)) {
                if let Err(e) = self.bearer.send_req(t.link, &cmd.req) {
                    warn!("Failed to resend {}: {e}", cmd.req.opcode());
                }
            }
            return;
        }
        error!("Response timeout on {conn}");
        self.end_op(c, Status::Error, None);
        self.force_disconnect(tk, Reason::TIMEOUT);
    }

    /// Releases an operation and invokes exactly one completion callback.
    pub(super) fn end_op(&mut self, c: Key, status: Status, data: Option<OpData>) {
        let Some(cl) = self.free_clcb(c) else { return };
        debug!("{:?} on {} ended: {status}", cl.op.kind(), cl.conn);
        if let Some(cb) = self.callbacks(cl.conn.app()) {
            match cl.op {
                Op::Discover { typ, .. } => cb.on_discovery_complete(cl.conn, typ, status),
                ref op => cb.on_op_complete(cl.conn, op.kind(), status, data),
            }
        }
        if (self.tcbs.get(cl.tcb)).map_or(false, |t| t.release_when_idle) {
            self.check_idle(cl.tcb);
        }
    }

    /// Releases an operation without callbacks. Its unsent requests are
    /// removed from the link queue. A request that was already sent stays at
    /// the head until the peer responds.
    pub(super) fn free_clcb(&mut self, c: Key) -> Option<Clcb> {
        let cl = self.clcbs.remove(c)?;
        if let Some(t) = self.tcbs.get_mut(cl.tcb) {
            t.cmd_q.retain_mut(|cmd| {
                if cmd.clcb != Some(c) {
                    return true;
                }
                cmd.clcb = None;
                cmd.sent
            });
            t.pending_sec.retain(|&k| k != c);
        }
        self.send_next(cl.tcb);
        Some(cl)
    }

    /// Allocates and starts a client operation.
    fn issue(&mut self, conn: ConnId, op: Op) -> Result<()> {
        let tk = self.tcb_by_conn(conn).ok_or(Error::IllegalParameter)?;
        let t = self.tcbs.get(tk).ok_or(Error::IllegalParameter)?;
        if !t.is_connected() || self.apps.get(conn.app()).is_none() {
            return Err(Error::IllegalParameter);
        }
        if self.clcbs.iter().any(|(_, c)| c.conn == conn) {
            return Err(Error::Busy);
        }
        if t.cmd_q.len() >= self.cfg.max_queued_cmds {
            return Err(Error::NoResources);
        }
        let link = t.link;
        let kind = op.kind();
        let c = (self.clcbs.insert_with(|_| Clcb {
            conn,
            tcb: tk,
            op,
            timer: Timer::default(),
            retries: 0,
        }))
        .ok_or(Error::NoResources)?;
        debug!("{kind:?} started on {conn}");
        let chk = (self.security.as_mut()).map_or(SecCheck::Granted, |s| s.check(conn, link));
        match chk {
            SecCheck::Granted => self.clcb_start(c),
            SecCheck::Pending => {
                debug!("{kind:?} on {conn} waiting for security");
                if let Some(t) = self.tcbs.get_mut(tk) {
                    t.pending_sec.push_back(c);
                }
            }
            SecCheck::Denied => {
                self.end_op(c, Status::Att(ErrorCode::InsufficientAuthentication), None);
            }
        }
        Ok(())
    }

    /// Queues the first request of an operation.
    fn clcb_start(&mut self, c: Key) {
        let Some(cl) = self.clcbs.get(c) else { return };
        let mtu = self.tcbs.get(cl.tcb).map_or(MIN_MTU, |t| t.mtu);
        let req = cl.op.first_req(mtu);
        self.enqueue(c, req);
    }

    /// Appends a request to the link queue.
    fn enqueue(&mut self, c: Key, req: Req) {
        let Some(tk) = self.clcbs.get(c).map(|cl| cl.tcb) else { return };
        let max = self.cfg.max_queued_cmds;
        let Some(t) = self.tcbs.get_mut(tk) else {
            return self.end_op(c, Status::Error, None);
        };
        if t.cmd_q.len() >= max {
            warn!("Request queue of {} is full", t.link);
            return self.end_op(c, Status::Error, None);
        }
        t.cmd_q.push_back(Cmd {
            clcb: Some(c),
            req,
            sent: false,
        });
        self.send_next(tk);
    }

    /// Sends the request at the head of the link queue if it has not been
    /// sent yet. Commands do not wait for a response, so sending continues
    /// until a request is outstanding or the queue is empty.
    fn send_next(&mut self, tk: Key) {
        loop {
            let Some(t) = self.tcbs.get_mut(tk) else { return };
            if !t.is_connected() {
                return;
            }
            let Some(cmd) = t.cmd_q.front_mut() else { return };
            if cmd.sent {
                return;
            }
            let (op, clcb) = (cmd.req.opcode(), cmd.clcb);
            let r = self.bearer.send_req(t.link, &cmd.req);
            if r.is_ok() && op.rsp().is_some() {
                cmd.sent = true;
                trace!("Sent {op} to {}", t.link);
                let tmo = self.cfg.rsp_timeout;
                if let Some(cl) = clcb.and_then(|c| self.clcbs.get_mut(c)) {
                    cl.timer.start(tmo);
                }
                return;
            }
            t.cmd_q.pop_front();
            let Some(c) = clcb else { continue };
            match r {
                Ok(()) => {
                    let data = self.clcbs.get(c).and_then(Clcb::written);
                    self.end_op(c, Status::Success, data);
                }
                Err(e) => {
                    warn!("Failed to send {op}: {e}");
                    self.end_op(c, Status::Error, None);
                }
            }
        }
    }

    /// Advances an operation after a matching response.
    fn process_rsp(&mut self, c: Key, req: Req, rsp: Rsp) {
        let Some(cl) = self.clcbs.get(c) else { return };
        let tk = cl.tcb;
        let mtu = self.tcbs.get(tk).map_or(MIN_MTU, |t| t.mtu);
        let next = match cl.op.kind() {
            OpKind::Discover => return self.disc_rsp(c, rsp),
            OpKind::Read => self.read_rsp(c, mtu, rsp),
            OpKind::Write => self.write_rsp(c, mtu, req, rsp),
            OpKind::ExecuteWrite => match rsp {
                Rsp::ExecuteWrite => Next::Done(Status::Success, None),
                Rsp::Error { err, .. } => Next::Done(Status::Att(err), None),
                _ => Next::Done(Status::Error, None),
            },
            OpKind::ConfigureMtu => self.mtu_rsp(c, rsp),
        };
        self.advance(c, next);
    }

    fn advance(&mut self, c: Key, next: Next) {
        match next {
            Next::Done(st, data) => self.end_op(c, st, data),
            Next::Send(req) => self.enqueue(c, req),
            Next::Cancel(st) => {
                let op = self.clcbs.get_mut(c).map(|cl| &mut cl.op);
                if let Some(Op::Write { cancel, .. }) = op {
                    *cancel = Some(st);
                }
                self.enqueue(c, Req::ExecuteWrite { execute: false });
            }
        }
    }

    /// Reports discovered items and continues discovery after the last one.
    fn disc_rsp(&mut self, c: Key, rsp: Rsp) {
        let Some(cl) = self.clcbs.get(c) else { return };
        let Op::Discover { typ, range } = cl.op else { return };
        let conn = cl.conn;
        let mut found = Vec::new();
        let last = match rsp {
            Rsp::Error {
                err: ErrorCode::AttributeNotFound,
                ..
            } => None,
            Rsp::Error { err, .. } => return self.end_op(c, Status::Att(err), None),
            Rsp::ReadByGroupType(v) => {
                let last = v.last().map(|&(r, _)| r.end());
                for (r, val) in v {
                    match Uuid::try_from(val.as_slice()) {
                        Ok(uuid) => found.push(DiscResult::Service { range: r, uuid }),
                        Err(_) => warn!("Invalid service UUID at {:?}", r),
                    }
                }
                last
            }
            Rsp::FindByTypeValue(v) => {
                let DiscType::PrimaryByUuid(uuid) = typ else {
                    return self.end_op(c, Status::Error, None);
                };
                found.extend(v.iter().map(|&r| DiscResult::Service { range: r, uuid }));
                v.last().map(|r| r.end())
            }
            Rsp::ReadByType(v) => {
                let last = v.last().map(|&(h, _)| h);
                for (hdl, val) in v {
                    let r = match typ {
                        DiscType::Included => parse_include(hdl, &val),
                        DiscType::Characteristics => parse_char(hdl, &val),
                        DiscType::CharacteristicsByUuid(u) => parse_char(hdl, &val)
                            .filter(|r| matches!(*r, DiscResult::Characteristic { uuid, .. } if uuid == u)),
                        _ => None,
                    };
                    found.extend(r);
                }
                last
            }
            Rsp::FindInformation(v) => {
                found.extend(v.iter().map(|&(hdl, uuid)| DiscResult::Descriptor { hdl, uuid }));
                v.last().map(|&(h, _)| h)
            }
            rsp => {
                warn!("Unexpected {} during discovery", rsp.opcode());
                return self.end_op(c, Status::Error, None);
            }
        };
        if last.map_or(false, |h| h < range.start()) {
            warn!("Discovery response outside of {range:?}");
            return self.end_op(c, Status::Att(ErrorCode::InvalidPdu), None);
        }
        if let Some(cb) = self.callbacks(conn.app()) {
            for r in &found {
                cb.on_discovery_result(conn, typ, r);
            }
        }
        match last.and_then(|h| range.after(h)) {
            Some(next) => {
                let op = self.clcbs.get_mut(c).map(|cl| &mut cl.op);
                if let Some(Op::Discover { range, .. }) = op {
                    *range = next;
                }
                self.enqueue(c, disc_req(typ, next));
            }
            None => self.end_op(c, Status::Success, None),
        }
    }

    fn read_rsp(&mut self, c: Key, mtu: u16, rsp: Rsp) -> Next {
        let op = self.clcbs.get_mut(c).map(|cl| &mut cl.op);
        let Some(Op::Read { typ, buf }) = op else {
            return Next::Done(Status::Error, None);
        };
        let value = |hdl, off, val| Some(OpData::Value { hdl, off, val });
        match (&*typ, rsp) {
            (&ReadType::ByHandle(hdl), Rsp::Error { err, .. })
                if !buf.is_empty()
                    && matches!(err, ErrorCode::AttributeNotLong | ErrorCode::InvalidOffset) =>
            {
                Next::Done(Status::Success, value(Some(hdl), 0, std::mem::take(buf)))
            }
            (_, Rsp::Error { err, .. }) => Next::Done(Status::Att(err), None),
            (&ReadType::ByHandle(hdl), Rsp::Read(v) | Rsp::ReadBlob(v)) => {
                buf.extend_from_slice(&v);
                if v.len() == usize::from(mtu) - 1 && buf.len() < MAX_VAL_LEN {
                    #[allow(clippy::cast_possible_truncation)]
                    let off = buf.len() as u16;
                    return Next::Send(Req::ReadBlob { hdl, off });
                }
                buf.truncate(MAX_VAL_LEN);
                Next::Done(Status::Success, value(Some(hdl), 0, std::mem::take(buf)))
            }
            (&ReadType::Blob { hdl, off }, Rsp::ReadBlob(v)) => {
                Next::Done(Status::Success, value(Some(hdl), off, v))
            }
            (ReadType::ByType { .. }, Rsp::ReadByType(v)) => match v.into_iter().next() {
                Some((hdl, val)) => Next::Done(Status::Success, value(Some(hdl), 0, val)),
                None => Next::Done(Status::Att(ErrorCode::AttributeNotFound), None),
            },
            (ReadType::Multiple(_), Rsp::ReadMultiple(v)) => {
                Next::Done(Status::Success, value(None, 0, v))
            }
            (_, rsp) => {
                warn!("Unexpected {} during read", rsp.opcode());
                Next::Done(Status::Error, None)
            }
        }
    }

    fn write_rsp(&mut self, c: Key, mtu: u16, req: Req, rsp: Rsp) -> Next {
        let op = self.clcbs.get_mut(c).map(|cl| &mut cl.op);
        let Some(Op::Write {
            typ,
            hdl,
            val,
            done,
            cancel,
        }) = op
        else {
            return Next::Done(Status::Error, None);
        };
        let (typ, hdl) = (*typ, *hdl);
        match rsp {
            Rsp::Error { err, .. } if *done > 0 && cancel.is_none() => {
                Next::Cancel(Status::Att(err))
            }
            Rsp::Error { err, .. } => Next::Done(cancel.take().unwrap_or(Status::Att(err)), None),
            Rsp::Write => Next::Done(Status::Success, Some(OpData::Written(hdl))),
            Rsp::PrepareWrite {
                hdl: eh,
                off: eo,
                val: ev,
            } => {
                let Req::PrepareWrite { off, val: sent, .. } = req else {
                    return Next::Done(Status::Error, None);
                };
                if let WriteType::Prepare { .. } = typ {
                    return Next::Done(
                        Status::Success,
                        Some(OpData::Value {
                            hdl: Some(eh),
                            off: eo,
                            val: ev,
                        }),
                    );
                }
                if eh != hdl || eo != off || ev != sent {
                    warn!("Prepare write echo mismatch for {hdl}");
                    return Next::Cancel(Status::Error);
                }
                *done += sent.len();
                if *done < val.len() {
                    #[allow(clippy::cast_possible_truncation)]
                    return Next::Send(Req::PrepareWrite {
                        hdl,
                        off: *done as u16,
                        val: prep_chunk(val, *done, mtu).to_vec(),
                    });
                }
                Next::Send(Req::ExecuteWrite { execute: true })
            }
            Rsp::ExecuteWrite => match cancel.take() {
                Some(st) => Next::Done(st, None),
                None => Next::Done(Status::Success, Some(OpData::Written(hdl))),
            },
            rsp => {
                warn!("Unexpected {} during write", rsp.opcode());
                Next::Done(Status::Error, None)
            }
        }
    }

    fn mtu_rsp(&mut self, c: Key, rsp: Rsp) -> Next {
        let Some(cl) = self.clcbs.get(c) else {
            return Next::Done(Status::Error, None);
        };
        let (Op::ConfigureMtu(want), tk) = (&cl.op, cl.tcb) else {
            return Next::Done(Status::Error, None);
        };
        let want = *want;
        match rsp {
            Rsp::ExchangeMtu { mtu } => {
                let mtu = want.min(mtu).max(MIN_MTU);
                if let Some(t) = self.tcbs.get_mut(tk) {
                    t.mtu = mtu;
                    debug!("ATT_MTU for {} is {mtu}", t.link);
                }
                Next::Done(Status::Success, Some(OpData::Mtu(mtu)))
            }
            Rsp::Error { err, .. } => Next::Done(Status::Att(err), None),
            _ => Next::Done(Status::Error, None),
        }
    }
}

impl Clcb {
    /// Returns the completion payload of a write without response.
    fn written(&self) -> Option<OpData> {
        match self.op {
            Op::Write { hdl, .. } => Some(OpData::Written(hdl)),
            _ => None,
        }
    }
}

/// Returns the request for the next discovery step within `range`.
fn disc_req(typ: DiscType, range: HandleRange) -> Req {
    match typ {
        DiscType::PrimaryAll => Req::ReadByGroupType {
            range,
            typ: PRIMARY_SERVICE.as_uuid(),
        },
        DiscType::PrimaryByUuid(uuid) => Req::FindByTypeValue {
            range,
            typ: PRIMARY_SERVICE.as_uuid(),
            value: uuid.to_short_bytes(),
        },
        DiscType::Included => Req::ReadByType {
            range,
            typ: INCLUDE.as_uuid(),
        },
        DiscType::Characteristics | DiscType::CharacteristicsByUuid(_) => Req::ReadByType {
            range,
            typ: CHARACTERISTIC.as_uuid(),
        },
        DiscType::Descriptors => Req::FindInformation { range },
    }
}

/// Returns the part of `val` sent by the prepare write at offset `off`.
#[inline]
fn prep_chunk(val: &[u8], off: usize, mtu: u16) -> &[u8] {
    let n = usize::from(mtu) - 5;
    &val[off.min(val.len())..(off + n).min(val.len())]
}

/// Parses an include declaration value ([Vol 3] Part G, Section 3.2).
fn parse_include(hdl: Handle, val: &[u8]) -> Option<DiscResult> {
    if val.len() != 4 && val.len() != 6 {
        return None;
    }
    let mut p = val.unpack();
    let range = HandleRange::try_new(p.u16(), p.u16())?;
    let uuid = (val.len() == 6)
        .then(|| Uuid16::new(p.u16()).map(Uuid16::as_uuid))
        .flatten();
    Some(DiscResult::Include { hdl, range, uuid })
}

/// Parses a characteristic declaration value ([Vol 3] Part G, Section 3.3.1).
fn parse_char(hdl: Handle, val: &[u8]) -> Option<DiscResult> {
    if val.len() < 5 {
        return None;
    }
    let mut p = val.unpack();
    let props = Prop::from_bits_truncate(p.u8());
    let vhdl = Handle::new(p.u16())?;
    let uuid = Uuid::try_from(p.as_ref()).ok()?;
    Some(DiscResult::Characteristic {
        hdl,
        props,
        vhdl,
        uuid,
    })
}
