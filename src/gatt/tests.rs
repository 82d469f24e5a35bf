use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use matches::assert_matches;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::att::{ErrorCode, Handle, HandleRange, Opcode, PeerReq, Req, Rsp, SrvRsp};
use crate::le::{Addr, Link, RawAddr};
use crate::uuid::uuid16;
use crate::Uuid;

use super::*;

/// Shared append-only record.
#[derive(Debug)]
struct Log<T>(Arc<Mutex<Vec<T>>>);

impl<T> Clone for Log<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Log<T> {
    fn default() -> Self {
        Self(Arc::default())
    }
}

impl<T> Log<T> {
    fn push(&self, v: T) {
        self.0.lock().push(v);
    }

    fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.lock())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Tx {
    Req(Link, Req),
    Rsp(Link, SrvRsp),
    Ntf(Link, Handle, Vec<u8>),
    Ind(Link, Handle, Vec<u8>),
    Cfm(Link),
    Connect(Link),
    CancelConnect(Link),
    Disconnect(Link, Reason),
    Bg(Addr, bool),
}

/// Bearer that records transmitted PDUs. The second field is the number of
/// upcoming requests or indications that fail to send.
struct MockBearer(Log<Tx>, Arc<AtomicUsize>);

impl MockBearer {
    fn new(tx: Log<Tx>) -> Box<Self> {
        Box::new(Self(tx, Arc::default()))
    }

    fn fail(&self) -> Result<()> {
        let n = self.1.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        n.map_or(Ok(()), |_| Err(Error::Link))
    }
}

impl Bearer for MockBearer {
    fn send_req(&mut self, link: Link, req: &Req) -> Result<()> {
        self.fail()?;
        self.0.push(Tx::Req(link, req.clone()));
        Ok(())
    }

    fn send_rsp(&mut self, link: Link, rsp: &SrvRsp) -> Result<()> {
        self.0.push(Tx::Rsp(link, rsp.clone()));
        Ok(())
    }

    fn send_ntf(&mut self, link: Link, hdl: Handle, val: &[u8]) -> Result<()> {
        self.0.push(Tx::Ntf(link, hdl, val.to_vec()));
        Ok(())
    }

    fn send_ind(&mut self, link: Link, hdl: Handle, val: &[u8]) -> Result<()> {
        self.fail()?;
        self.0.push(Tx::Ind(link, hdl, val.to_vec()));
        Ok(())
    }

    fn send_cfm(&mut self, link: Link) -> Result<()> {
        self.0.push(Tx::Cfm(link));
        Ok(())
    }

    fn connect(&mut self, link: Link) -> Result<()> {
        self.0.push(Tx::Connect(link));
        Ok(())
    }

    fn cancel_connect(&mut self, link: Link) -> Result<()> {
        self.0.push(Tx::CancelConnect(link));
        Ok(())
    }

    fn disconnect(&mut self, link: Link, reason: Reason) -> Result<()> {
        self.0.push(Tx::Disconnect(link, reason));
        Ok(())
    }

    fn background_connect(&mut self, peer: Addr, enable: bool) -> Result<()> {
        self.0.push(Tx::Bg(peer, enable));
        Ok(())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Cb {
    Conn(ConnId, bool),
    Done(ConnId, OpKind, Status, Option<OpData>),
    Found(ConnId, DiscResult),
    DiscDone(ConnId, Status),
    Req(ConnId, TransId, PeerReq),
    Value(ConnId, Handle, Vec<u8>, bool),
    Confirmed(ConnId, Handle, Status),
}

struct Recorder(Log<Cb>);

impl Callbacks for Recorder {
    fn on_connection(&self, conn: ConnId, _: Link, connected: bool, _: Reason) {
        self.0.push(Cb::Conn(conn, connected));
    }

    fn on_op_complete(&self, conn: ConnId, op: OpKind, status: Status, data: Option<OpData>) {
        self.0.push(Cb::Done(conn, op, status, data));
    }

    fn on_discovery_result(&self, conn: ConnId, _: DiscType, r: &DiscResult) {
        self.0.push(Cb::Found(conn, *r));
    }

    fn on_discovery_complete(&self, conn: ConnId, _: DiscType, status: Status) {
        self.0.push(Cb::DiscDone(conn, status));
    }

    fn on_request(&self, conn: ConnId, trans: TransId, req: &PeerReq) {
        self.0.push(Cb::Req(conn, trans, req.clone()));
    }

    fn on_value(&self, conn: ConnId, hdl: Handle, val: &[u8], ind: bool) {
        self.0.push(Cb::Value(conn, hdl, val.to_vec(), ind));
    }

    fn on_indication_confirmed(&self, conn: ConnId, hdl: Handle, status: Status) {
        self.0.push(Cb::Confirmed(conn, hdl, status));
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Persist {
    Range(bool, HandleRange),
    Client(SrvChgCmd, SrvChgClient),
    SdpAdd(HandleRange),
    SdpDel(u32),
}

struct MockStore(Log<Persist>, Vec<SrvChgClient>);

impl Store for MockStore {
    fn handle_range_changed(&mut self, added: bool, r: &ServiceRange) {
        self.0.push(Persist::Range(added, r.range));
    }

    fn srv_chg_client_updated(&mut self, cmd: SrvChgCmd, c: &SrvChgClient) {
        self.0.push(Persist::Client(cmd, *c));
    }

    fn load_srv_chg_clients(&mut self) -> Vec<SrvChgClient> {
        std::mem::take(&mut self.1)
    }
}

struct MockSdp(Log<Persist>, u32);

impl Sdp for MockSdp {
    fn create_record(&mut self, _: Uuid, range: HandleRange) -> Option<u32> {
        self.0.push(Persist::SdpAdd(range));
        self.1 += 1;
        Some(self.1)
    }

    fn delete_record(&mut self, rec: u32) {
        self.0.push(Persist::SdpDel(rec));
    }
}

struct MockSecurity(SecCheck);

impl Security for MockSecurity {
    fn check(&mut self, _: ConnId, _: Link) -> SecCheck {
        self.0
    }
}

struct Harness {
    g: Gatt,
    tx: Log<Tx>,
    db: Log<Persist>,
    fail: Arc<AtomicUsize>,
}

impl Harness {
    fn new(cfg: Config) -> Self {
        Self::with_clients(cfg, Vec::new())
    }

    fn with_clients(cfg: Config, clients: Vec<SrvChgClient>) -> Self {
        let (tx, db) = (Log::default(), Log::default());
        let b = MockBearer::new(tx.clone());
        let fail = Arc::clone(&b.1);
        let g = Gatt::new(cfg, b)
            .with_store(Box::new(MockStore(db.clone(), clients)))
            .with_sdp(Box::new(MockSdp(db.clone(), 0)));
        Self { g, tx, db, fail }
    }

    /// Makes the next `n` requests or indications fail to send.
    fn fail_sends(&self, n: usize) {
        self.fail.store(n, Ordering::Relaxed);
    }

    fn app(&mut self, id: u16) -> (AppId, Log<Cb>) {
        let log = Log::default();
        let app = (self.g.register(uuid16(id).as_uuid(), Arc::new(Recorder(log.clone())))).unwrap();
        (app, log)
    }

    /// Brings a link up and returns the connection identifier of `app`.
    fn link_up(&mut self, app: AppId, link: Link) -> ConnId {
        self.g.on_link_up(link).unwrap();
        self.g.conn_id(app, link).unwrap()
    }

    /// Adds a primary service with one characteristic and returns the
    /// characteristic value handle.
    fn battery(&mut self, app: AppId) -> Handle {
        let hdls = (self.g.add_service(
            app,
            &[
                Element::primary(uuid16(0x180F)),
                Element::characteristic(
                    uuid16(0x2A19),
                    Prop::READ | Prop::WRITE | Prop::NOTIFY | Prop::INDICATE,
                    Perms::READ | Perms::WRITE,
                ),
            ],
        ))
        .unwrap();
        hdls[1]
    }
}

fn peer(n: u8) -> Link {
    Link::le(Addr::Public(RawAddr::from_le_bytes([n, 0, 0, 0, 0, 0])))
}

fn h(v: u16) -> Handle {
    Handle::new(v).unwrap()
}

fn range(start: u16, end: u16) -> HandleRange {
    HandleRange::try_new(start, end).unwrap()
}

fn later(secs: u64) -> Instant {
    Instant::now() + Duration::from_secs(secs)
}

#[test]
fn builtin_service() {
    let t = Harness::new(Config::default());
    let svcs: Vec<_> = t.g.services().copied().collect();
    assert_eq!(svcs.len(), 1);
    assert_eq!(svcs[0].range, range(1, 4));
    assert!(svcs[0].is_system());
    let types: Vec<_> = t.g.attributes().map(Attr::typ).collect();
    assert_eq!(
        types,
        [
            PRIMARY_SERVICE.as_uuid(),
            CHARACTERISTIC.as_uuid(),
            SERVICE_CHANGED.as_uuid(),
            CLIENT_CHAR_CONFIG.as_uuid(),
        ]
    );
    // Added before the store and SDP publisher were attached
    assert!(t.db.take().is_empty());
}

#[test]
fn add_service_handles() {
    let mut t = Harness::new(Config {
        app_start: 0x0040,
        ..Config::default()
    });
    t.db.take();
    let (app, _) = t.app(0xA001);
    let hdls = (t.g.add_service(
        app,
        &[
            Element::primary(uuid16(0x180D)),
            Element::characteristic(uuid16(0x2A37), Prop::NOTIFY, Perms::empty()),
            Element::characteristic(uuid16(0x2A38), Prop::READ, Perms::READ),
        ],
    ))
    .unwrap();
    assert_eq!(hdls, [h(0x40), h(0x42), h(0x44)]);
    let svc = *t.g.services().next().unwrap();
    assert_eq!(svc.range, range(0x40, 0x44));
    assert_eq!(svc.app, uuid16(0xA001).as_uuid());
    assert_eq!(
        t.db.take(),
        [
            Persist::Range(true, range(0x40, 0x44)),
            Persist::SdpAdd(range(0x40, 0x44)),
        ]
    );

    // Nested service and reserved attribute types
    let bad = [Element::primary(uuid16(0x180A)), Element::primary(uuid16(0x180B))];
    assert_eq!(t.g.add_service(app, &bad), Err(Error::IllegalParameter));
    let bad = [
        Element::primary(uuid16(0x180A)),
        Element::descriptor(CHARACTERISTIC, Perms::READ),
    ];
    assert_eq!(t.g.add_service(app, &bad), Err(Error::Internal));
    let bad = [Element::primary(uuid16(0x180A)), Element::Include { start: h(0x100) }];
    assert_eq!(t.g.add_service(app, &bad), Err(Error::Internal));
    assert_eq!(t.g.services().count(), 2);

    // Duplicate system service
    let gatt = [Element::primary(GATT_SERVICE)];
    assert_eq!(t.g.add_service(app, &gatt), Err(Error::Internal));
}

#[test]
fn include_and_secondary() {
    let mut t = Harness::new(Config::default());
    let (app, _) = t.app(0xA001);
    let sec = (t.g.add_service(app, &[Element::secondary(uuid16(0x180A))])).unwrap()[0];
    assert_eq!(sec, h(0x28));
    // Secondary services are not started automatically
    assert!(t.g.attributes().all(|a| a.handle() < h(0x28)));
    t.g.start_service(app, sec).unwrap();
    assert_eq!(t.g.start_service(app, sec), Err(Error::Busy));

    let hdls = (t.g.add_service(
        app,
        &[Element::primary(uuid16(0x180F)), Element::Include { start: sec }],
    ))
    .unwrap();
    assert_eq!(hdls, [h(0x29), h(0x2A)]);
    let inc = t.g.attributes().find(|a| a.handle() == h(0x2A)).unwrap();
    assert_eq!(inc.typ(), INCLUDE.as_uuid());
    assert_eq!(inc.value(), Some(&[0x28, 0x00, 0x28, 0x00, 0x0A, 0x18][..]));

    t.g.stop_service(app, sec).unwrap();
    assert_eq!(t.g.stop_service(app, sec), Err(Error::NotFound));
    t.g.delete_service(app, None, sec).unwrap();
    assert_eq!(t.g.delete_service(app, None, sec), Err(Error::NotFound));
}

#[test]
fn register_limits() {
    let mut t = Harness::new(Config {
        max_apps: 2,
        ..Config::default()
    });
    let (a1, _) = t.app(0xA001);
    let (a2, _) = t.app(0xA002);
    assert_eq!((a1, a2), (AppId::new(1), AppId::new(2)));
    let cb = Arc::new(Recorder(Log::default()));
    assert_eq!(
        t.g.register(uuid16(0xA001).as_uuid(), cb.clone()),
        Err(Error::IllegalParameter)
    );
    assert_eq!(
        t.g.register(GATT_SERVICE.as_uuid(), cb.clone()),
        Err(Error::IllegalParameter)
    );
    assert_eq!(t.g.register(uuid16(0xA003).as_uuid(), cb.clone()), Err(Error::NoResources));
    t.g.deregister(a1).unwrap();
    assert_eq!(t.g.deregister(a1), Err(Error::NotFound));
    assert_eq!(t.g.deregister(AppId::BUILTIN), Err(Error::IllegalParameter));
    assert_eq!(t.g.register(uuid16(0xA003).as_uuid(), cb), Ok(a1));
}

#[test]
fn deregister_releases_services() {
    let mut t = Harness::new(Config::default());
    let (a1, _) = t.app(0xA001);
    let (a2, _) = t.app(0xA002);
    t.battery(a1);
    let s2 = (t.g.add_service(a1, &[Element::primary(uuid16(0x180A))])).unwrap()[0];
    assert_eq!(s2, h(0x2B));
    t.db.take();

    t.g.deregister(a1).unwrap();
    let log = t.db.take();
    assert_eq!(log.iter().filter(|p| matches!(p, Persist::SdpDel(_))).count(), 2);
    assert_eq!(
        log.iter().filter(|p| matches!(p, Persist::Range(false, _))).count(),
        2
    );
    assert_eq!(t.g.services().count(), 1);
    assert!(t.g.attributes().all(|a| a.handle() <= h(4)));

    // The freed range is reused
    let s = (t.g.add_service(a2, &[Element::primary(uuid16(0x1810))])).unwrap()[0];
    assert_eq!(s, h(0x28));
}

#[test]
fn discovery() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    assert_eq!(cb.take(), [Cb::Conn(conn, true)]);

    t.g.discover(conn, DiscType::PrimaryAll, HandleRange::ALL).unwrap();
    assert_eq!(t.g.discover(conn, DiscType::PrimaryAll, HandleRange::ALL), Err(Error::Busy));
    assert_eq!(
        t.tx.take(),
        [Tx::Req(
            link,
            Req::ReadByGroupType {
                range: HandleRange::ALL,
                typ: PRIMARY_SERVICE.as_uuid()
            }
        )]
    );
    t.g.on_response(
        link,
        Rsp::ReadByGroupType(vec![
            (range(1, 4), vec![0x01, 0x18]),
            (range(0x10, 0x1F), vec![0x0F, 0x18]),
        ]),
    );
    assert_eq!(
        cb.take(),
        [
            Cb::Found(
                conn,
                DiscResult::Service {
                    range: range(1, 4),
                    uuid: GATT_SERVICE.as_uuid()
                }
            ),
            Cb::Found(
                conn,
                DiscResult::Service {
                    range: range(0x10, 0x1F),
                    uuid: uuid16(0x180F).as_uuid()
                }
            ),
        ]
    );
    assert_eq!(
        t.tx.take(),
        [Tx::Req(
            link,
            Req::ReadByGroupType {
                range: range(0x20, 0xFFFF),
                typ: PRIMARY_SERVICE.as_uuid()
            }
        )]
    );
    t.g.on_response(
        link,
        Rsp::Error {
            req: Opcode::ReadByGroupTypeReq,
            hdl: Some(h(0x20)),
            err: ErrorCode::AttributeNotFound,
        },
    );
    assert_eq!(cb.take(), [Cb::DiscDone(conn, Status::Success)]);
    assert!(t.tx.take().is_empty());

    // Characteristics
    t.g.discover(conn, DiscType::Characteristics, range(0x10, 0x1F)).unwrap();
    t.tx.take();
    t.g.on_response(
        link,
        Rsp::ReadByType(vec![(h(0x1F), vec![0x12, 0x1F, 0x00, 0x19, 0x2A])]),
    );
    assert_eq!(
        cb.take(),
        [
            Cb::Found(
                conn,
                DiscResult::Characteristic {
                    hdl: h(0x1F),
                    props: Prop::READ | Prop::NOTIFY,
                    vhdl: h(0x1F),
                    uuid: uuid16(0x2A19).as_uuid()
                }
            ),
            Cb::DiscDone(conn, Status::Success),
        ]
    );

    // Response below the requested range
    t.g.discover(conn, DiscType::Descriptors, range(0x10, 0x1F)).unwrap();
    t.g.on_response(
        link,
        Rsp::FindInformation(vec![(h(0x05), CLIENT_CHAR_CONFIG.as_uuid())]),
    );
    assert_eq!(cb.take(), [Cb::DiscDone(conn, Status::Att(ErrorCode::InvalidPdu))]);
}

#[test]
fn discovery_retry_and_timeout() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.g.discover(conn, DiscType::PrimaryAll, HandleRange::ALL).unwrap();
    let req = t.tx.take();
    assert_eq!(req.len(), 1);
    assert!(t.g.next_deadline().is_some());
    for _ in 0..t.g.config().disc_retry_limit {
        t.g.on_timer(later(31));
        assert_eq!(t.tx.take(), req);
        assert!(cb.take().is_empty());
    }
    t.g.on_timer(later(31));
    assert_eq!(cb.take(), [Cb::DiscDone(conn, Status::Error)]);
    assert_eq!(t.tx.take(), [Tx::Disconnect(link, Reason::TIMEOUT)]);

    t.g.on_link_down(link, Reason::TIMEOUT);
    assert_eq!(cb.take(), [Cb::Conn(conn, false)]);
    assert!(!t.g.is_connected(link));
    assert_eq!(t.g.next_deadline(), None);
}

#[test]
fn read_timeout_disconnects() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();
    t.g.read(conn, ReadType::ByHandle(h(3))).unwrap();
    t.tx.take();
    t.g.on_timer(later(31));
    assert_eq!(cb.take(), [Cb::Done(conn, OpKind::Read, Status::Error, None)]);
    assert_eq!(t.tx.take(), [Tx::Disconnect(link, Reason::TIMEOUT)]);
}

#[test]
fn serialized_requests() {
    let mut t = Harness::new(Config::default());
    let (a1, cb1) = t.app(0xA001);
    let (a2, cb2) = t.app(0xA002);
    let link = peer(1);
    let c1 = t.link_up(a1, link);
    let c2 = t.g.conn_id(a2, link).unwrap();
    cb1.take();
    cb2.take();

    t.g.read(c1, ReadType::ByHandle(h(3))).unwrap();
    t.g.read(c2, ReadType::ByHandle(h(5))).unwrap();
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::Read { hdl: h(3) })]);

    t.g.on_response(link, Rsp::Read(vec![1]));
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::Read { hdl: h(5) })]);
    let v = |hdl, val| Some(OpData::Value { hdl: Some(hdl), off: 0, val });
    assert_eq!(
        cb1.take(),
        [Cb::Done(c1, OpKind::Read, Status::Success, v(h(3), vec![1]))]
    );
    t.g.on_response(
        link,
        Rsp::Error {
            req: Opcode::ReadReq,
            hdl: Some(h(5)),
            err: ErrorCode::ReadNotPermitted,
        },
    );
    assert_eq!(
        cb2.take(),
        [Cb::Done(c2, OpKind::Read, Status::Att(ErrorCode::ReadNotPermitted), None)]
    );

    // Unsolicited response
    t.g.on_response(link, Rsp::Write);
    assert!(cb1.take().is_empty() && cb2.take().is_empty());

    assert_eq!(t.g.read(c1, ReadType::Multiple(vec![h(3)])), Err(Error::IllegalParameter));
    assert_eq!(
        t.g.read(ConnId::new(9, a1), ReadType::ByHandle(h(3))),
        Err(Error::IllegalParameter)
    );
}

#[test]
fn long_read() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.g.read(conn, ReadType::ByHandle(h(0x30))).unwrap();
    t.g.on_response(link, Rsp::Read(vec![0xAA; 22]));
    assert_eq!(
        t.tx.take(),
        [
            Tx::Req(link, Req::Read { hdl: h(0x30) }),
            Tx::Req(link, Req::ReadBlob { hdl: h(0x30), off: 22 }),
        ]
    );
    t.g.on_response(link, Rsp::ReadBlob(vec![0xBB; 5]));
    let mut val = vec![0xAA; 22];
    val.extend_from_slice(&[0xBB; 5]);
    assert_eq!(
        cb.take(),
        [Cb::Done(
            conn,
            OpKind::Read,
            Status::Success,
            Some(OpData::Value {
                hdl: Some(h(0x30)),
                off: 0,
                val
            })
        )]
    );

    // A value of exactly ATT_MTU-1 bytes ends with ATTRIBUTE_NOT_LONG
    t.g.read(conn, ReadType::ByHandle(h(0x30))).unwrap();
    t.g.on_response(link, Rsp::Read(vec![0xCC; 22]));
    t.g.on_response(
        link,
        Rsp::Error {
            req: Opcode::ReadBlobReq,
            hdl: Some(h(0x30)),
            err: ErrorCode::AttributeNotLong,
        },
    );
    assert_matches!(
        cb.take().as_slice(),
        [Cb::Done(_, OpKind::Read, Status::Success, Some(OpData::Value { val, .. }))] if val.len() == 22
    );
}

#[test]
fn long_write() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    let val: Vec<u8> = (0..30).collect();
    t.g.write(conn, WriteType::Request, h(0x30), val.clone()).unwrap();
    let first = Req::PrepareWrite {
        hdl: h(0x30),
        off: 0,
        val: val[..18].to_vec(),
    };
    assert_eq!(t.tx.take(), [Tx::Req(link, first)]);
    t.g.on_response(
        link,
        Rsp::PrepareWrite {
            hdl: h(0x30),
            off: 0,
            val: val[..18].to_vec(),
        },
    );
    let second = Req::PrepareWrite {
        hdl: h(0x30),
        off: 18,
        val: val[18..].to_vec(),
    };
    assert_eq!(t.tx.take(), [Tx::Req(link, second)]);
    t.g.on_response(
        link,
        Rsp::PrepareWrite {
            hdl: h(0x30),
            off: 18,
            val: val[18..].to_vec(),
        },
    );
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::ExecuteWrite { execute: true })]);
    t.g.on_response(link, Rsp::ExecuteWrite);
    assert_eq!(
        cb.take(),
        [Cb::Done(
            conn,
            OpKind::Write,
            Status::Success,
            Some(OpData::Written(h(0x30)))
        )]
    );

    // Echo mismatch cancels the prepared writes
    t.g.write(conn, WriteType::Request, h(0x30), val.clone()).unwrap();
    t.tx.take();
    t.g.on_response(
        link,
        Rsp::PrepareWrite {
            hdl: h(0x30),
            off: 0,
            val: vec![0xFF; 18],
        },
    );
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::ExecuteWrite { execute: false })]);
    t.g.on_response(link, Rsp::ExecuteWrite);
    assert_eq!(cb.take(), [Cb::Done(conn, OpKind::Write, Status::Error, None)]);

    // Length limits
    assert_eq!(
        t.g.write(conn, WriteType::NoRsp, h(0x30), vec![0; 21]),
        Err(Error::IllegalParameter)
    );
    assert_eq!(
        t.g.write(conn, WriteType::Request, h(0x30), vec![0; 513]),
        Err(Error::IllegalParameter)
    );

    // Write without response completes when sent
    t.g.write(conn, WriteType::NoRsp, h(0x30), vec![1, 2]).unwrap();
    assert_eq!(
        t.tx.take(),
        [Tx::Req(
            link,
            Req::WriteCmd {
                hdl: h(0x30),
                val: vec![1, 2]
            }
        )]
    );
    assert_eq!(
        cb.take(),
        [Cb::Done(
            conn,
            OpKind::Write,
            Status::Success,
            Some(OpData::Written(h(0x30)))
        )]
    );
}

#[test]
fn configure_mtu() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    assert_eq!(t.g.configure_mtu(conn, 22), Err(Error::IllegalParameter));
    t.g.configure_mtu(conn, 247).unwrap();
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::ExchangeMtu { mtu: 247 })]);
    t.g.on_response(link, Rsp::ExchangeMtu { mtu: 100 });
    assert_eq!(
        cb.take(),
        [Cb::Done(
            conn,
            OpKind::ConfigureMtu,
            Status::Success,
            Some(OpData::Mtu(100))
        )]
    );
    assert_eq!(t.g.mtu(conn), Some(100));

    let br = Link::new(peer(2).peer, crate::le::Transport::BrEdr);
    let conn = t.link_up(app, br);
    assert_eq!(t.g.configure_mtu(conn, 247), Err(Error::IllegalParameter));
}

#[test]
fn security_gates_operations() {
    let (tx, db) = (Log::default(), Log::<Persist>::default());
    let g = Gatt::new(Config::default(), MockBearer::new(tx.clone()))
        .with_security(Box::new(MockSecurity(SecCheck::Pending)));
    let mut t = Harness {
        g,
        tx,
        db,
        fail: Arc::default(),
    };
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.g.read(conn, ReadType::ByHandle(h(3))).unwrap();
    assert!(t.tx.take().is_empty());
    assert_eq!(t.g.read(conn, ReadType::ByHandle(h(3))), Err(Error::Busy));
    t.g.on_security_complete(link, true);
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::Read { hdl: h(3) })]);
    t.g.on_response(link, Rsp::Read(vec![]));
    cb.take();

    t.g.read(conn, ReadType::ByHandle(h(3))).unwrap();
    t.g.on_security_complete(link, false);
    assert!(t.tx.take().is_empty());
    assert_eq!(
        cb.take(),
        [Cb::Done(
            conn,
            OpKind::Read,
            Status::Att(ErrorCode::InsufficientAuthentication),
            None
        )]
    );
}

#[test]
fn link_down_ends_operations() {
    let mut t = Harness::new(Config::default());
    let (a1, cb1) = t.app(0xA001);
    let (a2, cb2) = t.app(0xA002);
    let link = peer(1);
    let c1 = t.link_up(a1, link);
    let c2 = t.g.conn_id(a2, link).unwrap();
    cb1.take();
    cb2.take();

    t.g.read(c1, ReadType::ByHandle(h(3))).unwrap();
    t.g.write(c2, WriteType::Request, h(5), vec![1]).unwrap();
    t.g.on_link_down(link, Reason::REMOTE_USER);
    assert_eq!(
        cb1.take(),
        [
            Cb::Done(c1, OpKind::Read, Status::Error, None),
            Cb::Conn(c1, false)
        ]
    );
    assert_eq!(
        cb2.take(),
        [
            Cb::Done(c2, OpKind::Write, Status::Error, None),
            Cb::Conn(c2, false)
        ]
    );
    assert_eq!(t.g.conn_id(a1, link), None);
    assert_eq!(t.g.read(c1, ReadType::ByHandle(h(3))), Err(Error::IllegalParameter));
    assert_eq!(t.g.next_deadline(), None);

    // Late response after the link is gone
    t.g.on_response(link, Rsp::Read(vec![]));
    assert!(cb1.take().is_empty());
}

#[test]
fn link_holds() {
    let holders = Log::default();
    let obs = holders.clone();
    let (tx, db) = (Log::default(), Log::<Persist>::default());
    let g = Gatt::new(Config::default(), MockBearer::new(tx.clone()))
        .with_link_observer(Box::new(move |l: Link, n: usize| obs.push((l, n))));
    let mut t = Harness {
        g,
        tx,
        db,
        fail: Arc::default(),
    };
    let (a1, cb1) = t.app(0xA001);
    let (a2, _) = t.app(0xA002);
    let link = peer(1);

    t.g.connect(a1, link, true).unwrap();
    t.g.connect(a2, link, true).unwrap();
    assert_eq!(t.tx.take(), [Tx::Connect(link)]);
    t.g.cancel_connect(a2, link, true).unwrap();
    assert!(t.tx.take().is_empty());
    let c1 = t.link_up(a1, link);
    assert_eq!(holders.take(), [(link, 1), (link, 2), (link, 1)]);
    cb1.take();

    // Disconnect is deferred while an operation is outstanding
    t.g.read(c1, ReadType::ByHandle(h(3))).unwrap();
    t.tx.take();
    t.g.disconnect(c1).unwrap();
    assert!(t.tx.take().is_empty());
    t.g.on_response(link, Rsp::Read(vec![]));
    assert_eq!(t.tx.take(), [Tx::Disconnect(link, Reason::LOCAL_HOST)]);
    t.g.on_link_down(link, Reason::LOCAL_HOST);
    assert_eq!(holders.take(), [(link, 0), (link, 0)]);
}

#[test]
fn background_connection() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    t.g.connect(app, link, false).unwrap();
    assert_eq!(t.tx.take(), [Tx::Bg(link.peer, true)]);
    let br = Link::new(link.peer, crate::le::Transport::BrEdr);
    assert_eq!(t.g.connect(app, br, false), Err(Error::IllegalParameter));

    let conn = t.link_up(app, link);
    assert_eq!(cb.take(), [Cb::Conn(conn, true)]);
    t.g.on_link_down(link, Reason::REMOTE_USER);
    assert_eq!(t.tx.take(), [Tx::Bg(link.peer, true)]);

    t.g.deregister(app).unwrap();
    assert_eq!(t.tx.take(), [Tx::Bg(link.peer, false)]);
    assert_eq!(t.g.cancel_connect(app, link, false), Err(Error::NotFound));
}

#[test]
fn indication_queue() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let vhdl = t.battery(app);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.g.indicate(conn, vhdl, vec![1]).unwrap();
    t.g.indicate(conn, vhdl, vec![2]).unwrap();
    assert_eq!(t.tx.take(), [Tx::Ind(link, vhdl, vec![1])]);
    assert_eq!(t.g.pending_indications(link), 1);

    t.g.on_confirmation(link);
    assert_eq!(cb.take(), [Cb::Confirmed(conn, vhdl, Status::Success)]);
    assert_eq!(t.g.pending_indications(link), 1);
    assert!(t.tx.take().is_empty());

    assert_eq!(t.g.send_pending_indication(link), Ok(true));
    assert_eq!(t.tx.take(), [Tx::Ind(link, vhdl, vec![2])]);
    assert_eq!(t.g.pending_indications(link), 0);
    assert_eq!(t.g.send_pending_indication(link), Ok(false));

    // Unconfirmed indication ends the link
    t.g.on_timer(later(31));
    assert_eq!(cb.take(), [Cb::Confirmed(conn, vhdl, Status::Error)]);
    assert_eq!(t.tx.take(), [Tx::Disconnect(link, Reason::TIMEOUT)]);
}

#[test]
fn indication_send_failure() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let vhdl = t.battery(app);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.fail_sends(1);
    assert_eq!(t.g.indicate(conn, vhdl, vec![0]), Err(Error::Link));
    assert_eq!(t.g.pending_indications(link), 0);

    t.g.indicate(conn, vhdl, vec![1]).unwrap();
    t.g.indicate(conn, vhdl, vec![2]).unwrap();
    t.g.on_confirmation(link);
    // Queued behind 2, which fails to send and stays queued
    t.fail_sends(1);
    t.g.indicate(conn, vhdl, vec![3]).unwrap();
    assert_eq!(t.tx.take(), [Tx::Ind(link, vhdl, vec![1])]);
    assert_eq!(t.g.pending_indications(link), 2);

    t.fail_sends(1);
    assert_eq!(t.g.send_pending_indication(link), Err(Error::Link));
    assert_eq!(t.g.pending_indications(link), 2);
    assert_eq!(t.g.send_pending_indication(link), Ok(true));
    assert_eq!(t.tx.take(), [Tx::Ind(link, vhdl, vec![2])]);
    t.g.on_confirmation(link);
    assert_eq!(t.g.send_pending_indication(link), Ok(true));
    assert_eq!(t.tx.take(), [Tx::Ind(link, vhdl, vec![3])]);
}

#[test]
fn deregister_with_active_indication() {
    let mut t = Harness::new(Config::default());
    let (a1, _) = t.app(0xA001);
    let vhdl = t.battery(a1);
    let link = peer(1);
    let conn = t.link_up(a1, link);
    t.g.indicate(conn, vhdl, vec![1]).unwrap();
    t.g.indicate(conn, vhdl, vec![2]).unwrap();
    t.tx.take();

    t.g.deregister(a1).unwrap();
    assert_eq!(t.g.pending_indications(link), 0);
    let (a2, cb2) = t.app(0xA002);
    assert_eq!(a1, a2);

    // The confirmation is consumed by the engine
    t.g.on_confirmation(link);
    assert!(cb2.take().is_empty());
    let vhdl = t.battery(a2);
    t.g.indicate(conn, vhdl, vec![3]).unwrap();
    assert_eq!(t.tx.take(), [Tx::Ind(link, vhdl, vec![3])]);
    t.g.on_confirmation(link);
    assert_eq!(cb2.take(), [Cb::Confirmed(conn, vhdl, Status::Success)]);
}

#[test]
fn deregister_releases_deferred_link() {
    let mut t = Harness::new(Config::default());
    let (a1, _) = t.app(0xA001);
    let (a2, _) = t.app(0xA002);
    let link = peer(1);
    t.g.connect(a1, link, true).unwrap();
    let c1 = t.link_up(a1, link);
    let c2 = t.g.conn_id(a2, link).unwrap();

    t.g.read(c2, ReadType::ByHandle(h(3))).unwrap();
    t.tx.take();
    t.g.disconnect(c1).unwrap();
    assert!(t.tx.take().is_empty());
    t.g.deregister(a2).unwrap();
    assert_eq!(t.tx.take(), [Tx::Disconnect(link, Reason::LOCAL_HOST)]);
    t.g.on_response(link, Rsp::Read(vec![]));
    assert!(t.tx.take().is_empty());
}

#[test]
fn request_send_failure() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.fail_sends(1);
    t.g.read(conn, ReadType::ByHandle(h(3))).unwrap();
    assert!(t.tx.take().is_empty());
    assert_eq!(cb.take(), [Cb::Done(conn, OpKind::Read, Status::Error, None)]);
    t.g.read(conn, ReadType::ByHandle(h(3))).unwrap();
    assert_eq!(t.tx.take(), [Tx::Req(link, Req::Read { hdl: h(3) })]);
}

#[test]
fn notify_checks() {
    let mut t = Harness::new(Config::default());
    let (a1, _) = t.app(0xA001);
    let (a2, _) = t.app(0xA002);
    let vhdl = t.battery(a1);
    let link = peer(1);
    let c1 = t.link_up(a1, link);
    let c2 = t.g.conn_id(a2, link).unwrap();

    t.g.notify(c1, vhdl, &[0x64]).unwrap();
    assert_eq!(t.tx.take(), [Tx::Ntf(link, vhdl, vec![0x64])]);
    assert_eq!(t.g.notify(c1, vhdl, &[0; 21]), Err(Error::IllegalParameter));
    assert_eq!(t.g.notify(c2, vhdl, &[0]), Err(Error::IllegalParameter));
    assert_eq!(t.g.indicate(c1, h(0x100), vec![0]), Err(Error::IllegalParameter));
    assert!(t.tx.take().is_empty());
}

#[test]
fn inbound_indication() {
    let mut t = Harness::new(Config::default());
    let (a1, cb1) = t.app(0xA001);
    let (a2, cb2) = t.app(0xA002);
    let link = peer(1);
    let c1 = t.link_up(a1, link);
    let c2 = t.g.conn_id(a2, link).unwrap();
    cb1.take();
    cb2.take();

    t.g.on_value(link, h(0x10), &[7], true);
    assert_eq!(cb1.take(), [Cb::Value(c1, h(0x10), vec![7], true)]);
    assert_eq!(cb2.take(), [Cb::Value(c2, h(0x10), vec![7], true)]);
    t.g.confirm(c1).unwrap();
    assert_eq!(t.g.confirm(c1), Err(Error::NotFound));
    assert!(t.tx.take().is_empty());
    t.g.confirm(c2).unwrap();
    assert_eq!(t.tx.take(), [Tx::Cfm(link)]);
    assert_eq!(t.g.confirm(c2), Err(Error::NotFound));

    // Applications that do not confirm are covered by the ack timer
    t.g.on_value(link, h(0x10), &[8], true);
    t.g.on_timer(later(6));
    assert_eq!(t.tx.take(), [Tx::Cfm(link)]);

    t.g.on_value(link, h(0x10), &[9], false);
    assert_eq!(cb1.take().len(), 2);
    assert!(t.tx.take().is_empty());
}

#[test]
fn deregister_confirms_inbound_indication() {
    let mut t = Harness::new(Config::default());
    let (a1, _) = t.app(0xA001);
    let (a2, _) = t.app(0xA002);
    let link = peer(1);
    let c1 = t.link_up(a1, link);

    t.g.on_value(link, h(0x10), &[7], true);
    t.g.confirm(c1).unwrap();
    assert!(t.tx.take().is_empty());
    t.g.deregister(a2).unwrap();
    assert_eq!(t.tx.take(), [Tx::Cfm(link)]);
    t.g.on_timer(later(6));
    assert!(t.tx.take().is_empty());
}

#[test]
fn server_requests() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let vhdl = t.battery(app);
    assert_eq!(vhdl, h(0x2A));
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.g.on_request(link, PeerReq::Read { hdl: vhdl });
    let [Cb::Req(c, trans, PeerReq::Read { .. })] = cb.take()[..] else {
        panic!("read not delivered");
    };
    assert_eq!(c, conn);
    // Only one request may be outstanding
    t.g.on_request(link, PeerReq::Read { hdl: vhdl });
    assert!(cb.take().is_empty());
    assert_eq!(
        t.g.send_response(conn, TransId(trans.raw() + 1), Ok(vec![])),
        Err(Error::NotFound)
    );
    t.g.send_response(conn, trans, Ok(vec![0x64])).unwrap();
    assert_eq!(t.tx.take(), [Tx::Rsp(link, SrvRsp::Read(vec![0x64]))]);

    // Declarations are answered by the engine
    t.g.on_request(link, PeerReq::Read { hdl: h(0x29) });
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(link, SrvRsp::Read(vec![0x3A, 0x2A, 0x00, 0x19, 0x2A]))]
    );
    t.g.on_request(
        link,
        PeerReq::Write {
            hdl: h(0x29),
            val: vec![0],
        },
    );
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(
            link,
            SrvRsp::error(Opcode::WriteReq, Some(h(0x29)), ErrorCode::WriteNotPermitted)
        )]
    );
    t.g.on_request(link, PeerReq::Read { hdl: h(0x100) });
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(
            link,
            SrvRsp::error(Opcode::ReadReq, Some(h(0x100)), ErrorCode::InvalidHandle)
        )]
    );
    t.g.on_request(link, PeerReq::Read { hdl: h(3) });
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(
            link,
            SrvRsp::error(Opcode::ReadReq, Some(h(3)), ErrorCode::ReadNotPermitted)
        )]
    );

    // Write commands are not tracked
    t.g.on_request(
        link,
        PeerReq::WriteCmd {
            hdl: vhdl,
            val: vec![1],
        },
    );
    assert_matches!(cb.take().as_slice(), [Cb::Req(_, _, PeerReq::WriteCmd { .. })]);
    t.g.on_request(link, PeerReq::Read { hdl: vhdl });
    assert_matches!(cb.take().as_slice(), [Cb::Req(_, _, PeerReq::Read { .. })]);
}

#[test]
fn server_execute_write() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let vhdl = t.battery(app);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    // Nothing prepared
    t.g.on_request(link, PeerReq::ExecuteWrite { execute: true });
    assert_eq!(t.tx.take(), [Tx::Rsp(link, SrvRsp::ExecuteWrite)]);
    assert!(cb.take().is_empty());

    let prep = PeerReq::PrepareWrite {
        hdl: vhdl,
        off: 0,
        val: vec![1, 2],
    };
    t.g.on_request(link, prep.clone());
    let [Cb::Req(_, trans, _)] = cb.take()[..] else {
        panic!("prepare write not delivered");
    };
    t.g.send_response(conn, trans, Ok(vec![])).unwrap();
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(
            link,
            SrvRsp::PrepareWrite {
                hdl: vhdl,
                off: 0,
                val: vec![1, 2]
            }
        )]
    );

    t.g.on_request(link, PeerReq::ExecuteWrite { execute: true });
    let [Cb::Req(_, trans, PeerReq::ExecuteWrite { execute: true })] = cb.take()[..] else {
        panic!("execute write not delivered");
    };
    assert!(t.tx.take().is_empty());
    t.g.send_response(conn, trans, Err(ErrorCode::InvalidAttributeValueLength)).unwrap();
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(
            link,
            SrvRsp::error(
                Opcode::ExecuteWriteReq,
                None,
                ErrorCode::InvalidAttributeValueLength
            )
        )]
    );
}

#[test]
fn deregister_during_execute_write() {
    let mut t = Harness::new(Config::default());
    let (app, cb) = t.app(0xA001);
    let vhdl = t.battery(app);
    let link = peer(1);
    let conn = t.link_up(app, link);
    cb.take();

    t.g.on_request(
        link,
        PeerReq::PrepareWrite {
            hdl: vhdl,
            off: 0,
            val: vec![1],
        },
    );
    let [Cb::Req(_, trans, _)] = cb.take()[..] else {
        panic!("prepare write not delivered");
    };
    t.g.send_response(conn, trans, Ok(vec![])).unwrap();
    t.tx.take();
    t.g.on_request(link, PeerReq::ExecuteWrite { execute: true });
    assert_matches!(
        cb.take().as_slice(),
        [Cb::Req(_, _, PeerReq::ExecuteWrite { execute: true })]
    );

    // The peer is answered on behalf of the departed application
    t.g.deregister(app).unwrap();
    assert_eq!(
        t.tx.take(),
        [Tx::Rsp(
            link,
            SrvRsp::error(Opcode::ExecuteWriteReq, None, ErrorCode::UnlikelyError)
        )]
    );
    t.g.on_request(link, PeerReq::Read { hdl: h(1) });
    assert_eq!(t.tx.take(), [Tx::Rsp(link, SrvRsp::Read(vec![0x01, 0x18]))]);
}

#[test]
fn server_exchange_mtu() {
    let mut t = Harness::new(Config::default());
    let (app, _) = t.app(0xA001);
    let link = peer(1);
    let conn = t.link_up(app, link);
    t.g.on_request(link, PeerReq::ExchangeMtu { mtu: 100 });
    assert_eq!(t.tx.take(), [Tx::Rsp(link, SrvRsp::ExchangeMtu { mtu: 517 })]);
    assert_eq!(t.g.mtu(conn), Some(100));
    t.g.on_request(link, PeerReq::ExchangeMtu { mtu: 10 });
    t.tx.take();
    assert_eq!(t.g.mtu(conn), Some(23));
}

#[test]
fn service_changed() {
    let mut t = Harness::new(Config::default());
    let (app, _) = t.app(0xA001);
    let link = peer(1);
    t.link_up(app, link);
    let (srv_chg, cccd) = (h(3), h(4));

    t.g.on_request(
        link,
        PeerReq::Write {
            hdl: cccd,
            val: vec![0x02, 0x00],
        },
    );
    assert_eq!(t.tx.take(), [Tx::Rsp(link, SrvRsp::Write)]);
    let client = SrvChgClient {
        peer: link.peer,
        pending: false,
    };
    assert_eq!(t.g.srv_chg_clients(), [client]);
    t.g.on_request(link, PeerReq::Read { hdl: cccd });
    assert_eq!(t.tx.take(), [Tx::Rsp(link, SrvRsp::Read(vec![0x02, 0x00]))]);
    t.db.take();

    // Adding a service indicates the change to connected clients
    t.battery(app);
    let val = vec![0x01, 0x00, 0xFF, 0xFF];
    assert_eq!(t.tx.take(), [Tx::Ind(link, srv_chg, val.clone())]);
    assert!(t.g.is_srv_chg_ind_pending(link));
    assert!(t.g.srv_chg_clients()[0].pending);
    t.g.on_confirmation(link);
    assert!(!t.g.is_srv_chg_ind_pending(link));
    assert!(!t.g.srv_chg_clients()[0].pending);
    let log = t.db.take();
    assert!(log.contains(&Persist::Client(SrvChgCmd::Update, client)));

    // Disconnected clients are indicated on reconnection
    t.g.on_link_down(link, Reason::REMOTE_USER);
    t.g.add_service(app, &[Element::primary(uuid16(0x180A))]).unwrap();
    assert!(t.g.srv_chg_clients()[0].pending);
    t.tx.take();
    t.link_up(app, link);
    assert_eq!(t.tx.take(), [Tx::Ind(link, srv_chg, val)]);

    t.g.on_request(
        link,
        PeerReq::Write {
            hdl: cccd,
            val: vec![0x00, 0x00],
        },
    );
    assert!(t.g.srv_chg_clients().is_empty());
    assert!(t
        .db
        .take()
        .contains(&Persist::Client(SrvChgCmd::Remove, SrvChgClient { pending: true, ..client })));
}

#[test]
fn saved_srv_chg_clients() {
    let link = peer(1);
    let saved = SrvChgClient {
        peer: link.peer,
        pending: true,
    };
    let mut t = Harness::with_clients(Config::default(), vec![saved]);
    let (app, _) = t.app(0xA001);
    assert_eq!(t.g.srv_chg_clients(), [saved]);
    t.link_up(app, link);
    assert_matches!(t.tx.take().as_slice(), [Tx::Ind(_, _, _)]);
}

#[tokio::test]
async fn event_loop() {
    let tx = Log::default();
    let g = Gatt::new(Config::default(), MockBearer::new(tx.clone()));
    let (el, ch) = EventLoop::spawn(g);
    let cb = Log::default();
    let rec = Arc::new(Recorder(cb.clone()));
    let app = (ch.call(move |g| g.register(uuid16(0xA001).as_uuid(), rec)).await)
        .unwrap()
        .unwrap();
    let link = peer(1);
    ch.send(Event::LinkUp(link)).await.unwrap();
    let conn = (ch.call(move |g| g.conn_id(app, link)).await).unwrap().unwrap();
    assert_eq!(cb.take(), [Cb::Conn(conn, true)]);

    (ch.call(move |g| g.read(conn, ReadType::ByHandle(h(3)))).await)
        .unwrap()
        .unwrap();
    ch.send(Event::Response(link, Rsp::Read(vec![5]))).await.unwrap();
    ch.send(Event::LinkDown(link, Reason::REMOTE_USER)).await.unwrap();
    ch.call(|_| ()).await.unwrap();

    let g = el.stop().await;
    assert!(!g.is_connected(link));
    assert_eq!(tx.take(), [Tx::Req(link, Req::Read { hdl: h(3) })]);
    assert_matches!(
        cb.take().as_slice(),
        [Cb::Done(_, OpKind::Read, Status::Success, _), Cb::Conn(_, false)]
    );
    assert_eq!(ch.send(Event::Confirmation(link)).await, Err(Error::NotFound));
}

#[tokio::test(start_paused = true)]
async fn event_loop_timeout() {
    let tx = Log::default();
    let g = Gatt::new(Config::default(), MockBearer::new(tx.clone()));
    let (el, ch) = EventLoop::spawn(g);
    let cb = Log::default();
    let rec = Arc::new(Recorder(cb.clone()));
    let app = (ch.call(move |g| g.register(uuid16(0xA001).as_uuid(), rec)).await)
        .unwrap()
        .unwrap();
    let link = peer(1);
    ch.send(Event::LinkUp(link)).await.unwrap();
    let conn = (ch.call(move |g| g.conn_id(app, link)).await).unwrap().unwrap();
    cb.take();

    (ch.call(move |g| g.read(conn, ReadType::ByHandle(h(3)))).await)
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_secs(29)).await;
    ch.call(|_| ()).await.unwrap();
    assert!(cb.take().is_empty());
    tokio::time::sleep(Duration::from_secs(2)).await;
    ch.call(|_| ()).await.unwrap();
    el.stop().await;
    assert_eq!(
        tx.take(),
        [
            Tx::Req(link, Req::Read { hdl: h(3) }),
            Tx::Disconnect(link, Reason::TIMEOUT)
        ]
    );
    assert_eq!(cb.take(), [Cb::Done(conn, OpKind::Read, Status::Error, None)]);
}
