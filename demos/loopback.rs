//! Two GATT engines connected back to back. The client discovers the
//! server's services, reads and writes a characteristic, exchanges MTU, and
//! receives an indication.

#![allow(unused_crate_dependencies)]

use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use burble_gatt::att::{ErrorCode, Handle, HandleRange, Opcode, PeerReq, Req, Rsp, SrvRsp};
use burble_gatt::gatt::*;
use burble_gatt::le::{Addr, Link, RawAddr};
use burble_gatt::Uuid16;

#[derive(Clone, Copy, Debug, clap::Parser)]
struct Args {
    /// ATT_MTU requested by the client.
    #[arg(short, long, default_value_t = 247)]
    mtu: u16,

    /// Length of the value written by the client.
    #[arg(short, long, default_value_t = 64)]
    len: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();
    let srv_addr = Addr::Public(RawAddr::from_le_bytes([1, 0, 0, 0, 0, 0]));
    let cli_addr = Addr::Random(RawAddr::from_le_bytes([2, 0, 0, 0, 0, 0xC0]));
    let (srv_link, cli_link) = (Link::le(cli_addr), Link::le(srv_addr));

    let (srv_ch, cli_ch) = (Arc::new(OnceLock::new()), Arc::new(OnceLock::new()));
    let srv = Gatt::new(
        Config::default(),
        Box::new(Loopback {
            remote: cli_link,
            own: Arc::clone(&srv_ch),
            peer: Arc::clone(&cli_ch),
        }),
    );
    let cli = Gatt::new(
        Config::default(),
        Box::new(Loopback {
            remote: srv_link,
            own: Arc::clone(&cli_ch),
            peer: Arc::clone(&srv_ch),
        }),
    );
    let (srv_loop, srv_tx) = EventLoop::spawn(srv);
    let (cli_loop, cli_tx) = EventLoop::spawn(cli);
    let _ = srv_ch.set(srv_tx.clone());
    let _ = cli_ch.set(cli_tx.clone());

    // Server application
    let battery = Arc::new(Battery {
        ch: srv_tx.clone(),
        level: parking_lot::Mutex::new(vec![100]),
    });
    let cb: Arc<dyn Callbacks> = battery;
    let (srv_app, vhdl) = (srv_tx.call(move |g| {
        let app = g.register(Uuid16::new(0xA001).unwrap().as_uuid(), cb)?;
        let hdls = g.add_service(
            app,
            &[
                Element::primary(Uuid16::new(0x180F).unwrap()),
                Element::characteristic(
                    Uuid16::new(0x2A19).unwrap(),
                    Prop::READ | Prop::WRITE | Prop::INDICATE,
                    Perms::READ | Perms::WRITE,
                ),
            ],
        )?;
        Ok::<_, Error>((app, hdls[1]))
    }))
    .await??;

    // Client application
    let (done_tx, mut done) = mpsc::unbounded_channel();
    let cb: Arc<dyn Callbacks> = Arc::new(Client {
        ch: cli_tx.clone(),
        done: done_tx,
    });
    let cli_app = (cli_tx.call(move |g| g.register(Uuid16::new(0xA002).unwrap().as_uuid(), cb)))
        .await??;

    srv_tx.send(Event::LinkUp(srv_link)).await?;
    cli_tx.send(Event::LinkUp(cli_link)).await?;
    let conn = (cli_tx.call(move |g| g.conn_id(cli_app, cli_link)))
        .await?
        .ok_or_else(|| anyhow!("client link not connected"))?;

    let run = |f: Box<dyn FnOnce(&mut Gatt) -> burble_gatt::gatt::Result<()> + Send>| {
        let ch = cli_tx.clone();
        async move { ch.call(f).await? }
    };
    run(Box::new(move |g: &mut Gatt| {
        g.discover(conn, DiscType::PrimaryAll, HandleRange::ALL)
    }))
    .await?;
    done.recv().await;
    run(Box::new(move |g: &mut Gatt| {
        g.read(conn, ReadType::ByHandle(vhdl))
    }))
    .await?;
    done.recv().await;
    run(Box::new(move |g: &mut Gatt| {
        g.configure_mtu(conn, args.mtu)
    }))
    .await?;
    done.recv().await;
    let val = (0..args.len).map(|i| i as u8).collect();
    run(Box::new(move |g: &mut Gatt| {
        g.write(conn, WriteType::Request, vhdl, val)
    }))
    .await?;
    done.recv().await;

    let srv_conn = (srv_tx.call(move |g| g.conn_id(srv_app, srv_link)))
        .await?
        .ok_or_else(|| anyhow!("server link not connected"))?;
    (srv_tx.call(move |g| g.indicate(srv_conn, vhdl, vec![42]))).await??;
    done.recv().await;

    srv_tx.send(Event::LinkDown(srv_link, Reason::REMOTE_USER)).await?;
    cli_tx.send(Event::LinkDown(cli_link, Reason::LOCAL_HOST)).await?;
    srv_tx.call(|_| ()).await?;
    cli_tx.call(|_| ()).await?;
    info!("Server: {:?}", srv_loop.stop().await);
    info!("Client: {:?}", cli_loop.stop().await);
    Ok(())
}

/// Bearer that delivers PDUs to the other engine. Discovery requests, which
/// a real codec answers from the attribute database, are answered from
/// the registered services of the remote engine.
struct Loopback {
    /// Link as seen by the remote engine.
    remote: Link,
    own: Arc<OnceLock<EventSender>>,
    peer: Arc<OnceLock<EventSender>>,
}

impl Loopback {
    fn deliver(&self, e: Event) -> burble_gatt::gatt::Result<()> {
        (self.peer.get()).map_or(Err(Error::Link), |ch| ch.try_send(e))
    }
}

impl Bearer for Loopback {
    fn send_req(&mut self, link: Link, req: &Req) -> burble_gatt::gatt::Result<()> {
        info!("{link} <- {req:?}");
        if let Some(r) = peer_req(req) {
            return self.deliver(Event::Request(self.remote, r));
        }
        let (Some(peer), Some(own)) = (self.peer.get().cloned(), self.own.get().cloned()) else {
            return Err(Error::Link);
        };
        let req = req.clone();
        tokio::spawn(async move {
            let Ok(rsp) = peer.call(move |g| answer(g, &req)).await else {
                return;
            };
            let _ = own.send(Event::Response(link, rsp)).await;
        });
        Ok(())
    }

    fn send_rsp(&mut self, link: Link, rsp: &SrvRsp) -> burble_gatt::gatt::Result<()> {
        info!("{link} <- {rsp:?}");
        let rsp = match rsp.clone() {
            SrvRsp::Error { req, hdl, err } => Rsp::Error { req, hdl, err },
            SrvRsp::ExchangeMtu { mtu } => Rsp::ExchangeMtu { mtu },
            SrvRsp::Read(v) => Rsp::Read(v),
            SrvRsp::ReadBlob(v) => Rsp::ReadBlob(v),
            SrvRsp::Write => Rsp::Write,
            SrvRsp::PrepareWrite { hdl, off, val } => Rsp::PrepareWrite { hdl, off, val },
            SrvRsp::ExecuteWrite => Rsp::ExecuteWrite,
            _ => return Err(Error::IllegalParameter),
        };
        self.deliver(Event::Response(self.remote, rsp))
    }

    fn send_ntf(&mut self, link: Link, hdl: Handle, val: &[u8]) -> burble_gatt::gatt::Result<()> {
        info!("{link} <- notification {hdl}");
        self.deliver(Event::Value {
            link: self.remote,
            hdl,
            val: val.to_vec(),
            ind: false,
        })
    }

    fn send_ind(&mut self, link: Link, hdl: Handle, val: &[u8]) -> burble_gatt::gatt::Result<()> {
        info!("{link} <- indication {hdl}");
        self.deliver(Event::Value {
            link: self.remote,
            hdl,
            val: val.to_vec(),
            ind: true,
        })
    }

    fn send_cfm(&mut self, link: Link) -> burble_gatt::gatt::Result<()> {
        info!("{link} <- confirmation");
        self.deliver(Event::Confirmation(self.remote))
    }
}

/// Converts client requests that the remote engine handles itself.
fn peer_req(req: &Req) -> Option<PeerReq> {
    Some(match req.clone() {
        Req::ExchangeMtu { mtu } => PeerReq::ExchangeMtu { mtu },
        Req::Read { hdl } => PeerReq::Read { hdl },
        Req::ReadBlob { hdl, off } => PeerReq::ReadBlob { hdl, off },
        Req::Write { hdl, val } => PeerReq::Write { hdl, val },
        Req::WriteCmd { hdl, val } => PeerReq::WriteCmd { hdl, val },
        Req::PrepareWrite { hdl, off, val } => PeerReq::PrepareWrite { hdl, off, val },
        Req::ExecuteWrite { execute } => PeerReq::ExecuteWrite { execute },
        _ => return None,
    })
}

/// Answers primary service discovery from the started services.
fn answer(g: &mut Gatt, req: &Req) -> Rsp {
    let err = |req, hdl| Rsp::Error {
        req,
        hdl,
        err: ErrorCode::AttributeNotFound,
    };
    let Req::ReadByGroupType { range, typ } = *req else {
        return err(req.opcode(), None);
    };
    if typ != PRIMARY_SERVICE {
        return err(Opcode::ReadByGroupTypeReq, Some(range.start()));
    }
    let mut v: Vec<_> = (g.services())
        .filter(|s| s.primary && range.contains_handle(s.range.start()))
        .map(|s| (s.range, s.svc.to_short_bytes()))
        .collect();
    v.sort_unstable_by_key(|(r, _)| r.start());
    if let Some(n) = v.first().map(|(_, u)| u.len()) {
        v.retain(|(_, u)| u.len() == n);
    }
    if v.is_empty() {
        return err(Opcode::ReadByGroupTypeReq, Some(range.start()));
    }
    Rsp::ReadByGroupType(v)
}

/// Battery service that answers reads and writes of its level.
struct Battery {
    ch: EventSender,
    level: parking_lot::Mutex<Vec<u8>>,
}

impl Callbacks for Battery {
    fn on_request(&self, conn: ConnId, trans: TransId, req: &PeerReq) {
        let rsp = match *req {
            PeerReq::Read { .. } => Ok(self.level.lock().clone()),
            PeerReq::ReadBlob { off, .. } => {
                let v = self.level.lock();
                v.get(usize::from(off)..).map(<[u8]>::to_vec).ok_or(ErrorCode::InvalidOffset)
            }
            PeerReq::Write { ref val, .. } => {
                *self.level.lock() = val.clone();
                Ok(Vec::new())
            }
            PeerReq::WriteCmd { .. } => return,
            PeerReq::PrepareWrite { off, ref val, .. } => {
                let mut v = self.level.lock();
                v.resize(usize::from(off), 0);
                v.extend_from_slice(val);
                Ok(Vec::new())
            }
            _ => Ok(Vec::new()),
        };
        info!("Battery: {req:?} -> {rsp:?}");
        let e = Event::Call(Box::new(move |g: &mut Gatt| {
            if let Err(e) = g.send_response(conn, trans, rsp) {
                warn!("Failed to respond: {e}");
            }
        }));
        if let Err(e) = self.ch.try_send(e) {
            warn!("Server is gone: {e}");
        }
    }

    fn on_indication_confirmed(&self, conn: ConnId, hdl: Handle, status: Status) {
        info!("Battery: indication {hdl} on {conn}: {status}");
    }
}

/// Client application that logs results and confirms indications.
struct Client {
    ch: EventSender,
    done: mpsc::UnboundedSender<()>,
}

impl Callbacks for Client {
    fn on_connection(&self, conn: ConnId, link: Link, connected: bool, reason: Reason) {
        info!("Client: {conn} {link} connected={connected} ({reason:?})");
    }

    fn on_op_complete(&self, conn: ConnId, op: OpKind, status: Status, data: Option<OpData>) {
        info!("Client: {op:?} on {conn}: {status} {data:?}");
        let _ = self.done.send(());
    }

    fn on_discovery_result(&self, _: ConnId, _: DiscType, r: &DiscResult) {
        info!("Client: found {r:?}");
    }

    fn on_discovery_complete(&self, conn: ConnId, typ: DiscType, status: Status) {
        info!("Client: {typ:?} on {conn}: {status}");
        let _ = self.done.send(());
    }

    fn on_value(&self, conn: ConnId, hdl: Handle, val: &[u8], ind: bool) {
        info!("Client: value {hdl} = {val:02X?}");
        if ind {
            let _ = (self.ch).try_send(Event::Call(Box::new(move |g: &mut Gatt| {
                let _ = g.confirm(conn);
            })));
            let _ = self.done.send(());
        }
    }
}
