use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::att::{Handle, PeerReq, Rsp};
use crate::le::Link;

use super::*;

/// Capacity of the event channel.
const EVENT_QUEUE: usize = 64;

/// Input to the engine task.
pub enum Event {
    /// Link established.
    LinkUp(Link),
    /// Link lost.
    LinkDown(Link, Reason),
    /// Response to a client request.
    Response(Link, Rsp),
    /// Request or command from a peer client.
    Request(Link, PeerReq),
    /// Notification or indication from a peer server.
    Value {
        link: Link,
        hdl: Handle,
        val: Vec<u8>,
        ind: bool,
    },
    /// `ATT_HANDLE_VALUE_CFM` from the peer.
    Confirmation(Link),
    /// Security procedure outcome.
    Security(Link, bool),
    /// Arbitrary engine call.
    Call(Box<dyn FnOnce(&mut Gatt) + Send>),
}

impl Debug for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinkUp(l) => f.debug_tuple("LinkUp").field(l).finish(),
            Self::LinkDown(l, r) => f.debug_tuple("LinkDown").field(l).field(r).finish(),
            Self::Response(l, r) => f.debug_tuple("Response").field(l).field(r).finish(),
            Self::Request(l, r) => f.debug_tuple("Request").field(l).field(r).finish(),
            Self::Value { link, hdl, ind, .. } => (f.debug_struct("Value"))
                .field("link", link)
                .field("hdl", hdl)
                .field("ind", ind)
                .finish_non_exhaustive(),
            Self::Confirmation(l) => f.debug_tuple("Confirmation").field(l).finish(),
            Self::Security(l, ok) => f.debug_tuple("Security").field(l).field(ok).finish(),
            Self::Call(_) => f.write_str("Call"),
        }
    }
}

/// Sending half of the engine event channel.
#[derive(Clone, Debug)]
pub struct EventSender(mpsc::Sender<Event>);

impl EventSender {
    /// Delivers an event to the engine task. Returns [`Error::NotFound`] if
    /// the event loop has stopped.
    pub async fn send(&self, e: Event) -> Result<()> {
        self.0.send(e).await.map_err(|_| Error::NotFound)
    }

    /// Delivers an event without waiting for channel capacity.
    pub fn try_send(&self, e: Event) -> Result<()> {
        self.0.try_send(e).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::NoResources,
            mpsc::error::TrySendError::Closed(_) => Error::NotFound,
        })
    }

    /// Runs `f` on the engine task and returns its result.
    pub async fn call<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut Gatt) -> T + Send + 'static,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        (self.send(Event::Call(Box::new(move |g: &mut Gatt| {
            let _ = tx.send(f(g));
        }))))
        .await?;
        rx.await.map_err(|_| Error::NotFound)
    }
}

/// Task that owns a [`Gatt`] engine and drives it from transport events, API
/// calls, and timer deadlines.
#[derive(Debug)]
pub struct EventLoop {
    h: tokio::task::JoinHandle<Gatt>,
    c: CancellationToken,
    _g: tokio_util::sync::DropGuard,
}

impl EventLoop {
    /// Spawns the engine task. Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(g: Gatt) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let c = CancellationToken::new();
        let el = Self {
            h: tokio::spawn(Self::run(g, rx, c.clone())),
            c: c.clone(),
            _g: c.drop_guard(),
        };
        (el, EventSender(tx))
    }

    /// Stops event processing and returns the engine.
    pub async fn stop(self) -> Gatt {
        self.c.cancel();
        match self.h.await {
            Ok(g) => g,
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    /// Processes events until cancellation or until all senders are dropped.
    async fn run(mut g: Gatt, mut rx: mpsc::Receiver<Event>, c: CancellationToken) -> Gatt {
        debug!("GATT event loop started");
        loop {
            let deadline = g.next_deadline();
            let timer = async move {
                match deadline {
                    Some(t) => tokio::time::sleep_until(t).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                e = rx.recv() => {
                    let Some(e) = e else {
                        debug!("GATT event channel closed");
                        return g;
                    };
                    g.dispatch(e);
                }
                _ = timer => g.on_timer(Instant::now()),
                _ = c.cancelled() => {
                    debug!("GATT event loop terminating");
                    return g;
                }
            }
        }
    }
}

impl Future for EventLoop {
    type Output = Gatt;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.h).poll(cx)) {
            Ok(g) => Poll::Ready(g),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

impl Gatt {
    /// Handles a single event.
    pub fn dispatch(&mut self, e: Event) {
        trace!("{e:?}");
        match e {
            Event::LinkUp(link) => {
                if let Err(e) = self.on_link_up(link) {
                    warn!("Failed to accept {link}: {e}");
                }
            }
            Event::LinkDown(link, reason) => self.on_link_down(link, reason),
            Event::Response(link, rsp) => self.on_response(link, rsp),
            Event::Request(link, req) => self.on_request(link, req),
            Event::Value {
                link,
                hdl,
                val,
                ind,
            } => self.on_value(link, hdl, &val, ind),
            Event::Confirmation(link) => {
                self.on_confirmation(link);
                if let Err(e) = self.send_pending_indication(link) {
                    warn!("Failed to send pending indication to {link}: {e}");
                }
            }
            Event::Security(link, ok) => self.on_security_complete(link, ok),
            Event::Call(f) => f(self),
        }
    }
}
