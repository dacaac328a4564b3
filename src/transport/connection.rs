//! Connection
//!
//! A `Connection` wraps one upgraded WebSocket and splits it into two
//! independent loops:
//!
//! - [`Inbound`] yields the payload of every data frame the peer sends, under
//!   a read deadline. It ends on a close frame, a timeout, a transport error,
//!   or when the connection is closed locally.
//! - [`Outbound`] drains the connection's bounded mailbox onto the socket,
//!   under a write deadline, and sends keep-alive pings. It owns the write
//!   half, so it is also the one that performs the close handshake.
//!
//! Everything else (topics, the broker) only ever sees a [`ConnectionHandle`]:
//! an id, the sending side of the mailbox, and the shared close signal.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};
use tungstenite::Utf8Bytes;
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;
use tungstenite::protocol::frame::coding::CloseCode;
use uuid::Uuid;

use crate::config::BrokerSettings;
use crate::utils::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Shared "this connection is going away" flag.
#[derive(Debug, Clone)]
struct CloseSignal(Arc<watch::Sender<bool>>);

impl CloseSignal {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }

    /// Returns `true` only for the call that actually flipped the flag.
    fn trigger(&self) -> bool {
        !self.0.send_replace(true)
    }

    fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    async fn triggered(&self) {
        let mut rx = self.0.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// The part of a connection that topics hold on to.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Bytes>,
    close: CloseSignal,
}

impl ConnectionHandle {
    /// Create a handle around the sending side of a mailbox.
    pub fn new(outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: ConnectionId::new(),
            outbound,
            close: CloseSignal::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue `bytes` without waiting.
    ///
    /// Fails with `SlowConsumer` when the mailbox is full and with
    /// `MailboxClosed` once the outbound loop has gone away.
    pub fn try_deliver(&self, bytes: Bytes) -> Result<()> {
        self.outbound.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RelayError::SlowConsumer(self.id),
            mpsc::error::TrySendError::Closed(_) => RelayError::MailboxClosed(self.id),
        })
    }

    /// Ask both loops to stop. The outbound loop sends the close frame and
    /// shuts the socket. Calling this more than once is harmless.
    pub fn close(&self) {
        if self.close.trigger() {
            debug!(connection = %self.id, "close requested");
        }
    }

    pub fn is_closing(&self) -> bool {
        self.close.is_triggered()
    }
}

/// An upgraded WebSocket plus its mailbox, ready to be split into loops.
pub struct Connection<S> {
    handle: ConnectionHandle,
    peer: SocketAddr,
    ws: WebSocketStream<S>,
    mailbox: mpsc::Receiver<Bytes>,
    read_timeout: Duration,
    write_timeout: Duration,
    ping_interval: Option<Duration>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>, peer: SocketAddr, settings: &BrokerSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.mailbox_capacity.max(1));
        Self {
            handle: ConnectionHandle::new(tx),
            peer,
            ws,
            mailbox: rx,
            read_timeout: settings.read_timeout(),
            write_timeout: settings.write_timeout(),
            ping_interval: settings.ping_interval(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    pub fn split(self) -> (Inbound<S>, Outbound<S>) {
        let (writer, reader) = self.ws.split();
        let inbound = Inbound {
            id: self.handle.id,
            reader,
            close: self.handle.close.clone(),
            read_timeout: self.read_timeout,
            error: None,
            finished: false,
        };
        let outbound = Outbound {
            id: self.handle.id,
            writer,
            mailbox: self.mailbox,
            close: self.handle.close,
            write_timeout: self.write_timeout,
            ping_interval: self.ping_interval,
        };
        (inbound, outbound)
    }
}

/// Reading side of a connection.
pub struct Inbound<S> {
    id: ConnectionId,
    reader: SplitStream<WebSocketStream<S>>,
    close: CloseSignal,
    read_timeout: Duration,
    error: Option<RelayError>,
    finished: bool,
}

impl<S> Inbound<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Next data frame from the peer.
    ///
    /// Returns `None` once the peer closed, the read deadline passed, the
    /// transport failed, or the connection was closed locally; it keeps
    /// returning `None` after that.
    pub async fn recv(&mut self) -> Option<Bytes> {
        while !self.finished {
            let next = tokio::select! {
                _ = self.close.triggered() => {
                    self.finished = true;
                    return None;
                }
                next = timeout(self.read_timeout, self.reader.next()) => next,
            };

            match next {
                Err(_) => self.fail(RelayError::Timeout(self.read_timeout)),
                Ok(None) => self.finished = true,
                Ok(Some(Err(err))) => self.fail(err.into()),
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    debug!(connection = %self.id, ?frame, "peer closed the connection");
                    self.finished = true;
                }
                Ok(Some(Ok(msg))) if msg.is_binary() || msg.is_text() => {
                    return Some(msg.into_data());
                }
                // ping, pong, raw frames: the deadline is re-armed on the next pass
                Ok(Some(Ok(_))) => {}
            }
        }
        None
    }

    /// The error that ended the loop, if it did not end cleanly.
    pub fn take_error(&mut self) -> Option<RelayError> {
        self.error.take()
    }

    fn fail(&mut self, err: RelayError) {
        self.finished = true;
        // first error wins
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

/// Writing side of a connection.
pub struct Outbound<S> {
    id: ConnectionId,
    writer: SplitSink<WebSocketStream<S>, WsMessage>,
    mailbox: mpsc::Receiver<Bytes>,
    close: CloseSignal,
    write_timeout: Duration,
    ping_interval: Option<Duration>,
}

impl<S> Outbound<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drain the mailbox until the connection is closed, then perform the
    /// close handshake.
    pub async fn run(mut self) {
        let period = self.ping_interval.unwrap_or(Duration::from_secs(3600));
        let mut ping = interval_at(Instant::now() + period, period);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let pings_enabled = self.ping_interval.is_some();

        loop {
            let message = tokio::select! {
                biased;
                _ = self.close.triggered() => break,
                next = self.mailbox.recv() => match next {
                    Some(bytes) => WsMessage::Binary(bytes),
                    None => break,
                },
                _ = ping.tick(), if pings_enabled => WsMessage::Ping(Bytes::new()),
            };

            if let Err(err) = self.send(message).await {
                warn!(connection = %self.id, error = %err, "write failed, dropping connection");
                break;
            }
        }

        self.shutdown().await;
    }

    async fn send(&mut self, message: WsMessage) -> Result<()> {
        match timeout(self.write_timeout, self.writer.send(message)).await {
            Ok(result) => result.map_err(RelayError::from),
            Err(_) => Err(RelayError::Timeout(self.write_timeout)),
        }
    }

    async fn shutdown(mut self) {
        // wake the inbound loop if the close did not start there
        self.close.trigger();
        self.mailbox.close();

        let farewell = WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("bye"),
        }));
        match self.send(farewell).await {
            Ok(()) => {}
            Err(err) if err.is_already_closed() => {
                debug!(connection = %self.id, "close frame skipped, peer already closing");
            }
            Err(err) => warn!(connection = %self.id, error = %err, "write close"),
        }

        match timeout(self.write_timeout, self.writer.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let err = RelayError::from(err);
                if err.is_already_closed() {
                    debug!(connection = %self.id, "transport already closed");
                } else {
                    warn!(connection = %self.id, error = %err, "conn close");
                }
            }
            Err(_) => debug!(connection = %self.id, "timed out closing transport"),
        }

        debug!(connection = %self.id, "send loop closed");
    }
}
