//! WebSocket transport
//!
//! Accepts TCP connections, routes the upgrade request by path and query,
//! and serves the two connection roles:
//!
//! - `GET /publish?topic=T`: admitted only if `T` already exists. Every
//!   frame the peer sends is decoded as an envelope and broadcast to the topic
//!   it names; bad frames are logged and skipped.
//! - `GET /subscribe?topic=A&topic=B`: the connection is registered on every
//!   named topic (created on first use) and receives their broadcasts. It may
//!   also send `subscribe` / `unsubscribe` envelopes to change its topics.
//!
//! Rejections happen during the handshake, before the upgrade: 404 for an
//! unknown path, 400 for a missing or unknown topic, 503 when the connection
//! limit is reached.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tracing::{debug, error, info, warn};
use tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tungstenite::http::StatusCode;

use crate::broker::message::{Action, Envelope};
use crate::broker::{Broker, Topic};
use crate::config::BrokerSettings;
use crate::transport::connection::{Connection, ConnectionHandle, Inbound};
use crate::utils::{RelayError, Result};

pub const PUBLISH_PATH: &str = "/publish";
pub const SUBSCRIBE_PATH: &str = "/subscribe";

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// What an accepted upgrade request asked for.
#[derive(Debug)]
enum Route {
    Publish { topic: Topic },
    Subscribe { topics: Vec<String> },
}

#[derive(Debug, Error)]
enum Rejection {
    #[error("not found")]
    NotFound,
    #[error("missing topic")]
    MissingTopic,
    #[error("unknown topic")]
    UnknownTopic,
    #[error("too many connections")]
    Overloaded,
}

impl Rejection {
    fn status(&self) -> StatusCode {
        match self {
            Rejection::NotFound => StatusCode::NOT_FOUND,
            Rejection::MissingTopic | Rejection::UnknownTopic => StatusCode::BAD_REQUEST,
            Rejection::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

impl Route {
    fn resolve(broker: &Broker, request: &Request) -> Result<Self, Rejection> {
        let topics = topic_params(request.uri().query());
        match request.uri().path() {
            PUBLISH_PATH => {
                let name = topics.into_iter().next().unwrap_or_default();
                broker
                    .resolve_topic(&name)
                    .map(|topic| Route::Publish { topic })
                    .map_err(|_| Rejection::UnknownTopic)
            }
            SUBSCRIBE_PATH => {
                if topics.iter().all(|name| name.trim().is_empty()) {
                    return Err(Rejection::MissingTopic);
                }
                Ok(Route::Subscribe { topics })
            }
            _ => Err(Rejection::NotFound),
        }
    }
}

/// Every `topic` query parameter, in order.
fn topic_params(query: Option<&str>) -> Vec<String> {
    let Some(query) = query else {
        return Vec::new();
    };
    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "topic")
        .map(|(_, value)| value.into_owned())
        .collect()
}

/// Bind `addr` and serve until the listener fails.
pub async fn start_websocket_server(
    addr: String,
    broker: Arc<Broker>,
    settings: BrokerSettings,
) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!("WebSocket server listening on ws://{addr}");
    serve(listener, broker, settings).await
}

/// Accept connections from an already bound listener.
pub async fn serve(
    listener: TcpListener,
    broker: Arc<Broker>,
    settings: BrokerSettings,
) -> Result<()> {
    let permits = settings.max_connections.min(Semaphore::MAX_PERMITS);
    let limiter = Arc::new(Semaphore::new(permits));
    let settings = Arc::new(settings);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed: {e}");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let broker = broker.clone();
        let settings = settings.clone();
        let limiter = limiter.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, broker, &settings, limiter).await;
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    broker: Arc<Broker>,
    settings: &BrokerSettings,
    limiter: Arc<Semaphore>,
) {
    // held until this connection is fully torn down
    let permit = limiter.try_acquire_owned().ok();
    let mut route = None;

    // a peer that never finishes the upgrade must not keep its permit
    let handshake = timeout(
        settings.read_timeout(),
        accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                if permit.is_none() {
                    return Err(Rejection::Overloaded.into_response());
                }
                match Route::resolve(&broker, request) {
                    Ok(resolved) => {
                        route = Some(resolved);
                        Ok(response)
                    }
                    Err(rejection) => {
                        debug!(%peer, uri = %request.uri(), %rejection, "upgrade rejected");
                        Err(rejection.into_response())
                    }
                }
            },
        ),
    )
    .await;

    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!(%peer, "WebSocket handshake error: {e}");
            return;
        }
        Err(_) => {
            debug!(%peer, "WebSocket handshake timed out");
            return;
        }
    };
    let Some(route) = route else {
        return;
    };

    let connection = Connection::new(ws, peer, settings);
    match route {
        Route::Publish { topic } => {
            info!(
                %peer,
                connection = %connection.id(),
                topic = %topic.name(),
                "new publisher connected"
            );
            serve_publisher(connection, &broker).await;
        }
        Route::Subscribe { topics } => {
            info!(%peer, connection = %connection.id(), ?topics, "new subscriber connected");
            serve_subscriber(connection, &broker, topics).await;
        }
    }
    drop(permit);
}

async fn serve_publisher<S>(connection: Connection<S>, broker: &Broker)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = connection.handle();
    let (mut inbound, outbound) = connection.split();
    let writer = tokio::spawn(outbound.run());

    while let Some(frame) = inbound.recv().await {
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(connection = %handle.id(), "unmarshal message failed: {e}");
                continue;
            }
        };
        if let Err(e) = broker.publish(&envelope).await {
            warn!(connection = %handle.id(), topic = %envelope.topic, "publish skipped: {e}");
        }
    }

    finish(&handle, &mut inbound, "publisher");
    let _ = writer.await;
}

async fn serve_subscriber<S>(connection: Connection<S>, broker: &Broker, names: Vec<String>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handle = connection.handle();
    let (mut inbound, outbound) = connection.split();
    let writer = tokio::spawn(outbound.run());

    let mut joined: HashMap<String, Topic> = HashMap::new();
    if let Err(e) = broker.subscribe_into(&handle, &names, &mut joined).await {
        error!(connection = %handle.id(), "subscribe failed: {e}");
        handle.close();
    }

    while let Some(frame) = inbound.recv().await {
        match Envelope::decode(&frame) {
            Ok(envelope) => change_subscription(broker, &handle, &mut joined, envelope).await,
            Err(e) => warn!(connection = %handle.id(), "unmarshal message failed: {e}"),
        }
    }

    finish(&handle, &mut inbound, "subscriber");
    for topic in joined.values() {
        if let Err(e) = topic.unregister(handle.id()).await {
            debug!(connection = %handle.id(), "unregister skipped: {e}");
        }
    }
    let _ = writer.await;
}

async fn change_subscription(
    broker: &Broker,
    handle: &ConnectionHandle,
    joined: &mut HashMap<String, Topic>,
    envelope: Envelope,
) {
    let result = match envelope.action {
        Action::Subscribe if joined.contains_key(&envelope.topic) => Ok(()),
        Action::Subscribe => broker.subscribe_into(handle, [&envelope.topic], joined).await,
        Action::Unsubscribe => match joined.remove(&envelope.topic) {
            Some(topic) => topic.unregister(handle.id()).await,
            None => Ok(()),
        },
        Action::Publish => Err(RelayError::ActionNotAllowed {
            action: Action::Publish,
            role: "subscriber",
        }),
    };

    match result {
        Ok(()) => debug!(
            connection = %handle.id(),
            action = %envelope.action,
            topic = %envelope.topic,
            "subscription changed"
        ),
        Err(e) => warn!(
            connection = %handle.id(),
            topic = %envelope.topic,
            "subscription change rejected: {e}"
        ),
    }
}

/// Close the connection and report why its inbound loop ended.
fn finish<S>(handle: &ConnectionHandle, inbound: &mut Inbound<S>, role: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match inbound.take_error() {
        Some(e) => warn!(connection = %handle.id(), "{role} connection error: {e}"),
        None => debug!(connection = %handle.id(), "{role} connection closed without error"),
    }
    handle.close();
}
