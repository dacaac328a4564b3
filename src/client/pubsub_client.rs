//! Client side of the relay protocol
//!
//! `Publisher` connects to `/publish?topic=T` and sends envelopes;
//! `Subscriber` connects to `/subscribe?topic=…` and reads them back. A
//! rejected upgrade surfaces as `RelayError::Transport(tungstenite::Error::Http(_))`
//! carrying the server's status code.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tungstenite::protocol::Message as WsMessage;
use url::Url;

use crate::broker::message::Envelope;
use crate::transport::websocket::{PUBLISH_PATH, SUBSCRIBE_PATH};
use crate::utils::Result;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build `<base><path>?topic=a&topic=b`.
pub fn endpoint_url<I, S>(base: &str, path: &str, topics: I) -> Result<Url>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut url = Url::parse(base)?.join(path)?;
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        for topic in topics {
            query.append_pair("topic", topic.as_ref());
        }
    }
    Ok(url)
}

pub struct Publisher {
    ws: WsStream,
    topic: String,
}

impl Publisher {
    pub async fn connect(base: &str, topic: &str) -> Result<Self> {
        let url = endpoint_url(base, PUBLISH_PATH, [topic])?;
        let (ws, _response) = connect_async(url.as_str()).await?;
        Ok(Self {
            ws,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publish `payload` on the topic this publisher was admitted for.
    pub async fn publish(&mut self, payload: impl Into<bytes::Bytes>) -> Result<()> {
        let envelope = Envelope::publish(self.topic.clone(), payload);
        self.send(&envelope).await
    }

    /// Send any envelope as one binary frame.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.send_raw(envelope.encode()?).await
    }

    pub async fn send_raw(&mut self, bytes: impl Into<bytes::Bytes>) -> Result<()> {
        self.ws.send(WsMessage::Binary(bytes.into())).await?;
        Ok(())
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}

pub struct Subscriber {
    ws: WsStream,
}

impl Subscriber {
    pub async fn connect<I, S>(base: &str, topics: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let url = endpoint_url(base, SUBSCRIBE_PATH, topics)?;
        let (ws, _response) = connect_async(url.as_str()).await?;
        Ok(Self { ws })
    }

    /// Join another topic on the open connection.
    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.send(&Envelope::subscribe(topic)).await
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.send(&Envelope::unsubscribe(topic)).await
    }

    /// Send any envelope as one binary frame.
    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.ws.send(WsMessage::Binary(envelope.encode()?)).await?;
        Ok(())
    }

    /// Next envelope from the server; `None` once the server closed the connection.
    pub async fn next_envelope(&mut self) -> Option<Result<Envelope>> {
        while let Some(message) = self.ws.next().await {
            match message {
                Ok(WsMessage::Close(_)) => return None,
                Ok(msg) if msg.is_binary() || msg.is_text() => {
                    return Some(Envelope::decode(&msg.into_data()));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
        None
    }

    pub async fn close(mut self) -> Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }
}
