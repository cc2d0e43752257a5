use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

/// Inbound event from a relay connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Connection ended; `None` when no close frame was received.
    Closed(Option<u16>),
}

/// One open relay connection.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound frame. Must be cancel-safe.
    async fn recv(&mut self) -> Frame;

    async fn close(&mut self, code: u16);
}

/// Opens relay connections for an identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<Box<dyn Transport>>;
}

/// WebSocket connector for `<base>/ws/<identity>`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn endpoint(&self, identity: &str) -> Result<Url> {
        let mut url = Url::parse(self.base_url.trim())?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(anyhow!("unsupported signaling URL scheme {other:?}")),
        }
        url.path_segments_mut()
            .map_err(|_| anyhow!("signaling URL cannot carry a path"))?
            .pop_if_empty()
            .push("ws")
            .push(identity);
        Ok(url)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, identity: &str) -> Result<Box<dyn Transport>> {
        let url = self.endpoint(identity)?;
        debug!("dialing signaling relay {}", url);
        let (ws, _) = connect_async(url.as_str()).await?;
        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Frame {
        while let Some(msg) = self.ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return Frame::Text(text),
                Ok(Message::Close(frame)) => {
                    return Frame::Closed(frame.map(|f| u16::from(f.code)));
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("signaling socket error: {}", e);
                    return Frame::Closed(None);
                }
            }
        }
        Frame::Closed(None)
    }

    async fn close(&mut self, code: u16) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!("close on finished signaling socket: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::WsConnector;

    #[test]
    fn test_endpoint_appends_identity() {
        let c = WsConnector::new("wss://relay.example.org");
        assert_eq!(
            c.endpoint("alice").expect("url").as_str(),
            "wss://relay.example.org/ws/alice"
        );
    }

    #[test]
    fn test_endpoint_keeps_base_path_and_encodes() {
        let c = WsConnector::new("ws://127.0.0.1:7860/signal/");
        assert_eq!(
            c.endpoint("bob smith").expect("url").as_str(),
            "ws://127.0.0.1:7860/signal/ws/bob%20smith"
        );
    }

    #[test]
    fn test_endpoint_rejects_http() {
        assert!(WsConnector::new("http://relay").endpoint("a").is_err());
    }
}
