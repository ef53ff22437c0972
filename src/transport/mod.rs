pub mod frames;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hyper::Uri;
use socket2::TcpKeepalive;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::{Result, StressError};

/// A data frame read off the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// One persistent bidirectional connection, owned by a single session.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Next data frame. `Ok(None)` once the peer closed the connection.
    async fn recv(&mut self) -> Result<Option<Frame>>;

    /// Protocol-level liveness probe.
    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self);
}

/// Opens fresh transports. Shared by every session; each call yields a
/// connection nobody else sees.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}

pub struct WsConnector {
    url: String,
    host: String,
    port: u16,
}

impl WsConnector {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let uri: Uri = url.parse()?;
        if uri.scheme_str() != Some("ws") {
            anyhow::bail!("unsupported websocket scheme in {}", url);
        }
        let host = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("websocket url {} has no host", url))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            url: url.to_string(),
            host,
            port,
        })
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| StressError::Connect(format!("{}:{}: {}", self.host, self.port, e)))?;

        configure_keepalive(&stream)
            .map_err(|e| StressError::Connect(format!("socket setup failed: {}", e)))?;

        let (ws, _) = tokio_tungstenite::client_async(self.url.as_str(), stream)
            .await
            .map_err(|e| StressError::Connect(format!("websocket upgrade failed: {}", e)))?;
        debug!("Opened websocket to {}", self.url);

        Ok(Box::new(WsTransport { ws }))
    }
}

pub struct WsTransport {
    ws: WebSocketStream<TcpStream>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.ws
            .send(Message::text(text.to_owned()))
            .await
            .map_err(|e| StressError::TransportClosed(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.ws.next().await {
                None | Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(Frame::Text(text.as_str().to_owned()))),
                Some(Ok(Message::Binary(bytes))) => return Ok(Some(Frame::Binary(bytes.to_vec()))),
                // control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(StressError::TransportClosed(e.to_string())),
            }
        }
    }

    async fn ping(&mut self) -> Result<()> {
        self.ws
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| StressError::TransportClosed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

fn configure_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(30)) // probe after 30 seconds of idle
        .with_interval(Duration::from_secs(10));

    sock_ref.set_tcp_keepalive(&keepalive)?;
    stream.set_nodelay(true)?;

    Ok(())
}
