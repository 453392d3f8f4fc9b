//! Full-duplex socket transport.
//!
//! The connection state machine only sees text frames and lifecycle events.
//! A fresh transport is created for every `connect()`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{PusherError, Result};

/// Close code reported when the socket dropped without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when the peer's close frame carried no status
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Lifecycle and data events emitted by a transport, in socket order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Message(String),
    Close {
        code: u16,
        reason: String,
        remote: bool,
    },
    Error(String),
}

#[async_trait]
pub trait Transport: Send {
    /// Connect to `url`. Once this returns `Ok`, events are reported
    /// through `events`, starting with [`TransportEvent::Open`].
    async fn open(&mut self, url: &Url, events: mpsc::Sender<TransportEvent>) -> Result<()>;

    async fn send(&mut self, text: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Creates one transport per connection attempt
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}

/// Transport over `tokio-tungstenite`
#[derive(Default)]
pub struct WebSocketTransport {
    outbound: Option<mpsc::Sender<Message>>,
    _task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&mut self, url: &Url, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        if self.outbound.is_some() {
            return Err(PusherError::InvalidState(
                "transport already opened".to_string(),
            ));
        }

        let (ws_stream, response) = connect_async(url.as_str()).await?;
        debug!("Connected to WebSocket server. Response: {:?}", response);

        let (tx, rx) = mpsc::channel::<Message>(100);
        self.outbound = Some(tx);
        self._task_handle = Some(tokio::spawn(run_socket(ws_stream, events, rx)));

        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        match &self.outbound {
            Some(tx) => tx
                .send(Message::Text(text))
                .await
                .map_err(|e| PusherError::SendError(e.to_string())),
            None => Err(PusherError::ConnectionError(
                "transport is not open".to_string(),
            )),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.outbound.take() {
            tx.send(Message::Close(None))
                .await
                .map_err(|e| PusherError::SendError(e.to_string()))?;
        }

        Ok(())
    }
}

/// Factory for [`WebSocketTransport`]
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(WebSocketTransport::new())
    }
}

async fn emit(events: &mpsc::Sender<TransportEvent>, event: TransportEvent) -> bool {
    if events.send(event).await.is_err() {
        debug!("Transport event receiver dropped");
        return false;
    }
    true
}

async fn run_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events: mpsc::Sender<TransportEvent>,
    mut outbound: mpsc::Receiver<Message>,
) {
    if !emit(&events, TransportEvent::Open).await {
        return;
    }

    let (mut sink, mut stream) = ws_stream.split();
    let mut close_sent = false;

    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    close_sent |= matches!(message, Message::Close(_));
                    if let Err(e) = sink.send(message).await {
                        error!("Error sending message: {}", e);
                        emit(&events, TransportEvent::Error(e.to_string())).await;
                        emit(&events, TransportEvent::Close {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                            remote: false,
                        }).await;
                        break;
                    }
                }
                None => {
                    if !close_sent && let Err(e) = sink.close().await {
                        warn!("Error closing socket: {}", e);
                    }
                    break;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    trace!("Received message: {}", text);
                    if !emit(&events, TransportEvent::Message(text)).await {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sink.send(Message::Pong(data)).await {
                        error!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    info!("Socket closed ({}): {}", code, reason);
                    emit(&events, TransportEvent::Close {
                        code,
                        reason,
                        remote: !close_sent,
                    }).await;
                    break;
                }
                Some(Ok(_)) => trace!("Ignoring non-text frame"),
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    emit(&events, TransportEvent::Error(e.to_string())).await;
                    emit(&events, TransportEvent::Close {
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                        remote: false,
                    }).await;
                    break;
                }
                None => {
                    emit(&events, TransportEvent::Close {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".to_string(),
                        remote: true,
                    }).await;
                    break;
                }
            }
        }
    }

    debug!("Socket task finished");
}
