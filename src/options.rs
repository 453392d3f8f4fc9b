use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::auth::Authorizer;
use crate::error::{PusherError, Result};
use crate::queue::DeliveryMode;
use crate::transport::{TransportFactory, WebSocketTransportFactory};

pub const DEFAULT_HOST: &str = "ws.pusherapp.com";
pub const WSS_PORT: u16 = 443;
pub const WS_PORT: u16 = 80;
pub const DEFAULT_EVENT_BUFFER: usize = 100;

const CLIENT_NAME: &str = "pusher-client-rs";
const PROTOCOL_VERSION: u8 = 7;

/// Configuration for a [`Pusher`](crate::Pusher) client
#[derive(Clone)]
pub struct PusherOptions {
    host: String,
    port: Option<u16>,
    encrypted: bool,
    authorizer: Option<Arc<dyn Authorizer>>,
    activity_timeout: Option<Duration>,
    event_buffer: usize,
    transports: Arc<dyn TransportFactory>,
    delivery: DeliveryMode,
}

impl Default for PusherOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: None,
            encrypted: true,
            authorizer: None,
            activity_timeout: None,
            event_buffer: DEFAULT_EVENT_BUFFER,
            transports: Arc::new(WebSocketTransportFactory),
            delivery: DeliveryMode::default(),
        }
    }
}

impl fmt::Debug for PusherOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PusherOptions")
            .field("host", &self.host)
            .field("port", &self.port())
            .field("encrypted", &self.encrypted)
            .field("authorizer", &self.authorizer.is_some())
            .field("activity_timeout", &self.activity_timeout)
            .field("event_buffer", &self.event_buffer)
            .field("delivery", &self.delivery)
            .finish()
    }
}

impl PusherOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    /// Use the hosted cluster `ws-{cluster}.pusher.com`
    pub fn with_cluster(mut self, cluster: &str) -> Self {
        self.host = format!("ws-{}.pusher.com", cluster);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Use `wss` (the default) or plain `ws`
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    /// Authorizer consulted for private and presence channels
    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    /// Override the ping interval announced by the server. Zero disables client pings.
    pub fn with_activity_timeout(mut self, timeout: Duration) -> Self {
        self.activity_timeout = Some(timeout);
        self
    }

    /// Capacity of the transport event channel
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    pub fn with_transport(mut self, transports: Arc<dyn TransportFactory>) -> Self {
        self.transports = transports;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The configured port, or the scheme default
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.encrypted { WSS_PORT } else { WS_PORT })
    }

    pub fn encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        self.authorizer.clone()
    }

    pub fn activity_timeout(&self) -> Option<Duration> {
        self.activity_timeout
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    pub fn transports(&self) -> Arc<dyn TransportFactory> {
        Arc::clone(&self.transports)
    }

    pub fn delivery(&self) -> DeliveryMode {
        self.delivery
    }

    /// Socket URL for `app_key`
    pub fn url(&self, app_key: &str) -> Result<Url> {
        if app_key.is_empty() {
            return Err(PusherError::InvalidArgument(
                "app key must not be empty".to_string(),
            ));
        }

        let scheme = if self.encrypted { "wss" } else { "ws" };
        let url = format!(
            "{}://{}:{}/app/{}?client={}&version={}&protocol={}",
            scheme,
            self.host,
            self.port(),
            app_key,
            CLIENT_NAME,
            env!("CARGO_PKG_VERSION"),
            PROTOCOL_VERSION
        );

        Ok(Url::parse(&url)?)
    }
}
