//! Connection state machine.
//!
//! Owns the transport of the current session, turns transport events and
//! protocol control frames into state transitions, and forwards channel-scoped
//! frames to the channel router. Every outbound frame goes through the locked
//! [`ConnectionCore`], which keeps wire order and makes state checks and sends
//! atomic with respect to transitions.

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::error::{PusherError, Result};
use crate::event::ConnectionEventListener;
use crate::message::{ConnectionData, ErrorData, PusherMessage, events};
use crate::queue::EventQueue;
use crate::transport::{Transport, TransportEvent, TransportFactory};

/// Activity timeout used when the server does not announce one
const DEFAULT_ACTIVITY_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    /// Binding wildcard; never a live state
    All,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::All => "ALL",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStateChange {
    previous: ConnectionState,
    current: ConnectionState,
}

impl ConnectionStateChange {
    pub fn new(previous: ConnectionState, current: ConnectionState) -> Self {
        Self { previous, current }
    }

    pub fn previous(&self) -> ConnectionState {
        self.previous
    }

    pub fn current(&self) -> ConnectionState {
        self.current
    }
}

/// Receives channel-scoped frames and the disconnect notification
#[async_trait]
pub trait ChannelRouter: Send + Sync {
    async fn route(&self, channel: &str, event: &str, raw: &str);

    /// Drop all channel state; called on every transition into DISCONNECTED
    async fn clear(&self);
}

/// State guarded by the connection lock
pub(crate) struct ConnectionCore {
    state: ConnectionState,
    socket_id: Option<String>,
    transport: Option<Box<dyn Transport>>,
    /// Bumped on every new session and on teardown; events of older sessions are dropped
    generation: u64,
}

impl ConnectionCore {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn socket_id(&self) -> Option<&str> {
        self.socket_id.as_deref()
    }

    /// The socket id, or an invalid-state error unless CONNECTED
    pub fn require_connected(&self) -> Result<&str> {
        match (self.state, self.socket_id.as_deref()) {
            (ConnectionState::Connected, Some(socket_id)) => Ok(socket_id),
            (state, _) => Err(PusherError::InvalidState(format!(
                "cannot perform this operation while {}",
                state
            ))),
        }
    }

    pub async fn send(&mut self, text: String) -> Result<()> {
        match self.transport.as_mut() {
            Some(transport) => {
                trace!("Sending message: {}", text);
                transport.send(text).await
            }
            None => Err(PusherError::InvalidState(
                "transport is not open".to_string(),
            )),
        }
    }
}

struct ConnectionInner {
    url: Url,
    transports: Arc<dyn TransportFactory>,
    queue: EventQueue,
    event_buffer: usize,
    activity_timeout: Option<Duration>,
    core: Mutex<ConnectionCore>,
    listeners: Mutex<Vec<(ConnectionState, Arc<dyn ConnectionEventListener>)>>,
    router: OnceLock<Weak<dyn ChannelRouter>>,
}

/// Handle to the connection state machine; clones share one connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

fn same_listener(
    a: &Arc<dyn ConnectionEventListener>,
    b: &Arc<dyn ConnectionEventListener>,
) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Connection {
    pub fn new(
        url: Url,
        transports: Arc<dyn TransportFactory>,
        queue: EventQueue,
        event_buffer: usize,
        activity_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                url,
                transports,
                queue,
                event_buffer: event_buffer.max(1),
                activity_timeout,
                core: Mutex::new(ConnectionCore {
                    state: ConnectionState::Disconnected,
                    socket_id: None,
                    transport: None,
                    generation: 0,
                }),
                listeners: Mutex::new(Vec::new()),
                router: OnceLock::new(),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Install the receiver of channel-scoped frames. Only the first call takes effect.
    pub fn set_router(&self, router: Weak<dyn ChannelRouter>) {
        if self.inner.router.set(router).is_err() {
            warn!("Channel router already set, ignoring");
        }
    }

    fn router(&self) -> Option<Arc<dyn ChannelRouter>> {
        self.inner.router.get().and_then(Weak::upgrade)
    }

    /// Bind a listener to a state, or to every state with [`ConnectionState::All`]
    pub async fn bind(&self, state: ConnectionState, listener: Arc<dyn ConnectionEventListener>) {
        let mut listeners = self.inner.listeners.lock().await;
        if !listeners
            .iter()
            .any(|(s, l)| *s == state && same_listener(l, &listener))
        {
            listeners.push((state, listener));
        }
    }

    /// Returns true if the listener was bound to `state`
    pub async fn unbind(
        &self,
        state: ConnectionState,
        listener: &Arc<dyn ConnectionEventListener>,
    ) -> bool {
        let mut listeners = self.inner.listeners.lock().await;
        let before = listeners.len();
        listeners.retain(|(s, l)| !(*s == state && same_listener(l, listener)));
        listeners.len() != before
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.core.lock().await.state
    }

    pub async fn socket_id(&self) -> Option<String> {
        self.inner.core.lock().await.socket_id.clone()
    }

    pub(crate) async fn lock_core(&self) -> MutexGuard<'_, ConnectionCore> {
        self.inner.core.lock().await
    }

    /// Send a raw frame on the open transport
    pub async fn send(&self, text: String) -> Result<()> {
        self.inner.core.lock().await.send(text).await
    }

    /// Open a new transport. A no-op while CONNECTING or CONNECTED.
    ///
    /// The connection lock is not held while the transport opens, so state
    /// queries and CONNECTING listeners are not blocked by the handshake.
    pub async fn connect(&self) -> Result<()> {
        let generation = {
            let mut core = self.inner.core.lock().await;

            if core.state != ConnectionState::Disconnected {
                debug!("Connect ignored while {}", core.state);
                return Ok(());
            }

            core.generation += 1;
            self.transition(&mut core, ConnectionState::Connecting).await;
            core.generation
        };
        self.inner.queue.flush().await;

        let (tx, rx) = mpsc::channel::<TransportEvent>(self.inner.event_buffer);
        let mut transport = self.inner.transports.create();

        info!("Connecting to {}", self.inner.url);
        let opened = transport.open(&self.inner.url, tx).await;

        let mut core = self.inner.core.lock().await;
        if core.generation != generation {
            drop(core);
            debug!("Session {} superseded while opening", generation);
            if opened.is_ok()
                && let Err(e) = transport.close().await
            {
                warn!("Error closing superseded transport: {}", e);
            }
            return Ok(());
        }

        if let Err(e) = opened {
            error!("Failed to open transport: {}", e);
            self.notify_error(e.to_string(), None).await;
            core.generation += 1;
            self.transition(&mut core, ConnectionState::Disconnected).await;
            drop(core);
            self.inner.queue.flush().await;
            return Err(e);
        }

        core.transport = Some(transport);
        drop(core);

        self.spawn_event_pump(generation, rx);
        Ok(())
    }

    /// Close the transport. A no-op unless CONNECTED.
    pub async fn disconnect(&self) -> Result<()> {
        let mut core = self.inner.core.lock().await;

        if core.state != ConnectionState::Connected {
            debug!("Disconnect ignored while {}", core.state);
            return Ok(());
        }

        self.transition(&mut core, ConnectionState::Disconnecting).await;

        if let Some(transport) = core.transport.as_mut()
            && let Err(e) = transport.close().await
        {
            warn!("Error closing transport: {}", e);
        }

        self.enter_disconnected(&mut core).await;
        drop(core);

        self.inner.queue.flush().await;
        Ok(())
    }

    /// Feed one transport event through the state machine
    #[cfg(test)]
    pub(crate) async fn process(&self, event: TransportEvent) {
        let generation = self.inner.core.lock().await.generation;
        self.handle(generation, event).await;
    }

    fn spawn_event_pump(&self, generation: u64, mut events: mpsc::Receiver<TransportEvent>) {
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Connection { inner }.handle(generation, event).await;
            }
            trace!("Event pump for session {} finished", generation);
        });
    }

    async fn handle(&self, generation: u64, event: TransportEvent) {
        self.process_event(generation, event).await;
        // Every lock taken while processing has been released by now.
        self.inner.queue.flush().await;
    }

    async fn process_event(&self, generation: u64, event: TransportEvent) {
        match event {
            TransportEvent::Open => debug!("Transport open, awaiting connection_established"),
            TransportEvent::Message(text) => self.handle_message(generation, &text).await,
            TransportEvent::Close {
                code,
                reason,
                remote,
            } => self.handle_close(generation, code, &reason, remote).await,
            TransportEvent::Error(cause) => {
                if self.is_current(generation).await {
                    warn!("Transport error: {}", cause);
                    self.notify_error(cause, None).await;
                }
            }
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.inner.core.lock().await.generation == generation
    }

    async fn handle_message(&self, generation: u64, text: &str) {
        trace!("Received message: {}", text);

        let message = match PusherMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed frame: {}", e);
                return;
            }
        };

        if let Some(channel) = message.channel.as_deref() {
            if !self.is_current(generation).await {
                return;
            }
            match self.router() {
                Some(router) => router.route(channel, &message.event, text).await,
                None => debug!("No channel router, dropping {} on {}", message.event, channel),
            }
            return;
        }

        match message.event.as_str() {
            events::CONNECTION_ESTABLISHED => {
                self.on_connection_established(generation, &message).await
            }
            events::ERROR => self.on_protocol_error(generation, &message).await,
            events::PING => {
                let mut core = self.inner.core.lock().await;
                if core.generation == generation
                    && let Err(e) = core.send(PusherMessage::pong()).await
                {
                    warn!("Failed to answer ping: {}", e);
                }
            }
            events::PONG => trace!("Pong received"),
            other => debug!("Discarding unhandled frame {}", other),
        }
    }

    async fn on_connection_established(&self, generation: u64, message: &PusherMessage) {
        let data: ConnectionData = match message.data_as() {
            Ok(data) => data,
            Err(e) => {
                warn!("Malformed connection_established: {}", e);
                return;
            }
        };

        let mut core = self.inner.core.lock().await;
        if core.generation != generation {
            return;
        }

        match core.state {
            ConnectionState::Connecting => {}
            ConnectionState::Connected => {
                debug!("Ignoring duplicate connection_established");
                return;
            }
            other => {
                warn!("Ignoring connection_established while {}", other);
                return;
            }
        }

        debug!("Connection established with socket ID: {}", data.socket_id);
        core.socket_id = Some(data.socket_id);
        self.transition(&mut core, ConnectionState::Connected).await;
        drop(core);

        let timeout = self.inner.activity_timeout.unwrap_or_else(|| {
            Duration::from_secs(data.activity_timeout.unwrap_or(DEFAULT_ACTIVITY_TIMEOUT_SECS))
        });
        self.spawn_activity_monitor(generation, timeout);
    }

    async fn on_protocol_error(&self, generation: u64, message: &PusherMessage) {
        if !self.is_current(generation).await {
            return;
        }

        match message.data_as::<ErrorData>() {
            Ok(data) => {
                error!("Pusher error: {} (code: {:?})", data.message, data.code);
                self.notify_error(data.message, data.code).await;
            }
            Err(e) => warn!("Malformed pusher:error frame: {}", e),
        }
    }

    async fn handle_close(&self, generation: u64, code: u16, reason: &str, remote: bool) {
        let mut core = self.inner.core.lock().await;
        if core.generation != generation {
            trace!("Ignoring close of superseded session");
            return;
        }

        info!("Transport closed (code {}, remote {}): {}", code, remote, reason);
        if core.state != ConnectionState::Disconnected {
            self.enter_disconnected(&mut core).await;
        }
    }

    /// Move through DISCONNECTING to DISCONNECTED. Channel state is dropped
    /// before the DISCONNECTED notification is queued.
    async fn enter_disconnected(&self, core: &mut ConnectionCore) {
        self.transition(core, ConnectionState::Disconnecting).await;

        core.transport = None;
        core.socket_id = None;
        core.generation += 1;

        if let Some(router) = self.router() {
            router.clear().await;
        }

        self.transition(core, ConnectionState::Disconnected).await;
    }

    async fn transition(&self, core: &mut ConnectionCore, next: ConnectionState) {
        let previous = core.state;
        if previous == next {
            return;
        }

        core.state = next;
        debug!("Connection state {} -> {}", previous, next);

        let change = ConnectionStateChange::new(previous, next);
        for listener in self.listeners_for(Some(next)).await {
            self.inner.queue.dispatch(Box::pin(async move {
                listener.on_connection_state_change(change).await;
            }));
        }
    }

    async fn notify_error(&self, message: String, code: Option<u32>) {
        for listener in self.listeners_for(None).await {
            let message = message.clone();
            self.inner.queue.dispatch(Box::pin(async move {
                listener.on_error(&message, code).await;
            }));
        }
    }

    /// Distinct listeners bound to `state` or to ALL; every listener when `state` is None
    async fn listeners_for(
        &self,
        state: Option<ConnectionState>,
    ) -> Vec<Arc<dyn ConnectionEventListener>> {
        let listeners = self.inner.listeners.lock().await;
        let mut targets: Vec<Arc<dyn ConnectionEventListener>> = Vec::new();

        for (bound, listener) in listeners.iter() {
            let matches = match state {
                Some(state) => *bound == state || *bound == ConnectionState::All,
                None => true,
            };
            if matches && !targets.iter().any(|l| same_listener(l, listener)) {
                targets.push(Arc::clone(listener));
            }
        }
        targets
    }

    fn spawn_activity_monitor(&self, generation: u64, period: Duration) {
        if period.is_zero() {
            return;
        }

        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let mut core = inner.core.lock().await;
                if core.generation != generation || core.state != ConnectionState::Connected {
                    break;
                }

                if let Err(e) = core.send(PusherMessage::ping()).await {
                    error!("Failed to send ping message: {}", e);
                    break;
                }
                debug!("Ping message sent");
            }
        });
    }
}
