//! Recording doubles shared by the unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::auth::{AuthToken, Authorizer};
use crate::connection::ConnectionStateChange;
use crate::error::{PusherError, Result};
use crate::event::{ChannelEventListener, ConnectionEventListener, PresenceChannelEventListener};
use crate::presence::Member;
use crate::transport::{Transport, TransportEvent, TransportFactory};

pub const ESTABLISHED: &str =
    r#"{"event":"pusher:connection_established","data":"{\"socket_id\":\"21112.816204\"}"}"#;
pub const SOCKET_ID: &str = "21112.816204";

#[derive(Default)]
pub struct MockState {
    pub opened: usize,
    pub closed: usize,
    pub sent: Vec<String>,
    pub events: Option<mpsc::Sender<TransportEvent>>,
}

/// Transport factory whose transports record every call into one shared state
#[derive(Clone, Default)]
pub struct MockTransportFactory {
    pub state: Arc<Mutex<MockState>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn sent(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, _url: &Url, events: mpsc::Sender<TransportEvent>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.opened += 1;
        state.events = Some(events);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.state.lock().unwrap().sent.push(text);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().unwrap().closed += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingConnectionListener {
    changes: Mutex<Vec<ConnectionStateChange>>,
    errors: Mutex<Vec<(String, Option<u32>)>>,
}

impl RecordingConnectionListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn changes(&self) -> Vec<ConnectionStateChange> {
        self.changes.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(String, Option<u32>)> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionEventListener for RecordingConnectionListener {
    async fn on_connection_state_change(&self, change: ConnectionStateChange) {
        self.changes.lock().unwrap().push(change);
    }

    async fn on_error(&self, message: &str, code: Option<u32>) {
        self.errors.lock().unwrap().push((message.to_string(), code));
    }
}

#[derive(Default)]
pub struct RecordingChannelListener {
    events: Mutex<Vec<(String, String, String)>>,
    subscribed: Mutex<Vec<String>>,
}

impl RecordingChannelListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<(String, String, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.subscribed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelEventListener for RecordingChannelListener {
    async fn on_event(&self, channel: &str, event: &str, data: &str) {
        self.events
            .lock()
            .unwrap()
            .push((channel.to_string(), event.to_string(), data.to_string()));
    }

    async fn on_subscription_succeeded(&self, channel: &str) {
        self.subscribed.lock().unwrap().push(channel.to_string());
    }
}

#[derive(Default)]
pub struct RecordingPresenceListener {
    pub channel: RecordingChannelListener,
    snapshots: Mutex<Vec<Vec<String>>>,
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
}

impl RecordingPresenceListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshots(&self) -> Vec<Vec<String>> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn added(&self) -> Vec<String> {
        self.added.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelEventListener for RecordingPresenceListener {
    async fn on_event(&self, channel: &str, event: &str, data: &str) {
        self.channel.on_event(channel, event, data).await;
    }

    async fn on_subscription_succeeded(&self, channel: &str) {
        self.channel.on_subscription_succeeded(channel).await;
    }
}

#[async_trait]
impl PresenceChannelEventListener for RecordingPresenceListener {
    async fn on_users_information_received(&self, _channel: &str, members: &[Member]) {
        self.snapshots
            .lock()
            .unwrap()
            .push(members.iter().map(|m| m.id.clone()).collect());
    }

    async fn on_member_added(&self, _channel: &str, member: &Member) {
        self.added.lock().unwrap().push(member.id.clone());
    }

    async fn on_member_removed(&self, _channel: &str, member: &Member) {
        self.removed.lock().unwrap().push(member.id.clone());
    }
}

/// Authorizer returning a fixed token, or failing when built with `failing()`
#[derive(Default)]
pub struct StaticAuthorizer {
    pub calls: Mutex<Vec<(String, String)>>,
    fail: bool,
    channel_data: Option<String>,
}

impl StaticAuthorizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_channel_data(channel_data: &str) -> Arc<Self> {
        Arc::new(Self {
            channel_data: Some(channel_data.to_string()),
            ..Self::default()
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(&self, channel_name: &str, socket_id: &str) -> Result<AuthToken> {
        self.calls
            .lock()
            .unwrap()
            .push((channel_name.to_string(), socket_id.to_string()));

        if self.fail {
            return Err(PusherError::AuthError("denied".to_string()));
        }

        let token = AuthToken::new(format!("key:{}", channel_name));
        Ok(match &self.channel_data {
            Some(data) => token.with_channel_data(data.clone()),
            None => token,
        })
    }
}
