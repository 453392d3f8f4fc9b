use std::sync::{Arc, Weak};

use serde_json::Value;
use tracing::{debug, info};

use crate::channel::{ChannelKind, ChannelState};
use crate::channel_manager::ChannelManager;
use crate::connection::{ChannelRouter, Connection, ConnectionState};
use crate::error::{PusherError, Result};
use crate::event::{ChannelEventListener, ConnectionEventListener, PresenceChannelEventListener};
use crate::options::PusherOptions;
use crate::presence::Member;
use crate::queue::EventQueue;

/// Client for a Pusher-protocol messaging service
pub struct Pusher {
    app_key: String,
    options: PusherOptions,
    connection: Connection,
    channels: Arc<ChannelManager>,
}

impl Pusher {
    /// Create a new client. Must be called inside a Tokio runtime when the
    /// sequential delivery mode is selected.
    pub fn new(app_key: &str, options: PusherOptions) -> Result<Self> {
        let url = options.url(app_key)?;
        let queue = EventQueue::new(options.delivery())?;

        let connection = Connection::new(
            url,
            options.transports(),
            queue.clone(),
            options.event_buffer(),
            options.activity_timeout(),
        );
        let channels = Arc::new(ChannelManager::new(
            connection.clone(),
            options.authorizer(),
            queue,
        ));
        let router: Weak<dyn ChannelRouter> = Arc::downgrade(&channels) as Weak<dyn ChannelRouter>;
        connection.set_router(router);

        debug!("Created client for {}", connection.url());

        Ok(Self {
            app_key: app_key.to_string(),
            options,
            connection,
            channels,
        })
    }

    pub fn app_key(&self) -> &str {
        &self.app_key
    }

    pub fn options(&self) -> &PusherOptions {
        &self.options
    }

    /// The underlying connection handle
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Connect to the service. Does nothing while already connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        info!("Connecting client {}", self.app_key);
        self.connection.connect().await
    }

    /// Bind `listener` to `states` (to every state if empty), then connect
    pub async fn connect_with(
        &self,
        listener: Arc<dyn ConnectionEventListener>,
        states: &[ConnectionState],
    ) -> Result<()> {
        if states.is_empty() {
            self.connection
                .bind(ConnectionState::All, Arc::clone(&listener))
                .await;
        }
        for state in states {
            self.connection.bind(*state, Arc::clone(&listener)).await;
        }

        self.connect().await
    }

    pub async fn bind(&self, state: ConnectionState, listener: Arc<dyn ConnectionEventListener>) {
        self.connection.bind(state, listener).await;
    }

    pub async fn unbind(
        &self,
        state: ConnectionState,
        listener: &Arc<dyn ConnectionEventListener>,
    ) -> bool {
        self.connection.unbind(state, listener).await
    }

    /// Close the connection. Does nothing unless connected.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Subscribe to a public channel
    pub async fn subscribe(
        &self,
        name: &str,
        listener: Arc<dyn ChannelEventListener>,
        event_names: &[&str],
    ) -> Result<()> {
        self.channels.subscribe_to(name, listener, event_names).await
    }

    /// Subscribe to a `private-` channel; needs an authorizer
    pub async fn subscribe_private(
        &self,
        name: &str,
        listener: Arc<dyn ChannelEventListener>,
        event_names: &[&str],
    ) -> Result<()> {
        require_kind(name, ChannelKind::Private)?;
        self.channels.subscribe_to(name, listener, event_names).await
    }

    /// Subscribe to a `presence-` channel; needs an authorizer
    pub async fn subscribe_presence<L>(
        &self,
        name: &str,
        listener: Arc<L>,
        event_names: &[&str],
    ) -> Result<()>
    where
        L: PresenceChannelEventListener + 'static,
    {
        require_kind(name, ChannelKind::Presence)?;
        self.channels
            .subscribe_presence_to(name, listener, event_names)
            .await
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        self.channels.unsubscribe_from(name).await
    }

    /// Bind another listener to `event` on a subscribed channel
    pub async fn bind_channel(
        &self,
        name: &str,
        event: &str,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Result<()> {
        self.channels.bind(name, event, listener).await
    }

    pub async fn unbind_channel(
        &self,
        name: &str,
        event: &str,
        listener: &Arc<dyn ChannelEventListener>,
    ) -> bool {
        self.channels.unbind(name, event, listener).await
    }

    /// Send a client event on a subscribed private or presence channel
    pub async fn trigger(&self, channel: &str, event: &str, data: Value) -> Result<()> {
        self.channels.trigger(channel, event, data).await
    }

    pub async fn state(&self) -> ConnectionState {
        self.connection.state().await
    }

    pub async fn socket_id(&self) -> Option<String> {
        self.connection.socket_id().await
    }

    pub async fn channel_state(&self, name: &str) -> Option<ChannelState> {
        self.channels.channel_state(name).await
    }

    pub async fn members(&self, name: &str) -> Option<Vec<Member>> {
        self.channels.members(name).await
    }

    pub async fn me(&self, name: &str) -> Option<Member> {
        self.channels.me(name).await
    }
}

fn require_kind(name: &str, kind: ChannelKind) -> Result<()> {
    if ChannelKind::from_name(name) == kind {
        return Ok(());
    }

    let prefix = match kind {
        ChannelKind::Private => ChannelKind::PRIVATE_PREFIX,
        ChannelKind::Presence => ChannelKind::PRESENCE_PREFIX,
        ChannelKind::Public => "",
    };
    Err(PusherError::InvalidArgument(format!(
        "channel {} must start with {}",
        name, prefix
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DeliveryMode;
    use crate::testing::{
        ESTABLISHED, MockTransportFactory, RecordingChannelListener, RecordingConnectionListener,
        RecordingPresenceListener, StaticAuthorizer,
    };
    use crate::connection::ConnectionStateChange;
    use crate::transport::TransportEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    fn options(transports: Arc<MockTransportFactory>) -> PusherOptions {
        PusherOptions::new()
            .with_transport(transports)
            .with_delivery(DeliveryMode::Immediate)
            .with_activity_timeout(Duration::ZERO)
    }

    async fn connected(pusher: &Pusher) {
        pusher.connect().await.unwrap();
        pusher
            .connection()
            .process(TransportEvent::Message(ESTABLISHED.to_string()))
            .await;
    }

    #[test]
    fn empty_app_key_is_rejected() {
        let result = Pusher::new("", options(MockTransportFactory::new()));
        assert!(matches!(result, Err(PusherError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn connect_with_binds_listener_to_all_states() {
        let transports = MockTransportFactory::new();
        let pusher = Pusher::new("123456", options(transports.clone())).unwrap();
        let listener = RecordingConnectionListener::new();

        pusher.connect_with(listener.clone(), &[]).await.unwrap();

        assert_eq!(transports.opened(), 1);
        assert_eq!(pusher.state().await, ConnectionState::Connecting);
        assert_eq!(listener.changes().len(), 1);
    }

    #[tokio::test]
    async fn connect_with_binds_listener_to_given_states() {
        let pusher = Pusher::new("123456", options(MockTransportFactory::new())).unwrap();
        let listener = RecordingConnectionListener::new();

        pusher
            .connect_with(listener.clone(), &[ConnectionState::Connected])
            .await
            .unwrap();
        assert!(listener.changes().is_empty());

        pusher
            .connection()
            .process(TransportEvent::Message(ESTABLISHED.to_string()))
            .await;
        assert_eq!(listener.changes().len(), 1);
        assert_eq!(pusher.socket_id().await.as_deref(), Some("21112.816204"));
    }

    #[tokio::test]
    async fn subscribe_private_requires_prefix() {
        let pusher = Pusher::new(
            "123456",
            options(MockTransportFactory::new()).with_authorizer(StaticAuthorizer::new()),
        )
        .unwrap();
        connected(&pusher).await;

        let result = pusher
            .subscribe_private("my-channel", RecordingChannelListener::new(), &[])
            .await;
        assert!(matches!(result, Err(PusherError::InvalidArgument(_))));

        let result = pusher
            .subscribe_presence("private-room", RecordingPresenceListener::new(), &[])
            .await;
        assert!(matches!(result, Err(PusherError::InvalidArgument(_))));

        pusher
            .subscribe_private("private-room", RecordingChannelListener::new(), &[])
            .await
            .unwrap();
        assert_eq!(
            pusher.channel_state("private-room").await,
            Some(ChannelState::SubscribeSent)
        );
    }

    #[tokio::test]
    async fn unsubscribe_then_resubscribe() {
        let transports = MockTransportFactory::new();
        let pusher = Pusher::new("123456", options(transports.clone())).unwrap();
        connected(&pusher).await;
        let listener = RecordingChannelListener::new();

        pusher.subscribe("my-channel", listener.clone(), &[]).await.unwrap();
        pusher.unsubscribe("my-channel").await.unwrap();
        pusher.subscribe("my-channel", listener, &[]).await.unwrap();

        assert_eq!(transports.sent().len(), 3);
    }

    /// Connection and channel listener that calls back into its own client
    struct Reentrant {
        pusher: Weak<Pusher>,
        calls: Mutex<Vec<String>>,
    }

    impl Reentrant {
        fn new(pusher: &Arc<Pusher>) -> Arc<Self> {
            Arc::new(Self {
                pusher: Arc::downgrade(pusher),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ConnectionEventListener for Reentrant {
        async fn on_connection_state_change(&self, _change: ConnectionStateChange) {
            let pusher = self.pusher.upgrade().unwrap();
            let state = pusher.state().await;
            let result = pusher
                .subscribe("my-channel", RecordingChannelListener::new(), &[])
                .await;
            self.calls
                .lock()
                .unwrap()
                .push(format!("{:?} subscribe={}", state, result.is_ok()));
        }
    }

    #[async_trait]
    impl ChannelEventListener for Reentrant {
        async fn on_event(&self, channel: &str, _event: &str, _data: &str) {
            let pusher = self.pusher.upgrade().unwrap();
            let state = pusher.channel_state(channel).await;
            let result = pusher.unsubscribe(channel).await;
            self.calls
                .lock()
                .unwrap()
                .push(format!("{:?} unsubscribe={}", state, result.is_ok()));
        }
    }

    #[tokio::test]
    async fn immediate_listeners_can_call_back_into_the_client() {
        let transports = MockTransportFactory::new();
        let pusher = Arc::new(Pusher::new("123456", options(transports.clone())).unwrap());
        let listener = Reentrant::new(&pusher);
        pusher.bind(ConnectionState::Connected, listener.clone()).await;

        timeout(Duration::from_secs(2), connected(&pusher))
            .await
            .expect("connection listener blocked on the client");
        assert_eq!(listener.calls(), vec!["Connected subscribe=true"]);

        pusher.subscribe("other", listener.clone(), &[]).await.unwrap();
        let frame = r#"{"event":"bye","channel":"other","data":{}}"#;
        timeout(
            Duration::from_secs(2),
            pusher
                .connection()
                .process(TransportEvent::Message(frame.to_string())),
        )
        .await
        .expect("channel listener blocked on the client");

        assert_eq!(
            listener.calls(),
            vec![
                "Connected subscribe=true",
                "Some(SubscribeSent) unsubscribe=true"
            ]
        );
        assert_eq!(pusher.channel_state("other").await, None);
        assert_eq!(pusher.channel_state("my-channel").await, Some(ChannelState::SubscribeSent));
        assert_eq!(transports.sent().len(), 3);
    }
}
