//! Channel subscription and routing.
//!
//! Keeps at most one [`Channel`] per name and mediates subscribe and
//! unsubscribe against the connection state. The map is only mutated while the
//! connection lock is held, so a subscribe racing a disconnect either lands
//! before the clear or is rejected.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{AuthToken, Authorizer};
use crate::channel::{Channel, ChannelState};
use crate::connection::{ChannelRouter, Connection, ConnectionState};
use crate::error::{PusherError, Result};
use crate::event::{ChannelEventListener, PresenceChannelEventListener};
use crate::message::{ClientEventMessage, SubscribeMessage, events};
use crate::presence::Member;
use crate::queue::EventQueue;

pub struct ChannelManager {
    connection: Connection,
    authorizer: Option<Arc<dyn Authorizer>>,
    queue: EventQueue,
    channels: Mutex<HashMap<String, Channel>>,
}

impl ChannelManager {
    pub fn new(
        connection: Connection,
        authorizer: Option<Arc<dyn Authorizer>>,
        queue: EventQueue,
    ) -> Self {
        Self {
            connection,
            authorizer,
            queue,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to `name`, binding `listener` to `event_names` (to every event if empty).
    ///
    /// Private and presence channels are authorized first; this call waits for
    /// the authorizer to answer.
    pub async fn subscribe_to(
        &self,
        name: &str,
        listener: Arc<dyn ChannelEventListener>,
        event_names: &[&str],
    ) -> Result<()> {
        self.subscribe_with(name, listener, None, event_names).await
    }

    /// Like [`subscribe_to`](Self::subscribe_to), also delivering membership changes to `listener`
    pub async fn subscribe_presence_to<L>(
        &self,
        name: &str,
        listener: Arc<L>,
        event_names: &[&str],
    ) -> Result<()>
    where
        L: PresenceChannelEventListener + 'static,
    {
        let presence: Arc<dyn PresenceChannelEventListener> = listener.clone();
        self.subscribe_with(name, listener, Some(presence), event_names).await
    }

    async fn subscribe_with(
        &self,
        name: &str,
        listener: Arc<dyn ChannelEventListener>,
        presence: Option<Arc<dyn PresenceChannelEventListener>>,
        event_names: &[&str],
    ) -> Result<()> {
        let mut channel = Channel::new(name)?;

        let socket_id = {
            let core = self.connection.lock_core().await;
            core.require_connected()?.to_string()
        };

        if self.channels.lock().await.contains_key(name) {
            return Err(PusherError::DuplicateSubscription(name.to_string()));
        }

        channel.add_subscriber(Arc::clone(&listener));
        if event_names.is_empty() {
            channel.bind_all(Arc::clone(&listener));
        }
        for event in event_names {
            channel.bind(event, Arc::clone(&listener))?;
        }
        if let Some(presence) = presence {
            channel.set_presence_listener(presence);
        }

        if channel.kind().requires_auth() {
            let token = self.authorize(name, &socket_id).await?;
            channel.set_auth(token);
        }

        // The connection may have dropped while authorizing.
        let mut core = self.connection.lock_core().await;
        if core.state() != ConnectionState::Connected
            || core.socket_id() != Some(socket_id.as_str())
        {
            warn!("Connection changed while subscribing to {}, discarding", name);
            return Err(PusherError::InvalidState(format!(
                "connection changed while subscribing to {}",
                name
            )));
        }

        let mut channels = self.channels.lock().await;
        if channels.contains_key(name) {
            return Err(PusherError::DuplicateSubscription(name.to_string()));
        }

        core.send(channel.subscription_message()?).await?;
        channel.subscribe_sent();
        channels.insert(name.to_string(), channel);

        info!("Subscribing to {}", name);
        Ok(())
    }

    async fn authorize(&self, name: &str, socket_id: &str) -> Result<AuthToken> {
        let authorizer = self.authorizer.as_ref().ok_or_else(|| {
            PusherError::AuthError(format!("no authorizer configured for {}", name))
        })?;

        authorizer
            .authorize(name, socket_id)
            .await
            .map_err(|e| match e {
                PusherError::AuthError(_) => e,
                other => PusherError::AuthError(other.to_string()),
            })
    }

    /// Forget `name` and tell the server. Unknown names are ignored.
    pub async fn unsubscribe_from(&self, name: &str) -> Result<()> {
        let mut core = self.connection.lock_core().await;
        core.require_connected()?;

        let mut channels = self.channels.lock().await;
        if channels.remove(name).is_none() {
            debug!("Not subscribed to {}, nothing to unsubscribe", name);
            return Ok(());
        }

        core.send(SubscribeMessage::unsubscribe(name).to_json()?).await
    }

    /// Send a client event on a subscribed private or presence channel
    pub async fn trigger(&self, name: &str, event: &str, data: Value) -> Result<()> {
        if event.is_empty() {
            return Err(PusherError::InvalidArgument(
                "event name must not be empty".to_string(),
            ));
        }

        let event = if event.starts_with(events::CLIENT_PREFIX) {
            event.to_string()
        } else {
            format!("{}{}", events::CLIENT_PREFIX, event)
        };

        let mut core = self.connection.lock_core().await;
        core.require_connected()?;

        let channels = self.channels.lock().await;
        let channel = channels.get(name).ok_or_else(|| {
            PusherError::InvalidState(format!("not subscribed to {}", name))
        })?;

        if !channel.kind().requires_auth() {
            return Err(PusherError::InvalidArgument(format!(
                "client events are only allowed on private and presence channels, not {}",
                name
            )));
        }
        if channel.state() != ChannelState::Subscribed {
            return Err(PusherError::InvalidState(format!(
                "subscription to {} has not succeeded yet",
                name
            )));
        }

        let message = ClientEventMessage {
            event,
            channel: name.to_string(),
            data,
        };
        core.send(serde_json::to_string(&message)?).await
    }

    /// Bind another listener to `event` on an already tracked channel
    pub async fn bind(
        &self,
        name: &str,
        event: &str,
        listener: Arc<dyn ChannelEventListener>,
    ) -> Result<()> {
        let mut channels = self.channels.lock().await;
        match channels.get_mut(name) {
            Some(channel) => channel.bind(event, listener),
            None => Err(PusherError::InvalidState(format!(
                "not subscribed to {}",
                name
            ))),
        }
    }

    /// Returns true if the listener was bound to `event` on `name`
    pub async fn unbind(
        &self,
        name: &str,
        event: &str,
        listener: &Arc<dyn ChannelEventListener>,
    ) -> bool {
        self.channels
            .lock()
            .await
            .get_mut(name)
            .is_some_and(|channel| channel.unbind(event, listener))
    }

    pub async fn channel_state(&self, name: &str) -> Option<ChannelState> {
        self.channels.lock().await.get(name).map(Channel::state)
    }

    /// Names of all tracked channels
    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current members of a presence channel
    pub async fn members(&self, name: &str) -> Option<Vec<Member>> {
        self.channels
            .lock()
            .await
            .get(name)
            .and_then(Channel::members)
            .map(|members| members.to_vec())
    }

    /// The local member of a presence channel
    pub async fn me(&self, name: &str) -> Option<Member> {
        self.channels
            .lock()
            .await
            .get(name)
            .and_then(Channel::members)
            .and_then(|members| members.me())
    }

    /// Drop every channel without sending unsubscribe frames
    pub async fn clear(&self) {
        let mut channels = self.channels.lock().await;
        debug!("Clearing {} channel(s)", channels.len());
        channels.clear();
    }
}

#[async_trait]
impl ChannelRouter for ChannelManager {
    async fn route(&self, channel: &str, event: &str, raw: &str) {
        {
            let mut channels = self.channels.lock().await;
            match channels.get_mut(channel) {
                Some(target) => target.on_message(event, raw, &self.queue),
                None => {
                    debug!("Discarding {} for unknown channel {}", event, channel);
                    return;
                }
            }
        }
        self.queue.flush().await;
    }

    async fn clear(&self) {
        ChannelManager::clear(self).await;
    }
}
