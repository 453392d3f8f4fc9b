use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::auth::AuthToken;
use crate::error::{PusherError, Result};
use crate::event::{ChannelEventListener, PresenceChannelEventListener};
use crate::message::{MemberData, PresenceData, PusherMessage, SubscribeMessage, events, member_id};
use crate::presence::{Member, Members};
use crate::queue::EventQueue;

/// Channel variant, derived from the channel name prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Public,
    Private,
    Presence,
}

impl ChannelKind {
    pub const PRIVATE_PREFIX: &'static str = "private-";
    pub const PRESENCE_PREFIX: &'static str = "presence-";

    pub fn from_name(name: &str) -> Self {
        if name.starts_with(Self::PRESENCE_PREFIX) {
            Self::Presence
        } else if name.starts_with(Self::PRIVATE_PREFIX) {
            Self::Private
        } else {
            Self::Public
        }
    }

    /// Whether subscribing needs a token from an authorizer
    pub fn requires_auth(self) -> bool {
        !matches!(self, Self::Public)
    }

    pub fn tracks_presence(self) -> bool {
        matches!(self, Self::Presence)
    }
}

/// Subscription lifecycle of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initial,
    SubscribeSent,
    Subscribed,
}

struct PresenceTracker {
    members: Members,
    listener: Option<Arc<dyn PresenceChannelEventListener>>,
}

/// A named subscription scope with its event bindings
pub struct Channel {
    name: String,
    kind: ChannelKind,
    state: ChannelState,
    bindings: HashMap<String, Vec<Arc<dyn ChannelEventListener>>>,
    catch_all: Vec<Arc<dyn ChannelEventListener>>,
    subscribers: Vec<Arc<dyn ChannelEventListener>>,
    auth: Option<AuthToken>,
    presence: Option<PresenceTracker>,
}

fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn push_unique(
    listeners: &mut Vec<Arc<dyn ChannelEventListener>>,
    listener: Arc<dyn ChannelEventListener>,
) {
    if !listeners.iter().any(|l| same_listener(l, &listener)) {
        listeners.push(listener);
    }
}

impl Channel {
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() {
            return Err(PusherError::InvalidArgument(
                "channel name must not be empty".to_string(),
            ));
        }

        let kind = ChannelKind::from_name(name);
        let presence = kind.tracks_presence().then(|| PresenceTracker {
            members: Members::new(),
            listener: None,
        });

        Ok(Self {
            name: name.to_string(),
            kind,
            state: ChannelState::Initial,
            bindings: HashMap::new(),
            catch_all: Vec::new(),
            subscribers: Vec::new(),
            auth: None,
            presence,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Bind `listener` to `event`. A listener is held at most once per event.
    pub fn bind(&mut self, event: &str, listener: Arc<dyn ChannelEventListener>) -> Result<()> {
        if event.is_empty() {
            return Err(PusherError::InvalidArgument(
                "event name must not be empty".to_string(),
            ));
        }

        push_unique(self.bindings.entry(event.to_string()).or_default(), listener);
        Ok(())
    }

    /// Bind `listener` to every event delivered on this channel
    pub fn bind_all(&mut self, listener: Arc<dyn ChannelEventListener>) {
        push_unique(&mut self.catch_all, listener);
    }

    /// Returns true if the listener was bound to `event`
    pub fn unbind(&mut self, event: &str, listener: &Arc<dyn ChannelEventListener>) -> bool {
        let Some(listeners) = self.bindings.get_mut(event) else {
            return false;
        };

        let before = listeners.len();
        listeners.retain(|l| !same_listener(l, listener));
        let removed = listeners.len() != before;

        if listeners.is_empty() {
            self.bindings.remove(event);
        }
        removed
    }

    /// Register the listener told about subscription success
    pub(crate) fn add_subscriber(&mut self, listener: Arc<dyn ChannelEventListener>) {
        push_unique(&mut self.subscribers, listener);
    }

    pub(crate) fn set_presence_listener(
        &mut self,
        listener: Arc<dyn PresenceChannelEventListener>,
    ) {
        if let Some(presence) = self.presence.as_mut() {
            presence.listener = Some(listener);
        }
    }

    pub(crate) fn set_auth(&mut self, token: AuthToken) {
        if let Some(presence) = self.presence.as_mut() {
            let my_id = token
                .channel_data
                .as_deref()
                .and_then(|data| serde_json::from_str::<MemberData>(data).ok())
                .map(|data| member_id(&data.user_id));
            presence.members.set_my_id(my_id);
        }
        self.auth = Some(token);
    }

    /// The `pusher:subscribe` frame for this channel
    pub fn subscription_message(&self) -> Result<String> {
        let (auth, channel_data) = match (&self.auth, self.kind) {
            (_, ChannelKind::Public) => (None, None),
            (Some(token), ChannelKind::Private) => (Some(token.auth.clone()), None),
            (Some(token), ChannelKind::Presence) => {
                (Some(token.auth.clone()), token.channel_data.clone())
            }
            (None, _) => {
                return Err(PusherError::AuthError(format!(
                    "channel {} has not been authorized",
                    self.name
                )));
            }
        };

        SubscribeMessage::subscribe(&self.name, auth, channel_data).to_json()
    }

    pub(crate) fn subscribe_sent(&mut self) {
        self.state = ChannelState::SubscribeSent;
    }

    pub fn members(&self) -> Option<&Members> {
        self.presence.as_ref().map(|p| &p.members)
    }

    /// Handle a frame routed to this channel.
    ///
    /// `raw` is the full envelope; listeners receive its decoded `data` field.
    /// Callbacks are only queued on `queue`; the caller flushes it after
    /// releasing the channel lock.
    pub fn on_message(&mut self, event: &str, raw: &str, queue: &EventQueue) {
        let message = match PusherMessage::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Discarding malformed frame on {}: {}", self.name, e);
                return;
            }
        };

        match event {
            events::SUBSCRIPTION_SUCCEEDED => self.on_subscription_succeeded(&message, queue),
            events::MEMBER_ADDED if self.kind.tracks_presence() => {
                self.on_member_added(&message, queue)
            }
            events::MEMBER_REMOVED if self.kind.tracks_presence() => {
                self.on_member_removed(&message, queue)
            }
            e if e.starts_with(events::INTERNAL_PREFIX) => {
                debug!("Ignoring internal event {} on {}", e, self.name);
            }
            _ => self.dispatch(event, message.data_string(), queue),
        }
    }

    fn dispatch(&self, event: &str, data: String, queue: &EventQueue) {
        let mut targets: Vec<Arc<dyn ChannelEventListener>> =
            self.bindings.get(event).cloned().unwrap_or_default();
        for listener in &self.catch_all {
            push_unique(&mut targets, Arc::clone(listener));
        }

        if targets.is_empty() {
            debug!("No listeners for {} on {}", event, self.name);
            return;
        }

        for listener in targets {
            let channel = self.name.clone();
            let event = event.to_string();
            let data = data.clone();
            queue.dispatch(Box::pin(async move {
                listener.on_event(&channel, &event, &data).await;
            }));
        }
    }

    fn on_subscription_succeeded(&mut self, message: &PusherMessage, queue: &EventQueue) {
        self.state = ChannelState::Subscribed;
        debug!("Subscription succeeded for channel: {}", self.name);

        if let Some(presence) = self.presence.as_mut() {
            let snapshot = match message.data_as::<PresenceData>() {
                Ok(data) => presence.members.apply_snapshot(data),
                Err(e) => {
                    warn!("Malformed presence snapshot on {}: {}", self.name, e);
                    presence.members.to_vec()
                }
            };

            if let Some(listener) = presence.listener.clone() {
                let channel = self.name.clone();
                queue.dispatch(Box::pin(async move {
                    listener.on_users_information_received(&channel, &snapshot).await;
                }));
            }
        }

        for listener in &self.subscribers {
            let listener = Arc::clone(listener);
            let channel = self.name.clone();
            queue.dispatch(Box::pin(async move {
                listener.on_subscription_succeeded(&channel).await;
            }));
        }
    }

    fn on_member_added(&mut self, message: &PusherMessage, queue: &EventQueue) {
        let member: Member = match message.data_as::<MemberData>() {
            Ok(data) => data.into(),
            Err(e) => {
                warn!("Malformed member_added on {}: {}", self.name, e);
                return;
            }
        };

        let Some(presence) = self.presence.as_mut() else {
            return;
        };
        if presence.members.contains(&member.id) {
            debug!("Member {} already present on {}, updating info", member.id, self.name);
        }
        presence.members.add(member.clone());

        if let Some(listener) = presence.listener.clone() {
            let channel = self.name.clone();
            queue.dispatch(Box::pin(async move {
                listener.on_member_added(&channel, &member).await;
            }));
        }
    }

    fn on_member_removed(&mut self, message: &PusherMessage, queue: &EventQueue) {
        let id = match message.data_as::<MemberData>() {
            Ok(data) => member_id(&data.user_id),
            Err(e) => {
                warn!("Malformed member_removed on {}: {}", self.name, e);
                return;
            }
        };

        let Some(presence) = self.presence.as_mut() else {
            return;
        };
        let Some(member) = presence.members.remove(&id) else {
            debug!("Member {} not present on {}", id, self.name);
            return;
        };

        if let Some(listener) = presence.listener.clone() {
            let channel = self.name.clone();
            queue.dispatch(Box::pin(async move {
                listener.on_member_removed(&channel, &member).await;
            }));
        }
    }
}
