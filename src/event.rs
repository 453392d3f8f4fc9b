use async_trait::async_trait;

use crate::connection::ConnectionStateChange;
use crate::presence::Member;

/// Receives connection lifecycle notifications
#[async_trait]
pub trait ConnectionEventListener: Send + Sync {
    /// Called once per state transition the listener is bound to
    async fn on_connection_state_change(&self, change: ConnectionStateChange);

    /// Called when the server sends `pusher:error` or the transport fails
    async fn on_error(&self, _message: &str, _code: Option<u32>) {}
}

/// Receives events delivered on a subscribed channel
#[async_trait]
pub trait ChannelEventListener: Send + Sync {
    /// Called when a bound event arrives; `data` is the decoded `data` field
    async fn on_event(&self, channel: &str, event: &str, data: &str);

    /// Called when the server confirms the subscription
    async fn on_subscription_succeeded(&self, _channel: &str) {}
}

/// Receives membership notifications for a presence channel
#[async_trait]
pub trait PresenceChannelEventListener: ChannelEventListener {
    /// Called once with the full member list when the subscription succeeds
    async fn on_users_information_received(&self, channel: &str, members: &[Member]);

    async fn on_member_added(&self, channel: &str, member: &Member);

    async fn on_member_removed(&self, channel: &str, member: &Member);
}
