//! Client for Pusher-protocol publish/subscribe services.
//!
//! A [`Pusher`] owns one [`Connection`] and one [`ChannelManager`]. Frames read
//! from the transport drive the connection state machine; channel-scoped frames
//! are routed to their [`Channel`], and every listener callback is delivered
//! through the [`EventQueue`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use pusher_client::{ChannelEventListener, Pusher, PusherOptions};
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ChannelEventListener for Printer {
//!     async fn on_event(&self, channel: &str, event: &str, data: &str) {
//!         println!("{} {} {}", channel, event, data);
//!     }
//! }
//!
//! # async fn run() -> pusher_client::Result<()> {
//! let pusher = Pusher::new("app-key", PusherOptions::new().with_cluster("eu"))?;
//! pusher.connect().await?;
//! // Subscribing needs the connection to be established first.
//! pusher.subscribe("my-channel", Arc::new(Printer), &["my-event"]).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod channel_manager;
pub mod client;
pub mod connection;
pub mod error;
pub mod event;
pub mod message;
pub mod options;
pub mod presence;
pub mod queue;
pub mod transport;

#[cfg(test)]
mod testing;

pub use auth::{AuthToken, Authorizer, HttpAuthorizer, SecretAuthorizer};
pub use channel::{Channel, ChannelKind, ChannelState};
pub use channel_manager::ChannelManager;
pub use client::Pusher;
pub use connection::{Connection, ConnectionState, ConnectionStateChange};
pub use error::{PusherError, Result};
pub use event::{ChannelEventListener, ConnectionEventListener, PresenceChannelEventListener};
pub use options::PusherOptions;
pub use presence::{Member, Members};
pub use queue::{DeliveryMode, EventQueue};
pub use transport::{
    Transport, TransportEvent, TransportFactory, WebSocketTransport, WebSocketTransportFactory,
};
