//! Minimal Asterisk ARI client.
//!
//! Covers exactly the control surface a call-audio tap needs: snoop and
//! external-media channel creation, mixing bridges, hangup, and the stasis
//! event stream. REST paths and the event-stream URL share one configurable
//! path prefix, resolved once at construction.
//!
//! # Example
//!
//! ```rust,no_run
//! use ari_client::{AriClient, SpyDirection};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ari = AriClient::connect("http://pbx:8088/ari", "tap", "secret")?;
//!
//! ari.on("StasisStart", |event, channel| async move {
//!     println!("{} entered: {:?}", event.event_type, channel);
//! });
//!
//! let stream = ari.start("my-app").await?;
//! let snoop = ari
//!     .snoop_channel("SIP/100-000001", "my-app", SpyDirection::Both, "snoop,A1,both")
//!     .await?;
//! snoop.hangup().await?;
//! stream.await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

mod bridge;
mod channel;
mod client;
mod error;
mod events;

pub use bridge::BridgeHandle;
pub use channel::ChannelHandle;
pub use client::{AriClient, AriOptions, EventEndpoint, SpyDirection};
pub use error::{AriError, AriResult};
pub use events::{AriEvent, CallerId, ChannelInfo};

/// Future type produced by event handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handler invoked for globally-subscribed events. Receives the channel
/// handle when the event carries a channel snapshot.
pub type GlobalEventHandler =
    Arc<dyn Fn(AriEvent, Option<ChannelHandle>) -> HandlerFuture + Send + Sync>;

/// Handler invoked for events dispatched to one channel handle.
pub type ChannelEventHandler = Arc<dyn Fn(AriEvent) -> HandlerFuture + Send + Sync>;
