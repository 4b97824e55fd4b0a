//! Client-side update stream for the trading dashboard backend.
//!
//! One long-lived server-sent-events connection is shared by any number of
//! in-process subscribers. The crate is organized as:
//! - `stream`: client entry point, connection controller, subscriber
//!   registry, wire model, and event-stream transport.
//! - `retry`: reconnect backoff policy and timeout helper.
//!
//! ```no_run
//! use tradedash_stream::stream::client::StreamClient;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let client = StreamClient::new()?;
//! let subscription = client.subscribe(|update| {
//!     if let Some(stats) = update.data.as_ref().and_then(|data| data.stats.as_ref()) {
//!         println!("trades={}", stats.total_trades);
//!     }
//! });
//! // ...
//! subscription.unsubscribe();
//! # Ok(())
//! # }
//! ```

/// Reconnect backoff and timeout helpers.
pub mod retry;
/// Event-stream client, subscriber registry, and protocol types.
pub mod stream;

pub use retry::ReconnectPolicy;
pub use stream::client::{ConnectionState, StreamClient, StreamClientError, StreamClientOptions};
pub use stream::proto::{StreamUpdate, UpdateKind, UpdatePayload};
pub use stream::registry::Subscription;
