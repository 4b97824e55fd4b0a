//! Realtime stream modules.
//!
//! - `client`: consumer entry point, options, and the connection controller
//!   that owns the single event-stream connection and its reconnects.
//! - `proto`: update payload types and the message decoder.
//! - `registry`: subscriber set, fan-out, and connection lifecycle driving.
//! - `sse`: server-sent-events framing and the transport seam.

/// Stream client, options, and connection controller.
pub mod client;
/// Stream update payloads.
pub mod proto;
/// Subscriber registry and subscription handles.
pub mod registry;
/// Event-stream transport.
pub mod sse;

#[cfg(test)]
pub(crate) mod testutil;
