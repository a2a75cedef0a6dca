//! Ringlink - call signaling and session establishment
//!
//! This library implements the out-of-band handshake two parties use to
//! establish a real-time voice/video session: one party rings another over a
//! pub/sub channel substrate, the callee accepts or declines, and on
//! acceptance both parties obtain a media-room credential from an
//! authenticated token endpoint. It features:
//!
//! - **Single-active-call state machine**: ring/accept/decline/cancel/missed
//!   with automatic busy handling for colliding invites
//! - **Two channel scopes**: a long-lived personal inbox channel and a lazy
//!   per-call handshake channel
//! - **Resilient connectivity**: capped exponential backoff for the personal
//!   channel, classified retry policy for token acquisition
//! - **Transport-agnostic**: bring any pub/sub substrate by implementing
//!   [`ChannelTransport`]
//!
//! # Examples
//!
//! ```rust,no_run
//! use ringlink_core::{
//!     CallSignaling, CallSignalingEvents, CallSignal, CallType, MemoryTransport, SignalingError,
//! };
//! use ringlink_core::generate_call_id;
//! use std::sync::Arc;
//!
//! struct Ui;
//! impl CallSignalingEvents for Ui {
//!     fn on_incoming_call(&self, signal: &CallSignal) { println!("ring from {}", signal.caller_id); }
//!     fn on_call_accepted(&self, _: &CallSignal) {}
//!     fn on_call_declined(&self, _: &CallSignal) {}
//!     fn on_call_ended(&self, _: &CallSignal) {}
//!     fn on_call_missed(&self, _: &CallSignal) {}
//! }
//!
//! # async fn example() -> Result<(), SignalingError> {
//! let transport = Arc::new(MemoryTransport::new());
//! let signaling = CallSignaling::new(transport);
//! signaling.initialize("alice", Arc::new(Ui)).await?;
//!
//! let call_id = generate_call_id("alice", "bob");
//! signaling.initiate_call(&call_id, "bob", "Alice", None, CallType::Video).await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

/// Call signaling types and data structures
pub mod types;

/// Channel transport seam
pub mod transport;

/// In-memory channel transport for tests and demos
pub mod memory;

/// Orchestration callback contract
pub mod events;

/// Call signal state machine
pub mod signaling;

/// Session credential acquisition
pub mod token;

// Re-export main types at crate root
pub use events::CallSignalingEvents;
pub use memory::MemoryTransport;
pub use signaling::{CallSignaling, SignalingConfig, SignalingError};
pub use token::{
    HttpTokenEndpoint, SessionCredential, TokenClient, TokenClientConfig, TokenEndpoint,
    TokenError, TokenRequest,
};
pub use transport::{
    ChannelMessage, ChannelSink, ChannelStatus, ChannelTransport, TransportError,
};
pub use types::{
    call_channel, generate_call_id, personal_channel, CallDirection, CallSignal, CallStatus,
    CallType, ConnectionState,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::events::CallSignalingEvents;
    pub use crate::memory::MemoryTransport;
    pub use crate::signaling::{CallSignaling, SignalingConfig, SignalingError};
    pub use crate::token::{HttpTokenEndpoint, SessionCredential, TokenClient, TokenError};
    pub use crate::transport::{ChannelStatus, ChannelTransport, TransportError};
    pub use crate::types::{
        generate_call_id, CallSignal, CallStatus, CallType, ConnectionState,
    };
}
