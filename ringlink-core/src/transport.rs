//! Channel transport seam
//!
//! The signaling state machine runs over a named broadcast (pub/sub)
//! substrate. Implement [`ChannelTransport`] for your delivery layer;
//! the crate ships [`crate::memory::MemoryTransport`] for tests and demos.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    /// Channel cannot be reached (offline, torn down)
    #[error("channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// Publish was not delivered
    #[error("publish failed on {channel}: {reason}")]
    PublishFailed {
        /// Channel the publish targeted
        channel: String,
        /// Transport-specific failure description
        reason: String,
    },

    /// Subscription handle no longer valid
    #[error("subscription closed")]
    SubscriptionClosed,
}

/// Status transitions reported for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    /// Subscription established, events will flow
    Subscribed,
    /// Subscription closed by the transport
    Closed,
    /// Subscription failed
    Errored,
    /// Subscription attempt timed out
    TimedOut,
}

/// Message delivered to a subscription sink
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// Subscription status transition
    Status(ChannelStatus),
    /// A published event
    Event {
        /// Event name (see [`crate::types::events`])
        name: String,
        /// Event payload
        payload: Value,
    },
}

/// Sink a subscriber supplies to receive status transitions and events
pub type ChannelSink = mpsc::UnboundedSender<ChannelMessage>;

/// Named broadcast channel transport
///
/// The transport must emit [`ChannelStatus::Subscribed`] into the sink once
/// the subscription is live, and deliver every event published to the channel
/// afterwards (at-least-once). Publishing requires an active subscription,
/// which may be momentary (see [`ChannelTransport::publish_once`]).
#[async_trait]
pub trait ChannelTransport: Send + Sync + 'static {
    /// Handle identifying one live subscription
    type Subscription: Send + Sync;

    /// Subscribe to a named channel, delivering into `sink`
    async fn subscribe(
        &self,
        channel: &str,
        sink: ChannelSink,
    ) -> Result<Self::Subscription, TransportError>;

    /// Publish an event to a channel this instance is subscribed to
    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError>;

    /// Tear down a subscription
    async fn unsubscribe(&self, subscription: Self::Subscription) -> Result<(), TransportError>;

    /// Fire-and-forget publish to a channel without a long-lived subscription.
    ///
    /// Performs the transient subscribe -> publish -> unsubscribe sequence the
    /// transport requires for reliable delivery. Used for ring invites and
    /// cancel notices sent to another party's personal channel.
    async fn publish_once(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        let (sink, _rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(channel, sink).await?;
        let result = self.publish(channel, event, payload).await;
        self.unsubscribe(subscription).await?;
        result
    }
}
