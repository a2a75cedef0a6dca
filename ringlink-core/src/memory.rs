//! In-memory channel transport
//!
//! Process-local implementation of [`ChannelTransport`] backed by a map of
//! named channels. Used by the integration tests and the demo CLI; also
//! handy as a reference when wiring a real pub/sub provider.

use crate::transport::{
    ChannelMessage, ChannelSink, ChannelStatus, ChannelTransport, TransportError,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Handle for one live in-memory subscription
#[derive(Debug)]
pub struct MemorySubscription {
    channel: String,
    id: u64,
}

#[derive(Default)]
struct Channels {
    sinks: HashMap<String, Vec<(u64, ChannelSink)>>,
}

/// Process-local broadcast transport
///
/// Cloning shares the same channel space, so several signaling instances
/// created from clones of one `MemoryTransport` can reach each other.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    channels: Arc<Mutex<Channels>>,
    next_id: Arc<AtomicU64>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Create an empty transport
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate loss of the underlying connection.
    ///
    /// While offline, `subscribe` and `publish` fail with
    /// [`TransportError::ChannelUnavailable`]. Existing subscriptions stay
    /// registered but receive nothing.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Inject a status transition into every sink on `channel`.
    ///
    /// Lets tests drive the disconnect/reconnect paths without a real broker.
    pub fn emit_status(&self, channel: &str, status: ChannelStatus) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sinks) = channels.sinks.get(channel) {
            for (_, sink) in sinks {
                let _ = sink.send(ChannelMessage::Status(status));
            }
        }
    }

    /// Number of live subscriptions on `channel`
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.sinks.get(channel).map_or(0, Vec::len)
    }

    fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelTransport for MemoryTransport {
    type Subscription = MemorySubscription;

    async fn subscribe(
        &self,
        channel: &str,
        sink: ChannelSink,
    ) -> Result<Self::Subscription, TransportError> {
        if self.is_offline() {
            return Err(TransportError::ChannelUnavailable(channel.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let _ = sink.send(ChannelMessage::Status(ChannelStatus::Subscribed));

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .sinks
            .entry(channel.to_string())
            .or_default()
            .push((id, sink));

        tracing::trace!(channel, id, "memory transport subscribed");
        Ok(MemorySubscription {
            channel: channel.to_string(),
            id,
        })
    }

    async fn publish(
        &self,
        channel: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), TransportError> {
        if self.is_offline() {
            return Err(TransportError::PublishFailed {
                channel: channel.to_string(),
                reason: "transport offline".to_string(),
            });
        }

        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sinks) = channels.sinks.get_mut(channel) {
            // Drop sinks whose receiver has gone away
            sinks.retain(|(_, sink)| {
                sink.send(ChannelMessage::Event {
                    name: event.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
        tracing::trace!(channel, event, "memory transport published");
        Ok(())
    }

    async fn unsubscribe(&self, subscription: Self::Subscription) -> Result<(), TransportError> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sinks) = channels.sinks.get_mut(&subscription.channel) {
            sinks.retain(|(id, _)| *id != subscription.id);
            if sinks.is_empty() {
                channels.sinks.remove(&subscription.channel);
            }
        }
        tracing::trace!(
            channel = %subscription.channel,
            id = subscription.id,
            "memory transport unsubscribed"
        );
        Ok(())
    }
}
