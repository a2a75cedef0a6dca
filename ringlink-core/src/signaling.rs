//! Call signal state machine
//!
//! Runs the ring/accept/decline/cancel/missed/busy protocol for exactly one
//! call at a time per instance, over two channel scopes:
//!
//! - the **personal channel** (identity-scoped, long-lived) carries ring
//!   invites and cancellations of unanswered rings, and is re-established
//!   with capped exponential backoff on disconnect;
//! - the **per-call channel** (scoped to one `call_id`, lazily created)
//!   carries the accept/decline/cancel/end handshake between the two
//!   parties.
//!
//! All mutations of the active-call slot, timers and subscriptions are
//! serialized through one `tokio::sync::Mutex`, reproducing a single-actor
//! event queue. Ring-timer cancellation happens under that lock before any
//! state mutation for the same call, so a timeout can never fire after an
//! accept has been processed.

use crate::events::CallSignalingEvents;
use crate::transport::{ChannelMessage, ChannelStatus, ChannelTransport, TransportError};
use crate::types::{
    call_channel, events, personal_channel, CallDirection, CallSignal, CallStatus, ConnectionState,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Signaling errors surfaced to the orchestration layer
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Operation requires a prior `initialize`
    #[error("signaling not initialized")]
    NotInitialized,

    /// `initialize` called twice without `cleanup`
    #[error("signaling already initialized")]
    AlreadyInitialized,

    /// Channel transport failure
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Timing configuration for the state machine
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// How long a call may ring before it is declared missed
    pub ring_timeout: Duration,
    /// Base delay for personal-channel reconnect backoff
    pub reconnect_base_delay: Duration,
    /// Reconnect attempts before requiring `force_reconnect`
    pub max_reconnect_attempts: u32,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }
}

/// Which channel scope a reader task is draining
#[derive(Debug, Clone, Copy)]
enum ChannelScope {
    Personal,
    PerCall,
}

/// A live subscription plus the task draining its sink
struct Binding<T: ChannelTransport> {
    channel: String,
    subscription: T::Subscription,
    reader: JoinHandle<()>,
}

/// The single active call this instance tracks
struct ActiveCall<T: ChannelTransport> {
    signal: CallSignal,
    direction: CallDirection,
    ring_timer: Option<JoinHandle<()>>,
    binding: Option<Binding<T>>,
}

struct Inner<T: ChannelTransport> {
    identity: Option<String>,
    callbacks: Option<Arc<dyn CallSignalingEvents>>,
    active: Option<ActiveCall<T>>,
    personal: Option<Binding<T>>,
    connection: ConnectionState,
    reconnect_attempts: u32,
    reconnect_pending: bool,
    reconnect_timer: Option<JoinHandle<()>>,
}

impl<T: ChannelTransport> Inner<T> {
    fn new() -> Self {
        Self {
            identity: None,
            callbacks: None,
            active: None,
            personal: None,
            connection: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            reconnect_pending: false,
            reconnect_timer: None,
        }
    }
}

/// Call signaling state machine
///
/// Generic over the channel transport so the same protocol logic runs over
/// any pub/sub substrate (a realtime broker in production,
/// [`crate::memory::MemoryTransport`] in tests).
pub struct CallSignaling<T: ChannelTransport> {
    transport: Arc<T>,
    config: Arc<SignalingConfig>,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T: ChannelTransport> Clone for CallSignaling<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ChannelTransport> CallSignaling<T> {
    /// Create a state machine with default timing
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self::with_config(transport, SignalingConfig::default())
    }

    /// Create a state machine with custom timing
    #[must_use]
    pub fn with_config(transport: Arc<T>, config: SignalingConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner::new())),
        }
    }

    /// Register identity and callbacks and subscribe the personal channel.
    ///
    /// If the initial subscription fails, the reconnect backoff takes over;
    /// the error is still returned so the caller can log it.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::AlreadyInitialized`] if called twice without
    /// `cleanup`, or the transport error from the initial subscription.
    pub async fn initialize(
        &self,
        identity: &str,
        callbacks: Arc<dyn CallSignalingEvents>,
    ) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        if inner.identity.is_some() {
            return Err(SignalingError::AlreadyInitialized);
        }
        inner.identity = Some(identity.to_string());
        inner.callbacks = Some(callbacks);

        tracing::info!(identity, "initializing call signaling");
        if let Err(e) = self.open_personal(&mut inner).await {
            tracing::warn!(identity, error = %e, "personal channel subscription failed");
            self.schedule_reconnect(&mut inner);
            return Err(e.into());
        }
        Ok(())
    }

    /// Tear down all subscriptions and timers and clear the active-call slot.
    ///
    /// Called on logout. The instance can be `initialize`d again afterwards.
    pub async fn cleanup(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.reconnect_pending = false;
        inner.reconnect_attempts = 0;

        if let Some(mut active) = inner.active.take() {
            if let Some(timer) = active.ring_timer.take() {
                timer.abort();
            }
            if let Some(binding) = active.binding.take() {
                self.drop_binding(binding).await;
            }
        }
        if let Some(binding) = inner.personal.take() {
            self.drop_binding(binding).await;
        }
        inner.identity = None;
        inner.callbacks = None;
        inner.connection = ConnectionState::Disconnected;
        tracing::info!("call signaling cleaned up");
    }

    /// Manually re-establish the personal channel, resetting the backoff
    /// counter. Required after automatic reconnection has given up.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::NotInitialized`] before `initialize`, or the
    /// transport error from the fresh subscription (backoff resumes in that
    /// case).
    pub async fn force_reconnect(&self) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock().await;
        if inner.identity.is_none() {
            return Err(SignalingError::NotInitialized);
        }
        if let Some(timer) = inner.reconnect_timer.take() {
            timer.abort();
        }
        inner.reconnect_pending = false;
        inner.reconnect_attempts = 0;

        if let Some(binding) = inner.personal.take() {
            self.drop_binding(binding).await;
        }
        tracing::info!("manual reconnect requested");
        if let Err(e) = self.open_personal(&mut inner).await {
            tracing::warn!(error = %e, "manual reconnect failed");
            self.schedule_reconnect(&mut inner);
            return Err(e.into());
        }
        Ok(())
    }

    /// Current personal-channel connection state
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.lock().await.connection
    }

    /// Snapshot of the active call, if any
    pub async fn active_call(&self) -> Option<CallSignal> {
        self.inner
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.signal.clone())
    }

    /// Whether a call currently occupies the active-call slot
    pub async fn has_active_call(&self) -> bool {
        self.inner.lock().await.active.is_some()
    }

    /// Ring another party.
    ///
    /// Subscribes the per-call channel, delivers the invite to the
    /// receiver's personal channel and starts the 30-second ring timer.
    /// Returns `false` (without side effects) if not initialized, if a call
    /// is already active, or if the transport rejects the invite.
    pub async fn initiate_call(
        &self,
        call_id: &str,
        receiver_id: &str,
        caller_name: &str,
        caller_avatar: Option<String>,
        call_type: crate::types::CallType,
    ) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(identity) = inner.identity.clone() else {
            tracing::warn!("initiate_call before initialize");
            return false;
        };
        if inner.active.is_some() {
            tracing::warn!(call_id, "initiate_call while another call is active");
            return false;
        }

        let signal = CallSignal::ring(
            call_id,
            identity,
            receiver_id,
            caller_name,
            caller_avatar,
            call_type,
        );
        let payload = match serde_json::to_value(&signal) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(call_id, error = %e, "failed to encode invite");
                return false;
            }
        };

        let binding = match self.open_channel(&call_channel(call_id), ChannelScope::PerCall).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(call_id, error = %e, "per-call channel subscription failed");
                return false;
            }
        };

        if let Err(e) = self
            .transport
            .publish_once(&personal_channel(receiver_id), events::INCOMING_CALL, payload)
            .await
        {
            tracing::warn!(call_id, error = %e, "failed to deliver invite");
            self.drop_binding(binding).await;
            return false;
        }

        tracing::info!(call_id, receiver_id, "outgoing call ringing");
        let ring_timer = self.start_ring_timer(call_id);
        inner.active = Some(ActiveCall {
            signal,
            direction: CallDirection::Outgoing,
            ring_timer: Some(ring_timer),
            binding: Some(binding),
        });
        true
    }

    /// Cancel an outgoing call that is still ringing.
    ///
    /// Publishes `call_cancelled` on the receiver's personal channel as well
    /// as the per-call channel, since the callee may not have subscribed to
    /// the latter yet. No-op in any other state.
    pub async fn cancel_call(&self) {
        let mut inner = self.inner.lock().await;
        let cancellable = matches!(
            inner.active.as_ref(),
            Some(a) if a.direction == CallDirection::Outgoing
                && a.signal.status == CallStatus::Ringing
        );
        if !cancellable {
            tracing::debug!("cancel_call with no cancellable outgoing call");
            return;
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }

        let cancelled = active.signal.with_status(CallStatus::Ended);
        let payload = serde_json::to_value(&cancelled).unwrap_or_default();

        let channel = call_channel(&cancelled.call_id);
        if let Err(e) = self
            .transport
            .publish(&channel, events::CALL_CANCELLED, payload.clone())
            .await
        {
            tracing::debug!(call_id = %cancelled.call_id, error = %e, "cancel on per-call channel failed");
        }
        if let Err(e) = self
            .transport
            .publish_once(
                &personal_channel(&cancelled.receiver_id),
                events::CALL_CANCELLED,
                payload,
            )
            .await
        {
            tracing::warn!(call_id = %cancelled.call_id, error = %e, "cancel notice failed");
        }

        if let Some(binding) = active.binding.take() {
            self.drop_binding(binding).await;
        }
        tracing::info!(call_id = %cancelled.call_id, "outgoing call cancelled");
    }

    /// Accept the ringing incoming call identified by `call_id`.
    ///
    /// The id must match the tracked active call; stale UI actions for a
    /// call that is no longer active return `false`. On success the per-call
    /// channel is subscribed and `call_accepted` published on it.
    pub async fn accept_call(&self, call_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let answerable = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == call_id
                && a.direction == CallDirection::Incoming
                && a.signal.status == CallStatus::Ringing
        );
        if !answerable {
            tracing::debug!(call_id, "accept_call does not match the active call");
            return false;
        }

        let binding = match self.open_channel(&call_channel(call_id), ChannelScope::PerCall).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(call_id, error = %e, "per-call channel subscription failed");
                return false;
            }
        };

        // Guard re-checked above; the lock has been held throughout.
        let Some(active) = inner.active.as_mut() else {
            self.drop_binding(binding).await;
            return false;
        };

        let accepted = active.signal.with_status(CallStatus::Accepted);
        let payload = serde_json::to_value(&accepted).unwrap_or_default();
        if let Err(e) = self
            .transport
            .publish(&call_channel(call_id), events::CALL_ACCEPTED, payload)
            .await
        {
            tracing::warn!(call_id, error = %e, "failed to publish accept");
            self.drop_binding(binding).await;
            return false;
        }

        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        active.signal = accepted;
        active.binding = Some(binding);
        tracing::info!(call_id, "incoming call accepted");
        true
    }

    /// Decline the ringing incoming call identified by `call_id`.
    ///
    /// Same id-match guard as [`CallSignaling::accept_call`]. The decline is
    /// delivered with a transient per-call subscription and the active-call
    /// slot is cleared.
    pub async fn decline_call(&self, call_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let declinable = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == call_id
                && a.direction == CallDirection::Incoming
                && a.signal.status == CallStatus::Ringing
        );
        if !declinable {
            tracing::debug!(call_id, "decline_call does not match the active call");
            return false;
        }
        let Some(mut active) = inner.active.take() else {
            return false;
        };
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }

        let declined = active.signal.with_status(CallStatus::Declined);
        let payload = serde_json::to_value(&declined).unwrap_or_default();
        if let Err(e) = self
            .transport
            .publish_once(&call_channel(call_id), events::CALL_DECLINED, payload)
            .await
        {
            tracing::warn!(call_id, error = %e, "failed to publish decline");
        }
        tracing::info!(call_id, "incoming call declined");
        true
    }

    /// Hang up the established call. No-op unless the active call is in
    /// `Accepted` status.
    pub async fn end_call(&self) {
        let mut inner = self.inner.lock().await;
        let established = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.status == CallStatus::Accepted
        );
        if !established {
            tracing::debug!("end_call with no established call");
            return;
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };

        let ended = active.signal.with_status(CallStatus::Ended);
        let payload = serde_json::to_value(&ended).unwrap_or_default();
        if let Err(e) = self
            .transport
            .publish(&call_channel(&ended.call_id), events::CALL_ENDED, payload)
            .await
        {
            tracing::warn!(call_id = %ended.call_id, error = %e, "failed to publish hang-up");
        }
        if let Some(binding) = active.binding.take() {
            self.drop_binding(binding).await;
        }
        tracing::info!(call_id = %ended.call_id, "call ended");
    }

    // ---- channel plumbing -------------------------------------------------

    /// Subscribe the personal channel and store its binding
    async fn open_personal(&self, inner: &mut Inner<T>) -> Result<(), TransportError> {
        let Some(identity) = inner.identity.clone() else {
            return Err(TransportError::SubscriptionClosed);
        };
        let binding = self
            .open_channel(&personal_channel(&identity), ChannelScope::Personal)
            .await?;
        inner.personal = Some(binding);
        Ok(())
    }

    /// Subscribe a channel and spawn the task draining its sink
    async fn open_channel(
        &self,
        channel: &str,
        scope: ChannelScope,
    ) -> Result<Binding<T>, TransportError> {
        let (sink, mut rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match scope {
                    ChannelScope::Personal => this.on_personal_message(message).await,
                    ChannelScope::PerCall => this.on_call_message(message).await,
                }
            }
        });

        match self.transport.subscribe(channel, sink).await {
            Ok(subscription) => Ok(Binding {
                channel: channel.to_string(),
                subscription,
                reader,
            }),
            Err(e) => {
                // Sink is gone, the reader drains out on its own
                Err(e)
            }
        }
    }

    /// Release a binding: stop its reader and unsubscribe it from the
    /// transport.
    ///
    /// Handlers for per-call events run on the binding's own reader task, so
    /// the abort is skipped when that task is the caller; its loop ends once
    /// the unsubscribe drops the sink. Aborting unconditionally would cancel
    /// the handler mid-flight at the transport's next yield point.
    async fn drop_binding(&self, binding: Binding<T>) {
        if tokio::task::try_id() != Some(binding.reader.id()) {
            binding.reader.abort();
        }
        if let Err(e) = self.transport.unsubscribe(binding.subscription).await {
            tracing::debug!(channel = %binding.channel, error = %e, "unsubscribe failed");
        }
    }

    // ---- personal channel events ------------------------------------------

    async fn on_personal_message(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::Status(ChannelStatus::Subscribed) => {
                let mut inner = self.inner.lock().await;
                inner.connection = ConnectionState::Connected;
                inner.reconnect_attempts = 0;
                if let Some(timer) = inner.reconnect_timer.take() {
                    timer.abort();
                }
                inner.reconnect_pending = false;
                tracing::info!("personal channel subscribed");
            }
            ChannelMessage::Status(status) => {
                tracing::warn!(?status, "personal channel lost");
                let mut inner = self.inner.lock().await;
                self.schedule_reconnect(&mut inner);
            }
            ChannelMessage::Event { name, payload } => {
                let Ok(signal) = serde_json::from_value::<CallSignal>(payload) else {
                    tracing::debug!(event = %name, "ignoring malformed signal");
                    return;
                };
                match name.as_str() {
                    events::INCOMING_CALL => self.on_incoming_call(signal).await,
                    events::CALL_CANCELLED => self.on_remote_cancel(signal).await,
                    other => {
                        tracing::debug!(event = other, "ignoring unexpected personal event");
                    }
                }
            }
        }
    }

    async fn on_incoming_call(&self, signal: CallSignal) {
        let mut inner = self.inner.lock().await;
        let Some(identity) = inner.identity.clone() else {
            return;
        };
        if signal.receiver_id != identity || signal.status != CallStatus::Ringing {
            tracing::debug!(call_id = %signal.call_id, "ignoring mismatched invite");
            return;
        }

        if inner.active.is_some() {
            // Busy collision: reply on the inbound call's channel and stay
            // silent towards the local user.
            let busy = signal.with_status(CallStatus::Busy);
            let payload = serde_json::to_value(&busy).unwrap_or_default();
            tracing::info!(call_id = %busy.call_id, caller_id = %busy.caller_id, "busy, auto-declining");
            if let Err(e) = self
                .transport
                .publish_once(&call_channel(&busy.call_id), events::CALL_DECLINED, payload)
                .await
            {
                tracing::warn!(call_id = %busy.call_id, error = %e, "busy reply failed");
            }
            return;
        }

        tracing::info!(call_id = %signal.call_id, caller_id = %signal.caller_id, "incoming call ringing");
        let ring_timer = self.start_ring_timer(&signal.call_id);
        let snapshot = signal.clone();
        inner.active = Some(ActiveCall {
            signal,
            direction: CallDirection::Incoming,
            ring_timer: Some(ring_timer),
            binding: None,
        });
        if let Some(cb) = inner.callbacks.as_ref() {
            cb.on_incoming_call(&snapshot);
        }
    }

    /// The caller withdrew the call. Covers both an unanswered ring
    /// (cancel on the personal channel) and a cancel that crossed our
    /// accept in flight (cancel on the per-call channel while already
    /// `Accepted`).
    async fn on_remote_cancel(&self, signal: CallSignal) {
        let mut inner = self.inner.lock().await;
        let cancellable = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == signal.call_id
                && a.direction == CallDirection::Incoming
                && matches!(a.signal.status, CallStatus::Ringing | CallStatus::Accepted)
        );
        if !cancellable {
            tracing::debug!(call_id = %signal.call_id, "ignoring cancel for inactive call");
            return;
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        if let Some(binding) = active.binding.take() {
            self.drop_binding(binding).await;
        }
        let ended = active.signal.with_status(CallStatus::Ended);
        tracing::info!(call_id = %ended.call_id, "caller cancelled the ring");
        if let Some(cb) = inner.callbacks.as_ref() {
            cb.on_call_ended(&ended);
        }
    }

    // ---- per-call channel events ------------------------------------------

    async fn on_call_message(&self, message: ChannelMessage) {
        match message {
            ChannelMessage::Status(status) => {
                // No reconnect policy on per-call channels; the ring timer or
                // hang-up bounds their lifetime.
                tracing::debug!(?status, "per-call channel status");
            }
            ChannelMessage::Event { name, payload } => {
                let Ok(signal) = serde_json::from_value::<CallSignal>(payload) else {
                    tracing::debug!(event = %name, "ignoring malformed signal");
                    return;
                };
                match name.as_str() {
                    events::CALL_ACCEPTED => self.on_remote_accept(signal).await,
                    events::CALL_DECLINED => self.on_remote_decline(signal).await,
                    events::CALL_CANCELLED => self.on_remote_cancel(signal).await,
                    events::CALL_ENDED => self.on_remote_end(signal).await,
                    other => {
                        tracing::debug!(event = other, "ignoring unexpected call event");
                    }
                }
            }
        }
    }

    async fn on_remote_accept(&self, signal: CallSignal) {
        let mut inner = self.inner.lock().await;
        let acceptable = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == signal.call_id
                && a.direction == CallDirection::Outgoing
                && a.signal.status == CallStatus::Ringing
        );
        if !acceptable {
            tracing::debug!(call_id = %signal.call_id, "ignoring stale accept");
            return;
        }
        let Some(active) = inner.active.as_mut() else {
            return;
        };
        // Cancel the ring timer before mutating the slot
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        active.signal = signal.clone();
        tracing::info!(call_id = %signal.call_id, "call accepted by remote");
        if let Some(cb) = inner.callbacks.as_ref() {
            cb.on_call_accepted(&signal);
        }
    }

    async fn on_remote_decline(&self, signal: CallSignal) {
        let mut inner = self.inner.lock().await;
        let declinable = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == signal.call_id
                && a.direction == CallDirection::Outgoing
                && a.signal.status == CallStatus::Ringing
        );
        if !declinable {
            tracing::debug!(call_id = %signal.call_id, "ignoring stale decline");
            return;
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        if let Some(binding) = active.binding.take() {
            self.drop_binding(binding).await;
        }
        tracing::info!(call_id = %signal.call_id, status = ?signal.status, "call declined by remote");
        if let Some(cb) = inner.callbacks.as_ref() {
            cb.on_call_declined(&signal);
        }
    }

    async fn on_remote_end(&self, signal: CallSignal) {
        let mut inner = self.inner.lock().await;
        let established = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == signal.call_id
                && a.signal.status == CallStatus::Accepted
        );
        if !established {
            tracing::debug!(call_id = %signal.call_id, "ignoring stale hang-up");
            return;
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };
        if let Some(timer) = active.ring_timer.take() {
            timer.abort();
        }
        if let Some(binding) = active.binding.take() {
            self.drop_binding(binding).await;
        }
        tracing::info!(call_id = %signal.call_id, "call ended by remote");
        if let Some(cb) = inner.callbacks.as_ref() {
            cb.on_call_ended(&signal);
        }
    }

    // ---- timers -----------------------------------------------------------

    fn start_ring_timer(&self, call_id: &str) -> JoinHandle<()> {
        let this = self.clone();
        let call_id = call_id.to_string();
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.on_ring_timeout(&call_id).await;
        })
    }

    async fn on_ring_timeout(&self, call_id: &str) {
        let mut inner = self.inner.lock().await;
        let still_ringing = matches!(
            inner.active.as_ref(),
            Some(a) if a.signal.call_id == call_id && a.signal.status == CallStatus::Ringing
        );
        if !still_ringing {
            return;
        }
        let Some(mut active) = inner.active.take() else {
            return;
        };
        // This task is the ring timer; dropping the handle is enough.
        active.ring_timer.take();
        if let Some(binding) = active.binding.take() {
            self.drop_binding(binding).await;
        }
        let missed = active.signal.with_status(CallStatus::Missed);
        tracing::info!(call_id, "call missed (ring timeout)");
        if let Some(cb) = inner.callbacks.as_ref() {
            cb.on_call_missed(&missed);
        }
    }

    /// Schedule a reconnect of the personal channel with exponential backoff.
    ///
    /// At most one attempt is in flight; after `max_reconnect_attempts`
    /// failures the instance stays `Disconnected` until `force_reconnect`.
    fn schedule_reconnect(&self, inner: &mut Inner<T>) {
        if inner.identity.is_none() || inner.reconnect_pending {
            return;
        }
        if inner.reconnect_attempts >= self.config.max_reconnect_attempts {
            inner.connection = ConnectionState::Disconnected;
            tracing::warn!(
                attempts = inner.reconnect_attempts,
                "reconnect attempts exhausted; waiting for force_reconnect"
            );
            return;
        }

        let delay = self.config.reconnect_base_delay * 2u32.pow(inner.reconnect_attempts);
        inner.reconnect_attempts += 1;
        inner.reconnect_pending = true;
        inner.connection = ConnectionState::Reconnecting;
        tracing::info!(
            attempt = inner.reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling personal channel reconnect"
        );

        let this = self.clone();
        inner.reconnect_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.reconnect_personal().await;
        }));
    }

    async fn reconnect_personal(&self) {
        let mut inner = self.inner.lock().await;
        inner.reconnect_pending = false;
        inner.reconnect_timer = None;
        if inner.identity.is_none() {
            return;
        }

        // Fully tear down the stale subscription before creating a fresh one
        // to avoid duplicate delivery.
        if let Some(binding) = inner.personal.take() {
            self.drop_binding(binding).await;
        }
        if let Err(e) = self.open_personal(&mut inner).await {
            tracing::warn!(error = %e, "reconnect attempt failed");
            self.schedule_reconnect(&mut inner);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::types::CallType;
    use std::sync::Mutex as StdMutex;

    struct NullEvents;
    impl CallSignalingEvents for NullEvents {
        fn on_incoming_call(&self, _: &CallSignal) {}
        fn on_call_accepted(&self, _: &CallSignal) {}
        fn on_call_declined(&self, _: &CallSignal) {}
        fn on_call_ended(&self, _: &CallSignal) {}
        fn on_call_missed(&self, _: &CallSignal) {}
    }

    struct Recorder(StdMutex<Vec<String>>);
    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(Vec::new())))
        }
        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }
    impl CallSignalingEvents for Recorder {
        fn on_incoming_call(&self, s: &CallSignal) {
            self.0.lock().unwrap().push(format!("incoming:{}", s.call_id));
        }
        fn on_call_accepted(&self, s: &CallSignal) {
            self.0.lock().unwrap().push(format!("accepted:{}", s.call_id));
        }
        fn on_call_declined(&self, s: &CallSignal) {
            self.0.lock().unwrap().push(format!("declined:{}", s.call_id));
        }
        fn on_call_ended(&self, s: &CallSignal) {
            self.0.lock().unwrap().push(format!("ended:{}", s.call_id));
        }
        fn on_call_missed(&self, s: &CallSignal) {
            self.0.lock().unwrap().push(format!("missed:{}", s.call_id));
        }
    }

    #[tokio::test]
    async fn test_initiate_requires_initialize() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(transport);
        assert!(
            !signaling
                .initiate_call("a_b", "bob", "Alice", None, CallType::Voice)
                .await
        );
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(transport);
        signaling
            .initialize("alice", Arc::new(NullEvents))
            .await
            .unwrap();
        let result = signaling.initialize("alice", Arc::new(NullEvents)).await;
        assert!(matches!(result, Err(SignalingError::AlreadyInitialized)));
    }

    #[tokio::test]
    async fn test_second_initiate_rejected_while_active() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(transport);
        signaling
            .initialize("alice", Arc::new(NullEvents))
            .await
            .unwrap();

        assert!(
            signaling
                .initiate_call("alice_bob", "bob", "Alice", None, CallType::Voice)
                .await
        );
        assert!(signaling.has_active_call().await);
        assert!(
            !signaling
                .initiate_call("alice_carol", "carol", "Alice", None, CallType::Voice)
                .await
        );
    }

    #[tokio::test]
    async fn test_accept_with_stale_id_rejected() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(transport);
        signaling
            .initialize("bob", Arc::new(NullEvents))
            .await
            .unwrap();
        assert!(!signaling.accept_call("nonexistent").await);
        assert!(!signaling.decline_call("nonexistent").await);
    }

    #[tokio::test]
    async fn test_cleanup_clears_state() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(Arc::clone(&transport));
        signaling
            .initialize("alice", Arc::new(NullEvents))
            .await
            .unwrap();
        assert!(
            signaling
                .initiate_call("alice_bob", "bob", "Alice", None, CallType::Voice)
                .await
        );

        signaling.cleanup().await;
        assert!(!signaling.has_active_call().await);
        assert_eq!(
            signaling.connection_state().await,
            ConnectionState::Disconnected
        );
        assert_eq!(transport.subscriber_count(&personal_channel("alice")), 0);
        assert_eq!(transport.subscriber_count(&call_channel("alice_bob")), 0);

        // Re-initialization works after cleanup
        signaling
            .initialize("alice", Arc::new(NullEvents))
            .await
            .unwrap();
        assert_eq!(
            signaling.connection_state().await,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_connection_state_transitions_on_subscribe() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(Arc::clone(&transport));
        assert_eq!(
            signaling.connection_state().await,
            ConnectionState::Disconnected
        );
        signaling
            .initialize("alice", Arc::new(NullEvents))
            .await
            .unwrap();
        // MemoryTransport reports Subscribed synchronously; let the reader run
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            signaling.connection_state().await,
            ConnectionState::Connected
        );
    }

    #[tokio::test]
    async fn test_end_call_requires_established_call() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(transport);
        signaling
            .initialize("alice", Arc::new(NullEvents))
            .await
            .unwrap();
        assert!(
            signaling
                .initiate_call("alice_bob", "bob", "Alice", None, CallType::Voice)
                .await
        );
        // Still ringing: end_call must not clear the slot
        signaling.end_call().await;
        assert!(signaling.has_active_call().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recorder_sees_single_missed_event() {
        let transport = Arc::new(MemoryTransport::new());
        let signaling = CallSignaling::new(transport);
        let recorder = Recorder::new();
        signaling
            .initialize("alice", recorder.clone())
            .await
            .unwrap();
        assert!(
            signaling
                .initiate_call("alice_bob", "bob", "Alice", None, CallType::Voice)
                .await
        );

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!signaling.has_active_call().await);
        assert_eq!(recorder.events(), vec!["missed:alice_bob".to_string()]);

        // Nothing further fires
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(recorder.events().len(), 1);
    }
}
