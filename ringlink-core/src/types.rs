//! Call signaling types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wire event names exchanged over the channel transport
pub mod events {
    /// Ring invite delivered on the callee's personal channel
    pub const INCOMING_CALL: &str = "incoming_call";
    /// Accept notice on the per-call channel
    pub const CALL_ACCEPTED: &str = "call_accepted";
    /// Decline or busy-reply on the per-call channel
    pub const CALL_DECLINED: &str = "call_declined";
    /// Withdrawal of the call by its initiator, sent on both the callee's
    /// personal channel and the per-call channel
    pub const CALL_CANCELLED: &str = "call_cancelled";
    /// Hang-up of an established call
    pub const CALL_ENDED: &str = "call_ended";
}

/// Media type requested for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    /// Audio-only call
    Voice,
    /// Audio and video call
    Video,
}

/// Status of a call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Invite sent or received, awaiting an answer
    Ringing,
    /// Both parties agreed to the call
    Accepted,
    /// Callee declined the invite
    Declined,
    /// Call hung up (or cancelled before answer)
    Ended,
    /// Ring timed out without an answer
    Missed,
    /// Callee already had an active call
    Busy,
}

impl CallStatus {
    /// Whether this status terminates the call attempt
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Declined | Self::Ended | Self::Missed | Self::Busy
        )
    }
}

/// Which side of the call this instance is on (local bookkeeping, not on the wire)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// This instance initiated the call
    Outgoing,
    /// This instance received the invite
    Incoming,
}

/// State of the personal channel subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Personal channel subscribed, invites will be delivered
    Connected,
    /// Not subscribed; inbound calls will not be received
    Disconnected,
    /// A reconnect attempt is scheduled or in flight
    Reconnecting,
}

/// The signaling record exchanged over the wire and held as the active call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSignal {
    /// Stable identifier for this call attempt
    pub call_id: String,
    /// Identity of the initiating party
    pub caller_id: String,
    /// Identity of the party being called
    pub receiver_id: String,
    /// Display name carried with the invite
    pub caller_name: String,
    /// Optional avatar URL carried with the invite
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub caller_avatar: Option<String>,
    /// Voice or video
    pub call_type: CallType,
    /// Current status of the attempt
    pub status: CallStatus,
    /// Time of the transition that produced this value
    pub timestamp: DateTime<Utc>,
}

impl CallSignal {
    /// Create a fresh invite in `Ringing` status
    pub fn ring(
        call_id: impl Into<String>,
        caller_id: impl Into<String>,
        receiver_id: impl Into<String>,
        caller_name: impl Into<String>,
        caller_avatar: Option<String>,
        call_type: CallType,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            caller_id: caller_id.into(),
            receiver_id: receiver_id.into(),
            caller_name: caller_name.into(),
            caller_avatar,
            call_type,
            status: CallStatus::Ringing,
            timestamp: Utc::now(),
        }
    }

    /// Move to a new status, keeping the timestamp monotonically non-decreasing
    pub fn transition(&mut self, status: CallStatus) {
        self.status = status;
        let now = Utc::now();
        if now > self.timestamp {
            self.timestamp = now;
        }
    }

    /// Snapshot of this signal in a new status
    #[must_use]
    pub fn with_status(&self, status: CallStatus) -> Self {
        let mut copy = self.clone();
        copy.transition(status);
        copy
    }
}

/// Deterministic, order-independent call identifier for a pair of identities.
///
/// Both parties derive the same id (and therefore the same per-call channel
/// and media room name) regardless of who initiates.
#[must_use]
pub fn generate_call_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("{lo}_{hi}")
}

/// Name of the identity-scoped inbox channel for ring invites and cancellations
#[must_use]
pub fn personal_channel(identity: &str) -> String {
    format!("calls:user:{identity}")
}

/// Name of the channel scoped to one call, used for the accept/decline/end handshake
#[must_use]
pub fn call_channel(call_id: &str) -> String {
    format!("calls:call:{call_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generate_call_id_order_independent() {
        assert_eq!(generate_call_id("alice", "bob"), generate_call_id("bob", "alice"));
        assert_eq!(generate_call_id("alice", "bob"), "alice_bob");
        assert_eq!(generate_call_id("zed", "ann"), "ann_zed");
    }

    #[test]
    fn test_channel_names_deterministic() {
        assert_eq!(personal_channel("alice"), "calls:user:alice");
        assert_eq!(call_channel("alice_bob"), "calls:call:alice_bob");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Busy.is_terminal());
    }

    #[test]
    fn test_signal_transition_monotonic_timestamp() {
        let mut signal = CallSignal::ring("a_b", "a", "b", "Alice", None, CallType::Voice);
        let created = signal.timestamp;
        signal.transition(CallStatus::Accepted);
        assert_eq!(signal.status, CallStatus::Accepted);
        assert!(signal.timestamp >= created);
    }

    #[test]
    fn test_signal_serialization_round_trip() {
        let signal = CallSignal::ring(
            "a_b",
            "a",
            "b",
            "Alice",
            Some("https://example.com/a.png".to_string()),
            CallType::Video,
        );
        let json = serde_json::to_string(&signal).unwrap();
        assert!(json.contains("\"status\":\"ringing\""));
        assert!(json.contains("\"call_type\":\"video\""));
        let back: CallSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(back, signal);
    }

    #[test]
    fn test_signal_omits_missing_avatar() {
        let signal = CallSignal::ring("a_b", "a", "b", "Alice", None, CallType::Voice);
        let json = serde_json::to_string(&signal).unwrap();
        assert!(!json.contains("caller_avatar"));
    }
}
