//! Orchestration callback contract
//!
//! The signaling state machine invokes these callbacks with the
//! [`CallSignal`] snapshot at the moment of each transition. They are the
//! only export surface the orchestration layer (UI navigation,
//! notifications) consumes.
//!
//! Callbacks run on the signaling task and must not block; spawn work that
//! needs to call back into [`crate::signaling::CallSignaling`].

use crate::types::CallSignal;

/// Callbacks invoked by the signal state machine
///
/// For any call attempt, exactly one of the terminal callbacks
/// (`on_call_declined`, `on_call_ended`, `on_call_missed`) fires per side.
/// Locally initiated transitions (accepting, declining, ending, cancelling)
/// do not echo back through these callbacks; the orchestration layer already
/// knows it performed them.
pub trait CallSignalingEvents: Send + Sync + 'static {
    /// A ring invite arrived and became the active call
    fn on_incoming_call(&self, signal: &CallSignal);

    /// The remote party accepted our outgoing call
    fn on_call_accepted(&self, signal: &CallSignal);

    /// The remote party declined our outgoing call (or replied busy;
    /// `signal.status` distinguishes the two)
    fn on_call_declined(&self, signal: &CallSignal);

    /// The remote party hung up an established call, or cancelled the
    /// call (an unanswered ring, or a cancel that crossed our accept in
    /// flight)
    fn on_call_ended(&self, signal: &CallSignal);

    /// The ring timed out with no answer
    fn on_call_missed(&self, signal: &CallSignal);
}
