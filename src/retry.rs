//! Retry-once policy for failed handler attempts.
//!
//! The only retry state is the broker's `redelivered` flag. Nothing is counted locally,
//! so the decision stays correct across worker restarts.

use crate::transport::DeliveryInfo;

/// What to do with a delivery whose handler failed or timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// First attempt: nack with requeue so the broker delivers it once more.
    Requeue,
    /// Already redelivered: ack to drop it and stop the retry loop.
    Discard,
}

/// Decides between one more attempt and giving up.
pub fn decide(delivery: &DeliveryInfo) -> RetryDecision {
    if delivery.redelivered {
        RetryDecision::Discard
    } else {
        RetryDecision::Requeue
    }
}

/// Returns a label describing the attempt, for logging purposes.
pub fn attempt_label(delivery: &DeliveryInfo) -> &'static str {
    if delivery.redelivered {
        "redelivery"
    } else {
        "initial"
    }
}
