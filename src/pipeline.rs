//! The per-delivery state machine: parse, validate, handle, then ack or nack.
//!
//! Every delivery ends in exactly one ack or nack and exactly one event. Failures
//! never leave this module except as log lines and events.

use crate::error::WorkerError;
use crate::events::{EventBus, WorkerEvent};
use crate::handler::HandlerSpec;
use crate::retry::{self, RetryDecision};
use crate::timeout;
use crate::transport::InFlightMessage;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Requeue,
}

/// Processes deliveries for one routing-key binding.
#[derive(Clone)]
pub struct MessagePipeline {
    worker_name: Arc<str>,
    spec: HandlerSpec,
    task_timeout: Duration,
    events: EventBus,
}

impl MessagePipeline {
    pub fn new(worker_name: Arc<str>, spec: HandlerSpec, task_timeout: Duration, events: EventBus) -> Self {
        Self { worker_name, spec, task_timeout, events }
    }

    pub fn routing_key(&self) -> &str {
        &self.spec.routing_key
    }

    /// Runs one delivery to its terminal state and returns the emitted event.
    pub async fn process(&self, message: InFlightMessage) -> WorkerEvent {
        let info = message.info().clone();

        let content: Value = match serde_json::from_slice(message.payload()) {
            Ok(content) => content,
            Err(e) => {
                let e = WorkerError::Parse(e);
                log::warn!(
                    "[{}] Discarding message. Tag: {}, error={}, rawMessage={}",
                    self.worker_name,
                    info.delivery_tag,
                    e,
                    String::from_utf8_lossy(message.payload())
                );
                return self.settle(message, Settlement::Ack, WorkerEvent::TaskFailed).await;
            }
        };

        if let Some(validator) = &self.spec.validator {
            if let Err(e) = validator.validate(&content) {
                let e = WorkerError::Validation(e);
                log::warn!(
                    "[{}] Discarding message. Tag: {}, error={}, content={}",
                    self.worker_name,
                    info.delivery_tag,
                    e,
                    content
                );
                return self.settle(message, Settlement::Ack, WorkerEvent::TaskFailed).await;
            }
        }

        let result = timeout::run_guarded(
            self.spec.handler.clone(),
            content,
            info.clone(),
            self.task_timeout,
        )
        .await;

        match result {
            Ok(()) => {
                log::debug!(
                    "[{}] Message processed successfully by '{}'. Tag: {}",
                    self.worker_name,
                    self.spec.handler.handler_name(),
                    info.delivery_tag
                );
                self.settle(message, Settlement::Ack, WorkerEvent::TaskCompleted).await
            }
            Err(e) => match retry::decide(&info) {
                RetryDecision::Requeue => {
                    log::warn!(
                        "[{}] Failed to process message ({} attempt), retrying one time. Tag: {}, routingKey={}, error={}",
                        self.worker_name,
                        retry::attempt_label(&info),
                        info.delivery_tag,
                        info.routing_key,
                        e
                    );
                    self.settle(message, Settlement::Requeue, WorkerEvent::TaskRetried).await
                }
                RetryDecision::Discard => {
                    log::error!(
                        "[{}] Failed to process message ({} attempt), discard message and fail. Tag: {}, routingKey={}, error={}",
                        self.worker_name,
                        retry::attempt_label(&info),
                        info.delivery_tag,
                        info.routing_key,
                        e
                    );
                    self.settle(message, Settlement::Ack, WorkerEvent::TaskFailed).await
                }
            },
        }
    }

    /// Settles the delivery and broadcasts the outcome. A failing ack/nack is logged;
    /// the decision has been made either way.
    ///
    /// An ack is settled before its event, so a waiter sees the queue already drained.
    /// A requeue is announced before the nack: the redelivery it triggers may finish on
    /// another thread, and its event must not overtake `TASK_RETRIED`.
    async fn settle(&self, message: InFlightMessage, settlement: Settlement, event: WorkerEvent) -> WorkerEvent {
        let tag = message.info().delivery_tag;
        let result = match settlement {
            Settlement::Ack => {
                let result = message.ack().await;
                self.events.emit(event);
                result
            }
            Settlement::Requeue => {
                self.events.emit(event);
                message.nack().await
            }
        };

        if let Err(e) = result {
            log::error!(
                "[{}] Failed to {:?} message. Tag: {}, error={}",
                self.worker_name,
                settlement,
                tag,
                e
            );
        }
        event
    }
}
