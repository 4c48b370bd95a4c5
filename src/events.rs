//! Terminal outcome events and the broadcast bus that lets callers wait for them.

use crate::error::WorkerError;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Buffered events per waiter before it starts lagging.
const EVENT_BUFFER: usize = 1024;

/// Default timeout used by callers of `wait`.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(1000);

/// A terminal outcome broadcast by the worker. Carries nothing beyond its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerEvent {
    TaskCompleted,
    TaskRetried,
    TaskFailed,
    WorkerClosed,
}

pub const TASK_COMPLETED: WorkerEvent = WorkerEvent::TaskCompleted;
pub const TASK_RETRIED: WorkerEvent = WorkerEvent::TaskRetried;
pub const TASK_FAILED: WorkerEvent = WorkerEvent::TaskFailed;
pub const WORKER_CLOSED: WorkerEvent = WorkerEvent::WorkerClosed;

impl WorkerEvent {
    pub const fn name(self) -> &'static str {
        match self {
            WorkerEvent::TaskCompleted => "TASK_COMPLETED",
            WorkerEvent::TaskRetried => "TASK_RETRIED",
            WorkerEvent::TaskFailed => "TASK_FAILED",
            WorkerEvent::WorkerClosed => "WORKER_CLOSED",
        }
    }
}

impl fmt::Display for WorkerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fans every emitted event out to all waiters registered at that moment.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<WorkerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        Self { sender }
    }

    /// Broadcasts an event. Having no waiters is not an error.
    pub fn emit(&self, event: WorkerEvent) {
        log::debug!("Emitting {}", event);
        let _ = self.sender.send(event);
    }

    /// A receiver of every event emitted from now on, in emission order.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.sender.subscribe()
    }

    /// Registers a waiter now and returns a future resolving on the first matching
    /// event emitted after this call.
    ///
    /// Registration happens eagerly, before the returned future is first polled, so
    /// an event emitted between `wait()` and `.await` is still observed. Events that
    /// fired before the call are never matched.
    pub fn wait(
        &self,
        event: WorkerEvent,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), WorkerError>> + Send + 'static {
        let mut receiver = self.subscribe();
        async move {
            let matched = async {
                loop {
                    match receiver.recv().await {
                        Ok(received) if received == event => return,
                        Ok(_) => continue,
                        Err(RecvError::Lagged(skipped)) => {
                            log::warn!("Waiter for {} lagged, {} events skipped", event, skipped);
                        }
                        // Bus dropped; nothing can arrive any more, let the timeout fire.
                        Err(RecvError::Closed) => std::future::pending::<()>().await,
                    }
                }
            };

            tokio::time::timeout(timeout, matched)
                .await
                .map_err(|_| WorkerError::WaitTimeout {
                    event,
                    timeout_ms: timeout.as_millis() as u64,
                })
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_resolves_on_later_event() {
        let bus = EventBus::new();
        let waiter = bus.wait(TASK_COMPLETED, Duration::from_millis(500));
        bus.emit(TASK_RETRIED);
        bus.emit(TASK_COMPLETED);
        assert!(waiter.await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_times_out_even_if_event_fires_afterwards() {
        let bus = EventBus::new();
        let waiter = tokio::spawn(bus.wait(TASK_FAILED, Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(80)).await;
        bus.emit(TASK_FAILED);

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "event TASK_FAILED didn't occur after 20ms");
    }

    #[tokio::test]
    async fn test_wait_never_matches_retroactively() {
        let bus = EventBus::new();
        let first = bus.wait(TASK_COMPLETED, Duration::from_millis(500));
        bus.emit(TASK_COMPLETED);
        first.await.unwrap();

        // Registered after the first occurrence: needs the next one.
        let late = bus.wait(TASK_COMPLETED, Duration::from_millis(50));
        assert!(matches!(late.await, Err(WorkerError::WaitTimeout { .. })));

        let next = bus.wait(TASK_COMPLETED, Duration::from_millis(500));
        bus.emit(TASK_COMPLETED);
        assert!(next.await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_waiters_are_independent() {
        let bus = EventBus::new();
        let a = tokio::spawn(bus.wait(WORKER_CLOSED, Duration::from_millis(500)));
        let b = tokio::spawn(bus.wait(WORKER_CLOSED, Duration::from_millis(500)));
        let other = tokio::spawn(bus.wait(TASK_COMPLETED, Duration::from_millis(50)));

        bus.emit(WORKER_CLOSED);

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert!(other.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_sees_events_in_order() {
        let bus = EventBus::new();
        bus.emit(WORKER_CLOSED);
        let mut receiver = bus.subscribe();
        bus.emit(TASK_RETRIED);
        bus.emit(TASK_COMPLETED);

        assert_eq!(receiver.recv().await.unwrap(), TASK_RETRIED);
        assert_eq!(receiver.recv().await.unwrap(), TASK_COMPLETED);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(TASK_COMPLETED.to_string(), "TASK_COMPLETED");
        assert_eq!(TASK_RETRIED.name(), "TASK_RETRIED");
        assert_eq!(TASK_FAILED.name(), "TASK_FAILED");
        assert_eq!(WORKER_CLOSED.name(), "WORKER_CLOSED");
    }
}
