//! # RabbitMQ Task Worker
//! Consumes JSON tasks from a topic exchange, dispatches them by routing key and
//! retries a failed task exactly once, relying on the broker's redelivered flag.

pub mod amqp;
pub mod channel;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handler;
pub mod pipeline;
pub mod retry;
pub mod shutdown;
pub mod timeout;
pub mod transport;
pub mod worker;

#[cfg(any(test, feature = "test-tools"))]
pub mod test_tools;

pub use amqp::LapinTransport;
pub use config::{Configuration, WorkerConfig, WorkerOptions};
pub use error::{BoxError, WorkerError};
pub use events::{
    EventBus, WorkerEvent, DEFAULT_WAIT_TIMEOUT, TASK_COMPLETED, TASK_FAILED, TASK_RETRIED,
    WORKER_CLOSED,
};
pub use handler::{handler_fn, validator_fn, HandlerSpec, Handlers, MessageHandler, Validator};
pub use transport::DeliveryInfo;
pub use worker::{create_worker, WorkerProcess};
