//! Binds every handler to its routing key and starts one consumer per binding.
//!
//! Each routing key gets its own durable queue, `<queueName>.<routingKey>`, bound to the
//! exchange on exactly that key. A delivery can only reach the handler of the binding
//! it came through, and every handler has its own prefetch window.

use crate::config::Configuration;
use crate::error::WorkerError;
use crate::events::EventBus;
use crate::handler::HandlerSpec;
use crate::pipeline::MessagePipeline;
use crate::transport::{BrokerChannel, DeliveryStream};
use futures_util::TryStreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Name of the queue backing the binding for `routing_key`.
pub fn binding_queue(queue_name: &str, routing_key: &str) -> String {
    format!("{}.{}", queue_name, routing_key)
}

/// Binds all handlers. On error, consumers already started are aborted.
pub async fn bind_all(
    channel: &dyn BrokerChannel,
    configuration: &Configuration,
    events: &EventBus,
) -> Result<Vec<JoinHandle<()>>, WorkerError> {
    let mut consumers = Vec::with_capacity(configuration.handlers().len());
    for spec in configuration.handlers() {
        match bind(channel, configuration, spec, events).await {
            Ok(consumer) => consumers.push(consumer),
            Err(e) => {
                for consumer in &consumers {
                    consumer.abort();
                }
                return Err(e);
            }
        }
    }
    Ok(consumers)
}

async fn bind(
    channel: &dyn BrokerChannel,
    configuration: &Configuration,
    spec: &HandlerSpec,
    events: &EventBus,
) -> Result<JoinHandle<()>, WorkerError> {
    let worker_name: Arc<str> = configuration.worker_name().into();
    let exchange = &configuration.config().exchange_name;
    let queue = binding_queue(&configuration.config().queue_name, &spec.routing_key);

    channel.assert_queue(&queue).await?;
    channel.bind_queue(&queue, exchange, &spec.routing_key).await?;

    let consumer_tag = format!("{}_consumer", queue);
    let deliveries = channel.consume(&queue, &consumer_tag).await?;

    log::info!(
        "[{}] Queue '{}' bound to '{}' on '{}', consumer '{}' started",
        worker_name,
        queue,
        exchange,
        spec.routing_key,
        consumer_tag
    );

    let pipeline = MessagePipeline::new(
        worker_name.clone(),
        spec.clone(),
        configuration.options().task_timeout_duration(),
        events.clone(),
    );
    Ok(tokio::spawn(consume(worker_name, queue, pipeline, deliveries)))
}

/// Spawns one pipeline task per delivery until the stream ends or fails.
async fn consume(worker_name: Arc<str>, queue: String, pipeline: MessagePipeline, deliveries: DeliveryStream) {
    let result = deliveries
        .try_for_each(|message| {
            let pipeline = pipeline.clone();
            async move {
                tokio::spawn(async move {
                    pipeline.process(message).await;
                });
                Ok::<(), WorkerError>(())
            }
        })
        .await;

    match result {
        Ok(()) => log::info!("[{}] Consumer for '{}' stopped", worker_name, queue),
        Err(e) => log::error!(
            "[{}] Consumer for '{}' failed, routingKey={}, error={}",
            worker_name,
            queue,
            pipeline.routing_key(),
            e
        ),
    }
}
