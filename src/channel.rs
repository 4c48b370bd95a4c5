//! Opens the worker's single channel, applies prefetch and declares the exchange.

use crate::config::Configuration;
use crate::error::WorkerError;
use crate::transport::{BrokerChannel, BrokerConnection, LifecycleListener, LifecycleSignal};
use std::sync::Arc;

/// Creates the channel every binding of this worker shares.
///
/// Prefetch is the only backpressure: it caps unacknowledged deliveries per consumer.
/// Declarations are idempotent and never purge existing messages.
pub async fn open(
    connection: &dyn BrokerConnection,
    configuration: &Configuration,
) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
    let worker_name = configuration.worker_name();
    let channel = connection.create_channel().await?;
    log::info!("[{}] Channel created", worker_name);

    channel.on_signal(channel_listener(
        worker_name.into(),
        configuration.log_context(),
    ));

    let prefetch = configuration.options().channel_prefetch;
    channel.prefetch(prefetch).await?;
    log::info!("[{}] QoS prefetch count set to {}", worker_name, prefetch);

    let exchange = &configuration.config().exchange_name;
    channel.assert_exchange(exchange).await?;
    log::info!("[{}] Topic exchange '{}' is declared", worker_name, exchange);

    Ok(channel)
}

fn channel_listener(worker_name: Arc<str>, context: String) -> LifecycleListener {
    Arc::new(move |signal| match signal {
        LifecycleSignal::Error { detail } => {
            log::error!("[{}] Channel error. error={}, {}", worker_name, detail, context);
        }
        LifecycleSignal::Closed { .. } => {
            log::info!("[{}] Channel closed. {}", worker_name, context);
        }
        other => {
            log::debug!("[{}] Channel signal {:?}. {}", worker_name, other, context);
        }
    })
}
