//! `lapin`-backed implementation of the transport traits.

use crate::error::WorkerError;
use crate::transport::{
    Acknowledge, BrokerChannel, BrokerConnection, DeliveryInfo, DeliveryStream, InFlightMessage,
    LifecycleListener, LifecycleSignal, Transport,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use url::Url;

const REPLY_SUCCESS: u16 = 200;

/// Connects to a RabbitMQ broker with `lapin`.
#[derive(Clone, Default)]
pub struct LapinTransport {
    properties: ConnectionProperties,
}

impl LapinTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses custom connection properties (executor, client properties...).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, url: &Url) -> Result<Arc<dyn BrokerConnection>, WorkerError> {
        let connection = Connection::connect(url.as_str(), self.properties.clone()).await?;
        Ok(Arc::new(LapinConnection {
            connection,
            closing: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// Maps an error raised on the connection. Unless we are closing it ourselves, an
/// I/O, protocol or connection-state error means the broker link is gone and the
/// worker cannot make progress, so it asks for the forced exit.
fn connection_signal(error: &lapin::Error, closing: bool) -> LifecycleSignal {
    match error {
        _ if closing => LifecycleSignal::Closed { force_exit: false },
        lapin::Error::IOError(_)
        | lapin::Error::ProtocolError(_)
        | lapin::Error::InvalidConnectionState(_) => LifecycleSignal::Closed { force_exit: true },
        other => LifecycleSignal::Error { detail: other.to_string() },
    }
}

/// Maps an error raised on a channel. Channel failures are reported, never escalated;
/// losing the connection underneath is reported by the connection itself.
fn channel_signal(error: &lapin::Error) -> LifecycleSignal {
    match error {
        lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => {
            LifecycleSignal::Closed { force_exit: false }
        }
        other => LifecycleSignal::Error { detail: other.to_string() },
    }
}

struct LapinConnection {
    connection: Connection,
    closing: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, WorkerError> {
        let channel = self.connection.create_channel().await?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    fn on_signal(&self, listener: LifecycleListener) {
        let closing = self.closing.clone();
        self.connection.on_error(move |error| {
            let closing = closing.load(Ordering::SeqCst);
            if !closing {
                log::warn!("Broker connection error. error={}", error);
            }
            listener(connection_signal(&error, closing))
        });
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.closing.store(true, Ordering::SeqCst);
        self.connection.close(REPLY_SUCCESS, "worker closing").await?;
        Ok(())
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn prefetch(&self, count: u16) -> Result<(), WorkerError> {
        self.channel.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn assert_exchange(&self, exchange: &str) -> Result<(), WorkerError> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn assert_queue(&self, queue: &str) -> Result<(), WorkerError> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions { durable: true, ..Default::default() },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), WorkerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, WorkerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(in_flight).map_err(WorkerError::from))
            .boxed())
    }

    fn on_signal(&self, listener: LifecycleListener) {
        self.channel
            .on_error(move |error| listener(channel_signal(&error)));
    }

    async fn close(&self) -> Result<(), WorkerError> {
        self.channel.close(REPLY_SUCCESS, "worker closing").await?;
        Ok(())
    }
}

fn in_flight(delivery: Delivery) -> InFlightMessage {
    let info = DeliveryInfo {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
    };
    InFlightMessage::new(delivery.data, info, Box::new(LapinAcker(delivery.acker)))
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), WorkerError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self) -> Result<(), WorkerError> {
        self.0
            .nack(BasicNackOptions { requeue: true, ..Default::default() })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_lost_connection_forces_exit() {
        let reset = lapin::Error::IOError(Arc::new(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        )));
        assert_eq!(connection_signal(&reset, false), LifecycleSignal::Closed { force_exit: true });

        let state = lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed);
        assert_eq!(connection_signal(&state, false), LifecycleSignal::Closed { force_exit: true });
    }

    #[test]
    fn test_own_close_does_not_force_exit() {
        let state = lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed);
        assert_eq!(connection_signal(&state, true), LifecycleSignal::Closed { force_exit: false });
    }

    #[test]
    fn test_other_connection_errors_are_reported() {
        let error = lapin::Error::ChannelsLimitReached;
        assert!(matches!(connection_signal(&error, false), LifecycleSignal::Error { .. }));
    }

    #[test]
    fn test_channel_errors_never_force_exit() {
        let reset = lapin::Error::IOError(Arc::new(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe")));
        assert!(matches!(channel_signal(&reset), LifecycleSignal::Error { .. }));

        let state = lapin::Error::InvalidConnectionState(lapin::ConnectionState::Closed);
        assert_eq!(channel_signal(&state), LifecycleSignal::Closed { force_exit: false });
    }
}
