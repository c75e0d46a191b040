//! AMQP 0-9-1 broker backed by `lapin`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, warn};

use super::errors::{BrokerError, BrokerResult};
use super::{
    Acknowledger, BrokerChannel, BrokerConnector, Delivery, Subscription, Topology,
    FANOUT_ROUTING_KEY,
};

/// Persistent delivery mode (survives broker restart on a durable queue)
const PERSISTENT: u8 = 2;

const CLOSE_OK: u16 = 200;

/// Connects to an AMQP broker with a bounded connect deadline
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
    connect_timeout: Duration,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn open(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let connect = Connection::connect(&self.uri, ConnectionProperties::default());
        let connection = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| BrokerError::ConnectTimeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(CLOSE_OK, "channel open failed").await;
                return Err(e.into());
            }
        };

        debug!(channel_id = channel.id(), "broker channel opened");
        Ok(Box::new(AmqpChannel {
            connection,
            channel,
        }))
    }
}

/// A channel together with the connection that owns it
struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_topology(&self, topology: &Topology) -> BrokerResult<()> {
        self.channel
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.channel
            .queue_declare(&topology.queue, durable, FieldTable::default())
            .await?;
        self.channel
            .queue_declare(&topology.dead_letter_queue, durable, FieldTable::default())
            .await?;

        self.channel
            .queue_bind(
                &topology.queue,
                &topology.exchange,
                FANOUT_ROUTING_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> BrokerResult<()> {
        let properties = BasicProperties::default().with_delivery_mode(PERSISTENT);

        // The returned confirm is dropped: publishing is fire-and-forget.
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await?;

        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> BrokerResult<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<Box<dyn Subscription>> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(Box::new(AmqpSubscription { consumer }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if let Err(e) = self.channel.close(CLOSE_OK, "OK").await {
            warn!(error = %e, "broker channel close failed");
        }
        self.connection.close(CLOSE_OK, "OK").await?;
        Ok(())
    }
}

struct AmqpSubscription {
    consumer: lapin::Consumer,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        let next = self.consumer.next().await?;
        Some(next.map_err(BrokerError::from).map(|delivery| {
            Delivery::new(
                delivery.data,
                delivery.redelivered,
                Box::new(AmqpAcker(delivery.acker)),
            )
        }))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}
