//! RabbitMQ bus adapter.
//!
//! Work queues are durable and messages persistent. Delayed requeue is built
//! from a per-queue retry queue whose dead-letter target is the work queue:
//! a message published there with a per-message TTL reappears on the work
//! queue once the TTL lapses. Publishes wait for broker confirmation, so a
//! payload is never dropped silently while the broker is unreachable.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;

use super::{Acknowledge, BusError, Delivery, MessageBus, CHECK_REQUESTS_QUEUE, CHECK_RESULTS_QUEUE};

/// A durable RabbitMQ-backed message bus.
pub struct RabbitMqBus {
    channel: Channel,
}

fn retry_queue_name(queue: &str) -> String {
    format!("{queue}.retry")
}

async fn declare_work_queue(channel: &Channel, queue: &str) -> Result<(), BusError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    // Retry queue: expired messages dead-letter back onto the work queue.
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("".into()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(queue.into()),
    );
    channel
        .queue_declare(
            &retry_queue_name(queue),
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            arguments,
        )
        .await?;
    Ok(())
}

impl RabbitMqBus {
    /// Connects to the broker and declares the work queue topology.
    #[tracing::instrument(level = "info", skip_all, fields(uri))]
    pub async fn connect(uri: &str) -> Result<Self, BusError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        for queue in [CHECK_REQUESTS_QUEUE, CHECK_RESULTS_QUEUE] {
            declare_work_queue(&channel, queue).await?;
        }

        tracing::info!("connected to message broker");
        Ok(Self { channel })
    }

    async fn publish_to(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), BusError> {
        self.channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await? // wait for the publish
            .await // wait for the broker confirmation
            .map(|_| ())
            .map_err(BusError::from)
    }
}

#[async_trait]
impl MessageBus for RabbitMqBus {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BusError> {
        self.publish_to(queue, payload, BasicProperties::default().with_delivery_mode(2))
            .await
    }

    async fn publish_delayed(
        &self,
        queue: &str,
        payload: &[u8],
        delay: Duration,
    ) -> Result<(), BusError> {
        let expiration = delay.as_millis().max(1).to_string();
        self.publish_to(
            &retry_queue_name(queue),
            payload,
            BasicProperties::default()
                .with_delivery_mode(2)
                .with_expiration(expiration.into()),
        )
        .await
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<mpsc::Receiver<Delivery>, BusError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let consumer_tag = format!("steamwatch-{}-{}", queue, std::process::id());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let (tx, rx) = mpsc::channel(prefetch.max(1) as usize);
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(message) => {
                        let item =
                            Delivery::new(message.data, Box::new(LapinAcker { acker: message.acker }));
                        if tx.send(item).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::error!(queue = %queue_name, error = %error, "consumer stream error");
                    }
                }
            }
            tracing::debug!(queue = %queue_name, "consumer pump finished");
        });

        Ok(rx)
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), BusError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}
