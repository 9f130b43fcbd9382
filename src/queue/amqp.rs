// src/queue/amqp.rs
// RabbitMQ implementation of the queue client, built on lapin.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::*,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::errors::{QueueError, Result};
use super::{
    dead_letter_queue_name, Acknowledger, IncomingMessage, QueueClient, Subscription,
    RETRY_ATTEMPTS_HEADER,
};

const PERSISTENT: u8 = 2;

/// Configuration options for a RabbitMQ channel
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Number of unacknowledged messages allowed (0 means unlimited)
    pub prefetch_count: u16,

    /// Whether to use publisher confirms
    pub confirm_mode: bool,

    /// Channel identifier for logging (defaults to a UUID)
    pub id: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            prefetch_count: 10,
            confirm_mode: true,
            id: format!("channel-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }
}

/// Queue shape declared before every publish or consume.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub name: String,
    /// Route rejected messages to `<name>.dead-letter` through the default exchange.
    pub dead_letter: bool,
}

impl QueueTopology {
    fn arguments(&self) -> FieldTable {
        let mut arguments = FieldTable::default();
        if self.dead_letter {
            arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(dead_letter_queue_name(&self.name).into()),
            );
        }
        arguments
    }
}

pub struct AmqpQueueClient {
    uri: String,
    connect_timeout: Duration,
    topology: QueueTopology,
    channel_config: ChannelConfig,
    connection: Option<Connection>,
    channel: Option<Channel>,
}

impl AmqpQueueClient {
    pub fn new(
        uri: &str,
        connect_timeout: Duration,
        topology: QueueTopology,
        channel_config: ChannelConfig,
    ) -> Self {
        debug!(
            channel_id = %channel_config.id,
            prefetch = %channel_config.prefetch_count,
            confirm = %channel_config.confirm_mode,
            queue = %topology.name,
            "Creating queue client"
        );

        Self {
            uri: uri.to_string(),
            connect_timeout,
            topology,
            channel_config,
            connection: None,
            channel: None,
        }
    }

    /// Returns an open channel with the queue declared, connecting first if needed.
    pub async fn channel(&mut self) -> Result<Channel> {
        self.ensure_ready().await?;
        self.channel
            .clone()
            .ok_or_else(|| QueueError::channel("Channel is not available"))
    }

    fn has_open_channel(&self) -> bool {
        self.connection
            .as_ref()
            .map_or(false, |conn| conn.status().connected())
            && self
                .channel
                .as_ref()
                .map_or(false, |channel| channel.status().connected())
    }

    async fn connect(&mut self) -> Result<()> {
        if self
            .connection
            .as_ref()
            .map_or(false, |conn| conn.status().connected())
        {
            return Ok(());
        }

        info!(channel_id = %self.channel_config.id, "Connecting to RabbitMQ");
        let connection = timeout(
            self.connect_timeout,
            Connection::connect(&self.uri, ConnectionProperties::default()),
        )
        .await?
        .map_err(QueueError::connection)?;

        debug!("Successfully connected to RabbitMQ");
        self.connection = Some(connection);
        Ok(())
    }

    async fn open_channel(&self) -> Result<Channel> {
        let connection = self
            .connection
            .as_ref()
            .ok_or_else(|| QueueError::connection("No active connection"))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(QueueError::channel)?;

        if self.channel_config.prefetch_count > 0 {
            debug!("Setting channel QoS to {}", self.channel_config.prefetch_count);
            channel
                .basic_qos(self.channel_config.prefetch_count, BasicQosOptions::default())
                .await
                .map_err(|e| QueueError::channel(format!("Failed to set QoS: {}", e)))?;
        }

        if self.channel_config.confirm_mode {
            debug!("Enabling confirm mode for channel {}", self.channel_config.id);
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|e| {
                    QueueError::channel(format!("Failed to enable confirm mode: {}", e))
                })?;
        }

        Ok(channel)
    }

    async fn declare_topology(&self, channel: &Channel) -> Result<()> {
        if self.topology.dead_letter {
            let dead_letter = dead_letter_queue_name(&self.topology.name);
            channel
                .queue_declare(&dead_letter, durable_queue(), FieldTable::default())
                .await
                .map_err(|e| declare_failure(&dead_letter, &e.to_string()))?;
        }

        let queue = channel
            .queue_declare(&self.topology.name, durable_queue(), self.topology.arguments())
            .await
            .map_err(|e| declare_failure(&self.topology.name, &e.to_string()))?;

        info!(
            queue = %self.topology.name,
            messages = queue.message_count(),
            consumers = queue.consumer_count(),
            "Queue declared"
        );
        Ok(())
    }
}

#[async_trait]
impl QueueClient for AmqpQueueClient {
    async fn ensure_ready(&mut self) -> Result<()> {
        if self.has_open_channel() {
            return Ok(());
        }

        self.channel = None;
        self.connect().await?;

        let channel = self.open_channel().await?;
        self.declare_topology(&channel).await?;

        info!(
            channel_id = %self.channel_config.id,
            queue = %self.topology.name,
            "Channel created and configured successfully"
        );
        self.channel = Some(channel);
        Ok(())
    }

    async fn publish(&mut self, body: &[u8]) -> Result<()> {
        let channel = self.channel().await?;

        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into())
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_timestamp(Utc::now().timestamp().max(0) as u64);

        let outcome = async {
            let confirm = channel
                .basic_publish(
                    "",
                    &self.topology.name,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await
                .map_err(QueueError::publish)?;

            let confirmation = confirm.await.map_err(QueueError::publish)?;
            if confirmation.is_nack() {
                return Err(QueueError::publish("Broker negatively confirmed the message"));
            }
            Ok(())
        }
        .await;

        if outcome.is_err() {
            // never reuse a channel that just failed a publish
            self.reset();
        }
        outcome
    }

    async fn subscribe(&mut self, consumer_tag: &str) -> Result<Subscription> {
        let channel = self.channel().await?;

        let consumer = channel
            .basic_consume(
                &self.topology.name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(QueueError::consume)?;

        info!(queue = %self.topology.name, consumer_tag, "Started consuming");

        let queue = self.topology.name.clone();
        let stream = consumer.map(move |delivery| match delivery {
            Ok(delivery) => Ok(incoming_from_delivery(delivery, channel.clone(), queue.clone())),
            Err(e) => Err(QueueError::channel(e)),
        });
        Ok(stream.boxed())
    }

    fn reset(&mut self) {
        self.channel = None;
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            if channel.status().connected() {
                info!(channel_id = %self.channel_config.id, "Closing channel");
                channel
                    .close(200, "Closing channel")
                    .await
                    .map_err(QueueError::channel)?;
            }
        }

        if let Some(connection) = self.connection.take() {
            if connection.status().connected() {
                connection
                    .close(200, "Closing connection")
                    .await
                    .map_err(QueueError::connection)?;
            }
        }
        Ok(())
    }

    fn queue_name(&self) -> &str {
        &self.topology.name
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        exclusive: false,
        auto_delete: false,
        ..QueueDeclareOptions::default()
    }
}

fn declare_failure(queue: &str, reason: &str) -> QueueError {
    if reason.contains("PRECONDITION") || reason.contains("inequivalent arg") {
        return QueueError::channel(format!(
            "Queue {} already exists with different arguments ({}). \
             Delete it or set rabbit_mq.dead_letter to match how it was declared",
            queue, reason
        ));
    }
    QueueError::channel(format!("Failed to declare queue {}: {}", queue, reason))
}

// Holds the delivery (minus its body) and the channel it arrived on.
struct AmqpAcker {
    delivery: Delivery,
    channel: Channel,
    queue: String,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(QueueError::ack)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.delivery
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map_err(QueueError::ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.delivery
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(QueueError::ack)
    }

    async fn republish(&self, body: &[u8], retry_attempts: u32) -> Result<()> {
        let mut headers = self.delivery.properties.headers().clone().unwrap_or_default();
        headers.insert(
            RETRY_ATTEMPTS_HEADER.into(),
            AMQPValue::LongUInt(retry_attempts),
        );
        let properties = self.delivery.properties.clone().with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(QueueError::publish)?;
        confirm.await.map_err(QueueError::publish)?;

        debug!(queue = %self.queue, retry_attempts, "Republished message for a later retry");
        self.ack().await
    }
}

fn incoming_from_delivery(mut delivery: Delivery, channel: Channel, queue: String) -> IncomingMessage {
    let retry_attempts = delivery
        .properties
        .headers()
        .as_ref()
        .and_then(|headers| header_u32(headers, RETRY_ATTEMPTS_HEADER))
        .unwrap_or(0);

    if delivery.redelivered {
        warn!(
            delivery_tag = delivery.delivery_tag,
            retry_attempts,
            "Received redelivered message"
        );
    }

    let body = std::mem::take(&mut delivery.data);
    let redelivered = delivery.redelivered;
    let acker = AmqpAcker {
        delivery,
        channel,
        queue,
    };
    IncomingMessage::new(body, redelivered, retry_attempts, Box::new(acker))
}

fn header_u32(headers: &FieldTable, name: &str) -> Option<u32> {
    headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .and_then(|(_, value)| amqp_value_as_u32(value))
}

fn amqp_value_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}
