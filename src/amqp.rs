use async_trait::async_trait;
use futures::StreamExt as _;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use log::{debug, info};

use crate::broker::{BrokerError, Connector, Inbound, Session};
use crate::config::BrokerConfig;

const CONSUMER_TAG: &str = "presence-classifier";

/// One unsettled message at a time.
const PREFETCH: u16 = 1;

pub struct AmqpConnector {
    uri: AMQPUri,
    host: String,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        AmqpConnector {
            uri: amqp_uri(config),
            host: format!("{}:{}", config.host, config.port()),
        }
    }
}

/// Built field by field so credentials never go through URI parsing.
fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone().unwrap_or_else(|| "guest".to_string()),
                password: config.password.clone().unwrap_or_else(|| "guest".to_string()),
            },
            host: config.host.clone(),
            port: config.port(),
        },
        vhost: config.vhost.clone().unwrap_or_else(|| "/".to_string()),
        ..AMQPUri::default()
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Session = AmqpSession;

    async fn connect(&self) -> Result<AmqpSession, BrokerError> {
        debug!("Connecting to AMQP broker at {}", self.host);
        let connection =
            Connection::connect_uri(self.uri.clone(), ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(PREFETCH, BasicQosOptions::default())
            .await?;
        info!("Connected to AMQP broker at {}", self.host);

        Ok(AmqpSession {
            connection,
            channel,
            consumer: None,
        })
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    consumer: Option<Consumer>,
}

impl Inbound for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }
}

#[async_trait]
impl Session for AmqpSession {
    type Delivery = Delivery;

    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        self.channel
            .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        debug!("Declared queue '{}'", queue);
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str) -> Result<(), BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Delivery, BrokerError> {
        let consumer = self.consumer.as_mut().ok_or(BrokerError::StreamClosed)?;
        match consumer.next().await {
            Some(delivery) => Ok(delivery?),
            None => Err(BrokerError::StreamClosed),
        }
    }

    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        let confirmation = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?
            .await?;
        if confirmation.is_nack() {
            return Err(BrokerError::PublishNotConfirmed(queue.to_string()));
        }
        Ok(())
    }

    async fn ack(&mut self, delivery: Delivery) -> Result<(), BrokerError> {
        delivery.acker.ack(Default::default()).await?;
        Ok(())
    }

    async fn reject(&mut self, delivery: Delivery, requeue: bool) -> Result<(), BrokerError> {
        delivery
            .acker
            .reject(BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn close(self) -> Result<(), BrokerError> {
        debug!("Closing AMQP connection");
        self.channel.close(200, "shutting down").await?;
        self.connection.close(200, "shutting down").await?;
        Ok(())
    }
}
