//! Transport-neutral view of the message broker.
//!
//! A [`Connector`] knows how to reach the broker and hands out a
//! [`Session`], which owns the live connection for as long as it exists.
//! Dropping a session releases the connection, and with it every delivery
//! that was never acknowledged, so the broker can redeliver them.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("MQTT client error: {0}")]
    MqttClient(#[from] rumqttc::ClientError),
    #[error("MQTT connection error: {0}")]
    MqttConnection(#[from] rumqttc::ConnectionError),
    #[error("broker refused the connection: {0}")]
    Refused(String),
    #[error("broker did not confirm publish to '{0}'")]
    PublishNotConfirmed(String),
    #[error("delivery stream closed by the broker")]
    StreamClosed,
    #[error("requeue needs a fresh session on this transport")]
    RequeueNeedsReconnect,
}

/// A message received from a queue, not yet settled.
pub trait Inbound: Send {
    fn payload(&self) -> &[u8];
    fn redelivered(&self) -> bool;
}

#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session, BrokerError>;
}

#[async_trait]
pub trait Session: Send {
    type Delivery: Inbound;

    /// Create the queue if it does not exist yet.
    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError>;

    async fn subscribe(&mut self, queue: &str) -> Result<(), BrokerError>;

    /// Wait for the next delivery from the subscribed queue.
    async fn recv(&mut self) -> Result<Self::Delivery, BrokerError>;

    /// Publish through the default exchange. Returns once the broker has
    /// taken responsibility for the message.
    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), BrokerError>;

    async fn ack(&mut self, delivery: Self::Delivery) -> Result<(), BrokerError>;

    /// Settle a delivery without processing it.
    async fn reject(&mut self, delivery: Self::Delivery, requeue: bool)
    -> Result<(), BrokerError>;

    async fn close(self) -> Result<(), BrokerError>;
}
