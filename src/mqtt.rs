use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
};

use crate::broker::{BrokerError, Connector, Inbound, Session};
use crate::config::BrokerConfig;

const DEFAULT_SHARE_GROUP: &str = "presence-classifier";

/// Queue names are used as topic names as-is. Consumption goes through a
/// shared subscription so several instances split one inbound topic.
pub struct MqttConnector {
    options: MqttOptions,
    share_group: String,
}

impl MqttConnector {
    pub fn new(config: &BrokerConfig) -> Self {
        MqttConnector {
            options: mqtt_options(config),
            share_group: config
                .share_group
                .clone()
                .unwrap_or_else(|| DEFAULT_SHARE_GROUP.to_string()),
        }
    }
}

fn shared_topic(group: &str, queue: &str) -> String {
    format!("$share/{}/{}", group, queue)
}

fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    // Fixed for the life of the process so reconnects resume the same session
    let client_id = config.client_id.clone().unwrap_or_else(|| {
        format!("presence-classifier-{}", uuid::Uuid::new_v4().simple())
    });

    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port());
    options.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(30)));
    // Keep the broker-side session so unacked QoS 1 messages survive a reconnect
    options.set_clean_session(false);
    options.set_manual_acks(true);

    if let (Some(username), Some(password)) = (config.username.as_ref(), config.password.as_ref())
    {
        options.set_credentials(username.clone(), password.clone());
    }
    options
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self) -> Result<MqttSession, BrokerError> {
        let (host, port) = self.options.broker_address();
        debug!("Connecting to MQTT broker at {}:{}", host, port);

        let (client, mut eventloop) = AsyncClient::new(self.options.clone(), 10);
        let mut pending = VecDeque::new();
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(BrokerError::Refused(format!("{:?}", ack.code)));
                    }
                    info!(
                        "Connected to MQTT broker at {}:{} (session present: {})",
                        host, port, ack.session_present
                    );
                    break;
                }
                // A resumed session may start redelivering right away
                Event::Incoming(Packet::Publish(publish)) => pending.push_back(publish),
                _ => {}
            }
        }

        Ok(MqttSession {
            client,
            eventloop,
            pending,
            share_group: self.share_group.clone(),
        })
    }
}

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    /// Deliveries that arrived while waiting on something else.
    pending: VecDeque<Publish>,
    share_group: String,
}

impl Inbound for Publish {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn redelivered(&self) -> bool {
        self.dup
    }
}

#[async_trait]
impl Session for MqttSession {
    type Delivery = Publish;

    async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
        debug!("MQTT topics need no declaration, skipping '{}'", queue);
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str) -> Result<(), BrokerError> {
        let topic = shared_topic(&self.share_group, queue);
        self.client.subscribe(&topic, QoS::AtLeastOnce).await?;
        debug!("Subscribing to '{}'", topic);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Publish, BrokerError> {
        if let Some(publish) = self.pending.pop_front() {
            return Ok(publish);
        }
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::Publish(publish)) => return Ok(publish),
                Event::Incoming(Packet::SubAck(_)) => debug!("Subscription acknowledged"),
                Event::Incoming(Packet::Disconnect) => return Err(BrokerError::StreamClosed),
                _ => {}
            }
        }
    }

    async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
        self.client
            .publish(queue, QoS::AtLeastOnce, false, body.to_vec())
            .await?;

        let mut pkid = None;
        loop {
            match self.eventloop.poll().await? {
                Event::Outgoing(Outgoing::Publish(id)) if pkid.is_none() => pkid = Some(id),
                Event::Incoming(Packet::PubAck(ack)) if Some(ack.pkid) == pkid => return Ok(()),
                Event::Incoming(Packet::Publish(publish)) => self.pending.push_back(publish),
                Event::Incoming(Packet::Disconnect) => {
                    return Err(BrokerError::PublishNotConfirmed(queue.to_string()));
                }
                _ => {}
            }
        }
    }

    async fn ack(&mut self, delivery: Publish) -> Result<(), BrokerError> {
        // Queued here, written out on the next poll of the event loop
        self.client.ack(&delivery).await?;
        Ok(())
    }

    async fn reject(&mut self, delivery: Publish, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            // No negative ack in MQTT 3.1.1, and PUBACKs must go out in order.
            // Dropping the session is the only way to get it resent.
            warn!(
                "Leaving message on '{}' unacknowledged, resetting session",
                delivery.topic
            );
            return Err(BrokerError::RequeueNeedsReconnect);
        }
        // Settling is an ack here, there is nothing else to send
        self.client.ack(&delivery).await?;
        Ok(())
    }

    async fn close(mut self) -> Result<(), BrokerError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await?;
        // Flush queued acks and the disconnect itself
        let flush = async {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            warn!("Timed out flushing MQTT connection on close");
        }
        Ok(())
    }
}
