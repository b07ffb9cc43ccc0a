use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerError, Connector, Inbound, Session};
use crate::config::WorkerConfig;
use crate::messages::{
    Attendance, ClassificationResult, INBOUND_QUEUE, Measurement, OUTBOUND_QUEUE,
};

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published(Attendance),
    Rejected,
}

pub struct Worker {
    reconnect_delay: Duration,
    requeue_malformed: bool,
}

impl Worker {
    pub fn new(config: &WorkerConfig) -> Self {
        Worker {
            reconnect_delay: config.reconnect_delay(),
            requeue_malformed: config.requeue_malformed.unwrap_or(false),
        }
    }

    /// Consume until `shutdown` is cancelled, reconnecting whenever the
    /// broker connection is lost.
    pub async fn run<C: Connector>(
        &self,
        connector: &C,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_session(connector, &shutdown).await {
                Ok(()) => break,
                Err(err) => {
                    error!("Broker session ended: {}", err);
                    warn!(
                        "Reconnecting in {}s",
                        self.reconnect_delay.as_secs_f32()
                    );
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Returns `Ok` only on shutdown. Any broker failure drops the session,
    /// which leaves the in-flight delivery unacknowledged.
    async fn run_session<C: Connector>(
        &self,
        connector: &C,
        shutdown: &CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut session = connector.connect().await?;
        session.declare_queue(INBOUND_QUEUE).await?;
        session.declare_queue(OUTBOUND_QUEUE).await?;
        session.subscribe(INBOUND_QUEUE).await?;
        info!("Waiting for RSSI messages on '{}'...", INBOUND_QUEUE);

        loop {
            // Only the wait is cancellable, a delivery in hand is always finished
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, closing broker session");
                    if let Err(err) = session.close().await {
                        warn!("Error closing broker session: {}", err);
                    }
                    return Ok(());
                }
                delivery = session.recv() => delivery?,
            };

            self.handle(&mut session, delivery).await?;
        }
    }

    /// Classify one delivery, publish the result, then ack.
    pub async fn handle<S: Session>(
        &self,
        session: &mut S,
        delivery: S::Delivery,
    ) -> Result<Outcome, BrokerError> {
        info!(
            "Processing RSSI: {}{}",
            String::from_utf8_lossy(delivery.payload()),
            if delivery.redelivered() { " (redelivered)" } else { "" }
        );

        let encoded = Measurement::decode(delivery.payload()).and_then(|measurement| {
            let result = ClassificationResult::from_measurement(&measurement);
            result.encode().map(|body| (result, body))
        });
        let (result, body) = match encoded {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(
                    "{} (body: {:?}), rejecting{}",
                    err,
                    String::from_utf8_lossy(delivery.payload()),
                    if self.requeue_malformed { " with requeue" } else { "" }
                );
                session.reject(delivery, self.requeue_malformed).await?;
                return Ok(Outcome::Rejected);
            }
        };

        session.publish(OUTBOUND_QUEUE, &body).await?;
        session.ack(delivery).await?;
        debug!(
            "Published {:?} for timestamp {:?}",
            result.attendance, result.timestamp
        );

        Ok(Outcome::Published(result.attendance))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Connect,
        Declare(String),
        Subscribe(String),
        Publish(String, Value),
        Ack(u64),
        Reject(u64, bool),
        Close,
    }

    #[derive(Default)]
    struct Broker {
        queue: VecDeque<FakeDelivery>,
        next_tag: u64,
        ops: Vec<Op>,
        failing_connects: usize,
        failing_publishes: usize,
        shutdown_on_publish: bool,
    }

    /// In-memory broker. Unsettled deliveries go back to the front of the
    /// queue when their session is dropped. Once the queue runs dry the
    /// shutdown token is cancelled.
    #[derive(Clone)]
    struct FakeConnector {
        broker: Arc<Mutex<Broker>>,
        shutdown: CancellationToken,
    }

    impl FakeConnector {
        fn with_bodies(bodies: &[&str]) -> Self {
            let mut broker = Broker::default();
            for body in bodies {
                broker.next_tag += 1;
                broker.queue.push_back(FakeDelivery {
                    tag: broker.next_tag,
                    body: body.as_bytes().to_vec(),
                    redelivered: false,
                });
            }
            FakeConnector {
                broker: Arc::new(Mutex::new(broker)),
                shutdown: CancellationToken::new(),
            }
        }

        fn ops(&self) -> Vec<Op> {
            self.broker.lock().unwrap().ops.clone()
        }

        fn published(&self) -> Vec<Value> {
            self.ops()
                .into_iter()
                .filter_map(|op| match op {
                    Op::Publish(_, body) => Some(body),
                    _ => None,
                })
                .collect()
        }
    }

    #[derive(Debug)]
    struct FakeDelivery {
        tag: u64,
        body: Vec<u8>,
        redelivered: bool,
    }

    impl Inbound for FakeDelivery {
        fn payload(&self) -> &[u8] {
            &self.body
        }

        fn redelivered(&self) -> bool {
            self.redelivered
        }
    }

    struct FakeSession {
        broker: Arc<Mutex<Broker>>,
        shutdown: CancellationToken,
        unsettled: Vec<(u64, Vec<u8>)>,
    }

    impl FakeSession {
        fn settle(&mut self, tag: u64) {
            self.unsettled.retain(|(t, _)| *t != tag);
        }
    }

    impl Drop for FakeSession {
        fn drop(&mut self) {
            let mut broker = self.broker.lock().unwrap();
            for (tag, body) in self.unsettled.drain(..).rev() {
                broker.queue.push_front(FakeDelivery {
                    tag,
                    body,
                    redelivered: true,
                });
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&self) -> Result<FakeSession, BrokerError> {
            let mut broker = self.broker.lock().unwrap();
            broker.ops.push(Op::Connect);
            if broker.failing_connects > 0 {
                broker.failing_connects -= 1;
                return Err(BrokerError::Refused("broker unavailable".to_string()));
            }
            Ok(FakeSession {
                broker: Arc::clone(&self.broker),
                shutdown: self.shutdown.clone(),
                unsettled: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl Session for FakeSession {
        type Delivery = FakeDelivery;

        async fn declare_queue(&mut self, queue: &str) -> Result<(), BrokerError> {
            let mut broker = self.broker.lock().unwrap();
            broker.ops.push(Op::Declare(queue.to_string()));
            Ok(())
        }

        async fn subscribe(&mut self, queue: &str) -> Result<(), BrokerError> {
            let mut broker = self.broker.lock().unwrap();
            broker.ops.push(Op::Subscribe(queue.to_string()));
            Ok(())
        }

        async fn recv(&mut self) -> Result<FakeDelivery, BrokerError> {
            let next = self.broker.lock().unwrap().queue.pop_front();
            match next {
                Some(delivery) => {
                    self.unsettled.push((delivery.tag, delivery.body.clone()));
                    Ok(delivery)
                }
                None => {
                    self.shutdown.cancel();
                    std::future::pending().await
                }
            }
        }

        async fn publish(&mut self, queue: &str, body: &[u8]) -> Result<(), BrokerError> {
            let mut broker = self.broker.lock().unwrap();
            if broker.failing_publishes > 0 {
                broker.failing_publishes -= 1;
                return Err(BrokerError::PublishNotConfirmed(queue.to_string()));
            }
            let body = serde_json::from_slice(body).unwrap();
            broker.ops.push(Op::Publish(queue.to_string(), body));
            if broker.shutdown_on_publish {
                self.shutdown.cancel();
            }
            Ok(())
        }

        async fn ack(&mut self, delivery: FakeDelivery) -> Result<(), BrokerError> {
            self.settle(delivery.tag);
            self.broker.lock().unwrap().ops.push(Op::Ack(delivery.tag));
            Ok(())
        }

        async fn reject(
            &mut self,
            delivery: FakeDelivery,
            requeue: bool,
        ) -> Result<(), BrokerError> {
            self.settle(delivery.tag);
            self.broker
                .lock()
                .unwrap()
                .ops
                .push(Op::Reject(delivery.tag, requeue));
            Ok(())
        }

        async fn close(self) -> Result<(), BrokerError> {
            self.broker.lock().unwrap().ops.push(Op::Close);
            Ok(())
        }
    }

    fn worker(requeue_malformed: bool) -> Worker {
        Worker::new(&WorkerConfig {
            reconnect_delay_seconds: Some(0),
            requeue_malformed: Some(requeue_malformed),
        })
    }

    async fn run(connector: &FakeConnector, worker: &Worker) {
        worker
            .run(connector, connector.shutdown.clone())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_publishes_before_ack() {
        let connector = FakeConnector::with_bodies(&[
            r#"{"rssi": -50, "timestamp": "T1"}"#,
            r#"{"rssi": -85, "timestamp": "T2"}"#,
        ]);
        run(&connector, &worker(false)).await;

        assert_eq!(
            connector.ops(),
            vec![
                Op::Connect,
                Op::Declare("rssi_queue".to_string()),
                Op::Declare("result_queue".to_string()),
                Op::Subscribe("rssi_queue".to_string()),
                Op::Publish(
                    "result_queue".to_string(),
                    json!({"attendance": "present", "timestamp": "T1"})
                ),
                Op::Ack(1),
                Op::Publish(
                    "result_queue".to_string(),
                    json!({"attendance": "absent", "timestamp": "T2"})
                ),
                Op::Ack(2),
                Op::Close,
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_rssi_and_boundary() {
        let connector = FakeConnector::with_bodies(&[
            r#"{"timestamp": "T3"}"#,
            r#"{"rssi": -70, "timestamp": "T4"}"#,
        ]);
        run(&connector, &worker(false)).await;

        assert_eq!(
            connector.published(),
            vec![
                json!({"attendance": "absent", "timestamp": "T3"}),
                json!({"attendance": "absent", "timestamp": "T4"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_malformed_is_rejected_without_publish() {
        let connector = FakeConnector::with_bodies(&[
            "{not json",
            r#"{"rssi": -60, "timestamp": "T5"}"#,
        ]);
        run(&connector, &worker(false)).await;

        let ops = connector.ops();
        assert!(ops.contains(&Op::Reject(1, false)));
        assert!(!ops.contains(&Op::Ack(1)));
        assert_eq!(
            connector.published(),
            vec![json!({"attendance": "present", "timestamp": "T5"})]
        );
        assert!(ops.contains(&Op::Ack(2)));
    }

    #[tokio::test]
    async fn test_malformed_requeue_policy() {
        let connector = FakeConnector::with_bodies(&["[]"]);
        let mut session = connector.connect().await.unwrap();
        let delivery = session.recv().await.unwrap();

        let outcome = worker(true).handle(&mut session, delivery).await.unwrap();

        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(connector.ops(), vec![Op::Connect, Op::Reject(1, true)]);
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_message_unacked() {
        let connector = FakeConnector::with_bodies(&[r#"{"rssi": -40, "timestamp": "T6"}"#]);
        connector.broker.lock().unwrap().failing_publishes = 1;
        let mut session = connector.connect().await.unwrap();
        let delivery = session.recv().await.unwrap();

        let result = worker(false).handle(&mut session, delivery).await;

        assert!(matches!(result, Err(BrokerError::PublishNotConfirmed(_))));
        assert!(!connector.ops().iter().any(|op| matches!(op, Op::Ack(_))));
        drop(session);
        let broker = connector.broker.lock().unwrap();
        assert_eq!(broker.queue.len(), 1);
        assert!(broker.queue[0].redelivered);
    }

    #[tokio::test]
    async fn test_reconnects_and_processes_redelivery() {
        let connector = FakeConnector::with_bodies(&[
            r#"{"rssi": -40, "timestamp": "T7"}"#,
            r#"{"rssi": -90, "timestamp": "T8"}"#,
        ]);
        {
            let mut broker = connector.broker.lock().unwrap();
            broker.failing_connects = 1;
            broker.failing_publishes = 1;
        }
        run(&connector, &worker(false)).await;

        let ops = connector.ops();
        assert_eq!(ops.iter().filter(|op| **op == Op::Connect).count(), 3);
        assert_eq!(
            connector.published(),
            vec![
                json!({"attendance": "present", "timestamp": "T7"}),
                json!({"attendance": "absent", "timestamp": "T8"}),
            ]
        );
        let acks: Vec<_> = ops
            .iter()
            .filter(|op| matches!(op, Op::Ack(_)))
            .cloned()
            .collect();
        assert_eq!(acks, vec![Op::Ack(1), Op::Ack(2)]);
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let body = r#"{"rssi": -65, "timestamp": "2025-06-13T17:00:00Z"}"#;
        let connector = FakeConnector::with_bodies(&[body, body]);
        run(&connector, &worker(false)).await;

        let published = connector.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0], published[1]);
    }

    #[tokio::test]
    async fn test_shutdown_mid_message_finishes_it_and_stops() {
        let connector = FakeConnector::with_bodies(&[
            r#"{"rssi": -45, "timestamp": "T9"}"#,
            r#"{"rssi": -45, "timestamp": "T10"}"#,
        ]);
        connector.broker.lock().unwrap().shutdown_on_publish = true;
        run(&connector, &worker(false)).await;

        let ops = connector.ops();
        assert_eq!(
            &ops[4..],
            &[
                Op::Publish(
                    "result_queue".to_string(),
                    json!({"attendance": "present", "timestamp": "T9"})
                ),
                Op::Ack(1),
                Op::Close,
            ]
        );
        let broker = connector.broker.lock().unwrap();
        assert_eq!(broker.queue.len(), 1);
        assert_eq!(broker.queue[0].tag, 2);
        assert!(!broker.queue[0].redelivered);
    }

    #[tokio::test]
    async fn test_shutdown_before_start() {
        let connector = FakeConnector::with_bodies(&[r#"{"rssi": -40}"#]);
        connector.shutdown.cancel();
        run(&connector, &worker(false)).await;
        assert!(connector.ops().is_empty());
    }
}
