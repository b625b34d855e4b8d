use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("publish to {exchange}/{routing_key} failed: {detail}")]
    Publish {
        exchange: String,
        routing_key: String,
        detail: String,
    },
    #[error("consume on {queue} failed: {detail}")]
    Consume { queue: String, detail: String },
    #[error("declare of {name} failed: {detail}")]
    Declare { name: String, detail: String },
    #[error("no active consumer for queue {0}")]
    NotConsuming(String),
}

/// One message handed to an inbound consumer. Carries enough transport
/// detail for the broker to ack or dead-letter it later.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub payload: Vec<u8>,
    pub(crate) topic: String,
    pub(crate) partition: i32,
    pub(crate) offset: i64,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, payload: Vec<u8>) -> Self {
        let queue = queue.into();
        Self {
            topic: queue.clone(),
            queue,
            payload,
            partition: 0,
            offset: 0,
        }
    }
}

/// Transport contract the bridge is written against: AMQP-flavoured
/// primitives as consumed from the original topology. Declarations are
/// idempotent; publish is fire-and-forget per target; `nack` with
/// `requeue = false` is the poison-message path.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError>;
    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError>;
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError>;
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub dlq_prefix: String,
    pub producer_acks: i16,
    pub producer_timeout_ms: u64,
    pub auto_offset_reset: String,
    pub session_timeout_ms: i32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            group_id: "crm-bridge".to_string(),
            dlq_prefix: "dlq_".to_string(),
            producer_acks: 1,
            producer_timeout_ms: 5_000,
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bootstrap_servers: std::env::var("BROKER_BOOTSTRAP_SERVERS")
                .unwrap_or(defaults.bootstrap_servers),
            group_id: std::env::var("BROKER_GROUP_ID").unwrap_or(defaults.group_id),
            ..defaults
        }
    }
}

/// Kafka-backed broker. `(exchange, routing_key)` maps to the topic
/// `{exchange}.{routing_key}`; a queue is a topic of the same name with the
/// consumer group carrying the queue name. Ack commits the offset;
/// nack-without-requeue publishes to `{dlq_prefix}{queue}` and commits so
/// the poison message never redelivers.
pub struct KafkaBroker {
    config: BrokerConfig,
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
    consumers: DashMap<String, Arc<StreamConsumer>>,
    bindings: DashMap<String, Vec<String>>,
}

impl KafkaBroker {
    pub fn new(config: BrokerConfig) -> Result<Self, BrokerError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("acks", config.producer_acks.to_string())
            .set("message.timeout.ms", config.producer_timeout_ms.to_string())
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.bootstrap_servers)
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            config,
            producer,
            admin,
            consumers: DashMap::new(),
            bindings: DashMap::new(),
        })
    }

    fn topic_for(exchange: &str, routing_key: &str) -> String {
        format!("{exchange}.{routing_key}")
    }

    async fn ensure_topic(&self, name: &str) -> Result<(), BrokerError> {
        let topic = NewTopic::new(name, 1, TopicReplication::Fixed(1));
        let results = self
            .admin
            .create_topics(&[topic], &AdminOptions::new())
            .await
            .map_err(|e| BrokerError::Declare {
                name: name.to_string(),
                detail: e.to_string(),
            })?;
        for result in results {
            match result {
                Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
                Err((topic, code)) => {
                    return Err(BrokerError::Declare {
                        name: topic,
                        detail: code.to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), KafkaError> {
        let key = Uuid::new_v4().to_string();
        self.producer
            .send(
                FutureRecord::to(topic).payload(payload).key(&key),
                Duration::from_millis(self.config.producer_timeout_ms),
            )
            .await
            .map(|_| ())
            .map_err(|(err, _)| err)
    }

    fn commit(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let consumer = self
            .consumers
            .get(&delivery.queue)
            .ok_or_else(|| BrokerError::NotConsuming(delivery.queue.clone()))?;
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &delivery.topic,
                delivery.partition,
                Offset::Offset(delivery.offset + 1),
            )
            .map_err(|e| BrokerError::Consume {
                queue: delivery.queue.clone(),
                detail: e.to_string(),
            })?;
        consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|e| BrokerError::Consume {
                queue: delivery.queue.clone(),
                detail: e.to_string(),
            })
    }
}

#[async_trait]
impl MessageBroker for KafkaBroker {
    async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
        // Exchanges are a topic namespace on this transport; the per-key
        // topics are created on first publish or bind.
        debug!(exchange = name, "exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_topic(name).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let topic = Self::topic_for(exchange, routing_key);
        self.ensure_topic(&topic).await?;
        self.bindings
            .entry(queue.to_string())
            .or_default()
            .push(topic);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        let topic = Self::topic_for(exchange, routing_key);
        self.send(&topic, payload)
            .await
            .map_err(|e| BrokerError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                detail: e.to_string(),
            })
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("group.id", format!("{}-{}", self.config.group_id, queue))
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .create()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let mut topics: Vec<String> = vec![queue.to_string()];
        if let Some(bound) = self.bindings.get(queue) {
            topics.extend(bound.iter().cloned());
        }
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BrokerError::Consume {
                queue: queue.to_string(),
                detail: e.to_string(),
            })?;

        let consumer = Arc::new(consumer);
        self.consumers.insert(queue.to_string(), consumer.clone());

        let (tx, rx) = mpsc::channel(64);
        let queue_name = queue.to_string();
        tokio::spawn(async move {
            loop {
                match consumer.recv().await {
                    Ok(message) => {
                        let delivery = Delivery {
                            queue: queue_name.clone(),
                            payload: message.payload().unwrap_or_default().to_vec(),
                            topic: message.topic().to_string(),
                            partition: message.partition(),
                            offset: message.offset(),
                        };
                        if tx.send(delivery).await.is_err() {
                            info!(queue = %queue_name, "consumer receiver dropped, stopping");
                            break;
                        }
                    }
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "consumer poll error");
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.commit(delivery)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            // Leave the offset uncommitted; the message redelivers when the
            // group rebalances or the process restarts.
            warn!(queue = %delivery.queue, "nack with requeue, offset left uncommitted");
            return Ok(());
        }
        let dlq_topic = format!("{}{}", self.config.dlq_prefix, delivery.queue);
        if let Err(e) = self.send(&dlq_topic, &delivery.payload).await {
            error!(queue = %delivery.queue, error = %e, "dead-letter publish failed");
        }
        self.commit(delivery)
    }
}

pub mod memory {
    //! In-memory broker used by the test suites: publishes are recorded and
    //! routed to queues bound with an exact routing-key match.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct PublishedMessage {
        pub exchange: String,
        pub routing_key: String,
        pub payload: Vec<u8>,
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct NackRecord {
        pub queue: String,
        pub requeue: bool,
    }

    #[derive(Default)]
    pub struct InMemoryBroker {
        published: Mutex<Vec<PublishedMessage>>,
        declared_exchanges: Mutex<Vec<String>>,
        bindings: DashMap<(String, String), Vec<String>>,
        queues: DashMap<String, mpsc::UnboundedSender<Delivery>>,
        pending: DashMap<String, Vec<Delivery>>,
        acked: Mutex<Vec<String>>,
        nacked: Mutex<Vec<NackRecord>>,
    }

    impl InMemoryBroker {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn published(&self) -> Vec<PublishedMessage> {
            self.published.lock().expect("lock poisoned").clone()
        }

        pub fn declared_exchanges(&self) -> Vec<String> {
            self.declared_exchanges.lock().expect("lock poisoned").clone()
        }

        pub fn acked(&self) -> Vec<String> {
            self.acked.lock().expect("lock poisoned").clone()
        }

        pub fn nacked(&self) -> Vec<NackRecord> {
            self.nacked.lock().expect("lock poisoned").clone()
        }

        /// Drops a message straight onto a queue, bypassing exchanges, the
        /// way an external producer would.
        pub fn enqueue(&self, queue: &str, payload: Vec<u8>) {
            self.deliver(queue, payload);
        }

        fn deliver(&self, queue: &str, payload: Vec<u8>) {
            let delivery = Delivery::new(queue, payload);
            if let Some(tx) = self.queues.get(queue) {
                let _ = tx.send(delivery);
            } else {
                self.pending.entry(queue.to_string()).or_default().push(delivery);
            }
        }
    }

    #[async_trait]
    impl MessageBroker for InMemoryBroker {
        async fn declare_exchange(&self, name: &str) -> Result<(), BrokerError> {
            self.declared_exchanges
                .lock()
                .expect("lock poisoned")
                .push(name.to_string());
            Ok(())
        }

        async fn declare_queue(&self, _name: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn bind_queue(
            &self,
            queue: &str,
            exchange: &str,
            routing_key: &str,
        ) -> Result<(), BrokerError> {
            self.bindings
                .entry((exchange.to_string(), routing_key.to_string()))
                .or_default()
                .push(queue.to_string());
            Ok(())
        }

        async fn publish(
            &self,
            exchange: &str,
            routing_key: &str,
            payload: &[u8],
        ) -> Result<(), BrokerError> {
            self.published.lock().expect("lock poisoned").push(PublishedMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload: payload.to_vec(),
            });
            if let Some(queues) = self
                .bindings
                .get(&(exchange.to_string(), routing_key.to_string()))
            {
                for queue in queues.iter() {
                    self.deliver(queue, payload.to_vec());
                }
            }
            Ok(())
        }

        async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Delivery>, BrokerError> {
            let (tx, rx) = mpsc::channel(64);
            let (unbounded_tx, mut unbounded_rx) = mpsc::unbounded_channel();
            if let Some((_, backlog)) = self.pending.remove(queue) {
                for delivery in backlog {
                    let _ = unbounded_tx.send(delivery);
                }
            }
            self.queues.insert(queue.to_string(), unbounded_tx);
            tokio::spawn(async move {
                while let Some(delivery) = unbounded_rx.recv().await {
                    if tx.send(delivery).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
            self.acked
                .lock()
                .expect("lock poisoned")
                .push(delivery.queue.clone());
            Ok(())
        }

        async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
            self.nacked.lock().expect("lock poisoned").push(NackRecord {
                queue: delivery.queue.clone(),
                requeue,
            });
            Ok(())
        }
    }
}
