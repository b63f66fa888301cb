use async_trait::async_trait;
use rally_core::EventPublisher;
use rally_shared::SlotEvent;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error};

/// Kafka sink for [`SlotEvent`]s. Topic per event kind, keyed by club so a
/// consumer sees one club's events in order.
#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
}

impl KafkaEventPublisher {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, event: &SlotEvent) {
        let payload = match serde_json::to_string(event) {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic = event.topic(), "failed to encode event: {}", e);
                return;
            }
        };
        let key = event.key();
        let record = FutureRecord::to(event.topic()).key(&key).payload(&payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                debug!(
                    topic = event.topic(),
                    partition = delivery.partition,
                    offset = delivery.offset,
                    "event published"
                );
            }
            Err((e, _msg)) => {
                error!(topic = event.topic(), "failed to publish event: {}", e);
            }
        }
    }
}
