use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::debug;
use transactional_outbox::{OutboxError, OutboxEvent, OutboxPublisher, OutboxResult};

use super::decode::Delivery;

/// In-process transport: outbox rows become [`Delivery`] messages on a
/// bounded tokio channel read by the projection consumer.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<Delivery>,
    send_timeout: Duration,
}

impl ChannelPublisher {
    pub fn new(tx: mpsc::Sender<Delivery>) -> Self {
        Self {
            tx,
            send_timeout: Duration::from_secs(1),
        }
    }

    /// Publisher plus the receiving end for the consumer.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// How long a publish may wait for room before counting as failed.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }
}

#[async_trait]
impl OutboxPublisher for ChannelPublisher {
    async fn publish(&self, event: &OutboxEvent) -> OutboxResult<()> {
        match self
            .tx
            .send_timeout(Delivery::from_outbox(event), self.send_timeout)
            .await
        {
            Ok(()) => {
                debug!(event_id = %event.id, event_type = %event.event_type, "Event handed to consumer");
                Ok(())
            }
            Err(SendTimeoutError::Timeout(_)) => Err(OutboxError::PublishFailed(
                "consumer queue full".to_string(),
            )),
            Err(SendTimeoutError::Closed(_)) => Err(OutboxError::PublishFailed(
                "consumer queue closed".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn row() -> OutboxEvent {
        OutboxEvent::new(
            Uuid::new_v4(),
            "video",
            Uuid::new_v4(),
            "video.created",
            b"{}".to_vec(),
            BTreeMap::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_publish_delivers_with_routing_attributes() {
        let (publisher, mut rx) = ChannelPublisher::channel(4);
        let event = row();

        publisher.publish(&event).await.unwrap();
        let delivery = rx.recv().await.unwrap();

        assert_eq!(delivery.payload, b"{}".to_vec());
        assert_eq!(delivery.partition_key(), event.aggregate_id.to_string());
        assert_eq!(delivery.attempt, 0);
    }

    #[tokio::test]
    async fn test_full_queue_fails_publish() {
        let (publisher, _rx) = ChannelPublisher::channel(1);
        let publisher = publisher.with_send_timeout(Duration::from_millis(10));

        publisher.publish(&row()).await.unwrap();
        let err = publisher.publish(&row()).await.unwrap_err();

        assert!(matches!(err, OutboxError::PublishFailed(_)));
    }

    #[tokio::test]
    async fn test_closed_queue_fails_publish() {
        let (publisher, rx) = ChannelPublisher::channel(1);
        drop(rx);

        assert!(publisher.publish(&row()).await.is_err());
    }
}
