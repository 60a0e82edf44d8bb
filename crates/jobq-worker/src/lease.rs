//! Keeps one delivery's dedup claim and queue visibility alive while it
//! executes, so a long bulk job is not taken over or redelivered halfway.

use jobq_persistence::{DedupStore, PersistenceError};
use jobq_queue::{Queue, QueueError};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

pub struct ClaimLease {
    dedup: Arc<dyn DedupStore>,
    queue: Arc<dyn Queue>,
    key: String,
    owner: String,
    receipt: Uuid,
    lease: chrono::Duration,
}

impl ClaimLease {
    pub fn new(
        dedup: Arc<dyn DedupStore>,
        queue: Arc<dyn Queue>,
        key: impl Into<String>,
        owner: impl Into<String>,
        receipt: Uuid,
        lease: chrono::Duration,
    ) -> Self {
        ClaimLease {
            dedup,
            queue,
            key: key.into(),
            owner: owner.into(),
            receipt,
            lease,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Renew the claim and the message's visibility.
    ///
    /// `Ok(false)` means another delivery holds the key now and this one must
    /// stop. A lost visibility deadline alone is not fatal: the redelivered
    /// copy finds the renewed claim and defers itself.
    pub async fn renew(&self) -> Result<bool, PersistenceError> {
        if !self.dedup.renew(&self.key, &self.owner, self.lease)? {
            warn!(key = %self.key, "Claim held by {} was taken over", self.owner);
            return Ok(false);
        }

        match self.queue.extend(self.receipt).await {
            Ok(()) => {}
            Err(QueueError::UnknownReceipt(_)) => {
                debug!(key = %self.key, "Message already redelivered, claim still held");
            }
            Err(e) => warn!(key = %self.key, "Failed to extend visibility: {}", e),
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobq_persistence::MemoryStore;
    use jobq_queue::{MemoryQueue, QueueMessage};

    #[tokio::test]
    async fn test_renew_keeps_claim_and_message() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(std::time::Duration::from_millis(150)));
        queue
            .publish(QueueMessage {
                task_id: Uuid::new_v4(),
                job_id: Uuid::new_v4(),
                idempotency_key: "k".to_string(),
                task_type: "echo".to_string(),
            })
            .await
            .unwrap();
        let delivery = queue.receive().await.unwrap().unwrap();
        store
            .check_and_mark("k", "slot-a", Duration::milliseconds(150), Duration::hours(1))
            .unwrap();

        let lease = ClaimLease::new(
            store.clone(),
            queue.clone(),
            "k",
            "slot-a",
            delivery.receipt,
            Duration::milliseconds(150),
        );
        for _ in 0..3 {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            assert!(lease.renew().await.unwrap());
        }

        assert!(!store
            .check_and_mark("k", "slot-b", Duration::seconds(30), Duration::hours(1))
            .unwrap()
            .is_new());
        queue.ack(delivery.receipt).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_reports_lost_claim() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(MemoryQueue::new(std::time::Duration::from_secs(30)));
        store
            .check_and_mark("k", "slot-a", Duration::zero(), Duration::hours(1))
            .unwrap();
        store
            .check_and_mark("k", "slot-b", Duration::seconds(30), Duration::hours(1))
            .unwrap();

        let lease = ClaimLease::new(
            store,
            queue,
            "k",
            "slot-a",
            Uuid::new_v4(),
            Duration::seconds(30),
        );
        assert!(!lease.renew().await.unwrap());
    }
}
