use crate::{Delivery, Queue, QueueError, QueueMessage, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// A message waiting to become visible
struct Scheduled {
    visible_at: Instant,
    seq: u64,
    message: QueueMessage,
    delivery_count: u32,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.visible_at == other.visible_at && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Earliest visible first, FIFO among equals (BinaryHeap is a max-heap)
        other
            .visible_at
            .cmp(&self.visible_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct InFlight {
    message: QueueMessage,
    delivery_count: u32,
    deadline: Instant,
}

#[derive(Default)]
struct State {
    ready: BinaryHeap<Scheduled>,
    in_flight: HashMap<Uuid, InFlight>,
    seq: u64,
    closed: bool,
}

impl State {
    fn schedule(&mut self, message: QueueMessage, visible_at: Instant, delivery_count: u32) {
        self.seq += 1;
        self.ready.push(Scheduled {
            visible_at,
            seq: self.seq,
            message,
            delivery_count,
        });
    }

    /// Make messages whose visibility timeout lapsed deliverable again
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(receipt, _)| *receipt)
            .collect();

        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                debug!(
                    "Visibility timeout lapsed for task {}, redelivering",
                    flight.message.task_id
                );
                self.schedule(flight.message, now, flight.delivery_count);
            }
        }
    }

    /// Earliest instant at which something may become deliverable
    fn next_wake(&self) -> Option<Instant> {
        let ready = self.ready.peek().map(|s| s.visible_at);
        let lease = self.in_flight.values().map(|f| f.deadline).min();
        match (ready, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process queue with visibility timeouts and delayed redelivery
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
    available: AtomicBool,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        MemoryQueue {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a broker outage: while unavailable, publishes fail
    pub fn set_available(&self, available: bool) {
        self.available.store(available, AtomicOrdering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn try_take(&self) -> std::result::Result<Option<Delivery>, Option<Instant>> {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.reclaim_expired(now);

        if state.closed {
            return Ok(None);
        }

        let visible = state.ready.peek().is_some_and(|s| s.visible_at <= now);
        if !visible {
            return Err(state.next_wake());
        }

        match state.ready.pop() {
            Some(scheduled) => {
                let receipt = Uuid::new_v4();
                let delivery_count = scheduled.delivery_count + 1;
                state.in_flight.insert(
                    receipt,
                    InFlight {
                        message: scheduled.message.clone(),
                        delivery_count,
                        deadline: now + self.visibility_timeout,
                    },
                );
                Ok(Some(Delivery {
                    receipt,
                    message: scheduled.message,
                    delivery_count,
                }))
            }
            None => Err(state.next_wake()),
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn publish(&self, message: QueueMessage) -> Result<()> {
        if !self.available.load(AtomicOrdering::SeqCst) {
            return Err(QueueError::Unavailable("broker not reachable".to_string()));
        }
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.schedule(message, Instant::now(), 0);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_take() {
                Ok(delivery) => return Ok(delivery),
                Err(Some(wake)) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(wake) => {}
                    }
                }
                Err(None) => notified.await,
            }
        }
    }

    async fn ack(&self, receipt: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        state
            .in_flight
            .remove(&receipt)
            .map(|_| ())
            .ok_or(QueueError::UnknownReceipt(receipt))
    }

    async fn nack(&self, receipt: Uuid, delay: Duration) -> Result<()> {
        {
            let mut state = self.state.lock();
            let flight = state
                .in_flight
                .remove(&receipt)
                .ok_or(QueueError::UnknownReceipt(receipt))?;
            state.schedule(flight.message, Instant::now() + delay, flight.delivery_count);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn extend(&self, receipt: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        let flight = state
            .in_flight
            .get_mut(&receipt)
            .ok_or(QueueError::UnknownReceipt(receipt))?;
        flight.deadline = Instant::now() + self.visibility_timeout;
        Ok(())
    }

    fn depth(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.in_flight.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }
}
