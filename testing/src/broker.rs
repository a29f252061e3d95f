//! In-memory partitioned log with consumer groups.
//!
//! [`InMemoryBroker`] stands in for the real broker in tests:
//!
//! - messages are routed to a partition by hashing the key, so one key always
//!   lands on one partition
//! - each consumer group keeps its own committed offset per partition, and
//!   offsets are committed as soon as a message is handed out
//! - a consumer only reads the partitions it was assigned, and assignment
//!   changes are announced on the rebalance channel
//! - [`InMemoryBroker::rewind`] moves a group's offset back to replay a
//!   window, the way a crash before the next auto-commit would
//!
//! ```
//! use engagement_testing::InMemoryBroker;
//! use engagement_core::event_bus::EventPublisher;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = InMemoryBroker::new(2);
//! broker.publish("student-engagement", Some("user_1"), b"{}").await?;
//! assert_eq!(broker.messages("student-engagement").len(), 1);
//! # Ok(())
//! # }
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use async_trait::async_trait;
use engagement_core::event_bus::{
    EventBusError, EventPublisher, MessageSource, PollOutcome, RebalanceEvent, RebalanceReceiver,
    RebalanceSender, ReceivedMessage, TopicPartition, rebalance_channel,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Longest a poll sleeps when there is nothing to read.
const IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
struct Stored {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<Stored>>>,
    offsets: HashMap<(String, String, i32), i64>,
    round_robin: usize,
    pending_transport_errors: u32,
}

/// A partitioned, in-process log.
///
/// Cloning shares the log.
#[derive(Clone, Debug)]
pub struct InMemoryBroker {
    partitions: usize,
    state: Arc<Mutex<BrokerState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryBroker {
    /// Create a broker whose topics all have `partitions` partitions.
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(BrokerState::default())),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Partitions per topic.
    #[must_use]
    pub const fn partition_count(&self) -> usize {
        self.partitions
    }

    /// Partition a key is routed to.
    #[must_use]
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.as_bytes().hash(&mut hasher);
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % self.partitions as u64) as i32;
        index
    }

    /// Make every publish fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` polls (by any consumer) report a transport error.
    pub fn inject_transport_errors(&self, count: u32) {
        self.state.lock().unwrap().pending_transport_errors = count;
    }

    /// Every message on a topic, partition by partition.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<ReceivedMessage> {
        let state = self.state.lock().unwrap();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter().enumerate().map(move |(offset, stored)| {
                    to_received(topic, partition_id(partition), offset_id(offset), stored)
                })
            })
            .collect()
    }

    /// Move a group's committed offset for one partition back to `offset`.
    pub fn rewind(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state
            .lock()
            .unwrap()
            .offsets
            .insert((group.to_string(), topic.to_string(), partition), offset);
    }

    /// Join `group` on `topic` owning `partitions`.
    ///
    /// The assignment is announced on the returned channel before the first
    /// poll, exactly as a broker-driven rebalance would.
    #[must_use]
    pub fn consumer(
        &self,
        topic: &str,
        group: &str,
        partitions: &[i32],
    ) -> (InMemoryConsumer, RebalanceReceiver) {
        let (tx, rx) = rebalance_channel();
        let assigned = Arc::new(Mutex::new(partitions.to_vec()));
        let _ = tx.send(RebalanceEvent::Assigned(
            partitions
                .iter()
                .map(|p| TopicPartition::new(topic, *p))
                .collect(),
        ));

        let consumer = InMemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            assignment: AssignmentHandle {
                topic: topic.to_string(),
                assigned,
                events: tx,
            },
            next: 0,
            eof_reported: HashSet::new(),
            closed: false,
        };
        (consumer, rx)
    }

    fn append(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> i32 {
        let partition = match key {
            Some(k) => self.partition_for(k),
            None => {
                let mut state = self.state.lock().unwrap();
                state.round_robin = state.round_robin.wrapping_add(1);
                partition_id(state.round_robin % self.partitions)
            }
        };

        let mut state = self.state.lock().unwrap();
        let logs = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); self.partitions]);
        logs[index(partition)].push(Stored {
            key: key.map(|k| k.as_bytes().to_vec()),
            payload: payload.to_vec(),
        });
        partition
    }

    fn read_next(&self, topic: &str, group: &str, partition: i32) -> Option<ReceivedMessage> {
        let mut state = self.state.lock().unwrap();
        let key = (group.to_string(), topic.to_string(), partition);
        let offset = state.offsets.get(&key).copied().unwrap_or(0);
        let stored = state
            .topics
            .get(topic)?
            .get(index(partition))?
            .get(index_from_offset(offset))?
            .clone();
        state.offsets.insert(key, offset + 1);
        Some(to_received(topic, partition, offset, &stored))
    }

    fn take_transport_error(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.pending_transport_errors > 0 {
            state.pending_transport_errors -= 1;
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), EventBusError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventBusError::PublishFailed {
                topic: topic.to_string(),
                reason: "broker unavailable".to_string(),
            });
        }
        self.append(topic, key, payload);
        Ok(())
    }
}

/// Changes a consumer's partition assignment from outside the consumer loop.
#[derive(Clone, Debug)]
pub struct AssignmentHandle {
    topic: String,
    assigned: Arc<Mutex<Vec<i32>>>,
    events: RebalanceSender,
}

impl AssignmentHandle {
    /// Revoke the current assignment and hand out `partitions` instead.
    pub fn reassign(&self, partitions: &[i32]) {
        let previous = std::mem::replace(&mut *self.assigned.lock().unwrap(), partitions.to_vec());
        let _ = self.events.send(RebalanceEvent::Revoked(self.to_topic_partitions(&previous)));
        let _ = self
            .events
            .send(RebalanceEvent::Assigned(self.to_topic_partitions(partitions)));
    }

    /// Currently assigned partitions.
    #[must_use]
    pub fn assigned(&self) -> Vec<i32> {
        self.assigned.lock().unwrap().clone()
    }

    fn to_topic_partitions(&self, partitions: &[i32]) -> Vec<TopicPartition> {
        partitions
            .iter()
            .map(|p| TopicPartition::new(self.topic.clone(), *p))
            .collect()
    }
}

/// A consumer-group member reading from an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topic: String,
    group: String,
    assignment: AssignmentHandle,
    next: usize,
    eof_reported: HashSet<i32>,
    closed: bool,
}

impl InMemoryConsumer {
    /// Handle for simulating rebalances while the consumer is running.
    #[must_use]
    pub fn assignment_handle(&self) -> AssignmentHandle {
        self.assignment.clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryConsumer {
    async fn poll(&mut self, timeout: Duration) -> PollOutcome {
        if self.closed {
            return PollOutcome::Closed;
        }
        if self.broker.take_transport_error() {
            return PollOutcome::TransportError(EventBusError::TransportError(
                "injected transport error".to_string(),
            ));
        }

        let partitions = self.assignment.assigned();
        for step in 0..partitions.len() {
            let partition = partitions[(self.next + step) % partitions.len()];
            if let Some(message) = self.broker.read_next(&self.topic, &self.group, partition) {
                self.next = (self.next + step + 1) % partitions.len();
                self.eof_reported.remove(&partition);
                return PollOutcome::Message(message);
            }
        }

        for partition in &partitions {
            if self.eof_reported.insert(*partition) {
                return PollOutcome::PartitionEof {
                    topic: self.topic.clone(),
                    partition: *partition,
                };
            }
        }

        tokio::time::sleep(timeout.min(IDLE_POLL)).await;
        PollOutcome::TimedOut
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

fn to_received(topic: &str, partition: i32, offset: i64, stored: &Stored) -> ReceivedMessage {
    ReceivedMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        payload: Some(stored.payload.clone()),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
const fn partition_id(index: usize) -> i32 {
    index as i32
}

#[allow(clippy::cast_possible_wrap)]
const fn offset_id(index: usize) -> i64 {
    index as i64
}

#[allow(clippy::cast_sign_loss)]
const fn index(partition: i32) -> usize {
    partition as usize
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
const fn index_from_offset(offset: i64) -> usize {
    offset as usize
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    const TOPIC: &str = "student-engagement";

    #[tokio::test]
    async fn same_key_lands_on_same_partition() {
        let broker = InMemoryBroker::new(4);
        for _ in 0..3 {
            broker.publish(TOPIC, Some("user_7"), b"{}").await.unwrap();
        }

        let messages = broker.messages(TOPIC);
        assert_eq!(messages.len(), 3);
        let expected = broker.partition_for("user_7");
        assert!(messages.iter().all(|m| m.partition == expected));
        let offsets: Vec<i64> = messages.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_publish() {
        let broker = InMemoryBroker::new(1);
        broker.set_unavailable(true);
        let result = broker.publish(TOPIC, Some("user_1"), b"{}").await;
        assert!(matches!(result, Err(EventBusError::PublishFailed { .. })));
        assert!(broker.messages(TOPIC).is_empty());
    }

    #[tokio::test]
    async fn consumer_reads_only_assigned_partitions() {
        let broker = InMemoryBroker::new(1);
        broker.publish(TOPIC, Some("user_1"), b"a").await.unwrap();

        let (mut idle, mut events) = broker.consumer(TOPIC, "group", &[]);
        assert_eq!(events.recv().await, Some(RebalanceEvent::Assigned(vec![])));
        assert!(matches!(
            idle.poll(Duration::from_millis(1)).await,
            PollOutcome::TimedOut
        ));

        let (mut owner, _events) = broker.consumer(TOPIC, "group", &[0]);
        assert!(matches!(
            owner.poll(Duration::from_millis(1)).await,
            PollOutcome::Message(_)
        ));
        assert!(matches!(
            owner.poll(Duration::from_millis(1)).await,
            PollOutcome::PartitionEof { partition: 0, .. }
        ));
        assert!(matches!(
            owner.poll(Duration::from_millis(1)).await,
            PollOutcome::TimedOut
        ));
    }

    #[tokio::test]
    async fn rewind_replays_committed_messages() {
        let broker = InMemoryBroker::new(1);
        broker.publish(TOPIC, Some("user_1"), b"a").await.unwrap();

        let (mut consumer, _events) = broker.consumer(TOPIC, "group", &[0]);
        assert!(matches!(
            consumer.poll(Duration::from_millis(1)).await,
            PollOutcome::Message(_)
        ));

        broker.rewind("group", TOPIC, 0, 0);
        let PollOutcome::Message(replayed) = consumer.poll(Duration::from_millis(1)).await else {
            panic!("expected replayed message");
        };
        assert_eq!(replayed.offset, 0);
    }

    #[tokio::test]
    async fn reassign_announces_revoke_then_assign() {
        let broker = InMemoryBroker::new(2);
        let (consumer, mut events) = broker.consumer(TOPIC, "group", &[0, 1]);
        let _ = events.recv().await;

        consumer.assignment_handle().reassign(&[1]);
        assert_eq!(
            events.recv().await,
            Some(RebalanceEvent::Revoked(vec![
                TopicPartition::new(TOPIC, 0),
                TopicPartition::new(TOPIC, 1),
            ]))
        );
        assert_eq!(
            events.recv().await,
            Some(RebalanceEvent::Assigned(vec![TopicPartition::new(TOPIC, 1)]))
        );
    }
}
