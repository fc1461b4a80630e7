//! Event bus client (spec §4.F): idempotent producer and exactly-once
//! consumer groups over the four authority topics plus a DLQ, all
//! partitioned by `principal_id` to guarantee per-principal ordering (spec
//! §5).
//!
//! This is an in-process, transport-agnostic implementation of the wire
//! contract spec §4.F and §6 describe (a real deployment would swap this
//! for a Kafka/Redpanda client without changing `authority-engine`): each
//! topic is a fixed set of append-only partitions, a producer assigns a
//! per-producer sequence number to every message and deduplicates by a
//! caller-supplied key before it ever reaches a partition, and each
//! consumer group tracks its own committed offset per partition with
//! commit-after-success semantics and a bounded retry ladder into the DLQ.
#![deny(missing_docs)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use authority_spec::PrincipalId;

/// The four authority topics plus the dead-letter queue (spec §4.F, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    /// `authority.issued` (>= 3 partitions).
    Issued,
    /// `authority.validated-or-denied` (>= 5 partitions).
    ValidatedOrDenied,
    /// `authority.revoked` (>= 3 partitions).
    Revoked,
    /// `authority.policy-changed` (>= 3 partitions).
    PolicyChanged,
    /// `authority.dlq` (>= 3 partitions).
    Dlq,
}

impl Topic {
    /// The wire topic name (spec §6).
    pub fn name(self) -> &'static str {
        match self {
            Topic::Issued => "authority.issued",
            Topic::ValidatedOrDenied => "authority.validated-or-denied",
            Topic::Revoked => "authority.revoked",
            Topic::PolicyChanged => "authority.policy-changed",
            Topic::Dlq => "authority.dlq",
        }
    }

    /// Default partition count per spec §6's minimums.
    pub fn default_partition_count(self) -> usize {
        match self {
            Topic::Issued => 3,
            Topic::ValidatedOrDenied => 5,
            Topic::Revoked => 3,
            Topic::PolicyChanged => 3,
            Topic::Dlq => 3,
        }
    }

    /// Reverse of `name`, for reconstructing a `Topic` from a `DlqEntry`'s
    /// `original_topic` when requeuing (`authorityd dlq requeue`).
    pub fn from_name(name: &str) -> Option<Topic> {
        Some(match name {
            "authority.issued" => Topic::Issued,
            "authority.validated-or-denied" => Topic::ValidatedOrDenied,
            "authority.revoked" => Topic::Revoked,
            "authority.policy-changed" => Topic::PolicyChanged,
            "authority.dlq" => Topic::Dlq,
            _ => return None,
        })
    }

    fn all() -> [Topic; 5] {
        [
            Topic::Issued,
            Topic::ValidatedOrDenied,
            Topic::Revoked,
            Topic::PolicyChanged,
            Topic::Dlq,
        ]
    }
}

/// One message on a partition: the payload plus everything a consumer needs
/// for dedup, ordering checks, and DLQ provenance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BusMessage {
    /// Producer-assigned, monotonically increasing sequence number.
    pub producer_seq: u64,
    /// The partition key (spec §5: partitioning guarantees per-principal order).
    pub principal_id: PrincipalId,
    /// Caller-supplied idempotency key (typically the ledger event id as a string).
    pub dedup_key: String,
    /// The offset this message occupies within its partition, assigned on append.
    pub offset: u64,
    /// Wall-clock publish time in epoch millis.
    pub published_at_millis: u64,
    /// The wire payload (a `LedgerEventWire` for the four authority topics,
    /// a `DlqEntry` for `authority.dlq`).
    pub payload: serde_json::Value,
}

/// A dead-lettered message, carrying the original topic/partition/offset so
/// an operator can inspect or requeue it (spec §4.F, §7).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DlqEntry {
    /// The topic the message originally failed on.
    pub original_topic: &'static str,
    /// The partition the message originally failed on.
    pub original_partition: usize,
    /// The offset within that partition.
    pub original_offset: u64,
    /// How many handler attempts were made before giving up.
    pub retry_count: u32,
    /// The Rust type name of the error the handler raised.
    pub error_type: String,
    /// The error's `Display` message.
    pub error_message: String,
    /// The consumer group that exhausted its retry budget.
    pub consumer_group: String,
    /// When the final failed attempt completed, epoch millis.
    pub failure_timestamp_millis: u64,
    /// The original message payload, for replay.
    pub payload: serde_json::Value,
}

/// Errors raised by the event bus client.
#[derive(Debug, Error)]
pub enum BusError {
    /// The broker (here: the in-process partition log) could not
    /// acknowledge the publish; the event was requeued into the local
    /// bounded buffer instead of being lost.
    #[error("publish buffered locally after broker ack failure")]
    Buffered,
    /// The local retry buffer is full (spec §4.F: bounded at 32 MB).
    #[error("local publish buffer exhausted")]
    BufferFull,
    /// Unknown topic or partition index.
    #[error("unknown partition: {0}")]
    UnknownPartition(String),
}

struct Partition {
    entries: Mutex<Vec<BusMessage>>,
    notify: Notify,
    last_seq_by_principal: Mutex<HashMap<PrincipalId, u64>>,
}

impl Partition {
    fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
            last_seq_by_principal: Mutex::new(HashMap::new()),
        }
    }

    /// Append a message, assigning its offset, and report whether its
    /// producer sequence number regressed relative to the last message seen
    /// for the same principal on this partition — a bus ordering-invariant
    /// violation (spec §4.F: "reported, not silently skipped").
    fn append(&self, mut message: BusMessage) -> (u64, bool) {
        let mut entries = self.entries.lock();
        let offset = entries.len() as u64;
        message.offset = offset;

        let mut last_seq = self.last_seq_by_principal.lock();
        let out_of_order = match last_seq.get(&message.principal_id) {
            Some(prev) => message.producer_seq <= *prev,
            None => false,
        };
        last_seq.insert(message.principal_id.clone(), message.producer_seq);
        drop(last_seq);

        entries.push(message);
        drop(entries);
        self.notify.notify_waiters();
        (offset, out_of_order)
    }

    fn slice_from(&self, offset: u64, limit: usize) -> Vec<BusMessage> {
        self.entries
            .lock()
            .iter()
            .skip(offset as usize)
            .take(limit)
            .cloned()
            .collect()
    }

    fn len(&self) -> u64 {
        self.entries.lock().len() as u64
    }
}

struct TopicState {
    partitions: Vec<Partition>,
}

impl TopicState {
    fn new(partition_count: usize) -> Self {
        Self {
            partitions: (0..partition_count).map(|_| Partition::new()).collect(),
        }
    }

    fn partition_for(&self, principal_id: &str) -> usize {
        let mut hash: u64 = 1469598103934665603; // FNV-1a offset basis
        for byte in principal_id.as_bytes() {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash as usize) % self.partitions.len().max(1)
    }
}

/// The in-process event bus: fixed topics, each with fixed partitions.
/// Shared via `Arc` between producers and consumer groups.
pub struct EventBus {
    topics: HashMap<Topic, TopicState>,
    unavailable: AtomicBool,
}

impl EventBus {
    /// Build a bus with each topic's default partition count (spec §6).
    pub fn new() -> Self {
        let mut topics = HashMap::new();
        for topic in Topic::all() {
            topics.insert(topic, TopicState::new(topic.default_partition_count()));
        }
        Self {
            topics,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Test/fault-injection hook: force every publish to fail until
    /// cleared, so the resilience layer's circuit breaker around the
    /// producer has something to trip on.
    pub fn simulate_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn topic_state(&self, topic: Topic) -> &TopicState {
        self.topics
            .get(&topic)
            .expect("every Topic variant has a TopicState")
    }

    fn partition_count(&self, topic: Topic) -> usize {
        self.topic_state(topic).partitions.len()
    }

    /// Total messages currently on `topic`'s DLQ partitions combined, for
    /// the "DLQ volume exceeding threshold triggers an alert" monitor (spec
    /// §7).
    pub fn dlq_depth(&self) -> u64 {
        self.topic_state(Topic::Dlq)
            .partitions
            .iter()
            .map(Partition::len)
            .sum()
    }

    /// Up to `limit` messages across all `authority.dlq` partitions, newest
    /// offsets last within each partition, for operator inspection
    /// (`authorityd dlq list`).
    pub fn dlq_messages(&self, limit: usize) -> Vec<BusMessage> {
        let mut out = Vec::new();
        for partition in &self.topic_state(Topic::Dlq).partitions {
            out.extend(partition.slice_from(0, limit));
            if out.len() >= limit {
                break;
            }
        }
        out.truncate(limit);
        out
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Default DLQ depth above which an operational alert should fire (spec §7).
pub const DEFAULT_DLQ_ALERT_THRESHOLD: u64 = 1000;

/// Check the bus's DLQ depth against `threshold` and log an alert-level
/// event if it is exceeded. Intended to be polled periodically by
/// `authorityd`.
pub fn check_dlq_alert(bus: &EventBus, threshold: u64) {
    let depth = bus.dlq_depth();
    if depth > threshold {
        tracing::error!(depth, threshold, "authority.dlq volume exceeds alert threshold");
    }
}

/// Producer-side tunables (spec §4.F defaults).
#[derive(Debug, Clone, Copy)]
pub struct ProducerConfig {
    /// Batch linger before a flush is forced (informational here: every
    /// publish acks synchronously, but the field is kept so wiring code can
    /// surface it to metrics/config the way a real Kafka producer would).
    pub linger: Duration,
    /// Max batch size before a flush is forced.
    pub batch_size: usize,
    /// Bound on the local re-queue buffer, in bytes (spec §4.F: 32 MB).
    pub local_buffer_bytes: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            linger: Duration::from_millis(10),
            batch_size: 100,
            local_buffer_bytes: 32 * 1024 * 1024,
        }
    }
}

struct BufferedPublish {
    topic: Topic,
    message: BusMessage,
    approx_bytes: usize,
}

/// Idempotent producer: deduplicates by `dedup_key` before ever touching a
/// partition, and requeues failed publishes into a bounded local buffer
/// rather than dropping them (spec §4.F).
pub struct Producer {
    bus: Arc<EventBus>,
    config: ProducerConfig,
    next_seq: AtomicU64,
    seen_keys: DashSet<String>,
    local_buffer: Mutex<VecDeque<BufferedPublish>>,
    local_buffer_bytes: AtomicUsize,
}

impl Producer {
    /// Create a producer bound to `bus`.
    pub fn new(bus: Arc<EventBus>, config: ProducerConfig) -> Self {
        Self {
            bus,
            config,
            next_seq: AtomicU64::new(0),
            seen_keys: DashSet::new(),
            local_buffer: Mutex::new(VecDeque::new()),
            local_buffer_bytes: AtomicUsize::new(0),
        }
    }

    /// Publish `payload` to `topic`, partitioned by `principal_id`.
    /// Idempotent: republishing the same `dedup_key` is a no-op that
    /// returns `Ok(())` without appending a second message (spec §4.F, §8's
    /// "re-publishing the same ledger event twice yields at most one row").
    pub fn publish(
        &self,
        topic: Topic,
        principal_id: &str,
        dedup_key: String,
        payload: serde_json::Value,
    ) -> Result<(), BusError> {
        if self.seen_keys.contains(&dedup_key) {
            return Ok(());
        }
        let message = BusMessage {
            producer_seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            principal_id: principal_id.to_string(),
            dedup_key: dedup_key.clone(),
            offset: 0,
            published_at_millis: now_millis(),
            payload,
        };

        if self.bus.unavailable.load(Ordering::SeqCst) {
            return self.buffer_or_reject(topic, message);
        }

        let state = self.bus.topic_state(topic);
        let partition_idx = state.partition_for(principal_id);
        let (_, out_of_order) = state.partitions[partition_idx].append(message);
        if out_of_order {
            tracing::error!(
                topic = topic.name(),
                partition = partition_idx,
                principal = principal_id,
                "bus ordering invariant violated: producer sequence regressed within partition"
            );
        }
        self.seen_keys.insert(dedup_key);
        Ok(())
    }

    fn buffer_or_reject(&self, topic: Topic, message: BusMessage) -> Result<(), BusError> {
        let approx_bytes = message.payload.to_string().len() + 64;
        let mut buffer = self.local_buffer.lock();
        let used = self.local_buffer_bytes.load(Ordering::SeqCst);
        if used + approx_bytes > self.config.local_buffer_bytes {
            return Err(BusError::BufferFull);
        }
        self.local_buffer_bytes.fetch_add(approx_bytes, Ordering::SeqCst);
        buffer.push_back(BufferedPublish {
            topic,
            message,
            approx_bytes,
        });
        Err(BusError::Buffered)
    }

    /// Drain the local buffer, retrying each entry against the bus. Call
    /// this once the bus is known to be reachable again (e.g. after a
    /// circuit breaker closes). Entries that still fail remain buffered in
    /// order.
    pub fn drain_local_buffer(&self) -> usize {
        if self.bus.unavailable.load(Ordering::SeqCst) {
            return 0;
        }
        let mut buffer = self.local_buffer.lock();
        let mut drained = 0;
        while let Some(pending) = buffer.pop_front() {
            let state = self.bus.topic_state(pending.topic);
            let partition_idx = state.partition_for(&pending.message.principal_id);
            state.partitions[partition_idx].append(pending.message.clone());
            self.seen_keys.insert(pending.message.dedup_key.clone());
            self.local_buffer_bytes
                .fetch_sub(pending.approx_bytes, Ordering::SeqCst);
            drained += 1;
        }
        drained
    }

    /// Current local buffer occupancy in bytes, for health/metrics reporting.
    pub fn buffered_bytes(&self) -> usize {
        self.local_buffer_bytes.load(Ordering::SeqCst)
    }
}

/// Handles one message at a time for a consumer group. Errors are retried
/// by the group's retry ladder before the message is dead-lettered.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message. An `Err` triggers the retry ladder.
    async fn handle(&self, message: &BusMessage) -> Result<(), anyhow::Error>;
}

/// Exactly-once-per-group consumption of one topic: commit-after-success
/// per partition, a 3-attempt retry ladder, and DLQ routing on exhaustion
/// (spec §4.F).
pub struct ConsumerGroup {
    name: String,
    topic: Topic,
    bus: Arc<EventBus>,
    dlq_producer: Arc<Producer>,
    committed: Vec<AtomicU64>,
    poll_interval: Duration,
    stop: AtomicBool,
}

impl ConsumerGroup {
    /// Create a consumer group named `name` over `topic`. `dlq_producer`
    /// publishes dead-lettered messages onto `authority.dlq`.
    pub fn new(
        name: impl Into<String>,
        topic: Topic,
        bus: Arc<EventBus>,
        dlq_producer: Arc<Producer>,
    ) -> Arc<Self> {
        let partitions = bus.partition_count(topic);
        Arc::new(Self {
            name: name.into(),
            topic,
            committed: (0..partitions).map(|_| AtomicU64::new(0)).collect(),
            bus,
            dlq_producer,
            poll_interval: Duration::from_secs(1),
            stop: AtomicBool::new(false),
        })
    }

    /// Committed offset for `partition`, for health/metrics reporting.
    pub fn committed_offset(&self, partition: usize) -> u64 {
        self.committed[partition].load(Ordering::SeqCst)
    }

    /// Signal every partition task to stop after its current message
    /// completes. Matches spec §5's cooperative-shutdown contract: offsets
    /// are committed per message already, so there is nothing left to flush.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Spawn one long-lived task per partition, each polling for new
    /// messages, running `handler` with a 3-attempt retry ladder, and
    /// committing (advancing its offset) only after the handler succeeds or
    /// the message has been dead-lettered.
    pub fn spawn(self: &Arc<Self>, handler: Arc<dyn MessageHandler>) -> Vec<JoinHandle<()>> {
        let partitions = self.bus.partition_count(self.topic);
        (0..partitions)
            .map(|partition| {
                let group = Arc::clone(self);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { group.run_partition(partition, handler).await })
            })
            .collect()
    }

    async fn run_partition(&self, partition: usize, handler: Arc<dyn MessageHandler>) {
        let state = self.bus.topic_state(self.topic);
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            let offset = self.committed[partition].load(Ordering::SeqCst);
            let batch = state.partitions[partition].slice_from(offset, 64);
            if batch.is_empty() {
                tokio::select! {
                    _ = state.partitions[partition].notify.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }
            for message in batch {
                self.process_one(partition, message, &handler).await;
                self.committed[partition].fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    async fn process_one(&self, partition: usize, message: BusMessage, handler: &Arc<dyn MessageHandler>) {
        let delays = [
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400),
        ];
        let mut attempt = 0;
        loop {
            match handler.handle(&message).await {
                Ok(()) => return,
                Err(err) => {
                    attempt += 1;
                    if attempt > delays.len() {
                        self.dead_letter(partition, &message, attempt - 1, &err);
                        return;
                    }
                    tracing::warn!(
                        group = %self.name,
                        topic = self.topic.name(),
                        partition,
                        attempt,
                        error = %err,
                        "consumer handler failed, retrying"
                    );
                    tokio::time::sleep(delays[attempt - 1]).await;
                }
            }
        }
    }

    fn dead_letter(&self, partition: usize, message: &BusMessage, retry_count: usize, err: &anyhow::Error) {
        let entry = DlqEntry {
            original_topic: self.topic.name(),
            original_partition: partition,
            original_offset: message.offset,
            retry_count: retry_count as u32,
            error_type: std::any::type_name::<anyhow::Error>().to_string(),
            error_message: err.to_string(),
            consumer_group: self.name.clone(),
            failure_timestamp_millis: now_millis(),
            payload: message.payload.clone(),
        };
        tracing::error!(
            group = %self.name,
            topic = self.topic.name(),
            partition,
            offset = message.offset,
            error = %err,
            "handler retries exhausted, routing to authority.dlq"
        );
        let payload = serde_json::to_value(&entry).expect("DlqEntry serializes infallibly");
        let _ = self
            .dlq_producer
            .publish(Topic::Dlq, &message.principal_id, format!("dlq:{}", message.dedup_key), payload);
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn publish_is_idempotent_by_dedup_key() {
        let bus = Arc::new(EventBus::new());
        let producer = Producer::new(Arc::clone(&bus), ProducerConfig::default());
        producer
            .publish(Topic::Issued, "p1", "evt-1".into(), serde_json::json!({"n": 1}))
            .unwrap();
        producer
            .publish(Topic::Issued, "p1", "evt-1".into(), serde_json::json!({"n": 1}))
            .unwrap();
        let state = bus.topic_state(Topic::Issued);
        let partition = state.partition_for("p1");
        assert_eq!(state.partitions[partition].len(), 1);
    }

    #[test]
    fn unavailable_bus_buffers_locally() {
        let bus = Arc::new(EventBus::new());
        bus.simulate_unavailable(true);
        let producer = Producer::new(Arc::clone(&bus), ProducerConfig::default());
        let err = producer
            .publish(Topic::Issued, "p1", "evt-1".into(), serde_json::json!({}))
            .unwrap_err();
        assert!(matches!(err, BusError::Buffered));
        assert!(producer.buffered_bytes() > 0);

        bus.simulate_unavailable(false);
        let drained = producer.drain_local_buffer();
        assert_eq!(drained, 1);
        assert_eq!(producer.buffered_bytes(), 0);
    }

    struct CountingHandler {
        calls: StdAtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl MessageHandler for CountingHandler {
        async fn handle(&self, _message: &BusMessage) -> Result<(), anyhow::Error> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn consumer_commits_after_success() {
        let bus = Arc::new(EventBus::new());
        let producer = Producer::new(Arc::clone(&bus), ProducerConfig::default());
        producer
            .publish(Topic::Issued, "p1", "evt-1".into(), serde_json::json!({"n": 1}))
            .unwrap();

        let dlq_producer = Arc::new(Producer::new(Arc::clone(&bus), ProducerConfig::default()));
        let group = ConsumerGroup::new("materializer", Topic::Issued, Arc::clone(&bus), dlq_producer);
        let handler = Arc::new(CountingHandler {
            calls: StdAtomicUsize::new(0),
            fail_first: 0,
        });
        let handles = group.spawn(handler);
        tokio::time::sleep(Duration::from_millis(50)).await;
        group.shutdown();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_millis(200), h).await;
        }
        let state = bus.topic_state(Topic::Issued);
        let partition = state.partition_for("p1");
        assert_eq!(group.committed_offset(partition), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_dlq() {
        let bus = Arc::new(EventBus::new());
        let producer = Producer::new(Arc::clone(&bus), ProducerConfig::default());
        producer
            .publish(Topic::Revoked, "p1", "evt-1".into(), serde_json::json!({"n": 1}))
            .unwrap();

        let dlq_producer = Arc::new(Producer::new(Arc::clone(&bus), ProducerConfig::default()));
        let group = ConsumerGroup::new("materializer", Topic::Revoked, Arc::clone(&bus), Arc::clone(&dlq_producer));
        let handler = Arc::new(CountingHandler {
            calls: StdAtomicUsize::new(0),
            fail_first: 10,
        });
        let handles = group.spawn(handler);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        group.shutdown();
        for h in handles {
            let _ = tokio::time::timeout(Duration::from_millis(200), h).await;
        }
        assert_eq!(bus.dlq_depth(), 1);
    }
}
