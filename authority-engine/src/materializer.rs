//! Ledger materializer (spec §4.G): Merkle batching, periodic snapshots,
//! and replay. The ledger itself is already written synchronously by
//! `AuthorityEngine` inside its own store call; this module only seals
//! committed ranges after the fact, the way the teacher's
//! `MerkleSegmenter`/`CheckpointWriter` pair trail a log that something
//! else is already appending to.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use authority_core::store::{LedgerFilter, MandateStore, StoreError};
use ed25519_dalek::SigningKey;
use tokio::sync::watch;
use tokio::time::sleep;

use authority_spec::{
    self as spec, AuthorityLedgerEvent, EventKind, Hash, LedgerEventId, LedgerSnapshot,
    MerkleRootRecord, PrincipalId, SnapshotTrigger, Timestamp,
};

/// Tunables for the materializer (spec §4.G defaults).
#[derive(Debug, Clone)]
pub struct MaterializerConfig {
    /// Close the Merkle batch once it holds this many events.
    pub batch_event_threshold: usize,
    /// Close the Merkle batch once its oldest event is this old.
    pub batch_age_threshold: Duration,
    /// How often the batcher wakes to check thresholds.
    pub batch_poll_interval: Duration,
    /// How often the snapshot scheduler wakes to check the cron trigger.
    pub snapshot_poll_interval: Duration,
    /// Snapshots are taken once per this period (default: daily).
    pub snapshot_interval: Duration,
    /// Snapshots older than this are garbage-collected.
    pub snapshot_retention: Duration,
    /// Principal id attributed to materializer-signed ledger rows.
    pub signing_principal: PrincipalId,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        Self {
            batch_event_threshold: 1000,
            batch_age_threshold: Duration::from_secs(60),
            batch_poll_interval: Duration::from_secs(1),
            snapshot_poll_interval: Duration::from_secs(60),
            snapshot_interval: Duration::from_secs(24 * 60 * 60),
            snapshot_retention: Duration::from_secs(90 * 24 * 60 * 60),
            signing_principal: "authority-materializer".to_string(),
        }
    }
}

/// Runs the Merkle-batching and snapshot-scheduling background tasks over a
/// shared store. Each task responds to a shared cooperative shutdown signal
/// by flushing its in-flight batch before exiting (spec §5 cancellation).
pub struct LedgerMaterializer {
    store: Arc<dyn MandateStore>,
    config: MaterializerConfig,
    signing_key: SigningKey,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl LedgerMaterializer {
    pub fn new(store: Arc<dyn MandateStore>, config: MaterializerConfig, signing_key: SigningKey) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            config,
            signing_key,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signal both background tasks to flush and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Spawn the Merkle-batching task. The batch is owned exclusively by
    /// this task; no other component writes it (spec §5 shared resources).
    pub fn spawn_merkle_batcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_merkle_batcher().await })
    }

    /// Spawn the snapshot-scheduler task.
    pub fn spawn_snapshot_scheduler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_snapshot_scheduler().await })
    }

    async fn run_merkle_batcher(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        let mut cursor: LedgerEventId = self
            .store
            .get_latest_merkle_root()
            .await
            .ok()
            .flatten()
            .map(|root| root.last_event_id)
            .unwrap_or(0);
        let mut batch: VecDeque<AuthorityLedgerEvent> = VecDeque::new();
        let mut oldest_in_batch: Option<Instant> = None;

        loop {
            if *shutdown.borrow() {
                if !batch.is_empty() {
                    self.seal_batch(&mut batch).await;
                }
                return;
            }

            match self.store.events_after(cursor, self.config.batch_event_threshold).await {
                Ok(events) => {
                    for event in events {
                        cursor = event.id;
                        if oldest_in_batch.is_none() {
                            oldest_in_batch = Some(Instant::now());
                        }
                        batch.push_back(event);
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "merkle batcher failed to read new events");
                }
            }

            let threshold_hit = batch.len() >= self.config.batch_event_threshold;
            let age_hit = oldest_in_batch
                .map(|t| t.elapsed() >= self.config.batch_age_threshold)
                .unwrap_or(false);
            if !batch.is_empty() && (threshold_hit || age_hit) {
                self.seal_batch(&mut batch).await;
                oldest_in_batch = None;
            }

            tokio::select! {
                _ = sleep(self.config.batch_poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn seal_batch(&self, batch: &mut VecDeque<AuthorityLedgerEvent>) {
        if batch.is_empty() {
            return;
        }
        let first_event_id = batch.front().unwrap().id;
        let last_event_id = batch.back().unwrap().id;
        let event_count = batch.len() as u64;

        let leaves: Vec<Vec<u8>> = batch.iter().map(event_leaf_bytes).collect();
        let leaf_refs: Vec<&[u8]> = leaves.iter().map(|b| b.as_slice()).collect();
        let root_hash = spec::merkle_root(&leaf_refs);
        let root_id = root_hash;
        let now = now_unix();
        let signature = spec::sign(&self.signing_key, &root_hash);

        let record = MerkleRootRecord {
            root_id,
            root_hash,
            first_event_id,
            last_event_id,
            event_count,
            created_at: now,
            signing_principal: self.config.signing_principal.clone(),
            signature,
        };

        if let Err(err) = self.store.put_merkle_root(record).await {
            tracing::error!(error = %err, "failed to persist sealed merkle root");
            return;
        }
        if let Err(err) = self
            .store
            .attach_merkle_root(first_event_id, last_event_id, root_id)
            .await
        {
            tracing::error!(error = %err, "failed to attach merkle root to sealed events");
            return;
        }

        tracing::info!(
            first_event_id,
            last_event_id,
            event_count,
            "sealed merkle batch"
        );
        batch.clear();
    }

    async fn run_snapshot_scheduler(&self) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                return;
            }
            if self.snapshot_due().await {
                if let Err(err) = self.take_snapshot(SnapshotTrigger::Scheduled).await {
                    tracing::error!(error = %err, "scheduled snapshot failed");
                }
                if let Err(err) = self.prune_old_snapshots().await {
                    tracing::error!(error = %err, "snapshot pruning failed");
                }
            }
            tokio::select! {
                _ = sleep(self.config.snapshot_poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn snapshot_due(&self) -> bool {
        match self.store.get_latest_snapshot().await {
            Ok(Some(snapshot)) => {
                let elapsed = now_unix().saturating_sub(snapshot.created_at);
                elapsed >= self.config.snapshot_interval.as_secs()
            }
            Ok(None) => true,
            Err(err) => {
                tracing::warn!(error = %err, "failed to check latest snapshot, skipping this tick");
                false
            }
        }
    }

    /// Project current authority state into a snapshot row. Exposed for
    /// explicit `POST /snapshots` admin requests as well as the cron path.
    pub async fn take_snapshot(&self, trigger: SnapshotTrigger) -> Result<LedgerSnapshot, StoreError> {
        let latest_root = self.store.get_latest_merkle_root().await?;
        let last_included_event_id = latest_root.as_ref().map(|r| r.last_event_id).unwrap_or(0);

        let page = self
            .store
            .query_ledger(LedgerFilter::default(), usize::MAX, 0)
            .await?;
        let event_count = page.total_count as u64;

        let now = now_unix();
        let mut hasher_input = Vec::new();
        hasher_input.extend_from_slice(&last_included_event_id.to_be_bytes());
        hasher_input.extend_from_slice(&event_count.to_be_bytes());
        if let Some(root) = &latest_root {
            hasher_input.extend_from_slice(&root.root_hash);
        }
        let content_hash = spec::merkle_root(&[&hasher_input]);

        let snapshot = LedgerSnapshot {
            snapshot_id: content_hash,
            created_at: now,
            last_included_event_id,
            size_bytes: hasher_input.len() as u64,
            event_count,
            content_hash,
            trigger,
        };
        let persisted = self.store.put_snapshot(snapshot).await?;
        tracing::info!(
            snapshot_id = %hex32(&persisted.snapshot_id),
            event_count = persisted.event_count,
            "ledger snapshot taken"
        );
        Ok(persisted)
    }

    async fn prune_old_snapshots(&self) -> Result<usize, StoreError> {
        let cutoff = now_unix().saturating_sub(self.config.snapshot_retention.as_secs());
        let pruned = self.store.prune_snapshots(cutoff).await?;
        if pruned > 0 {
            tracing::info!(pruned, "pruned snapshots past retention horizon");
        }
        Ok(pruned)
    }
}

/// Canonical bytes for one event's Merkle leaf. `merkle_root`/
/// `merkle_inclusion_proof` apply the leaf hash themselves — this must stay
/// raw, pre-hash bytes, or the tree gets double-hashed leaves.
fn event_leaf_bytes(event: &AuthorityLedgerEvent) -> Vec<u8> {
    let wire = spec::wire::LedgerEventWire::from(event);
    serde_json::to_vec(&wire).expect("LedgerEventWire serializes infallibly")
}

fn now_unix() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn hex32(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// A request to replay the ledger from a point in time or a snapshot (spec
/// §4.G `replay`). Replays may surface duplicate-looking events; they are
/// reported, never silently deduplicated, since replay is an explicit audit
/// operation.
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub from_event_id: LedgerEventId,
    pub limit: usize,
}

/// Findings from a replay pass: the events visited, plus any apparent
/// duplicates by `(kind, principal_id, mandate_id, timestamp)` — a replay
/// invariant violation worth surfacing, not silently swallowing.
#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub events: Vec<AuthorityLedgerEvent>,
    pub duplicate_keys: Vec<(EventKind, PrincipalId, Option<authority_spec::MandateId>, Timestamp)>,
}

/// Stream ledger events forward from `request.from_event_id`, reporting
/// apparent duplicates along the way (spec §4.G `replay`).
pub async fn replay(
    store: &dyn MandateStore,
    request: ReplayRequest,
) -> Result<ReplayReport, StoreError> {
    let events = store
        .events_after(request.from_event_id, request.limit)
        .await?;

    let mut seen = std::collections::HashSet::new();
    let mut duplicate_keys = Vec::new();
    for event in &events {
        let key = (event.kind, event.principal_id.clone(), event.mandate_id, event.timestamp);
        if !seen.insert(key.clone()) {
            duplicate_keys.push(key);
        }
    }

    Ok(ReplayReport { events, duplicate_keys })
}

/// Fetch a Merkle inclusion proof for `mandate_id`'s `issued` ledger event
/// (spec §6, §8: "fetch the root and an inclusion proof for mandate #500's
/// issued event... both true"). Returns `None` if the mandate has no issued
/// event, or its batch hasn't been sealed by the Merkle batcher yet.
pub async fn inclusion_proof_for_mandate(
    store: &dyn MandateStore,
    mandate_id: authority_spec::MandateId,
) -> Result<Option<spec::MerkleProofWire>, StoreError> {
    let page = store
        .query_ledger(
            LedgerFilter {
                mandate_id: Some(mandate_id),
                kind: Some(EventKind::Issued),
                ..Default::default()
            },
            1,
            0,
        )
        .await?;
    let Some(target) = page.events.into_iter().next() else {
        return Ok(None);
    };
    let Some(root_id) = target.merkle_root_id else {
        return Ok(None);
    };
    let root = match store.get_merkle_root(&root_id).await {
        Ok(root) => root,
        Err(StoreError::NotFound(_)) => return Ok(None),
        Err(err) => return Err(err),
    };

    let batch_size = (root.last_event_id - root.first_event_id + 1) as usize;
    let batch = store
        .events_after(root.first_event_id.saturating_sub(1), batch_size)
        .await?;
    let leaves: Vec<Vec<u8>> = batch.iter().map(event_leaf_bytes).collect();
    let leaf_refs: Vec<&[u8]> = leaves.iter().map(|b| b.as_slice()).collect();
    let index = (target.id - root.first_event_id) as usize;
    let Some(proof) = spec::merkle_inclusion_proof(&leaf_refs, index) else {
        return Ok(None);
    };
    Ok(Some(spec::MerkleProofWire::from_proof(
        &proof,
        &root.signature,
        root.first_event_id,
        root.last_event_id,
    )))
}
