//! Mandate store (spec §4.B): persistent CRUD over principals, policies,
//! mandates, ledger events, Merkle roots and snapshots.
//!
//! `InMemoryStore` holds every table behind a single `parking_lot::Mutex`,
//! giving each operation read-committed, serializable semantics the same
//! way the teacher's `PersistentAppendLog` holds its whole state behind one
//! lock across validate-then-append. `PersistentStore` layers a
//! checksummed, length-prefixed write-ahead log under the ledger-event table
//! only, mirroring `PersistentAppendLog::write_wal`/`read_records`: mandates,
//! principals and policies are rebuilt from the replayed ledger on open
//! (spec §4.G: "the source-of-truth is the event log, not the snapshot").

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use authority_spec::{
    AuthorityLedgerEvent, AuthorityPolicy, EventKind, ExecutionMandate, Hash, LedgerEventId,
    LedgerSnapshot, MandateId, MerkleRootRecord, Principal, PrincipalId, SnapshotTrigger,
    Timestamp,
};

/// Errors raised by the mandate store. Translated into `EngineError` /
/// `DenialReason::DownstreamUnavailable` by the authority engine; never
/// surfaced to RPC callers directly (spec §7).
#[derive(Debug, Error)]
pub enum StoreError {
    /// No row matched the lookup.
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint would be violated (e.g. duplicate principal name).
    #[error("conflict: {0}")]
    Conflict(String),
    /// Disk I/O or (de)serialization failure.
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// A page of ledger-query filters (spec §4.B `query_ledger`).
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    /// Restrict to this principal.
    pub principal_id: Option<PrincipalId>,
    /// Restrict to this mandate.
    pub mandate_id: Option<MandateId>,
    /// Restrict to this event kind.
    pub kind: Option<EventKind>,
    /// Restrict to events at or after this timestamp.
    pub start_time: Option<Timestamp>,
    /// Restrict to events at or before this timestamp.
    pub end_time: Option<Timestamp>,
}

/// A page of ledger events plus the total count matching the filter,
/// independent of `limit`/`offset` (spec §6 `GET /ledger`).
#[derive(Debug, Clone)]
pub struct LedgerPage {
    /// The matching events for this page.
    pub events: Vec<AuthorityLedgerEvent>,
    /// The total number of matching events, ignoring `limit`/`offset`.
    pub total_count: usize,
}

/// Outcome of a cascading revocation (spec §4.B `revoke_mandate`).
#[derive(Debug, Clone)]
pub struct RevokeOutcome {
    /// The mandate ids that transitioned to revoked (target plus descendants).
    pub revoked_ids: Vec<MandateId>,
}

/// Persistent CRUD over the authority data model (spec §4.B).
///
/// Every method is atomic under read-committed isolation: callers never
/// observe a partially-applied mutation. Implementations may be backed by
/// memory, disk, or a real RDBMS; the authority engine is agnostic.
#[async_trait]
pub trait MandateStore: Send + Sync {
    /// Insert or replace a principal row.
    async fn put_principal(&self, principal: Principal) -> Result<Principal, StoreError>;
    /// Look up a principal by id.
    async fn get_principal_by_id(&self, id: &str) -> Result<Principal, StoreError>;
    /// Look up a principal by its unique human name.
    async fn get_principal_by_name(&self, name: &str) -> Result<Principal, StoreError>;
    /// Page through all principals.
    async fn list_principals(&self, page: usize, size: usize) -> Result<Vec<Principal>, StoreError>;

    /// Create a new policy version, atomically inactivating the principal's
    /// previous active version in the same transaction.
    async fn put_policy(&self, policy: AuthorityPolicy) -> Result<AuthorityPolicy, StoreError>;
    /// The principal's single active policy, if any.
    async fn get_active_policy(&self, principal_id: &str) -> Result<AuthorityPolicy, StoreError>;
    /// Every policy version ever created for a principal, oldest first.
    async fn list_policy_versions(
        &self,
        principal_id: &str,
    ) -> Result<Vec<AuthorityPolicy>, StoreError>;

    /// Insert a new mandate.
    async fn put_mandate(&self, mandate: ExecutionMandate) -> Result<ExecutionMandate, StoreError>;
    /// Look up a mandate by id.
    async fn get_mandate(&self, id: &MandateId) -> Result<ExecutionMandate, StoreError>;
    /// Flip the revoked flag on `id`, and on every descendant if `cascade`,
    /// in one transaction. Returns the affected mandate ids.
    async fn revoke_mandate(
        &self,
        id: &MandateId,
        reason: String,
        revoked_at: Timestamp,
        cascade: bool,
    ) -> Result<RevokeOutcome, StoreError>;

    /// Append an immutable ledger event; returns its assigned, strictly
    /// monotonic event id.
    async fn append_event(
        &self,
        event: AuthorityLedgerEvent,
    ) -> Result<LedgerEventId, StoreError>;
    /// Attach a sealed Merkle root to every event in `[first, last]`.
    async fn attach_merkle_root(
        &self,
        first_event_id: LedgerEventId,
        last_event_id: LedgerEventId,
        root_id: Hash,
    ) -> Result<(), StoreError>;
    /// Filtered, paginated ledger query (spec §6 `GET /ledger`).
    async fn query_ledger(
        &self,
        filter: LedgerFilter,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, StoreError>;
    /// Events strictly after `after_id`, in id order, up to `limit` —
    /// used by the ledger materializer's Merkle batcher and by replay.
    async fn events_after(
        &self,
        after_id: LedgerEventId,
        limit: usize,
    ) -> Result<Vec<AuthorityLedgerEvent>, StoreError>;

    /// Persist a sealed Merkle root.
    async fn put_merkle_root(&self, root: MerkleRootRecord) -> Result<MerkleRootRecord, StoreError>;
    /// Look up a Merkle root by id.
    async fn get_merkle_root(&self, id: &Hash) -> Result<MerkleRootRecord, StoreError>;
    /// The most recently sealed Merkle root, if any.
    async fn get_latest_merkle_root(&self) -> Result<Option<MerkleRootRecord>, StoreError>;

    /// Persist a ledger snapshot.
    async fn put_snapshot(&self, snapshot: LedgerSnapshot) -> Result<LedgerSnapshot, StoreError>;
    /// The most recent snapshot, if any.
    async fn get_latest_snapshot(&self) -> Result<Option<LedgerSnapshot>, StoreError>;
    /// Delete every snapshot created at or before `older_than`.
    async fn prune_snapshots(&self, older_than: Timestamp) -> Result<usize, StoreError>;
}

#[derive(Default)]
struct Tables {
    principals_by_id: BTreeMap<PrincipalId, Principal>,
    principal_id_by_name: BTreeMap<String, PrincipalId>,
    /// All policy versions per principal, oldest first.
    policies: BTreeMap<PrincipalId, Vec<AuthorityPolicy>>,
    mandates: BTreeMap<MandateId, ExecutionMandate>,
    /// mandate_id -> direct children, for the cascading-revocation walk.
    children: BTreeMap<MandateId, Vec<MandateId>>,
    /// Ledger events keyed by assigned id, in insertion order.
    events: BTreeMap<LedgerEventId, AuthorityLedgerEvent>,
    next_event_id: LedgerEventId,
    merkle_roots: BTreeMap<Hash, MerkleRootRecord>,
    latest_root_id: Option<Hash>,
    snapshots: Vec<LedgerSnapshot>,
}

/// In-memory implementation of every `MandateStore` operation. Suitable for
/// tests and for single-process deployments layered under
/// `PersistentStore`'s WAL for the ledger-event table.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
        }
    }

    /// Rebuild every derived table (mandates, principals touched only via
    /// replay are not reconstructed here; replay is the materializer's job)
    /// by directly inserting pre-recovered ledger events, preserving their
    /// original ids. Used by `PersistentStore::open` when recovering from a
    /// WAL.
    fn restore_events(&self, events: Vec<AuthorityLedgerEvent>) {
        let mut tables = self.tables.lock();
        for event in events {
            tables.next_event_id = tables.next_event_id.max(event.id + 1);
            tables.events.insert(event.id, event);
        }
    }

    fn descendants_of(tables: &Tables, root: &MandateId) -> Vec<MandateId> {
        let mut out = Vec::new();
        let mut frontier = vec![*root];
        while let Some(id) = frontier.pop() {
            if let Some(kids) = tables.children.get(&id) {
                for kid in kids {
                    out.push(*kid);
                    frontier.push(*kid);
                }
            }
        }
        out
    }
}

#[async_trait]
impl MandateStore for InMemoryStore {
    async fn put_principal(&self, principal: Principal) -> Result<Principal, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.principal_id_by_name.get(&principal.name) {
            if existing != &principal.id {
                return Err(StoreError::Conflict(format!(
                    "principal name {:?} already in use",
                    principal.name
                )));
            }
        }
        tables
            .principal_id_by_name
            .insert(principal.name.clone(), principal.id.clone());
        tables
            .principals_by_id
            .insert(principal.id.clone(), principal.clone());
        Ok(principal)
    }

    async fn get_principal_by_id(&self, id: &str) -> Result<Principal, StoreError> {
        self.tables
            .lock()
            .principals_by_id
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("principal {id}")))
    }

    async fn get_principal_by_name(&self, name: &str) -> Result<Principal, StoreError> {
        let tables = self.tables.lock();
        let id = tables
            .principal_id_by_name
            .get(name)
            .ok_or_else(|| StoreError::NotFound(format!("principal named {name}")))?;
        tables
            .principals_by_id
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("principal named {name}")))
    }

    async fn list_principals(&self, page: usize, size: usize) -> Result<Vec<Principal>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .principals_by_id
            .values()
            .skip(page.saturating_mul(size))
            .take(size)
            .cloned()
            .collect())
    }

    async fn put_policy(&self, mut policy: AuthorityPolicy) -> Result<AuthorityPolicy, StoreError> {
        let mut tables = self.tables.lock();
        let versions = tables.policies.entry(policy.principal_id.clone()).or_default();
        for prior in versions.iter_mut() {
            prior.active = false;
        }
        policy.version = versions.last().map(|p| p.version + 1).unwrap_or(1);
        policy.active = true;
        versions.push(policy.clone());
        Ok(policy)
    }

    async fn get_active_policy(&self, principal_id: &str) -> Result<AuthorityPolicy, StoreError> {
        let tables = self.tables.lock();
        tables
            .policies
            .get(principal_id)
            .and_then(|versions| versions.iter().rev().find(|p| p.active))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("active policy for {principal_id}")))
    }

    async fn list_policy_versions(
        &self,
        principal_id: &str,
    ) -> Result<Vec<AuthorityPolicy>, StoreError> {
        Ok(self
            .tables
            .lock()
            .policies
            .get(principal_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_mandate(&self, mandate: ExecutionMandate) -> Result<ExecutionMandate, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(parent_id) = mandate.parent_mandate_id {
            tables
                .children
                .entry(parent_id)
                .or_default()
                .push(mandate.mandate_id);
        }
        tables.mandates.insert(mandate.mandate_id, mandate.clone());
        Ok(mandate)
    }

    async fn get_mandate(&self, id: &MandateId) -> Result<ExecutionMandate, StoreError> {
        self.tables
            .lock()
            .mandates
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("mandate {}", hex32(id))))
    }

    async fn revoke_mandate(
        &self,
        id: &MandateId,
        reason: String,
        revoked_at: Timestamp,
        cascade: bool,
    ) -> Result<RevokeOutcome, StoreError> {
        let mut tables = self.tables.lock();
        if !tables.mandates.contains_key(id) {
            return Err(StoreError::NotFound(format!("mandate {}", hex32(id))));
        }
        let mut targets = vec![*id];
        if cascade {
            targets.extend(Self::descendants_of(&tables, id));
        }
        for target in &targets {
            if let Some(mandate) = tables.mandates.get_mut(target) {
                mandate.revocation.status = authority_spec::RevocationStatus::Revoked;
                mandate.revocation.revoked_at = Some(revoked_at);
                mandate.revocation.reason = Some(reason.clone());
            }
        }
        Ok(RevokeOutcome {
            revoked_ids: targets,
        })
    }

    async fn append_event(
        &self,
        mut event: AuthorityLedgerEvent,
    ) -> Result<LedgerEventId, StoreError> {
        let mut tables = self.tables.lock();
        let id = tables.next_event_id;
        tables.next_event_id += 1;
        event.id = id;
        tables.events.insert(id, event);
        Ok(id)
    }

    async fn attach_merkle_root(
        &self,
        first_event_id: LedgerEventId,
        last_event_id: LedgerEventId,
        root_id: Hash,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        for id in first_event_id..=last_event_id {
            if let Some(event) = tables.events.get_mut(&id) {
                event.merkle_root_id = Some(root_id);
            }
        }
        Ok(())
    }

    async fn query_ledger(
        &self,
        filter: LedgerFilter,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, StoreError> {
        let tables = self.tables.lock();
        let matching: Vec<AuthorityLedgerEvent> = tables
            .events
            .values()
            .filter(|event| {
                filter
                    .principal_id
                    .as_ref()
                    .is_none_or(|p| &event.principal_id == p)
                    && filter
                        .mandate_id
                        .as_ref()
                        .is_none_or(|m| event.mandate_id.as_ref() == Some(m))
                    && filter.kind.is_none_or(|k| event.kind == k)
                    && filter.start_time.is_none_or(|t| event.timestamp >= t)
                    && filter.end_time.is_none_or(|t| event.timestamp <= t)
            })
            .cloned()
            .collect();
        let total_count = matching.len();
        let events = matching.into_iter().skip(offset).take(limit).collect();
        Ok(LedgerPage { events, total_count })
    }

    async fn events_after(
        &self,
        after_id: LedgerEventId,
        limit: usize,
    ) -> Result<Vec<AuthorityLedgerEvent>, StoreError> {
        Ok(self
            .tables
            .lock()
            .events
            .range(after_id + 1..)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn put_merkle_root(&self, root: MerkleRootRecord) -> Result<MerkleRootRecord, StoreError> {
        let mut tables = self.tables.lock();
        tables.latest_root_id = Some(root.root_id);
        tables.merkle_roots.insert(root.root_id, root.clone());
        Ok(root)
    }

    async fn get_merkle_root(&self, id: &Hash) -> Result<MerkleRootRecord, StoreError> {
        self.tables
            .lock()
            .merkle_roots
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("merkle root {}", hex32(id))))
    }

    async fn get_latest_merkle_root(&self) -> Result<Option<MerkleRootRecord>, StoreError> {
        let tables = self.tables.lock();
        Ok(tables
            .latest_root_id
            .and_then(|id| tables.merkle_roots.get(&id).cloned()))
    }

    async fn put_snapshot(&self, snapshot: LedgerSnapshot) -> Result<LedgerSnapshot, StoreError> {
        let mut tables = self.tables.lock();
        tables.snapshots.push(snapshot.clone());
        Ok(snapshot)
    }

    async fn get_latest_snapshot(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        Ok(self.tables.lock().snapshots.last().cloned())
    }

    async fn prune_snapshots(&self, older_than: Timestamp) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock();
        let before = tables.snapshots.len();
        tables.snapshots.retain(|s| s.created_at > older_than);
        Ok(before - tables.snapshots.len())
    }
}

fn hex32(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

const WAL_CHECKSUM_DOMAIN: &[u8] = b"authority-core:wal:v1";

/// Disk-backed store: an `InMemoryStore` fronted by a checksummed,
/// length-prefixed write-ahead log over ledger events only. Mirrors
/// `PersistentAppendLog`: every `append_event` call is fsynced to the WAL
/// before the in-memory table is updated, and `open` replays the WAL to
/// reconstruct ledger state on restart.
///
/// Principals, policies and mandates are not separately durable here — spec
/// §4.G's guarantee that "the source-of-truth is the event log, not the
/// snapshot" means a real deployment restores them by replaying `issued`/
/// `revoked` events through the authority engine rather than the store
/// layer duplicating that projection logic.
pub struct PersistentStore {
    inner: InMemoryStore,
    wal: Mutex<File>,
    wal_path: PathBuf,
}

impl PersistentStore {
    /// Open (or create) a persistent store at `dir`, replaying any existing
    /// WAL to rebuild the ledger-event table.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create store directory {}", dir.display()))?;
        let wal_path = dir.join("ledger_events.wal");
        let events = read_wal_records(&wal_path)?;
        let inner = InMemoryStore::new();
        inner.restore_events(events);
        let wal = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&wal_path)
            .with_context(|| format!("failed to open WAL {}", wal_path.display()))?;
        Ok(Self {
            inner,
            wal: Mutex::new(wal),
            wal_path,
        })
    }

    fn write_wal(&self, event: &AuthorityLedgerEvent) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(event).context("failed to serialize ledger event")?;
        let mut hasher = Sha256::new();
        hasher.update(WAL_CHECKSUM_DOMAIN);
        hasher.update(&bytes);
        let checksum: Hash = hasher.finalize().into();
        let mut wal = self.wal.lock();
        wal.write_all(&(bytes.len() as u32).to_be_bytes())
            .context("failed to write wal length prefix")?;
        wal.write_all(&checksum)
            .context("failed to write wal checksum")?;
        wal.write_all(&bytes)
            .context("failed to write wal entry body")?;
        wal.flush().context("failed to flush wal")?;
        wal.sync_all().context("failed to sync wal to disk")?;
        Ok(())
    }
}

fn read_wal_records(path: &Path) -> Result<Vec<AuthorityLedgerEvent>, StoreError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut file =
        File::open(path).with_context(|| format!("failed to open wal {}", path.display()))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)
        .with_context(|| format!("failed to read wal {}", path.display()))?;
    let mut cursor = 0usize;
    let mut items = Vec::new();
    while cursor < buf.len() {
        if cursor + 4 > buf.len() {
            return Err(anyhow::anyhow!("truncated wal length prefix in {}", path.display()).into());
        }
        let len = u32::from_be_bytes(buf[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + 32 + len > buf.len() {
            return Err(anyhow::anyhow!("truncated wal record body in {}", path.display()).into());
        }
        let checksum: Hash = buf[cursor..cursor + 32].try_into().unwrap();
        cursor += 32;
        let payload = &buf[cursor..cursor + len];
        cursor += len;
        let mut hasher = Sha256::new();
        hasher.update(WAL_CHECKSUM_DOMAIN);
        hasher.update(payload);
        let digest: Hash = hasher.finalize().into();
        if digest != checksum {
            return Err(anyhow::anyhow!("checksum mismatch in {}", path.display()).into());
        }
        let event: AuthorityLedgerEvent =
            serde_json::from_slice(payload).context("failed to decode ledger event from wal")?;
        items.push(event);
    }
    Ok(items)
}

#[async_trait]
impl MandateStore for PersistentStore {
    async fn put_principal(&self, principal: Principal) -> Result<Principal, StoreError> {
        self.inner.put_principal(principal).await
    }

    async fn get_principal_by_id(&self, id: &str) -> Result<Principal, StoreError> {
        self.inner.get_principal_by_id(id).await
    }

    async fn get_principal_by_name(&self, name: &str) -> Result<Principal, StoreError> {
        self.inner.get_principal_by_name(name).await
    }

    async fn list_principals(&self, page: usize, size: usize) -> Result<Vec<Principal>, StoreError> {
        self.inner.list_principals(page, size).await
    }

    async fn put_policy(&self, policy: AuthorityPolicy) -> Result<AuthorityPolicy, StoreError> {
        self.inner.put_policy(policy).await
    }

    async fn get_active_policy(&self, principal_id: &str) -> Result<AuthorityPolicy, StoreError> {
        self.inner.get_active_policy(principal_id).await
    }

    async fn list_policy_versions(
        &self,
        principal_id: &str,
    ) -> Result<Vec<AuthorityPolicy>, StoreError> {
        self.inner.list_policy_versions(principal_id).await
    }

    async fn put_mandate(&self, mandate: ExecutionMandate) -> Result<ExecutionMandate, StoreError> {
        self.inner.put_mandate(mandate).await
    }

    async fn get_mandate(&self, id: &MandateId) -> Result<ExecutionMandate, StoreError> {
        self.inner.get_mandate(id).await
    }

    async fn revoke_mandate(
        &self,
        id: &MandateId,
        reason: String,
        revoked_at: Timestamp,
        cascade: bool,
    ) -> Result<RevokeOutcome, StoreError> {
        self.inner.revoke_mandate(id, reason, revoked_at, cascade).await
    }

    async fn append_event(
        &self,
        event: AuthorityLedgerEvent,
    ) -> Result<LedgerEventId, StoreError> {
        // Assign the id first so the WAL record carries the same id the
        // in-memory table will use; `InMemoryStore::append_event` is the
        // only place the counter advances.
        let id = self.inner.append_event(event.clone()).await?;
        let mut stamped = event;
        stamped.id = id;
        if let Err(err) = self.write_wal(&stamped) {
            tracing::error!(error = %err, "failed to persist ledger event to wal");
            return Err(err);
        }
        Ok(id)
    }

    async fn attach_merkle_root(
        &self,
        first_event_id: LedgerEventId,
        last_event_id: LedgerEventId,
        root_id: Hash,
    ) -> Result<(), StoreError> {
        self.inner
            .attach_merkle_root(first_event_id, last_event_id, root_id)
            .await
    }

    async fn query_ledger(
        &self,
        filter: LedgerFilter,
        limit: usize,
        offset: usize,
    ) -> Result<LedgerPage, StoreError> {
        self.inner.query_ledger(filter, limit, offset).await
    }

    async fn events_after(
        &self,
        after_id: LedgerEventId,
        limit: usize,
    ) -> Result<Vec<AuthorityLedgerEvent>, StoreError> {
        self.inner.events_after(after_id, limit).await
    }

    async fn put_merkle_root(&self, root: MerkleRootRecord) -> Result<MerkleRootRecord, StoreError> {
        self.inner.put_merkle_root(root).await
    }

    async fn get_merkle_root(&self, id: &Hash) -> Result<MerkleRootRecord, StoreError> {
        self.inner.get_merkle_root(id).await
    }

    async fn get_latest_merkle_root(&self) -> Result<Option<MerkleRootRecord>, StoreError> {
        self.inner.get_latest_merkle_root().await
    }

    async fn put_snapshot(&self, snapshot: LedgerSnapshot) -> Result<LedgerSnapshot, StoreError> {
        self.inner.put_snapshot(snapshot).await
    }

    async fn get_latest_snapshot(&self) -> Result<Option<LedgerSnapshot>, StoreError> {
        self.inner.get_latest_snapshot().await
    }

    async fn prune_snapshots(&self, older_than: Timestamp) -> Result<usize, StoreError> {
        self.inner.prune_snapshots(older_than).await
    }
}

impl PersistentStore {
    /// Path to the underlying WAL file, exposed for operator tooling.
    pub fn wal_path(&self) -> &Path {
        &self.wal_path
    }
}

/// A lightweight row used to materialize a snapshot's content hash, kept
/// here (rather than in `authority-spec`) because it is a store-layer
/// implementation detail, not part of the wire model.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDigestInput {
    principal_count: usize,
    policy_count: usize,
    mandate_count: usize,
    last_event_id: LedgerEventId,
}

/// Compute a stable content hash over a snapshot's constituent counts plus
/// the last included event id, for `LedgerSnapshot::content_hash` (spec §3).
pub fn snapshot_content_hash(
    principal_count: usize,
    policy_count: usize,
    mandate_count: usize,
    last_event_id: LedgerEventId,
) -> Hash {
    let input = SnapshotDigestInput {
        principal_count,
        policy_count,
        mandate_count,
        last_event_id,
    };
    let bytes = serde_json::to_vec(&input).expect("snapshot digest input is infallible to encode");
    let mut hasher = Sha256::new();
    hasher.update(b"authority-core:snapshot-digest:v1");
    hasher.update(&bytes);
    hasher.finalize().into()
}

/// Convenience constructor used by tests and by `authorityd` wiring to pick
/// an in-memory store unless a directory is configured.
pub fn store_for_dir(dir: Option<&Path>) -> Result<Arc<dyn MandateStore>, StoreError> {
    match dir {
        Some(dir) => Ok(Arc::new(PersistentStore::open(dir)?)),
        None => Ok(Arc::new(InMemoryStore::new())),
    }
}

static NEXT_TEST_DIR: AtomicU64 = AtomicU64::new(0);

#[cfg(test)]
mod tests {
    use super::*;
    use authority_spec::{PrincipalKind, Revocation};

    fn temp_dir() -> PathBuf {
        let mut path = std::env::temp_dir();
        let n = NEXT_TEST_DIR.fetch_add(1, Ordering::Relaxed);
        path.push(format!("authority-core-store-test-{n}"));
        let _ = fs::remove_dir_all(&path);
        path
    }

    fn principal(id: &str, name: &str) -> Principal {
        Principal {
            id: id.into(),
            name: name.into(),
            kind: PrincipalKind::Agent,
            parent_id: None,
            public_key: [0u8; 32],
            created_at: 0,
            metadata: serde_json::Value::Null,
            active: true,
        }
    }

    fn mandate(id: Hash, parent: Option<Hash>) -> ExecutionMandate {
        ExecutionMandate {
            mandate_id: id,
            issuer_id: "issuer".into(),
            subject_id: "subject".into(),
            valid_from: 0,
            valid_until: 100,
            resource_scope: vec!["repo:*".into()],
            action_scope: vec!["read".into()],
            signature: [0u8; 64],
            created_at: 0,
            parent_mandate_id: parent,
            delegation_depth: if parent.is_some() { 1 } else { 0 },
            revocation: Revocation::active(),
            intent_hash: None,
        }
    }

    #[tokio::test]
    async fn principal_name_uniqueness_enforced() {
        let store = InMemoryStore::new();
        store.put_principal(principal("p1", "alice")).await.unwrap();
        let err = store
            .put_principal(principal("p2", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn policy_versioning_inactivates_prior() {
        let store = InMemoryStore::new();
        let v1 = AuthorityPolicy {
            policy_id: [1; 32],
            principal_id: "p1".into(),
            allowed_resource_patterns: vec!["*".into()],
            allowed_actions: vec!["read".into()],
            max_validity_seconds: 60,
            delegation_allowed: false,
            max_delegation_depth: 0,
            active: true,
            created_at: 0,
            creator: "admin".into(),
            version: 0,
        };
        store.put_policy(v1.clone()).await.unwrap();
        let v2 = store.put_policy(v1.clone()).await.unwrap();
        assert_eq!(v2.version, 2);
        let versions = store.list_policy_versions("p1").await.unwrap();
        assert!(!versions[0].active);
        assert!(versions[1].active);
        let active = store.get_active_policy("p1").await.unwrap();
        assert_eq!(active.version, 2);
    }

    #[tokio::test]
    async fn cascading_revocation_covers_descendants() {
        let store = InMemoryStore::new();
        let root = [1u8; 32];
        let child = [2u8; 32];
        let grandchild = [3u8; 32];
        store.put_mandate(mandate(root, None)).await.unwrap();
        store.put_mandate(mandate(child, Some(root))).await.unwrap();
        store
            .put_mandate(mandate(grandchild, Some(child)))
            .await
            .unwrap();

        let outcome = store
            .revoke_mandate(&root, "test".into(), 10, true)
            .await
            .unwrap();
        assert_eq!(outcome.revoked_ids.len(), 3);
        for id in [root, child, grandchild] {
            assert!(store.get_mandate(&id).await.unwrap().revocation.is_revoked());
        }
    }

    #[tokio::test]
    async fn ledger_events_get_monotonic_ids() {
        let store = InMemoryStore::new();
        let event = |kind| AuthorityLedgerEvent {
            id: 0,
            kind,
            timestamp: 0,
            principal_id: "p1".into(),
            mandate_id: None,
            decision: None,
            denial_reason: None,
            requested_action: None,
            requested_resource: None,
            correlation_id: "corr-1".into(),
            merkle_root_id: None,
            metadata: serde_json::Value::Null,
        };
        let id1 = store.append_event(event(EventKind::Issued)).await.unwrap();
        let id2 = store.append_event(event(EventKind::Revoked)).await.unwrap();
        assert_eq!(id2, id1 + 1);
    }

    #[tokio::test]
    async fn persistent_store_recovers_ledger_from_wal() {
        let dir = temp_dir();
        let store = PersistentStore::open(&dir).unwrap();
        let event = AuthorityLedgerEvent {
            id: 0,
            kind: EventKind::Issued,
            timestamp: 1,
            principal_id: "p1".into(),
            mandate_id: None,
            decision: None,
            denial_reason: None,
            requested_action: None,
            requested_resource: None,
            correlation_id: "corr-1".into(),
            merkle_root_id: None,
            metadata: serde_json::Value::Null,
        };
        let id = store.append_event(event).await.unwrap();
        drop(store);

        let recovered = PersistentStore::open(&dir).unwrap();
        let page = recovered
            .query_ledger(LedgerFilter::default(), 10, 0)
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.events[0].id, id);
        fs::remove_dir_all(&dir).ok();
    }
}
