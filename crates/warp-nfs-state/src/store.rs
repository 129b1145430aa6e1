//! Consolidated in-memory state store
//!
//! Every table (clients, open-owners, opens, lock-owners, delegations and
//! the per-file LockFile registry) lives in one `StateStore` behind a
//! single mutex. Entities reference each other by stable keys, never by
//! pointer, and destruction is two-phase: unlink from every index, then
//! remove from the arena.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use bytes::Bytes;

use crate::config::StateConfig;
use crate::error::StateStatus;
use crate::lock::{LockConflict, LockSpan};
use crate::open::CachedReply;
use crate::stateid::{StateId, StateIndexAllocator};
use crate::types::{CallbackInfo, ClientId, FileHandle, OpenAccess, OpenDeny, Principal};

/// Stable key addressing per-client state in the arenas: the owning client
/// record's index plus the per-client state index. Exactly the two words a
/// stateid's opaque portion carries after the boot epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct StateKey {
    pub client: u32,
    pub index: u32,
}

impl StateKey {
    pub(crate) fn from_stateid(sid: &StateId) -> Self {
        Self {
            client: sid.client_index(),
            index: sid.state_index(),
        }
    }
}

/// A registered client record
pub(crate) struct Client {
    pub idx: u32,
    /// Client-supplied opaque identity (also the stable-storage key)
    pub id: Bytes,
    pub clientid: ClientId,
    pub confirm: u64,
    pub verifier: [u8; 8],
    pub principal: Principal,
    pub callback: CallbackInfo,
    pub needs_confirm: bool,
    /// Confirmation after an address refresh keeps existing state
    pub dont_clean: bool,
    pub admin_revoked: bool,
    pub cb_down: bool,
    pub callbacks_on: bool,
    /// A confirmed record for this client exists in stable storage
    pub stamped: bool,
    pub expiry: Instant,
    /// Retention deadline for delegations held over from before a client
    /// reboot
    pub deleg_expiry: Instant,
    /// In-flight recall callbacks referencing this record
    pub cb_refs: u32,
    pub open_owners: Vec<u64>,
    pub delegs: Vec<StateKey>,
    pub old_delegs: Vec<StateKey>,
    alloc: StateIndexAllocator,
    state_indices: HashSet<u32>,
}

impl Client {
    pub(crate) fn next_state_index(&mut self) -> u32 {
        let idx = self.alloc.allocate(&self.state_indices);
        self.state_indices.insert(idx);
        idx
    }

    pub(crate) fn drop_state_index(&mut self, idx: u32) {
        self.state_indices.remove(&idx);
    }

    pub(crate) fn lease_expired(&self, now: Instant) -> bool {
        self.expiry < now
    }
}

/// An open-owner: the client-side entity that sequences open-related
/// requests
pub(crate) struct OpenOwner {
    pub id: u64,
    pub client: u32,
    pub name: Bytes,
    pub seqid: u32,
    pub needs_confirm: bool,
    pub reply: Option<CachedReply>,
    pub opens: Vec<StateKey>,
    /// Sweep ticks spent with no opens
    pub idle_ticks: u32,
}

/// One open of one file by one open-owner
pub(crate) struct Open {
    pub key: StateKey,
    pub stateid: StateId,
    pub owner: u64,
    pub fh: FileHandle,
    pub access: OpenAccess,
    pub deny: OpenDeny,
    pub principal: Principal,
    pub lock_owners: Vec<StateKey>,
}

/// A lock-owner holding byte-range locks under one open
pub(crate) struct LockOwner {
    pub key: StateKey,
    pub stateid: StateId,
    pub name: Bytes,
    pub seqid: u32,
    pub open: StateKey,
    pub fh: FileHandle,
    pub spans: Vec<LockSpan>,
    pub reply: Option<CachedReply>,
}

/// Kind of delegation held by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationKind {
    /// Read delegation: the client may cache reads
    Read,
    /// Write delegation: the client may cache reads and writes
    Write,
}

/// A delegation grant
pub(crate) struct Delegation {
    pub key: StateKey,
    pub stateid: StateId,
    pub client: u32,
    pub fh: FileHandle,
    pub kind: DelegationKind,
    pub recalling: bool,
    /// Held over from before a client reboot, eligible only for reclaim
    pub old: bool,
    /// Return deadline once recalled
    pub expiry: Instant,
    /// Hard deadline after which the holder is revoked
    pub limit: Instant,
    /// File change marker at grant time
    pub change_marker: u64,
}

/// Per-file hub tying together every kind of state on one file
pub(crate) struct LockFile {
    pub fh: FileHandle,
    pub opens: Vec<StateKey>,
    pub lock_owners: Vec<StateKey>,
    pub delegs: Vec<StateKey>,
    /// File-wide merged span list mirrored onto the local filesystem
    pub local_spans: Vec<LockSpan>,
    /// Holds the record alive across blocking mirror calls
    pub refs: u32,
}

impl LockFile {
    pub(crate) fn new(fh: FileHandle) -> Self {
        Self {
            fh,
            opens: Vec::new(),
            lock_owners: Vec::new(),
            delegs: Vec::new(),
            local_spans: Vec::new(),
            refs: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.opens.is_empty()
            && self.lock_owners.is_empty()
            && self.delegs.is_empty()
            && self.local_spans.is_empty()
            && self.refs == 0
    }
}

/// Result of a store operation, dispatched by the engine's retry loop
pub(crate) enum Outcome<T> {
    /// Completed
    Done(T),
    /// Duplicate request: hand back the cached reply
    Replay(crate::open::ReplyBody),
    /// Failed with a protocol status
    Fail(StateStatus),
    /// Byte-range lock denied by a live conflicting holder
    DeniedLock(LockConflict),
    /// Conflicting state needs out-of-band resolution, then a retry
    Conflict(ConflictAction),
    /// Local-filesystem mirroring must run before the operation finishes
    Mirror(crate::lock::MirrorStage),
}

/// What the engine must do about a conflict before retrying
pub(crate) enum ConflictAction {
    /// Re-run the operation holding the exclusive gate
    NeedExclusive,
    /// Conflicting state was already torn down; retry immediately
    Retry,
    /// A recall is outstanding and unexpired; tell the client to back off
    Delay,
    /// Issue this recall with every lock released, then back off
    Recall(RecallSnapshot),
    /// Exclusive gate held: persist a revoke record, tear down, retry
    Revoke(RevokePlan),
}

/// Everything a recall callback needs, snapshotted under the state mutex
pub(crate) struct RecallSnapshot {
    pub client: u32,
    pub callback: CallbackInfo,
    pub stateid: StateId,
    pub fh: FileHandle,
    pub truncating: bool,
}

/// A revocation decided under the exclusive gate
pub(crate) struct RevokePlan {
    pub client: u32,
    pub id: Bytes,
    /// Tear down all of the client's state, not just the delegation
    pub purge_client: bool,
    pub deleg: Option<StateKey>,
}

/// The consolidated store. One instance per engine, behind one mutex.
pub(crate) struct StateStore {
    pub boot_epoch: u32,
    pub config: StateConfig,
    next_client_idx: u32,
    next_clientid_index: u32,
    next_confirm: u64,
    next_owner: u64,
    /// Running clients + owners + opens + locks + delegations count
    pub state_count: u64,
    pub clients: HashMap<u32, Client>,
    pub by_opaque: HashMap<Bytes, u32>,
    /// Protocol clientid index -> client record index (they diverge after a
    /// reboot-migration re-registers a record under a fresh clientid)
    pub by_clientid: HashMap<u32, u32>,
    pub owners: HashMap<u64, OpenOwner>,
    pub opens: HashMap<StateKey, Open>,
    pub lock_owners: HashMap<StateKey, LockOwner>,
    pub delegations: HashMap<StateKey, Delegation>,
    pub files: HashMap<FileHandle, LockFile>,
}

impl StateStore {
    pub(crate) fn new(boot_epoch: u32, config: StateConfig) -> Self {
        Self {
            boot_epoch,
            config,
            next_client_idx: 1,
            next_clientid_index: 1,
            next_confirm: 1,
            next_owner: 1,
            state_count: 0,
            clients: HashMap::new(),
            by_opaque: HashMap::new(),
            by_clientid: HashMap::new(),
            owners: HashMap::new(),
            opens: HashMap::new(),
            lock_owners: HashMap::new(),
            delegations: HashMap::new(),
            files: HashMap::new(),
        }
    }

    /// Lifetime stamped on a renewed lease
    pub(crate) fn lease_expiry(&self, now: Instant) -> Instant {
        now + self.config.lease_with_delta()
    }

    pub(crate) fn alloc_client_idx(&mut self) -> u32 {
        let idx = self.next_client_idx;
        self.next_client_idx = self.next_client_idx.wrapping_add(1);
        idx
    }

    pub(crate) fn alloc_clientid_index(&mut self) -> u32 {
        let idx = self.next_clientid_index;
        self.next_clientid_index = self.next_clientid_index.wrapping_add(1);
        idx
    }

    pub(crate) fn alloc_confirm(&mut self) -> u64 {
        let token = self.next_confirm;
        self.next_confirm += 1;
        token
    }

    pub(crate) fn alloc_owner_id(&mut self) -> u64 {
        let id = self.next_owner;
        self.next_owner += 1;
        id
    }

    pub(crate) fn over_state_limit(&self) -> bool {
        self.state_count > self.config.state_limit
    }

    /// Apply a signed delta to the global state count
    pub(crate) fn adjust_count(&mut self, delta: i64) {
        if delta >= 0 {
            self.state_count += delta as u64;
        } else {
            self.state_count = self.state_count.saturating_sub((-delta) as u64);
        }
    }

    pub(crate) fn new_client(
        &mut self,
        id: Bytes,
        verifier: [u8; 8],
        principal: Principal,
        callback: CallbackInfo,
        now: Instant,
    ) -> u32 {
        let idx = self.alloc_client_idx();
        let clientid = ClientId::new(self.boot_epoch, self.alloc_clientid_index());
        let confirm = self.alloc_confirm();
        let expiry = self.lease_expiry(now);
        let client = Client {
            idx,
            id: id.clone(),
            clientid,
            confirm,
            verifier,
            principal,
            callback,
            needs_confirm: true,
            dont_clean: false,
            admin_revoked: false,
            cb_down: false,
            callbacks_on: false,
            stamped: false,
            expiry,
            deleg_expiry: expiry,
            cb_refs: 0,
            open_owners: Vec::new(),
            delegs: Vec::new(),
            old_delegs: Vec::new(),
            alloc: StateIndexAllocator::new(),
            state_indices: HashSet::new(),
        };
        self.by_opaque.insert(id, idx);
        self.by_clientid.insert(clientid.index, idx);
        self.clients.insert(idx, client);
        self.state_count += 1;
        idx
    }

    /// Resolve a presented clientid to a record, renewing its lease.
    /// Epoch staleness is checked by the engine before the store is locked.
    pub(crate) fn use_client(
        &mut self,
        clientid: ClientId,
        now: Instant,
        require_confirmed: bool,
    ) -> Result<u32, StateStatus> {
        let idx = *self
            .by_clientid
            .get(&clientid.index)
            .ok_or(StateStatus::Expired)?;
        let expiry = self.lease_expiry(now);
        let client = self.clients.get_mut(&idx).ok_or(StateStatus::Expired)?;
        if client.admin_revoked {
            return Err(StateStatus::AdminRevoked);
        }
        if require_confirmed && client.needs_confirm {
            return Err(StateStatus::Expired);
        }
        client.expiry = expiry;
        Ok(idx)
    }

    /// Compare a presented stateid's sequence against the current one
    pub(crate) fn check_stateid_seq(
        presented: &StateId,
        current: &StateId,
    ) -> Result<(), StateStatus> {
        if presented.seqid == current.seqid {
            Ok(())
        } else if presented.seqid.wrapping_add(1) == current.seqid {
            Err(StateStatus::OldStateid)
        } else {
            Err(StateStatus::BadStateid)
        }
    }

    /// Does the client hold any opens or delegations?
    pub(crate) fn client_has_state(&self, idx: u32) -> bool {
        let Some(client) = self.clients.get(&idx) else {
            return false;
        };
        if !client.delegs.is_empty() || !client.old_delegs.is_empty() {
            return true;
        }
        client
            .open_owners
            .iter()
            .filter_map(|oid| self.owners.get(oid))
            .any(|owner| !owner.opens.is_empty())
    }

    // ---- two-phase destruction -------------------------------------------

    /// Remove a lock-owner: spans, links from its open, its file and its
    /// client, then the arena entry
    pub(crate) fn free_lock_owner(&mut self, key: StateKey) {
        let Some(lo) = self.lock_owners.remove(&key) else {
            return;
        };
        self.state_count = self
            .state_count
            .saturating_sub(1 + lo.spans.len() as u64);
        if let Some(open) = self.opens.get_mut(&lo.open) {
            open.lock_owners.retain(|k| *k != key);
        }
        if let Some(file) = self.files.get_mut(&lo.fh) {
            file.lock_owners.retain(|k| *k != key);
        }
        if let Some(client) = self.clients.get_mut(&key.client) {
            client.drop_state_index(key.index);
        }
    }

    /// Remove an open and every lock-owner under it
    pub(crate) fn free_open(&mut self, key: StateKey) {
        let Some(open) = self.opens.remove(&key) else {
            return;
        };
        for lk in open.lock_owners.clone() {
            self.free_lock_owner(lk);
        }
        if let Some(owner) = self.owners.get_mut(&open.owner) {
            owner.opens.retain(|k| *k != key);
        }
        if let Some(file) = self.files.get_mut(&open.fh) {
            file.opens.retain(|k| *k != key);
        }
        if let Some(client) = self.clients.get_mut(&key.client) {
            client.drop_state_index(key.index);
        }
        self.state_count = self.state_count.saturating_sub(1);
        self.maybe_release_file(&open.fh);
    }

    /// Remove an open-owner and every open under it
    pub(crate) fn free_open_owner(&mut self, id: u64) {
        let Some(owner) = self.owners.remove(&id) else {
            return;
        };
        for open in owner.opens.clone() {
            self.free_open(open);
        }
        if let Some(client) = self.clients.get_mut(&owner.client) {
            client.open_owners.retain(|o| *o != id);
        }
        self.state_count = self.state_count.saturating_sub(1);
    }

    /// Remove a delegation
    pub(crate) fn free_delegation(&mut self, key: StateKey) {
        let Some(deleg) = self.delegations.remove(&key) else {
            return;
        };
        if let Some(file) = self.files.get_mut(&deleg.fh) {
            file.delegs.retain(|k| *k != key);
        }
        if let Some(client) = self.clients.get_mut(&key.client) {
            client.delegs.retain(|k| *k != key);
            client.old_delegs.retain(|k| *k != key);
            client.drop_state_index(key.index);
        }
        self.state_count = self.state_count.saturating_sub(1);
        self.maybe_release_file(&deleg.fh);
    }

    /// Free every open-owner (and with them opens and locks) of a client;
    /// delegations are handled separately by the callers
    pub(crate) fn clean_client(&mut self, idx: u32) {
        let owners = match self.clients.get(&idx) {
            Some(c) => c.open_owners.clone(),
            None => return,
        };
        for oid in owners {
            self.free_open_owner(oid);
        }
    }

    /// Free both delegation lists of a client
    pub(crate) fn free_client_delegs(&mut self, idx: u32) {
        let (delegs, old) = match self.clients.get(&idx) {
            Some(c) => (c.delegs.clone(), c.old_delegs.clone()),
            None => return,
        };
        for key in delegs.into_iter().chain(old) {
            self.free_delegation(key);
        }
    }

    /// Remove the whole client record and everything it owns
    pub(crate) fn purge_client(&mut self, idx: u32) {
        self.clean_client(idx);
        self.free_client_delegs(idx);
        if let Some(client) = self.clients.remove(&idx) {
            self.by_opaque.remove(&client.id);
            self.by_clientid.remove(&client.clientid.index);
            self.state_count = self.state_count.saturating_sub(1);
        }
    }

    /// Apply a revocation decided under the exclusive gate. The stable
    /// record was appended by the engine before this runs.
    pub(crate) fn apply_revoke(&mut self, plan: &RevokePlan) {
        if let Some(key) = plan.deleg {
            self.free_delegation(key);
        }
        if plan.purge_client {
            // The record survives stateless so the client learns of the
            // revocation through EXPIRED on its next state operation.
            self.clean_client(plan.client);
            self.free_client_delegs(plan.client);
        }
    }

    /// A recall callback finished; drop its reference on the client record
    pub(crate) fn callback_done(&mut self, idx: u32) {
        if let Some(client) = self.clients.get_mut(&idx) {
            client.cb_refs = client.cb_refs.saturating_sub(1);
        }
    }

    /// Mark a client's callback path broken
    pub(crate) fn mark_cb_down(&mut self, idx: u32) {
        if let Some(client) = self.clients.get_mut(&idx) {
            client.cb_down = true;
        }
    }
}
