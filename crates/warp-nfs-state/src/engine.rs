//! The public state engine
//!
//! `StateEngine` owns the consolidated store, the recovery log and the
//! shared/exclusive gate, and wraps every store operation in the
//! conflict-resolution loop: a store call never blocks, and anything it
//! cannot settle inline (a delegation to recall, an expired holder to
//! revoke) comes back as an action the engine performs with the right
//! locks before retrying the operation.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::callback::{CallbackError, LocalLocker, RecallTransport};
use crate::client::{ClientRegistration, Registration, SweepReport};
use crate::config::StateConfig;
use crate::error::{StateError, StateResult, StateStatus};
use crate::guard::StateGate;
use crate::lock::{
    LockConflict, LockGrant, LockOwnerRef, LockRequest, LockSpan, MirrorOp, MirrorStage,
    UnlockRequest,
};
use crate::open::{OpenGrant, OpenRequest, ReplyBody};
use crate::recovery::StableLog;
use crate::stateid::StateId;
use crate::store::{ConflictAction, DelegationKind, Outcome, RecallSnapshot, RevokePlan, StateStore};
use crate::types::{
    CallbackInfo, ClientId, FileHandle, LockKind, OpenAccess, OpenDeny, Principal, RequestTag,
};

/// One client record, as reported by [`StateEngine::dump_clients`]
#[derive(Debug, Clone)]
pub struct ClientDump {
    /// Client-supplied opaque identity
    pub id: Bytes,
    /// Assigned clientid
    pub clientid: ClientId,
    /// Callback service address
    pub callback: CallbackInfo,
    /// Confirmation round-trip completed
    pub confirmed: bool,
    /// State was administratively revoked
    pub admin_revoked: bool,
    /// Lease has lapsed (the record may survive until swept)
    pub lease_expired: bool,
    /// Open-owners registered under the client
    pub open_owners: usize,
    /// Opens held across all owners
    pub opens: usize,
    /// Delegations held, including ones parked for reclaim
    pub delegations: usize,
}

/// One piece of state attached to a file, as reported by
/// [`StateEngine::dump_locks`]
#[derive(Debug, Clone)]
pub enum LockDumpEntry {
    /// A share reservation
    Open {
        /// Holder
        clientid: ClientId,
        /// Current open stateid
        stateid: StateId,
        /// Access bits held
        access: OpenAccess,
        /// Deny bits held
        deny: OpenDeny,
    },
    /// A lock-owner's byte ranges
    Locks {
        /// Holder
        clientid: ClientId,
        /// Lock-owner's opaque name
        owner: Bytes,
        /// Held spans, ordered and non-overlapping
        spans: Vec<LockSpan>,
    },
    /// A delegation
    Delegation {
        /// Holder
        clientid: ClientId,
        /// Read or write
        kind: DelegationKind,
        /// A recall is outstanding
        recalling: bool,
    },
}

/// A store operation settled by the conflict loop; `Mirror` means local
/// lock mirroring still has to run before the result exists
enum Settled<T> {
    Done(T),
    Replay(ReplyBody),
    Mirror(MirrorStage),
}

/// NFSv4 server state engine. One instance per server; all methods take
/// `&self` and may be called concurrently.
pub struct StateEngine {
    config: StateConfig,
    boot_epoch: u32,
    gate: StateGate,
    store: Mutex<StateStore>,
    stable: Mutex<StableLog>,
    recall: Arc<dyn RecallTransport>,
    local: Option<Arc<dyn LocalLocker>>,
    /// Serializes local-lock mirror calls per file
    local_gates: DashMap<FileHandle, Arc<tokio::sync::Mutex<()>>>,
}

impl StateEngine {
    /// Start the engine: replay the recovery log, pick a boot epoch and
    /// begin the grace period (if the log vouches for any clients).
    pub fn new(
        config: StateConfig,
        recall: Arc<dyn RecallTransport>,
        local: Option<Arc<dyn LocalLocker>>,
    ) -> Self {
        let stable = StableLog::setup(&config, Instant::now());
        let boot_epoch = stable.boot_epoch();
        info!(boot_epoch, grace = stable.grace_active(Instant::now()), "state engine started");
        Self {
            store: Mutex::new(StateStore::new(boot_epoch, config.clone())),
            stable: Mutex::new(stable),
            config,
            boot_epoch,
            gate: StateGate::new(),
            recall,
            local,
            local_gates: DashMap::new(),
        }
    }

    /// Boot epoch stamped into every id this instance issues
    pub fn boot_epoch(&self) -> u32 {
        self.boot_epoch
    }

    /// Is the reclaim grace period still running?
    pub fn grace_active(&self) -> bool {
        self.stable.lock().grace_active(Instant::now())
    }

    // ---- client lifetime ---------------------------------------------------

    /// SETCLIENTID
    pub async fn register_client(&self, reg: &ClientRegistration) -> StateResult<Registration> {
        let _gate = self.gate.shared().await;
        let registration = self.store.lock().register_client(reg, Instant::now())?;
        Ok(registration)
    }

    /// SETCLIENTID_CONFIRM
    pub async fn confirm_client(
        &self,
        clientid: ClientId,
        confirm: u64,
        principal: &Principal,
    ) -> StateResult<()> {
        self.clientid_ok(clientid)?;
        let _gate = self.gate.shared().await;
        let now = Instant::now();
        let grace = self.stable.lock().grace_active(now);
        self.store
            .lock()
            .confirm_client(clientid, confirm, principal, grace, now)?;
        Ok(())
    }

    /// RENEW. Returns `true` when the client's callback path is known
    /// broken, which the dispatch layer reports as `CB_PATH_DOWN`; the
    /// lease is renewed either way.
    pub async fn renew(&self, clientid: ClientId, principal: &Principal) -> StateResult<bool> {
        self.clientid_ok(clientid)?;
        let _gate = self.gate.shared().await;
        let cb_down = self
            .store
            .lock()
            .renew_client(clientid, principal, Instant::now())?;
        Ok(cb_down)
    }

    /// Administratively revoke all state of the client with this opaque
    /// identity. The record survives, stateless and flagged, so the client
    /// learns of the revocation on its next operation.
    pub async fn admin_revoke(&self, id: &Bytes) -> StateResult<()> {
        let _gate = self.gate.exclusive().await;
        let idx = self.store.lock().find_by_opaque(id);
        let Some(idx) = idx else {
            return Err(StateStatus::StaleClientId.into());
        };
        self.stable.lock().append_revoked(id);
        self.store.lock().admin_revoke_apply(idx);
        info!("client state administratively revoked");
        Ok(())
    }

    // ---- opens --------------------------------------------------------------

    /// OPEN
    pub async fn open(&self, req: &OpenRequest) -> StateResult<OpenGrant> {
        self.clientid_ok(req.clientid)?;
        let grace = self.grace_active();
        match self.check_grace(req.reclaim) {
            Ok(()) => {}
            // A reclaim outside grace is still honored when the client holds
            // delegations parked by its own reboot (no server restart
            // involved, so the recovery log has no say).
            Err(StateStatus::NoGrace) if self.has_old_delegs(req.clientid) => {}
            Err(status) => return Err(status.into()),
        }
        let mut reclaim_id = None;
        let reclaim_valid = if req.reclaim {
            reclaim_id = self.opaque_of(req.clientid);
            if grace {
                match &reclaim_id {
                    Some(id) => self.stable.lock().check_reclaim(id),
                    None => false,
                }
            } else {
                self.has_old_delegs(req.clientid)
            }
        } else {
            false
        };
        let settled = self
            .run_op(|store, now, excl| store.open_ctrl(req, now, grace, reclaim_valid, excl))
            .await?;
        match settled {
            Settled::Done((grant, stamp)) => {
                if req.reclaim {
                    if let Some(id) = &reclaim_id {
                        self.stable.lock().mark_reclaim(id);
                    }
                } else if let Some(id) = &stamp {
                    self.stable.lock().append_confirmed(id);
                }
                debug!(clientid = %req.clientid, stateid_seq = grant.stateid.seqid, "open granted");
                Ok(grant)
            }
            Settled::Replay(body) => match body {
                ReplyBody::Open(grant) => Ok(grant),
                ReplyBody::Status(status) => Err(status.into()),
                _ => Err(StateStatus::BadSeqid.into()),
            },
            Settled::Mirror(_) => Err(StateStatus::Delay.into()),
        }
    }

    /// Non-destructive open admissibility check, run before CREATE and
    /// other expensive filesystem work
    pub async fn open_check(
        &self,
        clientid: ClientId,
        fh: &FileHandle,
        access: OpenAccess,
        deny: OpenDeny,
    ) -> StateResult<()> {
        self.clientid_ok(clientid)?;
        self.check_grace(false)?;
        match self
            .run_op(|store, now, excl| store.open_check(clientid, fh, access, deny, now, excl))
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    /// OPEN_CONFIRM
    pub async fn open_confirm(
        &self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
    ) -> StateResult<StateId> {
        self.real_stateid(stateid)?;
        let settled = self
            .run_op(|store, now, _| store.open_confirm(stateid, seqid, tag, now))
            .await?;
        Self::settle_stateid(settled)
    }

    /// OPEN_DOWNGRADE
    pub async fn open_downgrade(
        &self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
        access: OpenAccess,
        deny: OpenDeny,
    ) -> StateResult<StateId> {
        self.real_stateid(stateid)?;
        let settled = self
            .run_op(|store, now, _| store.open_downgrade(stateid, seqid, tag, access, deny, now))
            .await?;
        Self::settle_stateid(settled)
    }

    /// CLOSE. Drops the open and every lock under it; byte ranges no other
    /// owner covers are released from the local filesystem.
    pub async fn close(
        &self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
    ) -> StateResult<StateId> {
        self.real_stateid(stateid)?;
        let mirror = self.local.is_some();
        let settled = self
            .run_op(|store, now, _| store.close_open(stateid, seqid, tag, now, mirror))
            .await?;
        match settled {
            Settled::Done((sid, stage)) => {
                if let Some(stage) = stage {
                    self.finish_mirror(stage).await;
                }
                Ok(sid)
            }
            Settled::Replay(body) => Self::replay_stateid(body),
            Settled::Mirror(_) => Err(StateStatus::Delay.into()),
        }
    }

    // ---- byte-range locks ----------------------------------------------------

    /// LOCK
    pub async fn lock(&self, req: &LockRequest) -> StateResult<LockGrant> {
        self.clientid_ok(req.clientid)?;
        match &req.owner {
            LockOwnerRef::New { open_stateid, .. } => self.real_stateid(open_stateid)?,
            LockOwnerRef::Existing { stateid } => self.real_stateid(stateid)?,
        }
        self.check_grace(req.reclaim)?;
        let mirror = self.local.is_some();
        let settled = self
            .run_op(|store, now, excl| store.lock_ctrl(req, now, excl, mirror))
            .await?;
        match settled {
            Settled::Done(stage) => stage
                .grant
                .ok_or_else(|| StateError::from(StateStatus::BadStateid)),
            Settled::Replay(body) => match body {
                ReplyBody::Stateid(sid) => Ok(LockGrant { stateid: sid }),
                ReplyBody::Denied(conflict) => Err(StateError::LockDenied(conflict)),
                ReplyBody::Status(status) => Err(status.into()),
                ReplyBody::Open(_) => Err(StateStatus::BadSeqid.into()),
            },
            Settled::Mirror(stage) => {
                let ok = self.run_mirror(&stage.fh, &stage.apply).await;
                let committed = {
                    let mut store = self.store.lock();
                    match stage.pending {
                        Some(pending) => store.lock_commit(pending, ok),
                        None => Err(StateStatus::BadStateid),
                    }
                };
                self.drop_local_gate(&stage.fh);
                committed.map_err(StateError::from)
            }
        }
    }

    /// LOCKU
    pub async fn unlock(&self, req: &UnlockRequest) -> StateResult<StateId> {
        self.real_stateid(&req.stateid)?;
        let mirror = self.local.is_some();
        let settled = self
            .run_op(|store, now, _| store.unlock_ctrl(req, now, mirror))
            .await?;
        match settled {
            Settled::Done(stage) => {
                let grant = stage
                    .grant
                    .ok_or_else(|| StateError::from(StateStatus::BadStateid))?;
                if let Some(mirror_stage) = stage.mirror {
                    self.finish_mirror(mirror_stage).await;
                }
                Ok(grant.stateid)
            }
            Settled::Replay(body) => Self::replay_stateid(body),
            Settled::Mirror(_) => Err(StateStatus::Delay.into()),
        }
    }

    /// LOCKT: non-destructive conflict check. `Ok(None)` means the range is
    /// free for this owner.
    pub async fn lock_test(
        &self,
        clientid: ClientId,
        fh: &FileHandle,
        first: u64,
        end: u64,
        kind: LockKind,
        owner: &Bytes,
    ) -> StateResult<Option<LockConflict>> {
        self.clientid_ok(clientid)?;
        self.check_grace(false)?;
        match self
            .run_op(|store, now, excl| {
                store.lock_test(clientid, fh, first, end, kind, owner, now, excl)
            })
            .await?
        {
            Settled::Done(conflict) => Ok(conflict),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    /// RELEASE_LOCKOWNER: discard lock-owners of this name once they hold
    /// no locks
    pub async fn release_lock_owner(&self, clientid: ClientId, owner: &Bytes) -> StateResult<()> {
        self.clientid_ok(clientid)?;
        match self
            .run_op(|store, now, _| store.release_lock_owner(clientid, owner, now))
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    // ---- delegations -----------------------------------------------------------

    /// DELEGRETURN
    pub async fn delegation_return(&self, stateid: &StateId, fh: &FileHandle) -> StateResult<()> {
        self.real_stateid(stateid)?;
        match self
            .run_op(|store, now, _| store.deleg_return(stateid, fh, now))
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    /// DELEGPURGE: drop every delegation parked for reclaim
    pub async fn delegation_purge(&self, clientid: ClientId) -> StateResult<()> {
        self.clientid_ok(clientid)?;
        match self
            .run_op(|store, now, _| store.deleg_purge(clientid, now))
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    /// Before REMOVE: resolve any delegation on the file
    pub async fn check_remove(&self, fh: &FileHandle) -> StateResult<()> {
        match self
            .run_op(|store, now, excl| store.check_remove_scan(fh, now, excl))
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    /// Before SETATTR: resolve any delegation on the file other than the
    /// one the requester presented
    pub async fn check_setattr(
        &self,
        fh: &FileHandle,
        presented: Option<&StateId>,
    ) -> StateResult<()> {
        if let Some(sid) = presented {
            if !sid.is_special() {
                sid.check_epoch(self.boot_epoch)?;
            }
        }
        let presented = presented.filter(|sid| !sid.is_special());
        match self
            .run_op(|store, now, excl| store.check_setattr_scan(fh, presented, now, excl))
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    /// Before GETATTR: a write delegation held by another client conflicts
    /// when the file has not changed since the grant
    pub async fn check_getattr(
        &self,
        fh: &FileHandle,
        requester: Option<ClientId>,
        current_change: u64,
    ) -> StateResult<()> {
        match self
            .run_op(|store, now, excl| {
                store.check_getattr_scan(fh, requester, current_change, now, excl)
            })
            .await?
        {
            Settled::Done(()) => Ok(()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }

    // ---- maintenance --------------------------------------------------------

    /// Periodic housekeeping tick: finish the grace period once its clock
    /// runs out, reap expired clients and discard idle unconfirmed
    /// open-owners. Marking runs under the shared gate (skipped entirely if
    /// an exclusive holder is active); teardown re-validates each target
    /// under the exclusive gate.
    pub async fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        if self.stable.lock().needs_update(now) {
            let _gate = self.gate.exclusive().await;
            let mut stable = self.stable.lock();
            if stable.needs_update(Instant::now()) {
                stable.update();
            }
        }

        let plan = {
            let Some(_gate) = self.gate.try_shared() else {
                return SweepReport::default();
            };
            self.store.lock().sweep_marks(now)
        };
        if plan.expired.is_empty() && plan.idle_owners.is_empty() {
            return SweepReport::default();
        }

        let _gate = self.gate.exclusive().await;
        for (idx, id, had_state) in &plan.expired {
            if *had_state && self.store.lock().client_holds_state(*idx) {
                self.stable.lock().append_revoked(id);
            }
        }
        let report = self.store.lock().sweep_purge(&plan, Instant::now());
        if report.expired_clients > 0 || report.idle_owners > 0 {
            info!(
                expired = report.expired_clients,
                idle_owners = report.idle_owners,
                "sweep reaped state"
            );
        }
        report
    }

    /// Force the grace period to end now (admin control)
    pub async fn end_grace(&self) {
        let _gate = self.gate.exclusive().await;
        let now = Instant::now();
        let mut stable = self.stable.lock();
        if stable.grace_active(now) || stable.needs_update(now) {
            stable.update();
        }
    }

    /// Snapshot of every client record
    pub fn dump_clients(&self) -> Vec<ClientDump> {
        let store = self.store.lock();
        let now = Instant::now();
        let mut out: Vec<ClientDump> = store
            .clients
            .values()
            .map(|c| ClientDump {
                id: c.id.clone(),
                clientid: c.clientid,
                callback: c.callback,
                confirmed: !c.needs_confirm,
                admin_revoked: c.admin_revoked,
                lease_expired: c.lease_expired(now),
                open_owners: c.open_owners.len(),
                opens: c
                    .open_owners
                    .iter()
                    .filter_map(|oid| store.owners.get(oid))
                    .map(|o| o.opens.len())
                    .sum(),
                delegations: c.delegs.len() + c.old_delegs.len(),
            })
            .collect();
        out.sort_by_key(|d| d.clientid.index);
        out
    }

    /// Snapshot of all state attached to one file
    pub fn dump_locks(&self, fh: &FileHandle) -> Vec<LockDumpEntry> {
        self.store.lock().dump_locks(fh)
    }

    // ---- internals ------------------------------------------------------------

    /// Run a store operation under the gate, resolving conflicts and
    /// retrying a bounded number of times. The store mutex is held only for
    /// the call itself; recalls and mirror work run with nothing held.
    async fn run_op<T>(
        &self,
        mut op: impl FnMut(&mut StateStore, Instant, bool) -> Outcome<T>,
    ) -> Result<Settled<T>, StateError> {
        let mut need_exclusive = false;
        for _ in 0..=self.config.conflict_retries {
            let mut shared = None;
            let mut exclusive = None;
            if need_exclusive {
                exclusive = Some(self.gate.exclusive().await);
            } else {
                shared = Some(self.gate.shared().await);
            }
            let outcome = {
                let mut store = self.store.lock();
                op(&mut store, Instant::now(), need_exclusive)
            };
            match outcome {
                Outcome::Done(value) => return Ok(Settled::Done(value)),
                Outcome::Replay(body) => return Ok(Settled::Replay(body)),
                Outcome::Fail(status) => return Err(status.into()),
                Outcome::DeniedLock(conflict) => return Err(StateError::LockDenied(conflict)),
                Outcome::Mirror(stage) => return Ok(Settled::Mirror(stage)),
                Outcome::Conflict(action) => match action {
                    ConflictAction::Retry => {}
                    ConflictAction::NeedExclusive => need_exclusive = true,
                    ConflictAction::Delay => return Err(StateStatus::Delay.into()),
                    ConflictAction::Recall(snapshot) => {
                        drop(shared.take());
                        drop(exclusive.take());
                        self.issue_recall(snapshot).await;
                        return Err(StateStatus::Delay.into());
                    }
                    ConflictAction::Revoke(plan) => {
                        // Exclusive gate held: persist the revoke record
                        // before any teardown.
                        self.revoke_with_record(&plan);
                        need_exclusive = false;
                    }
                },
            }
        }
        warn!("conflict retries exhausted; asking the client to back off");
        Err(StateStatus::Delay.into())
    }

    /// Append the stable revoke record, then tear the state down. Both
    /// happen under the exclusive gate the caller holds.
    fn revoke_with_record(&self, plan: &RevokePlan) {
        info!(purge = plan.purge_client, "revoking expired holder");
        self.stable.lock().append_revoked(&plan.id);
        self.store.lock().apply_revoke(plan);
    }

    /// Issue a delegation recall with nothing held. Stale-state and
    /// stale-handle rejections are retried a bounded number of times; a
    /// dead path marks the client so no further delegations are granted.
    async fn issue_recall(&self, snapshot: RecallSnapshot) {
        let mut attempts = 0u32;
        loop {
            let result = self
                .recall
                .recall_delegation(
                    &snapshot.callback,
                    snapshot.stateid,
                    &snapshot.fh,
                    snapshot.truncating,
                )
                .await;
            match result {
                Ok(()) => {
                    debug!(fh = %snapshot.fh, "delegation recall delivered");
                    break;
                }
                Err(CallbackError::StaleStateId) | Err(CallbackError::StaleHandle) => {
                    attempts += 1;
                    if attempts > self.config.recall_retries {
                        warn!(fh = %snapshot.fh, attempts, "recall retries exhausted");
                        break;
                    }
                }
                Err(err) => {
                    warn!(fh = %snapshot.fh, %err, "recall failed; marking callback path down");
                    self.store.lock().mark_cb_down(snapshot.client);
                    break;
                }
            }
        }
        self.store.lock().callback_done(snapshot.client);
    }

    /// Run fire-and-forget mirror work and release the file reference
    async fn finish_mirror(&self, stage: MirrorStage) {
        self.run_mirror(&stage.fh, &stage.apply).await;
        self.store.lock().mirror_done(&stage.fh);
        self.drop_local_gate(&stage.fh);
    }

    /// Apply mirror operations against the local filesystem, serialized
    /// per file. Returns `false` when a local lock attempt was refused.
    async fn run_mirror(&self, fh: &FileHandle, ops: &[MirrorOp]) -> bool {
        let Some(local) = self.local.as_ref() else {
            return true;
        };
        let gate = self
            .local_gates
            .entry(*fh)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _serial = gate.lock().await;
        for op in ops {
            match op {
                MirrorOp::Lock { first, end, kind } => {
                    if let Err(err) = local.lock(fh, *first, *end, *kind).await {
                        warn!(%fh, %err, "local lock mirror refused");
                        return false;
                    }
                }
                MirrorOp::Unlock { first, end } => local.unlock(fh, *first, *end).await,
            }
        }
        true
    }

    /// Drop a per-file mirror gate nobody is waiting on
    fn drop_local_gate(&self, fh: &FileHandle) {
        self.local_gates
            .remove_if(fh, |_, gate| Arc::strong_count(gate) == 1);
    }

    fn clientid_ok(&self, clientid: ClientId) -> Result<(), StateStatus> {
        if clientid.boot_epoch != self.boot_epoch {
            return Err(StateStatus::StaleClientId);
        }
        Ok(())
    }

    /// A stateid that must name real state: sentinels are refused and the
    /// epoch must be ours
    fn real_stateid(&self, stateid: &StateId) -> Result<(), StateStatus> {
        if stateid.is_special() {
            return Err(StateStatus::BadStateid);
        }
        stateid.check_epoch(self.boot_epoch)
    }

    fn check_grace(&self, reclaim: bool) -> Result<(), StateStatus> {
        self.stable.lock().check_grace(reclaim, Instant::now())
    }

    fn opaque_of(&self, clientid: ClientId) -> Option<Bytes> {
        let store = self.store.lock();
        let idx = store.by_clientid.get(&clientid.index)?;
        store.clients.get(idx).map(|c| c.id.clone())
    }

    /// Does the client hold delegations parked by its own reboot?
    fn has_old_delegs(&self, clientid: ClientId) -> bool {
        let store = self.store.lock();
        store
            .by_clientid
            .get(&clientid.index)
            .and_then(|idx| store.clients.get(idx))
            .map(|c| !c.old_delegs.is_empty())
            .unwrap_or(false)
    }

    fn settle_stateid(settled: Settled<StateId>) -> StateResult<StateId> {
        match settled {
            Settled::Done(sid) => Ok(sid),
            Settled::Replay(body) => Self::replay_stateid(body),
            Settled::Mirror(_) => Err(StateStatus::Delay.into()),
        }
    }

    /// Map a cached reply body back into a stateid-returning result
    fn replay_stateid(body: ReplyBody) -> StateResult<StateId> {
        match body {
            ReplyBody::Stateid(sid) => Ok(sid),
            ReplyBody::Status(status) => Err(status.into()),
            _ => Err(StateStatus::BadSeqid.into()),
        }
    }
}

impl std::fmt::Debug for StateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateEngine")
            .field("boot_epoch", &self.boot_epoch)
            .finish_non_exhaustive()
    }
}
