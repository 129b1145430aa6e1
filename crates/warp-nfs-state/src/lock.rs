//! Byte-range lock state machine
//!
//! Each lock-owner holds an ordered, non-overlapping list of half-open
//! spans. `update_spans` is the whole merge/split algebra: a new lock is
//! folded into the list by absorbing, trimming or splitting what it
//! overlaps, and an unlock is the same walk with nothing inserted.

use bytes::Bytes;
use tracing::warn;

use crate::error::StateStatus;
use crate::open::{check_seqid, CacheTarget, ReplyBody, SeqCheck};
use crate::stateid::StateId;
use crate::store::{ConflictAction, LockOwner, Outcome, RevokePlan, StateKey, StateStore};
use crate::types::{ClientId, FileHandle, LockKind, RequestTag};

/// A half-open locked byte range `[first, end)`; `end == u64::MAX` means
/// "to end of file"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSpan {
    /// First byte covered
    pub first: u64,
    /// One past the last byte covered
    pub end: u64,
    /// Lock flavor
    pub kind: LockKind,
}

impl LockSpan {
    /// True if the ranges share at least one byte
    pub fn overlaps(&self, first: u64, end: u64) -> bool {
        self.first < end && first < self.end
    }
}

/// The holder reported back when a lock or test is denied
#[derive(Debug, Clone)]
pub struct LockConflict {
    /// Conflicting lock-owner's opaque name
    pub owner: Bytes,
    /// Client holding the conflicting lock
    pub clientid: ClientId,
    /// Start of the conflicting range
    pub first: u64,
    /// End of the conflicting range
    pub end: u64,
    /// Flavor of the conflicting lock
    pub kind: LockKind,
}

impl std::fmt::Display for LockConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "client {} range {}..{} ({:?})",
            self.clientid, self.first, self.end, self.kind
        )
    }
}

/// A granted (or re-validated) lock
#[derive(Debug, Clone)]
pub struct LockGrant {
    /// Stateid to use for I/O under this lock
    pub stateid: StateId,
}

/// Identifies which entity sequenced a lock request (a brand-new lock-owner
/// is sequenced by its open-owner; later requests by the lock-owner itself)
#[derive(Debug, Clone)]
pub enum LockOwnerRef {
    /// First lock by a new lock-owner, authorized by an open stateid
    New {
        /// Open under which the lock-owner is created
        open_stateid: StateId,
        /// New lock-owner's opaque name
        owner: Bytes,
        /// Initial sequence number for the new lock-owner
        lock_seqid: u32,
    },
    /// Subsequent request by an existing lock-owner
    Existing {
        /// The lock-owner's current stateid
        stateid: StateId,
    },
}

/// A decoded LOCK request
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Requesting client
    pub clientid: ClientId,
    /// Target file
    pub fh: FileHandle,
    /// First byte to lock
    pub first: u64,
    /// One past the last byte to lock
    pub end: u64,
    /// Lock flavor
    pub kind: LockKind,
    /// Reclaim of a lock held before a server restart
    pub reclaim: bool,
    /// Sequence number of the sequenced owner (see `owner`)
    pub seqid: u32,
    /// Transport identity for replay detection
    pub tag: RequestTag,
    /// Who is locking
    pub owner: LockOwnerRef,
}

/// A decoded LOCKU request
#[derive(Debug, Clone)]
pub struct UnlockRequest {
    /// The lock-owner's current stateid
    pub stateid: StateId,
    /// Lock-owner sequence number
    pub seqid: u32,
    /// Transport identity for replay detection
    pub tag: RequestTag,
    /// Target file
    pub fh: FileHandle,
    /// First byte to unlock
    pub first: u64,
    /// One past the last byte to unlock
    pub end: u64,
}

/// One call to make against the local-lock primitive
#[derive(Debug, Clone)]
pub(crate) enum MirrorOp {
    Lock {
        first: u64,
        end: u64,
        kind: LockKind,
    },
    Unlock {
        first: u64,
        end: u64,
    },
}

/// Local-filesystem mirroring work to run with the state mutex released.
/// `pending` is present when the operation only completes after the mirror
/// call succeeds.
pub(crate) struct MirrorStage {
    pub fh: FileHandle,
    pub apply: Vec<MirrorOp>,
    pub pending: Option<PendingLock>,
}

/// A lock parked while its mirror call is in flight. The span is already
/// on the owner's list so concurrent conflict scans see it; `prev_spans`
/// is the owner's list from before, restored if the mirror is refused.
pub(crate) struct PendingLock {
    pub fh: FileHandle,
    pub owner: StateKey,
    pub span: LockSpan,
    pub prev_spans: Vec<LockSpan>,
    pub cache: CacheTarget,
    pub seqid: u32,
    pub tag: RequestTag,
}

/// Fold `new` into an ordered, non-overlapping span list. With
/// `unlock == false` the range ends up covered by exactly one span of
/// `new.kind`; with `unlock == true` the range ends up covered by nothing.
/// Returns the net change in span count.
pub(crate) fn update_spans(spans: &mut Vec<LockSpan>, mut new: LockSpan, unlock: bool) -> i64 {
    let mut delta: i64 = 0;
    let mut i = 0;
    while i < spans.len() {
        let cur = spans[i];
        if cur.end >= new.first {
            if new.end < cur.first {
                // entirely past the new range; insert before it
                break;
            }
            if (!unlock && cur.kind == new.kind)
                || (new.first <= cur.first && new.end >= cur.end)
            {
                // absorb: same-kind overlap (or touch) merges into the new
                // span; a fully covered span of any kind is replaced
                if !unlock && cur.kind == new.kind {
                    new.first = new.first.min(cur.first);
                    new.end = new.end.max(cur.end);
                }
                spans.remove(i);
                delta -= 1;
                continue;
            }
            if new.first <= cur.first {
                // head trim
                spans[i].first = new.end;
                break;
            }
            if new.end >= cur.end {
                // tail trim
                spans[i].end = new.first;
                i += 1;
                continue;
            }
            // split: cur strictly contains new and the kinds differ
            let after = LockSpan {
                first: new.end,
                end: cur.end,
                kind: cur.kind,
            };
            spans[i].end = new.first;
            spans.insert(i + 1, after);
            delta += 1;
            if !unlock {
                spans.insert(i + 1, new);
                delta += 1;
            }
            return delta;
        }
        i += 1;
    }
    if !unlock {
        spans.insert(i, new);
        delta += 1;
    }
    delta
}

/// Staged result of a lock/unlock store operation
pub(crate) struct LockStage {
    pub grant: Option<LockGrant>,
    pub mirror: Option<MirrorStage>,
}

impl StateStore {
    fn renew_by_index(&mut self, idx: u32, now: std::time::Instant) {
        let expiry = self.lease_expiry(now);
        if let Some(client) = self.clients.get_mut(&idx) {
            client.expiry = expiry;
        }
    }

    /// Conflict scan over every lock-owner on the file except `exclude`
    fn find_lock_conflict(
        &self,
        fh: &FileHandle,
        first: u64,
        end: u64,
        kind: LockKind,
        exclude: impl Fn(&StateKey, &LockOwner) -> bool,
    ) -> Option<(StateKey, LockConflict)> {
        let file = self.files.get(fh)?;
        for key in &file.lock_owners {
            let Some(lo) = self.lock_owners.get(key) else {
                continue;
            };
            if exclude(key, lo) {
                continue;
            }
            for span in &lo.spans {
                if span.overlaps(first, end) && (span.kind.is_write() || kind.is_write()) {
                    let clientid = self
                        .clients
                        .get(&key.client)
                        .map(|c| c.clientid)
                        .unwrap_or(ClientId::new(0, 0));
                    return Some((
                        *key,
                        LockConflict {
                            owner: lo.name.clone(),
                            clientid,
                            first: span.first,
                            end: span.end,
                            kind: span.kind,
                        },
                    ));
                }
            }
        }
        None
    }

    /// Parts of `[first, end)` no longer covered by any lock-owner's spans
    /// on the file; these are safe to release locally
    pub(crate) fn uncovered_ranges(&self, fh: &FileHandle, first: u64, end: u64) -> Vec<(u64, u64)> {
        let mut covered: Vec<(u64, u64)> = Vec::new();
        if let Some(file) = self.files.get(fh) {
            for key in &file.lock_owners {
                if let Some(lo) = self.lock_owners.get(key) {
                    for span in &lo.spans {
                        if span.overlaps(first, end) {
                            covered.push((span.first.max(first), span.end.min(end)));
                        }
                    }
                }
            }
        }
        covered.sort_unstable();
        let mut gaps = Vec::new();
        let mut pos = first;
        for (s, e) in covered {
            if s > pos {
                gaps.push((pos, s));
            }
            pos = pos.max(e);
            if pos >= end {
                break;
            }
        }
        if pos < end {
            gaps.push((pos, end));
        }
        gaps
    }

    /// Acquire a byte-range lock (LOCK)
    pub(crate) fn lock_ctrl(
        &mut self,
        req: &LockRequest,
        now: std::time::Instant,
        has_exclusive: bool,
        mirror: bool,
    ) -> Outcome<LockStage> {
        if self.over_state_limit() {
            return Outcome::Fail(StateStatus::Resource);
        }
        let client_idx = match self.use_client(req.clientid, now, true) {
            Ok(idx) => idx,
            Err(status) => return Outcome::Fail(status),
        };

        // Resolve the sequenced owner and run the seqid discipline.
        let (lock_key, cache): (Option<StateKey>, CacheTarget) = match &req.owner {
            LockOwnerRef::New {
                open_stateid,
                owner,
                lock_seqid: _,
            } => {
                let open_key = StateKey::from_stateid(open_stateid);
                if open_key.client != client_idx {
                    return Outcome::Fail(StateStatus::BadStateid);
                }
                let Some(open) = self.opens.get(&open_key) else {
                    return Outcome::Fail(StateStatus::BadStateid);
                };
                if let Err(status) = Self::check_stateid_seq(open_stateid, &open.stateid) {
                    return Outcome::Fail(status);
                }
                if open.fh != req.fh {
                    // Open-owner scope spanning files; kept permissive.
                    warn!(fh = %req.fh, open_fh = %open.fh, "lock under open of a different file");
                }
                let owner_id = open.owner;
                let Some(open_owner) = self.owners.get_mut(&owner_id) else {
                    return Outcome::Fail(StateStatus::BadStateid);
                };
                if open_owner.needs_confirm {
                    return Outcome::Fail(StateStatus::BadStateid);
                }
                match check_seqid(open_owner.seqid, &open_owner.reply, req.seqid, &req.tag) {
                    SeqCheck::Fresh => open_owner.seqid = req.seqid,
                    SeqCheck::Replay(body) => return Outcome::Replay(body),
                    SeqCheck::Bad => return Outcome::Fail(StateStatus::BadSeqid),
                }
                // Reuse an existing lock-owner of the same name under this
                // open; otherwise it is created after the conflict scan.
                let existing = self
                    .opens
                    .get(&open_key)
                    .map(|o| o.lock_owners.clone())
                    .unwrap_or_default()
                    .into_iter()
                    .find(|k| {
                        self.lock_owners
                            .get(k)
                            .map(|lo| lo.name == *owner)
                            .unwrap_or(false)
                    });
                (existing, CacheTarget::OpenOwner(owner_id))
            }
            LockOwnerRef::Existing { stateid } => {
                let key = StateKey::from_stateid(stateid);
                if key.client != client_idx {
                    return Outcome::Fail(StateStatus::BadStateid);
                }
                let Some(lo) = self.lock_owners.get_mut(&key) else {
                    return Outcome::Fail(StateStatus::BadStateid);
                };
                if let Err(status) = Self::check_stateid_seq(stateid, &lo.stateid) {
                    return Outcome::Fail(status);
                }
                if lo.fh != req.fh {
                    warn!(fh = %req.fh, lock_fh = %lo.fh, "lock-owner scoped to a different file");
                }
                match check_seqid(lo.seqid, &lo.reply, req.seqid, &req.tag) {
                    SeqCheck::Fresh => lo.seqid = req.seqid,
                    SeqCheck::Replay(body) => return Outcome::Replay(body),
                    SeqCheck::Bad => return Outcome::Fail(StateStatus::BadSeqid),
                }
                (Some(key), CacheTarget::LockOwner(key))
            }
        };

        // Conflicts with other lock-owners.
        let conflict = self.find_lock_conflict(&req.fh, req.first, req.end, req.kind, |k, _| {
            Some(*k) == lock_key
        });
        if let Some((holder_key, conflict)) = conflict {
            let expired = self
                .clients
                .get(&holder_key.client)
                .map(|c| c.lease_expired(now))
                .unwrap_or(true);
            if expired {
                // The holder's lease has lapsed: revoke it rather than
                // denying a live requester.
                if !has_exclusive {
                    return Outcome::Conflict(ConflictAction::NeedExclusive);
                }
                let (id, purge) = match self.clients.get(&holder_key.client) {
                    Some(c) => (c.id.clone(), true),
                    None => return Outcome::Conflict(ConflictAction::Retry),
                };
                return Outcome::Conflict(ConflictAction::Revoke(RevokePlan {
                    client: holder_key.client,
                    id,
                    purge_client: purge,
                    deleg: None,
                }));
            }
            if req.reclaim {
                return Outcome::Fail(StateStatus::ReclaimConflict);
            }
            self.cache_reply(&cache, req.seqid, &req.tag, ReplyBody::Denied(conflict.clone()));
            return Outcome::DeniedLock(conflict);
        }

        // Conflicts with delegations held by other clients.
        let deleg_conflict = self.files.get(&req.fh).and_then(|file| {
            file.delegs.iter().copied().find(|dk| {
                dk.client != client_idx
                    && self
                        .delegations
                        .get(dk)
                        .map(|d| {
                            d.kind == crate::store::DelegationKind::Write || req.kind.is_write()
                        })
                        .unwrap_or(false)
            })
        });
        if let Some(dk) = deleg_conflict {
            return Outcome::Conflict(self.resolve_deleg_conflict(dk, has_exclusive, now, false));
        }

        // Materialize the lock-owner if this is its first lock.
        let lock_key = match lock_key {
            Some(key) => key,
            None => {
                let LockOwnerRef::New {
                    open_stateid,
                    owner,
                    lock_seqid,
                } = &req.owner
                else {
                    return Outcome::Fail(StateStatus::BadStateid);
                };
                let open_key = StateKey::from_stateid(open_stateid);
                let index = match self.clients.get_mut(&client_idx) {
                    Some(c) => c.next_state_index(),
                    None => return Outcome::Fail(StateStatus::Expired),
                };
                let key = StateKey {
                    client: client_idx,
                    index,
                };
                let lo = LockOwner {
                    key,
                    stateid: StateId::new(self.boot_epoch, client_idx, index),
                    name: owner.clone(),
                    seqid: *lock_seqid,
                    open: open_key,
                    fh: req.fh,
                    spans: Vec::new(),
                    reply: None,
                };
                self.lock_owners.insert(key, lo);
                if let Some(open) = self.opens.get_mut(&open_key) {
                    open.lock_owners.push(key);
                }
                self.get_or_create_file(req.fh).lock_owners.push(key);
                self.state_count += 1;
                key
            }
        };

        let span = LockSpan {
            first: req.first,
            end: req.end,
            kind: req.kind,
        };
        if mirror {
            // Stage the local-filesystem call. The span goes on the owner
            // now, under the state mutex, so any conflict scan that runs
            // while the mirror is in flight already sees it; `lock_commit`
            // restores `prev_spans` if the local primitive refuses.
            let (prev_spans, delta) = match self.lock_owners.get_mut(&lock_key) {
                Some(lo) => {
                    let prev = lo.spans.clone();
                    let delta = update_spans(&mut lo.spans, span, false);
                    (prev, delta)
                }
                None => return Outcome::Fail(StateStatus::BadStateid),
            };
            self.adjust_count(delta);
            let file = self.get_or_create_file(req.fh);
            update_spans(&mut file.local_spans, span, false);
            file.refs += 1;
            return Outcome::Mirror(MirrorStage {
                fh: req.fh,
                apply: vec![MirrorOp::Lock {
                    first: req.first,
                    end: req.end,
                    kind: req.kind,
                }],
                pending: Some(PendingLock {
                    fh: req.fh,
                    owner: lock_key,
                    span,
                    prev_spans,
                    cache,
                    seqid: req.seqid,
                    tag: req.tag,
                }),
            });
        }

        let grant = match self.apply_lock_span(lock_key, span) {
            Some(grant) => grant,
            None => return Outcome::Fail(StateStatus::BadStateid),
        };
        self.cache_reply(&cache, req.seqid, &req.tag, ReplyBody::Stateid(grant.stateid));
        Outcome::Done(LockStage {
            grant: Some(grant),
            mirror: None,
        })
    }

    fn apply_lock_span(&mut self, key: StateKey, span: LockSpan) -> Option<LockGrant> {
        let lo = self.lock_owners.get_mut(&key)?;
        let delta = update_spans(&mut lo.spans, span, false);
        lo.stateid.bump();
        let grant = LockGrant {
            stateid: lo.stateid,
        };
        self.adjust_count(delta);
        Some(grant)
    }

    /// Finish a lock after its mirror call returned. The staged span was
    /// applied at stage time; a refusal puts the owner's list back and
    /// drops local coverage nobody holds any more.
    pub(crate) fn lock_commit(
        &mut self,
        pending: PendingLock,
        ok: bool,
    ) -> Result<LockGrant, StateStatus> {
        if let Some(file) = self.files.get_mut(&pending.fh) {
            file.refs = file.refs.saturating_sub(1);
        }
        if !ok {
            let delta = match self.lock_owners.get_mut(&pending.owner) {
                Some(lo) => {
                    let delta = pending.prev_spans.len() as i64 - lo.spans.len() as i64;
                    lo.spans = pending.prev_spans;
                    delta
                }
                None => 0,
            };
            self.adjust_count(delta);
            self.release_uncovered(&pending.fh, pending.span.first, pending.span.end);
            self.cache_reply(
                &pending.cache,
                pending.seqid,
                &pending.tag,
                ReplyBody::Status(StateStatus::Denied),
            );
            self.maybe_release_file(&pending.fh);
            return Err(StateStatus::Denied);
        }
        match self.lock_owners.get_mut(&pending.owner) {
            Some(lo) => {
                lo.stateid.bump();
                let grant = LockGrant {
                    stateid: lo.stateid,
                };
                self.cache_reply(
                    &pending.cache,
                    pending.seqid,
                    &pending.tag,
                    ReplyBody::Stateid(grant.stateid),
                );
                Ok(grant)
            }
            None => {
                // The owner vanished while the mirror call was in flight
                // (same-client close raced us); its spans went with it.
                self.release_uncovered(&pending.fh, pending.span.first, pending.span.end);
                self.maybe_release_file(&pending.fh);
                Err(StateStatus::BadStateid)
            }
        }
    }

    /// Remove local coverage over `[first, end)` that no lock-owner's spans
    /// back any more
    fn release_uncovered(&mut self, fh: &FileHandle, first: u64, end: u64) {
        let gaps = self.uncovered_ranges(fh, first, end);
        if let Some(file) = self.files.get_mut(fh) {
            for (s, e) in gaps {
                update_spans(
                    &mut file.local_spans,
                    LockSpan {
                        first: s,
                        end: e,
                        kind: LockKind::Read,
                    },
                    true,
                );
            }
        }
    }

    /// Release a byte-range (LOCKU)
    pub(crate) fn unlock_ctrl(
        &mut self,
        req: &UnlockRequest,
        now: std::time::Instant,
        mirror: bool,
    ) -> Outcome<LockStage> {
        let key = StateKey::from_stateid(&req.stateid);
        let Some(lo) = self.lock_owners.get_mut(&key) else {
            return Outcome::Fail(StateStatus::BadStateid);
        };
        if let Err(status) = Self::check_stateid_seq(&req.stateid, &lo.stateid) {
            return Outcome::Fail(status);
        }
        match check_seqid(lo.seqid, &lo.reply, req.seqid, &req.tag) {
            SeqCheck::Fresh => lo.seqid = req.seqid,
            SeqCheck::Replay(body) => return Outcome::Replay(body),
            SeqCheck::Bad => return Outcome::Fail(StateStatus::BadSeqid),
        }
        let delta = update_spans(
            &mut lo.spans,
            LockSpan {
                first: req.first,
                end: req.end,
                kind: LockKind::Read,
            },
            true,
        );
        lo.stateid.bump();
        let stateid = lo.stateid;
        self.adjust_count(delta);
        self.renew_by_index(key.client, now);
        let cache = CacheTarget::LockOwner(key);
        self.cache_reply(&cache, req.seqid, &req.tag, ReplyBody::Stateid(stateid));

        let mirror_stage = if mirror {
            self.stage_local_unlock(&req.fh, req.first, req.end)
        } else {
            None
        };
        Outcome::Done(LockStage {
            grant: Some(LockGrant { stateid }),
            mirror: mirror_stage,
        })
    }

    /// Build the local-release work for ranges nobody covers any more
    pub(crate) fn stage_local_unlock(
        &mut self,
        fh: &FileHandle,
        first: u64,
        end: u64,
    ) -> Option<MirrorStage> {
        let gaps = self.uncovered_ranges(fh, first, end);
        if gaps.is_empty() {
            return None;
        }
        let file = self.files.get_mut(fh)?;
        for (s, e) in &gaps {
            update_spans(
                &mut file.local_spans,
                LockSpan {
                    first: *s,
                    end: *e,
                    kind: LockKind::Read,
                },
                true,
            );
        }
        file.refs += 1;
        Some(MirrorStage {
            fh: *fh,
            apply: gaps
                .into_iter()
                .map(|(first, end)| MirrorOp::Unlock { first, end })
                .collect(),
            pending: None,
        })
    }

    /// Drop the file reference held across a fire-and-forget mirror stage
    pub(crate) fn mirror_done(&mut self, fh: &FileHandle) {
        if let Some(file) = self.files.get_mut(fh) {
            file.refs = file.refs.saturating_sub(1);
        }
        self.maybe_release_file(fh);
    }

    /// Non-destructive conflict check (LOCKT)
    pub(crate) fn lock_test(
        &mut self,
        clientid: ClientId,
        fh: &FileHandle,
        first: u64,
        end: u64,
        kind: LockKind,
        owner: &Bytes,
        now: std::time::Instant,
        has_exclusive: bool,
    ) -> Outcome<Option<LockConflict>> {
        let client_idx = match self.use_client(clientid, now, true) {
            Ok(idx) => idx,
            Err(status) => return Outcome::Fail(status),
        };
        let conflict = self.find_lock_conflict(fh, first, end, kind, |k, lo| {
            k.client == client_idx && lo.name == *owner
        });
        match conflict {
            None => Outcome::Done(None),
            Some((holder_key, conflict)) => {
                let expired = self
                    .clients
                    .get(&holder_key.client)
                    .map(|c| c.lease_expired(now))
                    .unwrap_or(true);
                if expired {
                    if !has_exclusive {
                        return Outcome::Conflict(ConflictAction::NeedExclusive);
                    }
                    let (id, purge) = match self.clients.get(&holder_key.client) {
                        Some(c) => (c.id.clone(), true),
                        None => return Outcome::Conflict(ConflictAction::Retry),
                    };
                    return Outcome::Conflict(ConflictAction::Revoke(RevokePlan {
                        client: holder_key.client,
                        id,
                        purge_client: purge,
                        deleg: None,
                    }));
                }
                Outcome::Done(Some(conflict))
            }
        }
    }

    /// RELEASE_LOCKOWNER: free a lock-owner that holds no locks
    pub(crate) fn release_lock_owner(
        &mut self,
        clientid: ClientId,
        owner: &Bytes,
        now: std::time::Instant,
    ) -> Outcome<()> {
        let client_idx = match self.use_client(clientid, now, true) {
            Ok(idx) => idx,
            Err(status) => return Outcome::Fail(status),
        };
        let keys: Vec<StateKey> = self
            .lock_owners
            .iter()
            .filter(|(k, lo)| k.client == client_idx && lo.name == *owner)
            .map(|(k, _)| *k)
            .collect();
        if keys
            .iter()
            .any(|k| !self.lock_owners[k].spans.is_empty())
        {
            return Outcome::Fail(StateStatus::LocksHeld);
        }
        for key in keys {
            self.free_lock_owner(key);
        }
        Outcome::Done(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(first: u64, end: u64, kind: LockKind) -> LockSpan {
        LockSpan { first, end, kind }
    }

    fn assert_sorted_disjoint(spans: &[LockSpan]) {
        for pair in spans.windows(2) {
            assert!(pair[0].end <= pair[1].first, "overlap or disorder: {:?}", pair);
        }
    }

    #[test]
    fn test_insert_disjoint() {
        let mut spans = vec![span(0, 10, LockKind::Read)];
        let d = update_spans(&mut spans, span(20, 30, LockKind::Read), false);
        assert_eq!(d, 1);
        assert_eq!(spans.len(), 2);
        assert_sorted_disjoint(&spans);
    }

    #[test]
    fn test_merge_same_kind_touching() {
        let mut spans = vec![span(0, 10, LockKind::Read), span(20, 30, LockKind::Read)];
        let d = update_spans(&mut spans, span(10, 20, LockKind::Read), false);
        assert_eq!(d, -1);
        assert_eq!(spans, vec![span(0, 30, LockKind::Read)]);
    }

    #[test]
    fn test_split_different_kind() {
        let mut spans = vec![span(0, 100, LockKind::Read)];
        let d = update_spans(&mut spans, span(40, 60, LockKind::Write), false);
        assert_eq!(d, 2);
        assert_eq!(
            spans,
            vec![
                span(0, 40, LockKind::Read),
                span(40, 60, LockKind::Write),
                span(60, 100, LockKind::Read),
            ]
        );
        assert_sorted_disjoint(&spans);
    }

    #[test]
    fn test_head_tail_trim() {
        let mut spans = vec![span(10, 50, LockKind::Read)];
        // Write over the tail of the read span.
        update_spans(&mut spans, span(30, 70, LockKind::Write), false);
        assert_eq!(
            spans,
            vec![span(10, 30, LockKind::Read), span(30, 70, LockKind::Write)]
        );
        // Write over the head of the read span.
        let mut spans = vec![span(10, 50, LockKind::Read)];
        update_spans(&mut spans, span(0, 30, LockKind::Write), false);
        assert_eq!(
            spans,
            vec![span(0, 30, LockKind::Write), span(30, 50, LockKind::Read)]
        );
    }

    #[test]
    fn test_upgrade_covering_write() {
        let mut spans = vec![
            span(0, 10, LockKind::Read),
            span(10, 20, LockKind::Write),
            span(30, 40, LockKind::Read),
        ];
        update_spans(&mut spans, span(0, 50, LockKind::Write), false);
        assert_eq!(spans, vec![span(0, 50, LockKind::Write)]);
    }

    #[test]
    fn test_unlock_middle_splits() {
        let mut spans = vec![span(0, 100, LockKind::Write)];
        let d = update_spans(&mut spans, span(40, 60, LockKind::Read), true);
        assert_eq!(d, 1);
        assert_eq!(
            spans,
            vec![span(0, 40, LockKind::Write), span(60, 100, LockKind::Write)]
        );
    }

    #[test]
    fn test_unlock_everything() {
        let mut spans = vec![
            span(0, 10, LockKind::Read),
            span(20, 30, LockKind::Write),
            span(40, 50, LockKind::Read),
        ];
        let d = update_spans(&mut spans, span(0, u64::MAX, LockKind::Read), true);
        assert_eq!(d, -3);
        assert!(spans.is_empty());
    }

    #[test]
    fn test_unlock_partial_overlap() {
        let mut spans = vec![span(10, 30, LockKind::Write)];
        update_spans(&mut spans, span(0, 20, LockKind::Read), true);
        assert_eq!(spans, vec![span(20, 30, LockKind::Write)]);
    }

    #[test]
    fn test_overlap_predicate() {
        let s = span(10, 20, LockKind::Read);
        assert!(s.overlaps(15, 25));
        assert!(s.overlaps(0, 11));
        assert!(!s.overlaps(20, 30)); // half-open: touching is not overlap
        assert!(!s.overlaps(0, 10));
    }
}
