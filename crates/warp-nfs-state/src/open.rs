//! Open-owners, opens, and the seqid discipline
//!
//! Every open-owner (and lock-owner) carries a sequence number and a
//! one-deep reply cache. A request at `seq + 1` is fresh; a request
//! repeating the current sequence with the same transport identity is a
//! replay answered from the cache; anything else is `BadSeqid`.

use std::time::Instant;

use bytes::Bytes;

use crate::delegation::DelegationGrant;
use crate::error::StateStatus;
use crate::lock::{LockConflict, MirrorStage};
use crate::stateid::StateId;
use crate::store::{
    ConflictAction, Open, OpenOwner, Outcome, RevokePlan, StateKey, StateStore,
};
use crate::types::{ClientId, FileHandle, OpenAccess, OpenDeny, Principal, RequestTag};

/// What a completed operation left in an owner's reply cache
#[derive(Debug, Clone)]
pub(crate) enum ReplyBody {
    Open(OpenGrant),
    Stateid(StateId),
    Denied(LockConflict),
    Status(StateStatus),
}

/// One-deep duplicate-reply cache entry
#[derive(Debug, Clone)]
pub(crate) struct CachedReply {
    pub seqid: u32,
    pub tag: RequestTag,
    pub body: ReplyBody,
}

/// Which owner's cache a staged reply belongs to
#[derive(Debug, Clone)]
pub(crate) enum CacheTarget {
    OpenOwner(u64),
    LockOwner(StateKey),
}

/// Outcome of the seqid discipline
pub(crate) enum SeqCheck {
    Fresh,
    Replay(ReplyBody),
    Bad,
}

/// Classify a sequenced request against the owner's current sequence and
/// cached reply. A repeat of the current sequence with no completed reply
/// yet is treated as fresh: it is this same operation coming back through
/// the conflict-retry loop.
pub(crate) fn check_seqid(
    cur: u32,
    reply: &Option<CachedReply>,
    seqid: u32,
    tag: &RequestTag,
) -> SeqCheck {
    if seqid == cur.wrapping_add(1) {
        return SeqCheck::Fresh;
    }
    if seqid == cur {
        return match reply {
            Some(r) if r.seqid == cur => {
                if r.tag == *tag {
                    SeqCheck::Replay(r.body.clone())
                } else {
                    SeqCheck::Bad
                }
            }
            _ => SeqCheck::Fresh,
        };
    }
    SeqCheck::Bad
}

/// A decoded OPEN request
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// Requesting client
    pub clientid: ClientId,
    /// Open-owner's opaque name
    pub owner: Bytes,
    /// Open-owner sequence number
    pub seqid: u32,
    /// Transport identity for replay detection
    pub tag: RequestTag,
    /// Target file
    pub fh: FileHandle,
    /// Requested share access
    pub access: OpenAccess,
    /// Requested share deny
    pub deny: OpenDeny,
    /// Reclaim of an open held before a server restart
    pub reclaim: bool,
    /// Requester credential, kept on the open for RENEW fallback checks
    pub principal: Principal,
    /// File change marker at open time, stamped on any delegation granted
    pub change: u64,
}

/// A granted open
#[derive(Debug, Clone)]
pub struct OpenGrant {
    /// Stateid for I/O under this open
    pub stateid: StateId,
    /// The open-owner must confirm before further requests are honored
    pub confirm_needed: bool,
    /// Delegation granted alongside the open, if any
    pub delegation: Option<DelegationGrant>,
}

impl StateStore {
    pub(crate) fn cache_reply(
        &mut self,
        target: &CacheTarget,
        seqid: u32,
        tag: &RequestTag,
        body: ReplyBody,
    ) {
        let entry = CachedReply {
            seqid,
            tag: *tag,
            body,
        };
        match target {
            CacheTarget::OpenOwner(id) => {
                if let Some(owner) = self.owners.get_mut(id) {
                    owner.reply = Some(entry);
                }
            }
            CacheTarget::LockOwner(key) => {
                if let Some(lo) = self.lock_owners.get_mut(key) {
                    lo.reply = Some(entry);
                }
            }
        }
    }

    fn find_owner(&self, client_idx: u32, name: &Bytes) -> Option<u64> {
        let client = self.clients.get(&client_idx)?;
        client
            .open_owners
            .iter()
            .copied()
            .find(|oid| self.owners.get(oid).map(|o| o.name == *name).unwrap_or(false))
    }

    /// Share-reservation conflict scan; `exclude_owner` skips opens of the
    /// requesting owner itself
    fn find_share_conflict(
        &self,
        fh: &FileHandle,
        access: OpenAccess,
        deny: OpenDeny,
        exclude_owner: Option<u64>,
    ) -> Option<StateKey> {
        let file = self.files.get(fh)?;
        file.opens
            .iter()
            .copied()
            .find(|key| match self.opens.get(key) {
                Some(other) => {
                    Some(other.owner) != exclude_owner
                        && (access.denied_by(other.deny) || other.access.denied_by(deny))
                }
                None => false,
            })
    }

    fn share_conflict_action(
        &mut self,
        holder: StateKey,
        reclaim: bool,
        now: Instant,
        has_exclusive: bool,
        cache: Option<(CacheTarget, u32, RequestTag)>,
    ) -> Outcome<(OpenGrant, Option<Bytes>)> {
        let expired = self
            .clients
            .get(&holder.client)
            .map(|c| c.lease_expired(now))
            .unwrap_or(true);
        if expired {
            if !has_exclusive {
                return Outcome::Conflict(ConflictAction::NeedExclusive);
            }
            let (id, purge) = match self.clients.get(&holder.client) {
                Some(c) => (c.id.clone(), true),
                None => return Outcome::Conflict(ConflictAction::Retry),
            };
            return Outcome::Conflict(ConflictAction::Revoke(RevokePlan {
                client: holder.client,
                id,
                purge_client: purge,
                deleg: None,
            }));
        }
        if reclaim {
            return Outcome::Fail(StateStatus::ReclaimConflict);
        }
        if let Some((target, seqid, tag)) = cache {
            self.cache_reply(&target, seqid, &tag, ReplyBody::Status(StateStatus::ShareDenied));
        }
        Outcome::Fail(StateStatus::ShareDenied)
    }

    /// Grant an open (OPEN). `reclaim_valid` says the recovery log vouches
    /// for this client's reclaim; `grace_active` gates delegation grants.
    /// Returns the grant plus, when this is the first state issued to the
    /// client this boot, the opaque id to persist.
    pub(crate) fn open_ctrl(
        &mut self,
        req: &OpenRequest,
        now: Instant,
        grace_active: bool,
        reclaim_valid: bool,
        has_exclusive: bool,
    ) -> Outcome<(OpenGrant, Option<Bytes>)> {
        if self.over_state_limit() {
            return Outcome::Fail(StateStatus::Resource);
        }
        if req.reclaim && !reclaim_valid {
            return Outcome::Fail(StateStatus::ReclaimBad);
        }
        let client_idx = match self.use_client(req.clientid, now, true) {
            Ok(idx) => idx,
            Err(status) => return Outcome::Fail(status),
        };

        let owner_id = self.find_owner(client_idx, &req.owner);
        if let Some(oid) = owner_id {
            let owner = match self.owners.get_mut(&oid) {
                Some(o) => o,
                None => return Outcome::Fail(StateStatus::BadStateid),
            };
            match check_seqid(owner.seqid, &owner.reply, req.seqid, &req.tag) {
                SeqCheck::Fresh => owner.seqid = req.seqid,
                SeqCheck::Replay(body) => return Outcome::Replay(body),
                SeqCheck::Bad => return Outcome::Fail(StateStatus::BadSeqid),
            }
        }

        // Share reservations across all other owners on the file.
        if let Some(holder) = self.find_share_conflict(&req.fh, req.access, req.deny, owner_id) {
            let cache = owner_id.map(|oid| (CacheTarget::OpenOwner(oid), req.seqid, req.tag));
            return self.share_conflict_action(holder, req.reclaim, now, has_exclusive, cache);
        }

        // Delegations held by other clients.
        let deleg_conflict = self.files.get(&req.fh).and_then(|file| {
            file.delegs.iter().copied().find(|dk| {
                dk.client != client_idx
                    && self
                        .delegations
                        .get(dk)
                        .map(|d| {
                            d.kind == crate::store::DelegationKind::Write
                                || req.access.contains(OpenAccess::WRITE)
                        })
                        .unwrap_or(false)
            })
        });
        if let Some(dk) = deleg_conflict {
            return Outcome::Conflict(self.resolve_deleg_conflict(dk, has_exclusive, now, false));
        }

        // All checks passed: materialize owner and open.
        let owner_id = match owner_id {
            Some(oid) => oid,
            None => {
                let oid = self.alloc_owner_id();
                let owner = OpenOwner {
                    id: oid,
                    client: client_idx,
                    name: req.owner.clone(),
                    seqid: req.seqid,
                    needs_confirm: !req.reclaim,
                    reply: None,
                    opens: Vec::new(),
                    idle_ticks: 0,
                };
                self.owners.insert(oid, owner);
                if let Some(client) = self.clients.get_mut(&client_idx) {
                    client.open_owners.push(oid);
                }
                self.state_count += 1;
                oid
            }
        };
        let confirm_needed = self
            .owners
            .get(&owner_id)
            .map(|o| o.needs_confirm)
            .unwrap_or(false);

        // A re-open by the same owner upgrades the existing open in place.
        let existing = self
            .owners
            .get(&owner_id)
            .and_then(|o| {
                o.opens.iter().copied().find(|k| {
                    self.opens.get(k).map(|op| op.fh == req.fh).unwrap_or(false)
                })
            });
        let stateid = match existing {
            Some(key) => match self.opens.get_mut(&key) {
                Some(open) => {
                    open.access = open.access.union(req.access);
                    open.deny = open.deny.union(req.deny);
                    open.stateid.bump();
                    open.stateid
                }
                None => return Outcome::Fail(StateStatus::BadStateid),
            },
            None => {
                let index = match self.clients.get_mut(&client_idx) {
                    Some(c) => c.next_state_index(),
                    None => return Outcome::Fail(StateStatus::Expired),
                };
                let key = StateKey {
                    client: client_idx,
                    index,
                };
                let stateid = StateId::new(self.boot_epoch, client_idx, index);
                let open = Open {
                    key,
                    stateid,
                    owner: owner_id,
                    fh: req.fh,
                    access: req.access,
                    deny: req.deny,
                    principal: req.principal.clone(),
                    lock_owners: Vec::new(),
                };
                self.opens.insert(key, open);
                self.get_or_create_file(req.fh).opens.push(key);
                if let Some(owner) = self.owners.get_mut(&owner_id) {
                    owner.opens.push(key);
                    owner.idle_ticks = 0;
                }
                self.state_count += 1;
                stateid
            }
        };

        // Delegations: reclaim reactivates a held-over one; a fresh open
        // may earn a new grant once the owner is confirmed.
        let delegation = if req.reclaim {
            self.reclaim_old_delegation(client_idx, &req.fh)
        } else if !grace_active && !confirm_needed {
            self.try_grant_delegation(client_idx, &req.fh, req.access, req.change, now)
        } else {
            None
        };

        let stamp = match self.clients.get_mut(&client_idx) {
            Some(client) if !client.stamped => {
                client.stamped = true;
                Some(client.id.clone())
            }
            _ => None,
        };

        let grant = OpenGrant {
            stateid,
            confirm_needed,
            delegation,
        };
        self.cache_reply(
            &CacheTarget::OpenOwner(owner_id),
            req.seqid,
            &req.tag,
            ReplyBody::Open(grant.clone()),
        );
        Outcome::Done((grant, stamp))
    }

    /// Non-destructive open admissibility check (used before CREATE and
    /// expensive filesystem work)
    pub(crate) fn open_check(
        &mut self,
        clientid: ClientId,
        fh: &FileHandle,
        access: OpenAccess,
        deny: OpenDeny,
        now: Instant,
        has_exclusive: bool,
    ) -> Outcome<()> {
        let client_idx = match self.use_client(clientid, now, true) {
            Ok(idx) => idx,
            Err(status) => return Outcome::Fail(status),
        };
        if let Some(holder) = self.find_share_conflict(fh, access, deny, None) {
            return match self.share_conflict_action(holder, false, now, has_exclusive, None) {
                Outcome::Conflict(action) => Outcome::Conflict(action),
                Outcome::Fail(status) => Outcome::Fail(status),
                _ => Outcome::Fail(StateStatus::ShareDenied),
            };
        }
        let deleg_conflict = self.files.get(fh).and_then(|file| {
            file.delegs.iter().copied().find(|dk| {
                dk.client != client_idx
                    && self
                        .delegations
                        .get(dk)
                        .map(|d| {
                            d.kind == crate::store::DelegationKind::Write
                                || access.contains(OpenAccess::WRITE)
                        })
                        .unwrap_or(false)
            })
        });
        if let Some(dk) = deleg_conflict {
            return Outcome::Conflict(self.resolve_deleg_conflict(dk, has_exclusive, now, false));
        }
        Outcome::Done(())
    }

    fn sequenced_open(
        &mut self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
        require_confirmed: bool,
    ) -> Result<StateKey, Outcome<StateId>> {
        let key = StateKey::from_stateid(stateid);
        let Some(open) = self.opens.get(&key) else {
            return Err(Outcome::Fail(StateStatus::BadStateid));
        };
        if let Err(status) = Self::check_stateid_seq(stateid, &open.stateid) {
            return Err(Outcome::Fail(status));
        }
        let owner_id = open.owner;
        let Some(owner) = self.owners.get_mut(&owner_id) else {
            return Err(Outcome::Fail(StateStatus::BadStateid));
        };
        if require_confirmed && owner.needs_confirm {
            return Err(Outcome::Fail(StateStatus::BadStateid));
        }
        match check_seqid(owner.seqid, &owner.reply, seqid, tag) {
            SeqCheck::Fresh => {
                owner.seqid = seqid;
                Ok(key)
            }
            SeqCheck::Replay(body) => Err(Outcome::Replay(body)),
            SeqCheck::Bad => Err(Outcome::Fail(StateStatus::BadSeqid)),
        }
    }

    /// OPEN_CONFIRM
    pub(crate) fn open_confirm(
        &mut self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
        now: Instant,
    ) -> Outcome<StateId> {
        let needs = StateKey::from_stateid(stateid);
        let confirm_pending = self
            .opens
            .get(&needs)
            .and_then(|o| self.owners.get(&o.owner))
            .map(|o| o.needs_confirm)
            .unwrap_or(false);
        if !confirm_pending {
            // Either no such open, or a confirm for an already confirmed
            // owner; distinguish below through the normal path.
            if self.opens.get(&needs).is_some() {
                return Outcome::Fail(StateStatus::BadSeqid);
            }
            return Outcome::Fail(StateStatus::BadStateid);
        }
        let key = match self.sequenced_open(stateid, seqid, tag, false) {
            Ok(key) => key,
            Err(outcome) => return outcome,
        };
        let Some(open) = self.opens.get_mut(&key) else {
            return Outcome::Fail(StateStatus::BadStateid);
        };
        open.stateid.bump();
        let stateid = open.stateid;
        let owner_id = open.owner;
        if let Some(owner) = self.owners.get_mut(&owner_id) {
            owner.needs_confirm = false;
        }
        self.renew_client_of(key.client, now);
        self.cache_reply(
            &CacheTarget::OpenOwner(owner_id),
            seqid,
            tag,
            ReplyBody::Stateid(stateid),
        );
        Outcome::Done(stateid)
    }

    /// OPEN_DOWNGRADE: shrink the share bits to a subset of what is held
    pub(crate) fn open_downgrade(
        &mut self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
        access: OpenAccess,
        deny: OpenDeny,
        now: Instant,
    ) -> Outcome<StateId> {
        let key = match self.sequenced_open(stateid, seqid, tag, true) {
            Ok(key) => key,
            Err(outcome) => return outcome,
        };
        let Some(open) = self.opens.get_mut(&key) else {
            return Outcome::Fail(StateStatus::BadStateid);
        };
        if !access.is_subset_of(open.access) || !deny.is_subset_of(open.deny) {
            return Outcome::Fail(StateStatus::OpenMode);
        }
        open.access = access;
        open.deny = deny;
        open.stateid.bump();
        let stateid = open.stateid;
        let owner_id = open.owner;
        self.renew_client_of(key.client, now);
        self.cache_reply(
            &CacheTarget::OpenOwner(owner_id),
            seqid,
            tag,
            ReplyBody::Stateid(stateid),
        );
        Outcome::Done(stateid)
    }

    /// CLOSE: drop the open and every lock under it. Locally mirrored
    /// ranges nobody covers any more are staged for release.
    pub(crate) fn close_open(
        &mut self,
        stateid: &StateId,
        seqid: u32,
        tag: &RequestTag,
        now: Instant,
        mirror: bool,
    ) -> Outcome<(StateId, Option<MirrorStage>)> {
        let key = match self.sequenced_open(stateid, seqid, tag, true) {
            Ok(key) => key,
            Err(outcome) => return match outcome {
                Outcome::Replay(body) => Outcome::Replay(body),
                Outcome::Fail(status) => Outcome::Fail(status),
                _ => Outcome::Fail(StateStatus::BadStateid),
            },
        };
        let Some(open) = self.opens.get_mut(&key) else {
            return Outcome::Fail(StateStatus::BadStateid);
        };
        open.stateid.bump();
        let reply_stateid = open.stateid;
        let owner_id = open.owner;
        let fh = open.fh;
        let locked_ranges: Vec<(u64, u64)> = open
            .lock_owners
            .clone()
            .iter()
            .filter_map(|k| self.lock_owners.get(k))
            .flat_map(|lo| lo.spans.iter().map(|s| (s.first, s.end)))
            .collect();

        self.cache_reply(
            &CacheTarget::OpenOwner(owner_id),
            seqid,
            tag,
            ReplyBody::Stateid(reply_stateid),
        );
        self.free_open(key);
        self.renew_client_of(key.client, now);

        let stage = if mirror {
            let mut ops = Vec::new();
            for (first, end) in locked_ranges {
                if let Some(stage) = self.stage_local_unlock(&fh, first, end) {
                    // stage_local_unlock took a file reference per call;
                    // fold the ops together and keep a single reference.
                    self.mirror_done(&fh);
                    ops.extend(stage.apply);
                }
            }
            if ops.is_empty() {
                None
            } else {
                if let Some(file) = self.files.get_mut(&fh) {
                    file.refs += 1;
                }
                Some(MirrorStage {
                    fh,
                    apply: ops,
                    pending: None,
                })
            }
        } else {
            None
        };
        Outcome::Done((reply_stateid, stage))
    }

    pub(crate) fn renew_client_of(&mut self, idx: u32, now: Instant) {
        let expiry = self.lease_expiry(now);
        if let Some(client) = self.clients.get_mut(&idx) {
            client.expiry = expiry;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(xid: u64) -> RequestTag {
        RequestTag {
            xid,
            req_len: 100,
            req_cksum: 0xbeef,
        }
    }

    #[test]
    fn test_seqid_fresh() {
        match check_seqid(5, &None, 6, &tag(1)) {
            SeqCheck::Fresh => {}
            _ => panic!("expected fresh"),
        }
    }

    #[test]
    fn test_seqid_replay() {
        let cached = Some(CachedReply {
            seqid: 5,
            tag: tag(1),
            body: ReplyBody::Status(StateStatus::Ok),
        });
        match check_seqid(5, &cached, 5, &tag(1)) {
            SeqCheck::Replay(_) => {}
            _ => panic!("expected replay"),
        }
    }

    #[test]
    fn test_seqid_same_seq_different_request() {
        let cached = Some(CachedReply {
            seqid: 5,
            tag: tag(1),
            body: ReplyBody::Status(StateStatus::Ok),
        });
        match check_seqid(5, &cached, 5, &tag(2)) {
            SeqCheck::Bad => {}
            _ => panic!("expected bad seqid"),
        }
    }

    #[test]
    fn test_seqid_gap_is_bad() {
        match check_seqid(5, &None, 8, &tag(1)) {
            SeqCheck::Bad => {}
            _ => panic!("expected bad seqid"),
        }
    }

    #[test]
    fn test_seqid_wraps() {
        match check_seqid(u32::MAX, &None, 0, &tag(1)) {
            SeqCheck::Fresh => {}
            _ => panic!("expected fresh across wrap"),
        }
    }
}
