//! Delegation grant policy, recall orchestration and pre-op conflict checks
//!
//! Conflicts never block inside the store: they come back as tagged
//! actions the engine resolves with every lock released (issue a recall,
//! revoke an expired holder under the exclusive gate) before retrying.

use std::time::Instant;

use crate::error::StateStatus;
use crate::stateid::StateId;
use crate::store::{
    ConflictAction, Delegation, DelegationKind, Outcome, RecallSnapshot, RevokePlan, StateKey,
    StateStore,
};
use crate::types::{ClientId, FileHandle, OpenAccess};

/// A delegation handed out alongside an open
#[derive(Debug, Clone)]
pub struct DelegationGrant {
    /// Stateid identifying the delegation
    pub stateid: StateId,
    /// Read or write
    pub kind: DelegationKind,
}

impl StateStore {
    /// Decide what to do about a delegation standing in the way of an
    /// operation. Mutates recall bookkeeping; the returned action is the
    /// engine's job.
    pub(crate) fn resolve_deleg_conflict(
        &mut self,
        key: StateKey,
        has_exclusive: bool,
        now: Instant,
        truncating: bool,
    ) -> ConflictAction {
        let lease = self.config.lease_time;
        let delta = self.config.lease_delta;
        let Some(deleg) = self.delegations.get_mut(&key) else {
            // Already gone; whatever tore it down cleared the conflict.
            return ConflictAction::Retry;
        };

        if deleg.old {
            // Held over from before the holder rebooted; only a reclaim can
            // revive it, and past its retention deadline it just goes away.
            let retention = self
                .clients
                .get(&key.client)
                .map(|c| c.deleg_expiry)
                .unwrap_or(now);
            if retention < now {
                self.free_delegation(key);
                return ConflictAction::Retry;
            }
            return ConflictAction::Delay;
        }

        if !deleg.recalling {
            deleg.recalling = true;
            deleg.expiry = now + lease * 2 + delta;
            deleg.limit = now + lease * 6 + delta;
            let stateid = deleg.stateid;
            let fh = deleg.fh;
            let Some(client) = self.clients.get_mut(&key.client) else {
                return ConflictAction::Retry;
            };
            client.cb_refs += 1;
            return ConflictAction::Recall(RecallSnapshot {
                client: key.client,
                callback: client.callback,
                stateid,
                fh,
                truncating,
            });
        }

        let recall_lapsed = deleg.expiry < now;
        let past_limit = deleg.limit < now;
        let (client_expiry, client_id) = match self.clients.get(&key.client) {
            Some(c) => (c.expiry, c.id.clone()),
            None => return ConflictAction::Retry,
        };
        if !past_limit && (!recall_lapsed || client_expiry >= now) {
            // Recall outstanding. A holder inside the return window waits it
            // out, and one that keeps renewing its lease is tolerated past
            // it, but only up to the hard limit.
            return ConflictAction::Delay;
        }
        if !has_exclusive {
            return ConflictAction::NeedExclusive;
        }
        ConflictAction::Revoke(RevokePlan {
            client: key.client,
            id: client_id,
            purge_client: client_expiry < now,
            deleg: Some(key),
        })
    }

    /// Grant policy for a fresh open. The caller has already established
    /// that the owner is confirmed, the grace period is over and this is
    /// not a reclaim.
    pub(crate) fn try_grant_delegation(
        &mut self,
        client_idx: u32,
        fh: &FileHandle,
        access: OpenAccess,
        change: u64,
        now: Instant,
    ) -> Option<DelegationGrant> {
        if !self.config.delegations {
            return None;
        }
        {
            let client = self.clients.get(&client_idx)?;
            if !client.callbacks_on || client.cb_down {
                return None;
            }
        }
        let file = self.files.get(fh)?;
        if file.delegs.iter().any(|k| k.client == client_idx) {
            // At most one delegation per (client, file).
            return None;
        }
        let other_open = file.opens.iter().any(|k| k.client != client_idx);
        let other_write_open = file.opens.iter().any(|k| {
            k.client != client_idx
                && self
                    .opens
                    .get(k)
                    .map(|o| o.access.contains(OpenAccess::WRITE))
                    .unwrap_or(false)
        });
        let other_deleg = file.delegs.iter().any(|k| k.client != client_idx);
        let other_write_deleg = file.delegs.iter().any(|k| {
            k.client != client_idx
                && self
                    .delegations
                    .get(k)
                    .map(|d| d.kind == DelegationKind::Write)
                    .unwrap_or(false)
        });

        let kind = if self.config.write_delegations
            && access.contains(OpenAccess::WRITE)
            && !other_open
            && !other_deleg
        {
            DelegationKind::Write
        } else if !other_write_open && !other_write_deleg {
            DelegationKind::Read
        } else {
            return None;
        };

        let index = self.clients.get_mut(&client_idx)?.next_state_index();
        let key = StateKey {
            client: client_idx,
            index,
        };
        let stateid = StateId::new(self.boot_epoch, client_idx, index);
        let expiry = now + self.config.lease_with_delta();
        let deleg = Delegation {
            key,
            stateid,
            client: client_idx,
            fh: *fh,
            kind,
            recalling: false,
            old: false,
            expiry,
            limit: expiry,
            change_marker: change,
        };
        self.delegations.insert(key, deleg);
        if let Some(file) = self.files.get_mut(fh) {
            file.delegs.push(key);
        }
        if let Some(client) = self.clients.get_mut(&client_idx) {
            client.delegs.push(key);
        }
        self.state_count += 1;
        Some(DelegationGrant { stateid, kind })
    }

    /// A reclaim open reactivates a delegation held over from before the
    /// client rebooted
    pub(crate) fn reclaim_old_delegation(
        &mut self,
        client_idx: u32,
        fh: &FileHandle,
    ) -> Option<DelegationGrant> {
        let key = {
            let client = self.clients.get(&client_idx)?;
            client
                .old_delegs
                .iter()
                .copied()
                .find(|k| self.delegations.get(k).map(|d| d.fh == *fh).unwrap_or(false))?
        };
        let deleg = self.delegations.get_mut(&key)?;
        deleg.old = false;
        deleg.stateid.bump();
        let grant = DelegationGrant {
            stateid: deleg.stateid,
            kind: deleg.kind,
        };
        if let Some(client) = self.clients.get_mut(&client_idx) {
            client.old_delegs.retain(|k| *k != key);
            client.delegs.push(key);
        }
        Some(grant)
    }

    /// DELEGRETURN
    pub(crate) fn deleg_return(
        &mut self,
        stateid: &StateId,
        fh: &FileHandle,
        now: Instant,
    ) -> Outcome<()> {
        let key = StateKey::from_stateid(stateid);
        let Some(deleg) = self.delegations.get(&key) else {
            return Outcome::Fail(StateStatus::BadStateid);
        };
        if deleg.fh != *fh {
            return Outcome::Fail(StateStatus::BadStateid);
        }
        if let Err(status) = Self::check_stateid_seq(stateid, &deleg.stateid) {
            return Outcome::Fail(status);
        }
        self.free_delegation(key);
        self.renew_client_of(key.client, now);
        Outcome::Done(())
    }

    /// DELEGPURGE: drop every delegation held over for reclaim
    pub(crate) fn deleg_purge(&mut self, clientid: ClientId, now: Instant) -> Outcome<()> {
        let client_idx = match self.use_client(clientid, now, true) {
            Ok(idx) => idx,
            Err(status) => return Outcome::Fail(status),
        };
        let old = match self.clients.get(&client_idx) {
            Some(c) => c.old_delegs.clone(),
            None => return Outcome::Fail(StateStatus::Expired),
        };
        for key in old {
            self.free_delegation(key);
        }
        Outcome::Done(())
    }

    /// Before REMOVE: every delegation on the file conflicts
    pub(crate) fn check_remove_scan(
        &mut self,
        fh: &FileHandle,
        now: Instant,
        has_exclusive: bool,
    ) -> Outcome<()> {
        let conflict = self
            .files
            .get(fh)
            .and_then(|file| file.delegs.first().copied());
        match conflict {
            Some(key) => {
                Outcome::Conflict(self.resolve_deleg_conflict(key, has_exclusive, now, false))
            }
            None => Outcome::Done(()),
        }
    }

    /// Before SETATTR: every delegation on the file conflicts except the
    /// one the requester presented
    pub(crate) fn check_setattr_scan(
        &mut self,
        fh: &FileHandle,
        presented: Option<&StateId>,
        now: Instant,
        has_exclusive: bool,
    ) -> Outcome<()> {
        let own = presented.map(StateKey::from_stateid);
        let conflict = self.files.get(fh).and_then(|file| {
            file.delegs.iter().copied().find(|k| Some(*k) != own)
        });
        match conflict {
            Some(key) => {
                Outcome::Conflict(self.resolve_deleg_conflict(key, has_exclusive, now, true))
            }
            None => Outcome::Done(()),
        }
    }

    /// Before GETATTR: a write delegation held by another client conflicts
    /// when the file has not changed since the grant, because the holder
    /// may be caching newer data than the server copy
    pub(crate) fn check_getattr_scan(
        &mut self,
        fh: &FileHandle,
        requester: Option<ClientId>,
        current_change: u64,
        now: Instant,
        has_exclusive: bool,
    ) -> Outcome<()> {
        let req_idx = requester.and_then(|cid| self.by_clientid.get(&cid.index).copied());
        let conflict = self.files.get(fh).and_then(|file| {
            file.delegs.iter().copied().find(|k| {
                Some(k.client) != req_idx
                    && self
                        .delegations
                        .get(k)
                        .map(|d| d.kind == DelegationKind::Write && !d.old)
                        .unwrap_or(false)
            })
        });
        match conflict {
            Some(key) => {
                let unchanged = self
                    .delegations
                    .get(&key)
                    .map(|d| d.change_marker == current_change)
                    .unwrap_or(false);
                if unchanged {
                    Outcome::Conflict(self.resolve_deleg_conflict(key, has_exclusive, now, false))
                } else {
                    Outcome::Done(())
                }
            }
            None => Outcome::Done(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;

    use crate::config::StateConfig;
    use crate::types::{CallbackInfo, Principal};

    fn recalled_deleg(
        now: Instant,
        return_deadline: Instant,
        hard_limit: Instant,
    ) -> (StateStore, StateKey) {
        let mut store = StateStore::new(1, StateConfig::default());
        let idx = store.new_client(
            Bytes::from_static(b"holder"),
            *b"verify01",
            Principal::new("alice"),
            CallbackInfo {
                addr: "127.0.0.1:7878".parse().unwrap(),
                program: 0x4000_0001,
            },
            now,
        );
        let fh = FileHandle::new([1; 32]);
        let key = StateKey {
            client: idx,
            index: 1,
        };
        store.delegations.insert(
            key,
            Delegation {
                key,
                stateid: StateId::new(1, idx, 1),
                client: idx,
                fh,
                kind: DelegationKind::Write,
                recalling: true,
                old: false,
                expiry: return_deadline,
                limit: hard_limit,
                change_marker: 0,
            },
        );
        (store, key)
    }

    #[test]
    fn test_renewing_holder_tolerated_past_return_deadline() {
        let start = Instant::now();
        let now = start + Duration::from_secs(600);
        // Return window closed, hard limit still ahead, lease renewed by
        // new_client above: the conflicting requester keeps backing off.
        let (mut store, key) =
            recalled_deleg(now, now - Duration::from_secs(1), now + Duration::from_secs(60));
        match store.resolve_deleg_conflict(key, true, now, false) {
            ConflictAction::Delay => {}
            _ => panic!("expected back-off inside the hard limit"),
        }
    }

    #[test]
    fn test_hard_limit_revokes_renewing_holder() {
        let start = Instant::now();
        let now = start + Duration::from_secs(600);
        let (mut store, key) =
            recalled_deleg(now, now - Duration::from_secs(2), now - Duration::from_secs(1));
        match store.resolve_deleg_conflict(key, true, now, false) {
            ConflictAction::Revoke(plan) => {
                assert_eq!(plan.deleg, Some(key));
                // The holder's lease is current, so only the delegation goes.
                assert!(!plan.purge_client);
            }
            _ => panic!("expected revocation past the hard limit"),
        }
    }
}
