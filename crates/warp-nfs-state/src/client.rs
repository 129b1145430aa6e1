//! Client table operations
//!
//! Registration follows the SETCLIENTID dance: an unconfirmed record is
//! replaced outright, a verifier change migrates the record to a fresh
//! clientid with its state held for reclaim until confirmation, a matching
//! verifier just refreshes the callback address, and a principal mismatch
//! against held state is refused.

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, info};

use crate::error::StateStatus;
use crate::store::{StateKey, StateStore};
use crate::types::{CallbackInfo, ClientId, Principal};

/// A decoded SETCLIENTID request
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    /// Client-supplied opaque identity
    pub id: Bytes,
    /// Client boot verifier; a change means the client rebooted
    pub verifier: [u8; 8],
    /// Requester credential
    pub principal: Principal,
    /// Callback service contact
    pub callback: CallbackInfo,
}

/// What register_client produced
#[derive(Debug, Clone, Copy)]
pub struct Registration {
    /// Assigned (or retained) clientid
    pub clientid: ClientId,
    /// Confirmation token to present in SETCLIENTID_CONFIRM
    pub confirm: u64,
}

/// How many clients a sweep reaped and how many idle owners it discarded
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepReport {
    /// Clients purged
    pub expired_clients: usize,
    /// Idle unconfirmed open-owners discarded
    pub idle_owners: usize,
}

/// Clients and owners the sweep marked for teardown under the shared gate;
/// the actual teardown happens under the exclusive gate
pub(crate) struct SweepPlan {
    pub expired: Vec<(u32, Bytes, bool)>,
    pub idle_owners: Vec<u64>,
}

impl StateStore {
    /// SETCLIENTID
    pub(crate) fn register_client(
        &mut self,
        reg: &ClientRegistration,
        now: Instant,
    ) -> Result<Registration, StateStatus> {
        if self.over_state_limit() {
            return Err(StateStatus::Resource);
        }
        let existing = self.by_opaque.get(&reg.id).copied();
        let Some(idx) = existing else {
            let idx = self.new_client(
                reg.id.clone(),
                reg.verifier,
                reg.principal.clone(),
                reg.callback,
                now,
            );
            let client = &self.clients[&idx];
            debug!(clientid = %client.clientid, "registered new client");
            return Ok(Registration {
                clientid: client.clientid,
                confirm: client.confirm,
            });
        };

        let (needs_confirm, expired, verifier, principal_match) = {
            let client = self.clients.get(&idx).ok_or(StateStatus::Expired)?;
            (
                client.needs_confirm || client.admin_revoked,
                client.lease_expired(now),
                client.verifier,
                client.principal == reg.principal,
            )
        };

        if needs_confirm || expired {
            // Unconfirmed, revoked or lapsed record: replace it outright.
            self.purge_client(idx);
            let idx = self.new_client(
                reg.id.clone(),
                reg.verifier,
                reg.principal.clone(),
                reg.callback,
                now,
            );
            let client = &self.clients[&idx];
            return Ok(Registration {
                clientid: client.clientid,
                confirm: client.confirm,
            });
        }

        if !principal_match {
            if self.client_has_state(idx) {
                info!(id = ?reg.id, "client id registration refused: in use by another principal");
                return Err(StateStatus::ClientIdInUse);
            }
            // No state held: let the new principal take the identity over.
            self.purge_client(idx);
            let idx = self.new_client(
                reg.id.clone(),
                reg.verifier,
                reg.principal.clone(),
                reg.callback,
                now,
            );
            let client = &self.clients[&idx];
            return Ok(Registration {
                clientid: client.clientid,
                confirm: client.confirm,
            });
        }

        if verifier != reg.verifier {
            // The client rebooted: migrate the record to a fresh clientid,
            // keeping its state pending confirmation so delegations can be
            // classified for reclaim there.
            let new_index = self.alloc_clientid_index();
            let confirm = self.alloc_confirm();
            let expiry = self.lease_expiry(now);
            let Some(client) = self.clients.get_mut(&idx) else {
                return Err(StateStatus::Expired);
            };
            self.by_clientid.remove(&client.clientid.index);
            client.clientid = ClientId::new(self.boot_epoch, new_index);
            client.confirm = confirm;
            client.verifier = reg.verifier;
            client.callback = reg.callback;
            client.needs_confirm = true;
            client.dont_clean = false;
            client.callbacks_on = false;
            client.cb_down = false;
            client.expiry = expiry;
            let clientid = client.clientid;
            self.by_clientid.insert(new_index, idx);
            info!(%clientid, "client rebooted; record migrated pending confirm");
            return Ok(Registration { clientid, confirm });
        }

        // Same verifier: callback address refresh. Still confirmed through
        // the usual round-trip, but confirmation keeps the state.
        let confirm = self.alloc_confirm();
        let expiry = self.lease_expiry(now);
        let Some(client) = self.clients.get_mut(&idx) else {
            return Err(StateStatus::Expired);
        };
        client.callback = reg.callback;
        client.confirm = confirm;
        client.needs_confirm = true;
        client.dont_clean = true;
        client.expiry = expiry;
        Ok(Registration {
            clientid: client.clientid,
            confirm,
        })
    }

    /// SETCLIENTID_CONFIRM. `grace_active` decides whether delegations held
    /// over from before the client's reboot are discarded or parked for
    /// reclaim.
    pub(crate) fn confirm_client(
        &mut self,
        clientid: ClientId,
        confirm: u64,
        principal: &Principal,
        grace_active: bool,
        now: Instant,
    ) -> Result<(), StateStatus> {
        let idx = *self
            .by_clientid
            .get(&clientid.index)
            .ok_or(StateStatus::StaleClientId)?;
        let (needs_confirm, dont_clean) = {
            let client = self
                .clients
                .get(&idx)
                .ok_or(StateStatus::StaleClientId)?;
            if client.admin_revoked {
                return Err(StateStatus::AdminRevoked);
            }
            if client.confirm != confirm {
                return Err(StateStatus::StaleClientId);
            }
            if client.principal != *principal {
                return Err(StateStatus::ClientIdInUse);
            }
            (client.needs_confirm, client.dont_clean)
        };

        if needs_confirm && !dont_clean {
            // Drop everything except delegations, which survive as
            // reclaim-only "old" state when there is no grace running.
            self.clean_client(idx);
            let (delegs, old) = match self.clients.get(&idx) {
                Some(c) => (c.delegs.clone(), c.old_delegs.clone()),
                None => return Err(StateStatus::StaleClientId),
            };
            for key in old {
                self.free_delegation(key);
            }
            if grace_active {
                for key in delegs {
                    self.free_delegation(key);
                }
            } else {
                let retention = now + self.config.lease_with_delta();
                for key in &delegs {
                    if let Some(deleg) = self.delegations.get_mut(key) {
                        deleg.old = true;
                    }
                }
                if let Some(client) = self.clients.get_mut(&idx) {
                    client.old_delegs = delegs;
                    client.delegs = Vec::new();
                    client.deleg_expiry = retention;
                }
            }
        }

        let expiry = self.lease_expiry(now);
        let Some(client) = self.clients.get_mut(&idx) else {
            return Err(StateStatus::StaleClientId);
        };
        client.needs_confirm = false;
        client.dont_clean = false;
        client.callbacks_on = client.callback.callbacks_possible();
        client.expiry = expiry;
        debug!(clientid = %client.clientid, "client confirmed");
        Ok(())
    }

    /// RENEW. Returns whether the callback path is known broken; the lease
    /// is renewed either way.
    pub(crate) fn renew_client(
        &mut self,
        clientid: ClientId,
        principal: &Principal,
        now: Instant,
    ) -> Result<bool, StateStatus> {
        let idx = *self
            .by_clientid
            .get(&clientid.index)
            .ok_or(StateStatus::Expired)?;
        let principal_ok = {
            let client = self.clients.get(&idx).ok_or(StateStatus::Expired)?;
            if client.admin_revoked {
                return Err(StateStatus::AdminRevoked);
            }
            if client.needs_confirm {
                return Err(StateStatus::Expired);
            }
            client.principal == *principal
        };
        if !principal_ok {
            // A different credential may renew only on behalf of an open it
            // created itself.
            let held = self
                .opens
                .values()
                .any(|o| o.key.client == idx && o.principal == *principal);
            if !held {
                return Err(StateStatus::Access);
            }
        }
        let expiry = self.lease_expiry(now);
        let client = self.clients.get_mut(&idx).ok_or(StateStatus::Expired)?;
        client.expiry = expiry;
        Ok(client.cb_down)
    }

    /// Locate a client record by its opaque identity (admin paths)
    pub(crate) fn find_by_opaque(&self, id: &Bytes) -> Option<u32> {
        self.by_opaque.get(id).copied()
    }

    /// Apply an administrative revocation: the record survives, stateless
    /// and flagged, so the client learns of it on its next operation. The
    /// stable revoke record was appended by the engine first.
    pub(crate) fn admin_revoke_apply(&mut self, idx: u32) {
        self.clean_client(idx);
        self.free_client_delegs(idx);
        if let Some(client) = self.clients.get_mut(&idx) {
            client.admin_revoked = true;
            client.callbacks_on = false;
        }
    }

    /// One sweep tick under the shared gate: mark clients to expire and
    /// idle unconfirmed owners to discard. Nothing is torn down here.
    pub(crate) fn sweep_marks(&mut self, now: Instant) -> SweepPlan {
        let stale = self.config.lease_time * self.config.stale_lease_factor;
        let mouldy = self.config.mouldy_lease;
        let near_cap = self.state_count * 10 > self.config.state_limit * 9;
        let over_highwater = self.clients.len() > self.config.client_highwater;
        let idle_limit = self.config.owner_idle_ticks;

        let mut expired = Vec::new();
        let mut check_owners: Vec<u32> = Vec::new();
        for (idx, client) in &self.clients {
            if client.admin_revoked || client.cb_refs > 0 {
                continue;
            }
            if !client.lease_expired(now) {
                check_owners.push(*idx);
                continue;
            }
            let has_state = !client.delegs.is_empty()
                || !client.old_delegs.is_empty()
                || !client.open_owners.is_empty();
            let very_stale = client.expiry + stale < now;
            let ancient = client.expiry + mouldy < now;
            if (very_stale && (!has_state || over_highwater))
                || ancient
                || (near_cap && has_state)
            {
                expired.push((*idx, client.id.clone(), has_state));
            }
        }

        let mut idle_owners = Vec::new();
        for idx in check_owners {
            let owner_ids = match self.clients.get(&idx) {
                Some(c) => c.open_owners.clone(),
                None => continue,
            };
            for oid in owner_ids {
                if let Some(owner) = self.owners.get_mut(&oid) {
                    if owner.opens.is_empty() {
                        owner.idle_ticks += 1;
                        if owner.idle_ticks > idle_limit {
                            idle_owners.push(oid);
                        }
                    } else {
                        owner.idle_ticks = 0;
                    }
                }
            }
        }
        SweepPlan {
            expired,
            idle_owners,
        }
    }

    /// Tear down what a sweep marked, re-validating each target under the
    /// exclusive gate. Revoke records for clients that held state were
    /// already appended by the engine.
    pub(crate) fn sweep_purge(&mut self, plan: &SweepPlan, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        for (idx, _, _) in &plan.expired {
            if let Some(client) = self.clients.get(idx) {
                if client.lease_expired(now) && client.cb_refs == 0 {
                    self.purge_client(*idx);
                    report.expired_clients += 1;
                }
            }
        }
        for oid in &plan.idle_owners {
            if let Some(owner) = self.owners.get(oid) {
                if owner.opens.is_empty() {
                    self.free_open_owner(*oid);
                    report.idle_owners += 1;
                }
            }
        }
        report
    }

    /// Does this client still hold any state worth a revoke record?
    pub(crate) fn client_holds_state(&self, idx: u32) -> bool {
        self.client_has_state(idx)
    }

    /// Resolve an open stateid's owning client for diagnostics
    pub(crate) fn client_of_key(&self, key: &StateKey) -> Option<ClientId> {
        self.clients.get(&key.client).map(|c| c.clientid)
    }
}
