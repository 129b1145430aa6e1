//! Grace period and stable-storage recovery log
//!
//! The log is a small append-only file: a header carrying the previous
//! instance's lease length and the list of prior boot epochs, followed by
//! `{ id_len, id_bytes, flag }` records. Replaying it (last flag wins)
//! yields the set of clients allowed to reclaim state after a restart.
//! At the end of the grace period the file is rewritten with the new boot
//! epoch prepended and one confirmed record per client that actually
//! reclaimed, after which incremental appends resume.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::{error, info, warn};

use crate::config::StateConfig;
use crate::error::StateStatus;

const FLAG_CONFIRMED: u8 = 0;
const FLAG_REVOKED: u8 = 1;

/// Per-client recovery table entry
#[derive(Debug, Default, Clone)]
pub(crate) struct StableEntry {
    pub revoked: bool,
    pub reclaimed: bool,
}

/// The stable-storage log plus the grace-period clock derived from it
pub struct StableLog {
    path: Option<PathBuf>,
    /// Appends are attempted only while this holds; a write failure clears
    /// it and disables further recovery promises
    ok: bool,
    grace_over: bool,
    update_done: bool,
    boot_epoch: u32,
    prior_epochs: Vec<u32>,
    eograce: Instant,
    lease: Duration,
    delta: Duration,
    table: DashMap<Bytes, StableEntry>,
}

impl StableLog {
    /// Startup: choose a boot epoch distinct from every prior one, replay
    /// the log, and start the grace clock from the previous instance's
    /// lease. A missing or corrupt log means no reclaim promises can be
    /// honored, so the grace period is already over.
    pub fn setup(config: &StateConfig, now: Instant) -> Self {
        let mut epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1);
        if epoch == 0 {
            epoch = 1;
        }
        let delta = config.lease_delta;

        let Some(path) = config.stable_path.clone() else {
            return Self {
                path: None,
                ok: false,
                grace_over: true,
                update_done: true,
                boot_epoch: epoch,
                prior_epochs: Vec::new(),
                eograce: now,
                lease: config.lease_time,
                delta,
                table: DashMap::new(),
            };
        };

        let parsed = std::fs::read(&path).ok().and_then(|buf| parse_log(&buf));
        match parsed {
            Some((prev_lease, prior_epochs, table)) => {
                while prior_epochs.contains(&epoch) {
                    epoch = epoch.wrapping_add(1);
                }
                let grace = prev_lease + delta;
                info!(
                    boot_epoch = epoch,
                    clients = table.len(),
                    grace_secs = grace.as_secs(),
                    "recovery log replayed; grace period running"
                );
                Self {
                    path: Some(path),
                    ok: true,
                    grace_over: false,
                    update_done: false,
                    boot_epoch: epoch,
                    prior_epochs,
                    eograce: now + grace,
                    lease: config.lease_time,
                    delta,
                    table,
                }
            }
            None => {
                warn!(path = %path.display(), "recovery log missing or corrupt; no grace period");
                let mut log = Self {
                    path: Some(path),
                    ok: true,
                    grace_over: true,
                    update_done: true,
                    boot_epoch: epoch,
                    prior_epochs: vec![epoch],
                    eograce: now,
                    lease: config.lease_time,
                    delta,
                    table: DashMap::new(),
                };
                if let Err(err) = log.rewrite() {
                    error!(%err, "cannot initialize recovery log");
                    log.ok = false;
                }
                log
            }
        }
    }

    /// Boot epoch stamped into every clientid and stateid this instance
    /// issues
    pub fn boot_epoch(&self) -> u32 {
        self.boot_epoch
    }

    /// Is the grace period still running?
    pub fn grace_active(&self, now: Instant) -> bool {
        !self.grace_over && now < self.eograce
    }

    /// Admission check: reclaims only during grace, everything else only
    /// after. A reclaim arriving near the end of grace extends it, giving
    /// slow clients a full delta to finish.
    pub(crate) fn check_grace(&mut self, reclaim: bool, now: Instant) -> Result<(), StateStatus> {
        if !self.grace_active(now) {
            if reclaim {
                return Err(StateStatus::NoGrace);
            }
            return Ok(());
        }
        if !reclaim {
            return Err(StateStatus::Grace);
        }
        if self.eograce.saturating_duration_since(now) < self.delta {
            self.eograce = now + self.delta;
        }
        Ok(())
    }

    /// Does the log vouch for this client's reclaim?
    pub(crate) fn check_reclaim(&self, id: &Bytes) -> bool {
        self.ok
            && self
                .table
                .get(id)
                .map(|e| !e.revoked)
                .unwrap_or(false)
    }

    /// Note that a vouched-for client actually reclaimed state
    pub(crate) fn mark_reclaim(&self, id: &Bytes) {
        if let Some(mut entry) = self.table.get_mut(id) {
            entry.reclaimed = true;
        }
    }

    /// The grace clock ran out and the end-of-grace rewrite hasn't run yet
    pub(crate) fn needs_update(&self, now: Instant) -> bool {
        self.ok && !self.update_done && now >= self.eograce
    }

    /// End of grace: rewrite the log for this instance. The header gets the
    /// current lease and the new epoch list; clients that reclaimed get one
    /// confirmed record each. Incremental appends resume afterwards.
    pub(crate) fn update(&mut self) {
        self.update_done = true;
        self.grace_over = true;
        let mut epochs = Vec::with_capacity(self.prior_epochs.len() + 1);
        epochs.push(self.boot_epoch);
        epochs.extend(self.prior_epochs.iter().copied());
        self.prior_epochs = epochs;

        let reclaimed: Vec<Bytes> = self
            .table
            .iter()
            .filter(|e| e.reclaimed && !e.revoked)
            .map(|e| e.key().clone())
            .collect();
        self.table.clear();

        if let Err(err) = self.rewrite() {
            error!(%err, "end-of-grace recovery log rewrite failed");
            self.ok = false;
            return;
        }
        for id in &reclaimed {
            self.append_record(id, FLAG_CONFIRMED);
        }
        info!(reclaimed = reclaimed.len(), "grace period over; recovery log rewritten");
    }

    /// Append a confirmed record when a client is first issued state
    pub(crate) fn append_confirmed(&mut self, id: &Bytes) {
        self.append_record(id, FLAG_CONFIRMED);
    }

    /// Append a revoke record before tearing a client's state down
    pub(crate) fn append_revoked(&mut self, id: &Bytes) {
        if let Some(mut entry) = self.table.get_mut(id) {
            entry.revoked = true;
        }
        self.append_record(id, FLAG_REVOKED);
    }

    fn append_record(&mut self, id: &Bytes, flag: u8) {
        if !self.ok {
            return;
        }
        let Some(path) = &self.path else {
            return;
        };
        let result = OpenOptions::new()
            .append(true)
            .open(path)
            .and_then(|mut f| {
                f.write_all(&encode_record(id, flag))?;
                f.sync_data()
            });
        if let Err(err) = result {
            error!(%err, "recovery log append failed; disabling reclaim promises");
            self.ok = false;
        }
    }

    fn rewrite(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.lease.as_secs().to_le_bytes());
        buf.extend_from_slice(&(self.prior_epochs.len() as u32).to_le_bytes());
        for epoch in &self.prior_epochs {
            buf.extend_from_slice(&epoch.to_le_bytes());
        }
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        f.write_all(&buf)?;
        f.sync_data()
    }
}

fn encode_record(id: &Bytes, flag: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(3 + id.len());
    buf.extend_from_slice(&(id.len() as u16).to_le_bytes());
    buf.extend_from_slice(id);
    buf.push(flag);
    buf
}

/// Parse header, epochs and records; `None` on any structural damage
fn parse_log(buf: &[u8]) -> Option<(Duration, Vec<u32>, DashMap<Bytes, StableEntry>)> {
    let mut cur = io::Cursor::new(buf);
    let mut u64b = [0u8; 8];
    cur.read_exact(&mut u64b).ok()?;
    let lease_secs = u64::from_le_bytes(u64b);
    if lease_secs == 0 || lease_secs > 86_400 {
        return None;
    }
    let mut u32b = [0u8; 4];
    cur.read_exact(&mut u32b).ok()?;
    let numboots = u32::from_le_bytes(u32b);
    if numboots == 0 || numboots > 1024 {
        return None;
    }
    let mut epochs = Vec::with_capacity(numboots as usize);
    for _ in 0..numboots {
        cur.read_exact(&mut u32b).ok()?;
        epochs.push(u32::from_le_bytes(u32b));
    }
    let table: DashMap<Bytes, StableEntry> = DashMap::new();
    loop {
        let mut u16b = [0u8; 2];
        match cur.read_exact(&mut u16b) {
            Ok(()) => {}
            Err(_) => break, // clean end of file
        }
        let len = u16::from_le_bytes(u16b) as usize;
        if len == 0 {
            return None;
        }
        let mut id = vec![0u8; len];
        cur.read_exact(&mut id).ok()?;
        let mut flag = [0u8; 1];
        cur.read_exact(&mut flag).ok()?;
        if flag[0] > FLAG_REVOKED {
            return None;
        }
        // Last flag wins: a later confirmed record clears a revocation.
        table.insert(
            Bytes::from(id),
            StableEntry {
                revoked: flag[0] == FLAG_REVOKED,
                reclaimed: false,
            },
        );
    }
    Some((Duration::from_secs(lease_secs), epochs, table))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(path: &std::path::Path) -> StateConfig {
        StateConfig::new()
            .with_lease_time(Duration::from_secs(90))
            .with_stable_path(path)
    }

    #[test]
    fn test_missing_log_means_no_grace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let log = StableLog::setup(&config_with(&path), Instant::now());
        assert!(!log.grace_active(Instant::now()));
        assert!(!log.check_reclaim(&Bytes::from_static(b"c1")));
    }

    #[test]
    fn test_no_path_disables_recovery() {
        let log = StableLog::setup(&StateConfig::default(), Instant::now());
        assert!(!log.grace_active(Instant::now()));
    }

    #[test]
    fn test_restart_replays_confirmed_clients() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let now = Instant::now();

        // A fresh setup has no grace but writes a usable header; appends
        // record clients as they are issued state.
        let mut first = StableLog::setup(&config_with(&path), now);
        first.append_confirmed(&Bytes::from_static(b"alpha"));
        first.append_confirmed(&Bytes::from_static(b"beta"));
        first.append_revoked(&Bytes::from_static(b"beta"));
        let first_epoch = first.boot_epoch();
        drop(first);

        let second = StableLog::setup(&config_with(&path), now);
        assert!(second.grace_active(now));
        assert!(second.check_reclaim(&Bytes::from_static(b"alpha")));
        // Revoked after confirmation: last flag wins.
        assert!(!second.check_reclaim(&Bytes::from_static(b"beta")));
        assert!(!second.check_reclaim(&Bytes::from_static(b"gamma")));
        assert_ne!(second.boot_epoch(), first_epoch);
    }

    #[test]
    fn test_grace_admission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let now = Instant::now();
        let mut first = StableLog::setup(&config_with(&path), now);
        first.append_confirmed(&Bytes::from_static(b"alpha"));
        drop(first);

        let mut log = StableLog::setup(&config_with(&path), now);
        // Grace running: non-reclaims bounce, reclaims pass.
        assert_eq!(log.check_grace(false, now), Err(StateStatus::Grace));
        assert_eq!(log.check_grace(true, now), Ok(()));
        // After grace: reclaims bounce.
        let late = now + Duration::from_secs(3600);
        assert_eq!(log.check_grace(true, late), Err(StateStatus::NoGrace));
        assert_eq!(log.check_grace(false, late), Ok(()));
    }

    #[test]
    fn test_late_reclaim_extends_grace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let now = Instant::now();
        let mut first = StableLog::setup(&config_with(&path), now);
        first.append_confirmed(&Bytes::from_static(b"alpha"));
        drop(first);

        let mut log = StableLog::setup(&config_with(&path), now);
        let near_end = log.eograce - Duration::from_secs(1);
        assert_eq!(log.check_grace(true, near_end), Ok(()));
        assert!(log.eograce > near_end + Duration::from_secs(10));
    }

    #[test]
    fn test_update_keeps_only_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let now = Instant::now();
        let mut first = StableLog::setup(&config_with(&path), now);
        first.append_confirmed(&Bytes::from_static(b"alpha"));
        first.append_confirmed(&Bytes::from_static(b"beta"));
        drop(first);

        let mut second = StableLog::setup(&config_with(&path), now);
        second.mark_reclaim(&Bytes::from_static(b"alpha"));
        second.update();
        drop(second);

        let third = StableLog::setup(&config_with(&path), now);
        assert!(third.check_reclaim(&Bytes::from_static(b"alpha")));
        // beta never reclaimed, so the rewrite dropped it.
        assert!(!third.check_reclaim(&Bytes::from_static(b"beta")));
    }

    #[test]
    fn test_corrupt_log_disables_grace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        std::fs::write(&path, b"garbage").unwrap();
        let log = StableLog::setup(&config_with(&path), Instant::now());
        assert!(!log.grace_active(Instant::now()));
    }

    #[test]
    fn test_epoch_distinct_from_priors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state");
        let now = Instant::now();
        let mut first = StableLog::setup(&config_with(&path), now);
        first.append_confirmed(&Bytes::from_static(b"alpha"));
        let first_epoch = first.boot_epoch();
        drop(first);
        let second = StableLog::setup(&config_with(&path), now);
        assert_ne!(second.boot_epoch(), first_epoch);
    }
}
