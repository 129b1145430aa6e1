//! Error types for state-engine operations

use std::fmt;

use thiserror::Error;

use crate::lock::LockConflict;

/// Errors surfaced by the state engine
#[derive(Debug, Error)]
pub enum StateError {
    /// Operation failed with an NFSv4 protocol status
    #[error("protocol status: {0}")]
    Status(StateStatus),

    /// Byte-range lock denied; carries the conflicting holder so the
    /// dispatch layer can fill in the DENIED response
    #[error("lock denied by {0}")]
    LockDenied(LockConflict),

    /// Stable-storage I/O failure
    #[error("stable storage: {0}")]
    Stable(#[from] std::io::Error),
}

impl From<StateStatus> for StateError {
    fn from(status: StateStatus) -> Self {
        StateError::Status(status)
    }
}

impl StateError {
    /// The protocol status this error maps onto, if any
    pub fn status(&self) -> Option<StateStatus> {
        match self {
            StateError::Status(s) => Some(*s),
            StateError::LockDenied(_) => Some(StateStatus::Denied),
            StateError::Stable(_) => None,
        }
    }
}

/// Result type for state-engine operations
pub type StateResult<T> = Result<T, StateError>;

/// NFSv4 protocol status codes the state engine can produce (RFC 7530)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StateStatus {
    /// NFS4_OK
    Ok = 0,
    /// NFS4ERR_ACCESS
    Access = 13,
    /// NFS4ERR_DELAY - retry after a delegation recall completes
    Delay = 10008,
    /// NFS4ERR_DENIED - conflicting byte-range lock
    Denied = 10010,
    /// NFS4ERR_EXPIRED - client lease has expired
    Expired = 10011,
    /// NFS4ERR_GRACE - non-reclaim operation during the grace period
    Grace = 10013,
    /// NFS4ERR_SHARE_DENIED - conflicting share reservation
    ShareDenied = 10015,
    /// NFS4ERR_CLID_INUSE - client id registered by a different principal
    ClientIdInUse = 10017,
    /// NFS4ERR_RESOURCE - global state cap reached
    Resource = 10018,
    /// NFS4ERR_STALE_CLIENTID - clientid from a previous server instance
    StaleClientId = 10022,
    /// NFS4ERR_STALE_STATEID - stateid from a previous server instance
    StaleStateId = 10023,
    /// NFS4ERR_OLD_STATEID - stateid sequence exactly one behind
    OldStateid = 10024,
    /// NFS4ERR_BAD_STATEID
    BadStateid = 10025,
    /// NFS4ERR_BAD_SEQID - owner sequence out of order and not a replay
    BadSeqid = 10026,
    /// NFS4ERR_NO_GRACE - reclaim after the grace period ended
    NoGrace = 10033,
    /// NFS4ERR_RECLAIM_BAD - reclaim not vouched for by the recovery log
    ReclaimBad = 10034,
    /// NFS4ERR_RECLAIM_CONFLICT - reclaim conflicts with existing state
    ReclaimConflict = 10035,
    /// NFS4ERR_LOCKS_HELD - lock-owner still holds locks
    LocksHeld = 10037,
    /// NFS4ERR_OPENMODE - I/O outside the open's access mode
    OpenMode = 10038,
    /// NFS4ERR_ADMIN_REVOKED - state revoked by administrative action
    AdminRevoked = 10047,
    /// NFS4ERR_CB_PATH_DOWN - callback path unverified or broken
    CallbackPathDown = 10048,
}

impl StateStatus {
    /// Numeric protocol code
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl fmt::Display for StateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateStatus::Ok => "NFS4_OK",
            StateStatus::Access => "NFS4ERR_ACCESS",
            StateStatus::Delay => "NFS4ERR_DELAY",
            StateStatus::Denied => "NFS4ERR_DENIED",
            StateStatus::Expired => "NFS4ERR_EXPIRED",
            StateStatus::Grace => "NFS4ERR_GRACE",
            StateStatus::ShareDenied => "NFS4ERR_SHARE_DENIED",
            StateStatus::ClientIdInUse => "NFS4ERR_CLID_INUSE",
            StateStatus::Resource => "NFS4ERR_RESOURCE",
            StateStatus::StaleClientId => "NFS4ERR_STALE_CLIENTID",
            StateStatus::StaleStateId => "NFS4ERR_STALE_STATEID",
            StateStatus::OldStateid => "NFS4ERR_OLD_STATEID",
            StateStatus::BadStateid => "NFS4ERR_BAD_STATEID",
            StateStatus::BadSeqid => "NFS4ERR_BAD_SEQID",
            StateStatus::NoGrace => "NFS4ERR_NO_GRACE",
            StateStatus::ReclaimBad => "NFS4ERR_RECLAIM_BAD",
            StateStatus::ReclaimConflict => "NFS4ERR_RECLAIM_CONFLICT",
            StateStatus::LocksHeld => "NFS4ERR_LOCKS_HELD",
            StateStatus::OpenMode => "NFS4ERR_OPENMODE",
            StateStatus::AdminRevoked => "NFS4ERR_ADMIN_REVOKED",
            StateStatus::CallbackPathDown => "NFS4ERR_CB_PATH_DOWN",
        };
        write!(f, "{} ({})", name, self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StateStatus::Ok.code(), 0);
        assert_eq!(StateStatus::Delay.code(), 10008);
        assert_eq!(StateStatus::BadSeqid.code(), 10026);
        assert_eq!(StateStatus::NoGrace.code(), 10033);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            StateStatus::StaleClientId.to_string(),
            "NFS4ERR_STALE_CLIENTID (10022)"
        );
    }

    #[test]
    fn test_error_status_mapping() {
        let err = StateError::from(StateStatus::Grace);
        assert_eq!(err.status(), Some(StateStatus::Grace));
    }
}
