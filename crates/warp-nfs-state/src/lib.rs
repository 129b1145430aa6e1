//! NFSv4 server state tracking for the WARP NFS gateway
//!
//! This crate is the stateful heart of an NFSv4 server: it tracks clients,
//! open-owners, opens, byte-range locks and delegations, enforces the
//! protocol's sequencing and lease rules, and survives server restarts
//! through an append-only stable-storage log plus a grace period for
//! state reclaim.
//!
//! The dispatch layer (XDR, RPC, filesystem access) lives elsewhere; this
//! crate is handed already-decoded requests and answers with grants,
//! protocol status codes, or a `Delay` telling the caller to make the
//! client retry while a delegation recall runs its course.
//!
//! Everything hangs off [`StateEngine`]:
//! - a single [`parking_lot::Mutex`] guards the consolidated state store,
//!   held only for short, non-blocking sections;
//! - a shared/exclusive gate serializes revocation and end-of-grace
//!   bookkeeping against ordinary request processing;
//! - blocking work (delegation recalls, local lock mirroring) happens on a
//!   snapshot taken under the mutex, with re-validation afterwards.

#![warn(missing_docs)]

pub mod callback;
pub mod config;
pub mod engine;
pub mod error;
pub mod recovery;
pub mod stateid;
pub mod types;

mod client;
mod delegation;
mod guard;
mod lock;
mod lockfile;
mod open;
mod store;

pub use callback::{CallbackError, LocalLocker, RecallTransport};
pub use client::{ClientRegistration, Registration, SweepReport};
pub use config::StateConfig;
pub use delegation::DelegationGrant;
pub use engine::{ClientDump, LockDumpEntry, StateEngine};
pub use error::{StateError, StateResult, StateStatus};
pub use lock::{LockConflict, LockGrant, LockOwnerRef, LockRequest, LockSpan, UnlockRequest};
pub use open::{OpenGrant, OpenRequest};
pub use stateid::StateId;
pub use store::DelegationKind;
pub use types::{
    CallbackInfo, ClientId, FileHandle, LockKind, OpaqueId, OpenAccess, OpenDeny, Principal,
    RequestTag,
};
