//! Collaborator seams: delegation recall transport and local lock mirroring

use async_trait::async_trait;
use thiserror::Error;

use crate::stateid::StateId;
use crate::types::{CallbackInfo, FileHandle, LockKind};

/// How a callback attempt failed, which decides whether it is retried
#[derive(Debug, Error)]
pub enum CallbackError {
    /// Client answered with a stale stateid; retry a bounded number of times
    #[error("callback rejected: stale stateid")]
    StaleStateId,

    /// Client answered with a stale file handle; retry a bounded number of
    /// times
    #[error("callback rejected: stale filehandle")]
    StaleHandle,

    /// Callback path is unreachable; the client is marked path-down
    #[error("callback path down")]
    PathDown,

    /// Any other transport failure; not retried
    #[error("callback transport: {0}")]
    Other(String),
}

/// Issues delegation recalls over the client's callback channel.
///
/// Implementations live in the dispatch layer (RPC client); tests supply
/// mocks. Calls are made with no engine lock held.
#[async_trait]
pub trait RecallTransport: Send + Sync {
    /// Ask the client to return the delegation identified by `stateid` on
    /// `fh`
    async fn recall_delegation(
        &self,
        callback: &CallbackInfo,
        stateid: StateId,
        fh: &FileHandle,
        truncating: bool,
    ) -> Result<(), CallbackError>;
}

/// Mirrors granted byte-range locks onto the underlying filesystem so local
/// processes and other protocol heads observe them.
///
/// The engine serializes calls per file and invokes them with no engine
/// lock held; implementations may block.
#[async_trait]
pub trait LocalLocker: Send + Sync {
    /// Apply an advisory lock over `[first, end)`; `Err` means a local
    /// holder conflicts
    async fn lock(
        &self,
        fh: &FileHandle,
        first: u64,
        end: u64,
        kind: LockKind,
    ) -> Result<(), CallbackError>;

    /// Drop any advisory lock over `[first, end)`
    async fn unlock(&self, fh: &FileHandle, first: u64, end: u64);
}
