//! Restart recovery: stale handles, the grace period and reclaim rights
//! carried through the stable-storage log.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use warp_nfs_state::{
    CallbackError, CallbackInfo, ClientId, ClientRegistration, FileHandle, OpenAccess, OpenDeny,
    OpenRequest, Principal, RecallTransport, RequestTag, StateConfig, StateEngine, StateId,
    StateStatus,
};

struct NullRecall;

#[async_trait]
impl RecallTransport for NullRecall {
    async fn recall_delegation(
        &self,
        _callback: &CallbackInfo,
        _stateid: StateId,
        _fh: &FileHandle,
        _truncating: bool,
    ) -> Result<(), CallbackError> {
        Ok(())
    }
}

fn engine(stable: &Path) -> StateEngine {
    let config = StateConfig::new().with_stable_path(stable);
    StateEngine::new(config, Arc::new(NullRecall), None)
}

fn fh(n: u8) -> FileHandle {
    FileHandle::new([n; 32])
}

fn tag(xid: u64) -> RequestTag {
    RequestTag {
        xid,
        req_len: 256,
        req_cksum: 0xc0de,
    }
}

async fn setup_client(engine: &StateEngine, id: &[u8]) -> ClientId {
    let reg = ClientRegistration {
        id: Bytes::copy_from_slice(id),
        verifier: *b"verify01",
        principal: Principal::new("alice"),
        callback: CallbackInfo {
            addr: "127.0.0.1:7878".parse().unwrap(),
            program: 0x4000_0001,
        },
    };
    let r = engine.register_client(&reg).await.unwrap();
    engine
        .confirm_client(r.clientid, r.confirm, &Principal::new("alice"))
        .await
        .unwrap();
    r.clientid
}

fn open_req(clientid: ClientId, owner: &[u8], seqid: u32, xid: u64, reclaim: bool) -> OpenRequest {
    OpenRequest {
        clientid,
        owner: Bytes::copy_from_slice(owner),
        seqid,
        tag: tag(xid),
        fh: fh(1),
        access: OpenAccess::BOTH,
        deny: OpenDeny::NONE,
        reclaim,
        principal: Principal::new("alice"),
        change: 1,
    }
}

#[tokio::test]
async fn test_fresh_log_has_no_grace() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine(&dir.path().join("state"));
    assert!(!first.grace_active());
    // Reclaims are refused when nothing was promised.
    let clientid = setup_client(&first, b"client-a").await;
    let err = first
        .open(&open_req(clientid, b"owner", 1, 1, true))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::NoGrace));
}

#[tokio::test]
async fn test_restart_rejects_stale_handles_and_honors_reclaim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");

    let (old_clientid, old_stateid) = {
        let first = engine(&path);
        let clientid = setup_client(&first, b"client-a").await;
        let grant = first
            .open(&open_req(clientid, b"owner", 1, 1, false))
            .await
            .unwrap();
        let sid = first.open_confirm(&grant.stateid, 2, &tag(2)).await.unwrap();
        (clientid, sid)
    };

    let second = engine(&path);
    assert!(second.grace_active());
    assert_ne!(second.boot_epoch(), old_clientid.boot_epoch);

    // Everything minted by the previous instance is stale.
    let err = second
        .renew(old_clientid, &Principal::new("alice"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::StaleClientId));
    let err = second.close(&old_stateid, 3, &tag(3)).await.unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::StaleStateId));

    // The client re-registers; non-reclaim opens must wait out the grace.
    let clientid = setup_client(&second, b"client-a").await;
    let err = second
        .open(&open_req(clientid, b"owner", 1, 10, false))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::Grace));

    // The log vouches for this client, so its reclaim is honored.
    second
        .open(&open_req(clientid, b"owner", 1, 10, true))
        .await
        .unwrap();

    // A client the log knows nothing about cannot reclaim.
    let stranger = setup_client(&second, b"client-b").await;
    let err = second
        .open(&open_req(stranger, b"owner-b", 1, 20, true))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::ReclaimBad));

    // After grace: reclaims bounce, ordinary opens flow.
    second.end_grace().await;
    assert!(!second.grace_active());
    let err = second
        .open(&open_req(clientid, b"owner2", 1, 30, true))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::NoGrace));
    second
        .open(&open_req(stranger, b"owner-b", 2, 21, false))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_end_of_grace_rewrite_keeps_reclaimers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");

    {
        let first = engine(&path);
        let a = setup_client(&first, b"client-a").await;
        let b = setup_client(&first, b"client-b").await;
        first.open(&open_req(a, b"owner", 1, 1, false)).await.unwrap();
        first.open(&open_req(b, b"owner", 1, 2, false)).await.unwrap();
    }

    {
        let second = engine(&path);
        // Only A reclaims before the grace ends.
        let a = setup_client(&second, b"client-a").await;
        second.open(&open_req(a, b"owner", 1, 1, true)).await.unwrap();
        second.end_grace().await;
    }

    let third = engine(&path);
    assert!(third.grace_active());
    let a = setup_client(&third, b"client-a").await;
    third.open(&open_req(a, b"owner", 1, 1, true)).await.unwrap();
    // B never reclaimed, so the rewrite dropped its promise.
    let b = setup_client(&third, b"client-b").await;
    let err = third
        .open(&open_req(b, b"owner", 1, 2, true))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::ReclaimBad));
}

#[tokio::test]
async fn test_admin_revoke_blocks_reclaim_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");

    {
        let first = engine(&path);
        let a = setup_client(&first, b"client-a").await;
        first.open(&open_req(a, b"owner", 1, 1, false)).await.unwrap();
        first.admin_revoke(&Bytes::from_static(b"client-a")).await.unwrap();

        // The surviving record answers with the revocation.
        let err = first.renew(a, &Principal::new("alice")).await.unwrap_err();
        assert_eq!(err.status(), Some(StateStatus::AdminRevoked));
    }

    let second = engine(&path);
    assert!(second.grace_active());
    let a = setup_client(&second, b"client-a").await;
    let err = second
        .open(&open_req(a, b"owner", 1, 1, true))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::ReclaimBad));
}

#[tokio::test]
async fn test_admin_revoke_unknown_client() {
    let dir = tempfile::tempdir().unwrap();
    let first = engine(&dir.path().join("state"));
    let err = first
        .admin_revoke(&Bytes::from_static(b"nobody"))
        .await
        .unwrap_err();
    assert_eq!(err.status(), Some(StateStatus::StaleClientId));
}
