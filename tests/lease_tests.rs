mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use audit_queue::error::Error;
use audit_queue::job::{FailureReason, JobResult, JobStatus};
use audit_queue::lease::{LeaseManager, Outcome};
use audit_queue::store::{JobPatch, MemoryStore, Records};

use common::{fast_retry, submit, PickyStore};

const TTL: Duration = Duration::from_secs(30);

fn manager() -> (Records, LeaseManager) {
    let records = Records::in_memory();
    let leases = LeaseManager::new(records.clone(), Duration::from_secs(3600));
    (records, leases)
}

#[tokio::test]
async fn test_acquire_moves_job_to_running() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;

    let claimed = leases.acquire(job.id, "worker-a", TTL).await.unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.claims, 1);
    assert!(claimed.started_at.is_some());
    let lease = claimed.lease.unwrap();
    assert_eq!(lease.owner_id, "worker-a");
    assert_eq!(lease.job_id, job.id);
    assert!(lease.expires_at > lease.acquired_at);
}

#[tokio::test]
async fn test_live_lease_blocks_other_owners() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases.acquire(job.id, "worker-a", TTL).await.unwrap();

    match leases.acquire(job.id, "worker-b", TTL).await {
        Err(Error::LeaseHeld { owner, .. }) => assert_eq!(owner, "worker-a"),
        other => panic!("expected LeaseHeld, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_acquires_have_exactly_one_winner() {
    let records = Records::new(Arc::new(MemoryStore::new()), fast_retry());
    let leases = LeaseManager::new(records.clone(), Duration::from_secs(3600));
    let job = submit(&records, "hash", Duration::from_secs(10)).await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let leases = leases.clone();
        handles.push(tokio::spawn(async move {
            leases.acquire(job.id, &format!("worker-{}", i), TTL).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(job) => winners.push(job.lease.unwrap().owner_id),
            Err(Error::LeaseHeld { .. }) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners.len(), 1);

    let stored = records.get(job.id).await.unwrap();
    assert_eq!(stored.claims, 1);
    assert_eq!(stored.lease.unwrap().owner_id, winners[0]);
}

#[tokio::test]
async fn test_expired_lease_can_be_reclaimed() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases
        .acquire(job.id, "worker-a", Duration::from_millis(30))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reclaimed = leases.acquire(job.id, "worker-b", TTL).await.unwrap();
    assert_eq!(reclaimed.lease.unwrap().owner_id, "worker-b");
    assert_eq!(reclaimed.claims, 2);

    // The first owner finds out on its next heartbeat.
    assert!(matches!(
        leases.renew(job.id, "worker-a", TTL).await,
        Err(Error::LeaseLost { .. })
    ));
}

#[tokio::test]
async fn test_renew_after_expiry_is_lease_lost() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases
        .acquire(job.id, "worker-a", Duration::from_millis(20))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(matches!(
        leases.renew(job.id, "worker-a", TTL).await,
        Err(Error::LeaseLost { .. })
    ));
}

#[tokio::test]
async fn test_renew_of_purged_job_is_lease_lost() {
    let (_, leases) = manager();
    let err = leases
        .renew(uuid::Uuid::new_v4(), "worker-a", TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseLost { .. }));
}

#[tokio::test]
async fn test_release_requires_ownership() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases.acquire(job.id, "worker-a", TTL).await.unwrap();

    assert!(matches!(
        leases.release(job.id, "worker-b").await,
        Err(Error::LeaseLost { .. })
    ));
    leases.release(job.id, "worker-a").await.unwrap();

    let released = records.get(job.id).await.unwrap();
    assert!(released.lease.is_none());
    assert_eq!(released.status, JobStatus::Running);
    // Free for anyone now.
    leases.acquire(job.id, "worker-b", TTL).await.unwrap();
}

#[tokio::test]
async fn test_progress_writes_need_the_live_lease() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases.acquire(job.id, "worker-a", TTL).await.unwrap();

    let patch = JobPatch {
        phases_completed: Some(1),
        progress_percent: Some(25),
        ..Default::default()
    };
    assert!(matches!(
        leases.record_progress(job.id, "worker-b", patch.clone()).await,
        Err(Error::LeaseLost { .. })
    ));
    let updated = leases.record_progress(job.id, "worker-a", patch).await.unwrap();
    assert_eq!(updated.progress_percent, 25);
}

#[tokio::test]
async fn test_finish_is_terminal_and_schedules_purge() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases.acquire(job.id, "worker-a", TTL).await.unwrap();

    let result = JobResult::Failed {
        reason: FailureReason::Exhausted,
        attempts: 42,
        last_phase: Some(3),
    };
    let done = leases
        .finish(
            job.id,
            "worker-a",
            Outcome::Completed(result.clone()),
            Duration::from_secs(3),
        )
        .await
        .unwrap();
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.attempts, 42);
    assert!(done.lease.is_none());

    let stored = records.get(job.id).await.unwrap();
    assert_eq!(stored.result, Some(result));
    assert!(stored.terminal_at.is_some());
    assert!(stored.purge_at.is_some());

    // Terminal jobs cannot be claimed again.
    assert!(matches!(
        leases.acquire(job.id, "worker-b", TTL).await,
        Err(Error::Conflict(_))
    ));
}

#[tokio::test]
async fn test_finish_without_lease_writes_nothing() {
    let (records, leases) = manager();
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases.acquire(job.id, "worker-a", TTL).await.unwrap();

    let err = leases
        .finish(
            job.id,
            "worker-b",
            Outcome::Cancelled { attempts: 0 },
            Duration::ZERO,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LeaseLost { .. }));
    assert_eq!(records.get(job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_finish_sets_retention_without_expire_after() {
    let store = PickyStore::new();
    store.refuse_expiry();
    let records = Records::new(Arc::new(store), fast_retry());
    let leases = LeaseManager::new(records.clone(), Duration::from_millis(30));
    let job = submit(&records, "hash", Duration::from_secs(10)).await;
    leases.acquire(job.id, "worker-a", TTL).await.unwrap();

    let done = leases
        .finish(job.id, "worker-a", Outcome::Cancelled { attempts: 3 }, Duration::ZERO)
        .await
        .unwrap();
    let terminal_at = done.terminal_at.unwrap();
    assert_eq!(
        done.purge_at,
        Some(terminal_at + chrono::Duration::milliseconds(30))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(records.purge_expired(Utc::now()).await.unwrap(), 1);
    assert!(matches!(records.get(job.id).await, Err(Error::NotFound(_))));
}
