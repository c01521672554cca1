//! Tests for a single queue: admission, delivery, closing, expiration and
//! inspection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use queuehub::model::{State, Work, WorkRecord};
use queuehub::queue::{DEFAULT_CAPACITY, QueueManager};
use queuehub::{CancellationToken, Error};
use tokio::runtime::Handle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

async fn next(queue: &QueueManager) -> Work {
    timeout(WAIT, queue.next_work(&CancellationToken::new()))
        .await
        .expect("timed out waiting for work")
        .expect("queue yielded no work")
}

// ---------------------------------------------------------------------------
// Admission and delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivers_in_admission_order() {
    let queue = QueueManager::new("emails", DEFAULT_CAPACITY);
    let a = Work::new("emails", "welcome");
    let b = Work::new("emails", "invoice");

    queue.add_work(a.clone()).unwrap();
    queue.add_work(b.clone()).unwrap();

    assert!(next(&queue).await.same(&a));
    assert!(next(&queue).await.same(&b));
}

#[tokio::test]
async fn rejects_empty_work() {
    let queue = QueueManager::new("emails", DEFAULT_CAPACITY);
    let err = queue.add_work(Work::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(queue.count_all_works(), 0);
}

#[tokio::test]
async fn admission_fills_unset_defaults_only() {
    let queue = QueueManager::new("emails", DEFAULT_CAPACITY);

    let bare = Work::from_record(WorkRecord::new("", "no key, no timestamp"));
    assert!(bare.created_at().is_none());
    queue.add_work(bare.clone()).unwrap();
    assert_eq!(bare.key(), "emails");
    assert!(bare.created_at().is_some());
    assert_eq!(bare.state(), State::Pending);

    let supplied = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    let mut record = WorkRecord::new("emails", "stamped");
    record.created_at = Some(supplied);
    let stamped = Work::from_record(record);
    queue.add_work(stamped.clone()).unwrap();
    assert_eq!(stamped.created_at(), Some(supplied));
}

#[tokio::test]
async fn overflow_is_parked_and_eventually_delivered() {
    let queue = QueueManager::new("bulk", DEFAULT_CAPACITY);

    for i in 0..150 {
        queue.add_work(Work::new("bulk", format!("item-{i}"))).unwrap();
    }
    assert_eq!(queue.count_all_works(), 150);
    assert_eq!(queue.backlog_len(), 50);

    let mut payloads = Vec::new();
    for _ in 0..150 {
        payloads.push(next(&queue).await.inbound_payload());
    }
    let expected: Vec<String> = (0..150).map(|i| format!("item-{i}")).collect();
    assert_eq!(payloads, expected);
    assert_eq!(queue.backlog_len(), 0);
}

#[tokio::test]
async fn admissions_queue_behind_parked_work() {
    let queue = QueueManager::new("tiny", 2);
    for i in 0..5 {
        queue.add_work(Work::new("tiny", format!("{i}"))).unwrap();
    }

    // Free one slot, then admit more while the backlog is still draining.
    assert_eq!(next(&queue).await.inbound_payload(), "0");
    queue.add_work(Work::new("tiny", "5")).unwrap();

    let mut rest = Vec::new();
    for _ in 0..5 {
        rest.push(next(&queue).await.inbound_payload());
    }
    assert_eq!(rest, ["1", "2", "3", "4", "5"]);
}

#[tokio::test]
async fn full_backlog_rejects_without_recording() {
    let queue = QueueManager::with_limits("tight", 1, 2, &Handle::current());

    queue.add_work(Work::new("tight", "buffered")).unwrap();
    queue.add_work(Work::new("tight", "parked-1")).unwrap();
    queue.add_work(Work::new("tight", "parked-2")).unwrap();

    let err = queue.add_work(Work::new("tight", "rejected")).unwrap_err();
    assert!(matches!(err, Error::BacklogFull { capacity: 2, .. }));
    assert_eq!(queue.count_all_works(), 3);
}

#[tokio::test]
async fn backlog_rejection_leaves_the_work_untouched() {
    let queue = QueueManager::with_limits("tight", 1, 1, &Handle::current());
    queue.add_work(Work::new("tight", "buffered")).unwrap();
    queue.add_work(Work::new("tight", "parked")).unwrap();

    let rejected = Work::from_record(WorkRecord::new("", "rejected"));
    let err = queue.add_work(rejected.clone()).unwrap_err();
    assert!(matches!(err, Error::BacklogFull { capacity: 1, .. }));

    assert_eq!(rejected.key(), "");
    assert!(rejected.created_at().is_none());
    assert_eq!(queue.list_works_by_state(State::Pending).len(), 2);
}

#[test]
fn queue_can_be_built_off_runtime_with_a_handle() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .unwrap();

    let queue = QueueManager::with_limits("outside", 1, 8, runtime.handle());
    for i in 0..3 {
        queue.add_work(Work::new("outside", i.to_string())).unwrap();
    }

    let payloads = runtime.block_on(async {
        let mut payloads = Vec::new();
        for _ in 0..3 {
            payloads.push(next(&queue).await.inbound_payload());
        }
        payloads
    });
    assert_eq!(payloads, ["0", "1", "2"]);
}

// ---------------------------------------------------------------------------
// Cancellation and closing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_token_wins_over_available_work() {
    let queue = QueueManager::new("emails", DEFAULT_CAPACITY);
    queue.add_work(Work::new("emails", "ready")).unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = queue.next_work(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    // The item was not consumed.
    assert_eq!(next(&queue).await.inbound_payload(), "ready");
}

#[tokio::test]
async fn cancellation_releases_a_waiting_consumer() {
    let queue = Arc::new(QueueManager::new("idle", DEFAULT_CAPACITY));
    let cancel = CancellationToken::new();

    let waiter = {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        tokio::spawn(async move { queue.next_work(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(!queue.is_closed());
}

#[tokio::test]
async fn closed_queue_rejects_admission() {
    let queue = QueueManager::new("emails", DEFAULT_CAPACITY);
    queue.close();

    let err = queue.add_work(Work::new("emails", "late")).unwrap_err();
    assert!(matches!(err, Error::Closed(ref key) if key == "emails"));
    assert_eq!(queue.count_all_works(), 0);
}

#[tokio::test]
async fn close_releases_waiting_consumer() {
    let queue = Arc::new(QueueManager::new("emails", DEFAULT_CAPACITY));

    let waiter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.next_work(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    queue.close();

    let result = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Closed(_))));
}

#[tokio::test]
async fn buffered_work_survives_close_then_reports_closed() {
    let queue = QueueManager::new("emails", DEFAULT_CAPACITY);
    queue.add_work(Work::new("emails", "last one")).unwrap();
    queue.close();

    assert_eq!(next(&queue).await.inbound_payload(), "last one");
    let result = timeout(WAIT, queue.next_work(&CancellationToken::new()))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Closed(_))));
}

#[tokio::test]
async fn close_drops_parked_work_from_delivery_only() {
    let queue = QueueManager::new("tiny", 1);
    queue.add_work(Work::new("tiny", "buffered")).unwrap();
    queue.add_work(Work::new("tiny", "parked")).unwrap();
    queue.close();

    assert_eq!(queue.backlog_len(), 0);
    assert_eq!(queue.count_all_works(), 2);
    assert_eq!(next(&queue).await.inbound_payload(), "buffered");
    let result = timeout(WAIT, queue.next_work(&CancellationToken::new()))
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::Closed(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_close_is_idempotent() {
    let queue = Arc::new(QueueManager::new("shared", DEFAULT_CAPACITY));

    let mut closers = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let queue = Arc::clone(&queue);
        closers.spawn(async move { queue.close() });
    }
    while let Some(joined) = closers.join_next().await {
        joined.unwrap();
    }

    assert!(queue.is_closed());
    queue.close();
    assert!(queue.is_closed());
    assert!(matches!(
        queue.add_work(Work::new("shared", "x")),
        Err(Error::Closed(_))
    ));
}

// ---------------------------------------------------------------------------
// Expiration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn zero_expiration_never_expires() {
    let queue = QueueManager::new("forever", DEFAULT_CAPACITY);
    assert_eq!(queue.expiration(), Duration::ZERO);
    assert_eq!(queue.time_to_expire(), chrono::TimeDelta::zero());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!queue.has_expired());
}

#[tokio::test]
async fn expires_after_window_and_reset_restarts_it() {
    let queue = QueueManager::new("ttl", DEFAULT_CAPACITY);
    queue.set_expiration(Duration::from_millis(100));
    assert!(!queue.has_expired());
    assert_eq!(queue.expiration(), Duration::from_millis(100));
    let left = queue.time_to_expire();
    assert!(left > chrono::TimeDelta::zero());
    assert!(left <= chrono::TimeDelta::milliseconds(100));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(queue.has_expired());
    assert!(queue.time_to_expire() < chrono::TimeDelta::zero());

    queue.reset_expiration();
    assert!(!queue.has_expired());
    assert_eq!(queue.expiration(), Duration::from_millis(100));
}

#[tokio::test]
async fn set_expiration_restarts_the_window() {
    let queue = QueueManager::new("ttl", DEFAULT_CAPACITY);
    queue.set_expiration(Duration::from_millis(30));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(queue.has_expired());

    queue.set_expiration(Duration::from_secs(60));
    assert!(!queue.has_expired());
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn counts_partition_the_audit_log() {
    let queue = QueueManager::new("jobs", DEFAULT_CAPACITY);
    let works: Vec<Work> = (0..5).map(|i| Work::new("jobs", format!("{i}"))).collect();
    for work in &works {
        queue.add_work(work.clone()).unwrap();
    }

    for _ in 0..4 {
        next(&queue).await.start();
    }
    works[1].finish();
    works[2].fail("boom");
    works[3].finish();

    assert_eq!(queue.count_all_works(), 5);
    assert_eq!(queue.count_pending_works(), 1);
    assert_eq!(queue.count_running_works(), 1);
    assert_eq!(queue.count_done_works(), 2);
    assert_eq!(queue.count_failed_works(), 1);
    assert_eq!(
        queue.count_all_works(),
        queue.count_pending_works()
            + queue.count_running_works()
            + queue.count_done_works()
            + queue.count_failed_works()
    );

    let done = queue.list_works_by_state(State::Done);
    assert_eq!(done.len(), 2);
    assert!(done[0].same(&works[1]));
    assert!(done[1].same(&works[3]));
}

#[tokio::test]
async fn info_summarizes_the_queue() {
    let queue = QueueManager::new("jobs", 10);
    queue.set_expiration(Duration::from_secs(30));
    queue.add_work(Work::new("jobs", "a")).unwrap();
    let b = Work::new("jobs", "b");
    queue.add_work(b.clone()).unwrap();
    b.start();

    let info = queue.info();
    assert_eq!(info.key, "jobs");
    assert_eq!(info.capacity, 10);
    assert_eq!(info.expiration_ms, 30_000);
    assert!(info.time_to_expire_ms > 0);
    assert!(!info.closed);
    assert_eq!((info.total, info.pending, info.running), (2, 1, 1));
    assert_eq!((info.done, info.failed, info.backlog), (0, 0, 0));

    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["key"], "jobs");
}
