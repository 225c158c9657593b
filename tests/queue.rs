use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::sleep;

use durq::{Error, JobStatus, Queue, Serializer};

async fn memory_queue() -> Queue {
    Queue::new("sqlite::memory:")
        .await
        .expect("failed to open in-memory queue")
}

#[tokio::test]
async fn add_inserts_pending_jobs_with_monotonic_ids() {
    let queue = memory_queue().await;

    let first = queue.add("paint", &json!({"color": "red"})).await.unwrap();
    let second = queue.add("paint", &json!({"color": "blue"})).await.unwrap();
    assert_ne!(first, second);

    let job = queue.get_job_by_id(first).await.unwrap().unwrap();
    assert_eq!(job.id, first);
    assert_eq!(job.job_type, "paint");
    assert_eq!(job.data, r#"{"color":"red"}"#);
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.created_at > 0);
    assert_eq!(job.processing_at, None);
    assert_eq!(job.done_at, None);
    assert_eq!(job.failed_at, None);
    assert_eq!(job.error, None);

    queue.close().await;
}

#[tokio::test]
async fn claim_returns_oldest_job_and_marks_it_processing() {
    let queue = memory_queue().await;

    let id = queue.add("paint", &json!({"color": "red"})).await.unwrap();

    let job = queue
        .get_and_mark_job_as_processing("paint")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.processing_at.is_some());

    let payload: Value = serde_json::from_str(&job.data).unwrap();
    assert_eq!(payload, json!({"color": "red"}));

    // The only pending job is gone now.
    assert!(queue
        .get_and_mark_job_as_processing("paint")
        .await
        .unwrap()
        .is_none());

    queue.close().await;
}

#[tokio::test]
async fn claims_follow_insertion_order_with_id_tiebreak() {
    let queue = memory_queue().await;

    // One atomic batch shares a created_at, so ordering falls back to ids.
    let ids = queue
        .add_many("t", &[json!({"n": 1}), json!({"n": 2}), json!({"n": 3})])
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    for expected in &ids {
        let job = queue
            .get_and_mark_job_as_processing("t")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.id, *expected);
    }

    queue.close().await;
}

#[tokio::test]
async fn claim_only_touches_the_requested_type() {
    let queue = memory_queue().await;

    queue.add("emails", &json!({"to": "a"})).await.unwrap();

    assert!(queue
        .get_and_mark_job_as_processing("reports")
        .await
        .unwrap()
        .is_none());
    assert_eq!(
        queue
            .count_jobs(Some("emails"), Some(JobStatus::Pending))
            .await
            .unwrap(),
        1
    );

    queue.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_dispatch_each_job_exactly_once() {
    let queue = memory_queue().await;

    let ids = queue
        .add_many("t", &(0..8).map(|n| json!({"n": n})).collect::<Vec<_>>())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.get_and_mark_job_as_processing("t").await.unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        let job = handle.await.unwrap().expect("a job for every claimer");
        assert!(claimed.insert(job.id), "job dispatched twice");
    }

    assert_eq!(claimed.len(), ids.len());
    assert_eq!(
        queue.count_jobs(Some("t"), Some(JobStatus::Pending)).await.unwrap(),
        0
    );

    queue.close().await;
}

#[tokio::test]
async fn mark_done_and_mark_failed_record_terminal_state() {
    let queue = memory_queue().await;

    let done_id = queue.add("t", &json!({})).await.unwrap();
    let failed_id = queue.add("t", &json!({})).await.unwrap();

    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();

    queue.mark_job_as_done(done_id).await.unwrap();
    queue
        .mark_job_as_failed(failed_id, "disk on fire")
        .await
        .unwrap();

    let done = queue.get_job_by_id(done_id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Done);
    assert!(done.done_at.is_some());
    assert_eq!(done.failed_at, None);
    assert_eq!(done.error, None);

    let failed = queue.get_job_by_id(failed_id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.failed_at.is_some());
    assert_eq!(failed.done_at, None);
    assert_eq!(failed.error.as_deref(), Some("disk on fire"));

    queue.close().await;
}

#[tokio::test]
async fn marking_an_unclaimed_job_is_a_recoverable_error() {
    let queue = memory_queue().await;

    let id = queue.add("t", &json!({})).await.unwrap();

    let error = queue.mark_job_as_done(id).await.unwrap_err();
    assert!(matches!(error, Error::NotProcessing(_)));

    // The row is untouched and can still be claimed.
    let job = queue.get_job_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(queue
        .get_and_mark_job_as_processing("t")
        .await
        .unwrap()
        .is_some());

    queue.close().await;
}

#[tokio::test]
async fn count_jobs_applies_optional_filters() {
    let queue = memory_queue().await;

    queue.add("a", &json!({})).await.unwrap();
    queue.add("a", &json!({})).await.unwrap();
    queue.add("b", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("b").await.unwrap().unwrap();

    assert_eq!(queue.count_jobs(None, None).await.unwrap(), 3);
    assert_eq!(queue.count_jobs(Some("a"), None).await.unwrap(), 2);
    assert_eq!(
        queue.count_jobs(None, Some(JobStatus::Pending)).await.unwrap(),
        2
    );
    assert_eq!(
        queue
            .count_jobs(Some("b"), Some(JobStatus::Processing))
            .await
            .unwrap(),
        1
    );
    assert_eq!(
        queue
            .count_jobs(Some("b"), Some(JobStatus::Pending))
            .await
            .unwrap(),
        0
    );

    queue.close().await;
}

#[tokio::test]
async fn job_types_are_distinct_and_sorted() {
    let queue = memory_queue().await;

    queue.add("emails", &json!({})).await.unwrap();
    queue.add("reports", &json!({})).await.unwrap();
    queue.add("emails", &json!({})).await.unwrap();

    assert_eq!(
        queue.get_job_types().await.unwrap(),
        vec!["emails".to_string(), "reports".to_string()]
    );

    queue.close().await;
}

#[tokio::test]
async fn custom_serializer_controls_the_stored_payload() {
    let serializer: Serializer = Arc::new(|value: &Value| {
        let entries: Vec<(&String, &Value)> = value
            .as_object()
            .map(|map| map.iter().collect())
            .unwrap_or_default();
        serde_json::to_string(&entries)
    });

    let queue = Queue::builder("sqlite::memory:")
        .serializer(serializer)
        .build()
        .await
        .unwrap();

    queue.add("x", &json!({"b": 2, "a": 1, "c": 3})).await.unwrap();

    let job = queue
        .get_and_mark_job_as_processing("x")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.data, r#"[["a",1],["b",2],["c",3]]"#);

    queue.close().await;
}

#[tokio::test]
async fn schedule_rejects_invalid_cron_expressions() {
    let queue = memory_queue().await;

    let error = queue
        .schedule("s", "invalid cron expression")
        .await
        .unwrap_err();
    assert!(matches!(error, Error::InvalidCron));
    assert_eq!(error.to_string(), "invalid cron expression provided");

    assert!(queue.get_scheduled_jobs().await.unwrap().is_empty());

    queue.close().await;
}

#[tokio::test]
async fn rescheduling_a_type_updates_the_row_in_place() {
    let queue = memory_queue().await;

    let original = queue.schedule("u", "0 * * * *").await.unwrap();
    let updated = queue.schedule("u", "*/30 * * * *").await.unwrap();
    assert_eq!(original, updated);

    let scheduled = queue.get_scheduled_jobs().await.unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].id, original);
    assert_eq!(scheduled[0].job_type, "u");
    assert_eq!(scheduled[0].cron_expression, "*/30 * * * *");

    queue.close().await;
}

#[tokio::test]
async fn scheduled_jobs_list_in_insertion_order() {
    let queue = memory_queue().await;

    let first = queue.schedule("alpha", "0 * * * *").await.unwrap();
    let second = queue.schedule("beta", "0 * * * *").await.unwrap();

    let scheduled = queue.get_scheduled_jobs().await.unwrap();
    assert_eq!(scheduled.len(), 2);
    assert_eq!(scheduled[0].id, first);
    assert_eq!(scheduled[1].id, second);

    assert!(queue.get_scheduled_job_by_id(first).await.unwrap().is_some());

    queue.close().await;
}

#[tokio::test]
async fn due_scheduled_jobs_are_claimed_one_at_a_time() {
    let queue = memory_queue().await;

    let id = queue.schedule("tick", "* * * * * *").await.unwrap();
    sleep(Duration::from_millis(1_100)).await;

    let claimed = queue
        .get_and_mark_scheduled_job_as_processing()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(
        claimed.status,
        durq::ScheduledJobStatus::Processing
    );

    // Claimed rows are invisible to further claimers.
    assert!(queue
        .get_and_mark_scheduled_job_as_processing()
        .await
        .unwrap()
        .is_none());

    let far_future = chrono::Utc::now().timestamp_millis() + 60_000;
    queue.mark_scheduled_job_as_idle(id, far_future).await.unwrap();

    let row = queue.get_scheduled_job_by_id(id).await.unwrap().unwrap();
    assert_eq!(row.status, durq::ScheduledJobStatus::Idle);
    assert_eq!(row.next_run, far_future);

    queue.close().await;
}

#[tokio::test]
async fn maintenance_materialises_due_schedules_once() {
    let queue = memory_queue().await;

    queue.schedule("tick", "* * * * * *").await.unwrap();
    sleep(Duration::from_millis(1_100)).await;

    queue.run_maintenance().await;

    // However many fire instants have passed, one tick produces one job.
    assert_eq!(
        queue
            .count_jobs(Some("tick"), Some(JobStatus::Pending))
            .await
            .unwrap(),
        1
    );

    let job = queue
        .get_and_mark_job_as_processing("tick")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.data, "{}");

    let scheduled = &queue.get_scheduled_jobs().await.unwrap()[0];
    assert_eq!(scheduled.status, durq::ScheduledJobStatus::Idle);
    assert!(scheduled.next_run > chrono::Utc::now().timestamp_millis() - 1_000);

    queue.close().await;
}

#[tokio::test]
async fn requeue_recovers_only_jobs_past_the_timeout() {
    let queue = memory_queue().await;

    let old_id = queue.add("t", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();

    sleep(Duration::from_millis(40)).await;

    let fresh_id = queue.add("t", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();

    let requeued = queue
        .requeue_timed_out_jobs(Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(requeued, 1);

    let old = queue.get_job_by_id(old_id).await.unwrap().unwrap();
    assert_eq!(old.status, JobStatus::Pending);
    assert_eq!(old.processing_at, None);

    let fresh = queue.get_job_by_id(fresh_id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Processing);

    queue.close().await;
}

#[tokio::test]
async fn remove_done_jobs_reaps_only_aged_rows_and_fires_the_hook() {
    let removed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let removed_in_hook = Arc::clone(&removed);

    let queue = Queue::builder("sqlite::memory:")
        .remove_done_jobs_older_than(Duration::from_millis(20))
        .on_done_jobs_removed(move |count| removed_in_hook.lock().unwrap().push(count))
        .build()
        .await
        .unwrap();

    let old_id = queue.add("t", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();
    queue.mark_job_as_done(old_id).await.unwrap();

    sleep(Duration::from_millis(50)).await;

    let new_id = queue.add("t", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();
    queue.mark_job_as_done(new_id).await.unwrap();

    let count = queue
        .remove_done_jobs(Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(count, 1);

    assert!(queue.get_job_by_id(old_id).await.unwrap().is_none());
    assert!(queue.get_job_by_id(new_id).await.unwrap().is_some());
    assert_eq!(removed.lock().unwrap().as_slice(), &[1]);

    queue.close().await;
}

#[tokio::test]
async fn remove_failed_jobs_reaps_only_aged_rows() {
    let queue = memory_queue().await;

    let old_id = queue.add("t", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();
    queue.mark_job_as_failed(old_id, "boom").await.unwrap();

    sleep(Duration::from_millis(50)).await;

    let new_id = queue.add("t", &json!({})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();
    queue.mark_job_as_failed(new_id, "boom").await.unwrap();

    let count = queue
        .remove_failed_jobs(Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert!(queue.get_job_by_id(old_id).await.unwrap().is_none());
    assert!(queue.get_job_by_id(new_id).await.unwrap().is_some());

    queue.close().await;
}

#[tokio::test]
async fn maintenance_loop_requeues_timed_out_jobs_automatically() {
    let requeued = Arc::new(AtomicU64::new(0));
    let requeued_in_hook = Arc::clone(&requeued);

    let queue = Queue::builder("sqlite::memory:")
        .timeout(Duration::from_millis(25))
        .maintenance_interval(Duration::from_millis(20))
        .on_processing_jobs_requeued(move |count| {
            requeued_in_hook.fetch_add(count, Ordering::SeqCst);
        })
        .build()
        .await
        .unwrap();

    let id = queue.add("t", &json!({"v": 1})).await.unwrap();
    queue.get_and_mark_job_as_processing("t").await.unwrap().unwrap();

    sleep(Duration::from_millis(120)).await;

    let job = queue.get_job_by_id(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(requeued.load(Ordering::SeqCst), 1);

    queue.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_work() {
    let queue = memory_queue().await;

    queue.close().await;
    queue.close().await;

    assert!(queue.add("t", &json!({})).await.is_err());
}
