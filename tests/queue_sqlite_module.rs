use runbridge::queue::{EnqueueOutcome, ExecutionDispatch, ExecutionQueue, SqliteExecutionQueue};
use runbridge::shared::{CancellationToken, RunId};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn dispatch(n: usize) -> ExecutionDispatch {
    ExecutionDispatch::new(
        RunId::parse(&format!("run-test-{n:04}")).expect("run id"),
        "nightly-backup",
    )
}

fn enqueue(queue: &dyn ExecutionQueue, n: usize) -> i64 {
    match queue
        .enqueue(dispatch(n), &CancellationToken::new())
        .expect("enqueue")
    {
        EnqueueOutcome::Enqueued { queue_id } => queue_id,
        EnqueueOutcome::Canceled => panic!("enqueue unexpectedly canceled"),
    }
}

#[test]
fn sqlite_queue_creates_parent_directories_and_survives_reopen() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("state").join("queue.db");
    {
        let queue = SqliteExecutionQueue::open(&path, 8).expect("open queue");
        enqueue(&queue, 1);
        enqueue(&queue, 2);
        queue.claim_next("worker-1").expect("claim").expect("entry");
    }
    assert!(path.exists());

    let reopened = SqliteExecutionQueue::open(&path, 8).expect("reopen queue");
    let depth = reopened.depth().expect("depth");
    assert_eq!((depth.pending, depth.claimed), (1, 1));
    let next = reopened.claim_next("worker-2").expect("claim").expect("entry");
    assert_eq!(next.run_id.as_str(), "run-test-0002");
}

#[test]
fn sqlite_queue_keeps_finished_rows_as_history() {
    let dir = tempdir().expect("tempdir");
    let queue = SqliteExecutionQueue::open(&dir.path().join("queue.db"), 1).expect("open");
    let ok_id = enqueue(&queue, 1);
    queue.claim_next("worker-1").expect("claim").expect("entry");
    queue.complete(ok_id, true, None).expect("complete");

    let failed_id = enqueue(&queue, 2);
    queue.claim_next("worker-1").expect("claim").expect("entry");
    queue
        .complete(failed_id, false, Some("exit 1"))
        .expect("complete failure");

    assert_eq!(
        queue.entry_status(ok_id).expect("status"),
        Some(("succeeded".to_string(), None))
    );
    assert_eq!(
        queue.entry_status(failed_id).expect("status"),
        Some(("failed".to_string(), Some("exit 1".to_string())))
    );
    assert_eq!(queue.depth().expect("depth").live(), 0);
    assert!(queue
        .complete(ok_id, true, None)
        .expect_err("double completion")
        .is_not_claimed());
}

#[test]
fn sqlite_queue_claims_are_exclusive_across_threads() {
    let dir = tempdir().expect("tempdir");
    let queue = Arc::new(
        SqliteExecutionQueue::open(&dir.path().join("queue.db"), 64).expect("open"),
    );
    for n in 0..24 {
        enqueue(queue.as_ref(), n);
    }

    let workers = 6;
    let barrier = Arc::new(Barrier::new(workers));
    let handles: Vec<_> = (0..workers)
        .map(|w| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let worker_id = format!("worker-{w}");
                let mut mine = Vec::new();
                while let Some(claimed) = queue.claim_next(&worker_id).expect("claim") {
                    mine.push(claimed.queue_id);
                }
                mine
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for queue_id in handle.join().expect("worker thread") {
            assert!(seen.insert(queue_id), "queue id {queue_id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 24);
}

#[test]
fn sqlite_queue_stale_claim_is_recovered_exactly_once() {
    let dir = tempdir().expect("tempdir");
    let queue = Arc::new(
        SqliteExecutionQueue::open(&dir.path().join("queue.db"), 4).expect("open"),
    );
    let queue_id = enqueue(queue.as_ref(), 1);
    queue.claim_next("worker-crashed").expect("claim").expect("entry");
    thread::sleep(Duration::from_millis(5));

    let sweepers = 4;
    let barrier = Arc::new(Barrier::new(sweepers));
    let handles: Vec<_> = (0..sweepers)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.reclaim_stale(Duration::ZERO).expect("reclaim")
            })
        })
        .collect();
    let recovered: usize = handles
        .into_iter()
        .map(|handle| handle.join().expect("sweeper thread"))
        .sum();
    assert_eq!(recovered, 1);

    let retried = queue.claim_next("worker-2").expect("claim").expect("entry");
    assert_eq!(retried.queue_id, queue_id);
    assert_eq!(retried.attempts, 1);
    assert_eq!(
        queue.entry_status(queue_id).expect("status"),
        Some(("claimed".to_string(), Some("claim lock expired".to_string())))
    );
}

#[test]
fn sqlite_queue_full_enqueue_waits_for_space_or_cancellation() {
    let dir = tempdir().expect("tempdir");
    let queue = Arc::new(
        SqliteExecutionQueue::open(&dir.path().join("queue.db"), 1)
            .expect("open")
            .with_enqueue_poll(Duration::from_millis(10)),
    );
    enqueue(queue.as_ref(), 1);

    let cancel = CancellationToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(60));
        remote.cancel();
    });
    assert_eq!(
        queue.enqueue(dispatch(2), &cancel).expect("enqueue"),
        EnqueueOutcome::Canceled
    );
    canceller.join().expect("canceller");

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            queue
                .enqueue(dispatch(3), &CancellationToken::new())
                .expect("blocked enqueue")
        })
    };
    thread::sleep(Duration::from_millis(50));
    let claimed = queue.claim_next("worker-1").expect("claim").expect("entry");
    queue.release(claimed.queue_id, Some("retry later")).expect("release");
    let claimed = queue.claim_next("worker-1").expect("claim").expect("entry");
    assert_eq!(claimed.attempts, 1);
    queue.complete(claimed.queue_id, true, None).expect("complete");

    assert!(matches!(
        producer.join().expect("producer"),
        EnqueueOutcome::Enqueued { .. }
    ));
    let next = queue.claim_next("worker-1").expect("claim").expect("entry");
    assert_eq!(next.run_id.as_str(), "run-test-0003");
}
