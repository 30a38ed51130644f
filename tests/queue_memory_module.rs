use runbridge::queue::{
    EnqueueOutcome, ExecutionDispatch, ExecutionQueue, InMemoryExecutionQueue, QueueError,
};
use runbridge::shared::{CancellationToken, RunId};
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

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
fn memory_queue_hands_out_entries_in_fifo_order() {
    let queue = InMemoryExecutionQueue::new(8);
    for n in 0..3 {
        enqueue(&queue, n);
    }
    let claimed: Vec<String> = (0..3)
        .map(|_| {
            queue
                .claim_next("worker-1")
                .expect("claim")
                .expect("entry")
                .run_id
                .to_string()
        })
        .collect();
    assert_eq!(
        claimed,
        vec!["run-test-0000", "run-test-0001", "run-test-0002"]
    );
    assert!(queue.claim_next("worker-1").expect("claim").is_none());
}

#[test]
fn memory_queue_claims_are_exclusive_under_contention() {
    let queue = Arc::new(InMemoryExecutionQueue::new(64));
    for n in 0..40 {
        enqueue(queue.as_ref(), n);
    }

    let workers = 8;
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
    let mut total = 0;
    for handle in handles {
        for queue_id in handle.join().expect("worker thread") {
            total += 1;
            assert!(seen.insert(queue_id), "queue id {queue_id} claimed twice");
        }
    }
    assert_eq!(total, 40);
    assert_eq!(queue.depth().expect("depth").claimed, 40);
}

#[test]
fn memory_queue_stale_claim_is_recovered_exactly_once() {
    let queue = Arc::new(InMemoryExecutionQueue::new(4));
    let queue_id = enqueue(queue.as_ref(), 1);
    queue.claim_next("worker-crashed").expect("claim").expect("entry");

    let sweepers = 6;
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
}

#[test]
fn memory_queue_fresh_claims_survive_reclaim() {
    let queue = InMemoryExecutionQueue::new(4);
    enqueue(&queue, 1);
    queue.claim_next("worker-1").expect("claim").expect("entry");
    assert_eq!(
        queue.reclaim_stale(Duration::from_secs(300)).expect("reclaim"),
        0
    );
}

#[test]
fn memory_queue_rejects_completion_of_unclaimed_entries() {
    let queue = InMemoryExecutionQueue::new(4);
    let queue_id = enqueue(&queue, 1);
    let err = queue
        .complete(queue_id, true, None)
        .expect_err("pending entry cannot complete");
    assert!(matches!(err, QueueError::NotClaimed { .. }));

    queue.claim_next("worker-1").expect("claim").expect("entry");
    queue.complete(queue_id, true, None).expect("complete");
    assert!(queue
        .complete(queue_id, true, None)
        .expect_err("second completion")
        .is_not_claimed());
    assert!(queue.release(queue_id, None).expect_err("release").is_not_claimed());
}

#[test]
fn memory_queue_blocks_producers_until_space_frees() {
    let queue = Arc::new(InMemoryExecutionQueue::new(1));
    enqueue(queue.as_ref(), 1);

    let producer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let outcome = queue
                .enqueue(dispatch(2), &CancellationToken::new())
                .expect("blocked enqueue");
            (outcome, started.elapsed())
        })
    };

    thread::sleep(Duration::from_millis(150));
    let claimed = queue.claim_next("worker-1").expect("claim").expect("entry");
    queue
        .complete(claimed.queue_id, true, None)
        .expect("complete frees space");

    let (outcome, waited) = producer.join().expect("producer thread");
    assert!(matches!(outcome, EnqueueOutcome::Enqueued { .. }));
    assert!(waited >= Duration::from_millis(100));
    assert_eq!(queue.depth().expect("depth").pending, 1);
}

#[test]
fn memory_queue_full_enqueue_honours_cancellation() {
    let queue = Arc::new(InMemoryExecutionQueue::new(1));
    enqueue(queue.as_ref(), 1);
    let cancel = CancellationToken::new();
    let remote = cancel.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remote.cancel();
    });
    let outcome = queue.enqueue(dispatch(2), &cancel).expect("enqueue");
    canceller.join().expect("canceller");
    assert_eq!(outcome, EnqueueOutcome::Canceled);
    assert_eq!(queue.depth().expect("depth").live(), 1);
}
