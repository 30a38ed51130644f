use super::{
    EnqueueOutcome, ExecutionDispatch, ExecutionQueue, QueueDepth, QueueError, QueuedDispatch,
    RECLAIM_ERROR_MESSAGE,
};
use crate::shared::time::now_millis;
use crate::shared::{CancellationToken, RunId};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ENQUEUE_POLL: Duration = Duration::from_millis(100);

const STATUS_PENDING: &str = "pending";
const STATUS_CLAIMED: &str = "claimed";
const STATUS_SUCCEEDED: &str = "succeeded";
const STATUS_FAILED: &str = "failed";

/// Durable queue backed by one SQLite table.
///
/// Each operation opens its own connection. Claims run inside an `IMMEDIATE`
/// transaction, which takes the database write lock before the pending row is
/// selected; a concurrent claimer waits on the busy timeout and then sees the
/// row as already claimed. Reclaim is a single conditional `UPDATE`, so a row
/// is recovered by at most one sweep.
#[derive(Debug, Clone)]
pub struct SqliteExecutionQueue {
    db_path: PathBuf,
    capacity: usize,
    enqueue_poll: Duration,
}

impl SqliteExecutionQueue {
    pub fn open(db_path: &Path, capacity: usize) -> Result<Self, QueueError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent).map_err(|source| QueueError::CreateParent {
                path: parent.display().to_string(),
                source,
            })?;
        }

        let queue = Self {
            db_path: db_path.to_path_buf(),
            capacity: capacity.max(1),
            enqueue_poll: DEFAULT_ENQUEUE_POLL,
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    pub fn with_enqueue_poll(mut self, poll: Duration) -> Self {
        self.enqueue_poll = poll;
        self
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn ensure_schema(&self) -> Result<(), QueueError> {
        let connection = self.connect()?;
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS dispatches (
                    queue_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    run_id TEXT NOT NULL,
                    job_key TEXT NOT NULL,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    claimed_by TEXT,
                    claimed_at_ms INTEGER,
                    enqueued_at_ms INTEGER NOT NULL,
                    finished_at_ms INTEGER,
                    last_error TEXT
                );

                CREATE INDEX IF NOT EXISTS idx_dispatches_status_queue
                    ON dispatches(status, queue_id);
                CREATE INDEX IF NOT EXISTS idx_dispatches_claimed_at
                    ON dispatches(status, claimed_at_ms);
                ",
            )
            .map_err(|source| QueueError::Sql { source })
    }

    /// Status and last error of a row, including finished ones.
    pub fn entry_status(
        &self,
        queue_id: i64,
    ) -> Result<Option<(String, Option<String>)>, QueueError> {
        let connection = self.connect()?;
        connection
            .query_row(
                "SELECT status, last_error FROM dispatches WHERE queue_id = ?1",
                params![queue_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()
            .map_err(|source| QueueError::Sql { source })
    }

    fn connect(&self) -> Result<Connection, QueueError> {
        let connection = Connection::open(&self.db_path).map_err(|source| QueueError::Open {
            path: self.db_path.display().to_string(),
            source,
        })?;
        connection
            .busy_timeout(BUSY_TIMEOUT)
            .map_err(|source| QueueError::Sql { source })?;
        Ok(connection)
    }

    fn try_insert(&self, dispatch: &ExecutionDispatch) -> Result<Option<i64>, QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;
        let live: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM dispatches WHERE status IN (?1, ?2)",
                params![STATUS_PENDING, STATUS_CLAIMED],
                |row| row.get(0),
            )
            .map_err(|source| QueueError::Sql { source })?;
        if usize::try_from(live).unwrap_or(usize::MAX) >= self.capacity {
            return Ok(None);
        }

        tx.execute(
            "
            INSERT INTO dispatches (run_id, job_key, status, attempts, enqueued_at_ms)
            VALUES (?1, ?2, ?3, 0, ?4)
            ",
            params![
                dispatch.run_id.as_str(),
                dispatch.job_key,
                STATUS_PENDING,
                now_millis()
            ],
        )
        .map_err(|source| QueueError::Sql { source })?;
        let queue_id = tx.last_insert_rowid();
        tx.commit().map_err(|source| QueueError::Sql { source })?;
        Ok(Some(queue_id))
    }
}

impl ExecutionQueue for SqliteExecutionQueue {
    fn enqueue(
        &self,
        dispatch: ExecutionDispatch,
        cancel: &CancellationToken,
    ) -> Result<EnqueueOutcome, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(EnqueueOutcome::Canceled);
            }
            if let Some(queue_id) = self.try_insert(&dispatch)? {
                tracing::debug!(event = "queue.enqueued", queue_id, "dispatch enqueued");
                return Ok(EnqueueOutcome::Enqueued { queue_id });
            }
            if !cancel.sleep(self.enqueue_poll) {
                return Ok(EnqueueOutcome::Canceled);
            }
        }
    }

    fn claim_next(&self, worker_id: &str) -> Result<Option<QueuedDispatch>, QueueError> {
        let mut connection = self.connect()?;
        let tx = connection
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|source| QueueError::Sql { source })?;

        let candidate = tx
            .query_row(
                "
                SELECT queue_id, run_id, job_key, attempts
                FROM dispatches
                WHERE status = ?1
                ORDER BY queue_id ASC
                LIMIT 1
                ",
                params![STATUS_PENDING],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, u32>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(|source| QueueError::Sql { source })?;
        let Some((queue_id, run_id, job_key, attempts)) = candidate else {
            return Ok(None);
        };

        let run_id = match RunId::parse(&run_id) {
            Ok(run_id) => run_id,
            Err(reason) => {
                tx.execute(
                    "
                    UPDATE dispatches
                    SET status = ?1, last_error = ?2, finished_at_ms = ?3
                    WHERE queue_id = ?4
                    ",
                    params![STATUS_FAILED, reason, now_millis(), queue_id],
                )
                .map_err(|source| QueueError::Sql { source })?;
                tx.commit().map_err(|source| QueueError::Sql { source })?;
                tracing::error!(
                    event = "queue.corrupt",
                    queue_id,
                    reason = reason.as_str(),
                    "unreadable queue entry marked failed"
                );
                return Err(QueueError::Corrupt { queue_id, reason });
            }
        };

        let changed = tx
            .execute(
                "
                UPDATE dispatches
                SET status = ?1, claimed_by = ?2, claimed_at_ms = ?3
                WHERE queue_id = ?4 AND status = ?5
                ",
                params![STATUS_CLAIMED, worker_id, now_millis(), queue_id, STATUS_PENDING],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if changed != 1 {
            return Ok(None);
        }
        tx.commit().map_err(|source| QueueError::Sql { source })?;

        tracing::debug!(event = "queue.claimed", queue_id, worker_id, "dispatch claimed");
        Ok(Some(QueuedDispatch {
            queue_id,
            run_id,
            job_key,
            attempts,
        }))
    }

    fn complete(
        &self,
        queue_id: i64,
        success: bool,
        error_message: Option<&str>,
    ) -> Result<(), QueueError> {
        let status = if success {
            STATUS_SUCCEEDED
        } else {
            STATUS_FAILED
        };
        let connection = self.connect()?;
        let changed = connection
            .execute(
                "
                UPDATE dispatches
                SET status = ?1, last_error = ?2, finished_at_ms = ?3
                WHERE queue_id = ?4 AND status = ?5
                ",
                params![status, error_message, now_millis(), queue_id, STATUS_CLAIMED],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if changed == 0 {
            return Err(QueueError::NotClaimed { queue_id });
        }
        tracing::debug!(event = "queue.completed", queue_id, success, "dispatch completed");
        Ok(())
    }

    fn release(&self, queue_id: i64, error_message: Option<&str>) -> Result<(), QueueError> {
        let connection = self.connect()?;
        let changed = connection
            .execute(
                "
                UPDATE dispatches
                SET status = ?1, attempts = attempts + 1, claimed_by = NULL,
                    claimed_at_ms = NULL, last_error = ?2
                WHERE queue_id = ?3 AND status = ?4
                ",
                params![STATUS_PENDING, error_message, queue_id, STATUS_CLAIMED],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if changed == 0 {
            return Err(QueueError::NotClaimed { queue_id });
        }
        tracing::info!(event = "queue.released", queue_id, "dispatch released for retry");
        Ok(())
    }

    fn renew_claim(&self, queue_id: i64, worker_id: &str) -> Result<(), QueueError> {
        let connection = self.connect()?;
        let changed = connection
            .execute(
                "
                UPDATE dispatches
                SET claimed_at_ms = ?1
                WHERE queue_id = ?2 AND status = ?3 AND claimed_by = ?4
                ",
                params![now_millis(), queue_id, STATUS_CLAIMED, worker_id],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if changed == 0 {
            return Err(QueueError::NotClaimed { queue_id });
        }
        Ok(())
    }

    fn reclaim_stale(&self, lock_timeout: Duration) -> Result<usize, QueueError> {
        let timeout_ms = i64::try_from(lock_timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(timeout_ms);
        let connection = self.connect()?;
        let recovered = connection
            .execute(
                "
                UPDATE dispatches
                SET status = ?1, attempts = attempts + 1, claimed_by = NULL,
                    claimed_at_ms = NULL, last_error = ?2
                WHERE status = ?3 AND claimed_at_ms <= ?4
                ",
                params![STATUS_PENDING, RECLAIM_ERROR_MESSAGE, STATUS_CLAIMED, cutoff],
            )
            .map_err(|source| QueueError::Sql { source })?;
        if recovered > 0 {
            tracing::warn!(
                event = "queue.reclaimed",
                recovered,
                "stale claims returned to pending"
            );
        }
        Ok(recovered)
    }

    fn depth(&self) -> Result<QueueDepth, QueueError> {
        let connection = self.connect()?;
        let count = |status: &str| -> Result<usize, QueueError> {
            let value: i64 = connection
                .query_row(
                    "SELECT COUNT(*) FROM dispatches WHERE status = ?1",
                    params![status],
                    |row| row.get(0),
                )
                .map_err(|source| QueueError::Sql { source })?;
            Ok(usize::try_from(value).unwrap_or_default())
        };
        Ok(QueueDepth {
            pending: count(STATUS_PENDING)?,
            claimed: count(STATUS_CLAIMED)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dispatch(run: &str) -> ExecutionDispatch {
        ExecutionDispatch::new(RunId::parse(run).expect("run id"), "backup")
    }

    #[test]
    fn finished_rows_are_kept_as_history_but_free_capacity() {
        let dir = tempdir().expect("tempdir");
        let queue = SqliteExecutionQueue::open(&dir.path().join("queue.db"), 1).expect("open");
        let cancel = CancellationToken::new();
        let EnqueueOutcome::Enqueued { queue_id } =
            queue.enqueue(dispatch("run-a"), &cancel).expect("enqueue")
        else {
            panic!("unexpected cancel");
        };
        queue.claim_next("w1").expect("claim").expect("entry");
        queue
            .complete(queue_id, false, Some("exit status 3"))
            .expect("complete");

        assert_eq!(
            queue.entry_status(queue_id).expect("status"),
            Some((STATUS_FAILED.to_string(), Some("exit status 3".to_string())))
        );
        assert!(matches!(
            queue.enqueue(dispatch("run-b"), &cancel).expect("enqueue"),
            EnqueueOutcome::Enqueued { .. }
        ));
    }

    #[test]
    fn unreadable_rows_are_failed_instead_of_claimed() {
        let dir = tempdir().expect("tempdir");
        let queue = SqliteExecutionQueue::open(&dir.path().join("queue.db"), 4).expect("open");
        let connection = queue.connect().expect("connect");
        connection
            .execute(
                "INSERT INTO dispatches (run_id, job_key, status, attempts, enqueued_at_ms)
                 VALUES ('', 'backup', ?1, 0, 0)",
                params![STATUS_PENDING],
            )
            .expect("insert corrupt row");
        queue
            .enqueue(dispatch("run-b"), &CancellationToken::new())
            .expect("enqueue");

        let err = queue.claim_next("w1").expect_err("corrupt row");
        assert!(matches!(err, QueueError::Corrupt { queue_id: 1, .. }));
        let (status, _) = queue.entry_status(1).expect("status").expect("row");
        assert_eq!(status, STATUS_FAILED);

        let claimed = queue.claim_next("w1").expect("claim").expect("entry");
        assert_eq!(claimed.run_id.as_str(), "run-b");
        assert_eq!(queue.reclaim_stale(Duration::ZERO).expect("reclaim"), 1);
        assert_eq!(queue.depth().expect("depth").pending, 1);
    }

    #[test]
    fn renewal_is_limited_to_the_claiming_worker() {
        let dir = tempdir().expect("tempdir");
        let queue = SqliteExecutionQueue::open(&dir.path().join("queue.db"), 4).expect("open");
        queue
            .enqueue(dispatch("run-a"), &CancellationToken::new())
            .expect("enqueue");
        let claimed = queue.claim_next("w1").expect("claim").expect("entry");

        queue.renew_claim(claimed.queue_id, "w1").expect("renew");
        assert!(queue
            .renew_claim(claimed.queue_id, "w2")
            .expect_err("foreign worker")
            .is_not_claimed());
        queue.complete(claimed.queue_id, true, None).expect("complete");
        assert!(queue
            .renew_claim(claimed.queue_id, "w1")
            .expect_err("finished")
            .is_not_claimed());
    }

    #[test]
    fn schema_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("queue.db");
        {
            let queue = SqliteExecutionQueue::open(&path, 4).expect("open");
            queue
                .enqueue(dispatch("run-a"), &CancellationToken::new())
                .expect("enqueue");
        }
        let reopened = SqliteExecutionQueue::open(&path, 4).expect("reopen");
        let claimed = reopened.claim_next("w1").expect("claim").expect("entry");
        assert_eq!(claimed.run_id.as_str(), "run-a");
    }
}
