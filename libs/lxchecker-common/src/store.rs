/// Persistence collaborator
///
/// Typed CRUD over assignments and submissions. `NotFound`, `AlreadyExists`
/// and `Finished` are expected outcomes callers map to rejections; every
/// other error is unexpected and must be surfaced, never swallowed.
///
/// Stored submissions are only ever changed through field-scoped writes:
/// the execution result (owned by the worker) and the teacher grade (owned
/// by the API). Each is an atomic read-modify-write, so neither can undo
/// the other.

use crate::redis::{assignment_key, submission_index, submission_key, PENDING_SET};
use crate::types::{
    Assignment, ExecutionResult, InvalidTransition, Submission, SubmissionStatus, TeacherGrade,
};
use async_trait::async_trait;
use lazy_static::lazy_static;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

/// Compare-and-set attempts before a write gives up
const MAX_WRITE_ATTEMPTS: u32 = 16;

lazy_static! {
    /// KEYS: record, pending index. ARGV: expected, replacement, terminal flag.
    static ref COMPARE_AND_SET: redis::Script = redis::Script::new(
        r"
        if redis.call('GET', KEYS[1]) ~= ARGV[1] then
            return 0
        end
        redis.call('SET', KEYS[1], ARGV[2])
        if ARGV[3] == '1' then
            redis.call('SREM', KEYS[2], KEYS[1])
        end
        return 1
        "
    );
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such object")]
    NotFound,
    #[error("object already exists")]
    AlreadyExists,
    #[error(transparent)]
    Finished(#[from] InvalidTransition),
    #[error("record kept changing, gave up after {0} attempts")]
    Contended(u32),
    #[error("store backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("malformed stored record: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// `NotFound`, `AlreadyExists` and `Finished` are part of normal operation
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound | StoreError::AlreadyExists | StoreError::Finished(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn get_assignment(&self, subject_id: &str, assignment_id: &str)
        -> StoreResult<Assignment>;

    async fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()>;

    async fn get_submission(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
    ) -> StoreResult<Submission>;

    /// Fails with `NotFound` if the assignment is gone, `AlreadyExists` on id reuse.
    async fn insert_submission(&self, submission: &Submission) -> StoreResult<()>;

    /// Atomically move a `pending` submission to `done` or `failed`
    ///
    /// Touches only execution-derived fields. `Finished` if the stored record
    /// is already terminal, `NotFound` if absent. Returns the stored result.
    async fn record_execution(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
        result: &ExecutionResult,
    ) -> StoreResult<Submission>;

    /// Atomically set the teacher fields, leaving status and execution results as stored
    async fn record_teacher_grade(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
        grade: &TeacherGrade,
    ) -> StoreResult<Submission>;

    /// Every submission of an assignment, newest first
    async fn list_submissions(
        &self,
        subject_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Vec<Submission>>;

    /// Every submission still in `pending`
    async fn list_pending(&self) -> StoreResult<Vec<Submission>>;
}

fn apply_grade(submission: &mut Submission, grade: &TeacherGrade) {
    submission.apply_teacher_grade(
        grade.score,
        grade.feedback.clone(),
        grade.grader_username.clone(),
    );
}

/// Redis-backed store: one JSON document per key, a per-assignment index
/// ordered by timestamp, and an index of pending submissions.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::new(conn))
    }

    /// Read-modify-write of one submission, retried while another writer
    /// changes the record between the read and the write.
    async fn modify_submission<F>(&self, key: String, mut change: F) -> StoreResult<Submission>
    where
        F: FnMut(&mut Submission) -> StoreResult<()> + Send,
    {
        let mut conn = self.conn.clone();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let raw: Option<String> = conn.get(&key).await?;
            let raw = raw.ok_or(StoreError::NotFound)?;
            let mut submission: Submission = serde_json::from_str(&raw)?;
            change(&mut submission)?;

            let payload = serde_json::to_string(&submission)?;
            let terminal = if submission.status.is_terminal() { 1 } else { 0 };
            let swapped: i64 = COMPARE_AND_SET
                .key(&key)
                .key(PENDING_SET)
                .arg(&raw)
                .arg(payload)
                .arg(terminal)
                .invoke_async(&mut conn)
                .await?;
            if swapped == 1 {
                return Ok(submission);
            }
            tracing::debug!(key = %key, "Submission changed during write, retrying");
        }
        Err(StoreError::Contended(MAX_WRITE_ATTEMPTS))
    }
}

#[async_trait]
impl SubmissionStore for RedisStore {
    async fn get_assignment(
        &self,
        subject_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Assignment> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(assignment_key(subject_id, assignment_id)).await?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(assignment)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(assignment_key(&assignment.subject_id, &assignment.id))
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        created.map(|_| ()).ok_or(StoreError::AlreadyExists)
    }

    async fn get_submission(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
    ) -> StoreResult<Submission> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(submission_key(subject_id, assignment_id, submission_id))
            .await?;
        let raw = raw.ok_or(StoreError::NotFound)?;
        Ok(serde_json::from_str(&raw)?)
    }

    async fn insert_submission(&self, submission: &Submission) -> StoreResult<()> {
        self.get_assignment(&submission.subject_id, &submission.assignment_id)
            .await?;

        let key = submission_key(
            &submission.subject_id,
            &submission.assignment_id,
            &submission.id,
        );
        let mut conn = self.conn.clone();
        let payload = serde_json::to_string(submission)?;
        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        if created.is_none() {
            return Err(StoreError::AlreadyExists);
        }

        if submission.status == SubmissionStatus::Pending {
            conn.sadd::<_, _, ()>(PENDING_SET, &key).await?;
        }
        conn.zadd::<_, _, _, ()>(
            submission_index(&submission.subject_id, &submission.assignment_id),
            &key,
            submission.timestamp.timestamp_millis(),
        )
        .await?;
        Ok(())
    }

    async fn record_execution(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
        result: &ExecutionResult,
    ) -> StoreResult<Submission> {
        let key = submission_key(subject_id, assignment_id, submission_id);
        self.modify_submission(key, |submission| {
            submission.finish(result.clone())?;
            Ok(())
        })
        .await
    }

    async fn record_teacher_grade(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
        grade: &TeacherGrade,
    ) -> StoreResult<Submission> {
        let key = submission_key(subject_id, assignment_id, submission_id);
        self.modify_submission(key, |submission| {
            apply_grade(submission, grade);
            Ok(())
        })
        .await
    }

    async fn list_submissions(
        &self,
        subject_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Vec<Submission>> {
        let mut conn = self.conn.clone();
        let index = submission_index(subject_id, assignment_id);
        let keys: Vec<String> = conn.zrevrange(&index, 0, -1).await?;
        let mut submissions = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(raw) => submissions.push(serde_json::from_str(&raw)?),
                None => {
                    tracing::warn!(key = %key, "Submission index points at a missing submission");
                    conn.zrem::<_, _, ()>(&index, &key).await?;
                }
            }
        }
        Ok(submissions)
    }

    async fn list_pending(&self) -> StoreResult<Vec<Submission>> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn.smembers(PENDING_SET).await?;
        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            match raw {
                Some(raw) => {
                    let submission: Submission = serde_json::from_str(&raw)?;
                    if submission.status == SubmissionStatus::Pending {
                        pending.push(submission);
                    }
                }
                None => {
                    tracing::warn!(key = %key, "Pending index points at a missing submission");
                    conn.srem::<_, _, ()>(PENDING_SET, &key).await?;
                }
            }
        }
        Ok(pending)
    }
}

/// In-process store with the same semantics as `RedisStore`
#[derive(Default)]
pub struct MemoryStore {
    assignments: Mutex<HashMap<String, Assignment>>,
    submissions: Mutex<HashMap<String, Submission>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored submissions, any status
    pub async fn submission_count(&self) -> usize {
        self.submissions.lock().await.len()
    }

    async fn modify_submission<F>(&self, key: String, change: F) -> StoreResult<Submission>
    where
        F: FnOnce(&mut Submission) -> StoreResult<()> + Send,
    {
        let mut submissions = self.submissions.lock().await;
        let stored = submissions.get_mut(&key).ok_or(StoreError::NotFound)?;
        let mut updated = stored.clone();
        change(&mut updated)?;
        *stored = updated.clone();
        Ok(updated)
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn get_assignment(
        &self,
        subject_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Assignment> {
        self.assignments
            .lock()
            .await
            .get(&assignment_key(subject_id, assignment_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert_assignment(&self, assignment: &Assignment) -> StoreResult<()> {
        let mut assignments = self.assignments.lock().await;
        let key = assignment_key(&assignment.subject_id, &assignment.id);
        if assignments.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        assignments.insert(key, assignment.clone());
        Ok(())
    }

    async fn get_submission(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
    ) -> StoreResult<Submission> {
        self.submissions
            .lock()
            .await
            .get(&submission_key(subject_id, assignment_id, submission_id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert_submission(&self, submission: &Submission) -> StoreResult<()> {
        self.get_assignment(&submission.subject_id, &submission.assignment_id)
            .await?;

        let mut submissions = self.submissions.lock().await;
        let key = submission_key(
            &submission.subject_id,
            &submission.assignment_id,
            &submission.id,
        );
        if submissions.contains_key(&key) {
            return Err(StoreError::AlreadyExists);
        }
        submissions.insert(key, submission.clone());
        Ok(())
    }

    async fn record_execution(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
        result: &ExecutionResult,
    ) -> StoreResult<Submission> {
        let key = submission_key(subject_id, assignment_id, submission_id);
        self.modify_submission(key, |submission| {
            submission.finish(result.clone())?;
            Ok(())
        })
        .await
    }

    async fn record_teacher_grade(
        &self,
        subject_id: &str,
        assignment_id: &str,
        submission_id: &str,
        grade: &TeacherGrade,
    ) -> StoreResult<Submission> {
        let key = submission_key(subject_id, assignment_id, submission_id);
        self.modify_submission(key, |submission| {
            apply_grade(submission, grade);
            Ok(())
        })
        .await
    }

    async fn list_submissions(
        &self,
        subject_id: &str,
        assignment_id: &str,
    ) -> StoreResult<Vec<Submission>> {
        let mut submissions: Vec<Submission> = self
            .submissions
            .lock()
            .await
            .values()
            .filter(|s| s.subject_id == subject_id && s.assignment_id == assignment_id)
            .cloned()
            .collect();
        submissions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(submissions)
    }

    async fn list_pending(&self) -> StoreResult<Vec<Submission>> {
        Ok(self
            .submissions
            .lock()
            .await
            .values()
            .filter(|s| s.status == SubmissionStatus::Pending)
            .cloned()
            .collect())
    }
}
