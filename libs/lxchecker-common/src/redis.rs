use crate::types::{CompletionEvent, SubmissionJob};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Redis key and queue semantics shared by API, worker and CLI
/// Keys are deterministic so every process agrees on where a record lives

pub const ASSIGNMENT_PREFIX: &str = "lxchecker:assignment";
pub const SUBMISSION_PREFIX: &str = "lxchecker:submission";
pub const PENDING_SET: &str = "lxchecker:pending";
pub const SUBMISSION_INDEX_PREFIX: &str = "lxchecker:index:submissions";
pub const SUBMISSION_QUEUE: &str = "lxchecker:queue:submissions";
pub const PROCESSING_PREFIX: &str = "lxchecker:processing";
pub const COMPLETIONS_CHANNEL: &str = "lxchecker:events:completions";

pub fn assignment_key(subject_id: &str, assignment_id: &str) -> String {
    format!("{}:{}:{}", ASSIGNMENT_PREFIX, subject_id, assignment_id)
}

pub fn submission_key(subject_id: &str, assignment_id: &str, submission_id: &str) -> String {
    format!(
        "{}:{}:{}:{}",
        SUBMISSION_PREFIX, subject_id, assignment_id, submission_id
    )
}

/// Sorted set of an assignment's submission keys, scored by timestamp
pub fn submission_index(subject_id: &str, assignment_id: &str) -> String {
    format!("{}:{}:{}", SUBMISSION_INDEX_PREFIX, subject_id, assignment_id)
}

/// Jobs a worker has claimed but not yet acknowledged
pub fn processing_list(worker_id: &str) -> String {
    format!("{}:{}", PROCESSING_PREFIX, worker_id)
}

/// Enqueue a pending submission for execution
pub async fn push_job(conn: &mut ConnectionManager, job: &SubmissionJob) -> redis::RedisResult<()> {
    let payload = serde_json::to_string(job).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "job encoding", e.to_string()))
    })?;
    conn.lpush::<_, _, ()>(SUBMISSION_QUEUE, payload).await
}

/// Block until a job is available and move it onto the worker's processing list
///
/// Returns the raw payload, which is what `ack_job` needs to remove it again.
/// `None` means the poll timed out.
pub async fn claim_job(
    conn: &mut ConnectionManager,
    worker_id: &str,
    timeout_secs: u64,
) -> redis::RedisResult<Option<String>> {
    redis::cmd("BLMOVE")
        .arg(SUBMISSION_QUEUE)
        .arg(processing_list(worker_id))
        .arg("RIGHT")
        .arg("LEFT")
        .arg(timeout_secs)
        .query_async(conn)
        .await
}

/// Drop a finished job from the worker's processing list
pub async fn ack_job(
    conn: &mut ConnectionManager,
    worker_id: &str,
    payload: &str,
) -> redis::RedisResult<()> {
    conn.lrem::<_, _, ()>(processing_list(worker_id), 1, payload)
        .await
}

/// Put jobs left over from a previous run of this worker back at the head of the queue
pub async fn requeue_unfinished(
    conn: &mut ConnectionManager,
    worker_id: &str,
) -> redis::RedisResult<usize> {
    let list = processing_list(worker_id);
    let mut moved = 0;
    loop {
        let payload: Option<String> = redis::cmd("LMOVE")
            .arg(&list)
            .arg(SUBMISSION_QUEUE)
            .arg("LEFT")
            .arg("RIGHT")
            .query_async(conn)
            .await?;
        if payload.is_none() {
            return Ok(moved);
        }
        moved += 1;
    }
}

pub async fn publish_completion(
    conn: &mut ConnectionManager,
    event: &CompletionEvent,
) -> redis::RedisResult<()> {
    let payload = serde_json::to_string(event).map_err(|e| {
        redis::RedisError::from((redis::ErrorKind::TypeError, "event encoding", e.to_string()))
    })?;
    conn.publish::<_, _, ()>(COMPLETIONS_CHANNEL, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assignment_key() {
        assert_eq!(assignment_key("so", "tema3"), "lxchecker:assignment:so:tema3");
    }

    #[test]
    fn test_submission_key_deterministic() {
        let key1 = submission_key("so", "tema3", "abc");
        let key2 = submission_key("so", "tema3", "abc");
        assert_eq!(key1, key2);
        assert_eq!(key1, "lxchecker:submission:so:tema3:abc");
    }

    #[test]
    fn test_processing_list_is_per_worker() {
        assert_eq!(processing_list("worker-0"), "lxchecker:processing:worker-0");
        assert_ne!(processing_list("a"), processing_list("b"));
    }

    #[test]
    fn test_submission_index_is_per_assignment() {
        assert_eq!(
            submission_index("so", "tema3"),
            "lxchecker:index:submissions:so:tema3"
        );
        assert!(!submission_index("so", "tema3").starts_with(SUBMISSION_PREFIX));
    }
}
