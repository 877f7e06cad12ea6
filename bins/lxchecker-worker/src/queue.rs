/// Job queue as seen by one worker: claim, acknowledge, announce completion
use async_trait::async_trait;
use lxchecker_common::redis as keys;
use lxchecker_common::types::CompletionEvent;
use redis::aio::ConnectionManager;
use redis::RedisResult;

#[async_trait]
pub trait WorkQueue: Send + Sync + 'static {
    /// Next payload, moved onto this worker's processing list. `None` on poll timeout.
    async fn claim(&self) -> RedisResult<Option<String>>;

    /// Drop a payload from the processing list once it needs no more work
    async fn ack(&self, payload: &str) -> RedisResult<()>;

    async fn publish(&self, event: &CompletionEvent) -> RedisResult<()>;
}

pub struct RedisWorkQueue {
    worker_id: String,
    poll_timeout_secs: u64,
    // BLMOVE blocks the whole multiplexed connection, so claims get their own
    claim_conn: ConnectionManager,
    conn: ConnectionManager,
}

impl RedisWorkQueue {
    pub fn new(
        worker_id: impl Into<String>,
        poll_timeout_secs: u64,
        claim_conn: ConnectionManager,
        conn: ConnectionManager,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_timeout_secs,
            claim_conn,
            conn,
        }
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn claim(&self) -> RedisResult<Option<String>> {
        let mut conn = self.claim_conn.clone();
        keys::claim_job(&mut conn, &self.worker_id, self.poll_timeout_secs).await
    }

    async fn ack(&self, payload: &str) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        keys::ack_job(&mut conn, &self.worker_id, payload).await
    }

    async fn publish(&self, event: &CompletionEvent) -> RedisResult<()> {
        let mut conn = self.conn.clone();
        keys::publish_completion(&mut conn, event).await
    }
}
