// Hand-off of accepted submissions to the workers

use async_trait::async_trait;
use lxchecker_common::redis as queue;
use lxchecker_common::types::SubmissionJob;
use redis::aio::ConnectionManager;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &SubmissionJob) -> redis::RedisResult<()>;
}

/// Pushes onto the shared Redis list the workers claim from
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: &SubmissionJob) -> redis::RedisResult<()> {
        let mut conn = self.conn.clone();
        queue::push_job(&mut conn, job).await
    }
}
