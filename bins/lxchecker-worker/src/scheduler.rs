/// Execution Scheduler
///
/// **Responsibility:**
/// Turn one `SubmitOptions` into one isolated, time-bounded container run:
///
/// 1. pull the image (drained fully, not bounded by the timeout)
/// 2. create a container with the image's entrypoint
/// 3. pack the submission into a tar archive and copy it in
/// 4. start it
/// 5. wait for exit, bounded by `options.timeout`
/// 6. fetch combined stdout + stderr
///
/// Each step's failure aborts the rest and is reported with its phase. The
/// cancellation token is observed in every phase. Once a container exists it
/// is removed on every exit path.

use crate::archive::{build_submission_archive, ArchiveError};
use crate::engine::{ContainerRuntime, EngineError};
use lxchecker_common::types::{FailureKind, SubmitOptions, SubmitResponse};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("failed to pull image: {0}")]
    Pull(#[source] EngineError),
    #[error("failed to create container: {0}")]
    Create(#[source] EngineError),
    #[error("failed to build submission archive: {0}")]
    Archive(#[from] ArchiveError),
    #[error("failed to copy submission to container: {0}")]
    Copy(#[source] EngineError),
    #[error("failed to start container: {0}")]
    Start(#[source] EngineError),
    #[error("failed to wait for container: {0}")]
    Wait(#[source] EngineError),
    #[error("container did not exit within {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("failed to fetch container logs: {0}")]
    Logs(#[source] EngineError),
    #[error("run cancelled")]
    Cancelled,
}

impl SchedulerError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SchedulerError::Timeout(_) => FailureKind::Timeout,
            _ => FailureKind::Engine,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            SchedulerError::Pull(_) => "pull",
            SchedulerError::Create(_) => "create",
            SchedulerError::Archive(_) | SchedulerError::Copy(_) => "copy",
            SchedulerError::Start(_) => "start",
            SchedulerError::Wait(_) | SchedulerError::Timeout(_) => "wait",
            SchedulerError::Logs(_) => "logs",
            SchedulerError::Cancelled => "cancelled",
        }
    }
}

/// Race an engine call against cancellation
async fn cancellable<T>(
    cancel: &CancellationToken,
    call: impl Future<Output = T>,
) -> Result<T, SchedulerError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SchedulerError::Cancelled),
        out = call => Ok(out),
    }
}

/// Removes its container when released, or in the background if dropped
/// without being released (panic, future dropped mid-run).
struct ContainerGuard<R: ContainerRuntime> {
    runtime: Arc<R>,
    id: Option<String>,
}

impl<R: ContainerRuntime> ContainerGuard<R> {
    fn new(runtime: Arc<R>, id: String) -> Self {
        Self {
            runtime,
            id: Some(id),
        }
    }

    fn id(&self) -> &str {
        self.id.as_deref().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.id.take() {
            remove_logged(self.runtime.as_ref(), &id).await;
        }
    }
}

impl<R: ContainerRuntime> Drop for ContainerGuard<R> {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    remove_logged(runtime.as_ref(), &id).await;
                });
            }
            Err(_) => warn!(container_id = %id, "No runtime left to remove container"),
        }
    }
}

async fn remove_logged<R: ContainerRuntime>(runtime: &R, id: &str) {
    match runtime.remove_container(id).await {
        Ok(()) => debug!(container_id = %id, "Container removed"),
        Err(e) => warn!(container_id = %id, error = %e, "Failed to remove container"),
    }
}

/// Shared by all in-flight submissions; holds no per-run state.
pub struct Scheduler<R: ContainerRuntime> {
    runtime: Arc<R>,
}

impl<R: ContainerRuntime> Clone for Scheduler<R> {
    fn clone(&self) -> Self {
        Self {
            runtime: Arc::clone(&self.runtime),
        }
    }
}

impl<R: ContainerRuntime> Scheduler<R> {
    pub fn new(runtime: Arc<R>) -> Self {
        Self { runtime }
    }

    /// Run a submission to completion and return its logs and exit code
    pub async fn submit(
        &self,
        cancel: &CancellationToken,
        options: &SubmitOptions,
    ) -> Result<SubmitResponse, SchedulerError> {
        debug!(image = %options.image, "Pulling image");
        cancellable(cancel, self.runtime.pull_image(&options.image))
            .await?
            .map_err(SchedulerError::Pull)?;

        debug!(image = %options.image, "Creating container");
        let id = cancellable(cancel, self.runtime.create_container(&options.image))
            .await?
            .map_err(SchedulerError::Create)?;

        let container = ContainerGuard::new(Arc::clone(&self.runtime), id);
        let result = self.run(cancel, container.id(), options).await;
        container.release().await;
        result
    }

    async fn run(
        &self,
        cancel: &CancellationToken,
        id: &str,
        options: &SubmitOptions,
    ) -> Result<SubmitResponse, SchedulerError> {
        let archive = build_submission_archive(&options.submission, &options.submission_path)?;
        let timeout = options.timeout;

        debug!(container_id = %id, bytes = archive.len(), "Copying submission");
        cancellable(cancel, self.runtime.copy_to_container(id, archive))
            .await?
            .map_err(SchedulerError::Copy)?;

        debug!(container_id = %id, "Starting container");
        cancellable(cancel, self.runtime.start_container(id))
            .await?
            .map_err(SchedulerError::Start)?;

        debug!(container_id = %id, timeout_secs = timeout.as_secs(), "Waiting for exit");
        let exit_code = cancellable(
            cancel,
            tokio::time::timeout(timeout, self.runtime.wait_container(id)),
        )
        .await?
        .map_err(|_| SchedulerError::Timeout(timeout))?
        .map_err(SchedulerError::Wait)?;

        debug!(container_id = %id, exit_code, "Fetching logs");
        let logs = cancellable(cancel, self.runtime.logs(id))
            .await?
            .map_err(SchedulerError::Logs)?;

        Ok(SubmitResponse { logs, exit_code })
    }
}
