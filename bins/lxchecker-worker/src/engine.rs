/// Container Runtime Client
///
/// **Core Responsibility:**
/// A narrow view of a container engine: pull, create, copy in, start, wait,
/// fetch logs, remove. One method per engine call, nothing more.
///
/// **Boundary:**
/// - Runtime knows HOW to talk to the engine
/// - Runtime does NOT know about deadlines, timeouts or phase ordering
/// - The Scheduler owns policy; the runtime only reports engine errors
///
/// The client connection is shared by every in-flight submission, so
/// implementations must be safe for concurrent use without external locking.

use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::{StreamExt, TryStreamExt};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error("{0}")]
    Other(String),
}

/// Container engine operations used by the Scheduler
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Pull an image, returning once the pull stream is drained
    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    /// Create a container with the image's own entrypoint; returns its id
    async fn create_container(&self, image: &str) -> Result<String, EngineError>;

    /// Extract a tar archive at the container's filesystem root
    async fn copy_to_container(&self, container_id: &str, archive: Vec<u8>)
        -> Result<(), EngineError>;

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError>;

    /// Block until the container exits; returns its exit code
    async fn wait_container(&self, container_id: &str) -> Result<i64, EngineError>;

    /// Combined stdout and stderr, in emission order
    async fn logs(&self, container_id: &str) -> Result<Vec<u8>, EngineError>;

    /// Force-remove, killing the container if it is still running
    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError>;
}

/// Docker engine client
///
/// `bollard::Docker` multiplexes requests over its connection pool and is
/// cheap to clone, so one instance serves every concurrent run.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerRuntime {
    /// Connect using `DOCKER_HOST` or the local socket
    pub fn connect(registry_credentials: Option<(String, String)>) -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()?;
        let credentials = registry_credentials.map(|(username, password)| DockerCredentials {
            username: Some(username),
            password: Some(password),
            ..Default::default()
        });
        Ok(Self { docker, credentials })
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        self.docker.ping().await?;
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });

        self.docker
            .create_image(options, None, self.credentials.clone())
            .try_for_each(|_progress| async { Ok(()) })
            .await?;
        Ok(())
    }

    async fn create_container(&self, image: &str) -> Result<String, EngineError> {
        let config = Config {
            image: Some(image.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await?;
        Ok(container.id)
    }

    async fn copy_to_container(
        &self,
        container_id: &str,
        archive: Vec<u8>,
    ) -> Result<(), EngineError> {
        let options = Some(UploadToContainerOptions {
            path: "/",
            ..Default::default()
        });

        self.docker
            .upload_to_container(container_id, options, archive.into())
            .await?;
        Ok(())
    }

    async fn start_container(&self, container_id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn wait_container(&self, container_id: &str) -> Result<i64, EngineError> {
        let options = Some(WaitContainerOptions {
            condition: "not-running",
        });

        let stream = self.docker.wait_container(container_id, options);
        futures_util::pin_mut!(stream);

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit status as an error
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(EngineError::Other(
                "wait stream ended without an exit status".to_string(),
            )),
        }
    }

    async fn logs(&self, container_id: &str) -> Result<Vec<u8>, EngineError> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        });

        let logs = self
            .docker
            .logs(container_id, options)
            .try_fold(Vec::new(), |mut logs, output| async move {
                logs.extend_from_slice(&output.into_bytes());
                Ok(logs)
            })
            .await?;
        Ok(logs)
    }

    async fn remove_container(&self, container_id: &str) -> Result<(), EngineError> {
        let options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });

        self.docker
            .remove_container(container_id, options)
            .await?;
        Ok(())
    }
}
