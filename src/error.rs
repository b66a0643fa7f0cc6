use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Validation(String),

    #[error("docker daemon is not reachable: {0}")]
    EngineUnavailable(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("wait for {target} timed out after {seconds}s")]
    WaitTimeout { target: String, seconds: u64 },

    #[error("exit with wrong exit code: expected {expected}, got {actual}")]
    WrongExitCode { expected: i64, actual: i64 },

    #[error("dependency cycle detected involving pod {0}")]
    CycleDetected(String),

    #[error("pod name:{0} is not exist")]
    UnknownPod(String),

    #[error("volume group:{0} is not exist")]
    UnknownVolumeGroup(String),

    #[error("{0}")]
    WrongState(String),

    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid compose config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for errors caused by the caller's input or the engine state, as
    /// opposed to internal failures. The HTTP layer maps these to 4xx.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::CycleDetected(_)
                | Error::UnknownPod(_)
                | Error::UnknownVolumeGroup(_)
                | Error::WrongState(_)
        )
    }
}
