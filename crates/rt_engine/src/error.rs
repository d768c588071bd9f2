use thiserror::Error;

/// Errors surfaced by the runtime's external interfaces (spec §4.H).
///
/// Internal scheduling decisions (a failed steal, a cap miss, a lost wake
/// race) are not errors: they are part of the normal probe/fallback flow
/// and never reach this type.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime configuration is invalid: {0}")]
    InvalidConfig(String),

    #[error("failed to spawn engine thread: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("failed to pin engine {engine} to cpu {cpu}")]
    PinningFailed {
        engine: crate::ids::EngineId,
        cpu: usize,
    },

    #[error("the runtime has already been shut down")]
    AlreadyShutDown,
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
