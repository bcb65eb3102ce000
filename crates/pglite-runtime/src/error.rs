use std::path::PathBuf;

use thiserror::Error;

use crate::lifecycle::LifecycleState;

/// Failures while laying out the guest filesystem.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("no guest bundle available to extract into {0}")]
    BundleUnavailable(PathBuf),

    #[error("unsupported entry kind {kind:?} in guest bundle: {path}")]
    UnsupportedEntry { kind: String, path: String },

    #[error("bundle entry escapes the extraction root: {0}")]
    UnsafePath(String),

    #[error("guest image not found at {0}")]
    MissingImage(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum PgLiteError {
    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Compilation failed: {0}")]
    CompilationFailed(String),

    #[error("Instantiation failed: {0}")]
    Instantiation(String),

    #[error("guest does not export `{0}`")]
    MissingExport(&'static str),

    #[error("guest call `{entry}` failed: {message}")]
    GuestCall { entry: &'static str, message: String },

    #[error("guest memory access failed: {0}")]
    Memory(String),

    #[error("network listener failed: {0}")]
    Listen(String),

    #[error("session already started (state: {0:?})")]
    AlreadyStarted(LifecycleState),

    #[error("session has not been started")]
    NotStarted,

    #[error("session is closed")]
    Closed,

    #[error("request cancelled before reaching the guest")]
    Cancelled,

    #[error("invalid config: {0}")]
    Config(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PgLiteError {
    pub(crate) fn guest_call(entry: &'static str, err: impl std::fmt::Display) -> Self {
        Self::GuestCall {
            entry,
            message: err.to_string(),
        }
    }
}
