use tally_common::KeyError;
use tally_meta::StoreError;

use crate::executor::ExecutorClosed;

#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    #[error("unparseable url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: url::ParseError },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Why a completed exchange produced no usage result.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The usage source had nothing for this conversation. Non-fatal: the
    /// correlation entry is left in place for a later match.
    #[error("usage source returned no data")]
    NoData,
    #[error("usage source failed: {0:#}")]
    Usage(anyhow::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Intercept(#[from] InterceptError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Executor(#[from] ExecutorClosed),
}
