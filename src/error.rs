use thiserror::Error;

/// Errors surfaced to clients as compact `{e}` payloads or HTTP statuses.
/// The display strings are part of the wire contract.
#[derive(Error, Debug)]
pub enum GameError {
    #[error("round not running")]
    RoundNotRunning,

    #[error("round not in running state")]
    RoundNotInRunningState,

    #[error("invalid drop")]
    InvalidDrop,

    #[error("invalid slice")]
    InvalidSlice,

    #[error("invalid drop index")]
    InvalidDropIndex,

    #[error("out of window")]
    OutOfWindow,

    #[error("already clicked")]
    AlreadyClicked,

    #[error("not whitelisted")]
    NotWhitelisted,

    #[error("invalid sign")]
    InvalidSign,

    #[error("round not found")]
    RoundNotFound,

    #[error("round not locked")]
    RoundNotLocked,

    #[error("round not ready for draw")]
    RoundNotReady,

    #[error("draw in progress")]
    DrawInProgress,

    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("db error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl GameError {
    /// Duplicate clicks are an expected rejection, not a fault.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            GameError::AlreadyClicked | GameError::OutOfWindow | GameError::NotWhitelisted
        )
    }
}
