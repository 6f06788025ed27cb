use thiserror::Error;

/// Errors raised by the sync engine. A failed run is never retried
/// automatically; the user restarts it from the prepare phase.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("network error: {0}")]
  Network(String),

  #[error("sync client has no peer endpoint configured")]
  ServiceUnconfigured,

  #[error("inconsistent sync page: {0}")]
  DataEmpty(String),

  #[error("merge transaction failed: {0}")]
  MergeTransaction(String),

  #[error("peer rejected sync page: {0}")]
  PageRejected(String),

  #[error("a sync run is already in progress")]
  AlreadyRunning,

  #[error("sync session must be reset to the prepare phase first")]
  NotPrepared,

  #[error("no usable LAN IPv4 address for hosting a sync session")]
  NoLanAddress,

  #[error(transparent)]
  Db(#[from] rusqlite::Error),

  #[error("internal lock poisoned")]
  Lock,
}

impl From<reqwest::Error> for SyncError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_timeout() {
      SyncError::Network(format!("request timed out: {err}"))
    } else {
      SyncError::Network(err.to_string())
    }
  }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
  fn from(_: std::sync::PoisonError<T>) -> Self {
    SyncError::Lock
  }
}
