use thiserror::Error;

/// The store failure taxonomy. Everything a store implementation can
/// surface collapses into one of these classes; callers branch on the
/// class, never on transport detail.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("document not found: {id}")]
  NotFound { id: String },

  /// The stored `_rev` differs from the one the write carried.
  #[error("revision conflict on {id}")]
  Conflict { id: String },

  #[error("store rejected credentials")]
  Unauthorized,

  #[error("store transport failure: {0}")]
  Transport(String),

  #[error("invalid document: {0}")]
  InvalidDoc(String),
}

impl StoreError {
  pub fn not_found(id: impl Into<String>) -> StoreError {
    StoreError::NotFound { id: id.into() }
  }

  pub fn conflict(id: impl Into<String>) -> StoreError {
    StoreError::Conflict { id: id.into() }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, StoreError::NotFound { .. })
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, StoreError::Conflict { .. })
  }

  /// Short machine readable class, used in bulk results.
  pub fn class(&self) -> &'static str {
    match self {
      StoreError::NotFound { .. } => "not_found",
      StoreError::Conflict { .. } => "conflict",
      StoreError::Unauthorized => "unauthorized",
      StoreError::Transport(_) => "transport",
      StoreError::InvalidDoc(_) => "invalid_doc",
    }
  }
}

impl From<reqwest::Error> for StoreError {
  fn from(e: reqwest::Error) -> StoreError {
    StoreError::Transport(e.to_string())
  }
}

impl From<serde_json::Error> for StoreError {
  fn from(e: serde_json::Error) -> StoreError {
    StoreError::InvalidDoc(e.to_string())
  }
}
