//! Error type for `coterie-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] coterie_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A row violated a uniqueness constraint.
  #[error("duplicate record: {0}")]
  Duplicate(String),

  #[error("configuration error: {0}")]
  Config(#[from] config::ConfigError),
}

impl Error {
  /// The backend error carried by a core [`coterie_core::Error::Store`].
  pub fn downcast(err: &coterie_core::Error) -> Option<&Self> {
    match err {
      coterie_core::Error::Store(inner) => inner.downcast_ref::<Self>(),
      _ => None,
    }
  }

  /// Classify a raw SQLite error, picking out uniqueness violations.
  pub(crate) fn from_sqlite(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(failure, message)
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
          || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
      {
        Self::Duplicate(message.clone().unwrap_or_else(|| failure.to_string()))
      }
      _ => Self::Sqlite(err),
    }
  }
}

impl From<Error> for coterie_core::Error {
  fn from(err: Error) -> Self {
    match err {
      Error::Core(inner) => inner,
      other => coterie_core::Error::store(other),
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
