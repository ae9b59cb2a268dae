//! Error types for `coterie-core`.

use thiserror::Error;

use crate::{
  entity::{EntityRef, GroupKey, TypeName},
  membership::InvalidRecord,
  registry::RegistryError,
};

#[derive(Debug, Error)]
pub enum Error {
  #[error("cannot resolve entity type {0:?}")]
  TypeResolution(String),

  #[error("{member} cannot join {group}: accepted member types are {accepted:?}")]
  TypeMismatch {
    group:    GroupKey,
    member:   EntityRef,
    accepted: Vec<TypeName>,
  },

  #[error("invalid membership: {0}")]
  Validation(Box<InvalidRecord>),

  #[error(
    "cannot merge {source_group} into {destination}: it still has members of {types:?}"
  )]
  IncompatibleMerge {
    source_group: EntityRef,
    destination:  EntityRef,
    types:        Vec<TypeName>,
  },

  #[error("cannot merge {0} into itself")]
  SelfMerge(EntityRef),

  #[error("entity not found: {0}")]
  EntityNotFound(EntityRef),

  #[error("registry error: {0}")]
  Registry(#[from] RegistryError),

  #[error("serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  /// Wrap a backend failure.
  pub fn store(e: impl std::error::Error + Send + Sync + 'static) -> Self {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
