//! The storage collaborator contract.
//!
//! The engine needs very little from a backend: a transaction boundary and a
//! handful of synchronous primitives that run inside it. Backends (e.g.
//! `coterie-store-sqlite`) implement [`MembershipStore`]; the mutator, the
//! merge engine and every read go through
//! [`MembershipStore::transact`].

use std::future::Future;

use uuid::Uuid;

use crate::{
  Result,
  criteria::{Criteria, RefSet},
  entity::{Entity, EntityRef, Side, TypeName},
  membership::{InvalidRecord, Membership, NewMembership},
};

// ─── Transaction primitives ──────────────────────────────────────────────────

/// Operations available inside one store transaction.
///
/// Criteria handed to these methods have already been normalised to base
/// types by the engine.
pub trait MembershipTxn {
  // ── Entities ──────────────────────────────────────────────────────────

  fn insert_entity(&mut self, entity: &Entity) -> Result<()>;

  /// Fetch the given entities. Missing references are skipped.
  fn load_entities(&mut self, refs: &RefSet) -> Result<Vec<Entity>>;

  /// The registered type an entity was created as, or `None` if it does not
  /// exist.
  fn concrete_type(&mut self, entity: &EntityRef) -> Result<Option<TypeName>>;

  /// Delete an entity and, through referential integrity, every membership
  /// on either side of it. Returns `false` if it did not exist.
  fn delete_entity(&mut self, entity: &EntityRef) -> Result<bool>;

  // ── Memberships ───────────────────────────────────────────────────────

  /// Insert rows in one batch and return them as persisted.
  fn insert_batch(&mut self, rows: &[NewMembership]) -> Result<Vec<Membership>>;

  fn select(&mut self, criteria: &Criteria) -> Result<Vec<Membership>>;

  fn count(&mut self, criteria: &Criteria) -> Result<u64>;

  /// Distinct references on `side` of the matching rows. Rows without an
  /// entity on that side (named groups) are skipped.
  fn distinct_refs(&mut self, criteria: &Criteria, side: Side) -> Result<Vec<EntityRef>>;

  fn delete_where(&mut self, criteria: &Criteria) -> Result<u64>;

  fn delete_ids(&mut self, ids: &[Uuid]) -> Result<u64>;

  /// Point the group side of every matching row at `to`, keeping member and
  /// membership type.
  fn repoint_groups(&mut self, criteria: &Criteria, to: &EntityRef) -> Result<u64>;

  /// The validation contract. Backends extend the model-level checks of
  /// [`NewMembership::check`] with their own.
  fn validate(&mut self, row: &NewMembership) -> Result<Option<InvalidRecord>> {
    Ok(row.check().err())
  }
}

// ─── Store ───────────────────────────────────────────────────────────────────

/// A backend that can run [`MembershipTxn`] work atomically.
///
/// `transact` commits when the closure returns `Ok` and rolls back when it
/// returns `Err`, so a failed batch leaves no partial writes behind.
pub trait MembershipStore: Send + Sync {
  fn transact<F, T>(&self, work: F) -> impl Future<Output = Result<T>> + Send + '_
  where
    F: FnOnce(&mut dyn MembershipTxn) -> Result<T> + Send + 'static,
    T: Send + 'static;
}
