//! Per-process relation cache with version stamps.
//!
//! Every entity has a version. A cached relation remembers the version it
//! was loaded under and is served only while that version is current. Any
//! mutation touching the entity bumps the version, so the next read goes
//! back to the store. Nothing here is shared across processes.

use std::{
  collections::{BTreeSet, HashMap},
  sync::Arc,
};

use crate::entity::EntityRef;

/// A relation loaded for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Relation {
  /// Entity groups of a member.
  Groups,
  /// Groups of the member's default group class.
  DefaultGroups,
  /// Members of a group.
  Members,
  /// Named groups of a member.
  NamedGroups,
}

impl Relation {
  const ALL: [Self; 4] =
    [Self::Groups, Self::DefaultGroups, Self::Members, Self::NamedGroups];
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cached {
  Refs(Arc<[EntityRef]>),
  Names(Arc<BTreeSet<String>>),
}

#[derive(Debug, Default)]
pub struct RelationCache {
  versions: HashMap<EntityRef, u64>,
  loaded:   HashMap<(EntityRef, Relation), (u64, Cached)>,
}

impl RelationCache {
  pub fn new() -> Self { Self::default() }

  pub fn version(&self, entity: &EntityRef) -> u64 {
    self.versions.get(entity).copied().unwrap_or(0)
  }

  /// Invalidate everything cached for `entity`.
  pub fn bump(&mut self, entity: &EntityRef) -> u64 {
    let version = self.versions.entry(entity.clone()).or_default();
    *version += 1;
    let current = *version;
    for relation in Relation::ALL {
      self.loaded.remove(&(entity.clone(), relation));
    }
    current
  }

  /// The cached value, if it was loaded under the current version.
  pub fn get(&self, entity: &EntityRef, relation: Relation) -> Option<&Cached> {
    let current = self.version(entity);
    self
      .loaded
      .get(&(entity.clone(), relation))
      .filter(|(version, _)| *version == current)
      .map(|(_, value)| value)
  }

  /// Store a value loaded under `version`. Loads that raced with a bump are
  /// dropped.
  pub fn put(
    &mut self,
    entity: &EntityRef,
    relation: Relation,
    version: u64,
    value: Cached,
  ) -> bool {
    if version != self.version(entity) {
      return false;
    }
    self.loaded.insert((entity.clone(), relation), (version, value));
    true
  }
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;

  fn refs(r: &EntityRef) -> Cached { Cached::Refs(Arc::from(vec![r.clone()])) }

  #[test]
  fn fresh_values_are_served() {
    let mut cache = RelationCache::new();
    let u = EntityRef::new("User", Uuid::new_v4());
    let g = EntityRef::new("Group", Uuid::new_v4());

    assert!(cache.get(&u, Relation::Groups).is_none());
    assert!(cache.put(&u, Relation::Groups, cache.version(&u), refs(&g)));
    assert_eq!(cache.get(&u, Relation::Groups), Some(&refs(&g)));
    assert!(cache.get(&u, Relation::NamedGroups).is_none());
  }

  #[test]
  fn bump_invalidates_every_relation() {
    let mut cache = RelationCache::new();
    let u = EntityRef::new("User", Uuid::new_v4());
    let g = EntityRef::new("Group", Uuid::new_v4());

    cache.put(&u, Relation::Groups, 0, refs(&g));
    cache.put(&u, Relation::NamedGroups, 0, Cached::Names(Arc::default()));
    assert_eq!(cache.bump(&u), 1);
    assert!(cache.get(&u, Relation::Groups).is_none());
    assert!(cache.get(&u, Relation::NamedGroups).is_none());
  }

  #[test]
  fn stale_loads_are_dropped() {
    let mut cache = RelationCache::new();
    let u = EntityRef::new("User", Uuid::new_v4());
    let g = EntityRef::new("Group", Uuid::new_v4());

    let stamp = cache.version(&u);
    cache.bump(&u);
    assert!(!cache.put(&u, Relation::Groups, stamp, refs(&g)));
    assert!(cache.get(&u, Relation::Groups).is_none());
  }
}
