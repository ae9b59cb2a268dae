//! [`Memberships`], the entry point that ties the registry, the mutator, the
//! merge engine and the relation cache to a [`MembershipStore`].
//!
//! Every reference and criteria passes through the registry before it
//! reaches the store, so callers may use concrete subtype names freely.

use std::{
  collections::BTreeSet,
  iter,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use chrono::Utc;
use uuid::Uuid;

use crate::{
  Error, Result,
  cache::{Cached, Relation, RelationCache},
  criteria::{Criteria, PolymorphicCollection, RefSet},
  entity::{Entity, EntityRef, GroupKey, NewEntity, Side, TypeName},
  membership::{AddOutcome, Destruction, MergeReport, Membership, Removal},
  merge::merge_groups,
  mutate::{Pair, add_memberships, remove_memberships},
  registry::{Registry, Resolution},
  store::MembershipStore,
};

// ─── Options ─────────────────────────────────────────────────────────────────

/// Options for the add operations.
#[derive(Debug, Clone, Default)]
pub struct AddOptions {
  /// Also create a membership of this type.
  pub membership_type:           Option<String>,
  /// Raise [`Error::Validation`] instead of returning
  /// [`AddOutcome::Rejected`].
  pub exception_on_invalidation: bool,
  /// How unknown type names in the input are handled.
  pub resolution:                Resolution,
}

impl AddOptions {
  pub fn new() -> Self { Self::default() }

  pub fn as_type(kind: impl Into<String>) -> Self {
    Self { membership_type: Some(kind.into()), ..Self::default() }
  }

  pub fn raising(mut self) -> Self {
    self.exception_on_invalidation = true;
    self
  }

  pub fn resolving(mut self, resolution: Resolution) -> Self {
    self.resolution = resolution;
    self
  }
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// The membership engine over a store `S`.
pub struct Memberships<S> {
  store:    S,
  registry: Arc<Registry>,
  cache:    Mutex<RelationCache>,
}

impl<S: MembershipStore> Memberships<S> {
  pub fn new(store: S, registry: Registry) -> Self {
    Self {
      store,
      registry: Arc::new(registry),
      cache: Mutex::new(RelationCache::new()),
    }
  }

  pub fn store(&self) -> &S { &self.store }

  pub fn registry(&self) -> &Registry { &self.registry }

  fn cache(&self) -> MutexGuard<'_, RelationCache> {
    self.cache.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn invalidate<'a>(&self, entities: impl IntoIterator<Item = &'a EntityRef>) {
    let mut cache = self.cache();
    for entity in entities {
      cache.bump(entity);
    }
  }

  fn resolve(&self, entity: &EntityRef) -> Result<EntityRef> {
    self.registry.resolve(entity, &Resolution::Strict)
  }

  fn resolve_pairs<'a>(
    &self,
    pairs: impl IntoIterator<Item = (&'a GroupKey, &'a EntityRef)>,
    resolution: &Resolution,
  ) -> Result<Vec<Pair>> {
    pairs
      .into_iter()
      .map(|(group, member)| {
        Ok((
          self.registry.resolve_group(group, resolution)?,
          self.registry.resolve(member, resolution)?,
        ))
      })
      .collect()
  }

  // ── Entities ──────────────────────────────────────────────────────────

  /// Persist a new entity under its base type.
  pub async fn create_entity(&self, new: NewEntity) -> Result<Entity> {
    let type_name = self.registry.resolve_base_type(&new.type_name)?;
    let entity = Entity {
      reference:     EntityRef { type_name, id: new.id.unwrap_or_else(Uuid::new_v4) },
      concrete_type: new.type_name,
      data:          new.data,
      created_at:    Utc::now(),
    };

    let row = entity.clone();
    self.store.transact(move |txn| txn.insert_entity(&row)).await?;
    tracing::debug!(entity = %entity.reference, "entity created");
    Ok(entity)
  }

  pub async fn get_entity(&self, entity: &EntityRef) -> Result<Option<Entity>> {
    let refs: RefSet = iter::once(self.resolve(entity)?).collect();
    let found = self.store.transact(move |txn| txn.load_entities(&refs)).await?;
    Ok(found.into_iter().next())
  }

  /// Delete an entity together with every membership on either side of it.
  #[tracing::instrument(level = "debug", skip_all, fields(entity = %entity))]
  pub async fn destroy_entity(&self, entity: &EntityRef) -> Result<bool> {
    let target = self.resolve(entity)?;
    let t = target.clone();
    let (existed, touched) = self
      .store
      .transact(move |txn| {
        let mut touched = txn.distinct_refs(&Criteria::members_of(&t), Side::Member)?;
        touched.extend(txn.distinct_refs(&Criteria::groups_of(&t), Side::Group)?);
        let existed = txn.delete_entity(&t)?;
        Ok((existed, touched))
      })
      .await?;

    self.invalidate(touched.iter().chain(iter::once(&target)));
    Ok(existed)
  }

  async fn concrete_type(&self, entity: &EntityRef) -> Result<TypeName> {
    let target = self.resolve(entity)?;
    let t = target.clone();
    self
      .store
      .transact(move |txn| txn.concrete_type(&t))
      .await?
      .ok_or(Error::EntityNotFound(target))
  }

  // ── Mutations ─────────────────────────────────────────────────────────

  /// Add `children` to `parent`. An empty `children` never touches the
  /// store.
  #[tracing::instrument(
    level = "debug",
    skip_all,
    fields(parent = %parent, children = children.len())
  )]
  pub async fn add_children(
    &self,
    parent: &GroupKey,
    children: &[EntityRef],
    opts: &AddOptions,
  ) -> Result<AddOutcome> {
    if children.is_empty() {
      return Ok(AddOutcome::Unchanged);
    }
    let pairs =
      self.resolve_pairs(children.iter().map(|c| (parent, c)), &opts.resolution)?;
    self.apply_add(pairs, opts).await
  }

  /// Add `member` to every group in `groups`; parents may be of different
  /// types, entities or labels.
  #[tracing::instrument(
    level = "debug",
    skip_all,
    fields(member = %member, groups = groups.len())
  )]
  pub async fn add_to_groups(
    &self,
    member: &EntityRef,
    groups: &[GroupKey],
    opts: &AddOptions,
  ) -> Result<AddOutcome> {
    if groups.is_empty() {
      return Ok(AddOutcome::Unchanged);
    }
    let pairs =
      self.resolve_pairs(groups.iter().map(|g| (g, member)), &opts.resolution)?;
    self.apply_add(pairs, opts).await
  }

  /// Add `member` to named groups. Repeated labels collapse.
  pub async fn add_named_groups<I, L>(
    &self,
    member: &EntityRef,
    labels: I,
    opts: &AddOptions,
  ) -> Result<AddOutcome>
  where
    I: IntoIterator<Item = L>,
    L: Into<String>,
  {
    let groups: Vec<GroupKey> = labels.into_iter().map(GroupKey::named).collect();
    self.add_to_groups(member, &groups, opts).await
  }

  async fn apply_add(&self, pairs: Vec<Pair>, opts: &AddOptions) -> Result<AddOutcome> {
    let touched = touched(&pairs);
    let registry = Arc::clone(&self.registry);
    let kind = opts.membership_type.clone();
    let raise = opts.exception_on_invalidation;

    let outcome = self
      .store
      .transact(move |txn| add_memberships(txn, &registry, pairs, kind.as_deref(), raise))
      .await?;

    if let AddOutcome::Added(_) = &outcome {
      self.invalidate(&touched);
    }
    Ok(outcome)
  }

  /// Remove `children` from `parent`. `None` removes every membership type.
  #[tracing::instrument(
    level = "debug",
    skip_all,
    fields(parent = %parent, children = children.len(), ?membership_type)
  )]
  pub async fn remove_children(
    &self,
    parent: &GroupKey,
    children: &[EntityRef],
    mode: Destruction,
    membership_type: Option<&str>,
  ) -> Result<Removal> {
    let pairs = self
      .resolve_pairs(children.iter().map(|c| (parent, c)), &Resolution::Strict)?;
    self.apply_remove(pairs, mode, membership_type).await
  }

  pub async fn remove_from_groups(
    &self,
    member: &EntityRef,
    groups: &[GroupKey],
    mode: Destruction,
    membership_type: Option<&str>,
  ) -> Result<Removal> {
    let pairs = self
      .resolve_pairs(groups.iter().map(|g| (g, member)), &Resolution::Strict)?;
    self.apply_remove(pairs, mode, membership_type).await
  }

  pub async fn remove_named_groups<I, L>(
    &self,
    member: &EntityRef,
    labels: I,
    mode: Destruction,
    membership_type: Option<&str>,
  ) -> Result<Removal>
  where
    I: IntoIterator<Item = L>,
    L: Into<String>,
  {
    let groups: Vec<GroupKey> = labels.into_iter().map(GroupKey::named).collect();
    self.remove_from_groups(member, &groups, mode, membership_type).await
  }

  async fn apply_remove(
    &self,
    pairs: Vec<Pair>,
    mode: Destruction,
    membership_type: Option<&str>,
  ) -> Result<Removal> {
    if pairs.is_empty() {
      return Ok(match mode {
        Destruction::Destroy => Removal::Destroyed(Vec::new()),
        Destruction::Delete => Removal::Deleted(0),
      });
    }
    let touched = touched(&pairs);
    let kind = membership_type.map(str::to_owned);

    let removal = self
      .store
      .transact(move |txn| remove_memberships(txn, pairs, kind.as_deref(), mode))
      .await?;

    self.invalidate(&touched);
    Ok(removal)
  }

  /// Merge `source` into `destination` and delete `source`.
  #[tracing::instrument(level = "debug", skip_all, fields(%source, %destination))]
  pub async fn merge(
    &self,
    source: &EntityRef,
    destination: &EntityRef,
  ) -> Result<MergeReport> {
    let source = self.resolve(source)?;
    let destination = self.resolve(destination)?;
    let registry = Arc::clone(&self.registry);
    let (s, d) = (source.clone(), destination.clone());

    let (report, parents) = self
      .store
      .transact(move |txn| {
        // Rows naming the source as a member go with it.
        let parents = txn.distinct_refs(&Criteria::groups_of(&s), Side::Group)?;
        let report = merge_groups(txn, &registry, &s, &d)?;
        Ok((report, parents))
      })
      .await?;

    self.invalidate(
      report
        .members
        .iter()
        .chain(&parents)
        .chain([&source, &destination]),
    );
    Ok(report)
  }

  // ── Queries ───────────────────────────────────────────────────────────

  pub async fn select(&self, criteria: &Criteria) -> Result<Vec<Membership>> {
    let criteria = self.registry.normalize(criteria)?;
    self.store.transact(move |txn| txn.select(&criteria)).await
  }

  pub async fn count(&self, criteria: &Criteria) -> Result<u64> {
    let criteria = self.registry.normalize(criteria)?;
    self.store.transact(move |txn| txn.count(&criteria)).await
  }

  /// The distinct references in `collection`.
  pub async fn refs(&self, collection: &PolymorphicCollection) -> Result<Vec<EntityRef>> {
    let criteria = self.registry.normalize(&collection.criteria)?;
    let side = collection.side;
    self
      .store
      .transact(move |txn| txn.distinct_refs(&criteria, side))
      .await
  }

  /// The entities in `collection`, fetched with one lookup per type.
  pub async fn entities(&self, collection: &PolymorphicCollection) -> Result<Vec<Entity>> {
    let criteria = self.registry.normalize(&collection.criteria)?;
    let side = collection.side;
    self
      .store
      .transact(move |txn| {
        let refs: RefSet = txn.distinct_refs(&criteria, side)?.into_iter().collect();
        if refs.is_empty() {
          return Ok(Vec::new());
        }
        txn.load_entities(&refs)
      })
      .await
  }

  /// Whether `member` belongs to `group`, optionally with a given type.
  pub async fn in_group(
    &self,
    member: &EntityRef,
    group: &GroupKey,
    membership_type: Option<&str>,
  ) -> Result<bool> {
    let criteria = Criteria::groups_of(member)
      .for_parent(group.clone())
      .as_types(membership_type);
    Ok(self.count(&criteria).await? > 0)
  }

  pub async fn in_any_groups(
    &self,
    member: &EntityRef,
    groups: &[GroupKey],
    membership_type: Option<&str>,
  ) -> Result<bool> {
    let criteria =
      Criteria::groups_of(member).in_any(groups.iter().cloned(), membership_type);
    Ok(self.count(&criteria).await? > 0)
  }

  pub async fn in_all_groups(
    &self,
    member: &EntityRef,
    groups: &[GroupKey],
    membership_type: Option<&str>,
  ) -> Result<bool> {
    let criteria =
      Criteria::groups_of(member).in_all(groups.iter().cloned(), membership_type);
    Ok(self.count(&criteria).await? > 0)
  }

  pub async fn in_only_groups(
    &self,
    member: &EntityRef,
    groups: &[GroupKey],
    membership_type: Option<&str>,
  ) -> Result<bool> {
    let criteria =
      Criteria::groups_of(member).in_only(groups.iter().cloned(), membership_type);
    Ok(self.count(&criteria).await? > 0)
  }

  /// Members of `group` reached through a declared association name.
  pub async fn members_by_association(
    &self,
    group: &EntityRef,
    association: &str,
    resolution: &Resolution,
  ) -> Result<Vec<EntityRef>> {
    let concrete = self.concrete_type(group).await?;
    let class =
      self
        .registry
        .resolve_association(concrete.as_str(), association, resolution)?;
    let classes = self.registry.with_descendants(&class)?.clone();
    let collection = Criteria::members_of(group)
      .of_member_types([class])
      .of_concrete_types(Side::Member, classes)
      .polymorphic_collection(Side::Member);
    self.refs(&collection).await
  }

  // ── Cached relations ──────────────────────────────────────────────────

  /// Entity groups `member` belongs to.
  pub async fn groups(&self, member: &EntityRef) -> Result<Arc<[EntityRef]>> {
    let member = self.resolve(member)?;
    let criteria = Criteria::groups_of(&member).entity_groups();
    self.cached_refs(member, Relation::Groups, criteria, Side::Group).await
  }

  /// Groups of the member's declared default group class, or all entity
  /// groups when it declares none.
  pub async fn default_groups(&self, member: &EntityRef) -> Result<Arc<[EntityRef]>> {
    let concrete = self.concrete_type(member).await?;
    let member = self.resolve(member)?;
    let mut criteria = Criteria::groups_of(&member).entity_groups();
    if let Some(class) = self.registry.default_group_class(concrete.as_str()) {
      criteria = criteria.of_group_types([class.clone()]);
    }
    self
      .cached_refs(member, Relation::DefaultGroups, criteria, Side::Group)
      .await
  }

  /// Distinct members of `group`.
  pub async fn members(&self, group: &EntityRef) -> Result<Arc<[EntityRef]>> {
    let group = self.resolve(group)?;
    let criteria = Criteria::members_of(&group);
    self.cached_refs(group, Relation::Members, criteria, Side::Member).await
  }

  /// The set of named groups `member` belongs to.
  pub async fn named_groups(&self, member: &EntityRef) -> Result<Arc<BTreeSet<String>>> {
    let member = self.resolve(member)?;
    let version = {
      let cache = self.cache();
      if let Some(Cached::Names(hit)) = cache.get(&member, Relation::NamedGroups) {
        return Ok(Arc::clone(hit));
      }
      cache.version(&member)
    };

    let criteria = Criteria::groups_of(&member).named_groups();
    let rows = self.store.transact(move |txn| txn.select(&criteria)).await?;
    let names: Arc<BTreeSet<String>> =
      Arc::new(rows.into_iter().filter_map(|row| row.group_name).collect());

    self.cache().put(
      &member,
      Relation::NamedGroups,
      version,
      Cached::Names(Arc::clone(&names)),
    );
    Ok(names)
  }

  async fn cached_refs(
    &self,
    entity: EntityRef,
    relation: Relation,
    criteria: Criteria,
    side: Side,
  ) -> Result<Arc<[EntityRef]>> {
    let version = {
      let cache = self.cache();
      if let Some(Cached::Refs(hit)) = cache.get(&entity, relation) {
        return Ok(Arc::clone(hit));
      }
      cache.version(&entity)
    };

    let criteria = self.registry.normalize(&criteria)?;
    let refs: Arc<[EntityRef]> = self
      .store
      .transact(move |txn| txn.distinct_refs(&criteria, side))
      .await?
      .into();

    self
      .cache()
      .put(&entity, relation, version, Cached::Refs(Arc::clone(&refs)));
    Ok(refs)
  }
}

/// Entity groups and members whose cached relations a change to `pairs`
/// invalidates.
fn touched(pairs: &[Pair]) -> BTreeSet<EntityRef> {
  let mut touched = BTreeSet::new();
  for (group, member) in pairs {
    if let GroupKey::Entity(g) = group {
      touched.insert(g.clone());
    }
    touched.insert(member.clone());
  }
  touched
}
