//! Composable, lazily-evaluated membership queries.
//!
//! A [`Criteria`] is a conjunction of [`Filter`]s over membership rows. It
//! does nothing on its own: a backend compiles it (the SQLite store turns it
//! into a `WHERE` clause) when the engine executes it.
//!
//! Empty inputs match nothing. `for_children([])`, `named([])` and
//! `in_all([], ..)` all select zero rows, and so do their negated forms.
//! The single exception is [`Criteria::as_types`]: no types means "do not
//! filter by type".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  Result,
  entity::{EntityRef, GroupKey, Side, TypeName},
};

// ─── Reference sets ──────────────────────────────────────────────────────────

/// Entity references grouped by type, the shape a polymorphic `IN` needs:
/// `(type = T1 AND id IN {...}) OR (type = T2 AND id IN {...})`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefSet(BTreeMap<TypeName, BTreeSet<Uuid>>);

impl RefSet {
  pub fn new() -> Self { Self::default() }

  pub fn insert(&mut self, r: EntityRef) -> bool {
    self.0.entry(r.type_name).or_default().insert(r.id)
  }

  pub fn contains(&self, r: &EntityRef) -> bool {
    self.0.get(&r.type_name).is_some_and(|ids| ids.contains(&r.id))
  }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }

  /// Number of distinct references.
  pub fn len(&self) -> usize { self.0.values().map(BTreeSet::len).sum() }

  /// Per-type id sets, in type order.
  pub fn by_type(&self) -> impl Iterator<Item = (&TypeName, &BTreeSet<Uuid>)> {
    self.0.iter()
  }

  pub fn refs(&self) -> impl Iterator<Item = EntityRef> + '_ {
    self.0.iter().flat_map(|(t, ids)| {
      ids.iter().map(move |id| EntityRef { type_name: t.clone(), id: *id })
    })
  }

  fn map_types<F>(&self, f: &mut F) -> Result<Self>
  where
    F: FnMut(&TypeName) -> Result<TypeName>,
  {
    let mut out: BTreeMap<TypeName, BTreeSet<Uuid>> = BTreeMap::new();
    for (t, ids) in &self.0 {
      out.entry(f(t)?).or_default().extend(ids.iter().copied());
    }
    Ok(Self(out))
  }
}

impl FromIterator<EntityRef> for RefSet {
  fn from_iter<I: IntoIterator<Item = EntityRef>>(iter: I) -> Self {
    let mut set = Self::new();
    for r in iter {
      set.insert(r);
    }
    set
  }
}

impl<'a> FromIterator<&'a EntityRef> for RefSet {
  fn from_iter<I: IntoIterator<Item = &'a EntityRef>>(iter: I) -> Self {
    iter.into_iter().cloned().collect()
  }
}

/// A set of groups: entity groups and named labels may be mixed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSet {
  pub entities: RefSet,
  pub names:    BTreeSet<String>,
}

impl GroupSet {
  pub fn is_empty(&self) -> bool {
    self.entities.is_empty() && self.names.is_empty()
  }

  pub fn len(&self) -> usize { self.entities.len() + self.names.len() }
}

impl<K: Into<GroupKey>> FromIterator<K> for GroupSet {
  fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
    let mut set = Self::default();
    for key in iter {
      match key.into() {
        GroupKey::Entity(r) => {
          set.entities.insert(r);
        }
        GroupKey::Named(label) => {
          set.names.insert(label);
        }
      }
    }
    set
  }
}

// ─── Collections ─────────────────────────────────────────────────────────────

/// The distinct entities on one side of every membership matching a
/// criteria. Nothing is loaded until the engine executes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolymorphicCollection {
  pub criteria: Criteria,
  pub side:     Side,
}

/// Input accepted by [`Criteria::for_children`] and friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefSource {
  Keys(RefSet),
  /// Compiled to a subquery; equivalent to resolving the collection to
  /// concrete keys first.
  Collection(Box<PolymorphicCollection>),
}

impl From<EntityRef> for RefSource {
  fn from(r: EntityRef) -> Self { Self::Keys(std::iter::once(r).collect()) }
}

impl From<&EntityRef> for RefSource {
  fn from(r: &EntityRef) -> Self { Self::from(r.clone()) }
}

impl From<Vec<EntityRef>> for RefSource {
  fn from(refs: Vec<EntityRef>) -> Self { Self::Keys(refs.into_iter().collect()) }
}

impl From<&Vec<EntityRef>> for RefSource {
  fn from(refs: &Vec<EntityRef>) -> Self { Self::Keys(refs.iter().collect()) }
}

impl From<&[EntityRef]> for RefSource {
  fn from(refs: &[EntityRef]) -> Self { Self::Keys(refs.iter().collect()) }
}

impl<const N: usize> From<[EntityRef; N]> for RefSource {
  fn from(refs: [EntityRef; N]) -> Self { Self::Keys(refs.into_iter().collect()) }
}

impl From<RefSet> for RefSource {
  fn from(set: RefSet) -> Self { Self::Keys(set) }
}

impl From<PolymorphicCollection> for RefSource {
  fn from(c: PolymorphicCollection) -> Self { Self::Collection(Box::new(c)) }
}

// ─── Filters ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
  Entity,
  Named,
}

/// Set predicates over a member's groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetOp {
  /// Member of at least one of the groups.
  Any,
  /// Member of every group.
  All,
  /// Member of exactly these groups and no others of the same kind.
  Only,
}

/// One conjunct of a [`Criteria`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "filter", rename_all = "snake_case")]
pub enum Filter {
  Parent { group: GroupKey },
  Refs { side: Side, source: RefSource, negated: bool },
  GroupNames { names: BTreeSet<String> },
  GroupKind { kind: GroupKind },
  SideTypes { side: Side, types: BTreeSet<TypeName> },
  /// Matches on the type an entity was created as. Never collapsed to
  /// base types.
  ConcreteTypes { side: Side, types: BTreeSet<TypeName> },
  MembershipTypes { types: BTreeSet<String> },
  Plain,
  MemberSet {
    op:              SetOp,
    groups:          GroupSet,
    membership_type: Option<String>,
  },
}

impl Filter {
  fn map_types<F>(&self, f: &mut F) -> Result<Self>
  where
    F: FnMut(&TypeName) -> Result<TypeName>,
  {
    Ok(match self {
      Self::Parent { group: GroupKey::Entity(r) } => Self::Parent {
        group: GroupKey::Entity(EntityRef { type_name: f(&r.type_name)?, id: r.id }),
      },
      Self::Refs { side, source, negated } => Self::Refs {
        side:    *side,
        source:  match source {
          RefSource::Keys(set) => RefSource::Keys(set.map_types(f)?),
          RefSource::Collection(c) => {
            RefSource::Collection(Box::new(PolymorphicCollection {
              criteria: c.criteria.map_types(f)?,
              side:     c.side,
            }))
          }
        },
        negated: *negated,
      },
      Self::SideTypes { side, types } => Self::SideTypes {
        side:  *side,
        types: types.iter().map(|t| f(t)).collect::<Result<_>>()?,
      },
      Self::MemberSet { op, groups, membership_type } => Self::MemberSet {
        op:              *op,
        groups:          GroupSet {
          entities: groups.entities.map_types(f)?,
          names:    groups.names.clone(),
        },
        membership_type: membership_type.clone(),
      },
      other => other.clone(),
    })
  }
}

// ─── Criteria ────────────────────────────────────────────────────────────────

/// A lazily-evaluated query over membership rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criteria {
  filters: Vec<Filter>,
}

impl Criteria {
  /// Every membership row.
  pub fn new() -> Self { Self::default() }

  /// Rows whose group side is `group`.
  pub fn members_of(group: impl Into<GroupKey>) -> Self {
    Self::new().for_parent(group)
  }

  /// Rows whose member side is `member`.
  pub fn groups_of(member: &EntityRef) -> Self { Self::new().for_children(member) }

  pub fn filters(&self) -> &[Filter] { &self.filters }

  pub fn is_unfiltered(&self) -> bool { self.filters.is_empty() }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn for_parent(self, group: impl Into<GroupKey>) -> Self {
    self.filter(Filter::Parent { group: group.into() })
  }

  /// Rows whose entity group is one of `groups`.
  pub fn for_groups(self, groups: impl Into<RefSource>) -> Self {
    self.filter(Filter::Refs {
      side:    Side::Group,
      source:  groups.into(),
      negated: false,
    })
  }

  pub fn not_for_groups(self, groups: impl Into<RefSource>) -> Self {
    self.filter(Filter::Refs {
      side:    Side::Group,
      source:  groups.into(),
      negated: true,
    })
  }

  /// Rows whose member is one of `children`.
  pub fn for_children(self, children: impl Into<RefSource>) -> Self {
    self.filter(Filter::Refs {
      side:    Side::Member,
      source:  children.into(),
      negated: false,
    })
  }

  /// Rows whose member is not one of `children`, as a negated `IN`.
  pub fn not_for_children(self, children: impl Into<RefSource>) -> Self {
    self.filter(Filter::Refs {
      side:    Side::Member,
      source:  children.into(),
      negated: true,
    })
  }

  /// Restrict to the given membership types. No types leaves the criteria
  /// untouched.
  pub fn as_types<I, S>(self, types: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let types: BTreeSet<String> = types.into_iter().map(Into::into).collect();
    if types.is_empty() {
      return self;
    }
    self.filter(Filter::MembershipTypes { types })
  }

  /// Only untyped rows.
  pub fn plain(self) -> Self { self.filter(Filter::Plain) }

  /// Rows in any of the named groups.
  pub fn named<I, S>(self, labels: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.filter(Filter::GroupNames {
      names: labels.into_iter().map(Into::into).collect(),
    })
  }

  pub fn entity_groups(self) -> Self {
    self.filter(Filter::GroupKind { kind: GroupKind::Entity })
  }

  pub fn named_groups(self) -> Self {
    self.filter(Filter::GroupKind { kind: GroupKind::Named })
  }

  pub fn of_member_types<I, T>(self, types: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<TypeName>,
  {
    self.filter(Filter::SideTypes {
      side:  Side::Member,
      types: types.into_iter().map(Into::into).collect(),
    })
  }

  pub fn of_group_types<I, T>(self, types: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<TypeName>,
  {
    self.filter(Filter::SideTypes {
      side:  Side::Group,
      types: types.into_iter().map(Into::into).collect(),
    })
  }

  /// Rows whose entity on `side` was created as one of `types`. Subtypes
  /// are not expanded; pass them explicitly.
  pub fn of_concrete_types<I, T>(self, side: Side, types: I) -> Self
  where
    I: IntoIterator<Item = T>,
    T: Into<TypeName>,
  {
    self.filter(Filter::ConcreteTypes {
      side,
      types: types.into_iter().map(Into::into).collect(),
    })
  }

  /// Rows whose member belongs to at least one of `groups`.
  pub fn in_any<I, K>(self, groups: I, membership_type: Option<&str>) -> Self
  where
    I: IntoIterator<Item = K>,
    K: Into<GroupKey>,
  {
    self.member_set(SetOp::Any, groups, membership_type)
  }

  /// Rows whose member belongs to every one of `groups`.
  pub fn in_all<I, K>(self, groups: I, membership_type: Option<&str>) -> Self
  where
    I: IntoIterator<Item = K>,
    K: Into<GroupKey>,
  {
    self.member_set(SetOp::All, groups, membership_type)
  }

  /// Rows whose member's groups are exactly `groups`.
  pub fn in_only<I, K>(self, groups: I, membership_type: Option<&str>) -> Self
  where
    I: IntoIterator<Item = K>,
    K: Into<GroupKey>,
  {
    self.member_set(SetOp::Only, groups, membership_type)
  }

  fn member_set<I, K>(
    self,
    op: SetOp,
    groups: I,
    membership_type: Option<&str>,
  ) -> Self
  where
    I: IntoIterator<Item = K>,
    K: Into<GroupKey>,
  {
    self.filter(Filter::MemberSet {
      op,
      groups: groups.into_iter().collect(),
      membership_type: membership_type.map(str::to_owned),
    })
  }

  /// The distinct entities on `side` of the matching rows.
  pub fn polymorphic_collection(self, side: Side) -> PolymorphicCollection {
    PolymorphicCollection { criteria: self, side }
  }

  /// Rewrite every type name with `f`, merging id sets that collapse onto
  /// the same name.
  pub fn map_types<F>(&self, f: &mut F) -> Result<Self>
  where
    F: FnMut(&TypeName) -> Result<TypeName>,
  {
    let filters = self
      .filters
      .iter()
      .map(|filter| filter.map_types(f))
      .collect::<Result<_>>()?;
    Ok(Self { filters })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn user(n: u128) -> EntityRef { EntityRef::new("User", Uuid::from_u128(n)) }

  #[test]
  fn empty_type_filter_is_a_no_op() {
    let base = Criteria::members_of(GroupKey::named("staff"));
    assert_eq!(base.clone().as_types(Vec::<String>::new()), base);
    assert_ne!(base.clone().as_types(["admin"]), base);
  }

  #[test]
  fn children_are_grouped_by_type() {
    let widget = EntityRef::new("Widget", Uuid::from_u128(9));
    let c = Criteria::new().for_children(vec![user(1), widget.clone(), user(2), user(1)]);
    let Filter::Refs { source: RefSource::Keys(set), side, negated } = &c.filters()[0]
    else {
      panic!("expected a key filter");
    };
    assert_eq!(*side, Side::Member);
    assert!(!negated);
    assert_eq!(set.len(), 3);
    let types: Vec<_> = set.by_type().map(|(t, ids)| (t.as_str(), ids.len())).collect();
    assert_eq!(types, vec![("User", 2), ("Widget", 1)]);
    assert!(set.contains(&widget));
  }

  #[test]
  fn empty_children_still_filter() {
    let c = Criteria::new().for_children(Vec::<EntityRef>::new());
    assert!(!c.is_unfiltered());
  }

  #[test]
  fn group_sets_split_entities_and_labels() {
    let g = EntityRef::new("Group", Uuid::from_u128(7));
    let set: GroupSet =
      [GroupKey::from(&g), GroupKey::named("a"), GroupKey::named("a")].into_iter().collect();
    assert_eq!(set.len(), 2);
    assert!(set.entities.contains(&g));
  }

  #[test]
  fn map_types_merges_collapsed_types() {
    let manager = EntityRef::new("Manager", Uuid::from_u128(3));
    let c = Criteria::new()
      .for_children(vec![user(1), manager])
      .in_all([EntityRef::new("Organization", Uuid::from_u128(5))], Some("admin"));

    let mapped = c
      .map_types(&mut |t| {
        Ok(match t.as_str() {
          "Manager" => "User".into(),
          "Organization" => "Group".into(),
          _ => t.clone(),
        })
      })
      .unwrap();

    let Filter::Refs { source: RefSource::Keys(set), .. } = &mapped.filters()[0] else {
      panic!("expected a key filter");
    };
    assert_eq!(set.by_type().count(), 1);
    assert_eq!(set.len(), 2);

    let Filter::MemberSet { groups, membership_type, .. } = &mapped.filters()[1] else {
      panic!("expected a member set");
    };
    assert!(groups.entities.contains(&EntityRef::new("Group", Uuid::from_u128(5))));
    assert_eq!(membership_type.as_deref(), Some("admin"));
  }

  #[test]
  fn concrete_types_survive_normalisation() {
    let c = Criteria::new().of_concrete_types(Side::Member, ["Manager"]);
    let mapped = c.map_types(&mut |_| Ok("User".into())).unwrap();
    assert_eq!(mapped, c);
  }

  #[test]
  fn collections_nest_as_subqueries() {
    let inner = Criteria::members_of(GroupKey::named("ops")).polymorphic_collection(Side::Member);
    let c = Criteria::new().not_for_children(inner.clone());
    assert_eq!(
      c.filters()[0],
      Filter::Refs {
        side:    Side::Member,
        source:  RefSource::Collection(Box::new(inner)),
        negated: true,
      }
    );
  }
}
