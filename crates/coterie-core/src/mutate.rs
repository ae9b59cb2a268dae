//! The relationship mutator: batched adds and removes inside one
//! transaction.
//!
//! Everything here is synchronous and runs on the store's transaction; the
//! async boundary and cache invalidation live in [`crate::engine`].

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use crate::{
  Error, Result,
  criteria::{Criteria, RefSet},
  entity::{EntityRef, GroupKey, TypeName},
  membership::{AddOutcome, Destruction, Membership, NewMembership, Removal},
  registry::Registry,
  store::MembershipTxn,
};

/// One `(group, member)` relation to add or remove.
pub type Pair = (GroupKey, EntityRef);

fn by_group(pairs: impl IntoIterator<Item = Pair>) -> BTreeMap<GroupKey, RefSet> {
  let mut grouped: BTreeMap<GroupKey, RefSet> = BTreeMap::new();
  for (group, member) in pairs {
    grouped.entry(group).or_default().insert(member);
  }
  grouped
}

fn members(rows: &[Membership]) -> HashSet<&EntityRef> {
  rows.iter().map(|row| &row.member).collect()
}

/// Fail with [`Error::TypeMismatch`] if any entity group does not accept its
/// member. The group's concrete type decides which declarations apply.
pub fn check_member_types(
  txn: &mut dyn MembershipTxn,
  registry: &Registry,
  grouped: &BTreeMap<GroupKey, RefSet>,
) -> Result<()> {
  let mut concrete: HashMap<&EntityRef, TypeName> = HashMap::new();
  for (group, members) in grouped {
    let GroupKey::Entity(group_ref) = group else {
      continue;
    };
    let group_type = match concrete.get(group_ref) {
      Some(t) => t.clone(),
      None => {
        let t = txn
          .concrete_type(group_ref)?
          .unwrap_or_else(|| group_ref.type_name.clone());
        concrete.insert(group_ref, t.clone());
        t
      }
    };

    for member in members.refs() {
      if !registry.accepts(group_type.as_str(), &member.type_name)? {
        return Err(Error::TypeMismatch {
          group:    group.clone(),
          member,
          accepted: registry
            .member_classes(group_type.as_str())?
            .iter()
            .cloned()
            .collect(),
        });
      }
    }
  }
  Ok(())
}

/// Add every pair as a plain membership and, when `membership_type` is set,
/// as a typed one too.
///
/// Existing rows are left alone. Every prepared row is validated before the
/// first insert; a failure either raises [`Error::Validation`] or returns
/// [`AddOutcome::Rejected`], and in both cases nothing is written.
pub fn add_memberships(
  txn: &mut dyn MembershipTxn,
  registry: &Registry,
  pairs: Vec<Pair>,
  membership_type: Option<&str>,
  exception_on_invalidation: bool,
) -> Result<AddOutcome> {
  let grouped = by_group(pairs);
  if grouped.is_empty() {
    return Ok(AddOutcome::Unchanged);
  }
  check_member_types(txn, registry, &grouped)?;

  let mut plain = Vec::new();
  let mut typed: BTreeMap<GroupKey, Vec<NewMembership>> = BTreeMap::new();

  for (group, children) in &grouped {
    let scope = Criteria::members_of(group.clone()).for_children(children.clone());

    let existing = txn.select(&scope.clone().plain())?;
    let existing = members(&existing);
    for member in children.refs() {
      if !existing.contains(&member) {
        plain.push(NewMembership::plain(group.clone(), member));
      }
    }

    if let Some(kind) = membership_type {
      let existing = txn.select(&scope.as_types([kind]))?;
      let existing = members(&existing);
      for member in children.refs() {
        if !existing.contains(&member) {
          typed
            .entry(group.clone())
            .or_default()
            .push(NewMembership::typed(group.clone(), member, kind));
        }
      }
    }
  }

  for row in plain.iter().chain(typed.values().flatten()) {
    if let Some(invalid) = txn.validate(row)? {
      tracing::warn!(%invalid, "membership batch rejected");
      if exception_on_invalidation {
        return Err(Error::Validation(Box::new(invalid)));
      }
      return Ok(AddOutcome::Rejected(invalid));
    }
  }

  if plain.is_empty() && typed.is_empty() {
    return Ok(AddOutcome::Unchanged);
  }

  let mut created = if plain.is_empty() {
    Vec::new()
  } else {
    txn.insert_batch(&plain)?
  };
  for rows in typed.values() {
    created.extend(txn.insert_batch(rows)?);
  }

  tracing::debug!(
    plain = plain.len(),
    typed = created.len() - plain.len(),
    "memberships added"
  );
  Ok(AddOutcome::Added(created))
}

/// Remove the memberships for every pair. `None` removes every type;
/// relations that do not exist are ignored.
pub fn remove_memberships(
  txn: &mut dyn MembershipTxn,
  pairs: Vec<Pair>,
  membership_type: Option<&str>,
  mode: Destruction,
) -> Result<Removal> {
  let scopes: Vec<Criteria> = by_group(pairs)
    .into_iter()
    .map(|(group, children)| {
      Criteria::members_of(group)
        .for_children(children)
        .as_types(membership_type)
    })
    .collect();

  let removal = match mode {
    Destruction::Destroy => {
      let mut removed = Vec::new();
      for scope in &scopes {
        removed.extend(txn.select(scope)?);
      }
      let ids: Vec<Uuid> = removed.iter().map(|row| row.membership_id).collect();
      if !ids.is_empty() {
        txn.delete_ids(&ids)?;
      }
      Removal::Destroyed(removed)
    }
    Destruction::Delete => {
      let mut deleted = 0;
      for scope in &scopes {
        deleted += txn.delete_where(scope)?;
      }
      Removal::Deleted(deleted)
    }
  };

  tracing::debug!(removed = removal.count(), "memberships removed");
  Ok(removal)
}

