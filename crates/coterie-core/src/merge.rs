//! The group merge engine.

use std::collections::{BTreeSet, HashSet};

use crate::{
  Error, Result,
  criteria::Criteria,
  entity::{EntityRef, Side, TypeName},
  membership::MergeReport,
  registry::Registry,
  store::MembershipTxn,
};

/// Move every membership of `source` onto `destination`, then delete
/// `source`.
///
/// The merge is refused when a member type that `destination` does not
/// accept is actually in use in `source`; declared but unused types do not
/// block it. Source rows the destination already has (same member and type)
/// are dropped instead of moved. Run inside one transaction: any error
/// leaves `source` untouched.
pub fn merge_groups(
  txn: &mut dyn MembershipTxn,
  registry: &Registry,
  source: &EntityRef,
  destination: &EntityRef,
) -> Result<MergeReport> {
  if source == destination {
    return Err(Error::SelfMerge(source.clone()));
  }
  let source_type = txn
    .concrete_type(source)?
    .ok_or_else(|| Error::EntityNotFound(source.clone()))?;
  let destination_type = txn
    .concrete_type(destination)?
    .ok_or_else(|| Error::EntityNotFound(destination.clone()))?;

  let in_source = Criteria::members_of(source);
  let members = txn.distinct_refs(&in_source, Side::Member)?;

  let accepted = registry.member_classes(destination_type.as_str())?;
  if !accepted.is_empty() {
    let declared = registry.member_classes(source_type.as_str())?;
    let candidates: BTreeSet<TypeName> = if declared.is_empty() {
      members.iter().map(|m| m.type_name.clone()).collect()
    } else {
      declared.difference(accepted).cloned().collect()
    };

    let mut orphaned = Vec::new();
    for class in candidates.into_iter().filter(|c| !accepted.contains(c)) {
      let in_use = in_source.clone().of_member_types([class.clone()]);
      if txn.count(&in_use)? > 0 {
        orphaned.push(class);
      }
    }
    if !orphaned.is_empty() {
      return Err(Error::IncompatibleMerge {
        source_group: source.clone(),
        destination:  destination.clone(),
        types:        orphaned,
      });
    }
  }

  let taken: HashSet<(EntityRef, Option<String>)> = if members.is_empty() {
    HashSet::new()
  } else {
    txn
      .select(&Criteria::members_of(destination).for_children(members.clone()))?
      .into_iter()
      .map(|row| (row.member, row.membership_type))
      .collect()
  };

  let duplicates: Vec<_> = txn
    .select(&in_source)?
    .into_iter()
    .filter(|row| {
      &row.member == destination
        || taken.contains(&(row.member.clone(), row.membership_type.clone()))
    })
    .map(|row| row.membership_id)
    .collect();
  let collapsed = if duplicates.is_empty() {
    0
  } else {
    txn.delete_ids(&duplicates)?
  };

  let moved = txn.repoint_groups(&in_source, destination)?;
  txn.delete_entity(source)?;

  tracing::info!(%source, %destination, moved, collapsed, "groups merged");
  Ok(MergeReport { moved, collapsed, members })
}
