//! Membership records, the join rows between a group side and a member.
//!
//! A membership connects one group (an entity or a named label) to one
//! member entity, optionally qualified by a membership type. The untyped
//! ("plain") membership is its own row, distinct from every typed one, and
//! uniqueness holds on the `(group, member, type)` triple.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EntityRef, GroupKey};

// ─── Membership ──────────────────────────────────────────────────────────────

/// A persisted membership row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
  pub membership_id:   Uuid,
  /// `None` for named-group memberships.
  pub group:           Option<EntityRef>,
  pub member:          EntityRef,
  pub group_name:      Option<String>,
  /// `None` is the plain membership.
  pub membership_type: Option<String>,
  pub created_at:      DateTime<Utc>,
  pub updated_at:      DateTime<Utc>,
}

impl Membership {
  /// The group side of this row. Entity references win over labels when a
  /// row carries both.
  pub fn group_key(&self) -> Option<GroupKey> {
    match (&self.group, &self.group_name) {
      (Some(r), _) => Some(GroupKey::Entity(r.clone())),
      (None, Some(label)) => Some(GroupKey::Named(label.clone())),
      (None, None) => None,
    }
  }

  pub fn is_plain(&self) -> bool { self.membership_type.is_none() }
}

// ─── NewMembership ───────────────────────────────────────────────────────────

/// An unpersisted membership row prepared by the mutator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NewMembership {
  pub group:           GroupKey,
  pub member:          EntityRef,
  pub membership_type: Option<String>,
}

impl NewMembership {
  pub fn plain(group: GroupKey, member: EntityRef) -> Self {
    Self { group, member, membership_type: None }
  }

  pub fn typed(group: GroupKey, member: EntityRef, kind: impl Into<String>) -> Self {
    Self { group, member, membership_type: Some(kind.into()) }
  }

  /// The backend-independent part of the validation contract.
  pub fn check(&self) -> Result<(), InvalidRecord> {
    let reject = |reason: &str| {
      Err(InvalidRecord { record: self.clone(), reason: reason.to_owned() })
    };

    if self.member.type_name.as_str().trim().is_empty() {
      return reject("member type is blank");
    }
    match &self.group {
      GroupKey::Named(label) if label.trim().is_empty() => {
        return reject("group name is blank");
      }
      GroupKey::Entity(group) if group == &self.member => {
        return reject("an entity cannot be a member of itself");
      }
      _ => {}
    }
    if let Some(kind) = &self.membership_type
      && kind.trim().is_empty()
    {
      return reject("membership type is blank");
    }
    Ok(())
  }
}

/// A prepared row that failed validation, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidRecord {
  pub record: NewMembership,
  pub reason: String,
}

impl fmt::Display for InvalidRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} in {}", self.record.member, self.record.group)?;
    if let Some(kind) = &self.record.membership_type {
      write!(f, " as {kind:?}")?;
    }
    write!(f, ": {}", self.reason)
  }
}

// ─── Outcomes ────────────────────────────────────────────────────────────────

/// The result of an add operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
  /// Nothing to add: the input was empty or every row already existed.
  Unchanged,
  /// Rows were written; plain rows first, then typed rows.
  Added(Vec<Membership>),
  /// Validation failed and nothing was written.
  Rejected(InvalidRecord),
}

impl AddOutcome {
  /// `false` only when validation rejected the batch.
  pub fn succeeded(&self) -> bool { !matches!(self, Self::Rejected(_)) }

  pub fn created(&self) -> &[Membership] {
    match self {
      Self::Added(rows) => rows,
      _ => &[],
    }
  }
}

/// How removed memberships are deleted. Both modes are hard deletes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destruction {
  /// Load the matching rows, then delete them by id and return them.
  #[default]
  Destroy,
  /// Delete by criteria and return only the count.
  Delete,
}

/// The result of a remove operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removal {
  Destroyed(Vec<Membership>),
  Deleted(u64),
}

impl Removal {
  pub fn count(&self) -> u64 {
    match self {
      Self::Destroyed(rows) => rows.len() as u64,
      Self::Deleted(n) => *n,
    }
  }
}

/// Summary of a completed group merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
  /// Rows re-pointed from the source to the destination.
  pub moved:     u64,
  /// Source rows dropped because the destination already had them.
  pub collapsed: u64,
  /// Distinct members that belonged to the source.
  pub members:   Vec<EntityRef>,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn user() -> EntityRef { EntityRef::new("User", Uuid::new_v4()) }

  #[test]
  fn plain_row_passes_check() {
    let row = NewMembership::plain(GroupKey::named("staff"), user());
    assert!(row.check().is_ok());
  }

  #[test]
  fn blank_label_and_type_are_rejected() {
    let row = NewMembership::plain(GroupKey::named("  "), user());
    assert_eq!(row.check().unwrap_err().reason, "group name is blank");

    let group = EntityRef::new("Group", Uuid::new_v4());
    let row = NewMembership::typed(group.into(), user(), "");
    assert_eq!(row.check().unwrap_err().reason, "membership type is blank");
  }

  #[test]
  fn self_membership_is_rejected() {
    let g = EntityRef::new("Group", Uuid::new_v4());
    let row = NewMembership::plain(GroupKey::Entity(g.clone()), g);
    assert!(row.check().is_err());
  }

  #[test]
  fn group_key_prefers_entity() {
    let g = EntityRef::new("Group", Uuid::new_v4());
    let row = Membership {
      membership_id:   Uuid::new_v4(),
      group:           Some(g.clone()),
      member:          user(),
      group_name:      Some("label".into()),
      membership_type: None,
      created_at:      Utc::now(),
      updated_at:      Utc::now(),
    };
    assert_eq!(row.group_key(), Some(GroupKey::Entity(g)));
    assert!(row.is_plain());
  }
}
