//! Encoding and decoding helpers between the core model types and the plain
//! text stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings and UUIDs as hyphenated
//! lowercase strings. Entity payloads are stored as compact JSON.

use chrono::{DateTime, Utc};
use coterie_core::{Entity, EntityRef, GroupKey, Membership, TypeName};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Uuid ─────────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(e.to_string()))
}

// ─── Group side ──────────────────────────────────────────────────────────────

/// The `(group_type, group_id, group_name)` columns for a group key.
pub fn encode_group(
  group: &GroupKey,
) -> (Option<String>, Option<String>, Option<String>) {
  match group {
    GroupKey::Entity(r) => {
      (Some(r.type_name.to_string()), Some(encode_uuid(r.id)), None)
    }
    GroupKey::Named(label) => (None, None, Some(label.clone())),
  }
}

pub fn decode_ref(type_name: String, id: &str) -> Result<EntityRef> {
  Ok(EntityRef { type_name: TypeName::new(type_name), id: decode_uuid(id)? })
}

// ─── Row types ───────────────────────────────────────────────────────────────

/// Column list matching [`RawMembership::from_row`].
pub const MEMBERSHIP_COLUMNS: &str = "m.membership_id, m.member_type, m.member_id, \
   m.group_type, m.group_id, m.group_name, m.membership_type, m.created_at, \
   m.updated_at";

/// Raw strings read directly from a `memberships` row.
pub struct RawMembership {
  pub membership_id:   String,
  pub member_type:     String,
  pub member_id:       String,
  pub group_type:      Option<String>,
  pub group_id:        Option<String>,
  pub group_name:      Option<String>,
  pub membership_type: Option<String>,
  pub created_at:      String,
  pub updated_at:      String,
}

impl RawMembership {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      membership_id:   row.get(0)?,
      member_type:     row.get(1)?,
      member_id:       row.get(2)?,
      group_type:      row.get(3)?,
      group_id:        row.get(4)?,
      group_name:      row.get(5)?,
      membership_type: row.get(6)?,
      created_at:      row.get(7)?,
      updated_at:      row.get(8)?,
    })
  }

  pub fn into_membership(self) -> Result<Membership> {
    let group = match (self.group_type, self.group_id) {
      (Some(t), Some(id)) => Some(decode_ref(t, &id)?),
      _ => None,
    };

    Ok(Membership {
      membership_id: decode_uuid(&self.membership_id)?,
      group,
      member: decode_ref(self.member_type, &self.member_id)?,
      group_name: self.group_name,
      membership_type: self.membership_type,
      created_at: decode_dt(&self.created_at)?,
      updated_at: decode_dt(&self.updated_at)?,
    })
  }
}

/// Raw strings read directly from an `entities` row.
pub struct RawEntity {
  pub type_name:     String,
  pub entity_id:     String,
  pub concrete_type: String,
  pub data:          String,
  pub created_at:    String,
}

impl RawEntity {
  pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      type_name:     row.get(0)?,
      entity_id:     row.get(1)?,
      concrete_type: row.get(2)?,
      data:          row.get(3)?,
      created_at:    row.get(4)?,
    })
  }

  pub fn into_entity(self) -> Result<Entity> {
    Ok(Entity {
      reference:     decode_ref(self.type_name, &self.entity_id)?,
      concrete_type: TypeName::new(self.concrete_type),
      data:          serde_json::from_str(&self.data)?,
      created_at:    decode_dt(&self.created_at)?,
    })
  }
}

