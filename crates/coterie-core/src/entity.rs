//! Entities and polymorphic references.
//!
//! An entity is any domain object that takes part in a membership, either as
//! a group or as a member. The engine never sees the domain object itself;
//! it works with [`EntityRef`]s: a `(type, id)` pair standing in for a
//! foreign key into whichever table the type lives in.

use std::{borrow::Borrow, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::Result;

// ─── Type names ──────────────────────────────────────────────────────────────

/// The registered name of an entity type, e.g. `"User"` or `"Group"`.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TypeName(String);

impl TypeName {
  pub fn new(name: impl Into<String>) -> Self { Self(name.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for TypeName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl Borrow<str> for TypeName {
  fn borrow(&self) -> &str { &self.0 }
}

impl From<&str> for TypeName {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for TypeName {
  fn from(s: String) -> Self { Self(s) }
}

// ─── References ──────────────────────────────────────────────────────────────

/// A polymorphic reference to a persisted entity.
///
/// Once a reference has passed through the registry its `type_name` is the
/// *base* (storage) type, so a `Manager` and a `User` sharing one table
/// produce the same reference.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityRef {
  pub type_name: TypeName,
  pub id:        Uuid,
}

impl EntityRef {
  pub fn new(type_name: impl Into<TypeName>, id: Uuid) -> Self {
    Self { type_name: type_name.into(), id }
  }
}

impl fmt::Display for EntityRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}", self.type_name, self.id)
  }
}

/// Anything that can stand in for an entity instance.
pub trait Polymorphic {
  /// The concrete type name of this instance.
  fn type_name(&self) -> &str;
  fn entity_id(&self) -> Uuid;
}

/// A Rust type that maps onto one registered entity type.
pub trait PolymorphicType {
  const TYPE_NAME: &'static str;
}

impl Polymorphic for EntityRef {
  fn type_name(&self) -> &str { self.type_name.as_str() }

  fn entity_id(&self) -> Uuid { self.id }
}

// ─── Group side ──────────────────────────────────────────────────────────────

/// The group side of a membership: a persisted entity or a free-text label.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GroupKey {
  Entity(EntityRef),
  Named(String),
}

impl GroupKey {
  pub fn named(label: impl Into<String>) -> Self { Self::Named(label.into()) }

  pub fn as_entity(&self) -> Option<&EntityRef> {
    match self {
      Self::Entity(r) => Some(r),
      Self::Named(_) => None,
    }
  }
}

impl From<EntityRef> for GroupKey {
  fn from(r: EntityRef) -> Self { Self::Entity(r) }
}

impl From<&EntityRef> for GroupKey {
  fn from(r: &EntityRef) -> Self { Self::Entity(r.clone()) }
}

impl fmt::Display for GroupKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Entity(r) => fmt::Display::fmt(r, f),
      Self::Named(label) => write!(f, "@{label}"),
    }
  }
}

/// Which end of a membership a query or collection talks about.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString,
  Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Side {
  Group,
  Member,
}

// ─── Entity records ──────────────────────────────────────────────────────────

/// A persisted entity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
  pub reference:     EntityRef,
  /// The registered type the entity was created as; differs from
  /// `reference.type_name` for subtypes stored in their parent's table.
  pub concrete_type: TypeName,
  /// Opaque payload owned by the caller.
  pub data:          serde_json::Value,
  pub created_at:    DateTime<Utc>,
}

impl Entity {
  /// Deserialise the payload into the caller's domain type.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_value(self.data.clone())?)
  }
}

impl Polymorphic for Entity {
  fn type_name(&self) -> &str { self.concrete_type.as_str() }

  fn entity_id(&self) -> Uuid { self.reference.id }
}

/// Input to [`crate::engine::Memberships::create_entity`].
#[derive(Debug, Clone)]
pub struct NewEntity {
  pub type_name: TypeName,
  /// Caller-supplied id; a v4 UUID is generated when absent.
  pub id:        Option<Uuid>,
  pub data:      serde_json::Value,
}

impl NewEntity {
  pub fn new(type_name: impl Into<TypeName>) -> Self {
    Self {
      type_name: type_name.into(),
      id:        None,
      data:      serde_json::Value::Null,
    }
  }

  pub fn with_id(mut self, id: Uuid) -> Self {
    self.id = Some(id);
    self
  }

  /// Attach a serialisable payload.
  pub fn with_data<T: Serialize>(mut self, data: &T) -> Result<Self> {
    self.data = serde_json::to_value(data)?;
    Ok(self)
  }
}
