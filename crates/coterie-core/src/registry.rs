//! The polymorphic resolver: an immutable registry of entity types.
//!
//! Each group or member type is declared once at startup through
//! [`RegistryBuilder`]. The built [`Registry`] answers three questions for
//! the rest of the engine:
//!
//! - which *base* type a name collapses to (single-table inheritance: a
//!   subtype shares its storage type with its topmost non-abstract
//!   ancestor),
//! - which member types a group type accepts (own declarations plus
//!   everything inherited), and
//! - which member type an association name maps to.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::{
  Error, Result,
  criteria::Criteria,
  entity::{EntityRef, GroupKey, Polymorphic, PolymorphicType, TypeName},
};

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors that can occur while building a [`Registry`].
#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("duplicate type name: {0}")]
  DuplicateType(TypeName),

  #[error("{type_name} inherits from unknown type {parent}")]
  UnknownParent { type_name: TypeName, parent: TypeName },

  #[error("inheritance cycle detected involving type: {0}")]
  InheritanceCycle(TypeName),

  #[error("{type_name} refers to unknown type {class}")]
  UnknownClass { type_name: TypeName, class: TypeName },

  #[error("{type_name} declares association {association:?} twice")]
  DuplicateAssociation { type_name: TypeName, association: String },
}

// ─── Declarations ────────────────────────────────────────────────────────────

/// How an unknown type name is handled at a particular call site.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Resolution {
  /// Fail with [`Error::TypeResolution`].
  #[default]
  Strict,
  /// Resolve this type instead.
  Fallback(TypeName),
}

/// A member type accepted by a group type under an association name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAssociation {
  /// e.g. `"users"` or `"managers"`.
  pub name:  String,
  pub class: TypeName,
}

/// Group-side declarations. Empty `associations` means the group accepts
/// members of any type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupConfig {
  pub associations:   Vec<MemberAssociation>,
  pub default_member: Option<TypeName>,
}

/// Member-side declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberConfig {
  pub default_group: Option<TypeName>,
}

/// Everything declared about one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
  pub name:        TypeName,
  pub parent:      Option<TypeName>,
  /// Abstract types own no storage, so they never become a base type for
  /// their subtypes.
  pub is_abstract: bool,
  pub group:       GroupConfig,
  pub member:      MemberConfig,
}

impl TypeDescriptor {
  pub fn new(name: impl Into<TypeName>) -> Self {
    Self {
      name:        name.into(),
      parent:      None,
      is_abstract: false,
      group:       GroupConfig::default(),
      member:      MemberConfig::default(),
    }
  }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Collects type declarations and validates them into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
  types: Vec<TypeDescriptor>,
}

impl RegistryBuilder {
  pub fn new() -> Self { Self::default() }

  /// Start declaring a type.
  pub fn add_type(&mut self, name: impl Into<TypeName>) -> TypeBuilder<'_> {
    TypeBuilder { builder: self, descriptor: TypeDescriptor::new(name) }
  }

  /// Register a fully-formed descriptor.
  pub fn register(&mut self, descriptor: TypeDescriptor) -> &mut Self {
    self.types.push(descriptor);
    self
  }

  pub fn build(self) -> Result<Registry, RegistryError> {
    let mut types: HashMap<TypeName, TypeDescriptor> = HashMap::new();
    for descriptor in self.types {
      if types.contains_key(&descriptor.name) {
        return Err(RegistryError::DuplicateType(descriptor.name));
      }
      types.insert(descriptor.name.clone(), descriptor);
    }

    for descriptor in types.values() {
      if let Some(parent) = &descriptor.parent
        && !types.contains_key(parent)
      {
        return Err(RegistryError::UnknownParent {
          type_name: descriptor.name.clone(),
          parent:    parent.clone(),
        });
      }
    }

    // Ancestor chains, nearest first: [self, parent, ..., root].
    let mut chains: HashMap<TypeName, Vec<TypeName>> = HashMap::new();
    for name in types.keys() {
      chains.insert(name.clone(), ancestry(&types, name)?);
    }

    let mut descendants: HashMap<TypeName, BTreeSet<TypeName>> = HashMap::new();
    for (name, chain) in &chains {
      for ancestor in chain {
        descendants.entry(ancestor.clone()).or_default().insert(name.clone());
      }
    }

    let mut base = HashMap::new();
    for (name, chain) in &chains {
      let storage = chain
        .iter()
        .rev()
        .find(|t| !types[*t].is_abstract)
        .unwrap_or(name);
      base.insert(name.clone(), storage.clone());
    }

    let mut member_classes = HashMap::new();
    let mut associations = HashMap::new();
    let mut default_member = HashMap::new();
    let mut default_group = HashMap::new();

    for (name, chain) in &chains {
      let mut classes = BTreeSet::new();
      let mut by_name: BTreeMap<String, TypeName> = BTreeMap::new();

      // Root first so that subtypes override inherited association names.
      for ancestor in chain.iter().rev() {
        let descriptor = &types[ancestor];
        let mut seen = HashSet::new();
        for assoc in &descriptor.group.associations {
          if !seen.insert(assoc.name.as_str()) {
            return Err(RegistryError::DuplicateAssociation {
              type_name:   ancestor.clone(),
              association: assoc.name.clone(),
            });
          }
          let class_base = base.get(&assoc.class).ok_or_else(|| {
            RegistryError::UnknownClass {
              type_name: ancestor.clone(),
              class:     assoc.class.clone(),
            }
          })?;
          classes.insert(class_base.clone());
          by_name.insert(assoc.name.clone(), assoc.class.clone());
        }
      }

      let nearest_member =
        chain.iter().find_map(|t| types[t].group.default_member.as_ref());
      let nearest_group =
        chain.iter().find_map(|t| types[t].member.default_group.as_ref());

      for class in nearest_member.iter().chain(nearest_group.iter()) {
        if !types.contains_key(*class) {
          return Err(RegistryError::UnknownClass {
            type_name: name.clone(),
            class:     (*class).clone(),
          });
        }
      }

      if let Some(class) = nearest_member {
        default_member.insert(name.clone(), class.clone());
      }
      if let Some(class) = nearest_group {
        default_group.insert(name.clone(), class.clone());
      }
      member_classes.insert(name.clone(), classes);
      associations.insert(name.clone(), by_name);
    }

    Ok(Registry {
      types,
      base,
      member_classes,
      associations,
      default_member,
      default_group,
      descendants,
    })
  }
}

fn ancestry(
  types: &HashMap<TypeName, TypeDescriptor>,
  name: &TypeName,
) -> Result<Vec<TypeName>, RegistryError> {
  let mut chain = vec![name.clone()];
  let mut seen = HashSet::from([name.clone()]);
  let mut current = name;
  while let Some(parent) = &types[current].parent {
    if !seen.insert(parent.clone()) {
      return Err(RegistryError::InheritanceCycle(name.clone()));
    }
    chain.push(parent.clone());
    current = parent;
  }
  Ok(chain)
}

/// Fluent declaration of a single type; finish with [`TypeBuilder::done`].
pub struct TypeBuilder<'a> {
  builder:    &'a mut RegistryBuilder,
  descriptor: TypeDescriptor,
}

impl<'a> TypeBuilder<'a> {
  pub fn inherits(mut self, parent: impl Into<TypeName>) -> Self {
    self.descriptor.parent = Some(parent.into());
    self
  }

  pub fn abstract_type(mut self) -> Self {
    self.descriptor.is_abstract = true;
    self
  }

  /// Accept members of `class` under the association `name`.
  pub fn accepts(
    mut self,
    name: impl Into<String>,
    class: impl Into<TypeName>,
  ) -> Self {
    self.descriptor.group.associations.push(MemberAssociation {
      name:  name.into(),
      class: class.into(),
    });
    self
  }

  pub fn default_member(mut self, class: impl Into<TypeName>) -> Self {
    self.descriptor.group.default_member = Some(class.into());
    self
  }

  pub fn default_group(mut self, class: impl Into<TypeName>) -> Self {
    self.descriptor.member.default_group = Some(class.into());
    self
  }

  pub fn done(self) -> &'a mut RegistryBuilder {
    let Self { builder, descriptor } = self;
    builder.register(descriptor)
  }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// Immutable type lookup shared by the mutator, the merge engine and the
/// query normaliser.
#[derive(Debug)]
pub struct Registry {
  types:          HashMap<TypeName, TypeDescriptor>,
  /// Every registered name to its storage type.
  base:           HashMap<TypeName, TypeName>,
  /// Accepted member base types, inherited declarations included.
  member_classes: HashMap<TypeName, BTreeSet<TypeName>>,
  associations:   HashMap<TypeName, BTreeMap<String, TypeName>>,
  default_member: HashMap<TypeName, TypeName>,
  default_group:  HashMap<TypeName, TypeName>,
  /// Every registered name to itself plus all of its subtypes.
  descendants:    HashMap<TypeName, BTreeSet<TypeName>>,
}

impl Registry {
  pub fn builder() -> RegistryBuilder { RegistryBuilder::new() }

  pub fn descriptor(&self, name: &str) -> Option<&TypeDescriptor> {
    self.types.get(name)
  }

  pub fn contains(&self, name: &str) -> bool { self.types.contains_key(name) }

  /// The registered name `name` stands for: itself when registered,
  /// otherwise whatever `resolution` allows.
  pub fn registered(&self, name: &str, resolution: &Resolution) -> Result<TypeName> {
    if let Some((registered, _)) = self.types.get_key_value(name) {
      return Ok(registered.clone());
    }
    match resolution {
      Resolution::Strict => Err(Error::TypeResolution(name.to_owned())),
      Resolution::Fallback(fallback) if self.contains(fallback.as_str()) => {
        Ok(fallback.clone())
      }
      Resolution::Fallback(fallback) => Err(Error::TypeResolution(fallback.to_string())),
    }
  }

  /// Map a type name to its base type.
  pub fn resolve_type(
    &self,
    name: &str,
    resolution: &Resolution,
  ) -> Result<TypeName> {
    let registered = self.registered(name, resolution)?;
    Ok(self.base[&registered].clone())
  }

  /// Strict variant of [`Registry::resolve_type`].
  pub fn resolve_base_type(&self, name: &TypeName) -> Result<TypeName> {
    self.resolve_type(name.as_str(), &Resolution::Strict)
  }

  pub fn resolve_class<T: PolymorphicType>(&self) -> Result<TypeName> {
    self.resolve_type(T::TYPE_NAME, &Resolution::Strict)
  }

  /// Build the canonical reference for an entity instance.
  pub fn resolve<E: Polymorphic + ?Sized>(
    &self,
    entity: &E,
    resolution: &Resolution,
  ) -> Result<EntityRef> {
    Ok(EntityRef {
      type_name: self.resolve_type(entity.type_name(), resolution)?,
      id:        entity.entity_id(),
    })
  }

  pub fn resolve_group(
    &self,
    key: &GroupKey,
    resolution: &Resolution,
  ) -> Result<GroupKey> {
    Ok(match key {
      GroupKey::Entity(r) => GroupKey::Entity(self.resolve(r, resolution)?),
      GroupKey::Named(label) => GroupKey::Named(label.clone()),
    })
  }

  /// Base types accepted by `group_type`. Empty means unrestricted.
  pub fn member_classes(&self, group_type: &str) -> Result<&BTreeSet<TypeName>> {
    self
      .member_classes
      .get(group_type)
      .ok_or_else(|| Error::TypeResolution(group_type.to_owned()))
  }

  pub fn accepts(&self, group_type: &str, member_base: &TypeName) -> Result<bool> {
    let classes = self.member_classes(group_type)?;
    Ok(classes.is_empty() || classes.contains(member_base))
  }

  /// The declared member class behind `association` on `group_type`.
  ///
  /// The class is returned as declared, not collapsed to its base type.
  /// Unknown names fall back to the group's default member class before
  /// `resolution` is consulted.
  pub fn resolve_association(
    &self,
    group_type: &str,
    association: &str,
    resolution: &Resolution,
  ) -> Result<TypeName> {
    let declared = self
      .associations
      .get(group_type)
      .and_then(|by_name| by_name.get(association))
      .or_else(|| self.default_member.get(group_type));

    match declared {
      Some(class) => Ok(class.clone()),
      None => self.registered(association, resolution),
    }
  }

  /// `class` and every registered subtype of it.
  pub fn with_descendants(&self, class: &TypeName) -> Result<&BTreeSet<TypeName>> {
    self
      .descendants
      .get(class)
      .ok_or_else(|| Error::TypeResolution(class.to_string()))
  }

  pub fn default_member_class(&self, group_type: &str) -> Option<&TypeName> {
    self.default_member.get(group_type)
  }

  pub fn default_group_class(&self, member_type: &str) -> Option<&TypeName> {
    self.default_group.get(member_type)
  }

  /// Rewrite every type name in `criteria` to its base type.
  pub fn normalize(&self, criteria: &Criteria) -> Result<Criteria> {
    criteria.map_types(&mut |t| self.resolve_base_type(t))
  }
}

#[cfg(test)]
mod tests {
  use uuid::Uuid;

  use super::*;

  fn registry() -> Registry {
    let mut b = Registry::builder();
    b.add_type("Record").abstract_type().done();
    b.add_type("User").inherits("Record").default_group("Group").done();
    b.add_type("Manager").inherits("User").done();
    b.add_type("Widget").done();
    b.add_type("Group")
      .accepts("users", "User")
      .accepts("widgets", "Widget")
      .default_member("User")
      .done();
    b.add_type("Organization")
      .inherits("Group")
      .accepts("managers", "Manager")
      .accepts("groups", "Group")
      .done();
    b.build().expect("valid registry")
  }

  #[test]
  fn subtypes_collapse_to_topmost_concrete_ancestor() {
    let r = registry();
    let strict = Resolution::Strict;
    assert_eq!(r.resolve_type("Manager", &strict).unwrap().as_str(), "User");
    assert_eq!(r.resolve_type("User", &strict).unwrap().as_str(), "User");
    assert_eq!(r.resolve_type("Organization", &strict).unwrap().as_str(), "Group");
    // Abstract roots keep their own name.
    assert_eq!(r.resolve_type("Record", &strict).unwrap().as_str(), "Record");
  }

  #[test]
  fn unknown_type_is_strict_by_default() {
    let r = registry();
    let err = r.resolve_type("Ghost", &Resolution::Strict).unwrap_err();
    assert!(matches!(err, Error::TypeResolution(ref n) if n == "Ghost"));
  }

  #[test]
  fn fallback_resolves_the_fallback_type() {
    let r = registry();
    let resolved = r
      .resolve_type("Ghost", &Resolution::Fallback("Manager".into()))
      .unwrap();
    assert_eq!(resolved.as_str(), "User");

    let err = r
      .resolve_type("Ghost", &Resolution::Fallback("Phantom".into()))
      .unwrap_err();
    assert!(matches!(err, Error::TypeResolution(ref n) if n == "Phantom"));
  }

  #[test]
  fn resolve_instance_uses_base_type() {
    let r = registry();
    let id = Uuid::new_v4();
    let reference = r
      .resolve(&EntityRef::new("Manager", id), &Resolution::Strict)
      .unwrap();
    assert_eq!(reference, EntityRef::new("User", id));
  }

  #[test]
  fn member_classes_are_inherited_as_base_types() {
    let r = registry();
    let group: Vec<_> = r.member_classes("Group").unwrap().iter().cloned().collect();
    assert_eq!(group, vec![TypeName::from("User"), TypeName::from("Widget")]);

    let org = r.member_classes("Organization").unwrap();
    assert!(org.contains("Group"));
    assert!(org.contains("User"));
    assert!(org.contains("Widget"));
    assert!(r.member_classes("Widget").unwrap().is_empty());
  }

  #[test]
  fn accepts_is_unrestricted_without_declarations() {
    let r = registry();
    assert!(r.accepts("Widget", &"User".into()).unwrap());
    assert!(!r.accepts("Group", &"Group".into()).unwrap());
    assert!(r.accepts("Organization", &"Group".into()).unwrap());
  }

  #[test]
  fn associations_resolve_with_default_member_fallback() {
    let r = registry();
    let strict = Resolution::Strict;
    assert_eq!(
      r.resolve_association("Organization", "managers", &strict).unwrap().as_str(),
      "Manager"
    );
    assert_eq!(
      r.resolve_association("Organization", "widgets", &strict).unwrap().as_str(),
      "Widget"
    );
    // Unknown association on a group with a default member class.
    assert_eq!(
      r.resolve_association("Group", "people", &strict).unwrap().as_str(),
      "User"
    );
    // No default member class: the call site decides.
    assert!(r.resolve_association("Widget", "things", &strict).is_err());
    assert_eq!(
      r.resolve_association("Widget", "things", &Resolution::Fallback("Widget".into()))
        .unwrap()
        .as_str(),
      "Widget"
    );
  }

  #[test]
  fn descendants_include_the_class_itself() {
    let r = registry();
    let users: Vec<_> = r
      .with_descendants(&"User".into())
      .unwrap()
      .iter()
      .map(TypeName::as_str)
      .collect();
    assert_eq!(users, ["Manager", "User"]);

    let managers = r.with_descendants(&"Manager".into()).unwrap();
    assert_eq!(managers.len(), 1);
    assert!(r.with_descendants(&"Ghost".into()).is_err());
  }

  #[test]
  fn defaults_are_inherited() {
    let r = registry();
    assert_eq!(r.default_group_class("Manager").map(TypeName::as_str), Some("Group"));
    assert_eq!(
      r.default_member_class("Organization").map(TypeName::as_str),
      Some("User")
    );
  }

  #[test]
  fn build_rejects_bad_declarations() {
    let mut b = RegistryBuilder::new();
    b.add_type("A").done();
    b.add_type("A").done();
    assert!(matches!(b.build(), Err(RegistryError::DuplicateType(_))));

    let mut b = RegistryBuilder::new();
    b.add_type("A").inherits("Missing").done();
    assert!(matches!(b.build(), Err(RegistryError::UnknownParent { .. })));

    let mut b = RegistryBuilder::new();
    b.add_type("A").inherits("B").done();
    b.add_type("B").inherits("A").done();
    assert!(matches!(b.build(), Err(RegistryError::InheritanceCycle(_))));

    let mut b = RegistryBuilder::new();
    b.add_type("G").accepts("things", "Thing").done();
    assert!(matches!(b.build(), Err(RegistryError::UnknownClass { .. })));

    let mut b = RegistryBuilder::new();
    b.add_type("U").done();
    b.add_type("G").accepts("u", "U").accepts("u", "U").done();
    assert!(matches!(b.build(), Err(RegistryError::DuplicateAssociation { .. })));
  }
}
