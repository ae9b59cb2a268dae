//! Compiles a [`Criteria`] into SQL over the `memberships` table.
//!
//! Text and parameters are appended together, so placeholders are plain
//! positional `?` and `params` is always in emission order. Subqueries get
//! fresh table aliases (`s1`, `s2`, ...) so nested criteria never capture an
//! outer row by accident.

use std::collections::BTreeSet;

use coterie_core::{
  Criteria, EntityRef, GroupKey, PolymorphicCollection, RefSet, Side, TypeName,
  criteria::{Filter, GroupKind, GroupSet, RefSource, SetOp},
};
use rusqlite::types::Value;
use uuid::Uuid;

use crate::encode::{MEMBERSHIP_COLUMNS, encode_uuid};

/// A SQL statement and its positional parameters.
#[derive(Debug, Default)]
pub struct Sql {
  pub text:   String,
  pub params: Vec<Value>,
  aliases:    usize,
}

impl Sql {
  fn push(&mut self, text: &str) -> &mut Self {
    self.text.push_str(text);
    self
  }

  fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
    self.text.push('?');
    self.params.push(value.into());
    self
  }

  /// `(?, ?, ...)` for a non-empty list.
  fn bind_list<I, V>(&mut self, values: I) -> &mut Self
  where
    I: IntoIterator<Item = V>,
    V: Into<Value>,
  {
    self.push("(");
    for (i, value) in values.into_iter().enumerate() {
      if i > 0 {
        self.push(", ");
      }
      self.bind(value);
    }
    self.push(")")
  }

  fn alias(&mut self) -> String {
    self.aliases += 1;
    format!("s{}", self.aliases)
  }

  // ── Criteria ──────────────────────────────────────────────────────────

  /// Append the conjunction of `criteria` for rows aliased `a`.
  fn criteria(&mut self, criteria: &Criteria, a: &str) {
    if criteria.is_unfiltered() {
      self.push("1");
      return;
    }
    for (i, filter) in criteria.filters().iter().enumerate() {
      if i > 0 {
        self.push(" AND ");
      }
      self.push("(");
      self.filter(filter, a);
      self.push(")");
    }
  }

  fn filter(&mut self, filter: &Filter, a: &str) {
    match filter {
      Filter::Parent { group } => self.group_key(group, a),
      Filter::Refs { side, source: RefSource::Keys(set), negated } => {
        if set.is_empty() {
          self.push("0");
        } else if *negated {
          self.push("NOT COALESCE((");
          self.ref_set(set, a, *side);
          self.push("), 0)");
        } else {
          self.ref_set(set, a, *side);
        }
      }
      Filter::Refs { side, source: RefSource::Collection(c), negated } => {
        if *negated {
          self.exists(c);
          self.push(" AND NOT COALESCE((");
          self.in_collection(c, a, *side);
          self.push("), 0)");
        } else {
          self.in_collection(c, a, *side);
        }
      }
      Filter::GroupNames { names } => {
        if names.is_empty() {
          self.push("0");
        } else {
          self.push(&format!("{a}.group_name IN "));
          self.bind_list(names.iter().cloned());
        }
      }
      Filter::GroupKind { kind: GroupKind::Entity } => {
        self.push(&format!("{a}.group_type IS NOT NULL"));
      }
      Filter::GroupKind { kind: GroupKind::Named } => {
        self.push(&format!("{a}.group_name IS NOT NULL"));
      }
      Filter::SideTypes { side, types } => {
        if types.is_empty() {
          self.push("0");
        } else {
          self.push(&format!("{a}.{side}_type IN "));
          self.bind_list(types.iter().map(ToString::to_string));
        }
      }
      Filter::ConcreteTypes { side, types } => {
        if types.is_empty() {
          self.push("0");
        } else {
          let e = self.alias();
          self.push(&format!(
            "EXISTS (SELECT 1 FROM entities {e} WHERE {e}.type_name = {a}.{side}_type \
             AND {e}.entity_id = {a}.{side}_id AND {e}.concrete_type IN "
          ));
          self.bind_list(types.iter().map(ToString::to_string));
          self.push(")");
        }
      }
      Filter::MembershipTypes { types } => {
        if types.is_empty() {
          self.push("1");
        } else {
          self.push(&format!("{a}.membership_type IN "));
          self.bind_list(types.iter().cloned());
        }
      }
      Filter::Plain => {
        self.push(&format!("{a}.membership_type IS NULL"));
      }
      Filter::MemberSet { op, groups, membership_type } => {
        if groups.is_empty() {
          self.push("0");
        } else {
          self.member_set(*op, groups, membership_type.as_deref(), a);
        }
      }
    }
  }

  fn group_key(&mut self, group: &GroupKey, a: &str) {
    match group {
      GroupKey::Entity(r) => {
        self.push(&format!("{a}.group_type = "));
        self.bind(r.type_name.to_string());
        self.push(&format!(" AND {a}.group_id = "));
        self.bind(encode_uuid(r.id));
      }
      GroupKey::Named(label) => {
        self.push(&format!("{a}.group_name = "));
        self.bind(label.clone());
      }
    }
  }

  /// `(type = T1 AND id IN (...)) OR (type = T2 AND id IN (...))`
  fn ref_set(&mut self, set: &RefSet, a: &str, side: Side) {
    for (i, (type_name, ids)) in set.by_type().enumerate() {
      if i > 0 {
        self.push(" OR ");
      }
      self.push(&format!("({a}.{side}_type = "));
      self.bind(type_name.to_string());
      self.push(&format!(" AND {a}.{side}_id IN "));
      self.bind_list(ids.iter().copied().map(encode_uuid));
      self.push(")");
    }
  }

  fn in_collection(&mut self, c: &PolymorphicCollection, a: &str, side: Side) {
    let s = self.alias();
    let cs = c.side;
    self.push(&format!(
      "({a}.{side}_type, {a}.{side}_id) IN (SELECT {s}.{cs}_type, {s}.{cs}_id \
       FROM memberships {s} WHERE {s}.{cs}_type IS NOT NULL AND ("
    ));
    self.criteria(&c.criteria, &s);
    self.push("))");
  }

  fn exists(&mut self, c: &PolymorphicCollection) {
    let s = self.alias();
    let cs = c.side;
    self.push(&format!(
      "EXISTS (SELECT 1 FROM memberships {s} WHERE {s}.{cs}_type IS NOT NULL AND ("
    ));
    self.criteria(&c.criteria, &s);
    self.push("))");
  }

  /// Rows of alias `s` whose group is in `groups`.
  fn group_set(&mut self, groups: &GroupSet, s: &str) {
    let mut first = true;
    for (type_name, ids) in groups.entities.by_type() {
      if !first {
        self.push(" OR ");
      }
      first = false;
      self.push(&format!("({s}.group_type = "));
      self.bind(type_name.to_string());
      self.push(&format!(" AND {s}.group_id IN "));
      self.bind_list(ids.iter().copied().map(encode_uuid));
      self.push(")");
    }
    if !groups.names.is_empty() {
      if !first {
        self.push(" OR ");
      }
      self.push(&format!("{s}.group_name IN "));
      self.bind_list(groups.names.iter().cloned());
    }
  }

  fn typed(&mut self, membership_type: Option<&str>, s: &str) {
    if let Some(kind) = membership_type {
      self.push(&format!(" AND {s}.membership_type = "));
      self.bind(kind.to_owned());
    }
  }

  fn member_set(
    &mut self,
    op: SetOp,
    groups: &GroupSet,
    membership_type: Option<&str>,
    a: &str,
  ) {
    let s = self.alias();
    self.push(&format!(
      "({a}.member_type, {a}.member_id) IN (SELECT {s}.member_type, {s}.member_id \
       FROM memberships {s} WHERE ("
    ));
    self.group_set(groups, &s);
    self.push(")");
    self.typed(membership_type, &s);

    if op != SetOp::Any {
      self.push(&format!(
        " GROUP BY {s}.member_type, {s}.member_id \
         HAVING COUNT(DISTINCT COALESCE({s}.group_type || ':' || {s}.group_id, \
         '@' || {s}.group_name)) = "
      ));
      self.bind(groups.len() as i64);
    }
    self.push(")");

    if op == SetOp::Only {
      let t = self.alias();
      self.push(&format!(
        " AND ({a}.member_type, {a}.member_id) NOT IN (SELECT {t}.member_type, \
         {t}.member_id FROM memberships {t} WHERE NOT COALESCE(("
      ));
      self.group_set(groups, &t);
      self.push("), 0)");
      self.typed(membership_type, &t);
      if groups.names.is_empty() {
        self.push(&format!(" AND {t}.group_type IS NOT NULL"));
      } else if groups.entities.is_empty() {
        self.push(&format!(" AND {t}.group_name IS NOT NULL"));
      }
      self.push(")");
    }
  }
}

// ─── Statements ──────────────────────────────────────────────────────────────

fn statement(head: &str, criteria: &Criteria, tail: &str) -> Sql {
  let mut sql = Sql::default();
  sql.push(head);
  sql.criteria(criteria, "m");
  sql.push(tail);
  sql
}

pub fn select(criteria: &Criteria) -> Sql {
  statement(
    &format!("SELECT {MEMBERSHIP_COLUMNS} FROM memberships m WHERE "),
    criteria,
    " ORDER BY m.created_at, m.membership_id",
  )
}

pub fn count(criteria: &Criteria) -> Sql {
  statement("SELECT COUNT(*) FROM memberships m WHERE ", criteria, "")
}

pub fn distinct_refs(criteria: &Criteria, side: Side) -> Sql {
  statement(
    &format!(
      "SELECT DISTINCT m.{side}_type, m.{side}_id FROM memberships m \
       WHERE m.{side}_type IS NOT NULL AND ("
    ),
    criteria,
    ") ORDER BY 1, 2",
  )
}

pub fn delete_where(criteria: &Criteria) -> Sql {
  statement(
    "DELETE FROM memberships WHERE membership_id IN \
     (SELECT m.membership_id FROM memberships m WHERE ",
    criteria,
    ")",
  )
}

pub fn delete_ids(ids: &[Uuid]) -> Sql {
  let mut sql = Sql::default();
  sql.push("DELETE FROM memberships WHERE membership_id IN ");
  sql.bind_list(ids.iter().copied().map(encode_uuid));
  sql
}

/// One lookup for every entity of a single base type.
pub fn load_entities(type_name: &TypeName, ids: &BTreeSet<Uuid>) -> Sql {
  let mut sql = Sql::default();
  sql.push(
    "SELECT type_name, entity_id, concrete_type, data, created_at \
     FROM entities WHERE type_name = ",
  );
  sql.bind(type_name.to_string());
  sql.push(" AND entity_id IN ");
  sql.bind_list(ids.iter().copied().map(encode_uuid));
  sql.push(" ORDER BY created_at, entity_id");
  sql
}

/// Point the group side of every matching row at `to`.
pub fn repoint_groups(criteria: &Criteria, to: &EntityRef, now: String) -> Sql {
  let mut sql = Sql::default();
  sql.push("UPDATE memberships SET group_type = ");
  sql.bind(to.type_name.to_string());
  sql.push(", group_id = ");
  sql.bind(encode_uuid(to.id));
  sql.push(", group_name = NULL, updated_at = ");
  sql.bind(now);
  sql.push(
    " WHERE membership_id IN (SELECT m.membership_id FROM memberships m WHERE ",
  );
  sql.criteria(criteria, "m");
  sql.push(")");
  sql
}

#[cfg(test)]
mod tests {
  use coterie_core::{EntityRef, GroupKey, Side};
  use uuid::Uuid;

  use super::*;

  fn placeholders(sql: &Sql) -> usize { sql.text.matches('?').count() }

  #[test]
  fn unfiltered_matches_everything() {
    let sql = count(&Criteria::new());
    assert!(sql.text.ends_with("WHERE 1"));
    assert!(sql.params.is_empty());
  }

  #[test]
  fn params_follow_placeholders() {
    let g = EntityRef::new("Group", Uuid::new_v4());
    let u = EntityRef::new("User", Uuid::new_v4());
    let w = EntityRef::new("Widget", Uuid::new_v4());
    let criteria = Criteria::members_of(&g)
      .for_children(vec![u.clone(), w])
      .as_types(["admin"]);

    let sql = select(&criteria);
    assert_eq!(placeholders(&sql), sql.params.len());
    assert_eq!(sql.params[0], Value::Text("Group".into()));
    assert_eq!(sql.params[1], Value::Text(encode_uuid(g.id)));
    assert_eq!(sql.params.last(), Some(&Value::Text("admin".into())));
  }

  #[test]
  fn empty_inputs_match_nothing() {
    let u = EntityRef::new("User", Uuid::new_v4());
    let negated = Criteria::groups_of(&u).not_for_groups(Vec::<EntityRef>::new());
    assert!(count(&negated).text.contains("(0)"));

    let none = Criteria::new().in_all(Vec::<GroupKey>::new(), None);
    assert!(count(&none).text.contains("(0)"));
  }

  #[test]
  fn repoint_binds_target_before_criteria() {
    let g = EntityRef::new("Group", Uuid::new_v4());
    let to = EntityRef::new("Group", Uuid::new_v4());
    let sql = repoint_groups(&Criteria::members_of(&g), &to, "now".into());

    assert_eq!(placeholders(&sql), sql.params.len());
    assert_eq!(sql.params[1], Value::Text(encode_uuid(to.id)));
    assert_eq!(sql.params[2], Value::Text("now".into()));
    assert_eq!(sql.params[4], Value::Text(encode_uuid(g.id)));
  }

  #[test]
  fn nested_collections_get_fresh_aliases() {
    let g = EntityRef::new("Group", Uuid::new_v4());
    let inner = Criteria::members_of(&g).polymorphic_collection(Side::Member);
    let outer = Criteria::new()
      .not_for_children(inner)
      .in_only([GroupKey::named("ops")], None);

    let sql = distinct_refs(&outer, Side::Group);
    for alias in ["s1", "s2", "s3", "s4"] {
      assert!(sql.text.contains(&format!("memberships {alias}")), "{alias}");
    }
    assert_eq!(placeholders(&sql), sql.params.len());
  }

  #[test]
  fn concrete_types_join_entities() {
    let g = EntityRef::new("Group", Uuid::new_v4());
    let criteria = Criteria::members_of(&g)
      .of_concrete_types(Side::Member, ["Manager", "Director"]);

    let sql = select(&criteria);
    assert!(sql.text.contains("FROM entities s1"));
    assert!(sql.text.contains("s1.concrete_type IN (?, ?)"));
    assert_eq!(placeholders(&sql), sql.params.len());

    let none = Criteria::members_of(&g).of_concrete_types(Side::Member, Vec::<TypeName>::new());
    assert!(count(&none).text.contains("(0)"));
  }
}
