//! [`SqliteStore`], the SQLite implementation of [`MembershipStore`].

use std::{path::Path, time::Duration};

use chrono::Utc;
use coterie_core::{
  Criteria, Entity, EntityRef, GroupKey, Membership, NewMembership, RefSet,
  Side, TypeName,
  membership::InvalidRecord,
  store::{MembershipStore, MembershipTxn},
};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{RawEntity, RawMembership, decode_ref, encode_dt, encode_group, encode_uuid},
  query::{self, Sql},
  schema::SCHEMA,
  settings::StoreSettings,
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A membership store backed by a single SQLite file.
///
/// Cloning is cheap: the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    Self::init(conn, StoreSettings::default().busy_timeout()).await
  }

  /// Open an in-memory store, useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    Self::init(conn, StoreSettings::default().busy_timeout()).await
  }

  pub async fn open_with(settings: &StoreSettings) -> Result<Self> {
    let conn = match &settings.path {
      Some(path) => tokio_rusqlite::Connection::open(path).await?,
      None => tokio_rusqlite::Connection::open_in_memory().await?,
    };
    tracing::debug!(path = ?settings.path, "opening membership store");
    Self::init(conn, settings.busy_timeout()).await
  }

  async fn init(conn: tokio_rusqlite::Connection, busy_timeout: Duration) -> Result<Self> {
    conn
      .call(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(Self { conn })
  }
}

// ─── MembershipStore impl ────────────────────────────────────────────────────

impl MembershipStore for SqliteStore {
  async fn transact<F, T>(&self, work: F) -> coterie_core::Result<T>
  where
    F: FnOnce(&mut dyn MembershipTxn) -> coterie_core::Result<T> + Send + 'static,
    T: Send + 'static,
  {
    let outcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let outcome = work(&mut SqliteTxn { conn: &tx });
        match &outcome {
          Ok(_) => tx.commit()?,
          Err(e) => {
            tracing::debug!(error = %e, "rolling back");
            tx.rollback()?;
          }
        }
        Ok(outcome)
      })
      .await
      .map_err(Error::from)?;
    outcome
  }
}

// ─── Transaction ─────────────────────────────────────────────────────────────

/// [`MembershipTxn`] over an open SQLite transaction.
struct SqliteTxn<'a> {
  conn: &'a rusqlite::Connection,
}

impl SqliteTxn<'_> {
  fn query_memberships(&self, sql: &Sql) -> Result<Vec<Membership>> {
    let mut stmt = self.conn.prepare(&sql.text)?;
    let raws = stmt
      .query_map(rusqlite::params_from_iter(sql.params.iter()), RawMembership::from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter().map(RawMembership::into_membership).collect()
  }

  fn execute(&self, sql: &Sql) -> Result<u64> {
    let changed = self
      .conn
      .execute(&sql.text, rusqlite::params_from_iter(sql.params.iter()))
      .map_err(Error::from_sqlite)?;
    Ok(changed as u64)
  }

  fn lookup_concrete_type(&self, entity: &EntityRef) -> Result<Option<TypeName>> {
    let found: Option<String> = self
      .conn
      .query_row(
        "SELECT concrete_type FROM entities WHERE type_name = ?1 AND entity_id = ?2",
        rusqlite::params![entity.type_name.as_str(), encode_uuid(entity.id)],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.map(TypeName::new))
  }

  fn insert_entity_row(&self, entity: &Entity) -> Result<()> {
    self
      .conn
      .execute(
        "INSERT INTO entities (type_name, entity_id, concrete_type, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
          entity.reference.type_name.as_str(),
          encode_uuid(entity.reference.id),
          entity.concrete_type.as_str(),
          serde_json::to_string(&entity.data)?,
          encode_dt(entity.created_at),
        ],
      )
      .map_err(Error::from_sqlite)?;
    Ok(())
  }

  fn load_entity_rows(&self, refs: &RefSet) -> Result<Vec<Entity>> {
    let mut entities = Vec::with_capacity(refs.len());
    for (type_name, ids) in refs.by_type() {
      let sql = query::load_entities(type_name, ids);
      let mut stmt = self.conn.prepare(&sql.text)?;
      let raws = stmt
        .query_map(rusqlite::params_from_iter(sql.params.iter()), RawEntity::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
      for raw in raws {
        entities.push(raw.into_entity()?);
      }
    }
    Ok(entities)
  }

  fn insert_rows(&self, rows: &[NewMembership]) -> Result<Vec<Membership>> {
    let now = Utc::now();
    let now_str = encode_dt(now);
    let mut stmt = self.conn.prepare_cached(
      "INSERT INTO memberships (
         membership_id, member_type, member_id, group_type, group_id,
         group_name, membership_type, created_at, updated_at
       ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
    )?;

    let mut created = Vec::with_capacity(rows.len());
    for row in rows {
      let membership_id = Uuid::new_v4();
      let (group_type, group_id, group_name) = encode_group(&row.group);
      stmt
        .execute(rusqlite::params![
          encode_uuid(membership_id),
          row.member.type_name.as_str(),
          encode_uuid(row.member.id),
          group_type,
          group_id,
          group_name,
          row.membership_type,
          now_str,
        ])
        .map_err(Error::from_sqlite)?;

      created.push(Membership {
        membership_id,
        group: row.group.as_entity().cloned(),
        member: row.member.clone(),
        group_name: match &row.group {
          GroupKey::Named(label) => Some(label.clone()),
          GroupKey::Entity(_) => None,
        },
        membership_type: row.membership_type.clone(),
        created_at: now,
        updated_at: now,
      });
    }
    Ok(created)
  }

  fn refs(&self, criteria: &Criteria, side: Side) -> Result<Vec<EntityRef>> {
    let sql = query::distinct_refs(criteria, side);
    let mut stmt = self.conn.prepare(&sql.text)?;
    let pairs = stmt
      .query_map(rusqlite::params_from_iter(sql.params.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    pairs
      .into_iter()
      .map(|(type_name, id)| decode_ref(type_name, &id))
      .collect()
  }

  fn check_row(&self, row: &NewMembership) -> Result<Option<InvalidRecord>> {
    let reject = |reason: &str| {
      Some(InvalidRecord { record: row.clone(), reason: reason.to_owned() })
    };

    if let Err(invalid) = row.check() {
      return Ok(Some(invalid));
    }
    if self.lookup_concrete_type(&row.member)?.is_none() {
      return Ok(reject("member does not exist"));
    }
    match &row.group {
      GroupKey::Entity(group) if self.lookup_concrete_type(group)?.is_none() => {
        Ok(reject("group does not exist"))
      }
      _ => Ok(None),
    }
  }
}

impl MembershipTxn for SqliteTxn<'_> {
  fn insert_entity(&mut self, entity: &Entity) -> coterie_core::Result<()> {
    Ok(self.insert_entity_row(entity)?)
  }

  fn load_entities(&mut self, refs: &RefSet) -> coterie_core::Result<Vec<Entity>> {
    Ok(self.load_entity_rows(refs)?)
  }

  fn concrete_type(&mut self, entity: &EntityRef) -> coterie_core::Result<Option<TypeName>> {
    Ok(self.lookup_concrete_type(entity)?)
  }

  fn delete_entity(&mut self, entity: &EntityRef) -> coterie_core::Result<bool> {
    let deleted = self
      .conn
      .execute(
        "DELETE FROM entities WHERE type_name = ?1 AND entity_id = ?2",
        rusqlite::params![entity.type_name.as_str(), encode_uuid(entity.id)],
      )
      .map_err(Error::from)?;
    Ok(deleted > 0)
  }

  fn insert_batch(&mut self, rows: &[NewMembership]) -> coterie_core::Result<Vec<Membership>> {
    Ok(self.insert_rows(rows)?)
  }

  fn select(&mut self, criteria: &Criteria) -> coterie_core::Result<Vec<Membership>> {
    Ok(self.query_memberships(&query::select(criteria))?)
  }

  fn count(&mut self, criteria: &Criteria) -> coterie_core::Result<u64> {
    let sql = query::count(criteria);
    let n: i64 = self
      .conn
      .query_row(&sql.text, rusqlite::params_from_iter(sql.params.iter()), |row| {
        row.get(0)
      })
      .map_err(Error::from)?;
    Ok(n as u64)
  }

  fn distinct_refs(
    &mut self,
    criteria: &Criteria,
    side: Side,
  ) -> coterie_core::Result<Vec<EntityRef>> {
    Ok(self.refs(criteria, side)?)
  }

  fn delete_where(&mut self, criteria: &Criteria) -> coterie_core::Result<u64> {
    Ok(self.execute(&query::delete_where(criteria))?)
  }

  fn delete_ids(&mut self, ids: &[Uuid]) -> coterie_core::Result<u64> {
    if ids.is_empty() {
      return Ok(0);
    }
    Ok(self.execute(&query::delete_ids(ids))?)
  }

  fn repoint_groups(
    &mut self,
    criteria: &Criteria,
    to: &EntityRef,
  ) -> coterie_core::Result<u64> {
    let sql = query::repoint_groups(criteria, to, encode_dt(Utc::now()));
    Ok(self.execute(&sql)?)
  }

  /// Model checks plus referential checks: both sides must exist.
  fn validate(&mut self, row: &NewMembership) -> coterie_core::Result<Option<InvalidRecord>> {
    Ok(self.check_row(row)?)
  }
}
