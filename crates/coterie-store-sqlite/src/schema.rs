//! SQL schema for the Coterie SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Entities are keyed by their base type; concrete_type keeps the subtype.
CREATE TABLE IF NOT EXISTS entities (
    type_name     TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    concrete_type TEXT NOT NULL,
    data          TEXT NOT NULL DEFAULT 'null',
    created_at    TEXT NOT NULL,
    PRIMARY KEY (type_name, entity_id)
);

-- Exactly one of (group_type, group_id) and group_name is set.
CREATE TABLE IF NOT EXISTS memberships (
    membership_id   TEXT PRIMARY KEY,
    member_type     TEXT NOT NULL,
    member_id       TEXT NOT NULL,
    group_type      TEXT,
    group_id        TEXT,
    group_name      TEXT,
    membership_type TEXT,            -- NULL for plain memberships
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    FOREIGN KEY (member_type, member_id)
        REFERENCES entities(type_name, entity_id) ON DELETE CASCADE,
    FOREIGN KEY (group_type, group_id)
        REFERENCES entities(type_name, entity_id) ON DELETE CASCADE,
    CHECK ((group_type IS NULL) = (group_id IS NULL)),
    CHECK ((group_type IS NULL) != (group_name IS NULL)),
    CHECK (NOT (member_type IS group_type AND member_id IS group_id))
);

CREATE INDEX IF NOT EXISTS memberships_member_idx
    ON memberships(member_type, member_id);
CREATE INDEX IF NOT EXISTS memberships_group_idx
    ON memberships(group_type, group_id);
CREATE INDEX IF NOT EXISTS memberships_name_idx
    ON memberships(group_name);

-- NULLs never collide in a plain UNIQUE index, so fold them to ''.
CREATE UNIQUE INDEX IF NOT EXISTS memberships_unique_idx ON memberships(
    member_type,
    member_id,
    IFNULL(group_type, ''),
    IFNULL(group_id, ''),
    IFNULL(group_name, ''),
    IFNULL(membership_type, '')
);

PRAGMA user_version = 1;
";
