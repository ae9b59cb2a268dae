//! Core types and the engine for polymorphic group memberships.
//!
//! This crate has no database dependencies. Storage backends implement
//! [`store::MembershipStore`]; everything else (type resolution, criteria,
//! the mutator, merging and relation caching) lives here.

pub mod cache;
pub mod criteria;
pub mod engine;
pub mod entity;
pub mod error;
pub mod membership;
pub mod merge;
pub mod mutate;
pub mod registry;
pub mod store;

pub use criteria::{Criteria, PolymorphicCollection, RefSet};
pub use engine::{AddOptions, Memberships};
pub use entity::{Entity, EntityRef, GroupKey, NewEntity, Side, TypeName};
pub use error::{Error, Result};
pub use membership::{AddOutcome, Destruction, MergeReport, Membership, NewMembership, Removal};
pub use registry::{Registry, Resolution};
