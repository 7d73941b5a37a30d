//! linedb is an embedded, file-backed document store.
//!
//! Every entity type lives in its own collection: a line-delimited JSON file where each
//! line is a master record pairing a generated key with the entity. On top of the files
//! sits an object layer with change tracking, relationships between collections and
//! predicate queries that filter raw lines before decoding them.
//!
//! ## Core Components
//! - [`schema`]: Statically declared field descriptors for entity types.
//! - [`serialization`]: Schema-driven encoding between entities and JSON trees.
//! - [`query`]: Predicates, combinators and partial parsing of record lines.
//! - [`engine`]: Collections, change tracking, relationships and the root [`Engine`].

pub mod engine;
pub mod query;
pub mod schema;
pub mod serialization;

use std::any::{Any, TypeId};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use engine::{
    CascadeAction, Collection, Engine, EngineConfig, KeyStrategy, Queryable, Tracked,
    TrackingState, UuidKeys,
};
pub use query::Query;
pub use schema::{Entity, Field, Schema};

/// The key of a master record.
pub type Key = String;

/// Errors returned by linedb.
#[derive(Error, Debug)]
pub enum Error {
    /// A required field had no value while encoding or decoding.
    #[error("required field `{field}` of `{entity}` has no value")]
    MissingRequiredField { entity: String, field: String },
    /// The handle does not belong to any tracker of the collection.
    #[error("entity is not tracked by collection `{collection}`")]
    NotTracked { collection: String },
    /// No reference field on the related type points back at the virtual field.
    #[error("`{entity}` has no reference field named `{field}`")]
    MissingReferenceField { entity: String, field: String },
    /// A field name does not resolve against the schema.
    #[error("`{entity}` has no field named `{field}`")]
    UnknownField { entity: String, field: String },
    /// A query names a virtual field, or a field inside a list.
    #[error("field `{field}` of `{entity}` cannot be queried")]
    NotQueryable { entity: String, field: String },
    /// A cascade action was configured for a field that is stored inline.
    #[error("field `{field}` of `{entity}` is not virtual")]
    NotVirtual { entity: String, field: String },
    /// The engine backing a collection is gone or was never attached.
    #[error("store is not initialized")]
    StoreNotInitialized,
    /// No collection was registered for the requested entity type or name.
    #[error("collection `{0}` is not registered")]
    CollectionNotRegistered(String),
    /// Each entity type can back at most one collection.
    #[error("entity type `{0}` is already registered")]
    DuplicateEntityType(String),
    /// Two collections would share a record file.
    #[error("collection name `{0}` is already in use")]
    DuplicateCollectionName(String),
    /// A schema built without fields. Types that encode themselves use `Schema::opaque`.
    #[error("schema of `{0}` has no fields")]
    EmptySchema(String),
    /// A line of a record file could not be read as a master record.
    #[error("collection `{collection}` is corrupt: {reason}")]
    FileCorrupt { collection: String, reason: String },
    /// A wire value did not fit the field it was decoded into.
    #[error("cannot decode `{entity}`: {reason}")]
    Decode { entity: String, reason: String },
    /// A pattern query holds an invalid regular expression.
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    /// An I/O error occurred while reading or writing a record file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for linedb operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Resolves collections and their configuration for the engine's collections.
///
/// Collections only see the registry through this trait, so relationship handling
/// never depends on the concrete [`Engine`].
pub trait Registry: Send + Sync {
    /// Directory that holds the record file of a registered collection.
    fn base_path(&self, collection: &str) -> Result<PathBuf>;

    /// Returns the type-erased collection registered for an entity type.
    fn lookup(&self, entity: TypeId, entity_name: &str) -> Result<Arc<dyn Any + Send + Sync>>;

    /// Delete action for a virtual field of a collection.
    fn cascade_action(&self, collection: &str, field: &str) -> CascadeAction;
}
