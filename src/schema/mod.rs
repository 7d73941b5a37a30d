//! Statically declared schemas for entity types.
//!
//! An entity type implements [`Entity`] by returning a [`Schema`] built once, usually
//! inside a `OnceLock`. The schema lists the fields in wire order together with the
//! accessors that read and write them, which is all the serialization engine, the
//! query resolver and the relationship manager need to know about the type.
//!
//! ```ignore
//! impl Entity for Grade {
//!     fn schema() -> &'static Schema<Self> {
//!         static SCHEMA: OnceLock<Schema<Grade>> = OnceLock::new();
//!         SCHEMA.get_or_init(|| {
//!             Schema::builder("Grade", Grade::default)
//!                 .field(Field::scalar("course", |g: &Grade| &g.course, |g: &mut Grade, v| g.course = v))
//!                 .field(Field::reference("student_id", |g: &Grade| &g.student_id, |g: &mut Grade, v| g.student_id = v))
//!                 .build()
//!         })
//!     }
//! }
//! ```

mod field;

pub use field::{Field, FieldInfo, InitArgs, Shape};

use serde_json::Value;

use crate::Result;

/// A type that can be stored in a collection.
pub trait Entity: Sized + Send + Sync + 'static {
    fn schema() -> &'static Schema<Self>;
}

/// Type-erased view of a schema, used where the entity type is not known statically.
pub trait Describe: Send + Sync {
    fn entity_name(&self) -> &'static str;
    fn field_info(&self, name: &str) -> Option<&FieldInfo>;
}

/// How decoding produces a fresh entity.
pub(crate) enum Construct<T> {
    /// Start from a default value and assign every field.
    Assign(fn() -> T),
    /// Build from the decoded inputs, then assign the `no_init` fields.
    Init(fn(&mut InitArgs) -> Result<T>),
    /// No fields: the value is its own wire form.
    Opaque {
        encode: fn(&T) -> Result<Value>,
        decode: fn(Value) -> Result<T>,
    },
}

/// The ordered field descriptors of an entity type.
pub struct Schema<T> {
    name: &'static str,
    fields: Vec<Field<T>>,
    construct: Construct<T>,
}

impl<T: 'static> Schema<T> {
    /// Starts a schema whose entities are decoded by assigning fields into `default()`.
    pub fn builder(name: &'static str, default: fn() -> T) -> SchemaBuilder<T> {
        SchemaBuilder {
            name,
            fields: Vec::new(),
            construct: Construct::Assign(default),
        }
    }

    /// Starts a schema whose entities are decoded through a constructor function.
    pub fn builder_with_init(name: &'static str, init: fn(&mut InitArgs) -> Result<T>) -> SchemaBuilder<T> {
        SchemaBuilder {
            name,
            fields: Vec::new(),
            construct: Construct::Init(init),
        }
    }

    /// A schema without fields for values that encode themselves.
    pub fn opaque(name: &'static str, encode: fn(&T) -> Result<Value>, decode: fn(Value) -> Result<T>) -> Self {
        Self {
            name,
            fields: Vec::new(),
            construct: Construct::Opaque { encode, decode },
        }
    }

    /// Entity name used in errors and as the default collection name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Fields in declaration order, which is also their order on the wire.
    pub fn fields(&self) -> &[Field<T>] {
        &self.fields
    }

    /// Looks a field up by its Rust name.
    pub fn field(&self, name: &str) -> Option<&Field<T>> {
        self.fields.iter().find(|field| field.info().name == name)
    }

    /// True for schemas built with [`Schema::opaque`].
    pub fn is_opaque(&self) -> bool {
        matches!(self.construct, Construct::Opaque { .. })
    }

    pub(crate) fn construct(&self) -> &Construct<T> {
        &self.construct
    }
}

impl<T: 'static> Describe for Schema<T> {
    fn entity_name(&self) -> &'static str {
        self.name
    }

    fn field_info(&self, name: &str) -> Option<&FieldInfo> {
        self.field(name).map(Field::info)
    }
}

/// Collects fields for [`Schema::builder`] and [`Schema::builder_with_init`].
pub struct SchemaBuilder<T> {
    name: &'static str,
    fields: Vec<Field<T>>,
    construct: Construct<T>,
}

impl<T: 'static> SchemaBuilder<T> {
    pub fn field(mut self, field: Field<T>) -> Self {
        self.fields.push(field);
        self
    }

    pub fn build(self) -> Schema<T> {
        Schema {
            name: self.name,
            fields: self.fields,
            construct: self.construct,
        }
    }
}
