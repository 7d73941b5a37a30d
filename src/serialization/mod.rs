//! Schema-driven conversion between entities and JSON trees.
//!
//! Nothing here knows about files or collections. [`encode`] walks the fields of an
//! entity's [`Schema`](crate::schema::Schema) and [`decode`] rebuilds the entity from
//! the same descriptors, so `decode(encode(x))` always re-encodes to the same tree.

mod opaque;

use serde_json::{Map, Value};

use crate::schema::{Construct, Entity, Field, FieldInfo, InitArgs, Schema};
use crate::{Error, Result};

/// Encodes an entity into its wire tree.
pub fn encode<T: Entity>(entity: &T) -> Result<Value> {
    let schema = T::schema();
    if let Construct::Opaque { encode, .. } = schema.construct() {
        return encode(entity);
    }
    ensure_fields(schema)?;

    let mut tree = Map::new();
    for field in schema.fields() {
        let info = field.info();
        let value = match field.read(entity)? {
            Some(value) => value,
            None if info.required => return Err(missing(schema, info)),
            None => info.default.map(|default| default()).unwrap_or(Value::Null),
        };
        tree.insert(info.wire_name.to_string(), value);
    }
    Ok(Value::Object(tree))
}

/// Decodes a wire tree into an entity. A null tree decodes to `None`.
pub fn decode<T: Entity>(tree: Value) -> Result<Option<T>> {
    if tree.is_null() {
        return Ok(None);
    }

    let schema = T::schema();
    match schema.construct() {
        Construct::Opaque { decode, .. } => decode(tree).map(Some),
        _ if schema.fields().is_empty() => Err(Error::EmptySchema(schema.name().to_string())),
        Construct::Assign(default) => {
            let mut input = into_object(schema, tree)?;
            let mut entity = default();
            for field in schema.fields() {
                if let Some(value) = take_input(schema, field.info(), &mut input)? {
                    assign(schema, field, &mut entity, value)?;
                }
            }
            Ok(Some(entity))
        }
        Construct::Init(init) => {
            let mut input = into_object(schema, tree)?;
            let mut args = InitArgs::new(schema.name());
            let mut deferred = Vec::new();
            for field in schema.fields() {
                let info = field.info();
                if let Some(value) = take_input(schema, info, &mut input)? {
                    if info.init {
                        args.insert(info.name, value);
                    } else {
                        deferred.push((field, value));
                    }
                }
            }

            let mut entity = init(&mut args).map_err(|e| decode_error(schema, e))?;
            for (field, value) in deferred {
                assign(schema, field, &mut entity, value)?;
            }
            Ok(Some(entity))
        }
    }
}

pub fn encode_list<T: Entity>(items: &[T]) -> Result<Value> {
    items.iter().map(encode).collect::<Result<Vec<_>>>().map(Value::Array)
}

/// Decodes a sequence elementwise. Null decodes to an empty list and null elements are skipped.
pub fn decode_list<T: Entity>(tree: Value) -> Result<Vec<T>> {
    match tree {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => {
            let mut decoded = Vec::with_capacity(items.len());
            for item in items {
                if let Some(entity) = decode::<T>(item)? {
                    decoded.push(entity);
                }
            }
            Ok(decoded)
        }
        other => Err(Error::Decode {
            entity: T::schema().name().to_string(),
            reason: format!("expected a list, found {}", other),
        }),
    }
}

// Only `Schema::opaque` may describe a type without fields.
fn ensure_fields<T: 'static>(schema: &Schema<T>) -> Result<()> {
    if schema.fields().is_empty() {
        return Err(Error::EmptySchema(schema.name().to_string()));
    }
    Ok(())
}

fn into_object<T: 'static>(schema: &Schema<T>, tree: Value) -> Result<Map<String, Value>> {
    match tree {
        Value::Object(map) => Ok(map),
        other => Err(Error::Decode {
            entity: schema.name().to_string(),
            reason: format!("expected an object, found {}", other),
        }),
    }
}

fn take_input<T: 'static>(schema: &Schema<T>, info: &FieldInfo, input: &mut Map<String, Value>) -> Result<Option<Value>> {
    match input.remove(info.wire_name) {
        Some(value) => Ok(Some(value)),
        None if info.required => Err(missing(schema, info)),
        None => Ok(info.default.map(|default| default())),
    }
}

fn assign<T: 'static>(schema: &Schema<T>, field: &Field<T>, entity: &mut T, value: Value) -> Result<()> {
    field.write(entity, value).map_err(|e| decode_error(schema, e))
}

fn missing<T: 'static>(schema: &Schema<T>, info: &FieldInfo) -> Error {
    Error::MissingRequiredField {
        entity: schema.name().to_string(),
        field: info.name.to_string(),
    }
}

// Serde failures inside accessors become decode errors naming the entity.
fn decode_error<T: 'static>(schema: &Schema<T>, error: Error) -> Error {
    match error {
        Error::Serialization(e) => Error::Decode {
            entity: schema.name().to_string(),
            reason: e.to_string(),
        },
        other => other,
    }
}
