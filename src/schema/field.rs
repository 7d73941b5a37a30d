use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use super::{Describe, Entity};
use crate::engine::relations::{Relation, VirtualLink};
use crate::serialization::{decode, decode_list, encode, encode_list};
use crate::{Error, Key, Result};

type Getter<T> = Box<dyn Fn(&T) -> Result<Option<Value>> + Send + Sync>;
type Setter<T> = Box<dyn Fn(&mut T, Value) -> Result<()> + Send + Sync>;

/// How a field's value is laid out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Scalar,
    Complex,
    List,
}

/// The type-independent part of a field descriptor.
#[derive(Debug, Clone)]
pub struct FieldInfo {
    /// Name of the field on the Rust type.
    pub name: &'static str,
    /// Key of the field in the encoded tree. Defaults to `name`.
    pub wire_name: &'static str,
    pub required: bool,
    pub shape: Shape,
    /// Produces the value used when the field is absent.
    pub default: Option<fn() -> Value>,
    /// False for fields assigned after a constructor-style schema builds the entity.
    pub init: bool,
    pub is_virtual: bool,
    pub is_reference: bool,
    /// For virtual fields, the reference field on the related type.
    pub refers_to: Option<&'static str>,
    pub datetime: bool,
    pub nested: Option<fn() -> &'static dyn Describe>,
}

impl FieldInfo {
    fn new(name: &'static str, shape: Shape, required: bool) -> Self {
        Self {
            name,
            wire_name: name,
            required,
            shape,
            default: None,
            init: true,
            is_virtual: false,
            is_reference: false,
            refers_to: None,
            datetime: false,
            nested: None,
        }
    }

    pub fn is_list(&self) -> bool {
        self.shape == Shape::List
    }

    pub fn is_complex(&self) -> bool {
        self.shape == Shape::Complex
    }
}

/// A field descriptor bound to an accessor pair on `T`.
///
/// The accessors move values between the typed struct and the wire tree, so the
/// serialization engine can walk any entity without per-type code.
pub struct Field<T> {
    info: FieldInfo,
    get: Getter<T>,
    set: Setter<T>,
    link: Option<Arc<dyn Relation>>,
}

impl<T> fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field").field("info", &self.info).finish_non_exhaustive()
    }
}

fn describe_of<C: Entity>() -> &'static dyn Describe {
    C::schema()
}

fn empty_list() -> Value {
    Value::Array(Vec::new())
}

impl<T: 'static> Field<T> {
    fn new(info: FieldInfo, get: Getter<T>, set: Setter<T>) -> Self {
        Self {
            info,
            get,
            set,
            link: None,
        }
    }

    /// A plain value stored inline through serde. Required unless a default is given.
    pub fn scalar<V, G, S>(name: &'static str, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> &V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        Self::new(
            FieldInfo::new(name, Shape::Scalar, true),
            Box::new(move |entity: &T| Ok(Some(serde_json::to_value(get(entity))?))),
            Box::new(move |entity: &mut T, value: Value| {
                set(entity, serde_json::from_value(value)?);
                Ok(())
            }),
        )
    }

    /// A value that may be absent. `None` is encoded as the default, or null.
    pub fn optional<V, G, S>(name: &'static str, get: G, set: S) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> &Option<V> + Send + Sync + 'static,
        S: Fn(&mut T, Option<V>) + Send + Sync + 'static,
    {
        Self::new(
            FieldInfo::new(name, Shape::Scalar, false),
            Box::new(move |entity: &T| match get(entity) {
                Some(value) => Ok(Some(serde_json::to_value(value)?)),
                None => Ok(None),
            }),
            Box::new(move |entity: &mut T, value: Value| {
                set(entity, serde_json::from_value(value)?);
                Ok(())
            }),
        )
    }

    /// An embedded entity encoded through its own schema.
    pub fn complex<C, G, S>(name: &'static str, get: G, set: S) -> Self
    where
        C: Entity,
        G: Fn(&T) -> Option<&C> + Send + Sync + 'static,
        S: Fn(&mut T, C) + Send + Sync + 'static,
    {
        let mut field = Self::new(
            FieldInfo::new(name, Shape::Complex, false),
            Box::new(move |entity: &T| get(entity).map(encode::<C>).transpose()),
            Box::new(move |entity: &mut T, value: Value| {
                if let Some(inner) = decode::<C>(value)? {
                    set(entity, inner);
                }
                Ok(())
            }),
        );
        field.info.nested = Some(describe_of::<C>);
        field
    }

    /// A sequence of entities, or of primitive values through their opaque schemas.
    pub fn list<C, G, S>(name: &'static str, get: G, set: S) -> Self
    where
        C: Entity,
        G: Fn(&T) -> &Vec<C> + Send + Sync + 'static,
        S: Fn(&mut T, Vec<C>) + Send + Sync + 'static,
    {
        let mut field = Self::new(
            FieldInfo::new(name, Shape::List, false),
            Box::new(move |entity: &T| encode_list(get(entity)).map(Some)),
            Box::new(move |entity: &mut T, value: Value| {
                set(entity, decode_list::<C>(value)?);
                Ok(())
            }),
        );
        field.info.default = Some(empty_list);
        field.info.nested = Some(describe_of::<C>);
        field
    }

    /// Holds the key of the record that owns this one through a virtual field.
    pub fn reference<G, S>(name: &'static str, get: G, set: S) -> Self
    where
        G: Fn(&T) -> &Option<Key> + Send + Sync + 'static,
        S: Fn(&mut T, Option<Key>) + Send + Sync + 'static,
    {
        let mut field = Self::optional(name, get, set);
        field.info.is_reference = true;
        field
    }

    /// A single related entity stored in the collection of `C`.
    ///
    /// `refers_to` names the reference field on `C` that receives this entity's key.
    pub fn virtual_one<C, G, S>(name: &'static str, refers_to: &'static str, get: G, set: S) -> Self
    where
        C: Entity,
        G: Fn(&T) -> &Option<C> + Send + Sync + 'static,
        S: Fn(&mut T, Option<C>) + Send + Sync + 'static,
    {
        let mut field = Self::new(
            FieldInfo::new(name, Shape::Complex, false),
            Box::new(move |entity: &T| get(entity).as_ref().map(encode::<C>).transpose()),
            Box::new(move |entity: &mut T, value: Value| {
                set(entity, decode::<C>(value)?);
                Ok(())
            }),
        );
        field.info.nested = Some(describe_of::<C>);
        field.mark_virtual(refers_to, Arc::new(VirtualLink::<C>::single(refers_to)))
    }

    /// Related entities stored in the collection of `C`.
    pub fn virtual_list<C, G, S>(name: &'static str, refers_to: &'static str, get: G, set: S) -> Self
    where
        C: Entity,
        G: Fn(&T) -> &Vec<C> + Send + Sync + 'static,
        S: Fn(&mut T, Vec<C>) + Send + Sync + 'static,
    {
        let field = Self::list(name, get, set);
        field.mark_virtual(refers_to, Arc::new(VirtualLink::<C>::list(refers_to)))
    }

    fn mark_virtual(mut self, refers_to: &'static str, link: Arc<dyn Relation>) -> Self {
        self.info.is_virtual = true;
        self.info.refers_to = Some(refers_to);
        self.link = Some(link);
        self
    }

    /// Fails encoding and decoding when the value is absent.
    pub fn required(mut self) -> Self {
        self.info.required = true;
        self
    }

    pub fn wire_name(mut self, wire_name: &'static str) -> Self {
        self.info.wire_name = wire_name;
        self
    }

    /// Makes the field optional, filling it from `default` when absent.
    pub fn default_with(mut self, default: fn() -> Value) -> Self {
        self.info.required = false;
        self.info.default = Some(default);
        self
    }

    /// Assigns the field after a constructor-style schema has built the entity.
    pub fn no_init(mut self) -> Self {
        self.info.init = false;
        self
    }

    /// Compares the field as a timestamp in queries.
    pub fn datetime(mut self) -> Self {
        self.info.datetime = true;
        self
    }
}

impl<T> Field<T> {
    pub fn info(&self) -> &FieldInfo {
        &self.info
    }

    /// Reads the wire value of the field. `None` means the value is absent.
    pub fn read(&self, entity: &T) -> Result<Option<Value>> {
        (self.get)(entity)
    }

    pub fn write(&self, entity: &mut T, value: Value) -> Result<()> {
        (self.set)(entity, value)
    }

    pub(crate) fn link(&self) -> Option<&Arc<dyn Relation>> {
        self.link.as_ref()
    }
}

/// Decoded inputs for a constructor-style schema, keyed by field name.
pub struct InitArgs {
    entity: &'static str,
    values: Map<String, Value>,
}

impl InitArgs {
    pub(crate) fn new(entity: &'static str) -> Self {
        Self {
            entity,
            values: Map::new(),
        }
    }

    pub(crate) fn insert(&mut self, field: &str, value: Value) {
        self.values.insert(field.to_string(), value);
    }

    /// Removes the raw wire value of a field.
    pub fn take_value(&mut self, field: &str) -> Option<Value> {
        self.values.remove(field)
    }

    /// Removes a field and deserializes it. `None` when the field was absent.
    pub fn take<V: DeserializeOwned>(&mut self, field: &str) -> Result<Option<V>> {
        match self.values.remove(field) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Like [`take`](Self::take), but an absent field is an error.
    pub fn require<V: DeserializeOwned>(&mut self, field: &str) -> Result<V> {
        self.take(field)?.ok_or_else(|| Error::MissingRequiredField {
            entity: self.entity.to_string(),
            field: field.to_string(),
        })
    }

    /// Removes an embedded entity and decodes it through its schema.
    pub fn take_entity<C: Entity>(&mut self, field: &str) -> Result<Option<C>> {
        match self.values.remove(field) {
            Some(value) => decode::<C>(value),
            None => Ok(None),
        }
    }

    /// Removes a list of entities. An absent field is an empty list.
    pub fn take_list<C: Entity>(&mut self, field: &str) -> Result<Vec<C>> {
        match self.values.remove(field) {
            Some(value) => decode_list::<C>(value),
            None => Ok(Vec::new()),
        }
    }
}
