use std::any::TypeId;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::collection::Collection;
use crate::engine::master::{MasterRecord, SLAVE_FIELD};
use crate::engine::tracker::{EntityTracker, Tracked};
use crate::query::Filter;
use crate::schema::{Entity, Field};
use crate::serialization::decode;
use crate::{Error, Key, Registry, Result};

/// What happens to related records when their owner is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeAction {
    /// Leave related records untouched.
    #[default]
    Ignore,
    /// Null the reference field of related records.
    DeleteReference,
    /// Delete related records.
    DeleteEntity,
}

/// The related side of a virtual field, with the related entity type erased.
#[async_trait]
pub trait Relation: Send + Sync {
    /// Schema name of the related entity type.
    fn related_name(&self) -> &'static str;

    /// Reference field on the related type that holds the owner's key.
    fn refers_to(&self) -> &'static str;

    /// Stores the wire values of a virtual field as records owned by `key`.
    ///
    /// `paired[i]` is the key of the related record that item `i` was loaded from. Returns
    /// the keys of the records now holding each item.
    async fn normalize(&self, registry: &dyn Registry, key: &Key, values: Value, paired: &[Key]) -> Result<Vec<Key>>;

    /// Applies `action` to the records owned by `key`.
    async fn cascade(&self, registry: &dyn Registry, key: &Key, action: CascadeAction) -> Result<()>;

    /// Reads the records owned by `key`: one tree for single links, an array otherwise.
    /// Also returns the keys of the records read, in item order.
    async fn load(&self, registry: &dyn Registry, key: &Key) -> Result<(Value, Vec<Key>)>;
}

pub struct VirtualLink<C> {
    refers_to: &'static str,
    single: bool,
    related: PhantomData<fn() -> C>,
}

impl<C: Entity> VirtualLink<C> {
    pub fn single(refers_to: &'static str) -> Self {
        Self {
            refers_to,
            single: true,
            related: PhantomData,
        }
    }

    pub fn list(refers_to: &'static str) -> Self {
        Self {
            refers_to,
            single: false,
            related: PhantomData,
        }
    }

    fn owned_by(&self, key: &Key) -> Result<Filter> {
        let reference = reference_field::<C>(self.refers_to)?;
        Ok(Filter::field_equals(
            vec![SLAVE_FIELD.to_string(), reference.info().wire_name.to_string()],
            Value::String(key.clone()),
        ))
    }
}

#[async_trait]
impl<C: Entity> Relation for VirtualLink<C> {
    fn related_name(&self) -> &'static str {
        C::schema().name()
    }

    fn refers_to(&self) -> &'static str {
        self.refers_to
    }

    // Items loaded from a record replace that record. Every other item is added, except
    // that a single link always replaces the one record it already owns. Owned records
    // no item maps to are left alone.
    async fn normalize(&self, registry: &dyn Registry, key: &Key, values: Value, paired: &[Key]) -> Result<Vec<Key>> {
        let items = match values {
            Value::Null => Vec::new(),
            Value::Array(items) => items,
            single => vec![single],
        };
        if items.is_empty() {
            return Ok(paired.to_vec());
        }

        let reference = reference_field::<C>(self.refers_to)?;
        let related = resolve::<C>(registry)?;
        let owned: Vec<Tracked<C>> = related.find_filtered(self.owned_by(key)?).try_collect().await?;
        let current: Vec<Key> = match owned.first() {
            Some(first) if self.single && paired.is_empty() => vec![first.key().clone()],
            _ => paired.to_vec(),
        };
        let mut owned: HashMap<Key, Tracked<C>> = owned.into_iter().map(|handle| (handle.key().clone(), handle)).collect();

        let mut written = Vec::with_capacity(items.len());
        for (index, mut item) in items.into_iter().enumerate() {
            if let Value::Object(fields) = &mut item {
                fields.insert(reference.info().wire_name.to_string(), Value::String(key.clone()));
            }
            let Some(entity) = decode::<C>(item)? else {
                continue;
            };
            let handle = match current.get(index).and_then(|stored| owned.remove(stored)) {
                Some(record) => related.replace(&record, entity)?,
                None => related.add(entity),
            };
            written.push(handle);
        }
        for untouched in owned.values() {
            related.untrack(untouched);
        }

        let changed = related.commit().await?;
        // unchanged replacements are not claimed by the commit
        for handle in &written {
            related.untrack(handle);
        }
        debug!("Normalized {} record(s) into {} for {}", changed, related.name(), key);
        Ok(written.iter().map(|handle| handle.key().clone()).collect())
    }

    async fn cascade(&self, registry: &dyn Registry, key: &Key, action: CascadeAction) -> Result<()> {
        if action == CascadeAction::Ignore {
            return Ok(());
        }

        let reference = reference_field::<C>(self.refers_to)?;
        let related = resolve::<C>(registry)?;
        let owned: Vec<Tracked<C>> = related.find_filtered(self.owned_by(key)?).try_collect().await?;
        if owned.is_empty() {
            return Ok(());
        }

        for handle in &owned {
            match action {
                CascadeAction::DeleteEntity => {
                    related.delete(handle)?;
                }
                CascadeAction::DeleteReference => {
                    reference.write(&mut *handle.write(), Value::Null)?;
                }
                CascadeAction::Ignore => {}
            }
        }
        related.commit().await?;
        Ok(())
    }

    async fn load(&self, registry: &dyn Registry, key: &Key) -> Result<(Value, Vec<Key>)> {
        let related = resolve::<C>(registry)?;
        let mut records: Vec<MasterRecord<Value>> = related.records_matching(self.owned_by(key)?).try_collect().await?;
        if self.single {
            records.truncate(1);
        }
        let keys = records.iter().map(|record| record.key.clone()).collect();
        let mut values = records.into_iter().map(|record| record.slave);
        Ok(if self.single {
            (values.next().unwrap_or(Value::Null), keys)
        } else {
            (Value::Array(values.collect()), keys)
        })
    }
}

/// Finds the collection registered for `C`.
pub fn resolve<C: Entity>(registry: &dyn Registry) -> Result<Arc<Collection<C>>> {
    let name = C::schema().name();
    registry
        .lookup(TypeId::of::<C>(), name)?
        .downcast::<Collection<C>>()
        .map_err(|_| Error::CollectionNotRegistered(name.to_string()))
}

/// The reference field of `C` named `refers_to`.
pub fn reference_field<C: Entity>(refers_to: &str) -> Result<&'static Field<C>> {
    let schema = C::schema();
    schema
        .fields()
        .iter()
        .find(|field| field.info().is_reference && field.info().name == refers_to)
        .ok_or_else(|| Error::MissingReferenceField {
            entity: schema.name().to_string(),
            field: refers_to.to_string(),
        })
}

/// The reference field of `C` that `link` points at, checking `C` is the linked type.
pub(crate) fn linked_reference<C: Entity>(link: &dyn Relation) -> Result<&'static Field<C>> {
    if link.related_name() != C::schema().name() {
        return Err(Error::MissingReferenceField {
            entity: C::schema().name().to_string(),
            field: link.refers_to().to_string(),
        });
    }
    reference_field::<C>(link.refers_to())
}

pub(crate) fn virtual_field<T: Entity>(name: &str) -> Result<(&'static Field<T>, &'static Arc<dyn Relation>)> {
    let schema = T::schema();
    let field = schema.field(name).ok_or_else(|| Error::UnknownField {
        entity: schema.name().to_string(),
        field: name.to_string(),
    })?;
    let link = field.link().ok_or_else(|| Error::NotVirtual {
        entity: schema.name().to_string(),
        field: name.to_string(),
    })?;
    Ok((field, link))
}

/// Encodes a tracked entity and moves its virtual field values into their own
/// collections, recording which related records now back each field.
pub(crate) async fn normalize_on_save<T: Entity>(collection: &Collection<T>, tracker: &mut EntityTracker<T>) -> Result<Value> {
    let mut fields = match tracker.encode_slave()? {
        Value::Object(fields) => fields,
        other => return Ok(other),
    };
    let key = tracker.key().clone();

    for field in T::schema().fields() {
        let Some(link) = field.link() else {
            continue;
        };
        let Some(values) = fields.remove(field.info().wire_name) else {
            continue;
        };
        if is_empty(&values) {
            continue;
        }
        let wire_name = field.info().wire_name;
        let registry = collection.registry()?;
        let keys = link.normalize(registry.as_ref(), &key, values, tracker.links(wire_name)).await?;
        tracker.set_links(wire_name, keys);
    }
    Ok(Value::Object(fields))
}

/// Removes virtual field values from an encoded entity.
pub(crate) fn strip_virtual<T: Entity>(slave: Value) -> Value {
    match slave {
        Value::Object(mut fields) => {
            for field in T::schema().fields() {
                if field.info().is_virtual {
                    fields.remove(field.info().wire_name);
                }
            }
            Value::Object(fields)
        }
        other => other,
    }
}

/// Applies the configured cascade of every virtual field for a deleted record.
pub(crate) async fn cascade_on_delete<T: Entity>(collection: &Collection<T>, key: &Key) -> Result<()> {
    let Some(registry) = collection.attached_registry()? else {
        return Ok(());
    };

    for field in T::schema().fields() {
        let Some(link) = field.link() else {
            continue;
        };
        let action = registry.cascade_action(collection.name(), field.info().name);
        if action == CascadeAction::Ignore {
            continue;
        }
        debug!("Cascading {:?} from {}.{} for {}", action, collection.name(), field.info().name, key);
        link.cascade(registry.as_ref(), key, action).await?;
    }
    Ok(())
}

fn is_empty(values: &Value) -> bool {
    match values {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
