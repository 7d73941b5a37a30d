use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::info;
use parking_lot::RwLock;
use tokio::fs;

use crate::engine::collection::Collection;
use crate::engine::config::EngineConfig;
use crate::engine::master::{KeyStrategy, UuidKeys};
use crate::engine::relations::{self, CascadeAction};
use crate::schema::Entity;
use crate::{Error, Registry, Result};

/// Whole-collection operations the engine runs without knowing the entity type.
#[async_trait]
pub(crate) trait Maintenance: Send + Sync {
    async fn purge(&self) -> Result<()>;
}

#[async_trait]
impl<T: Entity> Maintenance for Collection<T> {
    async fn purge(&self) -> Result<()> {
        Collection::purge(self).await
    }
}

struct Registration {
    name: String,
    collection: Arc<dyn Any + Send + Sync>,
    maintenance: Arc<dyn Maintenance>,
}

struct EngineInner {
    config: EngineConfig,
    entries: RwLock<HashMap<TypeId, Registration>>,
    cascades: RwLock<HashMap<(String, String), CascadeAction>>,
}

impl Registry for EngineInner {
    fn base_path(&self, collection: &str) -> Result<PathBuf> {
        let entries = self.entries.read();
        if entries.values().any(|entry| entry.name == collection) {
            Ok(self.config.data_dir.clone())
        } else {
            Err(Error::CollectionNotRegistered(collection.to_string()))
        }
    }

    fn lookup(&self, entity: TypeId, entity_name: &str) -> Result<Arc<dyn Any + Send + Sync>> {
        self.entries
            .read()
            .get(&entity)
            .map(|entry| entry.collection.clone())
            .ok_or_else(|| Error::CollectionNotRegistered(entity_name.to_string()))
    }

    fn cascade_action(&self, collection: &str, field: &str) -> CascadeAction {
        if let Some(action) = self.cascades.read().get(&(collection.to_string(), field.to_string())) {
            return *action;
        }
        self.config
            .cascades
            .get(collection)
            .and_then(|fields| fields.get(field))
            .copied()
            .unwrap_or_default()
    }
}

/// The root store: one directory, one collection per registered entity type.
///
/// Cloning an engine is cheap and every clone serves the same collections. Collections
/// only keep a weak reference back, so once the last clone is dropped their
/// relationship operations fail with [`Error::StoreNotInitialized`].
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Opens the engine over `config.data_dir`, creating the directory when allowed.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        if config.create_dirs {
            fs::create_dir_all(&config.data_dir).await?;
        } else if !fs::try_exists(&config.data_dir).await? {
            return Err(Error::StoreNotInitialized);
        }
        info!("Opened store at {:?}", config.data_dir);

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                entries: RwLock::new(HashMap::new()),
                cascades: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Registers `T` under its schema name.
    pub fn register<T: Entity>(&self) -> Result<Arc<Collection<T>>> {
        self.register_as::<T>(T::schema().name())
    }

    /// Registers `T` under an explicit collection name.
    pub fn register_as<T: Entity>(&self, name: &str) -> Result<Arc<Collection<T>>> {
        self.register_keyed::<T>(name, Arc::new(UuidKeys))
    }

    /// Registers `T` under `name`, generating record keys with `keys`.
    ///
    /// Cascade entries of the config for `name` are checked against the schema of `T`.
    pub fn register_keyed<T: Entity>(&self, name: &str, keys: Arc<dyn KeyStrategy>) -> Result<Arc<Collection<T>>> {
        let mut entries = self.inner.entries.write();
        if entries.contains_key(&TypeId::of::<T>()) {
            return Err(Error::DuplicateEntityType(T::schema().name().to_string()));
        }
        if entries.values().any(|entry| entry.name == name) {
            return Err(Error::DuplicateCollectionName(name.to_string()));
        }
        if let Some(fields) = self.inner.config.cascades.get(name) {
            for field in fields.keys() {
                relations::virtual_field::<T>(field)?;
            }
        }

        let registry: Weak<dyn Registry> = Arc::downgrade(&self.inner) as Weak<dyn Registry>;
        let collection = Arc::new(
            Collection::<T>::open(&self.inner.config.data_dir, name)
                .with_keys(keys)
                .attach(registry),
        );
        entries.insert(
            TypeId::of::<T>(),
            Registration {
                name: name.to_string(),
                collection: collection.clone(),
                maintenance: collection.clone(),
            },
        );
        info!("Registered collection {} for {}", name, T::schema().name());
        Ok(collection)
    }

    /// The collection registered for `T`.
    pub fn collection<T: Entity>(&self) -> Result<Arc<Collection<T>>> {
        relations::resolve::<T>(self.inner.as_ref())
    }

    /// Sets the delete action of a virtual field of `T`, overriding the config.
    pub fn configure_cascade<T: Entity>(&self, field: &str, action: CascadeAction) -> Result<()> {
        relations::virtual_field::<T>(field)?;
        let name = self
            .inner
            .entries
            .read()
            .get(&TypeId::of::<T>())
            .map(|entry| entry.name.clone())
            .ok_or_else(|| Error::CollectionNotRegistered(T::schema().name().to_string()))?;
        self.inner.cascades.write().insert((name, field.to_string()), action);
        Ok(())
    }

    /// Action applied to the related records of `collection.field` when an owner is deleted.
    pub fn cascade_action(&self, collection: &str, field: &str) -> CascadeAction {
        self.inner.cascade_action(collection, field)
    }

    /// Names of the registered collections, sorted.
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.entries.read().values().map(|entry| entry.name.clone()).collect();
        names.sort();
        names
    }

    /// Path of the record file of a registered collection.
    pub fn collection_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.inner.base_path(name)?.join(name))
    }

    /// Purges every collection and removes the data directory.
    ///
    /// Registrations are dropped as well, so the engine serves no collections afterwards.
    pub async fn purge(&self) -> Result<()> {
        let drained: Vec<Registration> = self.inner.entries.write().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.maintenance.purge().await?;
        }

        match fs::remove_dir(&self.inner.config.data_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("Purged store at {:?}", self.inner.config.data_dir);
        Ok(())
    }
}
