use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde_json::Value;

use crate::engine::master::MasterRecord;
use crate::schema::Entity;
use crate::serialization::encode;
use crate::{Key, Result};

/// The pending change recorded for a tracked entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    Create,
    Update,
    Delete,
}

/// Opaque token identifying one tracker inside a collection. Ids increase in tracking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackingId(u64);

impl TrackingId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

type Shared<T> = Arc<RwLock<T>>;

/// Handle to an entity that came out of, or was handed to, a collection.
///
/// The entity itself is shared with the collection's tracker, so edits made through
/// [`Tracked::write`] are what the next commit compares against the stored snapshot.
/// Guards must not be held across an `.await`.
pub struct Tracked<T> {
    id: TrackingId,
    key: Key,
    entity: Shared<T>,
}

impl<T> Tracked<T> {
    pub fn id(&self) -> TrackingId {
        self.id
    }

    /// Key of the master record wrapping the entity.
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.entity.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.entity.write()
    }

    pub fn cloned(&self) -> T
    where
        T: Clone,
    {
        self.entity.read().clone()
    }
}

impl<T> Clone for Tracked<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            key: self.key.clone(),
            entity: self.entity.clone(),
        }
    }
}

impl<T> fmt::Debug for Tracked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracked")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Change tracking for one entity: its master record, the wire tree it was loaded
/// with and the pending state.
///
/// `links` holds, per virtual field wire name, the keys of the related records that
/// back the field's items, in item order.
pub(crate) struct EntityTracker<T> {
    record: MasterRecord<Shared<T>>,
    snapshot: Value,
    state: TrackingState,
    links: HashMap<&'static str, Vec<Key>>,
}

impl<T: Entity> EntityTracker<T> {
    pub fn created(record: MasterRecord<T>) -> Self {
        Self {
            record: MasterRecord {
                key: record.key,
                slave: Arc::new(RwLock::new(record.slave)),
            },
            snapshot: Value::Null,
            state: TrackingState::Create,
            links: HashMap::new(),
        }
    }

    pub fn loaded(key: Key, entity: T) -> Result<Self> {
        let snapshot = encode(&entity)?;
        Ok(Self {
            record: MasterRecord {
                key,
                slave: Arc::new(RwLock::new(entity)),
            },
            snapshot,
            state: TrackingState::Update,
            links: HashMap::new(),
        })
    }

    pub fn handle(&self, id: TrackingId) -> Tracked<T> {
        Tracked {
            id,
            key: self.record.key.clone(),
            entity: self.record.slave.clone(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.record.key
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn set_state(&mut self, state: TrackingState) {
        self.state = state;
    }

    pub fn encode_slave(&self) -> Result<Value> {
        encode(&*self.record.slave.read())
    }

    /// Re-encodes the entity and compares it structurally with the snapshot.
    pub fn modified(&self) -> Result<bool> {
        Ok(self.encode_slave()? != self.snapshot)
    }

    pub fn replace_entity(&mut self, entity: T) {
        *self.record.slave.write() = entity;
    }

    /// Records a freshly loaded virtual field as part of the stored state, along with
    /// the keys of the related records it was read from.
    pub fn refresh_field(&mut self, wire_name: &'static str, value: Value, keys: Vec<Key>) {
        if let Value::Object(fields) = &mut self.snapshot {
            fields.insert(wire_name.to_string(), value);
        }
        self.links.insert(wire_name, keys);
    }

    /// Keys of the related records backing a virtual field. Empty until the field is
    /// loaded or saved.
    pub fn links(&self, wire_name: &str) -> &[Key] {
        self.links.get(wire_name).map_or(&[], Vec::as_slice)
    }

    pub fn set_links(&mut self, wire_name: &'static str, keys: Vec<Key>) {
        self.links.insert(wire_name, keys);
    }

    /// Treats the current entity as stored: the snapshot becomes its encoding.
    ///
    /// If the entity no longer encodes, the old snapshot is kept so the next commit
    /// sees it as modified and reports the error.
    pub fn mark_stored(&mut self) {
        match self.encode_slave() {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(e) => warn!("Keeping stale snapshot for {}: {}", self.record.key, e),
        }
        self.state = TrackingState::Update;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fixtures::{Grade, Student};
    use crate::engine::master::MasterFactory;
    use crate::schema::{Field, Schema};
    use serde_json::json;
    use std::sync::OnceLock;

    #[test]
    fn test_unmodified_entity_is_clean() {
        let tracker = EntityTracker::loaded("k".to_string(), Student::new(1, "A")).unwrap();
        assert_eq!(tracker.state(), TrackingState::Update);
        assert!(!tracker.modified().unwrap());
    }

    #[test]
    fn test_mutation_through_handle_is_seen() {
        let tracker = EntityTracker::loaded("k".to_string(), Student::new(1, "A")).unwrap();
        let handle = tracker.handle(TrackingId::next());
        handle.write().name = "B".to_string();
        assert!(tracker.modified().unwrap());
        assert!(tracker.modified().unwrap());
    }

    #[test]
    fn test_reverting_a_change_is_clean_again() {
        let tracker = EntityTracker::loaded("k".to_string(), Student::new(1, "A")).unwrap();
        let handle = tracker.handle(TrackingId::next());
        handle.write().name = "B".to_string();
        handle.write().name = "A".to_string();
        assert!(!tracker.modified().unwrap());
    }

    #[test]
    fn test_created_tracker_state() {
        let record = MasterFactory::default().create(Student::new(1, "A"));
        let key = record.key.clone();
        let mut tracker = EntityTracker::created(record);
        assert_eq!(tracker.state(), TrackingState::Create);
        assert_eq!(tracker.key(), &key);

        tracker.set_state(TrackingState::Delete);
        tracker.set_state(TrackingState::Delete);
        assert_eq!(tracker.state(), TrackingState::Delete);
    }

    #[test]
    fn test_replace_entity_keeps_key_and_handles() {
        let mut tracker = EntityTracker::loaded("k".to_string(), Student::new(1, "A")).unwrap();
        let handle = tracker.handle(TrackingId::next());
        tracker.replace_entity(Student::new(2, "B"));
        assert_eq!(handle.read().number, 2);
        assert_eq!(handle.key(), "k");
        assert!(tracker.modified().unwrap());
    }

    #[test]
    fn test_tracking_ids_are_distinct() {
        assert_ne!(TrackingId::next(), TrackingId::next());
    }

    #[test]
    fn test_refreshed_field_records_links_and_stays_clean() {
        let student = Student::new(1, "A");
        let mut tracker = EntityTracker::loaded("k".to_string(), student).unwrap();
        assert!(tracker.links("grades").is_empty());

        let handle = tracker.handle(TrackingId::next());
        handle.write().grades = vec![Grade::new("math", 12.0)];
        let stored = json!([{"course_name": "math", "score": 12.0, "student_id": null}]);
        tracker.refresh_field("grades", stored, vec!["g1".to_string()]);

        assert!(!tracker.modified().unwrap());
        assert_eq!(tracker.links("grades"), ["g1".to_string()]);
    }

    #[derive(Default)]
    struct Badge {
        label: Option<String>,
    }

    impl Entity for Badge {
        fn schema() -> &'static Schema<Self> {
            static SCHEMA: OnceLock<Schema<Badge>> = OnceLock::new();
            SCHEMA.get_or_init(|| {
                Schema::builder("Badge", Badge::default)
                    .field(Field::optional("label", |b: &Badge| &b.label, |b: &mut Badge, v| b.label = v).required())
                    .build()
            })
        }
    }

    #[test]
    fn test_mark_stored_keeps_snapshot_when_encoding_fails() {
        let record = MasterFactory::default().create(Badge::default());
        let mut tracker = EntityTracker::created(record);
        tracker.mark_stored();

        assert_eq!(tracker.state(), TrackingState::Update);
        assert_eq!(tracker.snapshot, Value::Null);
        assert!(tracker.modified().is_err());

        tracker.handle(TrackingId::next()).write().label = Some("gold".to_string());
        tracker.mark_stored();
        assert_eq!(tracker.snapshot, json!({"label": "gold"}));
        assert!(!tracker.modified().unwrap());
    }
}
