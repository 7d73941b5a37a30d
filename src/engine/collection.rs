use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::ops::Deref;
use std::path::Path;
use std::sync::{Arc, Weak};

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use log::{debug, info};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::engine::master::{KeyStrategy, MasterFactory, MasterRecord, SLAVE_FIELD};
use crate::engine::persistence::{LineAction, RecordFile, Snapshot};
use crate::engine::queryable::Queryable;
use crate::engine::relations::{self, resolve};
use crate::engine::tracker::{EntityTracker, Tracked, TrackingId, TrackingState};
use crate::query::{Filter, Query};
use crate::schema::Entity;
use crate::serialization::{decode, encode};
use crate::{Error, Key, Registry, Result};

/// Which lines a scan yields.
pub(crate) enum LineFilter {
    All,
    Key(Key),
    Matching(Filter),
}

/// Pending changes of one commit, already encoded as record lines.
#[derive(Default)]
struct Batch {
    created: Vec<String>,
    updated: HashMap<Key, String>,
    deleted: HashSet<Key>,
}

struct Scan<H> {
    owner: H,
    filter: LineFilter,
    snapshot: Option<Snapshot>,
}

/// A collection of entities of one type, backed by a single record file.
///
/// Reads never touch the live file: they scan a private copy taken under the
/// collection lock, so long scans neither block nor observe concurrent commits.
/// Writes are batched in the tracker table and applied by [`Collection::commit`].
pub struct Collection<T> {
    name: String,
    file: RecordFile,
    factory: MasterFactory,
    registry: Option<Weak<dyn Registry>>,
    lock: Mutex<()>,
    trackers: parking_lot::Mutex<HashMap<TrackingId, EntityTracker<T>>>,
}

impl<T: Entity> Collection<T> {
    /// Opens a standalone collection stored at `dir/name`.
    ///
    /// Without an engine, virtual fields cannot be normalized and no cascade runs.
    pub fn open<P: AsRef<Path>>(dir: P, name: &str) -> Self {
        Self {
            name: name.to_string(),
            file: RecordFile::new(dir, name),
            factory: MasterFactory::default(),
            registry: None,
            lock: Mutex::new(()),
            trackers: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Uses `keys` instead of random UUIDs for the keys of new records.
    pub fn with_keys(mut self, keys: Arc<dyn KeyStrategy>) -> Self {
        self.factory = MasterFactory::new(keys);
        self
    }

    pub(crate) fn attach(mut self, registry: Weak<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The collection name, which is also the stem of its record file.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Location of the record file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub(crate) fn registry(&self) -> Result<Arc<dyn Registry>> {
        self.attached_registry()?.ok_or(Error::StoreNotInitialized)
    }

    /// `None` for standalone collections, an error once the engine is gone.
    pub(crate) fn attached_registry(&self) -> Result<Option<Arc<dyn Registry>>> {
        match &self.registry {
            Some(weak) => weak.upgrade().map(Some).ok_or(Error::StoreNotInitialized),
            None => Ok(None),
        }
    }

    /// Tracks a new entity under a fresh key. Nothing is written until [`commit`](Self::commit).
    pub fn add(&self, entity: T) -> Tracked<T> {
        self.track(EntityTracker::created(self.factory.create(entity)))
    }

    /// Tracks several new entities, returning their handles in order.
    pub fn add_range<I: IntoIterator<Item = T>>(&self, entities: I) -> Vec<Tracked<T>> {
        entities.into_iter().map(|entity| self.add(entity)).collect()
    }

    /// Marks a tracked entity for deletion at the next commit.
    pub fn delete(&self, handle: &Tracked<T>) -> Result<Tracked<T>> {
        self.set_state(handle, TrackingState::Delete)?;
        Ok(handle.clone())
    }

    /// Marks every handle for deletion, stopping at the first untracked one.
    pub fn delete_range<'h, I>(&self, handles: I) -> Result<()>
    where
        I: IntoIterator<Item = &'h Tracked<T>>,
    {
        for handle in handles {
            self.delete(handle)?;
        }
        Ok(())
    }

    /// Current tracking state of a handle.
    pub fn state(&self, handle: &Tracked<T>) -> Result<TrackingState> {
        self.with_tracker(handle, |tracker| tracker.state())
    }

    /// Overrides the tracking state. Setting `Update` on an unchanged entity rewrites it as is.
    pub fn set_state(&self, handle: &Tracked<T>, state: TrackingState) -> Result<()> {
        self.with_tracker(handle, |tracker| tracker.set_state(state))
    }

    /// Whether the entity differs from the tree it was loaded or last stored with.
    pub fn is_modified(&self, handle: &Tracked<T>) -> Result<bool> {
        self.with_tracker(handle, |tracker| tracker.modified())?
    }

    /// Whether the handle still belongs to this collection's tracker table.
    pub fn is_tracked(&self, handle: &Tracked<T>) -> bool {
        self.trackers.lock().contains_key(&handle.id())
    }

    /// Stops tracking an entity without recording any change.
    pub fn untrack(&self, handle: &Tracked<T>) -> bool {
        self.trackers.lock().remove(&handle.id()).is_some()
    }

    /// Puts `entity` in place of the tracked one, keeping its key and tracking id.
    pub fn replace(&self, old: &Tracked<T>, entity: T) -> Result<Tracked<T>> {
        self.with_tracker(old, |tracker| {
            tracker.replace_entity(entity);
            tracker.handle(old.id())
        })
    }

    fn track(&self, tracker: EntityTracker<T>) -> Tracked<T> {
        let id = TrackingId::next();
        let handle = tracker.handle(id);
        self.trackers.lock().insert(id, tracker);
        handle
    }

    fn with_tracker<R>(&self, handle: &Tracked<T>, f: impl FnOnce(&mut EntityTracker<T>) -> R) -> Result<R> {
        let mut trackers = self.trackers.lock();
        match trackers.get_mut(&handle.id()) {
            Some(tracker) if tracker.key() == handle.key() => Ok(f(tracker)),
            _ => Err(Error::NotTracked {
                collection: self.name.clone(),
            }),
        }
    }

    /// Looks a record up by key.
    pub async fn get(&self, key: &str) -> Result<Option<Tracked<T>>> {
        Self::scan(self, LineFilter::Key(key.to_string())).try_next().await
    }

    /// Streams every record of the collection.
    pub fn iterate(&self) -> BoxStream<'_, Result<Tracked<T>>> {
        Self::scan(self, LineFilter::All)
    }

    /// Streams the records matching `query`, filtering raw lines before decoding them.
    pub fn find(&self, query: &Query) -> BoxStream<'_, Result<Tracked<T>>> {
        match query.resolve(T::schema()) {
            Ok(filter) => Self::scan(self, LineFilter::Matching(filter)),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    /// Records whose `field` equals `value`.
    pub fn iterate_by(&self, field: &str, value: impl Into<Value>) -> BoxStream<'_, Result<Tracked<T>>> {
        self.find(&Query::eq(field, value))
    }

    /// The first record matching `query`, in file order.
    pub async fn get_first(&self, query: &Query) -> Result<Option<Tracked<T>>> {
        self.find(query).try_next().await
    }

    /// Starts a composable query over this collection.
    pub fn queryable(&self) -> Queryable<'_, T> {
        Queryable::new(self)
    }

    /// Number of records, counted without decoding them.
    pub async fn count(&self) -> Result<usize> {
        let mut snapshot = self.snapshot().await?;
        let mut count = 0;
        while snapshot.next_line().await?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    pub(crate) fn find_filtered(&self, filter: Filter) -> BoxStream<'_, Result<Tracked<T>>> {
        Self::scan(self, LineFilter::Matching(filter))
    }

    /// Streams the stored trees of matching records without tracking them.
    pub(crate) fn slaves_matching(&self, filter: Filter) -> BoxStream<'_, Result<Value>> {
        Self::scan_with(self, LineFilter::Matching(filter), Self::slave_of)
    }

    /// Streams matching master records without decoding or tracking them.
    pub(crate) fn records_matching(&self, filter: Filter) -> BoxStream<'_, Result<MasterRecord<Value>>> {
        Self::scan_with(self, LineFilter::Matching(filter), Self::parse_line)
    }

    pub(crate) fn scan<'a, H>(owner: H, filter: LineFilter) -> BoxStream<'a, Result<Tracked<T>>>
    where
        H: Deref<Target = Self> + Send + Sync + 'a,
    {
        Self::scan_with(owner, filter, Self::track_line)
    }

    fn scan_with<'a, H, R>(owner: H, filter: LineFilter, map: fn(&Self, &str) -> Result<R>) -> BoxStream<'a, Result<R>>
    where
        H: Deref<Target = Self> + Send + Sync + 'a,
        R: Send + 'a,
    {
        let scan = Scan {
            owner,
            filter,
            snapshot: None,
        };
        stream::try_unfold(scan, move |mut scan| async move {
            if scan.snapshot.is_none() {
                scan.snapshot = Some(scan.owner.snapshot().await?);
            }
            loop {
                let line = match scan.snapshot.as_mut() {
                    Some(snapshot) => snapshot.next_line().await?,
                    None => None,
                };
                let Some(line) = line else {
                    return Ok(None);
                };
                if scan.owner.accepts(&scan.filter, &line)? {
                    let item = map(&*scan.owner, &line)?;
                    return Ok(Some((item, scan)));
                }
            }
        })
        .boxed()
    }

    /// Copies the live file under the lock. The copy is removed when the snapshot drops.
    async fn snapshot(&self) -> Result<Snapshot> {
        let scratch = {
            let _guard = self.lock.lock().await;
            self.file.ensure_exists().await?;
            self.file.snapshot().await?
        };
        Snapshot::open(scratch).await
    }

    fn accepts(&self, filter: &LineFilter, line: &str) -> Result<bool> {
        match filter {
            LineFilter::All => Ok(true),
            LineFilter::Key(key) => Ok(&self.line_key(line)? == key),
            LineFilter::Matching(filter) => filter.matches_line(line).map_err(|e| self.corrupt(e)),
        }
    }

    fn line_key(&self, line: &str) -> Result<Key> {
        match self.factory.line_key(line) {
            Ok(Some(key)) => Ok(key),
            Ok(None) => Err(self.corrupt("record has no key")),
            Err(e) => Err(self.corrupt(e)),
        }
    }

    fn parse_line(&self, line: &str) -> Result<MasterRecord<Value>> {
        MasterRecord::from_line(line).map_err(|e| self.corrupt(e))
    }

    fn track_line(&self, line: &str) -> Result<Tracked<T>> {
        let record = self.parse_line(line)?;
        let entity = decode::<T>(record.slave)?.ok_or_else(|| self.corrupt("record has no entity"))?;
        Ok(self.track(EntityTracker::loaded(record.key, entity)?))
    }

    fn slave_of(&self, line: &str) -> Result<Value> {
        Ok(self.parse_line(line)?.slave)
    }

    fn corrupt(&self, reason: impl Display) -> Error {
        Error::FileCorrupt {
            collection: self.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Persists every pending create, modified update and delete in one pass.
    ///
    /// Virtual fields are normalized into their collections before the lock is taken.
    /// Under the lock, creates are appended and then updates and deletes are applied by
    /// a single rewrite. Cascades run after the lock is released. Returns the number of
    /// records written or removed.
    ///
    /// If the rewrite fails after creates were appended, those creates stay in the file
    /// and their handles are tracked as stored records from then on.
    pub async fn commit(&self) -> Result<usize> {
        let mut pending = self.claim_pending();
        if pending.is_empty() {
            return Ok(0);
        }

        let batch = match self.prepare(&mut pending).await {
            Ok(batch) => batch,
            Err(e) => {
                self.restore(pending, false);
                return Err(e);
            }
        };

        let mut appended = false;
        let changed = match self.write_batch(&batch, &mut appended).await {
            Ok(changed) => changed,
            Err(e) => {
                self.restore(pending, appended);
                return Err(e);
            }
        };
        debug!(
            "Committed {}: {} created, {} updated, {} deleted",
            self.name,
            batch.created.len(),
            batch.updated.len(),
            batch.deleted.len()
        );

        for key in &batch.deleted {
            relations::cascade_on_delete(self, key).await?;
        }
        Ok(changed)
    }

    fn claim_pending(&self) -> Vec<(TrackingId, EntityTracker<T>)> {
        let mut trackers = self.trackers.lock();
        let mut claimed: Vec<TrackingId> = trackers
            .iter()
            .filter(|(_, tracker)| match tracker.state() {
                TrackingState::Create | TrackingState::Delete => true,
                TrackingState::Update => tracker.modified().unwrap_or(true),
            })
            .map(|(id, _)| *id)
            .collect();
        // creates are appended in the order they were tracked
        claimed.sort();
        claimed
            .into_iter()
            .filter_map(|id| trackers.remove(&id).map(|tracker| (id, tracker)))
            .collect()
    }

    fn restore(&self, pending: Vec<(TrackingId, EntityTracker<T>)>, appended: bool) {
        let mut trackers = self.trackers.lock();
        for (id, mut tracker) in pending {
            if appended && tracker.state() == TrackingState::Create {
                tracker.mark_stored();
            }
            trackers.insert(id, tracker);
        }
    }

    async fn prepare(&self, pending: &mut [(TrackingId, EntityTracker<T>)]) -> Result<Batch> {
        let mut batch = Batch::default();
        for (_, tracker) in pending.iter_mut() {
            let key = tracker.key().clone();
            match tracker.state() {
                TrackingState::Delete => {
                    batch.deleted.insert(key);
                }
                TrackingState::Create => {
                    let line = self.persistable_line(tracker).await?;
                    batch.created.push(line);
                }
                TrackingState::Update => {
                    let line = self.persistable_line(tracker).await?;
                    batch.updated.insert(key, line);
                }
            }
        }
        Ok(batch)
    }

    async fn persistable_line(&self, tracker: &mut EntityTracker<T>) -> Result<String> {
        let slave = relations::normalize_on_save(self, tracker).await?;
        MasterRecord {
            key: tracker.key().clone(),
            slave,
        }
        .to_line()
    }

    async fn write_batch(&self, batch: &Batch, appended: &mut bool) -> Result<usize> {
        let _guard = self.lock.lock().await;
        self.file.ensure_exists().await?;

        let mut changed = 0;
        if !batch.created.is_empty() {
            self.file.append(&batch.created).await?;
            *appended = true;
            changed += batch.created.len();
        }

        if !batch.updated.is_empty() || !batch.deleted.is_empty() {
            changed += self
                .file
                .rewrite(|line| {
                    let key = self.line_key(line)?;
                    Ok(if batch.deleted.contains(&key) {
                        LineAction::Drop
                    } else if let Some(replacement) = batch.updated.get(&key) {
                        LineAction::Replace(replacement.clone())
                    } else {
                        LineAction::Keep
                    })
                })
                .await?;
        }
        Ok(changed)
    }

    /// Applies `update` to matching records directly in the file, bypassing trackers.
    ///
    /// Virtual fields set by `update` are not stored. With `one`, only the first match
    /// changes. Returns the number of changed records.
    pub async fn find_and_update<F>(&self, query: &Query, mut update: F, one: bool) -> Result<usize>
    where
        F: FnMut(&mut T) + Send,
    {
        let filter = query.resolve(T::schema())?;
        let _guard = self.lock.lock().await;
        self.file.ensure_exists().await?;

        let mut matched = 0;
        self.file
            .rewrite(|line| {
                if (one && matched > 0) || !filter.matches_line(line).map_err(|e| self.corrupt(e))? {
                    return Ok(LineAction::Keep);
                }
                matched += 1;
                let record = self.parse_line(line)?;
                let mut entity = decode::<T>(record.slave)?.ok_or_else(|| self.corrupt("record has no entity"))?;
                update(&mut entity);
                let updated = MasterRecord {
                    key: record.key,
                    slave: relations::strip_virtual::<T>(encode(&entity)?),
                };
                Ok(LineAction::Replace(updated.to_line()?))
            })
            .await
    }

    /// Removes matching records directly from the file, then cascades their deletion.
    pub async fn find_and_delete(&self, query: &Query, one: bool) -> Result<usize> {
        let filter = query.resolve(T::schema())?;
        let mut deleted = Vec::new();
        let changed = {
            let _guard = self.lock.lock().await;
            self.file.ensure_exists().await?;
            self.file
                .rewrite(|line| {
                    if (one && !deleted.is_empty()) || !filter.matches_line(line).map_err(|e| self.corrupt(e))? {
                        return Ok(LineAction::Keep);
                    }
                    deleted.push(self.line_key(line)?);
                    Ok(LineAction::Drop)
                })
                .await?
        };

        for key in &deleted {
            relations::cascade_on_delete(self, key).await?;
        }
        Ok(changed)
    }

    /// Removes the record file. Pending trackers are kept.
    #[allow(clippy::should_implement_trait)]
    pub async fn drop(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.file.remove().await? {
            info!("Dropped collection {}", self.name);
        }
        Ok(())
    }

    /// Removes the record file and forgets every tracked entity.
    pub async fn purge(&self) -> Result<()> {
        self.drop().await?;
        self.trackers.lock().clear();
        Ok(())
    }

    /// Fills the named virtual fields of `handle` from their related collections.
    ///
    /// The loaded values also become part of the tracker snapshot, so loading alone does
    /// not make the entity dirty.
    pub async fn load_virtual<S: AsRef<str> + Sync>(&self, handle: &Tracked<T>, fields: &[S]) -> Result<()> {
        for name in fields {
            let (field, link) = relations::virtual_field::<T>(name.as_ref())?;
            let registry = self.registry()?;
            let (value, keys) = link.load(registry.as_ref(), handle.key()).await?;

            field.write(&mut *handle.write(), value)?;
            let stored = field.read(&*handle.read())?.unwrap_or(Value::Null);
            if let Some(tracker) = self.trackers.lock().get_mut(&handle.id()) {
                tracker.refresh_field(field.info().wire_name, stored, keys);
            }
        }
        Ok(())
    }

    /// Streams the records of `C` whose reference field points at `handle`.
    ///
    /// `field` is the virtual field on `T` that links to `C`.
    pub fn referenced_by<C: Entity>(&self, handle: &Tracked<T>, field: &str) -> Result<BoxStream<'static, Result<Tracked<C>>>> {
        let (_, link) = relations::virtual_field::<T>(field)?;
        let registry = self.registry()?;
        let reference = relations::linked_reference::<C>(link.as_ref())?;
        let related = resolve::<C>(registry.as_ref())?;
        let filter = Filter::field_equals(
            vec![SLAVE_FIELD.to_string(), reference.info().wire_name.to_string()],
            Value::String(handle.key().clone()),
        );
        Ok(Collection::<C>::scan(related, LineFilter::Matching(filter)))
    }
}
