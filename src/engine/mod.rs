pub mod collection;
pub mod config;
pub mod master;
pub mod persistence;
pub mod queryable;
pub mod relations;
pub mod store;
pub mod tracker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use collection::Collection;
pub use config::EngineConfig;
pub use master::{KeyStrategy, MasterFactory, MasterRecord, UuidKeys};
pub use persistence::{RecordFile, Snapshot};
pub use queryable::Queryable;
pub use relations::CascadeAction;
pub use store::Engine;
pub use tracker::{Tracked, TrackingId, TrackingState};
