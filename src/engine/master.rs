use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::query::extract;
use crate::{Key, Result};

/// Wire name of the record key.
pub const KEY_FIELD: &str = "__id";
/// Wire name of the wrapped entity.
pub const SLAVE_FIELD: &str = "slave";

const UUID_PREFIX: &str = "{\"__id\":\"";
const UUID_LEN: usize = 36;

/// Generates record keys and, optionally, reads them back from lines cheaply.
pub trait KeyStrategy: Send + Sync {
    fn generate(&self) -> Key;

    /// Fast path for reading a key without parsing the line. `None` falls back to parsing.
    fn line_key<'a>(&self, line: &'a str) -> Option<&'a str> {
        let _ = line;
        None
    }
}

/// Random v4 UUID keys in their hyphenated text form.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidKeys;

impl KeyStrategy for UuidKeys {
    fn generate(&self) -> Key {
        Uuid::new_v4().to_string()
    }

    // A compact record line starts with `{"__id":"` followed by the 36 character key.
    fn line_key<'a>(&self, line: &'a str) -> Option<&'a str> {
        let rest = line.strip_prefix(UUID_PREFIX)?;
        let key = rest.get(..UUID_LEN)?;
        (rest.as_bytes().get(UUID_LEN) == Some(&b'"')).then_some(key)
    }
}

/// The on-disk unit: a generated key and the entity it wraps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterRecord<S> {
    #[serde(rename = "__id")]
    pub key: Key,
    pub slave: S,
}

impl MasterRecord<Value> {
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line)?)
    }
}

/// Wraps entities into master records using a key strategy.
#[derive(Clone)]
pub struct MasterFactory {
    keys: Arc<dyn KeyStrategy>,
}

impl MasterFactory {
    pub fn new(keys: Arc<dyn KeyStrategy>) -> Self {
        Self { keys }
    }

    pub fn create<S>(&self, slave: S) -> MasterRecord<S> {
        MasterRecord {
            key: self.keys.generate(),
            slave,
        }
    }

    /// Reads the key of a record line, parsing only `__id` when the fast path does not apply.
    pub fn line_key(&self, line: &str) -> serde_json::Result<Option<Key>> {
        if let Some(key) = self.keys.line_key(line) {
            return Ok(Some(key.to_string()));
        }
        Ok(match extract(line, &[KEY_FIELD])? {
            Some(Value::String(key)) => Some(key),
            _ => None,
        })
    }
}

impl Default for MasterFactory {
    fn default() -> Self {
        Self::new(Arc::new(UuidKeys))
    }
}
