use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::relations::CascadeAction;
use crate::Result;

/// Environment variable naming the data directory.
pub const DATA_DIR_ENV: &str = "LINEDB_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "data";

/// Settings for opening an [`Engine`](crate::Engine).
///
/// ```json
/// {
///   "data_dir": "var/school",
///   "cascades": { "Student": { "grades": "delete_entity" } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one record file per collection.
    pub data_dir: PathBuf,
    /// Create `data_dir` on open instead of requiring it to exist.
    #[serde(default = "default_create_dirs")]
    pub create_dirs: bool,
    /// Delete actions per collection name and virtual field name.
    #[serde(default)]
    pub cascades: HashMap<String, HashMap<String, CascadeAction>>,
}

fn default_create_dirs() -> bool {
    true
}

impl EngineConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            create_dirs: default_create_dirs(),
            cascades: HashMap::new(),
        }
    }

    /// Uses `LINEDB_DATA_DIR`, or `data` when it is not set.
    pub fn from_env() -> Self {
        let data_dir = env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        Self::new(data_dir)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads a JSON config file.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text)
    }

    pub fn with_cascade(mut self, collection: &str, field: &str, action: CascadeAction) -> Self {
        self.cascades
            .entry(collection.to_string())
            .or_default()
            .insert(field.to_string(), action);
        self
    }

    pub fn create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_DIR)
    }
}
