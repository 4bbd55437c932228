//! Label mapping and the versioned model slot.
//!
//! Each training run produces one [`ModelBundle`]: the classifier state, the
//! label mapping that state was trained with, and a version number. Bundles
//! are persisted as a single file and replaced wholesale, so the model and
//! its mapping can never disagree on disk or in memory.

use crate::types::{LabelId, ModelState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

const BUNDLE_FILE: &str = "identity.json";

#[derive(Error, Debug)]
pub enum IdentityStoreError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {source}", path.display())]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Generation counter of trained models. Increases by one per training run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelVersion(pub u64);

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A label id qualified by the model version that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LabelRef {
    pub model_version: ModelVersion,
    pub label: LabelId,
}

/// Serialized form of one mapping entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEntry {
    pub id: LabelId,
    pub name: String,
}

/// Bidirectional `label id <-> name` association for one trained model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<LabelEntry>", into = "Vec<LabelEntry>")]
pub struct LabelMapping {
    by_id: BTreeMap<LabelId, String>,
    by_name: HashMap<String, LabelId>,
}

impl LabelMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `name`, assigning the next sequential id (from 1) if it is new.
    pub fn assign(&mut self, name: &str) -> LabelId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.by_id.len() as LabelId + 1;
        self.by_id.insert(id, name.to_string());
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn name_for(&self, id: LabelId) -> Option<&str> {
        self.by_id.get(&id).map(String::as_str)
    }

    pub fn id_for(&self, name: &str) -> Option<LabelId> {
        self.by_name.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }
}

impl From<Vec<LabelEntry>> for LabelMapping {
    fn from(entries: Vec<LabelEntry>) -> Self {
        let mut mapping = Self::default();
        for entry in entries {
            mapping.by_name.insert(entry.name.clone(), entry.id);
            mapping.by_id.insert(entry.id, entry.name);
        }
        mapping
    }
}

impl From<LabelMapping> for Vec<LabelEntry> {
    fn from(mapping: LabelMapping) -> Self {
        mapping
            .by_id
            .into_iter()
            .map(|(id, name)| LabelEntry { id, name })
            .collect()
    }
}

/// A trained model together with the mapping it was trained against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBundle {
    pub version: ModelVersion,
    pub trained_at: DateTime<Utc>,
    pub mapping: LabelMapping,
    pub model: ModelState,
}

impl ModelBundle {
    pub fn label_ref(&self, label: LabelId) -> LabelRef {
        LabelRef { model_version: self.version, label }
    }

    /// Resolve a label to a name. References minted by another model version
    /// never resolve.
    pub fn resolve(&self, label: LabelRef) -> Option<&str> {
        if label.model_version != self.version {
            return None;
        }
        self.mapping.name_for(label.label)
    }
}

/// Persisted home of the current [`ModelBundle`].
///
/// Readers get an `Arc` snapshot and keep using it even if a retrain
/// publishes a newer bundle meanwhile.
pub struct IdentityStore {
    dir: PathBuf,
    current: RwLock<Option<Arc<ModelBundle>>>,
    publish_lock: Mutex<()>,
}

impl IdentityStore {
    /// Open the store in `dir`, loading the persisted bundle if there is one.
    ///
    /// An unreadable bundle is logged and treated as "not trained yet".
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let current = match load_bundle(&dir.join(BUNDLE_FILE)) {
            Ok(Some(bundle)) => {
                tracing::info!(
                    version = %bundle.version,
                    identities = bundle.mapping.len(),
                    "loaded trained model"
                );
                Some(Arc::new(bundle))
            }
            Ok(None) => {
                tracing::info!(dir = %dir.display(), "no trained model yet");
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable trained model");
                None
            }
        };

        Self {
            dir,
            current: RwLock::new(current),
            publish_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the current bundle, `None` before the first training.
    pub fn current(&self) -> Option<Arc<ModelBundle>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist a new bundle built from `mapping` and `model`, then make it current.
    ///
    /// The file is written to a temporary path and renamed into place; the
    /// in-memory slot only changes after the rename succeeded.
    pub fn publish(
        &self,
        mapping: LabelMapping,
        model: ModelState,
    ) -> Result<Arc<ModelBundle>, IdentityStoreError> {
        let _guard = self.publish_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let version = match self.current() {
            Some(prev) => ModelVersion(prev.version.0 + 1),
            None => ModelVersion(1),
        };
        let bundle = ModelBundle {
            version,
            trained_at: Utc::now(),
            mapping,
            model,
        };

        std::fs::create_dir_all(&self.dir).map_err(|source| IdentityStoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(BUNDLE_FILE);
        let tmp = self.dir.join(format!("{BUNDLE_FILE}.tmp"));
        let encoded = serde_json::to_vec(&bundle).map_err(|source| IdentityStoreError::Serde {
            path: path.clone(),
            source,
        })?;

        write_synced(&tmp, &encoded).map_err(|source| IdentityStoreError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| IdentityStoreError::Io {
            path: path.clone(),
            source,
        })?;

        let bundle = Arc::new(bundle);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(bundle.clone());
        Ok(bundle)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

fn load_bundle(path: &Path) -> Result<Option<ModelBundle>, IdentityStoreError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(IdentityStoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| IdentityStoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
}
