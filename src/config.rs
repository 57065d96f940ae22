//! # Store configuration
//!
//! [`StoreConfig`] gathers every store-level tunable: the backing file path,
//! the target vector dimension, the active similarity kernel, the dimension
//! adaptation policy, and the HNSW/IVF/FTS/backup sub-configs. It is a plain
//! serde struct, loadable from YAML, with a `Default` impl that gives sane
//! values for local development.
//!
//! ## Loading
//!
//! ```no_run
//! use vectorlite::config::StoreConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StoreConfig::from_yaml_file("store.yaml")?;
//! # Ok(())
//! # }
//! ```
//!
//! Or construct one programmatically for embedding into a host application:
//!
//! ```
//! use vectorlite::config::StoreConfig;
//!
//! let config = StoreConfig::new("my_store.db");
//! assert_eq!(config.vector_dim, 0);
//! ```

use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::dimension::DimensionPolicy;
use crate::error::{Result, StoreError};
use crate::similarity::SimilarityKind;

/// HNSW sub-configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Whether the HNSW index is built/maintained at all.
    pub enabled: bool,
    /// Max neighbors per node per layer (`M`). `M0 = 2*M` at layer 0.
    pub m: usize,
    /// Beam width used while inserting nodes.
    pub ef_construction: usize,
    /// Beam width used while searching, absent a per-query override.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// IVF sub-configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IvfConfig {
    /// Whether the IVF index is built/maintained at all.
    pub enabled: bool,
    /// Number of k-means clusters. `0` means "derive as `sqrt(N)`."
    pub n_clusters: usize,
    /// Number of cells probed per query. `0` means "derive as
    /// `max(1, n_clusters / 16)`."
    pub n_probe: usize,
}

impl Default for IvfConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            n_clusters: 0,
            n_probe: 0,
        }
    }
}

/// Full-text search sub-configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FtsConfig {
    /// Whether the `chunks_fts` mirror and its triggers are active.
    pub enabled: bool,
}

impl Default for FtsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Backup sub-configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Default destination path for [`crate::store::Store::backup`] when the
    /// caller does not supply one explicitly.
    pub path: Option<String>,
}

/// Complete configuration for a [`crate::store::Store`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the backing SQLite file. `":memory:"` for an ephemeral store.
    pub path: String,
    /// Target vector dimension. `0` means auto-detect from the first insert.
    pub vector_dim: usize,
    /// Active similarity kernel for scoring and ranking.
    pub similarity_fn: SimilarityKind,
    /// Policy used to reconcile a vector's native length with the
    /// collection's target dimension.
    pub auto_dim_adapt: DimensionPolicy,
    /// Whether vectors are L2-renormalized after dimension adaptation.
    pub auto_normalize: bool,
    /// HNSW index tuning.
    pub hnsw: HnswConfig,
    /// IVF index tuning.
    pub ivf: IvfConfig,
    /// Full-text search tuning.
    pub fts: FtsConfig,
    /// Backup tuning.
    pub backup: BackupConfig,
    /// Collection size at or above which the query planner prefers HNSW
    /// over brute-force.
    pub hnsw_min_collection_size: usize,
}

impl StoreConfig {
    /// A minimal config pointing at `path`, with every other field at its
    /// default.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Load a [`StoreConfig`] from a YAML file on disk.
    ///
    /// # Errors
    /// [`StoreError::Internal`] if the file cannot be read, or
    /// [`StoreError::Corrupted`] if it cannot be parsed as YAML.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .map_err(|e| StoreError::internal("load_config", e))?;
        Self::from_yaml_str(&text)
    }

    /// Parse a [`StoreConfig`] from a YAML string.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| StoreError::corrupted("load_config", e.to_string()))
    }

    /// Serialize this config to a YAML string.
    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| StoreError::internal("save_config", e))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "vectorlite.db".to_string(),
            vector_dim: 0,
            similarity_fn: SimilarityKind::CosineSimilarity,
            auto_dim_adapt: DimensionPolicy::SmartAdapt,
            auto_normalize: true,
            hnsw: HnswConfig::default(),
            ivf: IvfConfig::default(),
            fts: FtsConfig::default(),
            backup: BackupConfig::default(),
            hnsw_min_collection_size: 256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_auto_detect_dimension() {
        let config = StoreConfig::default();
        assert_eq!(config.vector_dim, 0);
        assert_eq!(config.similarity_fn, SimilarityKind::CosineSimilarity);
        assert!(config.hnsw.enabled);
        assert!(!config.ivf.enabled);
    }

    #[test]
    fn yaml_round_trip() {
        let config = StoreConfig::new("test.db");
        let yaml = config.to_yaml_string().unwrap();
        let parsed = StoreConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn new_overrides_only_path() {
        let config = StoreConfig::new("custom.db");
        assert_eq!(config.path, "custom.db");
        assert_eq!(config.hnsw_min_collection_size, 256);
    }

    #[test]
    fn corrupted_yaml_is_an_error() {
        let err = StoreConfig::from_yaml_str("not: valid: yaml: [").unwrap_err();
        assert!(matches!(err, StoreError::Corrupted { .. }));
    }
}
