//! Immutable configuration for locating run files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage;

/// How run folders are laid out below [`DataConfig::data_dir`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStructure {
    /// `<data_dir>/<YYYYMMDD>/<HHMMSS>_<name>/`
    #[default]
    Dated,
    /// `<data_dir>/<RUN_ID>/<user>/<uuid>_<name>/`
    Flat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory for all run folders
    pub data_dir: PathBuf,
    pub folder_structure: FolderStructure,
    /// Campaign identifier, only used by the flat layout
    pub run_id: String,
    /// Operator name, only used by the flat layout
    pub user: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            folder_structure: FolderStructure::Dated,
            run_id: "NO_RUN".to_string(),
            user: "John_Doe".to_string(),
        }
    }
}

impl DataConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_flat_layout(mut self, run_id: impl Into<String>, user: impl Into<String>) -> Self {
        self.folder_structure = FolderStructure::Flat;
        self.run_id = run_id.into();
        self.user = user.into();
        self
    }

    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        storage::load_yaml(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        storage::save_yaml(path, self)
    }
}
