use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{commitment::CommitmentMode, error::Result};

pub const DEFAULT_AGGREGATION_STEP: u64 = 1 << 15;
pub const DEFAULT_STEPS_IN_BIGGEST_FILE: u64 = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Width of one aggregation step in transaction numbers. Files are
    /// aligned to multiples of this value.
    pub aggregation_step: u64,
    /// Transaction numbers kept hot in the MDB beyond the last built step.
    pub keep_in_db: u64,
    /// Upper bound of the merge ladder, in steps.
    pub steps_in_biggest_file: u64,
    pub workers: usize,
    pub commitment_mode: CommitmentMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".stratadb"),
            aggregation_step: DEFAULT_AGGREGATION_STEP,
            keep_in_db: 2 * DEFAULT_AGGREGATION_STEP,
            steps_in_biggest_file: DEFAULT_STEPS_IN_BIGGEST_FILE,
            workers: 1,
            commitment_mode: CommitmentMode::Direct,
        }
    }
}

impl StoreConfig {
    pub fn with_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&contents)?;
        Ok(cfg)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let cfg = Self::default();
            cfg.save(path)?;
            Ok(cfg)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn mdb_path(&self) -> PathBuf {
        self.data_dir.join("mdb")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn max_span(&self) -> u64 {
        self.aggregation_step * self.steps_in_biggest_file
    }
}
