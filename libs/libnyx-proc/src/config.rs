//! Process model configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Process model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcConfig {
    /// Directory holding the shared table and its lock file
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Well-known name shared by every instance of one emulated system
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Number of pid slots, including the unused slot 0
    #[serde(default = "default_table_capacity")]
    pub table_capacity: usize,

    /// Maximum number of unreaped children per instance
    #[serde(default = "default_child_capacity")]
    pub child_capacity: usize,

    /// Values reported through getrlimit
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            namespace: default_namespace(),
            table_capacity: default_table_capacity(),
            child_capacity: default_child_capacity(),
            limits: LimitsConfig::default(),
        }
    }
}

/// Reported resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// RLIMIT_STACK (bytes)
    #[serde(default = "default_stack_size")]
    pub stack_size: u64,

    /// RLIMIT_NPROC
    #[serde(default = "default_max_processes")]
    pub max_processes: u64,

    /// RLIMIT_NOFILE
    #[serde(default = "default_max_open_files")]
    pub max_open_files: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            stack_size: default_stack_size(),
            max_processes: default_max_processes(),
            max_open_files: default_max_open_files(),
        }
    }
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/dev/shm/nyx")
}

fn default_namespace() -> String {
    "nyx-proc".to_string()
}

fn default_table_capacity() -> usize {
    4096
}

fn default_child_capacity() -> usize {
    1024
}

fn default_stack_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_processes() -> u64 {
    65536
}

fn default_max_open_files() -> u64 {
    1024
}

impl ProcConfig {
    /// Load configuration from file, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_yaml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Configuration rooted at a different runtime directory
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// Reject sizes the table cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.table_capacity < 3 {
            anyhow::bail!(
                "table_capacity must leave room for init and one process (got {})",
                self.table_capacity
            );
        }
        if self.table_capacity > i32::MAX as usize {
            anyhow::bail!("table_capacity {} does not fit a pid", self.table_capacity);
        }
        if self.child_capacity == 0 {
            anyhow::bail!("child_capacity must be non-zero");
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            anyhow::bail!("invalid namespace {:?}", self.namespace);
        }
        Ok(())
    }

    /// Path of the shared table region
    pub fn region_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.table", self.namespace))
    }

    /// Path of the cross-process lock
    pub fn lock_path(&self) -> PathBuf {
        self.runtime_dir.join(format!("{}.lock", self.namespace))
    }
}
