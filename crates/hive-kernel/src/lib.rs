//! Hive workspace runtime.
//!
//! Each workspace deploys a single JavaScript source that declares its HTTP
//! routes through `exports.routes`. The [`VmPool`] keeps one sandboxed
//! [`Vm`] per workspace, rebuilt whenever the deployed code changes, and every
//! VM talks to its workspace database through the `db` bridge object backed by
//! [`hive_db::Store`].

mod bridge;
mod loader;
mod pool;
pub mod router;
mod vm;

use std::{path::PathBuf, time::Duration};

use hive_db::{default_pragmas, StoreConfig};

pub use bridge::BridgeError;
pub use loader::{content_hash, CodeLoader, FsCodeLoader, MemoryCodeLoader};
pub use pool::{PoolError, VmPool};
pub use vm::{shape_response, Vm, VmError, VmLimits, VmRequest, VmResponse, VmUser};

pub const DEFAULT_MAX_VMS: usize = 100;
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CODE_SIZE_LIMIT: usize = 1024 * 1024;
pub const DEFAULT_IDLE_EVICTION: Duration = Duration::from_secs(30 * 60);

/// Tunables for the store, the pool and every VM it builds.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_dir: PathBuf,
    /// Upper bound on cached VMs; zero or negative selects [`DEFAULT_MAX_VMS`].
    pub max_vms: i64,
    pub vm_load_timeout: Duration,
    pub vm_exec_timeout: Duration,
    pub vm_code_size_limit: usize,
    pub sqlite_pragmas: Vec<(String, String)>,
    /// Idle VMs older than this are swept; `None` disables the sweeper.
    pub idle_eviction: Option<Duration>,
}

impl RuntimeConfig {
    pub fn effective_max_vms(&self) -> usize {
        usize::try_from(self.max_vms)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_VMS)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            base_dir: self.base_dir.clone(),
            pragmas: self.sqlite_pragmas.clone(),
        }
    }

    pub fn vm_limits(&self) -> VmLimits {
        VmLimits {
            load_timeout: self.vm_load_timeout,
            exec_timeout: self.vm_exec_timeout,
            max_code_size: self.vm_code_size_limit,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("data/vm"),
            max_vms: DEFAULT_MAX_VMS as i64,
            vm_load_timeout: DEFAULT_LOAD_TIMEOUT,
            vm_exec_timeout: DEFAULT_EXEC_TIMEOUT,
            vm_code_size_limit: DEFAULT_CODE_SIZE_LIMIT,
            sqlite_pragmas: default_pragmas(),
            idle_eviction: Some(DEFAULT_IDLE_EVICTION),
        }
    }
}

/// First eight characters of a workspace id, used as a log tag.
pub(crate) fn short_id(workspace_id: &str) -> &str {
    match workspace_id.char_indices().nth(8) {
        Some((idx, _)) => &workspace_id[..idx],
        None => workspace_id,
    }
}
