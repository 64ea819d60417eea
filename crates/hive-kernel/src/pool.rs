use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use hive_db::{Store, StoreError};
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::{sync::Mutex as BuildLock, task::JoinHandle};
use tracing::{debug, info, instrument, warn};

use crate::{short_id, CodeLoader, RuntimeConfig, Vm, VmError, VmLimits};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("vmpool: load code for workspace {workspace}: {source:#}")]
    Loader {
        workspace: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("vmpool: no logic code deployed for workspace {0}")]
    NotDeployed(String),
    #[error("vmpool: {0}")]
    Store(#[from] StoreError),
    #[error("vmpool: {0}")]
    Vm(#[from] VmError),
}

#[derive(Default)]
struct PoolState {
    vms: HashMap<String, Arc<Vm>>,
    last_access: HashMap<String, Instant>,
}

impl PoolState {
    fn remove(&mut self, workspace_id: &str) -> Option<Arc<Vm>> {
        self.last_access.remove(workspace_id);
        self.vms.remove(workspace_id)
    }

    /// Least recently used workspace; ties fall to the smaller id.
    fn oldest(&self) -> Option<String> {
        self.last_access
            .iter()
            .min_by(|a, b| a.1.cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(ws, _)| ws.clone())
    }
}

/// Cache of live VMs keyed by workspace, kept coherent with the deployed code.
///
/// `get_or_create` asks the loader for the current hash on every call and
/// rebuilds when it differs from the cached VM. Builds for one workspace are
/// serialised by a per-workspace lock so different workspaces build in
/// parallel.
pub struct VmPool {
    store: Store,
    loader: Arc<dyn CodeLoader>,
    max_vms: usize,
    limits: VmLimits,
    state: RwLock<PoolState>,
    build_locks: Mutex<HashMap<String, Arc<BuildLock<()>>>>,
}

impl VmPool {
    pub fn new(store: Store, loader: Arc<dyn CodeLoader>, config: &RuntimeConfig) -> Self {
        Self {
            store,
            loader,
            max_vms: config.effective_max_vms(),
            limits: config.vm_limits(),
            state: RwLock::new(PoolState::default()),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn max_vms(&self) -> usize {
        self.max_vms
    }

    #[instrument(skip(self), fields(workspace = %short_id(workspace_id)))]
    pub async fn get_or_create(&self, workspace_id: &str) -> Result<Arc<Vm>, PoolError> {
        let (source, hash) = self
            .loader
            .get(workspace_id)
            .await
            .map_err(|source| PoolError::Loader {
                workspace: workspace_id.to_string(),
                source,
            })?;
        if source.is_empty() {
            return Err(PoolError::NotDeployed(workspace_id.to_string()));
        }

        if let Some(vm) = self.cached(workspace_id, &hash) {
            return Ok(vm);
        }

        let build_lock = self.build_lock(workspace_id);
        let result = {
            let _guard = build_lock.lock().await;
            self.build(workspace_id, source, &hash).await
        };
        self.release_build_lock(workspace_id, &build_lock);
        result
    }

    fn cached(&self, workspace_id: &str, hash: &str) -> Option<Arc<Vm>> {
        let vm = {
            let state = self.state.read();
            state
                .vms
                .get(workspace_id)
                .filter(|vm| vm.code_hash() == hash)
                .cloned()
        }?;
        let mut state = self.state.write();
        // A concurrent invalidate may have removed the entry in between.
        if state.vms.contains_key(workspace_id) {
            state.last_access.insert(workspace_id.to_string(), Instant::now());
        }
        Some(vm)
    }

    async fn build(&self, workspace_id: &str, source: String, hash: &str) -> Result<Arc<Vm>, PoolError> {
        if let Some(vm) = self.cached(workspace_id, hash) {
            debug!(workspace = %short_id(workspace_id), "built by a concurrent caller");
            return Ok(vm);
        }

        let db = self.store.get_db(workspace_id).await?;
        let vm = Arc::new(Vm::spawn(workspace_id, source, db, self.limits).await?);
        if vm.code_hash() != hash {
            warn!(
                workspace = %short_id(workspace_id),
                loader_hash = %hash,
                vm_hash = %vm.code_hash(),
                "loader hash does not match content hash"
            );
        }

        let evicted = {
            let mut state = self.state.write();
            let replaced = state.vms.insert(workspace_id.to_string(), Arc::clone(&vm)).is_some();
            state.last_access.insert(workspace_id.to_string(), Instant::now());
            if replaced {
                info!(workspace = %short_id(workspace_id), "vm rebuilt for new code");
            }
            match state.oldest() {
                Some(oldest) if state.vms.len() > self.max_vms => {
                    state.remove(&oldest);
                    Some(oldest)
                }
                _ => None,
            }
        };
        if let Some(evicted) = evicted {
            info!(workspace = %short_id(&evicted), max_vms = self.max_vms, "evicted least recently used vm");
        }
        Ok(vm)
    }

    fn build_lock(&self, workspace_id: &str) -> Arc<BuildLock<()>> {
        Arc::clone(
            self.build_locks
                .lock()
                .entry(workspace_id.to_string())
                .or_default(),
        )
    }

    fn release_build_lock(&self, workspace_id: &str, lock: &Arc<BuildLock<()>>) {
        let mut locks = self.build_locks.lock();
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) <= 2 {
            locks.remove(workspace_id);
        }
    }

    /// Drops the cached VM so the next `get_or_create` rebuilds it.
    pub fn invalidate(&self, workspace_id: &str) {
        if self.state.write().remove(workspace_id).is_some() {
            debug!(workspace = %short_id(workspace_id), "vm invalidated");
        }
    }

    /// Drops VMs idle for longer than `max_idle`, returning how many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.state.write();
        let stale: Vec<String> = state
            .last_access
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > max_idle)
            .map(|(ws, _)| ws.clone())
            .collect();
        for ws in &stale {
            state.remove(ws);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "evicted idle vms");
        }
        stale.len()
    }

    /// Periodically runs [`VmPool::evict_idle`] until the pool is dropped.
    pub fn spawn_idle_evictor(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.evict_idle(max_idle);
            }
        })
    }

    pub fn len(&self) -> usize {
        self.state.read().vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, workspace_id: &str) -> bool {
        self.state.read().vms.contains_key(workspace_id)
    }

    /// Empties the cache. The store is left open; close it afterwards.
    pub fn close(&self) {
        let mut state = self.state.write();
        let count = state.vms.len();
        state.vms.clear();
        state.last_access.clear();
        info!(count, "vm pool closed");
    }
}

impl std::fmt::Debug for VmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmPool")
            .field("max_vms", &self.max_vms)
            .field("limits", &self.limits)
            .field("len", &self.len())
            .finish()
    }
}
