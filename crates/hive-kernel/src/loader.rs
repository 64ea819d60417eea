use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tokio::fs;

/// Hex SHA-256 of a code source; the same digest a [`crate::Vm`] reports.
pub fn content_hash(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Source of deployed workspace code.
///
/// Returns `(source, hash)`. An empty source means nothing is deployed. The
/// hash is compared against [`crate::Vm::code_hash`], so implementations
/// should produce it with [`content_hash`].
#[async_trait]
pub trait CodeLoader: Send + Sync {
    async fn get(&self, workspace_id: &str) -> Result<(String, String)>;
}

/// Reads `<dir>/<workspace>.js`; a missing file is "not deployed".
#[derive(Debug, Clone)]
pub struct FsCodeLoader {
    dir: PathBuf,
}

impl FsCodeLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, workspace_id: &str) -> PathBuf {
        self.dir.join(format!("{workspace_id}.js"))
    }
}

#[async_trait]
impl CodeLoader for FsCodeLoader {
    async fn get(&self, workspace_id: &str) -> Result<(String, String)> {
        hive_db::validate_workspace_id(workspace_id)?;
        let path = self.path_for(workspace_id);
        match fs::read_to_string(&path).await {
            Ok(source) => {
                let hash = content_hash(&source);
                Ok((source, hash))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok((String::new(), String::new())),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }
}

/// In-process loader for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryCodeLoader {
    sources: RwLock<HashMap<String, String>>,
}

impl MemoryCodeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deploy(&self, workspace_id: impl Into<String>, source: impl Into<String>) {
        self.sources.write().insert(workspace_id.into(), source.into());
    }

    pub fn remove(&self, workspace_id: &str) {
        self.sources.write().remove(workspace_id);
    }
}

#[async_trait]
impl CodeLoader for MemoryCodeLoader {
    async fn get(&self, workspace_id: &str) -> Result<(String, String)> {
        let source = self
            .sources
            .read()
            .get(workspace_id)
            .cloned()
            .unwrap_or_default();
        let hash = if source.is_empty() {
            String::new()
        } else {
            content_hash(&source)
        };
        Ok((source, hash))
    }
}
