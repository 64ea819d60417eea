use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{bail, Context, Result};
use hive_kernel::{RuntimeConfig, DEFAULT_IDLE_EVICTION};

/// Daemon settings read from `HIVE_*` environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub code_dir: PathBuf,
    pub runtime: RuntimeConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("HIVE_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid HIVE_API_ADDR")?;

        let mut runtime = RuntimeConfig::default();
        if let Some(dir) = lookup("HIVE_BASE_DIR") {
            runtime.base_dir = PathBuf::from(dir);
        }
        let code_dir = lookup("HIVE_CODE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/code"));

        if let Some(max) = parse_var::<i64>(&lookup, "HIVE_MAX_VMS")? {
            runtime.max_vms = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "HIVE_VM_LOAD_TIMEOUT_MS")? {
            runtime.vm_load_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "HIVE_VM_EXEC_TIMEOUT_MS")? {
            runtime.vm_exec_timeout = Duration::from_millis(ms);
        }
        if let Some(bytes) = parse_var::<usize>(&lookup, "HIVE_VM_MAX_CODE_SIZE")? {
            runtime.vm_code_size_limit = bytes;
        }
        runtime.idle_eviction = match parse_var::<u64>(&lookup, "HIVE_VM_EVICT_INTERVAL_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_IDLE_EVICTION),
        };
        if let Some(raw) = lookup("HIVE_SQLITE_PRAGMAS") {
            runtime.sqlite_pragmas = parse_pragmas(&raw)?;
        }

        Ok(Self {
            listen_addr,
            code_dir,
            runtime,
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {key}={value:?}")),
    }
}

/// Parses `name=value,name=value`, keeping the given order.
pub fn parse_pragmas(raw: &str) -> Result<Vec<(String, String)>> {
    let mut pragmas = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let Some((name, value)) = item.split_once('=') else {
            bail!("invalid HIVE_SQLITE_PRAGMAS entry {item:?}: expected name=value");
        };
        let (name, value) = (name.trim(), value.trim());
        if name.is_empty() || value.is_empty() {
            bail!("invalid HIVE_SQLITE_PRAGMAS entry {item:?}: expected name=value");
        }
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid HIVE_SQLITE_PRAGMAS name {name:?}");
        }
        pragmas.push((name.to_string(), value.to_string()));
    }
    Ok(pragmas)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.code_dir, PathBuf::from("data/code"));
        assert_eq!(config.runtime.base_dir, PathBuf::from("data/vm"));
        assert_eq!(config.runtime.effective_max_vms(), 100);
        assert_eq!(config.runtime.idle_eviction, Some(DEFAULT_IDLE_EVICTION));
        assert_eq!(config.runtime.sqlite_pragmas[0].0, "journal_mode");
    }

    #[test]
    fn overrides_are_applied() {
        let config = config(&[
            ("HIVE_API_ADDR", "0.0.0.0:9000"),
            ("HIVE_BASE_DIR", "/tmp/vm"),
            ("HIVE_MAX_VMS", "7"),
            ("HIVE_VM_LOAD_TIMEOUT_MS", "250"),
            ("HIVE_VM_EXEC_TIMEOUT_MS", "1500"),
            ("HIVE_VM_MAX_CODE_SIZE", "2048"),
            ("HIVE_VM_EVICT_INTERVAL_SECS", "0"),
            ("HIVE_SQLITE_PRAGMAS", "journal_mode=DELETE, foreign_keys=OFF"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.runtime.base_dir, PathBuf::from("/tmp/vm"));
        assert_eq!(config.runtime.max_vms, 7);
        assert_eq!(config.runtime.vm_load_timeout, Duration::from_millis(250));
        assert_eq!(config.runtime.vm_exec_timeout, Duration::from_millis(1500));
        assert_eq!(config.runtime.vm_code_size_limit, 2048);
        assert_eq!(config.runtime.idle_eviction, None);
        assert_eq!(
            config.runtime.sqlite_pragmas,
            vec![
                ("journal_mode".to_string(), "DELETE".to_string()),
                ("foreign_keys".to_string(), "OFF".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(config(&[("HIVE_MAX_VMS", "many")]).is_err());
        assert!(config(&[("HIVE_API_ADDR", "nowhere")]).is_err());
        assert!(config(&[("HIVE_SQLITE_PRAGMAS", "journal_mode")]).is_err());
        assert!(config(&[("HIVE_SQLITE_PRAGMAS", "bad name=1")]).is_err());
    }

    #[test]
    fn blank_numeric_values_keep_defaults() {
        let config = config(&[("HIVE_VM_EXEC_TIMEOUT_MS", "  ")]).unwrap();
        assert_eq!(config.runtime.vm_exec_timeout, Duration::from_secs(10));
    }
}
