//! Host configuration, read once from the environment.

use std::path::PathBuf;
use std::sync::RwLock;

use once_cell::sync::Lazy;

const DEFAULT_FUNC_DIR: &str = "/usr/local/faas/wasm";
const DEFAULT_OMP_THREAD_POOL_SIZE: usize = 4;

/// Process-wide settings for the module host.
///
/// Every field can be overridden through a `WASMCELL_`-prefixed environment
/// variable; unset or unparseable values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Root directory the default loader reads function modules from, laid
    /// out as `<func_dir>/<user>/<function>/function.wasm`.
    pub func_dir: PathBuf,
    /// Upper bound on a bound module's linear memory in Wasm pages,
    /// independent of the module's own declared maximum. Zero disables the
    /// quota.
    pub memory_quota_pages: u32,
    /// Capture guest writes to stdout into a memfd instead of passing them
    /// through to the host process.
    pub capture_stdout: bool,
    /// Size of the host-local OpenMP thread pool created for top-level
    /// executions.
    pub omp_thread_pool_size: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            func_dir: PathBuf::from(DEFAULT_FUNC_DIR),
            memory_quota_pages: 0,
            capture_stdout: false,
            omp_thread_pool_size: DEFAULT_OMP_THREAD_POOL_SIZE,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            func_dir: std::env::var_os("WASMCELL_FUNC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.func_dir),
            memory_quota_pages: env_parse("WASMCELL_MEMORY_QUOTA_PAGES")
                .unwrap_or(defaults.memory_quota_pages),
            capture_stdout: env_parse("WASMCELL_CAPTURE_STDOUT")
                .unwrap_or(defaults.capture_stdout),
            omp_thread_pool_size: env_parse("WASMCELL_OMP_THREAD_POOL_SIZE")
                .unwrap_or(defaults.omp_thread_pool_size),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|v| v.parse().ok())
}

static GLOBAL_CONFIG: Lazy<RwLock<HostConfig>> =
    Lazy::new(|| RwLock::new(HostConfig::from_env()));

/// Snapshot of the process-wide configuration.
pub fn global() -> HostConfig {
    GLOBAL_CONFIG.read().unwrap().clone()
}

/// Replaces the process-wide configuration. Intended for host start-up and
/// tests; changing it after modules are bound only affects later binds.
pub fn set_global(config: HostConfig) {
    *GLOBAL_CONFIG.write().unwrap() = config;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HostConfig::default();
        assert_eq!(config.memory_quota_pages, 0);
        assert!(!config.capture_stdout);
        assert!(config.omp_thread_pool_size > 0);
    }

    #[test]
    fn global_config_round_trips() {
        let before = global();

        let mut updated = before.clone();
        updated.memory_quota_pages = 1234;
        set_global(updated);
        assert_eq!(global().memory_quota_pages, 1234);

        set_global(before);
    }
}
