// SPDX-License-Identifier: MIT
//! Daemon configuration.
//!
//! Three layers feed [`HiveConfig`]: whatever clap resolved from flags and
//! environment variables wins outright, an optional `config.toml` under the
//! data root fills the remaining gaps, and compiled defaults cover the rest.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7300";
const DEFAULT_BACKEND: &str = "docker";
const DEFAULT_IMAGE: &str = "hived-bee:latest";
const DEFAULT_RUNTIME_DEADLINE_SECS: u64 = 30;

// ─── config.toml overlay ──────────────────────────────────────────────────────

/// The subset of settings a `config.toml` in the data root may override.
/// Every field is optional; absent fields leave the layer above untouched.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// Gateway listen address, e.g. "127.0.0.1:7300".
    listen_addr: Option<String>,
    /// Log level filter string, e.g. "debug", "info,hived=trace".
    log: Option<String>,
    /// Container backend selector: "docker" or "none".
    container_backend: Option<String>,
    /// Image used for agent containers.
    container_image: Option<String>,
    /// Per-call deadline for container runtime operations, in seconds.
    runtime_deadline_secs: Option<u64>,
    /// Seed human↔bee edges whenever a bee is added.
    auto_connect_human: Option<bool>,
    /// Model-provider API key handed to agent containers. Prefer the
    /// PROVIDER_API_KEY env var; the TOML field exists for dev setups.
    provider_api_key: Option<String>,
}

fn load_toml(data_root: &Path) -> TomlConfig {
    let path = data_root.join("config.toml");
    let Ok(contents) = std::fs::read_to_string(&path) else {
        return TomlConfig::default();
    };
    toml::from_str(&contents).unwrap_or_else(|e| {
        error!(path = %path.display(), err = %e, "config.toml is not valid TOML, ignoring it");
        TomlConfig::default()
    })
}

// ─── HiveConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HiveConfig {
    /// Root of all persisted state (DATA_ROOT).
    pub data_root: PathBuf,
    /// Gateway listen address (LISTEN_ADDR).
    pub listen_addr: String,
    pub log: String,
    /// Container backend selector (CONTAINER_BACKEND).
    pub container_backend: String,
    pub container_image: String,
    /// Per-call deadline for container runtime operations.
    pub runtime_deadline: Duration,
    /// Seed human↔bee edges on node.add.
    pub auto_connect_human: bool,
    /// Required to start agents (PROVIDER_API_KEY).
    pub provider_api_key: Option<String>,
}

impl HiveConfig {
    /// Resolve the effective configuration. `Some` arguments are what clap
    /// already pulled from flags or environment; `None` falls through to
    /// `config.toml` and then to the defaults.
    pub fn new(
        data_root: Option<PathBuf>,
        listen_addr: Option<String>,
        log: Option<String>,
        container_backend: Option<String>,
    ) -> HiveConfig {
        let data_root = data_root.unwrap_or_else(default_data_root);
        let toml = load_toml(&data_root);

        let listen_addr = listen_addr
            .or(toml.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());
        let container_backend = container_backend
            .or(toml.container_backend)
            .unwrap_or_else(|| DEFAULT_BACKEND.to_string());
        let container_image = toml
            .container_image
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let runtime_deadline = Duration::from_secs(
            toml.runtime_deadline_secs
                .unwrap_or(DEFAULT_RUNTIME_DEADLINE_SECS),
        );
        let auto_connect_human = toml.auto_connect_human.unwrap_or(false);

        let provider_api_key = std::env::var("PROVIDER_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or(toml.provider_api_key);

        HiveConfig {
            data_root,
            listen_addr,
            log,
            container_backend,
            container_image,
            runtime_deadline,
            auto_connect_human,
            provider_api_key,
        }
    }
}

fn default_data_root() -> PathBuf {
    // An explicit DATA_ROOT is used verbatim, never suffixed.
    if let Some(root) = std::env::var("DATA_ROOT").ok().filter(|v| !v.is_empty()) {
        return PathBuf::from(root);
    }
    platform_data_base()
        .map(|base| base.join("hived"))
        // No conventional location resolvable: stay relative.
        .unwrap_or_else(|| PathBuf::from(".hived"))
}

/// Where this platform keeps per-user application data, if resolvable.
#[cfg(target_os = "linux")]
fn platform_data_base() -> Option<PathBuf> {
    let env_dir = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
    env_dir("XDG_DATA_HOME")
        .map(PathBuf::from)
        .or_else(|| env_dir("HOME").map(|home| PathBuf::from(home).join(".local/share")))
}

#[cfg(target_os = "macos")]
fn platform_data_base() -> Option<PathBuf> {
    let home = std::env::var("HOME").ok().filter(|v| !v.is_empty())?;
    Some(PathBuf::from(home).join("Library/Application Support"))
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn platform_data_base() -> Option<PathBuf> {
    None
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_toml() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = HiveConfig::new(Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.container_backend, "docker");
        assert_eq!(cfg.runtime_deadline, Duration::from_secs(30));
        assert!(!cfg.auto_connect_human);
    }

    #[test]
    fn toml_overrides_defaults_and_cli_overrides_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "listen_addr = \"0.0.0.0:9999\"\ncontainer_backend = \"none\"\nauto_connect_human = true\nruntime_deadline_secs = 5\n",
        )
        .unwrap();

        let cfg = HiveConfig::new(Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(cfg.listen_addr, "0.0.0.0:9999");
        assert_eq!(cfg.container_backend, "none");
        assert!(cfg.auto_connect_human);
        assert_eq!(cfg.runtime_deadline, Duration::from_secs(5));

        // CLI wins over TOML.
        let cfg = HiveConfig::new(
            Some(dir.path().to_path_buf()),
            Some("127.0.0.1:1234".into()),
            None,
            Some("docker".into()),
        );
        assert_eq!(cfg.listen_addr, "127.0.0.1:1234");
        assert_eq!(cfg.container_backend, "docker");
    }

    #[test]
    fn malformed_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "listen_addr = [not toml").unwrap();
        let cfg = HiveConfig::new(Some(dir.path().to_path_buf()), None, None, None);
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
    }
}
