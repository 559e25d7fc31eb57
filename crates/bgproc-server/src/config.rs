//! Server configuration: TOML file + CLI overrides.

use crate::service::ServiceSettings;
use crate::session::PtyOptions;
use bgproc_core::{ProcError, ProcResult};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub sessions: SessionsSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub pty: PtySection,
}

/// `[sessions]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionsSection {
    #[serde(default = "default_driver_timeout_ms")]
    pub driver_timeout_ms: u64,
    /// Seconds a finished session is kept before removal; 0 keeps it forever.
    #[serde(default)]
    pub reap_after_secs: u64,
    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,
}

impl Default for SessionsSection {
    fn default() -> Self {
        Self {
            driver_timeout_ms: default_driver_timeout_ms(),
            reap_after_secs: 0,
            reap_interval_secs: default_reap_interval_secs(),
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            max_limit: default_max_limit(),
        }
    }
}

/// `[pty]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct PtySection {
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for PtySection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cols: default_cols(),
            rows: default_rows(),
            env: HashMap::new(),
        }
    }
}

fn default_driver_timeout_ms() -> u64 {
    5000
}
fn default_reap_interval_secs() -> u64 {
    60
}
fn default_limit() -> usize {
    100
}
fn default_max_limit() -> usize {
    1000
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_cols() -> u16 {
    120
}
fn default_rows() -> u16 {
    40
}

/// Values given on the command line; `None` leaves the file setting alone.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub driver_timeout_ms: Option<u64>,
    pub reap_after_secs: Option<u64>,
    pub shell: Option<String>,
}

/// Resolved server configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub service: ServiceSettings,
    pub pty: PtyOptions,
    pub reap_after: Option<Duration>,
    pub reap_interval: Duration,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, overrides: &CliOverrides) -> ProcResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    fn resolve(file: ConfigFile, overrides: &CliOverrides) -> ProcResult<Self> {
        let driver_timeout_ms = overrides
            .driver_timeout_ms
            .unwrap_or(file.sessions.driver_timeout_ms);
        if driver_timeout_ms == 0 {
            return Err(ProcError::Config(
                "driver_timeout_ms must be greater than zero".into(),
            ));
        }
        if file.log.default_limit == 0 || file.log.max_limit == 0 {
            return Err(ProcError::Config("log limits must be greater than zero".into()));
        }
        if file.sessions.reap_interval_secs == 0 {
            return Err(ProcError::Config(
                "reap_interval_secs must be greater than zero".into(),
            ));
        }

        let reap_after_secs = overrides
            .reap_after_secs
            .unwrap_or(file.sessions.reap_after_secs);
        let shell = overrides.shell.clone().unwrap_or(file.pty.shell);

        Ok(Self {
            service: ServiceSettings {
                driver_timeout: Duration::from_millis(driver_timeout_ms),
                // A default page larger than the cap would just be clamped anyway.
                default_limit: file.log.default_limit.min(file.log.max_limit),
                max_limit: file.log.max_limit,
            },
            pty: PtyOptions {
                shell,
                cols: file.pty.cols,
                rows: file.pty.rows,
                env: file.pty.env,
            },
            reap_after: (reap_after_secs > 0).then(|| Duration::from_secs(reap_after_secs)),
            reap_interval: Duration::from_secs(file.sessions.reap_interval_secs),
        })
    }
}

fn parse(content: &str) -> ProcResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| ProcError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ServerConfig::resolve(parse("").unwrap(), &CliOverrides::default()).unwrap();
        assert_eq!(config.service.driver_timeout, Duration::from_secs(5));
        assert_eq!(config.service.default_limit, 100);
        assert_eq!(config.service.max_limit, 1000);
        assert_eq!(config.pty.shell, "/bin/sh");
        assert_eq!((config.pty.cols, config.pty.rows), (120, 40));
        assert!(config.reap_after.is_none());
        assert_eq!(config.reap_interval, Duration::from_secs(60));
    }

    #[test]
    fn sections_are_read() {
        let toml = r#"
            [sessions]
            driver_timeout_ms = 250
            reap_after_secs = 600

            [log]
            default_limit = 20
            max_limit = 200

            [pty]
            shell = "/bin/bash"
            cols = 80
            env = { LANG = "C.UTF-8" }
        "#;
        let config = ServerConfig::resolve(parse(toml).unwrap(), &CliOverrides::default()).unwrap();
        assert_eq!(config.service.driver_timeout, Duration::from_millis(250));
        assert_eq!(config.service.default_limit, 20);
        assert_eq!(config.service.max_limit, 200);
        assert_eq!(config.pty.shell, "/bin/bash");
        assert_eq!(config.pty.cols, 80);
        assert_eq!(config.pty.rows, 40);
        assert_eq!(config.pty.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
        assert_eq!(config.reap_after, Some(Duration::from_secs(600)));
    }

    #[test]
    fn cli_overrides_win() {
        let toml = "[sessions]\ndriver_timeout_ms = 250\nreap_after_secs = 600\n";
        let overrides = CliOverrides {
            driver_timeout_ms: Some(1000),
            reap_after_secs: Some(0),
            shell: Some("/bin/zsh".into()),
        };
        let config = ServerConfig::resolve(parse(toml).unwrap(), &overrides).unwrap();
        assert_eq!(config.service.driver_timeout, Duration::from_secs(1));
        assert!(config.reap_after.is_none());
        assert_eq!(config.pty.shell, "/bin/zsh");
    }

    #[test]
    fn default_limit_is_capped() {
        let toml = "[log]\ndefault_limit = 5000\nmax_limit = 50\n";
        let config = ServerConfig::resolve(parse(toml).unwrap(), &CliOverrides::default()).unwrap();
        assert_eq!(config.service.default_limit, 50);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(parse("[sessions]\ndriver_timeout_ms = \"soon\""), Err(ProcError::Config(_))));

        let zero = parse("[sessions]\ndriver_timeout_ms = 0").unwrap();
        assert!(matches!(
            ServerConfig::resolve(zero, &CliOverrides::default()),
            Err(ProcError::Config(_))
        ));

        let zero_limit = parse("[log]\nmax_limit = 0").unwrap();
        assert!(ServerConfig::resolve(zero_limit, &CliOverrides::default()).is_err());
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[pty]\nrows = 24\n").unwrap();
        let config = ServerConfig::load(Some(&path), &CliOverrides::default()).unwrap();
        assert_eq!(config.pty.rows, 24);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let path = Path::new("/nonexistent/bgproc/config.toml");
        let config = ServerConfig::load(Some(path), &CliOverrides::default()).unwrap();
        assert_eq!(config.service.max_limit, 1000);
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde(Path::new("~/.bgproc/config.toml")), home.join(".bgproc/config.toml"));
        }
        assert_eq!(expand_tilde(Path::new("/etc/bgproc.toml")), PathBuf::from("/etc/bgproc.toml"));
    }
}
