//! Configuration file management for eyes.
//!
//! Provides a TOML-based config file at `~/.config/eyes/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use eyes_core::ControllerConfig;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1";
pub const DEFAULT_HTTP_PORT: u16 = 12122;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub http: HttpSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// Address agents connect to.
    pub listen_addr: String,
    pub result_channel_capacity: usize,
    pub disconnect_channel_capacity: usize,
    /// Forget unanswered probes after this many seconds. Unset keeps them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_ttl_secs: Option<u64>,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            listen_addr: ControllerConfig::DEFAULT_LISTEN_ADDR.to_string(),
            result_channel_capacity: ControllerConfig::DEFAULT_RESULT_CHANNEL_CAPACITY,
            disconnect_channel_capacity: ControllerConfig::DEFAULT_DISCONNECT_CHANNEL_CAPACITY,
            pending_ttl_secs: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub bind: String,
    pub port: u16,
    /// How long `POST /api/agents/{id}/probe` waits for a result.
    pub probe_timeout_secs: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_HTTP_BIND.to_string(),
            port: DEFAULT_HTTP_PORT,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the eyes config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/eyes` or `~/.config/eyes`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("eyes");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("eyes")
}

/// Return the path to the eyes config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the `eyes serve` command line.
#[derive(Debug, Default)]
pub struct ServeOverrides {
    pub listen: Option<String>,
    pub http_bind: Option<String>,
    pub http_port: Option<u16>,
    pub probe_timeout_secs: Option<u64>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct EyesConfig {
    pub controller: ControllerConfig,
    pub http_bind: String,
    pub http_port: u16,
    pub probe_timeout: Duration,
}

impl EyesConfig {
    /// Resolve using the chain: CLI flag > env var > config file > default.
    ///
    /// - Listen address: `--listen` > `EYES_LISTEN_ADDR` > `controller.listen_addr`
    /// - HTTP bind: `--http-bind` > `EYES_HTTP_BIND` > `http.bind`
    /// - HTTP port: `--http-port` > `EYES_HTTP_PORT` > `http.port`
    /// - Probe timeout: `--probe-timeout` > `EYES_PROBE_TIMEOUT_SECS` > `http.probe_timeout_secs`
    ///
    /// A missing config file falls through to the defaults; a malformed one
    /// is an error.
    pub fn resolve(cli: &ServeOverrides) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            load_config(&path)?
        } else {
            ConfigFile::default()
        };
        Self::resolve_with(cli, file)
    }

    fn resolve_with(cli: &ServeOverrides, file: ConfigFile) -> Result<Self> {
        let listen_addr = cli
            .listen
            .clone()
            .or_else(|| std::env::var("EYES_LISTEN_ADDR").ok())
            .unwrap_or(file.controller.listen_addr);

        let http_bind = cli
            .http_bind
            .clone()
            .or_else(|| std::env::var("EYES_HTTP_BIND").ok())
            .unwrap_or(file.http.bind);

        let http_port = match cli.http_port {
            Some(port) => port,
            None => match env_parse::<u16>("EYES_HTTP_PORT")? {
                Some(port) => port,
                None => file.http.port,
            },
        };

        let probe_timeout_secs = match cli.probe_timeout_secs {
            Some(secs) => secs,
            None => match env_parse::<u64>("EYES_PROBE_TIMEOUT_SECS")? {
                Some(secs) => secs,
                None => file.http.probe_timeout_secs,
            },
        };

        let controller = ControllerConfig::new(listen_addr)
            .with_channel_capacities(
                file.controller.result_channel_capacity,
                file.controller.disconnect_channel_capacity,
            )
            .with_pending_ttl(file.controller.pending_ttl_secs.map(Duration::from_secs));

        Ok(Self {
            controller,
            http_bind,
            http_port,
            probe_timeout: Duration::from_secs(probe_timeout_secs),
        })
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("{name} env var is not valid: {raw:?}"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, MutexGuard};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_VARS: [&str; 4] = [
        "EYES_LISTEN_ADDR",
        "EYES_HTTP_BIND",
        "EYES_HTTP_PORT",
        "EYES_PROBE_TIMEOUT_SECS",
    ];

    fn lock_env() -> MutexGuard<'static, ()> {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        for var in ENV_VARS {
            unsafe { std::env::remove_var(var) };
        }
        guard
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("eyes").join("config.toml");

        let original = ConfigFile {
            controller: ControllerSection {
                listen_addr: "10.0.0.1:9000".to_string(),
                pending_ttl_secs: Some(30),
                ..ControllerSection::default()
            },
            http: HttpSection {
                port: 8080,
                ..HttpSection::default()
            },
        };
        save_config(&path, &original).unwrap();

        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.controller.listen_addr, "10.0.0.1:9000");
        assert_eq!(loaded.controller.pending_ttl_secs, Some(30));
        assert_eq!(loaded.http.port, 8080);
        assert_eq!(loaded.http.bind, DEFAULT_HTTP_BIND);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: ConfigFile = toml::from_str("[http]\nport = 9999\n").unwrap();
        assert_eq!(config.http.port, 9999);
        assert_eq!(config.http.probe_timeout_secs, DEFAULT_PROBE_TIMEOUT_SECS);
        assert_eq!(
            config.controller.listen_addr,
            ControllerConfig::DEFAULT_LISTEN_ADDR
        );
        assert_eq!(config.controller.pending_ttl_secs, None);
    }

    #[test]
    fn load_config_reports_parse_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[http\nport = ").unwrap();

        let msg = format!("{:#}", load_config(&path).unwrap_err());
        assert!(
            msg.contains("failed to parse config file"),
            "unexpected error: {msg}"
        );
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();

        let config =
            EyesConfig::resolve_with(&ServeOverrides::default(), ConfigFile::default()).unwrap();
        assert_eq!(
            config.controller.listen_addr,
            ControllerConfig::DEFAULT_LISTEN_ADDR
        );
        assert_eq!(config.http_bind, DEFAULT_HTTP_BIND);
        assert_eq!(config.http_port, DEFAULT_HTTP_PORT);
        assert_eq!(
            config.probe_timeout,
            Duration::from_secs(DEFAULT_PROBE_TIMEOUT_SECS)
        );
        assert_eq!(config.controller.pending_ttl, None);
    }

    #[test]
    fn resolve_env_var_overrides_config_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("EYES_LISTEN_ADDR", "127.0.0.1:7000") };
        unsafe { std::env::set_var("EYES_HTTP_PORT", "7001") };

        let mut file = ConfigFile::default();
        file.controller.listen_addr = "10.0.0.1:9000".to_string();
        file.http.port = 9001;
        file.http.probe_timeout_secs = 3;

        let config = EyesConfig::resolve_with(&ServeOverrides::default(), file).unwrap();
        assert_eq!(config.controller.listen_addr, "127.0.0.1:7000");
        assert_eq!(config.http_port, 7001);
        assert_eq!(config.probe_timeout, Duration::from_secs(3));

        unsafe { std::env::remove_var("EYES_LISTEN_ADDR") };
        unsafe { std::env::remove_var("EYES_HTTP_PORT") };
    }

    #[test]
    fn resolve_cli_flag_overrides_all() {
        let _lock = lock_env();
        unsafe { std::env::set_var("EYES_LISTEN_ADDR", "127.0.0.1:7000") };
        unsafe { std::env::set_var("EYES_PROBE_TIMEOUT_SECS", "30") };

        let cli = ServeOverrides {
            listen: Some("0.0.0.0:5000".to_string()),
            http_bind: Some("0.0.0.0".to_string()),
            http_port: Some(5001),
            probe_timeout_secs: Some(1),
        };
        let config = EyesConfig::resolve_with(&cli, ConfigFile::default()).unwrap();
        assert_eq!(config.controller.listen_addr, "0.0.0.0:5000");
        assert_eq!(config.http_bind, "0.0.0.0");
        assert_eq!(config.http_port, 5001);
        assert_eq!(config.probe_timeout, Duration::from_secs(1));

        unsafe { std::env::remove_var("EYES_LISTEN_ADDR") };
        unsafe { std::env::remove_var("EYES_PROBE_TIMEOUT_SECS") };
    }

    #[test]
    fn resolve_rejects_malformed_port_env_var() {
        let _lock = lock_env();
        unsafe { std::env::set_var("EYES_HTTP_PORT", "not-a-port") };

        let result = EyesConfig::resolve_with(&ServeOverrides::default(), ConfigFile::default());
        unsafe { std::env::remove_var("EYES_HTTP_PORT") };

        let msg = format!("{:#}", result.unwrap_err());
        assert!(msg.contains("EYES_HTTP_PORT"), "unexpected error: {msg}");
    }

    #[test]
    fn resolve_carries_controller_section_into_controller_config() {
        let _lock = lock_env();

        let mut file = ConfigFile::default();
        file.controller.result_channel_capacity = 64;
        file.controller.disconnect_channel_capacity = 0;
        file.controller.pending_ttl_secs = Some(120);

        let config = EyesConfig::resolve_with(&ServeOverrides::default(), file).unwrap();
        assert_eq!(config.controller.result_channel_capacity, 64);
        assert_eq!(config.controller.disconnect_channel_capacity, 1);
        assert_eq!(
            config.controller.pending_ttl,
            Some(Duration::from_secs(120))
        );
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("eyes/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
