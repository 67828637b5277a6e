// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

const APP_DIR_NAME: &str = "abacus";
const CONFIG_FILE_NAME: &str = "abacus.toml";
const CONFIG_ENV_VAR: &str = "ABACUS_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "abacus.sqlite";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_POOL_SIZE: usize = crate::remote::pool::DEFAULT_POOL_SIZE;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_HOME_DIRECTORY: &str = "/scratch/abacus";

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    poll_interval_secs: Option<u64>,
    pool_size: Option<usize>,
    verbose: Option<bool>,
    requests_dir: Option<String>,
    applications_dir: Option<String>,
    storage_root: Option<String>,
    ssh: Option<FileSshConfig>,
    #[serde(default)]
    cluster: FileClusterConfig,
}

#[derive(Debug, Deserialize)]
struct FileSshConfig {
    host: String,
    port: Option<u16>,
    username: String,
    identity_path: Option<String>,
    known_hosts_path: Option<String>,
    connect_timeout_secs: Option<u64>,
    keepalive_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct FileClusterConfig {
    home_directory: Option<String>,
    reservation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub identity_path: PathBuf,
    pub known_hosts_path: PathBuf,
    pub connect_timeout: Duration,
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterConfig {
    pub home_directory: String,
    pub reservation: Option<String>,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub poll_interval_secs: u64,
    pub pool_size: usize,
    pub verbose: bool,
    pub requests_dir: PathBuf,
    pub applications_dir: PathBuf,
    pub storage_root: PathBuf,
    pub ssh: Option<SshConfig>,
    pub cluster: ClusterConfig,
    pub config_path: Option<PathBuf>,
}

impl Config {
    /// The `[ssh]` table, required by every command that talks to the cluster.
    pub fn require_ssh(&self) -> Result<&SshConfig> {
        self.ssh.as_ref().with_context(|| match &self.config_path {
            Some(path) => format!("no [ssh] table in {}", path.display()),
            None => "no [ssh] table configured".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub poll_interval_secs: ConfigValue<u64>,
    pub pool_size: ConfigValue<usize>,
    pub verbose: ConfigValue<bool>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub pool_size: Option<usize>,
    pub verbose: Option<bool>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

fn pick<T>(over: Option<T>, file: Option<T>, default: T) -> (T, ConfigSource) {
    match (over, file) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default, ConfigSource::Default),
    }
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());
    let from_file = |raw: Option<String>| raw.map(|raw| resolve_path(&raw, base_dir));

    let (database_path, database_source) = match overrides.database_path {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match from_file(file_config.database_path) {
            Some(path) => (path, ConfigSource::ConfigFile),
            None => (
                default_data_dir()
                    .map(|dir| dir.join(DATABASE_FILE_NAME))
                    .with_context(|| {
                        "failed to resolve default database path; specify --database-path or set database_path in the config file"
                    })?,
                ConfigSource::Default,
            ),
        },
    };

    let (poll_interval_secs, poll_interval_source) = pick(
        overrides.poll_interval_secs,
        file_config.poll_interval_secs,
        DEFAULT_POLL_INTERVAL_SECS,
    );
    if poll_interval_secs == 0 {
        anyhow::bail!("poll_interval_secs must be greater than 0");
    }
    let (pool_size, pool_size_source) =
        pick(overrides.pool_size, file_config.pool_size, DEFAULT_POOL_SIZE);
    if pool_size == 0 {
        anyhow::bail!("pool_size must be greater than 0");
    }
    let (verbose, verbose_source) = pick(overrides.verbose, file_config.verbose, false);

    let requests_dir = match from_file(file_config.requests_dir) {
        Some(path) => path,
        None => default_data_dir()?.join("requests"),
    };
    let applications_dir = match from_file(file_config.applications_dir) {
        Some(path) => path,
        None => default_config_dir()?.join("applications"),
    };
    let storage_root = match from_file(file_config.storage_root) {
        Some(path) => path,
        None => default_data_dir()?.join("storage"),
    };

    let ssh = match file_config.ssh {
        Some(ssh) => Some(ssh_config(ssh, base_dir)?),
        None => None,
    };
    let cluster = ClusterConfig {
        home_directory: file_config
            .cluster
            .home_directory
            .unwrap_or_else(|| DEFAULT_HOME_DIRECTORY.to_string()),
        reservation: file_config
            .cluster
            .reservation
            .filter(|r| !r.trim().is_empty()),
    };
    if !cluster.home_directory.starts_with('/') {
        anyhow::bail!(
            "cluster.home_directory must be an absolute remote path, got '{}'",
            cluster.home_directory
        );
    }

    let config = Config {
        database_path,
        poll_interval_secs,
        pool_size,
        verbose,
        requests_dir,
        applications_dir,
        storage_root,
        ssh,
        cluster,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path: ConfigValue {
            value: config.database_path.clone(),
            source: database_source,
        },
        poll_interval_secs: ConfigValue {
            value: config.poll_interval_secs,
            source: poll_interval_source,
        },
        pool_size: ConfigValue {
            value: config.pool_size,
            source: pool_size_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

fn ssh_config(raw: FileSshConfig, base_dir: Option<&Path>) -> Result<SshConfig> {
    if raw.host.trim().is_empty() {
        anyhow::bail!("ssh.host must not be empty");
    }
    if raw.username.trim().is_empty() {
        anyhow::bail!("ssh.username must not be empty");
    }
    let port = raw.port.unwrap_or(DEFAULT_SSH_PORT);
    if port == 0 {
        anyhow::bail!("ssh.port must be between 1 and 65535");
    }
    let identity_path = match raw.identity_path {
        Some(raw) => resolve_path(&raw, base_dir),
        None => default_ssh_dir()?.join("id_ed25519"),
    };
    let known_hosts_path = match raw.known_hosts_path {
        Some(raw) => resolve_path(&raw, base_dir),
        None => default_ssh_dir()?.join("known_hosts"),
    };
    Ok(SshConfig {
        host: raw.host,
        port,
        username: raw.username,
        identity_path,
        known_hosts_path,
        connect_timeout: Duration::from_secs(
            raw.connect_timeout_secs
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
        ),
        keepalive_secs: raw.keepalive_secs.unwrap_or(DEFAULT_KEEPALIVE_SECS),
    })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}

fn default_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}

fn default_ssh_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to resolve home directory")?;
    Ok(home.join(".ssh"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            match &self.prev {
                Some(value) => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::set_var(self.key, value);
                    }
                }
                None => {
                    // SAFETY: tests serialize env mutations with ENV_LOCK.
                    unsafe {
                        std::env::remove_var(self.key);
                    }
                }
            }
        }
    }

    fn write_config(body: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let config_path = config_dir.join("abacus.toml");
        fs::write(&config_path, body).unwrap();
        (dir, config_path)
    }

    #[test]
    fn missing_optional_config_file_is_ok() {
        let dir = TempDir::new().unwrap();
        let cfg = read_config_file(&dir.path().join("missing.toml"), false).unwrap();
        assert!(cfg.database_path.is_none());
        assert!(cfg.ssh.is_none());
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn relative_paths_resolve_from_config_dir() {
        let (_dir, config_path) = write_config(
            r#"
database_path = "db/abacus.sqlite"
requests_dir = "spool"
poll_interval_secs = 3

[ssh]
host = "login.hpc.example"
username = "abacus"
identity_path = "keys/id_ed25519"
known_hosts_path = "/etc/abacus/known_hosts"
"#,
        );
        let config_dir = config_path.parent().unwrap().to_path_buf();
        let config = load(Some(config_path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.database_path, config_dir.join("db").join("abacus.sqlite"));
        assert_eq!(config.requests_dir, config_dir.join("spool"));
        assert_eq!(config.poll_interval_secs, 3);
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.config_path, Some(config_path));

        let ssh = config.require_ssh().unwrap();
        assert_eq!(ssh.port, 22);
        assert_eq!(ssh.identity_path, config_dir.join("keys").join("id_ed25519"));
        assert_eq!(ssh.known_hosts_path, PathBuf::from("/etc/abacus/known_hosts"));
        assert_eq!(ssh.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.cluster.home_directory, DEFAULT_HOME_DIRECTORY);
        assert!(config.cluster.reservation.is_none());
    }

    #[test]
    fn overrides_apply_per_field() {
        let (_dir, config_path) = write_config(
            "database_path = \"db/from_config.sqlite\"\npoll_interval_secs = 9\npool_size = 4\n",
        );
        let config_dir = config_path.parent().unwrap().to_path_buf();
        let LoadResult { config, report } = load_with_report(
            Some(config_path),
            Overrides {
                database_path: None,
                poll_interval_secs: Some(2),
                pool_size: None,
                verbose: Some(true),
            },
        )
        .unwrap();

        assert_eq!(config.database_path, config_dir.join("db").join("from_config.sqlite"));
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.pool_size, 4);
        assert!(config.verbose);
        assert_eq!(report.database_path.source, ConfigSource::ConfigFile);
        assert_eq!(report.poll_interval_secs.source, ConfigSource::Override);
        assert_eq!(report.pool_size.source, ConfigSource::ConfigFile);
        assert_eq!(report.verbose.source, ConfigSource::Override);
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let (_dir, config_path) = write_config("database_path = \"a.sqlite\"\npool_size = 0\n");
        let err = load(Some(config_path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("pool_size"));
    }

    #[test]
    fn ssh_is_optional_until_required() {
        let (_dir, config_path) = write_config("database_path = \"a.sqlite\"\n");
        let config = load(Some(config_path), Overrides::default()).unwrap();
        assert!(config.require_ssh().is_err());
    }

    #[test]
    fn cluster_settings_are_read() {
        let (_dir, config_path) = write_config(
            "database_path = \"a.sqlite\"\n[cluster]\nhome_directory = \"/home/abacus\"\nreservation = \"course\"\n",
        );
        let config = load(Some(config_path), Overrides::default()).unwrap();
        assert_eq!(config.cluster.home_directory, "/home/abacus");
        assert_eq!(config.cluster.reservation.as_deref(), Some("course"));
    }

    #[test]
    fn relative_home_directory_is_rejected() {
        let (_dir, config_path) =
            write_config("database_path = \"a.sqlite\"\n[cluster]\nhome_directory = \"scratch\"\n");
        assert!(load(Some(config_path), Overrides::default()).is_err());
    }

    #[test]
    fn ensure_database_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("abacus.sqlite");
        ensure_database_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let (_dir, config_path) = write_config("database_path = \"a.sqlite\"\npool_size = 3\n");
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, config_path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.config_path, Some(config_path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn cli_config_path_takes_precedence_over_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let (_env_dir, env_path) = write_config("database_path = \"a.sqlite\"\npool_size = 3\n");
        let (_cli_dir, cli_path) = write_config("database_path = \"a.sqlite\"\npool_size = 5\n");
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, env_path.to_str().unwrap());

        let LoadResult { config, report } =
            load_with_report(Some(cli_path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.config_path, Some(cli_path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Override));
    }
}
