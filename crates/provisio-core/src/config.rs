//! Settings resolution for Provisio.
//!
//! Implements layered resolution:
//! 1. Built-in defaults
//! 2. Settings file (`--config`, or ~/.config/provisio/settings.json)
//! 3. Environment variables (`PROVISIO_*`)
//! 4. CLI arguments (applied by the binaries, highest priority)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Complete Provisio settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub worker: WorkerSettings,
    pub accounts: AccountSettings,
}

impl Settings {
    /// Queue database path: the configured one, else the platform data dir.
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        self.worker
            .database_path
            .clone()
            .or_else(database_path)
            .ok_or_else(|| Error::Config("cannot determine queue database path".into()))
    }
}

/// Queue consumer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub database_path: Option<PathBuf>,
    /// Number of tasks processed in parallel by one worker process.
    pub concurrency: usize,
    /// Sleep between polls when the queue has nothing visible.
    pub poll_interval_ms: u64,
    /// How long a dequeued task stays claimed before another worker may take it.
    pub lease_secs: u64,
    pub log_level: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            database_path: None,
            concurrency: 2,
            poll_interval_ms: 1000,
            lease_secs: 600,
            log_level: "info".to_string(),
        }
    }
}

/// How privileged account operations are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeMode {
    /// `direct` when running as root, `sudo` otherwise.
    #[default]
    Auto,
    /// The worker itself is root; no escalation.
    Direct,
    /// Every operation goes through `sudo -n`.
    Sudo,
}

impl std::str::FromStr for PrivilegeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "direct" => Ok(Self::Direct),
            "sudo" => Ok(Self::Sudo),
            other => Err(Error::Config(format!(
                "unknown privilege mode {other:?} (expected auto, direct or sudo)"
            ))),
        }
    }
}

/// OS account settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSettings {
    /// Parent of every home directory (`useradd -m` default).
    pub home_root: PathBuf,
    /// Login shell for new accounts.
    pub shell: String,
    pub privilege: PrivilegeMode,
    /// Upper bound for any single external command.
    pub command_timeout_secs: u64,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            home_root: PathBuf::from("/home"),
            shell: "/bin/bash".to_string(),
            privilege: PrivilegeMode::Auto,
            command_timeout_secs: 30,
        }
    }
}

/// Load settings from the given file (must exist) or the default location
/// (optional), then apply `PROVISIO_*` environment overrides.
pub fn load_settings(explicit: Option<&Path>) -> Result<Settings> {
    let mut settings = match explicit {
        Some(path) => load_settings_file(path)?,
        None => match settings_path() {
            Some(path) if path.exists() => load_settings_file(&path)?,
            _ => Settings::default(),
        },
    };

    apply_overrides(&mut settings, |key| std::env::var(key).ok())?;

    Ok(settings)
}

/// Default settings file location.
pub fn settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("provisio").join("settings.json"))
}

/// Default queue database location.
pub fn database_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("provisio").join("queue.db"))
}

fn load_settings_file(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&content)?)
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {key}: {value:?}")))
}

/// Apply overrides from a variable lookup (the process environment in
/// production).
pub fn apply_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<()> {
    if let Some(val) = lookup("PROVISIO_DB_PATH") {
        settings.worker.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("PROVISIO_CONCURRENCY") {
        settings.worker.concurrency = parse_var("PROVISIO_CONCURRENCY", &val)?;
    }
    if let Some(val) = lookup("PROVISIO_POLL_INTERVAL_MS") {
        settings.worker.poll_interval_ms = parse_var("PROVISIO_POLL_INTERVAL_MS", &val)?;
    }
    if let Some(val) = lookup("PROVISIO_LEASE_SECS") {
        settings.worker.lease_secs = parse_var("PROVISIO_LEASE_SECS", &val)?;
    }
    if let Some(val) = lookup("PROVISIO_LOG_LEVEL") {
        settings.worker.log_level = val;
    }
    if let Some(val) = lookup("PROVISIO_HOME_ROOT") {
        settings.accounts.home_root = PathBuf::from(val);
    }
    if let Some(val) = lookup("PROVISIO_SHELL") {
        settings.accounts.shell = val;
    }
    if let Some(val) = lookup("PROVISIO_PRIVILEGE") {
        settings.accounts.privilege = val.parse()?;
    }
    if let Some(val) = lookup("PROVISIO_COMMAND_TIMEOUT_SECS") {
        settings.accounts.command_timeout_secs =
            parse_var("PROVISIO_COMMAND_TIMEOUT_SECS", &val)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_reference_deployment() {
        let settings = Settings::default();
        assert_eq!(settings.accounts.home_root, PathBuf::from("/home"));
        assert_eq!(settings.accounts.shell, "/bin/bash");
        assert_eq!(settings.accounts.privilege, PrivilegeMode::Auto);
        assert_eq!(settings.worker.lease_secs, 600);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"accounts": {"shell": "/bin/zsh", "privilege": "sudo"}}"#)
            .expect("write");

        let settings = load_settings_file(&path).expect("load");
        assert_eq!(settings.accounts.shell, "/bin/zsh");
        assert_eq!(settings.accounts.privilege, PrivilegeMode::Sudo);
        assert_eq!(settings.accounts.command_timeout_secs, 30);
        assert_eq!(settings.worker, WorkerSettings::default());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let result = load_settings(Some(Path::new("/nonexistent/provisio.json")));
        assert!(matches!(result, Err(Error::Read { .. })));
    }

    #[test]
    fn overrides_apply_on_top_of_file() {
        let vars: HashMap<&str, &str> = [
            ("PROVISIO_CONCURRENCY", "8"),
            ("PROVISIO_POLL_INTERVAL_MS", "250"),
            ("PROVISIO_HOME_ROOT", "/srv/home"),
            ("PROVISIO_PRIVILEGE", "direct"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        apply_overrides(&mut settings, |k| vars.get(k).map(ToString::to_string))
            .expect("overrides");

        assert_eq!(settings.worker.concurrency, 8);
        assert_eq!(settings.worker.poll_interval_ms, 250);
        assert_eq!(settings.accounts.home_root, PathBuf::from("/srv/home"));
        assert_eq!(settings.accounts.privilege, PrivilegeMode::Direct);
    }

    #[test]
    fn configured_database_path_wins() {
        let mut settings = Settings::default();
        settings.worker.database_path = Some(PathBuf::from("/var/lib/provisio/q.db"));
        assert_eq!(
            settings.resolved_database_path().expect("path"),
            PathBuf::from("/var/lib/provisio/q.db")
        );
    }

    #[test]
    fn malformed_override_is_rejected() {
        let mut settings = Settings::default();
        let result = apply_overrides(&mut settings, |k| {
            (k == "PROVISIO_LEASE_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
