//! Configuration model and helpers used by Warden services.

use crate::error::{WardenError, WardenResult};
use directories_next::ProjectDirs;
use log::info;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/warden-agent.toml";
const BOOTSTRAP_FILE_NAME: &str = "warden-agent.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Warden";
const APP_NAME: &str = "warden";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// Settings describing the agent's own on-disk artifact and service unit.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentCfg {
    /// Path of the executable source artifact the update pipeline replaces.
    /// Deliberately distinct from the running process image.
    #[serde(default = "default_artifact_path")]
    pub artifact_path: PathBuf,

    /// systemd unit restarted after a successful update.
    #[serde(default = "default_service_unit")]
    pub service_unit: String,

    /// Structural marker a candidate must contain to be accepted.
    #[serde(default = "default_required_marker")]
    pub required_marker: String,

    /// Name of the credential assignment the rescue tool knows how to reset.
    #[serde(default = "default_credential_field")]
    pub credential_field: String,

    /// Value the rescue tool resets the credential to.
    #[serde(default = "default_credential_value")]
    pub default_credential: String,
}

fn default_artifact_path() -> PathBuf {
    PathBuf::from("/opt/warden/warden-agent.sh")
}

fn default_service_unit() -> String {
    "warden-agent".to_string()
}

fn default_required_marker() -> String {
    "# warden-agent".to_string()
}

fn default_credential_field() -> String {
    "PASSWORD".to_string()
}

fn default_credential_value() -> String {
    "warden".to_string()
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            artifact_path: default_artifact_path(),
            service_unit: default_service_unit(),
            required_marker: default_required_marker(),
            credential_field: default_credential_field(),
            default_credential: default_credential_value(),
        }
    }
}

/// Update pipeline settings: where candidates come from and how they are vetted.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateCfg {
    /// Raw URL serving the latest trusted source. Fetched with a
    /// cache-busting query parameter so intermediaries cannot serve stale bytes.
    #[serde(default)]
    pub source_url: String,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Delay between a successful apply and the supervisor restart, so the
    /// triggering response can reach its caller first.
    #[serde(default = "default_restart_delay")]
    pub restart_delay_ms: u64,

    /// Interval between unattended update checks in the daemon.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// External syntax checker invoked against a temp copy of the candidate
    /// (argv form; the candidate path is appended). Empty disables the gate.
    #[serde(default = "default_syntax_checker")]
    pub syntax_checker: Vec<String>,
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_restart_delay() -> u64 {
    1_000
}

fn default_check_interval() -> u64 {
    3_600
}

fn default_syntax_checker() -> Vec<String> {
    vec!["bash".to_string(), "-n".to_string()]
}

impl Default for UpdateCfg {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            fetch_timeout_secs: default_fetch_timeout(),
            restart_delay_ms: default_restart_delay(),
            check_interval_secs: default_check_interval(),
            syntax_checker: default_syntax_checker(),
        }
    }
}

/// Console bridge settings for the supervised external process.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ConsoleCfg {
    /// Name of the interactive screen session commands are injected into.
    #[serde(default = "default_session")]
    pub session: String,

    /// Command-line substring used to discover the target process.
    #[serde(default = "default_signature")]
    pub signature: String,

    /// Owner of the session: `auto` resolves the matched process owner,
    /// anything else is used verbatim.
    #[serde(default = "default_owner")]
    pub owner: String,

    /// Statically configured log path, consulted before discovery.
    #[serde(default)]
    pub log_path: Option<PathBuf>,

    /// Log location relative to the target's working directory.
    #[serde(default = "default_log_relative")]
    pub log_relative_path: PathBuf,

    /// Root scanned (one level deep) as the last-resort log search.
    #[serde(default = "default_home_root")]
    pub home_root: PathBuf,

    /// Number of trailing lines returned by the log tail.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
}

fn default_session() -> String {
    "minecraft".to_string()
}

fn default_signature() -> String {
    "server.jar".to_string()
}

fn default_owner() -> String {
    "auto".to_string()
}

fn default_log_relative() -> PathBuf {
    PathBuf::from("logs/latest.log")
}

fn default_home_root() -> PathBuf {
    PathBuf::from("/home")
}

fn default_tail_lines() -> usize {
    40
}

impl Default for ConsoleCfg {
    fn default() -> Self {
        Self {
            session: default_session(),
            signature: default_signature(),
            owner: default_owner(),
            log_path: None,
            log_relative_path: default_log_relative(),
            home_root: default_home_root(),
            tail_lines: default_tail_lines(),
        }
    }
}

/// Limits applied to every external command the agent spawns.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExecCfg {
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    20
}

impl Default for ExecCfg {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WardenConfig {
    #[serde(default)]
    pub agent: AgentCfg,

    #[serde(default)]
    pub update: UpdateCfg,

    #[serde(default)]
    pub console: ConsoleCfg,

    #[serde(default)]
    pub exec: ExecCfg,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            agent: AgentCfg::default(),
            update: UpdateCfg::default(),
            console: ConsoleCfg::default(),
            exec: ExecCfg::default(),
            path: PathBuf::new(),
            format: ConfigFormat::Toml,
        }
    }
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl WardenConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// If the requested path does not exist, Warden attempts to materialise a
    /// bootstrap template there. When the caller requests the global default
    /// and the process lacks permission to create it, a per-user
    /// configuration is written to the platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> WardenResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("warden config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(WardenError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    WardenError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/warden-agent.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    WardenError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!("warden config bootstrap created at {}", user_path.display());
                }

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> WardenResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)
                .map_err(|err| WardenError::InvalidConfig(err.to_string()))?
        } else {
            serde_yaml::from_str::<Self>(&contents)
                .map_err(|err| WardenError::InvalidConfig(err.to_string()))?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> WardenResult<()> {
        if self.agent.required_marker.trim().is_empty() {
            return Err(WardenError::InvalidConfig(
                "agent.required_marker must not be empty".to_string(),
            ));
        }
        if self.agent.artifact_path.as_os_str().is_empty() {
            return Err(WardenError::InvalidConfig(
                "agent.artifact_path must be set".to_string(),
            ));
        }
        if self.console.signature.trim().is_empty() {
            return Err(WardenError::InvalidConfig(
                "console.signature must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Persist the configuration back to its originating path and format.
    pub fn save(&self) -> WardenResult<()> {
        let rendered = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)
                .map_err(|err| WardenError::InvalidConfig(err.to_string()))?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)
                .map_err(|err| WardenError::InvalidConfig(err.to_string()))?,
        };
        fs::write(&self.path, rendered)?;
        Ok(())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.update.fetch_timeout_secs.max(1))
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.update.restart_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.exec.command_timeout_secs.max(1))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.update.check_interval_secs.max(10))
    }
}

/// Render the commented bootstrap template written on first run.
pub fn bootstrap_template() -> String {
    let defaults = WardenConfig::default();
    format!(
        r#"# Warden host agent configuration.
# Adjust and restart the warden-daemon service to apply.

[agent]
# On-disk source artifact the update pipeline replaces.
artifact_path = "{artifact}"
# systemd unit restarted after a successful update.
service_unit = "{unit}"
# Candidates missing this marker are rejected outright.
required_marker = "{marker}"
credential_field = "{field}"
default_credential = "{credential}"

[update]
# Raw URL of the latest trusted source. Leave empty to disable updates.
source_url = ""
fetch_timeout_secs = {fetch_timeout}
restart_delay_ms = {restart_delay}
check_interval_secs = {check_interval}
syntax_checker = ["bash", "-n"]

[console]
session = "{session}"
signature = "{signature}"
# "auto" resolves the owner of the matched process.
owner = "auto"
log_relative_path = "{log_relative}"
home_root = "{home_root}"
tail_lines = {tail_lines}

[exec]
command_timeout_secs = {command_timeout}
"#,
        artifact = defaults.agent.artifact_path.display(),
        unit = defaults.agent.service_unit,
        marker = defaults.agent.required_marker,
        field = defaults.agent.credential_field,
        credential = defaults.agent.default_credential,
        fetch_timeout = defaults.update.fetch_timeout_secs,
        restart_delay = defaults.update.restart_delay_ms,
        check_interval = defaults.update.check_interval_secs,
        session = defaults.console.session,
        signature = defaults.console.signature,
        log_relative = defaults.console.log_relative_path.display(),
        home_root = defaults.console.home_root.display(),
        tail_lines = defaults.console.tail_lines,
        command_timeout = defaults.exec.command_timeout_secs,
    )
}

/// Write the bootstrap template at `path` unless it already exists.
///
/// Returns `true` when a new file was created.
fn ensure_bootstrap_file(path: &Path) -> std::io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(bootstrap_template().as_bytes())?;

    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_template_round_trips() {
        let parsed: WardenConfig = toml::from_str(&bootstrap_template()).unwrap();
        assert_eq!(parsed.agent.service_unit, "warden-agent");
        assert_eq!(parsed.console.tail_lines, 40);
        assert_eq!(parsed.update.syntax_checker, vec!["bash", "-n"]);
    }

    #[test]
    fn load_or_bootstrap_creates_template() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warden-agent.toml");
        let config = WardenConfig::load_or_bootstrap(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.path, path);
        assert_eq!(config.console.session, "minecraft");
    }

    #[test]
    fn load_rejects_empty_marker() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "[agent]\nrequired_marker = \"  \"\n").unwrap();
        let err = WardenConfig::load(&path).unwrap_err();
        assert!(matches!(err, WardenError::InvalidConfig(_)));
    }

    #[test]
    fn yaml_extension_parses_as_yaml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("warden.yaml");
        fs::write(&path, "agent:\n  service_unit: custom-unit\n").unwrap();
        let config = WardenConfig::load(&path).unwrap();
        assert_eq!(config.agent.service_unit, "custom-unit");
        assert!(matches!(config.format, ConfigFormat::Yaml));
    }
}
