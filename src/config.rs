use crate::error::BootError;
use dirs::{config_dir, home_dir};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub windows: WindowsConfig,
    pub distro: DistroConfig,
    pub guest: GuestConfig,
    pub host_engine: HostEngineConfig,
    pub editor: EditorConfig,
    pub handoff: HandoffConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct WindowsConfig {
    pub features: Vec<String>,
    pub wsl_default_version: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct DistroConfig {
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct GuestConfig {
    pub packages: Vec<String>,
    pub helper_script_path: String,
    pub helper_script: String,
    pub shell_rc_line: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HostEngineConfig {
    pub enabled: bool,
    pub command: String,
    pub installer_url: String,
    pub installer_args: Vec<String>,
    pub machine_name: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct EditorConfig {
    pub command: String,
    pub installer_url: String,
    pub installer_args: Vec<String>,
    pub extension: String,
    pub settings_path: String,
    pub settings: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub struct HandoffConfig {
    pub poll_interval_sec: u64,
    pub timeout_sec: u64,
    pub sentinel_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            windows: WindowsConfig::default(),
            distro: DistroConfig::default(),
            guest: GuestConfig::default(),
            host_engine: HostEngineConfig::default(),
            editor: EditorConfig::default(),
            handoff: HandoffConfig::default(),
        }
    }
}

impl Default for WindowsConfig {
    fn default() -> Self {
        Self {
            features: vec![
                "Microsoft-Windows-Subsystem-Linux".to_string(),
                "VirtualMachinePlatform".to_string(),
            ],
            wsl_default_version: 2,
        }
    }
}

impl Default for DistroConfig {
    fn default() -> Self {
        Self {
            name: "Ubuntu".to_string(),
        }
    }
}

impl Default for GuestConfig {
    fn default() -> Self {
        Self {
            packages: vec!["podman".to_string()],
            helper_script_path: "/usr/local/bin/docker".to_string(),
            helper_script: "#!/bin/sh\nexec podman \"$@\"\n".to_string(),
            shell_rc_line: "export DOCKER_HOST=unix:///run/user/$(id -u)/podman/podman.sock"
                .to_string(),
        }
    }
}

impl Default for HostEngineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: "podman".to_string(),
            installer_url: "https://github.com/containers/podman/releases/latest/download/podman-installer-windows-amd64.exe".to_string(),
            installer_args: vec![
                "/install".to_string(),
                "/quiet".to_string(),
                "/norestart".to_string(),
            ],
            machine_name: "podman-machine-default".to_string(),
        }
    }
}

impl Default for EditorConfig {
    fn default() -> Self {
        let mut settings = BTreeMap::new();
        settings.insert(
            "dev.containers.dockerPath".to_string(),
            serde_json::Value::String("podman".to_string()),
        );
        Self {
            command: "code".to_string(),
            installer_url: "https://update.code.visualstudio.com/latest/win32-x64-user/stable"
                .to_string(),
            installer_args: vec![
                "/VERYSILENT".to_string(),
                "/NORESTART".to_string(),
                "/MERGETASKS=!runcode".to_string(),
            ],
            extension: "ms-vscode-remote.remote-containers".to_string(),
            settings_path: "".to_string(),
            settings,
        }
    }
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: 2,
            timeout_sec: 300,
            sentinel_dir: "".to_string(),
        }
    }
}

impl HandoffConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec)
    }
}

impl EditorConfig {
    pub fn resolved_settings_path(&self) -> PathBuf {
        let configured = self.settings_path.trim();
        if !configured.is_empty() {
            return PathBuf::from(expand_path(configured));
        }
        config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Code")
            .join("User")
            .join("settings.json")
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config, BootError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(BootError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, BootError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

pub fn load_config(path: &Path) -> Result<Config, BootError> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

fn is_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'))
}

pub fn validate_config(cfg: &Config) -> Result<(), BootError> {
    for feature in &cfg.windows.features {
        if !is_safe_token(feature) {
            return Err(BootError::Config(format!(
                "windows.features contains an invalid feature name '{feature}'"
            )));
        }
    }
    if !matches!(cfg.windows.wsl_default_version, 1 | 2) {
        return Err(BootError::Config(
            "windows.wsl_default_version must be 1 or 2".to_string(),
        ));
    }
    if !is_safe_token(&cfg.distro.name) {
        return Err(BootError::Config(
            "distro.name must be a non-empty distribution name without spaces".to_string(),
        ));
    }
    for package in &cfg.guest.packages {
        if !is_safe_token(package) {
            return Err(BootError::Config(format!(
                "guest.packages contains an invalid package name '{package}'"
            )));
        }
    }
    if !cfg.guest.helper_script_path.starts_with('/') {
        return Err(BootError::Config(
            "guest.helper_script_path must be an absolute guest path".to_string(),
        ));
    }
    if cfg.guest.helper_script.trim().is_empty() {
        return Err(BootError::Config(
            "guest.helper_script must be non-empty".to_string(),
        ));
    }
    if cfg.guest.shell_rc_line.contains('\n') || cfg.guest.shell_rc_line.contains('\r') {
        return Err(BootError::Config(
            "guest.shell_rc_line contains an invalid newline".to_string(),
        ));
    }
    if cfg.host_engine.enabled {
        if cfg.host_engine.command.trim().is_empty() {
            return Err(BootError::Config(
                "host_engine.command must be non-empty".to_string(),
            ));
        }
        if !is_safe_token(&cfg.host_engine.machine_name) {
            return Err(BootError::Config(
                "host_engine.machine_name must be a non-empty machine name".to_string(),
            ));
        }
        if !cfg.host_engine.installer_url.starts_with("https://") {
            return Err(BootError::Config(
                "host_engine.installer_url must be an https URL".to_string(),
            ));
        }
    }
    if cfg.editor.command.trim().is_empty() {
        return Err(BootError::Config(
            "editor.command must be non-empty".to_string(),
        ));
    }
    if !cfg.editor.installer_url.starts_with("https://") {
        return Err(BootError::Config(
            "editor.installer_url must be an https URL".to_string(),
        ));
    }
    let extension_ok = cfg
        .editor
        .extension
        .split_once('.')
        .map(|(publisher, name)| is_safe_token(publisher) && is_safe_token(name))
        .unwrap_or(false);
    if !extension_ok {
        return Err(BootError::Config(format!(
            "editor.extension must look like <publisher>.<name>, got '{}'",
            cfg.editor.extension
        )));
    }
    if cfg.editor.settings.keys().any(|key| key.trim().is_empty()) {
        return Err(BootError::Config(
            "editor.settings keys must be non-empty".to_string(),
        ));
    }
    if cfg.handoff.poll_interval_sec == 0 {
        return Err(BootError::Config(
            "handoff.poll_interval_sec must be greater than 0".to_string(),
        ));
    }
    if cfg.handoff.timeout_sec < cfg.handoff.poll_interval_sec {
        return Err(BootError::Config(
            "handoff.timeout_sec must be at least handoff.poll_interval_sec".to_string(),
        ));
    }
    Ok(())
}

pub fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

pub fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("WSLBOOT_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = config_dir()
        .or_else(|| home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.push("wslboot");
    base
}

pub fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("WSLBOOT_CONFIG") {
        return PathBuf::from(path);
    }
    default_config_dir().join("config.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_default_config_parses() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).expect("default config");
        let defaults = Config::default();
        assert_eq!(cfg.distro.name, defaults.distro.name);
        assert_eq!(cfg.windows.features, defaults.windows.features);
        assert_eq!(cfg.guest.helper_script, defaults.guest.helper_script);
        assert_eq!(cfg.guest.shell_rc_line, defaults.guest.shell_rc_line);
        assert_eq!(cfg.editor.settings, defaults.editor.settings);
        assert_eq!(cfg.handoff.timeout_sec, 300);
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.windows.wsl_default_version, 2);
        assert_eq!(cfg.handoff.poll_interval(), Duration::from_secs(2));
        assert_eq!(cfg.handoff.timeout(), Duration::from_secs(300));
        assert!(!cfg.host_engine.enabled);
        assert_eq!(cfg.guest.packages, vec!["podman".to_string()]);
    }

    #[test]
    fn config_unknown_field_errors() {
        let yaml = "version: 1\ndistro:\n  name: Ubuntu\n  flavour: lts\n";
        assert!(read_config_from_str(yaml).is_err());
    }

    #[test]
    fn config_rejects_wrong_version() {
        let err = read_config_from_str("version: 2").expect_err("version 2 should fail");
        assert!(err.to_string().contains("unsupported config version 2"));
    }

    #[test]
    fn config_rejects_distro_with_spaces() {
        let err = read_config_from_str("version: 1\ndistro:\n  name: \"Ubuntu 22\"\n")
            .expect_err("spaces should fail");
        assert!(err.to_string().contains("distro.name"));
    }

    #[test]
    fn config_rejects_timeout_shorter_than_poll() {
        let yaml = "version: 1\nhandoff:\n  poll_interval_sec: 10\n  timeout_sec: 5\n";
        let err = read_config_from_str(yaml).expect_err("timeout < poll should fail");
        assert!(err.to_string().contains("handoff.timeout_sec"));
    }

    #[test]
    fn config_rejects_malformed_extension() {
        let yaml = "version: 1\neditor:\n  extension: remote-containers\n";
        let err = read_config_from_str(yaml).expect_err("extension without publisher");
        assert!(err.to_string().contains("editor.extension"));
    }

    #[test]
    fn settings_values_accept_nested_yaml() {
        let yaml = "version: 1\neditor:\n  settings:\n    dev.containers.dockerPath: podman\n    telemetry.telemetryLevel: \"off\"\n    files.exclude:\n      \"**/.git\": true\n";
        let cfg = read_config_from_str(yaml).expect("config");
        assert_eq!(
            cfg.editor.settings["files.exclude"],
            serde_json::json!({"**/.git": true})
        );
    }

    #[test]
    fn explicit_settings_path_is_expanded() {
        let mut editor = EditorConfig::default();
        editor.settings_path = "~/code/settings.json".to_string();
        let resolved = editor.resolved_settings_path();
        assert!(!resolved.to_string_lossy().starts_with("~/"));
        assert!(resolved.ends_with("code/settings.json"));
    }

    #[test]
    fn expand_tilde_works() {
        let expanded = expand_path("~/wslboot");
        assert!(!expanded.starts_with("~/"));
    }
}
