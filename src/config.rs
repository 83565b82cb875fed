//! Configuration management for vpnacct
//!
//! Built once at process start and passed by reference into every driver and
//! store constructor. Environment variables are consulted only by
//! [`VpnAcctConfig::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{VpnAcctError, VpnAcctResult};

/// Configuration file used when none is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpnacct/vpnacct.toml";

/// Main vpnacct configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VpnAcctConfig {
    /// File locations
    #[serde(default)]
    pub paths: ConfigPaths,
    /// OpenVPN community daemon management interface
    #[serde(default)]
    pub community: CommunityConfig,
    /// OpenVPN Access Server control utility
    #[serde(default)]
    pub commercial: CommercialConfig,
    /// Expiry sweeper schedule and policy
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Credential file read by the community daemon's auth script
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,
    /// User record database
    #[serde(default = "default_user_db")]
    pub user_db: PathBuf,
    /// Status log written by the community daemon
    #[serde(default = "default_status_log")]
    pub status_log: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunityConfig {
    #[serde(default = "default_mgmt_host")]
    pub host: String,
    #[serde(default = "default_mgmt_port")]
    pub port: u16,
    /// Bound on every read and write on the management session (seconds)
    #[serde(default = "default_mgmt_timeout")]
    pub timeout_secs: u64,
    /// Status format version passed to `status`; plain `status` when unset
    #[serde(default)]
    pub status_version: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommercialConfig {
    /// Path to the Access Server control utility
    #[serde(default = "default_sacli_path")]
    pub sacli_path: PathBuf,
    /// Bound on every utility invocation (seconds)
    #[serde(default = "default_sacli_timeout")]
    pub timeout_secs: u64,
    /// Suffix the server appends to auto-login session usernames
    #[serde(default = "default_autologin_suffix")]
    pub autologin_suffix: String,
    /// Keys leading to the client list inside `VPNStatus` output
    #[serde(default = "default_status_key_path")]
    pub status_key_path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Seconds between sweeps when run by the daemon
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Also clear `is_active` for expired community users
    #[serde(default = "default_true")]
    pub mark_community_inactive: bool,
}

fn default_credential_file() -> PathBuf {
    PathBuf::from("/etc/openvpn/psw-file")
}

fn default_user_db() -> PathBuf {
    PathBuf::from("/var/lib/vpnacct/users.toml")
}

fn default_status_log() -> PathBuf {
    PathBuf::from("/var/log/openvpn/openvpn-status.log")
}

fn default_mgmt_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mgmt_port() -> u16 {
    7505
}

fn default_mgmt_timeout() -> u64 {
    5
}

fn default_sacli_path() -> PathBuf {
    PathBuf::from("/usr/sbin/sacli")
}

fn default_sacli_timeout() -> u64 {
    20
}

fn default_autologin_suffix() -> String {
    "_AUTOLOGIN".to_string()
}

fn default_status_key_path() -> Vec<String> {
    vec!["openvpn_0".to_string(), "client_list".to_string()]
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            credential_file: default_credential_file(),
            user_db: default_user_db(),
            status_log: default_status_log(),
        }
    }
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            host: default_mgmt_host(),
            port: default_mgmt_port(),
            timeout_secs: default_mgmt_timeout(),
            status_version: None,
        }
    }
}

impl Default for CommercialConfig {
    fn default() -> Self {
        Self {
            sacli_path: default_sacli_path(),
            timeout_secs: default_sacli_timeout(),
            autologin_suffix: default_autologin_suffix(),
            status_key_path: default_status_key_path(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            mark_community_inactive: default_true(),
        }
    }
}

impl CommunityConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl CommercialConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl VpnAcctConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> VpnAcctResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| VpnAcctError::ConfigError(format!("Failed to read config {:?}: {}", path.as_ref(), e)))?;

        toml::from_str(&content)
            .map_err(|e| VpnAcctError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Load from `path` when given, else from [`DEFAULT_CONFIG_PATH`] if it
    /// exists, else built-in defaults. Then apply environment overrides and
    /// validate.
    pub fn resolve(path: Option<&Path>) -> VpnAcctResult<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None if default_path.exists() => Self::load(default_path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> VpnAcctResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| VpnAcctError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| VpnAcctError::ConfigError(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Apply the deployment's environment variables on top of file values
    pub fn apply_env_overrides(&mut self) -> VpnAcctResult<()> {
        if let Ok(host) = std::env::var("OPENVPN_MGMT_HOST") {
            self.community.host = host;
        }
        if let Ok(port) = std::env::var("OPENVPN_MGMT_PORT") {
            self.community.port = port.parse()
                .map_err(|_| VpnAcctError::ConfigError(format!("Invalid OPENVPN_MGMT_PORT: {}", port)))?;
        }
        if let Ok(timeout) = std::env::var("OPENVPN_MGMT_TIMEOUT") {
            self.community.timeout_secs = timeout.parse()
                .map_err(|_| VpnAcctError::ConfigError(format!("Invalid OPENVPN_MGMT_TIMEOUT: {}", timeout)))?;
        }
        if let Ok(path) = std::env::var("OPENVPN_PSW_FILE") {
            self.paths.credential_file = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("VPNACCT_SACLI") {
            self.commercial.sacli_path = PathBuf::from(path);
        }
        Ok(())
    }

    /// Reject values that would make drivers hang or write somewhere unexpected
    pub fn validate(&self) -> VpnAcctResult<()> {
        if self.community.port == 0 {
            return Err(VpnAcctError::ConfigError("community.port cannot be 0".to_string()));
        }
        if self.community.timeout_secs == 0 {
            return Err(VpnAcctError::ConfigError("community.timeout_secs cannot be 0".to_string()));
        }
        if self.commercial.timeout_secs == 0 {
            return Err(VpnAcctError::ConfigError("commercial.timeout_secs cannot be 0".to_string()));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(VpnAcctError::ConfigError("sweeper.interval_secs cannot be 0".to_string()));
        }
        if !self.paths.credential_file.is_absolute() {
            return Err(VpnAcctError::ConfigError(format!(
                "paths.credential_file must be absolute: {:?}",
                self.paths.credential_file
            )));
        }
        if self.commercial.status_key_path.is_empty() {
            return Err(VpnAcctError::ConfigError("commercial.status_key_path cannot be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_VARS: [&str; 5] = [
        "OPENVPN_MGMT_HOST",
        "OPENVPN_MGMT_PORT",
        "OPENVPN_MGMT_TIMEOUT",
        "OPENVPN_PSW_FILE",
        "VPNACCT_SACLI",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = VpnAcctConfig::default();
        assert_eq!(config.community.address(), "127.0.0.1:7505");
        assert_eq!(config.community.timeout(), Duration::from_secs(5));
        assert_eq!(config.commercial.timeout(), Duration::from_secs(20));
        assert_eq!(config.commercial.autologin_suffix, "_AUTOLOGIN");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: VpnAcctConfig = toml::from_str(
            r#"
            [community]
            port = 7606

            [paths]
            credential_file = "/srv/openvpn/users"
            "#,
        )
        .unwrap();
        assert_eq!(config.community.port, 7606);
        assert_eq!(config.community.host, "127.0.0.1");
        assert_eq!(config.paths.credential_file, PathBuf::from("/srv/openvpn/users"));
        assert_eq!(config.commercial.sacli_path, PathBuf::from("/usr/sbin/sacli"));
        assert_eq!(config.sweeper.interval_secs, 3600);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vpnacct.toml");
        let mut config = VpnAcctConfig::default();
        config.community.status_version = Some(2);
        config.save(&path).unwrap();

        let loaded = VpnAcctConfig::load(&path).unwrap();
        assert_eq!(loaded.community.status_version, Some(2));
        assert_eq!(loaded.commercial.status_key_path, default_status_key_path());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("OPENVPN_MGMT_HOST", "10.8.0.1");
        std::env::set_var("OPENVPN_MGMT_PORT", "7000");
        std::env::set_var("OPENVPN_PSW_FILE", "/tmp/psw");

        let config = VpnAcctConfig::resolve(None).unwrap();
        assert_eq!(config.community.address(), "10.8.0.1:7000");
        assert_eq!(config.paths.credential_file, PathBuf::from("/tmp/psw"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_invalid_env_port() {
        clear_env();
        std::env::set_var("OPENVPN_MGMT_PORT", "not-a-port");
        assert!(VpnAcctConfig::resolve(None).is_err());
        clear_env();
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let mut config = VpnAcctConfig::default();
        config.community.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = VpnAcctConfig::default();
        config.paths.credential_file = PathBuf::from("relative/psw");
        assert!(config.validate().is_err());
    }
}
