use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use crate::config::CommercialConfig;
use crate::error::{VpnAcctError, VpnAcctResult};
use crate::model::{BackendKind, LiveSession};
use super::backend::{AccountControl, VpnBackend};
use super::common;

/// User property selecting the authentication backend
const PROP_AUTH_TYPE: &str = "user_auth_type";
/// User property allowing connection without a password prompt
const PROP_AUTOLOGIN: &str = "prop_autologin";
/// User property locking the account out
const PROP_DENY: &str = "prop_deny";

/// Driver for OpenVPN Access Server, shelling out to its control utility.
///
/// Invocation failures are routine here: a missing binary, a nonzero exit or
/// unexpected output all surface as errors (or an empty session list), never
/// as panics.
pub struct CommercialBackend {
    sacli: PathBuf,
    timeout: Duration,
    autologin_suffix: String,
    status_key_path: Vec<String>,
}

impl CommercialBackend {
    pub fn new(config: &CommercialConfig) -> Self {
        Self {
            sacli: config.sacli_path.clone(),
            timeout: config.timeout(),
            autologin_suffix: config.autologin_suffix.clone(),
            status_key_path: config.status_key_path.clone(),
        }
    }

    async fn sacli(&self, args: &[&str]) -> VpnAcctResult<String> {
        common::run_command(&self.sacli, args, self.timeout).await
    }

    async fn put_property(&self, username: &str, key: &str, value: &str) -> VpnAcctResult<()> {
        self.sacli(&["-u", username, "--key", key, "--value", value, "UserPropPut"]).await?;
        Ok(())
    }

    /// Live sessions keyed by username (one per user, last entry wins)
    pub async fn sessions_by_user(&self) -> HashMap<String, LiveSession> {
        self.list_sessions()
            .await
            .into_iter()
            .map(|s| (s.username.clone(), s))
            .collect()
    }

    /// Parse `VPNStatus` JSON: the configured key path leads to a list of
    /// `[username, real_addr, virt_addr, ...]` entries.
    pub fn parse_status(&self, output: &str) -> VpnAcctResult<Vec<LiveSession>> {
        let root: Value = serde_json::from_str(output)?;

        let mut node = &root;
        for key in &self.status_key_path {
            node = node.get(key).ok_or_else(|| {
                VpnAcctError::ParseError(format!("VPNStatus output has no '{}' key", key))
            })?;
        }

        let entries = node.as_array().ok_or_else(|| {
            VpnAcctError::ParseError("VPNStatus client list is not an array".to_string())
        })?;

        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(fields) = entry.as_array() else {
                debug!("Skipping non-list client entry: {}", entry);
                continue;
            };
            let Some(raw_name) = fields.first().and_then(field_text) else {
                debug!("Skipping client entry without a username: {}", entry);
                continue;
            };

            let username = raw_name
                .strip_suffix(self.autologin_suffix.as_str())
                .map(str::to_string)
                .unwrap_or(raw_name);

            sessions.push(LiveSession {
                username,
                real_address: fields.get(1).and_then(field_text),
                virtual_address: fields.get(2).and_then(field_text),
                backend: BackendKind::Commercial,
            });
        }

        Ok(sessions)
    }
}

fn field_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl VpnBackend for CommercialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Commercial
    }

    async fn query_sessions(&self) -> VpnAcctResult<Vec<LiveSession>> {
        let output = self.sacli(&["VPNStatus"]).await?;
        self.parse_status(&output)
    }

    async fn disconnect(&self, username: &str) -> VpnAcctResult<()> {
        self.sacli(&["-u", username, "DisconnectUser"]).await?;
        Ok(())
    }
}

#[async_trait]
impl AccountControl for CommercialBackend {
    async fn create_or_update_user(&self, username: &str, secret: &str) -> VpnAcctResult<()> {
        self.put_property(username, PROP_AUTH_TYPE, "local").await.map_err(|e| {
            debug!(username = %username, "Provisioning stopped at auth type: {}", e);
            e
        })?;

        self.sacli(&["-u", username, "--new_pass", secret, "SetLocalPassword"]).await.map_err(|e| {
            debug!(username = %username, "Provisioning stopped at local password: {}", e);
            e
        })?;

        self.put_property(username, PROP_AUTOLOGIN, "true").await.map_err(|e| {
            debug!(username = %username, "Provisioning stopped at auto-login: {}", e);
            e
        })
    }

    async fn set_denied(&self, username: &str, denied: bool) -> VpnAcctResult<()> {
        let value = if denied { "true" } else { "false" };
        self.put_property(username, PROP_DENY, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeSacli;
    use tracing_test::traced_test;

    fn backend_with(sacli: PathBuf) -> CommercialBackend {
        CommercialBackend::new(&CommercialConfig {
            sacli_path: sacli,
            ..CommercialConfig::default()
        })
    }

    #[test]
    fn test_parse_status() {
        let backend = backend_with(PathBuf::from("/usr/sbin/sacli"));
        let output = r#"{
            "openvpn_0": {
                "client_list": [
                    ["alice_AUTOLOGIN", "203.0.113.5:51234", "172.27.224.2", 1024, 2048],
                    ["bob", "198.51.100.7:443"],
                    [null, "192.0.2.1:1"],
                    "garbage"
                ]
            }
        }"#;

        let sessions = backend.parse_status(output).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].username, "alice");
        assert_eq!(sessions[0].virtual_address.as_deref(), Some("172.27.224.2"));
        assert_eq!(sessions[1].username, "bob");
        assert!(sessions[1].virtual_address.is_none());
        assert!(sessions.iter().all(|s| s.backend == BackendKind::Commercial));
    }

    #[test]
    fn test_parse_status_malformed() {
        let backend = backend_with(PathBuf::from("/usr/sbin/sacli"));
        assert!(backend.parse_status("not json").is_err());
        assert!(backend.parse_status(r#"{"openvpn_1": {}}"#).is_err());
        assert!(backend.parse_status(r#"{"openvpn_0": {"client_list": {}}}"#).is_err());
    }

    #[tokio::test]
    async fn test_list_sessions_keyed_by_user() {
        let dir = tempfile::tempdir().unwrap();
        let sacli = FakeSacli::install(dir.path());
        sacli.set_status(r#"{"openvpn_0": {"client_list": [["carol_AUTOLOGIN", "192.0.2.4:1", "172.27.224.9"]]}}"#);

        let backend = backend_with(sacli.path());
        let sessions = backend.sessions_by_user().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions["carol"].real_address.as_deref(), Some("192.0.2.4:1"));
        assert_eq!(sacli.calls(), vec!["VPNStatus".to_string()]);
    }

    #[tokio::test]
    async fn test_utility_failure_yields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sacli = FakeSacli::install(dir.path());
        sacli.fail("VPNStatus");

        let backend = backend_with(sacli.path());
        assert!(backend.list_sessions().await.is_empty());

        let missing = backend_with(dir.path().join("no-such-sacli"));
        assert!(missing.list_sessions().await.is_empty());
        assert!(matches!(
            missing.query_sessions().await,
            Err(VpnAcctError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_utility_logs_one_warning() {
        let dir = tempfile::tempdir().unwrap();
        let missing = backend_with(dir.path().join("no-such-sacli"));

        assert!(missing.sessions_by_user().await.is_empty());
        logs_assert(|lines: &[&str]| {
            match lines.iter().filter(|line| line.contains("WARN")).count() {
                1 => Ok(()),
                n => Err(format!("expected one warning, got {}", n)),
            }
        });
        assert!(logs_contain("backend=commercial"));
    }

    #[tokio::test]
    async fn test_provisioning_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let sacli = FakeSacli::install(dir.path());
        let backend = backend_with(sacli.path());

        backend.create_or_update_user("dave", "hunter2").await.unwrap();
        backend.set_denied("dave", false).await.unwrap();

        assert_eq!(
            sacli.calls(),
            vec![
                "-u dave --key user_auth_type --value local UserPropPut".to_string(),
                "-u dave --new_pass hunter2 SetLocalPassword".to_string(),
                "-u dave --key prop_autologin --value true UserPropPut".to_string(),
                "-u dave --key prop_deny --value false UserPropPut".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_provisioning_aborts_on_failed_step() {
        let dir = tempfile::tempdir().unwrap();
        let sacli = FakeSacli::install(dir.path());
        sacli.fail("SetLocalPassword");
        let backend = backend_with(sacli.path());

        let err = backend.create_or_update_user("erin", "pw").await.unwrap_err();
        assert_eq!(err.detail(), "simulated failure: SetLocalPassword");

        // Auth type was applied, auto-login never attempted
        let calls = sacli.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].ends_with("UserPropPut"));
        assert!(calls[1].ends_with("SetLocalPassword"));
    }

    #[tokio::test]
    async fn test_disconnect_reports_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let sacli = FakeSacli::install(dir.path());
        let backend = backend_with(sacli.path());

        assert!(backend.disconnect("frank").await.is_ok());

        sacli.fail("DisconnectUser");
        let err = backend.disconnect("frank").await.unwrap_err();
        assert_eq!(err.detail(), "simulated failure: DisconnectUser");
    }
}
