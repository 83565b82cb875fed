//! Account data model shared by the stores, drivers and the reconciler

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::VpnAcctError;

/// Which enforcement mechanism owns a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OpenVPN community daemon: credential file + management interface
    #[default]
    Community,
    /// OpenVPN Access Server, driven through its control utility
    Commercial,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Community => "community",
            BackendKind::Commercial => "commercial",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = VpnAcctError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "community" | "openvpn" => Ok(BackendKind::Community),
            "commercial" | "access-server" | "as" => Ok(BackendKind::Commercial),
            other => Err(VpnAcctError::InvalidParameter(format!(
                "Unknown backend '{}' (expected 'community' or 'commercial')",
                other
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    1
}

/// Intended state of one VPN account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub secret: String,
    /// Administrator intent; see [`UserRecord::is_intended_active`] for the effective state
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Last day (inclusive) on which the account may connect
    pub expiry_date: NaiveDate,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default)]
    pub backend: BackendKind,
}

impl UserRecord {
    pub fn new(username: impl Into<String>, secret: impl Into<String>, expiry_date: NaiveDate) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            is_active: true,
            expiry_date,
            max_connections: default_max_connections(),
            backend: BackendKind::default(),
        }
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    /// `is_active` and not yet past the expiry date.
    pub fn is_intended_active(&self, today: NaiveDate) -> bool {
        self.is_active && self.expiry_date >= today
    }

    /// Stored flag says active but the expiry date has passed.
    pub fn is_expired(&self, today: NaiveDate) -> bool {
        self.is_active && self.expiry_date < today
    }

    /// The credential file line this record would produce.
    pub fn credential_entry(&self) -> CredentialEntry {
        CredentialEntry {
            username: self.username.clone(),
            secret: self.secret.clone(),
            max_connections: self.max_connections,
        }
    }
}

/// One `username:secret:max_connections` line of the credential file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub username: String,
    pub secret: String,
    pub max_connections: u32,
}

impl fmt::Display for CredentialEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.username, self.secret, self.max_connections)
    }
}

/// A tunnel a backend reported as connected at query time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LiveSession {
    pub username: String,
    pub real_address: Option<String>,
    pub virtual_address: Option<String>,
    pub backend: BackendKind,
}

/// Individual enforcement step taken while reconciling a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    WriteCredential,
    RemoveCredential,
    Provision,
    Allow,
    Deny,
    Disconnect,
    MarkInactive,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::WriteCredential => "write-credential",
            Operation::RemoveCredential => "remove-credential",
            Operation::Provision => "provision",
            Operation::Allow => "allow",
            Operation::Deny => "deny",
            Operation::Disconnect => "disconnect",
            Operation::MarkInactive => "mark-inactive",
        };
        f.write_str(name)
    }
}

/// Result of one enforcement step; surfaced to the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    pub username: String,
    pub backend: BackendKind,
    pub operation: Operation,
    pub success: bool,
    pub error_detail: Option<String>,
}

impl ReconciliationOutcome {
    pub fn ok(username: &str, backend: BackendKind, operation: Operation) -> Self {
        Self {
            username: username.to_string(),
            backend,
            operation,
            success: true,
            error_detail: None,
        }
    }

    pub fn failed(username: &str, backend: BackendKind, operation: Operation, detail: impl Into<String>) -> Self {
        Self {
            username: username.to_string(),
            backend,
            operation,
            success: false,
            error_detail: Some(detail.into()),
        }
    }
}

impl fmt::Display for ReconciliationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} on {}: ", self.operation, self.username, self.backend)?;
        match (&self.success, &self.error_detail) {
            (true, _) => f.write_str("ok"),
            (false, Some(detail)) => write!(f, "failed ({})", detail),
            (false, None) => f.write_str("failed"),
        }
    }
}
