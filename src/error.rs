//! Error types for vpnacct

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VpnAcctError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// External command ran but exited unsuccessfully
    #[error("{}", command_failed_message(.cmd, .code, .stderr))]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Backend could not be reached
    #[error("Connection failed: {reason}")]
    ConnectionFailed { reason: String },

    /// Backend produced output we could not understand
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Local persistent state could not be read or written
    #[error("Storage error: {0}")]
    Storage(String),
}

fn command_failed_message(cmd: &str, code: &Option<i32>, stderr: &str) -> String {
    match code {
        Some(code) => format!("Command '{}' failed with code {}: {}", cmd, code, stderr),
        None => format!("Command '{}' failed: {}", cmd, stderr),
    }
}

impl VpnAcctError {
    /// Text suitable for an operator-facing diagnostic.
    ///
    /// For rejected commands this is the utility's own stderr when it printed
    /// anything, otherwise the full error message.
    pub fn detail(&self) -> String {
        match self {
            VpnAcctError::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
                stderr.trim().to_string()
            }
            other => other.to_string(),
        }
    }

    /// Whether this error came from the local filesystem rather than a backend.
    pub fn is_local(&self) -> bool {
        matches!(self, VpnAcctError::Io(_) | VpnAcctError::Storage(_))
    }
}

impl From<serde_json::Error> for VpnAcctError {
    fn from(error: serde_json::Error) -> Self {
        VpnAcctError::ParseError(error.to_string())
    }
}

impl From<toml::de::Error> for VpnAcctError {
    fn from(error: toml::de::Error) -> Self {
        VpnAcctError::ParseError(error.to_string())
    }
}

pub type VpnAcctResult<T> = Result<T, VpnAcctError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = VpnAcctError::CommandFailed {
            cmd: "sacli DisconnectUser".to_string(),
            code: Some(2),
            stderr: "no such user".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command 'sacli DisconnectUser' failed with code 2: no such user"
        );
        assert_eq!(err.detail(), "no such user");

        let killed = VpnAcctError::CommandFailed {
            cmd: "sacli VPNStatus".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert_eq!(killed.detail(), "Command 'sacli VPNStatus' failed: ");
    }

    #[test]
    fn test_local_classification() {
        let io = VpnAcctError::from(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
        assert!(io.is_local());
        assert!(!VpnAcctError::Timeout("status".to_string()).is_local());
    }
}
