//! Input validation and sanitization
//!
//! Usernames end up as `kill` arguments on the management interface, as
//! positional arguments to the control utility and as the first field of the
//! colon-delimited credential file, so they are restricted to an allow-list.

use crate::error::{VpnAcctError, VpnAcctResult};
use crate::model::UserRecord;

/// Maximum username length accepted by the user store
const MAX_USERNAME_LEN: usize = 150;

/// Maximum secret length accepted by the user store
const MAX_SECRET_LEN: usize = 128;

/// Validate a username against the allow-list `[A-Za-z0-9_.-]`
pub fn validate_username(username: &str) -> VpnAcctResult<()> {
    if username.is_empty() {
        return Err(VpnAcctError::InvalidParameter(
            "Username cannot be empty".to_string()
        ));
    }

    if username.len() > MAX_USERNAME_LEN {
        return Err(VpnAcctError::InvalidParameter(
            format!("Username too long (max {} characters)", MAX_USERNAME_LEN)
        ));
    }

    for c in username.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' && c != '.' && c != '-' {
            return Err(VpnAcctError::InvalidParameter(
                format!("Invalid username format: contains invalid character {:?}", c)
            ));
        }
    }

    // Would be parsed as an option by the control utility
    if username.starts_with('-') {
        return Err(VpnAcctError::InvalidParameter(
            "Username cannot start with dash".to_string()
        ));
    }

    Ok(())
}

/// Validate a secret that will be written to the credential file
pub fn validate_secret(secret: &str) -> VpnAcctResult<()> {
    if secret.is_empty() {
        return Err(VpnAcctError::InvalidParameter(
            "Secret cannot be empty".to_string()
        ));
    }

    if secret.len() > MAX_SECRET_LEN {
        return Err(VpnAcctError::InvalidParameter(
            format!("Secret too long (max {} characters)", MAX_SECRET_LEN)
        ));
    }

    if secret.contains(':') {
        return Err(VpnAcctError::InvalidParameter(
            "Secret cannot contain ':'".to_string()
        ));
    }

    if secret.chars().any(|c| c.is_control()) {
        return Err(VpnAcctError::InvalidParameter(
            "Secret cannot contain control characters".to_string()
        ));
    }

    Ok(())
}

/// Validate the per-user connection limit
pub fn validate_max_connections(max_connections: u32) -> VpnAcctResult<()> {
    if max_connections == 0 {
        return Err(VpnAcctError::InvalidParameter(
            "max_connections must be at least 1".to_string()
        ));
    }
    Ok(())
}

/// Validate every field of a record before it is stored
pub fn validate_record(record: &UserRecord) -> VpnAcctResult<()> {
    validate_username(&record.username)?;
    validate_secret(&record.secret)?;
    validate_max_connections(record.max_connections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_username_validation() {
        // Valid names
        assert!(validate_username("alice").is_ok());
        assert!(validate_username("bob.smith").is_ok());
        assert!(validate_username("user_01-x").is_ok());

        // Invalid - injection attempts
        assert!(validate_username("alice\nkill bob").is_err());
        assert!(validate_username("alice; rm -rf /").is_err());
        assert!(validate_username("alice bob").is_err());
        assert!(validate_username("al:ice").is_err());
        assert!(validate_username("alice$(id)").is_err());

        // Invalid - option-like
        assert!(validate_username("-u").is_err());

        // Invalid - empty / too long
        assert!(validate_username("").is_err());
        assert!(validate_username(&"a".repeat(151)).is_err());
    }

    #[test]
    fn test_secret_validation() {
        assert!(validate_secret("s3cret").is_ok());
        assert!(validate_secret("P@ss w0rd!").is_ok());

        assert!(validate_secret("").is_err());
        assert!(validate_secret("pass:word").is_err());
        assert!(validate_secret("pass\nword").is_err());
        assert!(validate_secret(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_record_validation() {
        let expiry = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
        let record = UserRecord::new("alice", "s3cret", expiry);
        assert!(validate_record(&record).is_ok());
        assert!(validate_record(&record.clone().with_max_connections(0)).is_err());
    }
}
