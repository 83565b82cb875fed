use async_trait::async_trait;
use crate::error::VpnAcctResult;
use crate::model::{BackendKind, LiveSession};
use tracing::warn;

/// Capabilities every VPN backend driver offers the reconciler.
///
/// Drivers are best-effort: mutating calls return the failure to the caller
/// instead of panicking or retrying. Listing has two forms: `query_sessions`
/// reports why a query failed, `list_sessions` degrades to no sessions and
/// logs one diagnostic.
#[async_trait]
pub trait VpnBackend: Send + Sync {
    /// Which backend this driver talks to
    fn kind(&self) -> BackendKind;

    /// Currently connected tunnels, or the reason the backend could not be queried
    async fn query_sessions(&self) -> VpnAcctResult<Vec<LiveSession>>;

    /// Currently connected tunnels; empty when the backend cannot be queried
    async fn list_sessions(&self) -> Vec<LiveSession> {
        match self.query_sessions().await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(backend = %self.kind(), "Failed to query live sessions: {}", e);
                Vec::new()
            }
        }
    }

    /// Drop every live session of `username`.
    ///
    /// A user with no live session is not an error. Callers treat an `Err`
    /// as a logged, non-fatal step failure.
    async fn disconnect(&self, username: &str) -> VpnAcctResult<()>;
}

/// Account management available only on backends with their own user database.
#[async_trait]
pub trait AccountControl: VpnBackend {
    /// Make `username` a locally authenticated user with `secret` and auto-login.
    ///
    /// Each step is an idempotent property write, so re-running after a
    /// partial failure converges; steps already applied are not rolled back.
    async fn create_or_update_user(&self, username: &str, secret: &str) -> VpnAcctResult<()>;

    /// Lock the account out without deleting it (`true`) or restore access
    async fn set_denied(&self, username: &str, denied: bool) -> VpnAcctResult<()>;
}
