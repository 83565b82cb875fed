//! vpnacct - VPN Account Reconciliation Library
//!
//! Keeps VPN user accounts consistent across:
//! - the user record store (intended state)
//! - the credential file read by the OpenVPN community daemon
//! - the OpenVPN community daemon's management interface
//! - the OpenVPN Access Server control utility
//!
//! Every administrative mutation is followed by a reconciliation; an expiry
//! sweeper and a full resync serve as the backstop for eventual convergence.

pub mod error;
pub mod config;
pub mod validation;
pub mod model;
pub mod credentials;
pub mod users;
pub mod status_log;
pub mod vpn;
pub mod reconcile;
pub mod sweeper;
pub mod resync;
pub mod monitor;
pub mod service;

#[cfg(any(test, feature = "test-util"))]
#[doc(hidden)]
pub mod test_util;

// Re-export commonly used types
pub use error::{VpnAcctError, VpnAcctResult};
pub use config::VpnAcctConfig;
pub use model::{BackendKind, CredentialEntry, LiveSession, Operation, ReconciliationOutcome, UserRecord};
pub use credentials::CredentialStore;
pub use users::{FileUserStore, MemoryUserStore, UserStore};
pub use vpn::{AccountControl, CommercialBackend, CommunityBackend, VpnBackend};
pub use reconcile::{DisconnectMode, Reconciler};
pub use sweeper::{ExpirySweeper, SweepReport};
pub use resync::{Resync, ResyncReport};
pub use monitor::{SessionMonitor, SessionSnapshot};
pub use service::AccountService;
