//! VPN backend drivers
//!
//! Two enforcement mechanisms sit behind a common driver trait:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │        Reconciler / Sweeper         │
//! └──────────────┬──────────────────────┘
//!                │
//!        ┌───────┴────────┐
//!        ▼                ▼
//!   ┌──────────┐    ┌────────────┐
//!   │ Community│    │ Commercial │   <- Backend Drivers
//!   │  (mgmt)  │    │  (sacli)   │
//!   └──────────┘    └────────────┘
//! ```
//!
//! Both implement [`VpnBackend`] (`query_sessions`, `disconnect`). The
//! commercial driver also implements [`AccountControl`] for provisioning and
//! deny/allow, since the Access Server keeps its own user database; the
//! community daemon instead reads the credential file.

pub mod backend;
pub mod common;
pub mod community;
pub mod commercial;

pub use backend::{AccountControl, VpnBackend};
pub use community::CommunityBackend;
pub use commercial::CommercialBackend;
