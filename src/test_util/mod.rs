//! Test doubles for the backend drivers, shared by unit and integration tests

pub mod fake_daemon;
pub mod fake_sacli;

pub use fake_daemon::FakeManagementServer;
pub use fake_sacli::FakeSacli;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::error::{VpnAcctError, VpnAcctResult};
use crate::model::{BackendKind, LiveSession};
use crate::vpn::{AccountControl, VpnBackend};

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// A driver call as observed by [`RecordingBackend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListSessions(BackendKind),
    Disconnect {
        backend: BackendKind,
        username: String,
        /// Whether the credential file still listed the user at disconnect time
        credential_listed: bool,
    },
    Provision { username: String, secret: String },
    SetDenied { username: String, denied: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    ListSessions,
    Disconnect,
    Provision,
    SetDenied,
}

/// Calls from every fake sharing this log, in global order
pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// In-memory driver that records calls and tracks the enforcement state a
/// real backend would hold.
pub struct RecordingBackend {
    kind: BackendKind,
    log: CallLog,
    sessions: Mutex<Vec<LiveSession>>,
    provisioned: Mutex<HashSet<String>>,
    denied: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<FakeOp>>,
    credential_file: Option<PathBuf>,
}

impl RecordingBackend {
    pub fn new(kind: BackendKind, log: CallLog) -> Self {
        Self {
            kind,
            log,
            sessions: Mutex::new(Vec::new()),
            provisioned: Mutex::new(HashSet::new()),
            denied: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            credential_file: None,
        }
    }

    /// Inspect this credential file on every disconnect
    pub fn watching_credentials(mut self, path: PathBuf) -> Self {
        self.credential_file = Some(path);
        self
    }

    pub fn connect(&self, username: &str, real_address: &str) {
        self.sessions.lock().unwrap().push(LiveSession {
            username: username.to_string(),
            real_address: Some(real_address.to_string()),
            virtual_address: None,
            backend: self.kind,
        });
    }

    pub fn session_count(&self, username: &str) -> usize {
        self.sessions.lock().unwrap().iter().filter(|s| s.username == username).count()
    }

    pub fn fail(&self, op: FakeOp) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn recover(&self, op: FakeOp) {
        self.failing.lock().unwrap().remove(&op);
    }

    /// Provisioned and not denied
    pub fn grants_access(&self, username: &str) -> bool {
        self.provisioned.lock().unwrap().contains(username) && !self.denied.lock().unwrap().contains(username)
    }

    fn check(&self, op: FakeOp) -> VpnAcctResult<()> {
        if self.failing.lock().unwrap().contains(&op) {
            return Err(VpnAcctError::ConnectionFailed {
                reason: format!("simulated {:?} failure on {}", op, self.kind),
            });
        }
        Ok(())
    }

    fn credential_listed(&self, username: &str) -> bool {
        let Some(path) = &self.credential_file else {
            return false;
        };
        let prefix = format!("{}:", username);
        std::fs::read_to_string(path)
            .map(|content| content.lines().any(|line| line.starts_with(&prefix)))
            .unwrap_or(false)
    }
}

#[async_trait]
impl VpnBackend for RecordingBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn query_sessions(&self) -> VpnAcctResult<Vec<LiveSession>> {
        self.log.lock().unwrap().push(Call::ListSessions(self.kind));
        self.check(FakeOp::ListSessions)?;
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn disconnect(&self, username: &str) -> VpnAcctResult<()> {
        self.log.lock().unwrap().push(Call::Disconnect {
            backend: self.kind,
            username: username.to_string(),
            credential_listed: self.credential_listed(username),
        });
        self.check(FakeOp::Disconnect)?;
        self.sessions.lock().unwrap().retain(|s| s.username != username);
        Ok(())
    }
}

#[async_trait]
impl AccountControl for RecordingBackend {
    async fn create_or_update_user(&self, username: &str, secret: &str) -> VpnAcctResult<()> {
        self.log.lock().unwrap().push(Call::Provision {
            username: username.to_string(),
            secret: secret.to_string(),
        });
        self.check(FakeOp::Provision)?;
        self.provisioned.lock().unwrap().insert(username.to_string());
        Ok(())
    }

    async fn set_denied(&self, username: &str, denied: bool) -> VpnAcctResult<()> {
        self.log.lock().unwrap().push(Call::SetDenied {
            username: username.to_string(),
            denied,
        });
        self.check(FakeOp::SetDenied)?;
        let mut set = self.denied.lock().unwrap();
        if denied {
            set.insert(username.to_string());
        } else {
            set.remove(username);
        }
        Ok(())
    }
}
