//! Reconciliation engine
//!
//! Given the previous and the new version of a [`UserRecord`], computes which
//! enforcement steps bring the credential file and both backends in line with
//! the new intended state, and applies them in order.
//!
//! Rules, evaluated per mutation:
//!
//! 1. A user now owned by the commercial backend must not keep a credential
//!    entry: it is removed and the community session dropped. A user moving
//!    back to the community backend is denied and dropped on the commercial
//!    side first. Either way no instant exists where both backends admit it.
//! 2. Commercial owner: intended-active provisions then un-denies; otherwise
//!    deny then disconnect.
//! 3. Community owner: intended-active upserts the credential entry;
//!    otherwise remove the entry then disconnect.
//! 4. Deletion runs the inactive path of whichever backend owned the user.
//!
//! Access is always withdrawn before the disconnect is issued so a dropped
//! client cannot reconnect with a still-valid credential. Backend failures
//! are recorded as failed outcomes and the remaining steps still run;
//! credential file I/O errors abort the reconciliation.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::VpnAcctConfig;
use crate::credentials::{CredentialStore, Upsert};
use crate::error::VpnAcctResult;
use crate::model::{BackendKind, LiveSession, Operation, ReconciliationOutcome, UserRecord};
use crate::vpn::{AccountControl, CommercialBackend, CommunityBackend, VpnBackend};

/// Whether withdrawing access is followed by a disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectMode {
    Always,
    /// Caller already knows the user has no live session
    Skip,
}

/// Today's date in local time, the reference for intended-active checks
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub struct Reconciler {
    credentials: Arc<CredentialStore>,
    community: Arc<dyn VpnBackend>,
    commercial: Arc<dyn AccountControl>,
}

impl Reconciler {
    pub fn new(
        credentials: Arc<CredentialStore>,
        community: Arc<dyn VpnBackend>,
        commercial: Arc<dyn AccountControl>,
    ) -> Self {
        Self {
            credentials,
            community,
            commercial,
        }
    }

    /// Real drivers and the configured credential file
    pub fn from_config(config: &VpnAcctConfig) -> Self {
        Self::new(
            Arc::new(CredentialStore::new(&config.paths.credential_file)),
            Arc::new(CommunityBackend::new(&config.community)),
            Arc::new(CommercialBackend::new(&config.commercial)),
        )
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn community(&self) -> &Arc<dyn VpnBackend> {
        &self.community
    }

    pub fn commercial(&self) -> &Arc<dyn AccountControl> {
        &self.commercial
    }

    pub async fn list_sessions(&self, backend: BackendKind) -> Vec<LiveSession> {
        match backend {
            BackendKind::Community => self.community.list_sessions().await,
            BackendKind::Commercial => self.commercial.list_sessions().await,
        }
    }

    /// Like [`Reconciler::list_sessions`], but an unreachable backend is an error
    /// rather than an empty list
    pub async fn query_sessions(&self, backend: BackendKind) -> VpnAcctResult<Vec<LiveSession>> {
        match backend {
            BackendKind::Community => self.community.query_sessions().await,
            BackendKind::Commercial => self.commercial.query_sessions().await,
        }
    }

    /// Disconnect `username` on one backend without touching its access
    pub async fn disconnect(&self, backend: BackendKind, username: &str) -> Vec<ReconciliationOutcome> {
        let mut steps = Steps::new(username);
        self.disconnect_step(&mut steps, backend).await;
        steps.outcomes
    }

    /// Converge enforcement with the transition `old -> new`, using today's date
    pub async fn reconcile(
        &self,
        old: Option<&UserRecord>,
        new: Option<&UserRecord>,
    ) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        self.reconcile_at(old, new, today()).await
    }

    /// Converge enforcement with the transition `old -> new` as of `today`.
    ///
    /// `None` on the old side is a creation, `None` on the new side a
    /// deletion. A rename is handled as deletion of the old name followed by
    /// creation of the new one.
    pub async fn reconcile_at(
        &self,
        old: Option<&UserRecord>,
        new: Option<&UserRecord>,
        today: NaiveDate,
    ) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let outcomes = match (old, new) {
            (None, None) => Vec::new(),
            (Some(old), None) => self.delete(old).await?,
            (Some(old), Some(new)) if old.username != new.username => {
                let mut outcomes = self.delete(old).await?;
                outcomes.extend(self.apply(None, new, today).await?);
                outcomes
            }
            (old, Some(new)) => self.apply(old, new, today).await?,
        };

        let failed = outcomes.iter().filter(|o| !o.success).count();
        if let Some(first) = outcomes.first() {
            info!(
                username = %first.username,
                "Reconciled with {} steps ({} failed)",
                outcomes.len(),
                failed
            );
        }
        Ok(outcomes)
    }

    /// Withdraw access for `record` on the backend that owns it.
    ///
    /// Community: remove the credential entry, then disconnect unless
    /// `mode` says to skip it. Commercial: deny, then disconnect.
    pub async fn revoke(
        &self,
        record: &UserRecord,
        mode: DisconnectMode,
    ) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let mut steps = Steps::new(&record.username);
        self.revoke_into(&mut steps, record.backend, mode).await?;
        Ok(steps.outcomes)
    }

    async fn delete(&self, old: &UserRecord) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        debug!(username = %old.username, backend = %old.backend, "Reconciling deletion");
        let mut steps = Steps::new(&old.username);

        // A stale entry may exist whichever backend owned the user
        if old.backend == BackendKind::Commercial {
            self.withdraw_credential(&mut steps, true).await?;
        }
        self.revoke_into(&mut steps, old.backend, DisconnectMode::Always).await?;
        Ok(steps.outcomes)
    }

    async fn apply(
        &self,
        old: Option<&UserRecord>,
        new: &UserRecord,
        today: NaiveDate,
    ) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let active = new.is_intended_active(today);
        debug!(
            username = %new.username,
            backend = %new.backend,
            active,
            "Reconciling update"
        );
        let mut steps = Steps::new(&new.username);

        match new.backend {
            BackendKind::Commercial => {
                self.withdraw_credential(&mut steps, true).await?;
                if active {
                    self.grant_commercial(&mut steps, &new.secret).await;
                } else {
                    self.revoke_into(&mut steps, BackendKind::Commercial, DisconnectMode::Always)
                        .await?;
                }
            }
            BackendKind::Community => {
                if old.is_some_and(|o| o.backend == BackendKind::Commercial) {
                    self.revoke_into(&mut steps, BackendKind::Commercial, DisconnectMode::Always)
                        .await?;
                }
                if active {
                    self.grant_community(&mut steps, new).await?;
                } else {
                    self.revoke_into(&mut steps, BackendKind::Community, DisconnectMode::Always)
                        .await?;
                }
            }
        }

        Ok(steps.outcomes)
    }

    async fn grant_commercial(&self, steps: &mut Steps, secret: &str) {
        let provisioned = self
            .commercial
            .create_or_update_user(&steps.username, secret)
            .await;
        if steps.record(BackendKind::Commercial, Operation::Provision, provisioned) {
            let allowed = self.commercial.set_denied(&steps.username, false).await;
            steps.record(BackendKind::Commercial, Operation::Allow, allowed);
        } else {
            steps.skip(
                BackendKind::Commercial,
                Operation::Allow,
                "skipped: provisioning did not complete",
            );
        }
    }

    async fn grant_community(&self, steps: &mut Steps, record: &UserRecord) -> VpnAcctResult<()> {
        let entry = record.credential_entry();
        match self.credentials.upsert(entry).await? {
            Upsert::Unchanged => {}
            Upsert::Inserted => steps.ok(BackendKind::Community, Operation::WriteCredential),
            Upsert::Replaced(previous) => {
                steps.ok(BackendKind::Community, Operation::WriteCredential);
                // Sessions authenticated with the old secret must re-authenticate
                if previous.secret != record.secret {
                    self.disconnect_step(steps, BackendKind::Community).await;
                }
            }
        }
        Ok(())
    }

    async fn revoke_into(&self, steps: &mut Steps, backend: BackendKind, mode: DisconnectMode) -> VpnAcctResult<()> {
        match backend {
            BackendKind::Community => {
                self.withdraw_credential(steps, false).await?;
            }
            BackendKind::Commercial => {
                let denied = self.commercial.set_denied(&steps.username, true).await;
                steps.record(BackendKind::Commercial, Operation::Deny, denied);
            }
        }

        if mode == DisconnectMode::Always {
            self.disconnect_step(steps, backend).await;
        }
        Ok(())
    }

    /// Remove the user's credential entry. With `disconnect_if_removed` the
    /// community session is dropped only when an entry actually existed.
    async fn withdraw_credential(&self, steps: &mut Steps, disconnect_if_removed: bool) -> VpnAcctResult<()> {
        if self.credentials.remove(&steps.username).await?.is_some() {
            steps.ok(BackendKind::Community, Operation::RemoveCredential);
            if disconnect_if_removed {
                self.disconnect_step(steps, BackendKind::Community).await;
            }
        }
        Ok(())
    }

    async fn disconnect_step(&self, steps: &mut Steps, backend: BackendKind) {
        let result = match backend {
            BackendKind::Community => self.community.disconnect(&steps.username).await,
            BackendKind::Commercial => self.commercial.disconnect(&steps.username).await,
        };
        steps.record(backend, Operation::Disconnect, result);
    }
}

/// Outcomes collected while reconciling one user
struct Steps {
    username: String,
    outcomes: Vec<ReconciliationOutcome>,
}

impl Steps {
    fn new(username: &str) -> Self {
        Self {
            username: username.to_string(),
            outcomes: Vec::new(),
        }
    }

    fn ok(&mut self, backend: BackendKind, operation: Operation) {
        self.outcomes
            .push(ReconciliationOutcome::ok(&self.username, backend, operation));
    }

    fn skip(&mut self, backend: BackendKind, operation: Operation, reason: &str) {
        warn!(username = %self.username, backend = %backend, "{} {}", operation, reason);
        self.outcomes.push(ReconciliationOutcome::failed(
            &self.username,
            backend,
            operation,
            reason,
        ));
    }

    /// Record a driver result; returns whether it succeeded
    fn record(&mut self, backend: BackendKind, operation: Operation, result: VpnAcctResult<()>) -> bool {
        match result {
            Ok(()) => {
                self.ok(backend, operation);
                true
            }
            Err(e) => {
                warn!(username = %self.username, backend = %backend, "{} failed: {}", operation, e);
                self.outcomes.push(ReconciliationOutcome::failed(
                    &self.username,
                    backend,
                    operation,
                    e.detail(),
                ));
                false
            }
        }
    }
}
