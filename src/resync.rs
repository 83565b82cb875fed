//! Full rebuild of the credential file from the user records
//!
//! Incremental reconciliation can leave drift behind after a crash or a failed
//! write. A resync derives the complete entry set from the user store, swaps
//! it in, and drops the sessions of anyone who lost their entry or whose
//! secret changed.

use chrono::NaiveDate;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::credentials::CredentialMap;
use crate::error::VpnAcctResult;
use crate::model::{BackendKind, Operation, ReconciliationOutcome};
use crate::reconcile::Reconciler;
use crate::users::UserStore;

#[derive(Debug, Default, Clone, Serialize)]
pub struct ResyncReport {
    /// Entries in the rewritten file
    pub entries: usize,
    /// Usernames whose entry was dropped
    pub removed: Vec<String>,
    /// Usernames whose entry now carries a different secret
    pub rekeyed: Vec<String>,
    /// Community users whose stored flag was cleared
    pub marked_inactive: Vec<String>,
    pub outcomes: Vec<ReconciliationOutcome>,
}

pub struct Resync {
    store: Arc<dyn UserStore>,
    reconciler: Arc<Reconciler>,
}

impl Resync {
    pub fn new(store: Arc<dyn UserStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { store, reconciler }
    }

    pub async fn run(&self, today: NaiveDate) -> VpnAcctResult<ResyncReport> {
        let records = self.store.list().await?;

        let wanted: CredentialMap = records
            .iter()
            .filter(|r| r.backend == BackendKind::Community && r.is_intended_active(today))
            .map(|r| (r.username.clone(), r.credential_entry()))
            .collect();

        let mut report = ResyncReport {
            entries: wanted.len(),
            ..ResyncReport::default()
        };

        let previous = self.reconciler.credentials().replace_all(wanted.clone()).await?;

        for username in previous.keys().filter(|u| !wanted.contains_key(*u)) {
            report.removed.push(username.clone());
            report.outcomes.push(ReconciliationOutcome::ok(
                username,
                BackendKind::Community,
                Operation::RemoveCredential,
            ));
            report
                .outcomes
                .extend(self.reconciler.disconnect(BackendKind::Community, username).await);
        }

        for (username, entry) in &wanted {
            let Some(old) = previous.get(username).filter(|old| old.secret != entry.secret) else {
                continue;
            };
            debug!(username = %username, "Secret changed since the last write, dropping sessions");
            report.rekeyed.push(old.username.clone());
            report
                .outcomes
                .extend(self.reconciler.disconnect(BackendKind::Community, username).await);
        }

        for record in records
            .iter()
            .filter(|r| r.backend == BackendKind::Community && r.is_expired(today))
        {
            let outcome = match self.store.set_active(&record.username, false).await {
                Ok(_) => {
                    report.marked_inactive.push(record.username.clone());
                    ReconciliationOutcome::ok(&record.username, BackendKind::Community, Operation::MarkInactive)
                }
                Err(e) => {
                    warn!(username = %record.username, "Failed to mark user inactive: {}", e);
                    ReconciliationOutcome::failed(
                        &record.username,
                        BackendKind::Community,
                        Operation::MarkInactive,
                        e.to_string(),
                    )
                }
            };
            report.outcomes.push(outcome);
        }

        info!(
            "Resync wrote {} credential entries, removed {}, marked {} inactive",
            report.entries,
            report.removed.len(),
            report.marked_inactive.len()
        );
        Ok(report)
    }
}
