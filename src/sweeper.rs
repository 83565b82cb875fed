//! Expiry sweeper
//!
//! Periodically withdraws access from users whose stored flag still says
//! active but whose expiry date has passed, and clears the flag so the
//! stored state matches what is enforced.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SweeperConfig;
use crate::error::VpnAcctResult;
use crate::model::{BackendKind, Operation, ReconciliationOutcome, UserRecord};
use crate::reconcile::{DisconnectMode, Reconciler};
use crate::users::UserStore;

/// What one sweep pass did
#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    /// Usernames found expired, in store order
    pub expired: Vec<String>,
    /// Users whose stored flag was cleared
    pub marked_inactive: Vec<String>,
    pub outcomes: Vec<ReconciliationOutcome>,
}

impl SweepReport {
    pub fn failures(&self) -> impl Iterator<Item = &ReconciliationOutcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }
}

pub struct ExpirySweeper {
    store: Arc<dyn UserStore>,
    reconciler: Arc<Reconciler>,
    mark_community_inactive: bool,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn UserStore>, reconciler: Arc<Reconciler>, config: &SweeperConfig) -> Self {
        Self {
            store,
            reconciler,
            mark_community_inactive: config.mark_community_inactive,
        }
    }

    /// Run one pass as of `today`.
    ///
    /// Community users are only disconnected if the daemon reports a live
    /// session for them, or if the daemon could not be asked; commercial
    /// users are denied and disconnected unconditionally. A second pass on the same day finds nothing to do.
    pub async fn sweep(&self, today: NaiveDate) -> VpnAcctResult<SweepReport> {
        let expired: Vec<UserRecord> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|record| record.is_expired(today))
            .collect();

        let mut report = SweepReport::default();
        if expired.is_empty() {
            debug!("Sweep found no expired users");
            return Ok(report);
        }

        let online = if expired.iter().any(|r| r.backend == BackendKind::Community) {
            self.online_community_users().await
        } else {
            None
        };

        for record in &expired {
            report.expired.push(record.username.clone());

            let mode = match (record.backend, &online) {
                (BackendKind::Community, Some(online)) if !online.contains(&record.username) => {
                    debug!(username = %record.username, "No live community session, skipping disconnect");
                    DisconnectMode::Skip
                }
                _ => DisconnectMode::Always,
            };
            report.outcomes.extend(self.reconciler.revoke(record, mode).await?);

            if record.backend == BackendKind::Commercial || self.mark_community_inactive {
                self.mark_inactive(record, &mut report).await;
            }
        }

        info!(
            "Sweep expired {} users, {} step failures",
            report.expired.len(),
            report.failures().count()
        );
        Ok(report)
    }

    /// Usernames with a live community session; `None` when the daemon
    /// could not be queried
    async fn online_community_users(&self) -> Option<HashSet<String>> {
        match self.reconciler.query_sessions(BackendKind::Community).await {
            Ok(sessions) => Some(sessions.into_iter().map(|session| session.username).collect()),
            Err(e) => {
                warn!(backend = "community", "Cannot tell who is connected, disconnecting every expired user: {}", e);
                None
            }
        }
    }

    async fn mark_inactive(&self, record: &UserRecord, report: &mut SweepReport) {
        let username = &record.username;
        match self.store.set_active(username, false).await {
            Ok(_) => {
                report.marked_inactive.push(username.clone());
                report
                    .outcomes
                    .push(ReconciliationOutcome::ok(username, record.backend, Operation::MarkInactive));
            }
            Err(e) => {
                warn!(username = %username, backend = %record.backend, "Failed to mark user inactive: {}", e);
                report.outcomes.push(ReconciliationOutcome::failed(
                    username,
                    record.backend,
                    Operation::MarkInactive,
                    e.to_string(),
                ));
            }
        }
    }
}
