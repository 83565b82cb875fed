//! Aggregated live session view across both backends

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::model::{BackendKind, LiveSession};
use crate::reconcile::Reconciler;

/// Live sessions grouped by username
pub type SessionSnapshot = BTreeMap<String, Vec<LiveSession>>;

pub struct SessionMonitor {
    reconciler: Arc<Reconciler>,
}

impl SessionMonitor {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Query both backends concurrently. An unreachable backend contributes
    /// nothing rather than failing the snapshot.
    pub async fn snapshot(&self) -> SessionSnapshot {
        let (community, commercial) = tokio::join!(
            self.reconciler.list_sessions(BackendKind::Community),
            self.reconciler.list_sessions(BackendKind::Commercial),
        );
        group(community.into_iter().chain(commercial))
    }
}

/// Group sessions by username, keeping backend order within a user
pub fn group(sessions: impl IntoIterator<Item = LiveSession>) -> SessionSnapshot {
    let mut snapshot = SessionSnapshot::new();
    for session in sessions {
        snapshot.entry(session.username.clone()).or_default().push(session);
    }
    snapshot
}
