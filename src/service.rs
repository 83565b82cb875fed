//! Administrative mutations
//!
//! Every operation records the new intended state in the user store first and
//! only then reconciles, so an unreachable backend never blocks the change;
//! the returned outcomes tell the operator what could not be enforced yet.

use std::sync::Arc;
use tracing::info;

use crate::error::{VpnAcctError, VpnAcctResult};
use crate::model::{BackendKind, ReconciliationOutcome, UserRecord};
use crate::reconcile::Reconciler;
use crate::users::UserStore;

pub struct AccountService {
    store: Arc<dyn UserStore>,
    reconciler: Arc<Reconciler>,
}

impl AccountService {
    pub fn new(store: Arc<dyn UserStore>, reconciler: Arc<Reconciler>) -> Self {
        Self { store, reconciler }
    }

    pub fn store(&self) -> &Arc<dyn UserStore> {
        &self.store
    }

    pub async fn list(&self) -> VpnAcctResult<Vec<UserRecord>> {
        self.store.list().await
    }

    pub async fn create(&self, record: UserRecord) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        if self.store.get(&record.username).await?.is_some() {
            return Err(VpnAcctError::AlreadyExists(format!("User '{}'", record.username)));
        }
        self.store.upsert(record.clone()).await?;
        info!(username = %record.username, backend = %record.backend, "Created user");
        self.reconciler.reconcile(None, Some(&record)).await
    }

    /// Replace an existing record
    pub async fn update(&self, record: UserRecord) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let old = self.require(&record.username).await?;
        self.store.upsert(record.clone()).await?;
        info!(username = %record.username, "Updated user");
        self.reconciler.reconcile(Some(&old), Some(&record)).await
    }

    pub async fn delete(&self, username: &str) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let old = self
            .store
            .remove(username)
            .await?
            .ok_or_else(|| not_found(username))?;
        info!(username = %username, "Deleted user");
        self.reconciler.reconcile(Some(&old), None).await
    }

    pub async fn set_active(&self, username: &str, active: bool) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let old = self.store.set_active(username, active).await?;
        let new = old.clone().with_active(active);
        info!(username = %username, active, "Changed activation");
        self.reconciler.reconcile(Some(&old), Some(&new)).await
    }

    /// Move a user to another backend
    pub async fn transfer(&self, username: &str, backend: BackendKind) -> VpnAcctResult<Vec<ReconciliationOutcome>> {
        let old = self.require(username).await?;
        if old.backend == backend {
            return Err(VpnAcctError::InvalidParameter(format!(
                "User '{}' is already on the {} backend",
                username, backend
            )));
        }
        let new = old.clone().with_backend(backend);
        self.store.upsert(new.clone()).await?;
        info!(username = %username, from = %old.backend, to = %backend, "Transferred user");
        self.reconciler.reconcile(Some(&old), Some(&new)).await
    }

    async fn require(&self, username: &str) -> VpnAcctResult<UserRecord> {
        self.store.get(username).await?.ok_or_else(|| not_found(username))
    }
}

fn not_found(username: &str) -> VpnAcctError {
    VpnAcctError::NotFound(format!("User '{}'", username))
}
