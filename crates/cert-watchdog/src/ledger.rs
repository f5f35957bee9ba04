//! State ledger: a durable key/value register used for idempotency markers
//! and cross-component metadata.
//!
//! The register is a single namespaced `ConfigMap`. It is created empty on
//! first access. Writes are read-modify-write with no optimistic locking, so
//! concurrent writers race and the last one wins; the watchdog assumes it
//! is the only instance running per cluster.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cluster::{ClusterStore, RegisterData};
use crate::error::{Result, WatchdogError};

/// Key holding the organization of the currently trusted issuer certificate.
pub const ISSUER_ORG_KEY: &str = "issuer_org_name";

/// Value stored under a scenario key once it has been remediated.
pub const HANDLED_MARKER: &str = "true";

/// Ledger key marking a scenario as handled.
pub fn scenario_key(scenario_id: &str) -> String {
    format!("scenario:{scenario_id}")
}

/// Ledger key recording that fresh credentials were persisted for the
/// scenario but the restart sequence has not completed yet.
pub fn rotation_key(scenario_id: &str) -> String {
    format!("rotation:{scenario_id}")
}

/// Narrow key/value contract.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Value for `key`, or the empty string when unset.
    async fn get(&self, key: &str) -> Result<String>;

    /// Insert or overwrite `key`.
    async fn set(&self, key: &str, value: &str) -> Result<()>;
}

/// Whether the scenario carries the handled marker.
pub async fn is_handled(ledger: &dyn Ledger, scenario_id: &str) -> Result<bool> {
    Ok(ledger.get(&scenario_key(scenario_id)).await? == HANDLED_MARKER)
}

/// Record that the scenario has been remediated.
pub async fn mark_handled(ledger: &dyn Ledger, scenario_id: &str) -> Result<()> {
    ledger.set(&scenario_key(scenario_id), HANDLED_MARKER).await
}

/// Whether credentials were already rotated and persisted for the scenario.
pub async fn is_rotation_pending(ledger: &dyn Ledger, scenario_id: &str) -> Result<bool> {
    Ok(ledger.get(&rotation_key(scenario_id)).await? == HANDLED_MARKER)
}

/// Record that rotated credentials are persisted and only restarts remain.
pub async fn mark_rotation_pending(ledger: &dyn Ledger, scenario_id: &str) -> Result<()> {
    ledger.set(&rotation_key(scenario_id), HANDLED_MARKER).await
}

/// Clear the pending-rotation record once the scenario is handled.
pub async fn clear_rotation_pending(ledger: &dyn Ledger, scenario_id: &str) -> Result<()> {
    ledger.set(&rotation_key(scenario_id), "").await
}

/// `ConfigMap` data keys only allow `[-._a-zA-Z0-9]`, so logical keys are
/// stored with `:` mapped to `.`.
pub fn storage_key(key: &str) -> String {
    key.replace(':', ".")
}

/// Ledger backed by a register object in the cluster store.
pub struct RegisterLedger {
    store: Arc<dyn ClusterStore>,
    namespace: String,
    name: String,
}

impl RegisterLedger {
    pub fn new(store: Arc<dyn ClusterStore>, namespace: &str, name: &str) -> Self {
        Self {
            store,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Current register contents, creating an empty register if absent.
    async fn load_or_create(&self) -> Result<RegisterData> {
        if let Some(data) = self.store.get_register(&self.namespace, &self.name).await? {
            return Ok(data);
        }

        info!(
            namespace = %self.namespace,
            name = %self.name,
            "Ledger register not found, creating"
        );
        match self
            .store
            .create_register(&self.namespace, &self.name, &RegisterData::new())
            .await
        {
            Ok(()) => Ok(RegisterData::new()),
            Err(WatchdogError::AlreadyExists { .. }) => {
                // Lost the creation race; read what the winner wrote.
                Ok(self
                    .store
                    .get_register(&self.namespace, &self.name)
                    .await?
                    .unwrap_or_default())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Ledger for RegisterLedger {
    async fn get(&self, key: &str) -> Result<String> {
        let data = self.load_or_create().await?;
        Ok(data.get(&storage_key(key)).cloned().unwrap_or_default())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut data = self.load_or_create().await?;
        data.insert(storage_key(key), value.to_string());
        self.store
            .update_register(&self.namespace, &self.name, &data)
            .await?;
        debug!(key, namespace = %self.namespace, name = %self.name, "Ledger key written");
        Ok(())
    }
}
