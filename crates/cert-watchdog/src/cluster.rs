//! Cluster store capability consumed by the control loop.
//!
//! The watchdog never talks to the cluster API directly; everything goes
//! through [`ClusterStore`] so the loop can run against the real API
//! ([`crate::kube_store::KubeClusterStore`]) or an in-memory double.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::Result;
use crate::restart::{RolloutBudget, WorkloadRef};

/// Read-only view of a pod, enough to decide eligibility and log parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodDescriptor {
    pub namespace: String,
    pub name: String,
    pub containers: Vec<String>,
    pub annotations: BTreeMap<String, String>,
}

impl PodDescriptor {
    /// `namespace/name`, unique across the cluster.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.containers.iter().any(|c| c == name)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Parameters for a single log read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRequest {
    /// Only return lines newer than this; `None` means the full available log.
    pub since: Option<Duration>,
    /// Restrict to one container; `None` means the pod's default container.
    pub container: Option<String>,
}

/// Key/value register contents.
pub type RegisterData = BTreeMap<String, String>;

/// Cluster operations the watchdog depends on.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List pods in one namespace, or cluster-wide when `namespace` is `None`.
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodDescriptor>>;

    /// Read a pod's log to completion.
    async fn pod_logs(&self, pod: &PodDescriptor, request: &LogRequest) -> Result<String>;

    /// Fetch a register; `Ok(None)` when it does not exist.
    async fn get_register(&self, namespace: &str, name: &str) -> Result<Option<RegisterData>>;

    /// Create a register. Fails with `AlreadyExists` if another writer won the race.
    async fn create_register(&self, namespace: &str, name: &str, data: &RegisterData)
        -> Result<()>;

    /// Overwrite an existing register's data (last writer wins).
    async fn update_register(&self, namespace: &str, name: &str, data: &RegisterData)
        -> Result<()>;

    /// Names of the deployments in a namespace.
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>>;

    /// Trigger a rolling restart of a workload within the given budget.
    async fn restart_workload(&self, target: &WorkloadRef, budget: &RolloutBudget) -> Result<()>;
}
