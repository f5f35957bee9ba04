//! Rolling restarts that make rotated credentials take effect.
//!
//! Order is fixed and sequential: issuer service, operator service,
//! placement service, then every deployment in the workload namespace.
//! Downstream services only pick up the new trust bundle once the issuer
//! has reloaded, so the first failure aborts the rest of the sequence.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::cluster::ClusterStore;
use crate::error::{Result, WatchdogError};
use crate::retry::{with_retry, RetryPolicy};

/// Pod-template annotation the deployment controller treats as "roll now".
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Field manager recorded on restart patches.
pub const RESTART_FIELD_MANAGER: &str = "kubectl-rollout";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => write!(f, "deployment"),
            Self::StatefulSet => write!(f, "statefulset"),
        }
    }
}

/// A restartable workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl WorkloadRef {
    pub fn new(kind: WorkloadKind, namespace: &str, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Bounded unavailability/surge during a rolling restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutBudget {
    pub max_unavailable: String,
    pub max_surge: String,
}

impl Default for RolloutBudget {
    fn default() -> Self {
        Self {
            max_unavailable: "25%".to_string(),
            max_surge: "25%".to_string(),
        }
    }
}

/// Kubernetes accepts either an integer or a percentage string here.
fn int_or_percent(value: &str) -> Value {
    value
        .parse::<i64>()
        .map_or_else(|_| Value::String(value.to_string()), Value::from)
}

/// Strategic-merge patch that bumps the restart annotation and pins the
/// rolling update budget. StatefulSets have no surge, so they only get the
/// update strategy type.
pub fn rollout_patch(
    kind: WorkloadKind,
    budget: &RolloutBudget,
    restarted_at: DateTime<Utc>,
) -> Value {
    let mut annotations = Map::new();
    annotations.insert(
        RESTARTED_AT_ANNOTATION.to_string(),
        Value::String(restarted_at.to_rfc3339_opts(SecondsFormat::Secs, true)),
    );
    let template = json!({ "metadata": { "annotations": annotations } });

    match kind {
        WorkloadKind::Deployment => json!({
            "spec": {
                "template": template,
                "strategy": {
                    "type": "RollingUpdate",
                    "rollingUpdate": {
                        "maxUnavailable": int_or_percent(&budget.max_unavailable),
                        "maxSurge": int_or_percent(&budget.max_surge)
                    }
                }
            }
        }),
        WorkloadKind::StatefulSet => json!({
            "spec": {
                "template": template,
                "updateStrategy": { "type": "RollingUpdate" }
            }
        }),
    }
}

/// Drives the fixed restart sequence.
pub struct RestartOrchestrator {
    store: Arc<dyn ClusterStore>,
    control_plane: Vec<WorkloadRef>,
    workload_namespace: String,
    budget: RolloutBudget,
    retry: RetryPolicy,
}

impl RestartOrchestrator {
    /// `control_plane` is restarted in the given order before any workload.
    pub fn new(
        store: Arc<dyn ClusterStore>,
        control_plane: Vec<WorkloadRef>,
        workload_namespace: impl Into<String>,
        budget: RolloutBudget,
    ) -> Self {
        Self {
            store,
            control_plane,
            workload_namespace: workload_namespace.into(),
            budget,
            retry: RetryPolicy::none(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Restart the control plane, then the workload deployments. Returns the
    /// workloads that were restarted, in order.
    pub async fn restart_all(&self) -> Result<Vec<WorkloadRef>> {
        let mut restarted = Vec::new();

        for target in &self.control_plane {
            self.restart_one(target).await?;
            restarted.push(target.clone());
        }

        let deployments = with_retry(&self.retry, "list workload deployments", || {
            self.store.list_deployments(&self.workload_namespace)
        })
        .await?;

        if deployments.is_empty() {
            warn!(
                namespace = %self.workload_namespace,
                "No workload deployments to restart"
            );
        }

        for name in deployments {
            let target =
                WorkloadRef::new(WorkloadKind::Deployment, &self.workload_namespace, &name);
            self.restart_one(&target).await?;
            restarted.push(target);
        }

        Ok(restarted)
    }

    async fn restart_one(&self, target: &WorkloadRef) -> Result<()> {
        info!(workload = %target, "Triggering rolling restart");
        with_retry(&self.retry, "restart workload", || {
            self.store.restart_workload(target, &self.budget)
        })
        .await
        .map_err(|e| WatchdogError::Restart {
            target: target.to_string(),
            source: Box::new(e),
        })?;
        info!(workload = %target, "Rolling restart triggered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WatchdogConfig;
    use crate::testing::{ClusterCall, FakeCluster};
    use chrono::TimeZone;

    fn orchestrator(cluster: &Arc<FakeCluster>) -> RestartOrchestrator {
        let config = WatchdogConfig::default();
        RestartOrchestrator::new(
            cluster.clone(),
            config.control_plane_targets(),
            &config.workload_namespace,
            config.rollout_budget(),
        )
    }

    #[test]
    fn test_deployment_patch_carries_annotation_and_budget() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let patch = rollout_patch(WorkloadKind::Deployment, &RolloutBudget::default(), at);

        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2024-05-01T12:00:00Z"
        );
        assert_eq!(patch["spec"]["strategy"]["type"], "RollingUpdate");
        assert_eq!(
            patch["spec"]["strategy"]["rollingUpdate"]["maxUnavailable"],
            "25%"
        );
        assert_eq!(patch["spec"]["strategy"]["rollingUpdate"]["maxSurge"], "25%");
    }

    #[test]
    fn test_statefulset_patch_has_no_surge() {
        let budget = RolloutBudget {
            max_unavailable: "1".to_string(),
            max_surge: "2".to_string(),
        };
        let patch = rollout_patch(WorkloadKind::StatefulSet, &budget, Utc::now());
        assert_eq!(patch["spec"]["updateStrategy"]["type"], "RollingUpdate");
        assert!(patch["spec"].get("strategy").is_none());
    }

    #[test]
    fn test_integer_budget_is_numeric() {
        assert_eq!(int_or_percent("1"), json!(1));
        assert_eq!(int_or_percent("25%"), json!("25%"));
    }

    #[tokio::test]
    async fn test_restart_order_is_control_plane_then_workloads() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_deployment("default", "checkout");
        cluster.add_deployment("default", "orders");
        cluster.add_deployment("payments", "ledger");

        let restarted = orchestrator(&cluster).restart_all().await.unwrap();
        let names: Vec<String> = restarted.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec![
                "deployment/dapr-system/dapr-sentry",
                "deployment/dapr-system/dapr-operator",
                "statefulset/dapr-system/dapr-placement-server",
                "deployment/default/checkout",
                "deployment/default/orders",
            ]
        );
        assert_eq!(cluster.restarts(), restarted);
    }

    #[tokio::test]
    async fn test_issuer_failure_stops_sequence() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_deployment("default", "checkout");
        cluster.fail_restart_of("dapr-sentry");

        let err = orchestrator(&cluster).restart_all().await.unwrap_err();
        assert!(matches!(err, WatchdogError::Restart { ref target, .. } if target.ends_with("dapr-sentry")));

        let restart_calls: Vec<_> = cluster
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ClusterCall::Restart(_)))
            .collect();
        assert_eq!(restart_calls.len(), 1, "only the failed issuer restart was attempted");
        assert!(cluster.restarts().is_empty());
    }

    #[tokio::test]
    async fn test_workload_failure_aborts_remaining_workloads() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_deployment("default", "a-frontend");
        cluster.add_deployment("default", "b-backend");
        cluster.add_deployment("default", "c-worker");
        cluster.fail_restart_of("b-backend");

        let err = orchestrator(&cluster).restart_all().await.unwrap_err();
        assert_eq!(err.category(), "restart");
        let names: Vec<String> = cluster.restarts().iter().map(|w| w.name.clone()).collect();
        assert_eq!(
            names,
            vec!["dapr-sentry", "dapr-operator", "dapr-placement-server", "a-frontend"]
        );
    }
}
