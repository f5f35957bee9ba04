//! Watchdog configuration.
//!
//! Every field has a default matching a stock mesh install, so an empty or
//! missing config file yields a working watchdog. The ledger namespace is
//! taken from the `NAMESPACE` environment variable when set.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, WatchdogError};
use crate::ledger::ISSUER_ORG_KEY;
use crate::restart::{RolloutBudget, WorkloadKind, WorkloadRef};
use crate::retry::RetryPolicy;

/// Environment variable naming the namespace of the ledger register.
pub const ENV_NAMESPACE: &str = "NAMESPACE";

/// Namespace used for the ledger register when `NAMESPACE` is unset.
pub const DEFAULT_LEDGER_NAMESPACE: &str = "default";

/// Main watchdog configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    /// Namespace holding the ledger register.
    pub ledger_namespace: String,
    /// Name of the ledger register object.
    pub ledger_name: String,
    /// Namespace of the mesh control plane.
    pub control_plane_namespace: String,
    /// Platform namespaces that are never scanned.
    pub reserved_namespaces: Vec<String>,
    /// Pods whose name contains this fragment are the watchdog itself.
    pub self_name_fragment: String,
    /// Sidecar container whose logs are scanned in workload pods.
    pub sidecar_container: String,
    /// Opt-in annotation for workload pods.
    pub monitor_annotation: String,
    pub scan_interval_secs: u64,
    /// Log window requested for pods already seen.
    pub log_window_secs: u64,
    /// Pause after a completed remediation.
    pub cool_down_secs: u64,
    pub root_cert_lifetime_secs: u64,
    pub allowed_clock_skew_secs: u64,
    /// Issuer organization written by the mesh CA when it generated its own root.
    pub self_managed_issuer_org: String,
    /// Ledger key the issuer writes its organization under.
    pub issuer_org_key: String,
    /// Secret receiving rotated credentials.
    pub trust_bundle_secret: String,
    pub issuer_service: String,
    pub operator_service: String,
    pub placement_service: String,
    /// Namespace whose deployments are restarted after the control plane.
    pub workload_namespace: String,
    pub rollout: RolloutConfig,
    pub retry: RetryConfig,
    pub health_port: u16,
}

/// Rolling update budget, as percentages or absolute counts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RolloutConfig {
    pub max_unavailable: String,
    pub max_surge: String,
}

/// Retry policy for collaborator calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            ledger_namespace: DEFAULT_LEDGER_NAMESPACE.to_string(),
            ledger_name: "dapr-config-map".to_string(),
            control_plane_namespace: "dapr-system".to_string(),
            reserved_namespaces: vec![
                "kube-system".to_string(),
                "kube-public".to_string(),
                "kube-node-lease".to_string(),
            ],
            self_name_fragment: "dapr-monitor".to_string(),
            sidecar_container: "daprd".to_string(),
            monitor_annotation: "dapr.io/enable-monitor".to_string(),
            scan_interval_secs: 30,
            log_window_secs: 60,
            cool_down_secs: 60,
            root_cert_lifetime_secs: 56 * 60 * 60,
            allowed_clock_skew_secs: 15 * 60,
            self_managed_issuer_org: "dapr.io/sentry".to_string(),
            issuer_org_key: ISSUER_ORG_KEY.to_string(),
            trust_bundle_secret: "dapr-trust-bundle".to_string(),
            issuer_service: "dapr-sentry".to_string(),
            operator_service: "dapr-operator".to_string(),
            placement_service: "dapr-placement-server".to_string(),
            workload_namespace: "default".to_string(),
            rollout: RolloutConfig::default(),
            retry: RetryConfig::default(),
            health_port: 8080,
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            max_unavailable: "25%".to_string(),
            max_surge: "25%".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }
}

impl WatchdogConfig {
    /// Defaults when `path` does not exist; otherwise the file must parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(
                "Configuration file {} not found. Using defaults.",
                path.display()
            );
            return Ok(Self::from_env());
        }
        let config = Self::from_file(path)?;
        info!("Loaded watchdog configuration from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply the environment overlay.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content).map_err(|e| match e {
            WatchdogError::Config(msg) => {
                WatchdogError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        config.apply_env_with(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Defaults plus the environment overlay.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_with(|key| std::env::var(key).ok());
        config
    }

    /// Parse configuration from YAML text. An empty document yields defaults.
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| WatchdogError::Config(e.to_string()))
    }

    /// Apply environment overrides through the given lookup.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(namespace) = lookup(ENV_NAMESPACE).filter(|ns| !ns.trim().is_empty()) {
            self.ledger_namespace = namespace;
        }
    }

    /// Reject configurations the control loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("ledgerNamespace", &self.ledger_namespace),
            ("ledgerName", &self.ledger_name),
            ("controlPlaneNamespace", &self.control_plane_namespace),
            ("sidecarContainer", &self.sidecar_container),
            ("monitorAnnotation", &self.monitor_annotation),
            ("selfManagedIssuerOrg", &self.self_managed_issuer_org),
            ("issuerOrgKey", &self.issuer_org_key),
            ("trustBundleSecret", &self.trust_bundle_secret),
            ("issuerService", &self.issuer_service),
            ("operatorService", &self.operator_service),
            ("placementService", &self.placement_service),
            ("workloadNamespace", &self.workload_namespace),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(WatchdogError::Config(format!("{field} must not be empty")));
            }
        }

        if self.scan_interval_secs == 0 {
            return Err(WatchdogError::Config(
                "scanIntervalSecs must be greater than zero".to_string(),
            ));
        }
        if self.root_cert_lifetime_secs == 0 {
            return Err(WatchdogError::Config(
                "rootCertLifetimeSecs must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(WatchdogError::Config(
                "retry.maxAttempts must be at least 1".to_string(),
            ));
        }

        for (field, value) in [
            ("rollout.maxUnavailable", &self.rollout.max_unavailable),
            ("rollout.maxSurge", &self.rollout.max_surge),
        ] {
            if !is_int_or_percent(value) {
                return Err(WatchdogError::Config(format!(
                    "{field} must be an integer or a percentage, got '{value}'"
                )));
            }
        }

        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn log_window(&self) -> Duration {
        Duration::from_secs(self.log_window_secs)
    }

    pub fn cool_down(&self) -> Duration {
        Duration::from_secs(self.cool_down_secs)
    }

    pub fn root_cert_lifetime(&self) -> Duration {
        Duration::from_secs(self.root_cert_lifetime_secs)
    }

    pub fn allowed_clock_skew(&self) -> Duration {
        Duration::from_secs(self.allowed_clock_skew_secs)
    }

    pub fn rollout_budget(&self) -> RolloutBudget {
        RolloutBudget {
            max_unavailable: self.rollout.max_unavailable.clone(),
            max_surge: self.rollout.max_surge.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }

    /// Control-plane services restarted before any workload, in order.
    pub fn control_plane_targets(&self) -> Vec<WorkloadRef> {
        let ns = &self.control_plane_namespace;
        vec![
            WorkloadRef::new(WorkloadKind::Deployment, ns, &self.issuer_service),
            WorkloadRef::new(WorkloadKind::Deployment, ns, &self.operator_service),
            WorkloadRef::new(WorkloadKind::StatefulSet, ns, &self.placement_service),
        ]
    }
}

fn is_int_or_percent(value: &str) -> bool {
    let digits = value.strip_suffix('%').unwrap_or(value);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}
