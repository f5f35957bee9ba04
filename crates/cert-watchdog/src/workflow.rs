//! Remediation workflow for the trust bundle rotation.
//!
//! A single attempt walks the states below and either completes, aborts on
//! the issuer gate, or fails with the error of the step that broke. The
//! idempotency marker is only written after every restart succeeded, so a
//! failed attempt is retried on a later detection. Once fresh credentials
//! are persisted a pending-rotation key is recorded; a retry that finds it
//! skips straight to the restarts instead of minting another CA.
//!
//! ```text
//! Idle -> CheckingIdempotency -> VerifyingIssuer -> Rotating -> Persisting -> Restarting -> Done
//!                 |                     |                                 ^
//!                 +-> Done (handled)    +-> Aborted (foreign issuer)      |
//!                                       +-- rotation pending -------------+
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::WatchdogConfig;
use crate::error::Result;
use crate::ledger::{self, Ledger};
use crate::restart::{RestartOrchestrator, WorkloadRef};
use crate::retry::{with_retry, RetryPolicy};
use crate::rotation::{CaGenerator, SecretBackend};
use crate::scenario::{Remediation, Scenario};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    CheckingIdempotency,
    VerifyingIssuer,
    Rotating,
    Persisting,
    Restarting,
    Done,
    Aborted,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CheckingIdempotency => "checking_idempotency",
            Self::VerifyingIssuer => "verifying_issuer",
            Self::Rotating => "rotating",
            Self::Persisting => "persisting",
            Self::Restarting => "restarting",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Result of a remediation attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationOutcome {
    /// The scenario already carries its marker; nothing was touched.
    AlreadyHandled,
    /// The trusted issuer was not generated by the mesh CA.
    Aborted { issuer_org: String },
    Completed { restarted: Vec<WorkloadRef> },
}

/// Fixed parameters of a rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    pub root_cert_lifetime: Duration,
    pub allowed_clock_skew: Duration,
    /// Expected value of the ledger's issuer organization key.
    pub self_managed_issuer_org: String,
    /// Ledger key holding the trusted issuer's organization.
    pub issuer_org_key: String,
    pub cool_down: Duration,
}

impl WorkflowSettings {
    pub fn from_config(config: &WatchdogConfig) -> Self {
        Self {
            root_cert_lifetime: config.root_cert_lifetime(),
            allowed_clock_skew: config.allowed_clock_skew(),
            self_managed_issuer_org: config.self_managed_issuer_org.clone(),
            issuer_org_key: config.issuer_org_key.clone(),
            cool_down: config.cool_down(),
        }
    }
}

pub struct RemediationWorkflow {
    ledger: Arc<dyn Ledger>,
    generator: Arc<dyn CaGenerator>,
    secrets: Arc<dyn SecretBackend>,
    restarts: RestartOrchestrator,
    settings: WorkflowSettings,
    retry: RetryPolicy,
}

impl RemediationWorkflow {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        generator: Arc<dyn CaGenerator>,
        secrets: Arc<dyn SecretBackend>,
        restarts: RestartOrchestrator,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            ledger,
            generator,
            secrets,
            restarts,
            settings,
            retry: RetryPolicy::none(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the remediation the scenario calls for.
    pub async fn remediate(&self, scenario: &Scenario) -> Result<RemediationOutcome> {
        match scenario.remediation {
            Remediation::RotateTrustBundle => self.rotate_trust_bundle(scenario.id).await,
        }
    }

    async fn rotate_trust_bundle(&self, scenario_id: &str) -> Result<RemediationOutcome> {
        let mut state = WorkflowState::Idle;
        let result = self.run_rotation(scenario_id, &mut state).await;
        if let Err(e) = &result {
            warn!(
                scenario = scenario_id,
                state = %state,
                category = e.category(),
                error = %e,
                "Remediation failed"
            );
        }
        result
    }

    async fn run_rotation(
        &self,
        scenario_id: &str,
        state: &mut WorkflowState,
    ) -> Result<RemediationOutcome> {
        transition(state, WorkflowState::CheckingIdempotency, scenario_id);
        let handled = with_retry(&self.retry, "read idempotency marker", || {
            ledger::is_handled(self.ledger.as_ref(), scenario_id)
        })
        .await?;
        if handled {
            transition(state, WorkflowState::Done, scenario_id);
            info!(scenario = scenario_id, "Scenario already handled, skipping");
            return Ok(RemediationOutcome::AlreadyHandled);
        }

        transition(state, WorkflowState::VerifyingIssuer, scenario_id);
        let issuer_org = with_retry(&self.retry, "read issuer organization", || {
            self.ledger.get(&self.settings.issuer_org_key)
        })
        .await?;
        if issuer_org != self.settings.self_managed_issuer_org {
            transition(state, WorkflowState::Aborted, scenario_id);
            warn!(
                scenario = scenario_id,
                issuer_org = %issuer_org,
                expected = %self.settings.self_managed_issuer_org,
                "Trusted issuer is not self-managed, refusing to rotate"
            );
            return Ok(RemediationOutcome::Aborted { issuer_org });
        }

        let pending = with_retry(&self.retry, "read pending rotation", || {
            ledger::is_rotation_pending(self.ledger.as_ref(), scenario_id)
        })
        .await?;
        if pending {
            info!(
                scenario = scenario_id,
                "Credentials already rotated, resuming restarts"
            );
        } else {
            transition(state, WorkflowState::Rotating, scenario_id);
            let credentials = self.generator.generate_ca(
                self.settings.root_cert_lifetime,
                self.settings.allowed_clock_skew,
            )?;

            transition(state, WorkflowState::Persisting, scenario_id);
            with_retry(&self.retry, "persist trust bundle", || {
                self.secrets.store(&credentials)
            })
            .await?;
            with_retry(&self.retry, "record pending rotation", || {
                ledger::mark_rotation_pending(self.ledger.as_ref(), scenario_id)
            })
            .await?;
        }

        transition(state, WorkflowState::Restarting, scenario_id);
        let restarted = self.restarts.restart_all().await?;

        with_retry(&self.retry, "write idempotency marker", || {
            ledger::mark_handled(self.ledger.as_ref(), scenario_id)
        })
        .await?;
        with_retry(&self.retry, "clear pending rotation", || {
            ledger::clear_rotation_pending(self.ledger.as_ref(), scenario_id)
        })
        .await?;
        transition(state, WorkflowState::Done, scenario_id);
        info!(
            scenario = scenario_id,
            restarted = restarted.len(),
            "Trust bundle rotated"
        );

        if !self.settings.cool_down.is_zero() {
            info!(
                cool_down_secs = self.settings.cool_down.as_secs(),
                "Waiting for restarted workloads to settle"
            );
            tokio::time::sleep(self.settings.cool_down).await;
        }

        Ok(RemediationOutcome::Completed { restarted })
    }
}

fn transition(state: &mut WorkflowState, next: WorkflowState, scenario_id: &str) {
    info!(scenario = scenario_id, from = %state, state = %next, "Remediation state change");
    *state = next;
}
