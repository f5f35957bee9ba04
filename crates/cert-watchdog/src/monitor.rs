//! The detection loop.
//!
//! Every interval the monitor lists pods, reads logs of the eligible ones one
//! at a time, and hands the first matching scenario to the remediation
//! workflow. A failed fetch or a failed remediation is logged and the scan
//! moves on; the next cycle gets another chance.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::LogCollector;
use crate::error::Result;
use crate::scenario::{self, Scenario};
use crate::workflow::{RemediationOutcome, RemediationWorkflow};

/// Counters for one scan cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub pods_listed: usize,
    pub eligible: usize,
    pub scanned: usize,
    /// Pods that disappeared between listing and log fetch.
    pub transient_misses: usize,
    pub fetch_failures: usize,
    pub matches: usize,
    pub completed: usize,
    pub already_handled: usize,
    pub aborted: usize,
    pub failed: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &Result<RemediationOutcome>) {
        match outcome {
            Ok(RemediationOutcome::Completed { .. }) => self.completed += 1,
            Ok(RemediationOutcome::AlreadyHandled) => self.already_handled += 1,
            Ok(RemediationOutcome::Aborted { .. }) => self.aborted += 1,
            Err(_) => self.failed += 1,
        }
    }
}

pub struct Monitor {
    collector: LogCollector,
    registry: Vec<Scenario>,
    workflow: RemediationWorkflow,
    interval: Duration,
}

impl Monitor {
    pub fn new(
        collector: LogCollector,
        registry: Vec<Scenario>,
        workflow: RemediationWorkflow,
        interval: Duration,
    ) -> Self {
        Self {
            collector,
            registry,
            workflow,
            interval,
        }
    }

    /// One pass over the cluster. Only listing failures abort the cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let candidates = self.collector.list_candidates().await?;
        report.pods_listed = candidates.len();

        for (pod, verdict) in candidates {
            if !verdict.is_eligible() {
                debug!(pod = %pod.key(), reason = ?verdict, "Skipping pod");
                continue;
            }
            report.eligible += 1;

            let logs = match self.collector.fetch_logs(&pod).await {
                Ok(Some(logs)) => logs,
                Ok(None) => {
                    report.transient_misses += 1;
                    continue;
                }
                Err(_) => {
                    report.fetch_failures += 1;
                    continue;
                }
            };
            report.scanned += 1;

            let Some(matched) = scenario::detect(&self.registry, &logs) else {
                continue;
            };
            report.matches += 1;
            info!(
                pod = %pod.key(),
                namespace = %pod.namespace,
                scenario = matched.id,
                "Failure scenario detected"
            );

            let outcome = self.workflow.remediate(matched).await;
            if let Err(e) = &outcome {
                error!(
                    pod = %pod.key(),
                    scenario = matched.id,
                    category = e.category(),
                    error = %e,
                    "Remediation attempt failed"
                );
            }
            report.record(&outcome);
        }

        info!(
            pods = report.pods_listed,
            eligible = report.eligible,
            scanned = report.scanned,
            transient_misses = report.transient_misses,
            fetch_failures = report.fetch_failures,
            matches = report.matches,
            completed = report.completed,
            already_handled = report.already_handled,
            aborted = report.aborted,
            failed = report.failed,
            "Scan cycle finished"
        );
        Ok(report)
    }

    /// Scan until `shutdown` is cancelled. Cancellation is observed between
    /// cycles, never in the middle of a remediation.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Starting detection loop");
        loop {
            if let Err(e) = self.run_cycle().await {
                warn!(category = e.category(), error = %e, "Scan cycle failed");
            }

            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping detection loop");
                    break;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}
