/*
 * 5D Labs Agent Platform - Mesh Certificate Watchdog
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Mesh certificate watchdog
//!
//! Periodically scans service-mesh logs for certificate failures. When a
//! known failure scenario shows up and the cluster's CA is self-managed, the
//! watchdog rotates the root and issuer certificates, stores them in the
//! trust bundle, rolls the control plane and workloads in a fixed order, and
//! records the scenario as handled in a ledger `ConfigMap` so it is never
//! remediated twice.

pub mod cluster;
pub mod collector;
pub mod config;
pub mod error;
pub mod health;
pub mod kube_store;
pub mod ledger;
pub mod monitor;
pub mod restart;
pub mod retry;
pub mod rotation;
pub mod scenario;
pub mod workflow;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use cluster::{ClusterStore, LogRequest, PodDescriptor, RegisterData};
pub use collector::LogCollector;
pub use config::WatchdogConfig;
pub use error::{Result, WatchdogError};
pub use ledger::{Ledger, RegisterLedger};
pub use monitor::{CycleReport, Monitor};
pub use restart::{RestartOrchestrator, RolloutBudget, WorkloadKind, WorkloadRef};
pub use rotation::{CaGenerator, RotatedCredentials, SecretBackend};
pub use scenario::{Scenario, REGISTRY};
pub use workflow::{RemediationOutcome, RemediationWorkflow, WorkflowSettings};
