//! Failure scenarios and first-match detection.
//!
//! A scenario pairs a pure predicate over raw log text with the remediation
//! it calls for. Matching is deliberately coarse substring search: a
//! severity marker plus one of several domain phrases. False positives are
//! tolerable because remediation is idempotent.

use std::fmt;

/// Severity token that must be present for any scenario to match.
pub const FATAL_MARKER: &str = "fatal";

/// Remediation a scenario calls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remediation {
    /// Rotate the self-managed CA and roll the mesh.
    RotateTrustBundle,
}

/// A named failure pattern.
#[derive(Clone, Copy)]
pub struct Scenario {
    /// Stable identifier; also the ledger key suffix.
    pub id: &'static str,
    pub description: &'static str,
    pub detect: fn(&str) -> bool,
    pub remediation: Remediation,
}

impl Scenario {
    pub fn matches(&self, logs: &str) -> bool {
        (self.detect)(logs)
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("id", &self.id)
            .field("remediation", &self.remediation)
            .finish_non_exhaustive()
    }
}

fn fatal_with_any(logs: &str, phrases: &[&str]) -> bool {
    logs.contains(FATAL_MARKER) && phrases.iter().any(|p| logs.contains(p))
}

fn detect_cert_expiry(logs: &str) -> bool {
    fatal_with_any(logs, &["x509", "certificate has expired"])
}

fn detect_workload_cert_signing(logs: &str) -> bool {
    fatal_with_any(
        logs,
        &[
            "error from authenticator CreateSignedWorkloadCert",
            "failed to sign certificate",
        ],
    )
}

/// Expired or untrusted certificates in the mesh.
pub const CERT_EXPIRY: Scenario = Scenario {
    id: "cert-expiry",
    description: "expired or untrusted mesh certificate",
    detect: detect_cert_expiry,
    remediation: Remediation::RotateTrustBundle,
};

/// Sidecars unable to obtain a signed workload certificate.
pub const WORKLOAD_CERT_SIGNING: Scenario = Scenario {
    id: "workload-cert-signing",
    description: "workload certificate signing failure",
    detect: detect_workload_cert_signing,
    remediation: Remediation::RotateTrustBundle,
};

/// Compiled-in registry, evaluated in order.
pub const REGISTRY: &[Scenario] = &[CERT_EXPIRY, WORKLOAD_CERT_SIGNING];

/// First scenario in `registry` whose predicate matches `logs`.
pub fn detect<'a>(registry: &'a [Scenario], logs: &str) -> Option<&'a Scenario> {
    registry.iter().find(|scenario| scenario.matches(logs))
}
