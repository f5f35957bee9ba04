//! Log collection: candidate enumeration, eligibility and log fetch policy.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cluster::{ClusterStore, LogRequest, PodDescriptor};
use crate::config::WatchdogConfig;
use crate::error::Result;

/// Why a pod is or is not scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Runs in the mesh control-plane namespace.
    ControlPlane,
    /// Opted in via annotation and carries the sidecar.
    OptedIn,
    ReservedNamespace,
    /// The watchdog's own pods.
    OwnPod,
    NotOptedIn,
    MissingSidecar,
}

impl Eligibility {
    pub fn is_eligible(self) -> bool {
        matches!(self, Self::ControlPlane | Self::OptedIn)
    }
}

/// Annotation values treated as opt-in.
fn is_truthy(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Classify a pod. Rules apply in order: reserved namespace, self
/// exclusion, control plane, then annotation plus sidecar.
pub fn eligibility(pod: &PodDescriptor, config: &WatchdogConfig) -> Eligibility {
    if config
        .reserved_namespaces
        .iter()
        .any(|ns| *ns == pod.namespace)
    {
        return Eligibility::ReservedNamespace;
    }
    if !config.self_name_fragment.is_empty() && pod.name.contains(&config.self_name_fragment) {
        return Eligibility::OwnPod;
    }
    if pod.namespace == config.control_plane_namespace {
        return Eligibility::ControlPlane;
    }
    if !pod
        .annotation(&config.monitor_annotation)
        .is_some_and(is_truthy)
    {
        return Eligibility::NotOptedIn;
    }
    if !pod.has_container(&config.sidecar_container) {
        return Eligibility::MissingSidecar;
    }
    Eligibility::OptedIn
}

/// Enumerates eligible pods and reads their recent logs.
pub struct LogCollector {
    store: Arc<dyn ClusterStore>,
    config: WatchdogConfig,
    /// Pods whose logs have been read at least once, by `namespace/name`.
    seen: HashSet<String>,
}

impl LogCollector {
    pub fn new(store: Arc<dyn ClusterStore>, config: WatchdogConfig) -> Self {
        Self {
            store,
            config,
            seen: HashSet::new(),
        }
    }

    /// All pods cluster-wide, paired with their eligibility. Pods missing
    /// from the listing are dropped from the seen set.
    pub async fn list_candidates(&mut self) -> Result<Vec<(PodDescriptor, Eligibility)>> {
        let pods = self.store.list_pods(None).await?;
        self.forget_missing(&pods);
        Ok(pods
            .into_iter()
            .map(|pod| {
                let verdict = eligibility(&pod, &self.config);
                (pod, verdict)
            })
            .collect())
    }

    /// Full history on first contact, the recent window afterwards. Workload
    /// pods are read from the sidecar container only.
    pub fn log_request(&self, pod: &PodDescriptor) -> LogRequest {
        let since = self
            .seen
            .contains(&pod.key())
            .then(|| self.config.log_window());
        let container = (pod.namespace != self.config.control_plane_namespace)
            .then(|| self.config.sidecar_container.clone());
        LogRequest { since, container }
    }

    /// Read a pod's logs. `Ok(None)` is a transient miss: the pod vanished
    /// or is not registered yet.
    pub async fn fetch_logs(&mut self, pod: &PodDescriptor) -> Result<Option<String>> {
        let request = self.log_request(pod);
        match self.store.pod_logs(pod, &request).await {
            Ok(logs) => {
                self.seen.insert(pod.key());
                debug!(
                    pod = %pod.key(),
                    bytes = logs.len(),
                    full_history = request.since.is_none(),
                    "Fetched pod logs"
                );
                Ok(Some(logs))
            }
            Err(e) if e.is_not_found() => {
                debug!(pod = %pod.key(), error = %e, "Pod logs not available, skipping");
                Ok(None)
            }
            Err(e) => {
                warn!(pod = %pod.key(), category = e.category(), error = %e, "Failed to fetch pod logs");
                Err(e)
            }
        }
    }

    fn forget_missing(&mut self, listed: &[PodDescriptor]) {
        let live: HashSet<String> = listed.iter().map(PodDescriptor::key).collect();
        let before = self.seen.len();
        self.seen.retain(|key| live.contains(key));
        let forgotten = before - self.seen.len();
        if forgotten > 0 {
            debug!(forgotten, remaining = self.seen.len(), "Dropped departed pods from seen set");
        }
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn has_seen(&self, pod: &PodDescriptor) -> bool {
        self.seen.contains(&pod.key())
    }
}
