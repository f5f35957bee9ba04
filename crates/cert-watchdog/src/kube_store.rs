//! [`ClusterStore`] backed by the Kubernetes API.

use async_trait::async_trait;
use chrono::Utc;
use futures::AsyncReadExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

use crate::cluster::{ClusterStore, LogRequest, PodDescriptor, RegisterData};
use crate::error::{Result, WatchdogError};
use crate::restart::{rollout_patch, RolloutBudget, WorkloadKind, WorkloadRef, RESTART_FIELD_MANAGER};

/// Label applied to the ledger register on creation.
const MANAGED_BY_LABEL: (&str, &str) = ("app.kubernetes.io/managed-by", "cert-watchdog");

#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn configmaps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn describe_pod(pod: Pod) -> PodDescriptor {
    let containers = pod
        .spec
        .map(|spec| spec.containers.into_iter().map(|c| c.name).collect())
        .unwrap_or_default();
    PodDescriptor {
        namespace: pod.metadata.namespace.unwrap_or_default(),
        name: pod.metadata.name.unwrap_or_default(),
        containers,
        annotations: pod.metadata.annotations.unwrap_or_default(),
    }
}

/// Containers may write arbitrary bytes; invalid UTF-8 is replaced rather
/// than failing the read.
fn decode_log_bytes(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn log_params(request: &LogRequest) -> LogParams {
    LogParams {
        since_seconds: request.since.map(|d| d.as_secs().max(1) as i64),
        container: request.container.clone(),
        ..LogParams::default()
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodDescriptor>> {
        let scope = namespace.unwrap_or("all namespaces");
        let pods = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| WatchdogError::from_kube("list pods", &format!("pods in {scope}"), e))?;
        Ok(pods.items.into_iter().map(describe_pod).collect())
    }

    async fn pod_logs(&self, pod: &PodDescriptor, request: &LogRequest) -> Result<String> {
        let reader = self
            .pods(Some(&pod.namespace))
            .log_stream(&pod.name, &log_params(request))
            .await
            .map_err(|e| WatchdogError::from_kube("read pod logs", &format!("pod {}", pod.key()), e))?;

        let mut raw = Vec::new();
        Box::pin(reader)
            .read_to_end(&mut raw)
            .await
            .map_err(|e| WatchdogError::Cluster {
                operation: "read pod logs".to_string(),
                message: format!("pod {}: {e}", pod.key()),
            })?;
        Ok(decode_log_bytes(&raw))
    }

    async fn get_register(&self, namespace: &str, name: &str) -> Result<Option<RegisterData>> {
        match self.configmaps(namespace).get(name).await {
            Ok(cm) => Ok(Some(cm.data.unwrap_or_default())),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(WatchdogError::from_kube(
                "get configmap",
                &format!("configmap {namespace}/{name}"),
                e,
            )),
        }
    }

    async fn create_register(
        &self,
        namespace: &str,
        name: &str,
        data: &RegisterData,
    ) -> Result<()> {
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    [(MANAGED_BY_LABEL.0.to_string(), MANAGED_BY_LABEL.1.to_string())].into(),
                ),
                ..Default::default()
            },
            data: Some(data.clone()),
            ..Default::default()
        };
        self.configmaps(namespace)
            .create(&PostParams::default(), &cm)
            .await
            .map_err(|e| {
                WatchdogError::from_kube("create configmap", &format!("configmap {namespace}/{name}"), e)
            })?;
        debug!(namespace, name, "Created ledger register");
        Ok(())
    }

    async fn update_register(
        &self,
        namespace: &str,
        name: &str,
        data: &RegisterData,
    ) -> Result<()> {
        let patch = json!({ "data": data });
        self.configmaps(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                WatchdogError::from_kube("patch configmap", &format!("configmap {namespace}/{name}"), e)
            })?;
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<String>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = deployments
            .list(&ListParams::default())
            .await
            .map_err(|e| {
                WatchdogError::from_kube("list deployments", &format!("deployments in {namespace}"), e)
            })?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .collect())
    }

    async fn restart_workload(&self, target: &WorkloadRef, budget: &RolloutBudget) -> Result<()> {
        let patch = rollout_patch(target.kind, budget, Utc::now());
        let params = PatchParams {
            field_manager: Some(RESTART_FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let resource = target.to_string();
        let map_err = |e| WatchdogError::from_kube("patch workload", &resource, e);

        match target.kind {
            WorkloadKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                api.patch(&target.name, &params, &Patch::Strategic(&patch))
                    .await
                    .map_err(map_err)?;
            }
            WorkloadKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                api.patch(&target.name, &params, &Patch::Strategic(&patch))
                    .await
                    .map_err(map_err)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use std::collections::BTreeMap;
    use std::time::Duration;

    #[test]
    fn test_describe_pod_extracts_containers_and_annotations() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("checkout-1".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(BTreeMap::from([(
                    "dapr.io/enable-monitor".to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![
                    Container {
                        name: "app".to_string(),
                        ..Default::default()
                    },
                    Container {
                        name: "daprd".to_string(),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };

        let descriptor = describe_pod(pod);
        assert_eq!(descriptor.key(), "default/checkout-1");
        assert_eq!(descriptor.containers, vec!["app", "daprd"]);
        assert_eq!(descriptor.annotation("dapr.io/enable-monitor"), Some("true"));
    }

    #[test]
    fn test_describe_pod_without_spec() {
        let descriptor = describe_pod(Pod::default());
        assert!(descriptor.containers.is_empty());
        assert!(descriptor.annotations.is_empty());
    }

    #[test]
    fn test_log_params_mapping() {
        let full = log_params(&LogRequest::default());
        assert_eq!(full.since_seconds, None);
        assert_eq!(full.container, None);

        let windowed = log_params(&LogRequest {
            since: Some(Duration::from_secs(60)),
            container: Some("daprd".to_string()),
        });
        assert_eq!(windowed.since_seconds, Some(60));
        assert_eq!(windowed.container.as_deref(), Some("daprd"));
    }

    #[test]
    fn test_invalid_utf8_in_logs_is_replaced() {
        let raw = b"level=fatal msg=\"x509: bad cert\" \xff\xfe tail";
        let text = decode_log_bytes(raw);
        assert!(text.contains("level=fatal"));
        assert!(text.contains("x509"));
        assert!(text.contains('\u{FFFD}'));
        assert!(text.ends_with(" tail"));

        assert_eq!(decode_log_bytes(b"plain"), "plain");
        assert_eq!(decode_log_bytes(b""), "");
    }
}
