use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt};
use stackable_operator::{
    k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret},
    kube::{
        self, Api, Resource, ResourceExt,
        api::{ListParams, Patch, PatchParams, PostParams},
        runtime::events::{Event, EventType as KubeEventType, Recorder},
    },
};

use super::{
    BackupEvent, BackupStore, ClusterStore, ControlDataProbe, EventSink, EventType,
    InstanceManagerRequestSnafu, InstanceManagerStatusSnafu, KubeSnafu, MissingSecretKeySnafu,
    NotFoundSnafu, PodHasNoIpSnafu, PodStore, ReplaceOutcome, SecretStore, SnapshotStore,
    StoreError,
};
use crate::crd::{
    CLUSTER_NAME_LABEL, INSTANCE_NAME_LABEL,
    backup::{BackupStatus, v1alpha1::Backup},
    v1alpha1,
    volume_snapshot::VolumeSnapshot,
};

pub const DEFAULT_INSTANCE_MANAGER_PORT: u16 = 8000;

const HTTP_NOT_FOUND: u16 = 404;
const HTTP_CONFLICT: u16 = 409;

/// The collaborators of the backup machinery, backed by the Kubernetes API and the HTTP
/// endpoint of the instance manager running next to every PostgreSQL instance.
#[derive(Clone)]
pub struct KubeBackend {
    client: kube::Client,
    http: reqwest::Client,
    recorder: Recorder,
    instance_manager_port: u16,
}

#[derive(Deserialize)]
struct ControlDataResponse {
    data: String,
}

impl KubeBackend {
    pub fn new(client: kube::Client, recorder: Recorder, instance_manager_port: u16) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
            recorder,
            instance_manager_port,
        }
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<
                DynamicType = (),
                Scope = stackable_operator::k8s_openapi::NamespaceResourceScope,
            >,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn get_namespaced<K>(
        &self,
        kind: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<K, StoreError>
    where
        K: Resource<
                DynamicType = (),
                Scope = stackable_operator::k8s_openapi::NamespaceResourceScope,
            > + Clone
            + std::fmt::Debug
            + serde::de::DeserializeOwned,
    {
        match self.namespaced::<K>(namespace).get(name).await {
            Ok(object) => Ok(object),
            Err(kube::Error::Api(response)) if response.code == HTTP_NOT_FOUND => {
                NotFoundSnafu {
                    kind,
                    namespace,
                    name,
                }
                .fail()
            }
            Err(error) => Err(error).context(KubeSnafu),
        }
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl ClusterStore for KubeBackend {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<v1alpha1::PostgresCluster, StoreError> {
        self.get_namespaced("PostgresCluster", namespace, name).await
    }

    async fn replace_cluster(
        &self,
        cluster: &v1alpha1::PostgresCluster,
    ) -> Result<ReplaceOutcome, StoreError> {
        let namespace = cluster.namespace().unwrap_or_default();
        match self
            .namespaced::<v1alpha1::PostgresCluster>(&namespace)
            .replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await
        {
            Ok(_) => Ok(ReplaceOutcome::Updated),
            Err(kube::Error::Api(response)) if response.code == HTTP_CONFLICT => {
                Ok(ReplaceOutcome::Conflict)
            }
            Err(error) => Err(error).context(KubeSnafu),
        }
    }
}

#[async_trait]
impl PodStore for KubeBackend {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        self.get_namespaced("Pod", namespace, name).await
    }

    async fn list_instance_pods(
        &self,
        cluster: &v1alpha1::PostgresCluster,
    ) -> Result<Vec<Pod>, StoreError> {
        let selector = label_selector(&BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            cluster.name_any(),
        )]));
        let pods = self
            .namespaced::<Pod>(&cluster.namespace().unwrap_or_default())
            .list(&ListParams::default().labels(&selector))
            .await
            .context(KubeSnafu)?;
        Ok(pods.items)
    }

    async fn list_instance_volumes(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        let selector = label_selector(&BTreeMap::from([(
            INSTANCE_NAME_LABEL.to_string(),
            instance.to_string(),
        )]));
        let pvcs = self
            .namespaced::<PersistentVolumeClaim>(namespace)
            .list(&ListParams::default().labels(&selector))
            .await
            .context(KubeSnafu)?;
        Ok(pvcs.items)
    }
}

#[async_trait]
impl SnapshotStore for KubeBackend {
    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError> {
        self.namespaced::<VolumeSnapshot>(&snapshot.namespace().unwrap_or_default())
            .create(&PostParams::default(), snapshot)
            .await
            .context(KubeSnafu)?;
        Ok(())
    }

    async fn list_snapshots(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeSnapshot>, StoreError> {
        let snapshots = self
            .namespaced::<VolumeSnapshot>(namespace)
            .list(&ListParams::default().labels(&label_selector(labels)))
            .await
            .context(KubeSnafu)?;
        Ok(snapshots.items)
    }
}

#[async_trait]
impl BackupStore for KubeBackend {
    async fn update_backup_status(
        &self,
        backup: &Backup,
        status: &BackupStatus,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({ "status": status });
        self.namespaced::<Backup>(&backup.namespace().unwrap_or_default())
            .patch_status(
                &backup.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .context(KubeSnafu)?;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for KubeBackend {
    async fn get_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, StoreError> {
        let secret: Secret = self.get_namespaced("Secret", namespace, name).await?;
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|value| value.0)
            .context(MissingSecretKeySnafu {
                namespace,
                name,
                key,
            })
    }
}

#[async_trait]
impl ControlDataProbe for KubeBackend {
    async fn control_data(&self, pod: &Pod) -> Result<String, StoreError> {
        let pod_name = pod.name_any();
        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.as_deref())
            .context(PodHasNoIpSnafu { pod: &pod_name })?;
        let url = format!(
            "http://{pod_ip}:{port}/pg/controldata",
            port = self.instance_manager_port
        );

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context(InstanceManagerRequestSnafu { pod: &pod_name })?;
        if !response.status().is_success() {
            return InstanceManagerStatusSnafu {
                pod: pod_name,
                status: response.status().as_u16(),
            }
            .fail();
        }

        let body: ControlDataResponse = response
            .json()
            .await
            .context(InstanceManagerRequestSnafu { pod: &pod_name })?;
        Ok(body.data)
    }
}

#[async_trait]
impl EventSink for KubeBackend {
    async fn publish(&self, backup: &Backup, event: BackupEvent) {
        let event_type = match event.event_type {
            EventType::Normal => KubeEventType::Normal,
            EventType::Warning => KubeEventType::Warning,
        };
        let result = self
            .recorder
            .publish(
                &Event {
                    type_: event_type,
                    reason: event.reason.to_string(),
                    note: Some(event.note),
                    action: event.reason.to_string(),
                    secondary: None,
                },
                &backup.object_ref(&()),
            )
            .await;

        if let Err(error) = result {
            tracing::warn!(
                backup.name = %backup.name_any(),
                error = &error as &dyn std::error::Error,
                "failed to publish event"
            );
        }
    }
}
