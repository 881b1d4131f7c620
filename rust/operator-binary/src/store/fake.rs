//! In-memory collaborators for tests.

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use stackable_operator::{
    k8s_openapi::{
        api::core::v1::{PersistentVolumeClaim, Pod, PodCondition, PodStatus},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    },
    kube::ResourceExt,
};

use super::{
    BackupEvent, BackupStore, ClusterStore, ControlDataProbe, EventSink, PodStore,
    ReplaceOutcome, SecretStore, SnapshotStore, StoreError,
};
use crate::crd::{
    CLUSTER_NAME_LABEL, INSTANCE_NAME_LABEL, PVC_ROLE_LABEL,
    backup::{BackupStatus, v1alpha1::Backup},
    fenced_instances::FencedInstances,
    v1alpha1,
    volume_snapshot::{VolumeSnapshot, VolumeSnapshotError, VolumeSnapshotStatus},
};

pub const NAMESPACE: &str = "default";

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Default)]
pub struct FakeBackend {
    clusters: Mutex<BTreeMap<Key, v1alpha1::PostgresCluster>>,
    pods: Mutex<BTreeMap<Key, Pod>>,
    volumes: Mutex<Vec<PersistentVolumeClaim>>,
    snapshots: Mutex<Vec<VolumeSnapshot>>,
    secrets: Mutex<BTreeMap<(String, String, String), Vec<u8>>>,
    backup_statuses: Mutex<Vec<BackupStatus>>,
    events: Mutex<Vec<BackupEvent>>,
    control_data: Mutex<Option<String>>,
    pending_conflicts: AtomicUsize,
    resource_version: AtomicUsize,
    cluster_writes: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_resource_version(&self) -> String {
        (self.resource_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    pub fn insert_cluster(&self, mut cluster: v1alpha1::PostgresCluster) {
        cluster.metadata.resource_version = Some(self.next_resource_version());
        let namespace = cluster.namespace().unwrap_or_default();
        self.clusters
            .lock()
            .unwrap()
            .insert(key(&namespace, &cluster.name_any()), cluster);
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> v1alpha1::PostgresCluster {
        self.clusters.lock().unwrap()[&key(namespace, name)].clone()
    }

    pub fn fenced_instances(&self, namespace: &str, name: &str) -> Vec<String> {
        FencedInstances::from_annotations(self.cluster(namespace, name).annotations())
            .unwrap()
            .names()
    }

    /// Number of successful writes to any cluster.
    pub fn cluster_writes(&self) -> usize {
        self.cluster_writes.load(Ordering::SeqCst)
    }

    /// Simulates concurrent writers: the next `count` replaces lose the race.
    pub fn fail_next_replaces(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn insert_pod(&self, pod: Pod) {
        let namespace = pod.namespace().unwrap_or_default();
        self.pods
            .lock()
            .unwrap()
            .insert(key(&namespace, &pod.name_any()), pod);
    }

    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods.get_mut(&key(namespace, name)).expect("unknown pod");
        pod.status = Some(pod_status(ready));
    }

    pub fn insert_volume(&self, pvc: PersistentVolumeClaim) {
        self.volumes.lock().unwrap().push(pvc);
    }

    pub fn set_control_data(&self, data: Option<&str>) {
        *self.control_data.lock().unwrap() = data.map(str::to_string);
    }

    pub fn insert_secret_key(&self, name: &str, key: &str, value: &[u8]) {
        self.secrets.lock().unwrap().insert(
            (NAMESPACE.to_string(), name.to_string(), key.to_string()),
            value.to_vec(),
        );
    }

    pub fn snapshots(&self) -> Vec<VolumeSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.snapshots().iter().map(|s| s.name_any()).collect();
        names.sort();
        names
    }

    pub fn set_snapshot_status(&self, name: &str, status: VolumeSnapshotStatus) {
        let mut snapshots = self.snapshots.lock().unwrap();
        let snapshot = snapshots
            .iter_mut()
            .find(|snapshot| snapshot.name_any() == name)
            .expect("unknown snapshot");
        snapshot.status = Some(status);
    }

    pub fn mark_snapshots_ready(&self) {
        for snapshot in self.snapshots.lock().unwrap().iter_mut() {
            snapshot.status = Some(VolumeSnapshotStatus {
                ready_to_use: Some(true),
                ..VolumeSnapshotStatus::default()
            });
        }
    }

    pub fn fail_snapshot(&self, name: &str, message: &str) {
        self.set_snapshot_status(
            name,
            VolumeSnapshotStatus {
                ready_to_use: Some(false),
                error: Some(VolumeSnapshotError {
                    message: Some(message.to_string()),
                    time: None,
                }),
                ..VolumeSnapshotStatus::default()
            },
        );
    }

    pub fn events(&self) -> Vec<BackupEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_reasons(&self) -> Vec<&'static str> {
        self.events().iter().map(|event| event.reason).collect()
    }

    pub fn backup_statuses(&self) -> Vec<BackupStatus> {
        self.backup_statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterStore for FakeBackend {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<v1alpha1::PostgresCluster, StoreError> {
        self.clusters
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "PostgresCluster",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn replace_cluster(
        &self,
        cluster: &v1alpha1::PostgresCluster,
    ) -> Result<ReplaceOutcome, StoreError> {
        let cluster_key = key(&cluster.namespace().unwrap_or_default(), &cluster.name_any());
        let mut clusters = self.clusters.lock().unwrap();
        let stored = clusters.get_mut(&cluster_key).expect("unknown cluster");

        if self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            stored.metadata.resource_version = Some(self.next_resource_version());
            return Ok(ReplaceOutcome::Conflict);
        }
        if stored.metadata.resource_version != cluster.metadata.resource_version {
            return Ok(ReplaceOutcome::Conflict);
        }

        let mut updated = cluster.clone();
        updated.metadata.resource_version = Some(self.next_resource_version());
        *stored = updated;
        self.cluster_writes.fetch_add(1, Ordering::SeqCst);
        Ok(ReplaceOutcome::Updated)
    }
}

#[async_trait]
impl PodStore for FakeBackend {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError> {
        self.pods
            .lock()
            .unwrap()
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_instance_pods(
        &self,
        cluster: &v1alpha1::PostgresCluster,
    ) -> Result<Vec<Pod>, StoreError> {
        let cluster_name = cluster.name_any();
        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|pod| pod.labels().get(CLUSTER_NAME_LABEL) == Some(&cluster_name))
            .cloned()
            .collect())
    }

    async fn list_instance_volumes(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .iter()
            .filter(|pvc| {
                pvc.namespace().as_deref() == Some(namespace)
                    && pvc.labels().get(INSTANCE_NAME_LABEL).map(String::as_str) == Some(instance)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for FakeBackend {
    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.lock().unwrap();
        assert!(
            !snapshots.iter().any(|s| s.name_any() == snapshot.name_any()),
            "VolumeSnapshot {} created twice",
            snapshot.name_any()
        );
        snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn list_snapshots(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeSnapshot>, StoreError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|snapshot| {
                snapshot.namespace().as_deref() == Some(namespace)
                    && labels
                        .iter()
                        .all(|(key, value)| snapshot.labels().get(key) == Some(value))
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BackupStore for FakeBackend {
    async fn update_backup_status(
        &self,
        _backup: &Backup,
        status: &BackupStatus,
    ) -> Result<(), StoreError> {
        self.backup_statuses.lock().unwrap().push(status.clone());
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FakeBackend {
    async fn get_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, StoreError> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::MissingSecretKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl ControlDataProbe for FakeBackend {
    async fn control_data(&self, pod: &Pod) -> Result<String, StoreError> {
        self.control_data
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StoreError::InstanceManagerStatus {
                pod: pod.name_any(),
                status: 503,
            })
    }
}

#[async_trait]
impl EventSink for FakeBackend {
    async fn publish(&self, _backup: &Backup, event: BackupEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn cluster(name: &str) -> v1alpha1::PostgresCluster {
    serde_yaml::from_str(&format!(
        r#"
        apiVersion: postgres.stackable.tech/v1alpha1
        kind: PostgresCluster
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          uid: 2f7d7a4c-2b5f-4f0e-9f62-000000000001
        spec:
          instances: 3
          backup:
            volumeSnapshot:
              className: csi-snapclass
        status:
          currentPrimary: {name}-1
          targetPrimary: {name}-1
        "#
    ))
    .expect("illegal test input")
}

pub fn backup(name: &str, cluster_name: &str) -> Backup {
    serde_yaml::from_str(&format!(
        r#"
        apiVersion: postgres.stackable.tech/v1alpha1
        kind: Backup
        metadata:
          name: {name}
          namespace: {NAMESPACE}
          uid: 2f7d7a4c-2b5f-4f0e-9f62-000000000002
        spec:
          cluster: {cluster_name}
        "#
    ))
    .expect("illegal test input")
}

fn pod_status(ready: bool) -> PodStatus {
    PodStatus {
        pod_ip: Some("10.0.0.1".to_string()),
        conditions: Some(vec![PodCondition {
            type_: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
            ..PodCondition::default()
        }]),
        ..PodStatus::default()
    }
}

pub fn pod(name: &str, cluster_name: &str, ready: bool) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([
                (CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string()),
                (INSTANCE_NAME_LABEL.to_string(), name.to_string()),
            ])),
            ..ObjectMeta::default()
        },
        status: Some(pod_status(ready)),
        ..Pod::default()
    }
}

pub fn volume(name: &str, instance: &str, role: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            labels: Some(BTreeMap::from([
                (INSTANCE_NAME_LABEL.to_string(), instance.to_string()),
                (PVC_ROLE_LABEL.to_string(), role.to_string()),
            ])),
            ..ObjectMeta::default()
        },
        ..PersistentVolumeClaim::default()
    }
}
