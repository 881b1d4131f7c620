//! Access to the objects the backup machinery reads and writes.
//!
//! Every collaborator sits behind a trait so that the orchestration logic can be exercised
//! against in-memory state. [`kubernetes::KubeBackend`] implements all of them on top of the
//! Kubernetes API.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::Snafu;
use stackable_operator::k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};

use crate::crd::{
    backup::{BackupStatus, v1alpha1::Backup},
    v1alpha1,
    volume_snapshot::VolumeSnapshot,
};

pub mod kubernetes;

#[cfg(test)]
pub mod fake;

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("Kubernetes API request failed"))]
    Kube {
        source: stackable_operator::kube::Error,
    },

    #[snafu(display("{kind} {namespace}/{name} not found"))]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[snafu(display("key {key:?} missing in Secret {namespace}/{name}"))]
    MissingSecretKey {
        namespace: String,
        name: String,
        key: String,
    },

    #[snafu(display("pod {pod} has no IP address yet"))]
    PodHasNoIp { pod: String },

    #[snafu(display("request to the instance manager of pod {pod} failed"))]
    InstanceManagerRequest { source: reqwest::Error, pod: String },

    #[snafu(display("instance manager of pod {pod} answered with status {status}"))]
    InstanceManagerStatus { pod: String, status: u16 },
}

/// Result of a compare-and-swap write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplaceOutcome {
    Updated,
    /// The object was modified since it was read; re-read and try again.
    Conflict,
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<v1alpha1::PostgresCluster, StoreError>;

    /// Replaces the cluster if its `resourceVersion` still matches the stored one.
    async fn replace_cluster(
        &self,
        cluster: &v1alpha1::PostgresCluster,
    ) -> Result<ReplaceOutcome, StoreError>;
}

#[async_trait]
pub trait PodStore: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod, StoreError>;

    /// All instance pods of a cluster.
    async fn list_instance_pods(
        &self,
        cluster: &v1alpha1::PostgresCluster,
    ) -> Result<Vec<Pod>, StoreError>;

    /// The volumes attached to one instance.
    async fn list_instance_volumes(
        &self,
        namespace: &str,
        instance: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn create_snapshot(&self, snapshot: &VolumeSnapshot) -> Result<(), StoreError>;

    async fn list_snapshots(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<VolumeSnapshot>, StoreError>;
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn update_backup_status(
        &self,
        backup: &Backup,
        status: &BackupStatus,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret_key(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, StoreError>;
}

/// Reads `pg_controldata` from a running instance.
#[async_trait]
pub trait ControlDataProbe: Send + Sync {
    async fn control_data(&self, pod: &Pod) -> Result<String, StoreError>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventType {
    Normal,
    Warning,
}

/// A human readable progress notification attached to a [`Backup`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BackupEvent {
    pub event_type: EventType,
    pub reason: &'static str,
    pub note: String,
}

impl BackupEvent {
    pub fn normal(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Normal,
            reason,
            note: note.into(),
        }
    }

    pub fn warning(reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Warning,
            reason,
            note: note.into(),
        }
    }
}

/// Publishes events. Failing to publish is logged by the implementation, never returned.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, backup: &Backup, event: BackupEvent);
}

/// Everything the snapshot backup executor talks to.
pub trait Backend: ClusterStore + PodStore + SnapshotStore + ControlDataProbe + EventSink {}

impl<T> Backend for T where
    T: ClusterStore + PodStore + SnapshotStore + ControlDataProbe + EventSink
{
}
