//! Drives one snapshot backup of one instance to completion.
//!
//! The executor keeps no state between invocations. Everything it needs to resume is read
//! back from the cluster: the fencing annotation, the readiness of the pod and the
//! `VolumeSnapshot`s labelled with the backup name. Each call advances the backup by at most
//! one step and either finishes it or asks to be called again later.

use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod},
    kube::ResourceExt,
};

use crate::{
    crd::{
        backup::v1alpha1::Backup,
        v1alpha1,
        volume_snapshot::{SnapshotState, VolumeSnapshot},
    },
    fencing::{self, FenceDecision, FencingController, fence_decision, is_fenced_in_effect},
    snapshot::{self, SnapshotGateway, snapshot_suffix},
    store::{Backend, BackupEvent, StoreError},
};

pub const DEFAULT_REQUEUE_AFTER: Duration = Duration::from_secs(10);

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("cannot fence instance {instance:?}, {fenced:?} are already fenced"))]
    ConflictingFence {
        instance: String,
        fenced: Vec<String>,
    },

    #[snafu(display("failed to fence instance {instance:?}"))]
    Fence {
        source: fencing::Error,
        instance: String,
    },

    #[snafu(display("failed to unfence instance {instance:?}"))]
    Unfence {
        source: fencing::Error,
        instance: String,
    },

    #[snafu(display("failed to get pod {pod}"))]
    GetPod { source: StoreError, pod: String },

    #[snafu(display("failed to manage the VolumeSnapshots of the backup"))]
    Snapshots { source: snapshot::Error },

    #[snafu(display("VolumeSnapshot {name} failed: {reason}"))]
    SnapshotFailed { name: String, reason: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Errors that retrying will not resolve. The backup is failed instead of requeued.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::ConflictingFence { .. } | Error::SnapshotFailed { .. } => true,
            Error::Fence { source, .. } => source.is_precondition_failure(),
            Error::Snapshots {
                source: snapshot::Error::MissingVolumeSnapshotConfiguration { .. },
            } => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Fence the instance for the duration of the snapshot (cold backup).
    pub should_fence: bool,
    pub requeue_after: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            should_fence: false,
            requeue_after: DEFAULT_REQUEUE_AFTER,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// Every snapshot is ready to use.
    Done { snapshot_names: Vec<String> },
    /// Call again after the given delay.
    RequeueAfter(Duration),
}

pub struct SnapshotBackupExecutor<'a, B: ?Sized> {
    backend: &'a B,
    config: ExecutorConfig,
}

impl<'a, B> SnapshotBackupExecutor<'a, B>
where
    B: Backend + ?Sized,
{
    pub fn new(backend: &'a B, config: ExecutorConfig) -> Self {
        Self { backend, config }
    }

    /// Advances the backup of `target_pod` by one step.
    ///
    /// `cluster` must be the latest observed state, its fencing annotation decides whether a
    /// fence still has to be requested.
    pub async fn execute(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        backup: &Backup,
        target_pod: &Pod,
        volumes: &[PersistentVolumeClaim],
    ) -> Result<Outcome> {
        let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let instance = target_pod.name_any();

        if self.config.should_fence {
            self.ensure_fenced(cluster, backup, &namespace, &instance)
                .await?;

            let pod = self
                .backend
                .get_pod(&namespace, &instance)
                .await
                .context(GetPodSnafu { pod: &instance })?;
            if !is_fenced_in_effect(&pod) {
                tracing::info!(
                    pod.name = %instance,
                    "waiting for the fenced instance to shut down"
                );
                return Ok(Outcome::RequeueAfter(self.config.requeue_after));
            }
        }

        let gateway = SnapshotGateway::new(self.backend);
        let snapshots = gateway
            .list_snapshots_for_backup(cluster, backup)
            .await
            .context(SnapshotsSnafu)?;

        if snapshots.is_empty() && !volumes.is_empty() {
            gateway
                .create_snapshot_set(cluster, backup, target_pod, volumes, &snapshot_suffix())
                .await
                .context(SnapshotsSnafu)?;
            return Ok(Outcome::RequeueAfter(self.config.requeue_after));
        }

        let snapshot_names = match SnapshotSetState::of(&snapshots) {
            SnapshotSetState::Failed { name, reason } => {
                self.unfence_after_failure(cluster, backup, &namespace, &instance)
                    .await;
                self.backend
                    .publish(
                        backup,
                        BackupEvent::warning(
                            "SnapshotFailed",
                            format!("VolumeSnapshot {name} failed: {reason}"),
                        ),
                    )
                    .await;
                return SnapshotFailedSnafu { name, reason }.fail();
            }
            SnapshotSetState::Pending { names } => {
                tracing::debug!(pending = ?names, "waiting for VolumeSnapshots to become ready");
                return Ok(Outcome::RequeueAfter(self.config.requeue_after));
            }
            SnapshotSetState::Ready { names } => names,
        };

        if self.config.should_fence {
            let unfenced = FencingController::new(self.backend)
                .request_unfence(&namespace, &cluster.name_any(), &instance)
                .await
                .context(UnfenceSnafu {
                    instance: &instance,
                })?;
            if unfenced {
                publish_unfence(self.backend, backup, &instance).await;
            }
        }

        Ok(Outcome::Done { snapshot_names })
    }

    async fn ensure_fenced(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        backup: &Backup,
        namespace: &str,
        instance: &str,
    ) -> Result<()> {
        let fenced = fencing::fenced_instances(cluster).context(FenceSnafu { instance })?;
        match fence_decision(&fenced, instance) {
            FenceDecision::Held => Ok(()),
            FenceDecision::Conflict { fenced } => ConflictingFenceSnafu { instance, fenced }.fail(),
            FenceDecision::Request => {
                self.backend
                    .publish(
                        backup,
                        BackupEvent::normal("FencePod", format!("Fencing pod {instance}")),
                    )
                    .await;
                match FencingController::new(self.backend)
                    .request_fence(namespace, &cluster.name_any(), instance)
                    .await
                {
                    // Another reconciliation got there first
                    Ok(()) | Err(fencing::Error::AlreadyFenced { .. }) => Ok(()),
                    Err(source) => Err(source).context(FenceSnafu { instance }),
                }
            }
        }
    }

    async fn unfence_after_failure(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        backup: &Backup,
        namespace: &str,
        instance: &str,
    ) {
        if self.config.should_fence {
            release_fence(self.backend, backup, namespace, &cluster.name_any(), instance).await;
        }
    }
}

/// Lifts the fence of `instance` on the way to failing `backup`.
///
/// Failing to do so is logged, the failure of the backup is what gets reported. An instance
/// that is not fenced is left untouched.
pub async fn release_fence<B>(
    backend: &B,
    backup: &Backup,
    namespace: &str,
    cluster: &str,
    instance: &str,
) where
    B: Backend + ?Sized,
{
    match FencingController::new(backend)
        .request_unfence(namespace, cluster, instance)
        .await
    {
        Ok(true) => publish_unfence(backend, backup, instance).await,
        Ok(false) => {}
        Err(error) => {
            tracing::error!(
                pod.name = %instance,
                error = &error as &dyn std::error::Error,
                "failed to unfence instance of a failed backup"
            );
        }
    }
}

async fn publish_unfence<B>(backend: &B, backup: &Backup, instance: &str)
where
    B: Backend + ?Sized,
{
    backend
        .publish(
            backup,
            BackupEvent::normal("UnfencePod", format!("Unfencing pod {instance}")),
        )
        .await;
}

/// Combined state of the snapshots of one backup. A single failure fails the whole set.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotSetState {
    Failed { name: String, reason: String },
    Pending { names: Vec<String> },
    /// Also the state of an empty set.
    Ready { names: Vec<String> },
}

impl SnapshotSetState {
    pub fn of(snapshots: &[VolumeSnapshot]) -> Self {
        let mut pending = Vec::new();
        let mut ready = Vec::new();
        for snapshot in snapshots {
            match snapshot.state() {
                SnapshotState::Failed { reason } => {
                    return SnapshotSetState::Failed {
                        name: snapshot.name_any(),
                        reason,
                    };
                }
                SnapshotState::Pending => pending.push(snapshot.name_any()),
                SnapshotState::Ready => ready.push(snapshot.name_any()),
            }
        }

        if pending.is_empty() {
            ready.sort();
            SnapshotSetState::Ready { names: ready }
        } else {
            pending.sort();
            SnapshotSetState::Pending { names: pending }
        }
    }
}
