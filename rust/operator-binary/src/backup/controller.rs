//! Reconciles [`Backup`] objects.
//!
//! The controller picks the instance to back up, records it in the status and hands over to
//! the [`SnapshotBackupExecutor`] until the snapshots are ready or the backup has failed.

use std::{sync::Arc, time::Duration};

use const_format::concatcp;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Pod,
    kube::{
        ResourceExt,
        core::{DeserializeGuard, error_boundary},
        runtime::controller::Action,
    },
    logging::controller::ReconcilerError,
};
use strum::{EnumDiscriminants, IntoStaticStr};

use super::executor::{self, ExecutorConfig, Outcome, SnapshotBackupExecutor};
use crate::{
    OPERATOR_NAME,
    crd::{
        backup::{BackupPhase, BackupStatus, BackupTarget, v1alpha1::Backup},
        v1alpha1,
    },
    fencing::is_pod_ready,
    store::{Backend, BackupStore, StoreError, kubernetes::KubeBackend},
};

pub const BACKUP_CONTROLLER_NAME: &str = "backup";
pub const BACKUP_FULL_CONTROLLER_NAME: &str =
    concatcp!(BACKUP_CONTROLLER_NAME, '.', OPERATOR_NAME);

pub struct Ctx {
    pub backend: KubeBackend,
    /// Delay between two looks at a backup that is still in progress.
    pub poll_interval: Duration,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("Backup object is invalid"))]
    InvalidBackup {
        source: error_boundary::InvalidObject,
    },

    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("failed to get PostgresCluster {cluster}"))]
    GetCluster { source: StoreError, cluster: String },

    #[snafu(display("failed to list the instances of PostgresCluster {cluster}"))]
    ListInstances { source: StoreError, cluster: String },

    #[snafu(display("failed to get pod {pod}"))]
    GetPod { source: StoreError, pod: String },

    #[snafu(display("failed to list the volumes of instance {instance}"))]
    ListVolumes { source: StoreError, instance: String },

    #[snafu(display("failed to update the status of Backup {backup}"))]
    UpdateStatus { source: StoreError, backup: String },

    #[snafu(display("failed to take the backup"))]
    Execute { source: executor::Error },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

pub async fn reconcile_backup(
    backup: Arc<DeserializeGuard<Backup>>,
    ctx: Arc<Ctx>,
) -> Result<Action> {
    tracing::info!("Starting reconcile");
    let backup = backup
        .0
        .as_ref()
        .map_err(error_boundary::InvalidObject::clone)
        .context(InvalidBackupSnafu)?;

    advance_backup(&ctx.backend, backup, ctx.poll_interval).await
}

pub fn error_policy(
    _obj: Arc<DeserializeGuard<Backup>>,
    error: &Error,
    _ctx: Arc<Ctx>,
) -> Action {
    match error {
        Error::InvalidBackup { .. } => Action::await_change(),
        _ => Action::requeue(Duration::from_secs(10)),
    }
}

async fn advance_backup<B>(backend: &B, backup: &Backup, poll_interval: Duration) -> Result<Action>
where
    B: Backend + BackupStore + ?Sized,
{
    if backup.phase().is_done() {
        return Ok(Action::await_change());
    }
    let namespace = backup.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let cluster_name = &backup.spec.cluster;

    let cluster = match backend.get_cluster(&namespace, cluster_name).await {
        Ok(cluster) => cluster,
        Err(StoreError::NotFound { .. }) => {
            return fail_backup(
                backend,
                backup,
                backup.instance_name(),
                format!("PostgresCluster {cluster_name} not found"),
            )
            .await;
        }
        Err(source) => {
            return Err(source).context(GetClusterSnafu {
                cluster: cluster_name,
            });
        }
    };
    let Some(snapshot_config) = cluster.volume_snapshot_config() else {
        let message =
            format!("PostgresCluster {cluster_name} has no volume snapshot configuration");
        return match backup.instance_name() {
            Some(instance) => {
                let cold = !backup.is_online(false);
                fail_backup_of_instance(backend, backup, &namespace, instance, cold, message).await
            }
            None => fail_backup(backend, backup, None, message).await,
        };
    };
    let cold = !backup.is_online(snapshot_config.online);

    let instance = match backup.instance_name() {
        Some(instance) => instance.to_string(),
        None => {
            let pods = backend
                .list_instance_pods(&cluster)
                .await
                .context(ListInstancesSnafu {
                    cluster: cluster_name,
                })?;
            let Some(instance) = select_target_instance(&cluster, backup.spec.target, &pods)
            else {
                return fail_backup(
                    backend,
                    backup,
                    None,
                    format!("PostgresCluster {cluster_name} has no instance to back up"),
                )
                .await;
            };

            tracing::info!(
                backup.name = %backup.name_any(),
                pod.name = %instance,
                "starting backup"
            );
            update_status(
                backend,
                backup,
                BackupStatus {
                    phase: BackupPhase::Running,
                    instance_name: Some(instance.clone()),
                    ..BackupStatus::default()
                },
            )
            .await?;
            instance
        }
    };

    let pod = match backend.get_pod(&namespace, &instance).await {
        Ok(pod) => pod,
        Err(StoreError::NotFound { .. }) => {
            let message = format!("pod {instance} not found");
            return fail_backup_of_instance(backend, backup, &namespace, &instance, cold, message)
                .await;
        }
        Err(source) => return Err(source).context(GetPodSnafu { pod: &instance }),
    };
    let volumes = backend
        .list_instance_volumes(&namespace, &instance)
        .await
        .context(ListVolumesSnafu {
            instance: &instance,
        })?;

    let executor = SnapshotBackupExecutor::new(
        backend,
        ExecutorConfig {
            should_fence: cold,
            requeue_after: poll_interval,
        },
    );
    match executor.execute(&cluster, backup, &pod, &volumes).await {
        Ok(Outcome::RequeueAfter(delay)) => Ok(Action::requeue(delay)),
        Ok(Outcome::Done { snapshot_names }) => {
            tracing::info!(
                backup.name = %backup.name_any(),
                ?snapshot_names,
                "backup completed"
            );
            update_status(
                backend,
                backup,
                BackupStatus {
                    phase: BackupPhase::Completed,
                    instance_name: Some(instance),
                    snapshot_names,
                    error: None,
                },
            )
            .await?;
            Ok(Action::await_change())
        }
        Err(error) if error.is_terminal() => {
            let message = error_message(&error);
            fail_backup_of_instance(backend, backup, &namespace, &instance, cold, message).await
        }
        Err(error) => Err(error).context(ExecuteSnafu),
    }
}

/// The instance a new backup is taken from.
///
/// `prefer-standby` takes the first ready standby by name and falls back to the primary.
pub fn select_target_instance(
    cluster: &v1alpha1::PostgresCluster,
    target: BackupTarget,
    pods: &[Pod],
) -> Option<String> {
    let primary = cluster.current_primary();
    if target == BackupTarget::PreferStandby {
        let mut standbys: Vec<_> = pods
            .iter()
            .filter(|pod| is_pod_ready(pod))
            .map(ResourceExt::name_any)
            .filter(|name| Some(name.as_str()) != primary)
            .collect();
        standbys.sort();
        if let Some(standby) = standbys.into_iter().next() {
            return Some(standby);
        }
    }
    primary.map(str::to_string)
}

async fn update_status<B>(backend: &B, backup: &Backup, status: BackupStatus) -> Result<()>
where
    B: BackupStore + ?Sized,
{
    backend
        .update_backup_status(backup, &status)
        .await
        .context(UpdateStatusSnafu {
            backup: backup.name_any(),
        })
}

/// Fails the backup of `instance`.
///
/// A cold backup that recorded its instance in an earlier reconciliation may hold the fence of
/// that instance. The fence is lifted before the backup is marked failed.
async fn fail_backup_of_instance<B>(
    backend: &B,
    backup: &Backup,
    namespace: &str,
    instance: &str,
    cold: bool,
    message: String,
) -> Result<Action>
where
    B: Backend + BackupStore + ?Sized,
{
    if cold && backup.instance_name() == Some(instance) {
        executor::release_fence(backend, backup, namespace, &backup.spec.cluster, instance).await;
    }
    fail_backup(backend, backup, Some(instance), message).await
}

async fn fail_backup<B>(
    backend: &B,
    backup: &Backup,
    instance: Option<&str>,
    message: String,
) -> Result<Action>
where
    B: BackupStore + ?Sized,
{
    tracing::warn!(backup.name = %backup.name_any(), error = %message, "backup failed");
    update_status(
        backend,
        backup,
        BackupStatus {
            phase: BackupPhase::Failed,
            instance_name: instance.map(str::to_string),
            snapshot_names: Vec::new(),
            error: Some(message),
        },
    )
    .await?;
    Ok(Action::await_change())
}

/// The error followed by all of its causes, on a single line.
fn error_message(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
