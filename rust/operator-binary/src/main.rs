use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Args, Parser, Subcommand};
use futures::stream::StreamExt;
use stackable_operator::{
    YamlSchema,
    cli::ProductOperatorRun,
    kube::{
        ResourceExt,
        core::DeserializeGuard,
        runtime::{
            Controller,
            events::{Recorder, Reporter},
            reflector::ObjectRef,
            watcher,
        },
    },
    logging::{TracingTarget, controller::report_controller_reconciled},
    shared::yaml::SerializeOptions,
    utils::cluster_info::KubernetesClusterInfoOpts,
};

use crate::{
    backup::controller::{BACKUP_FULL_CONTROLLER_NAME, Ctx},
    crd::{
        BACKUP_NAME_LABEL, PostgresCluster,
        backup::v1alpha1::Backup,
        v1alpha1,
        volume_snapshot::VolumeSnapshot,
    },
    instance::{DEFAULT_EXTERNAL_CLUSTERS_DIR, Instance},
    store::{
        ClusterStore,
        kubernetes::{DEFAULT_INSTANCE_MANAGER_PORT, KubeBackend},
    },
};

mod backup;
mod crd;
mod fencing;
mod instance;
mod snapshot;
mod store;

const OPERATOR_NAME: &str = "postgres.stackable.tech";
const INSTANCE_MANAGER_NAME: &str = "instance-manager.postgres.stackable.tech";

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser)]
#[clap(about, author)]
struct Opts {
    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print CRD objects
    Crd,
    /// Run the operator
    Run(PostgresRun),
    /// Point the local PostgreSQL instance at the server it has to replicate from
    RefreshReplica(RefreshReplicaArgs),
}

#[derive(Args)]
struct PostgresRun {
    /// Seconds between two checks of a backup waiting for its snapshots.
    #[arg(long, env, default_value_t = 10)]
    snapshot_poll_interval_seconds: u64,

    /// Port of the HTTP endpoint the instance manager serves in every instance pod.
    #[arg(long, env, default_value_t = DEFAULT_INSTANCE_MANAGER_PORT)]
    instance_manager_port: u16,

    #[command(flatten)]
    common: ProductOperatorRun,
}

#[derive(Args)]
struct RefreshReplicaArgs {
    /// Data directory of the instance.
    #[arg(long, env = "PGDATA")]
    pgdata: PathBuf,

    #[arg(long, env = "POD_NAME")]
    pod_name: String,

    /// Name of the PostgresCluster the instance belongs to.
    #[arg(long, env = "CLUSTER_NAME")]
    cluster: String,

    #[arg(long, env = "NAMESPACE")]
    namespace: String,

    /// Directory receiving the credentials of external clusters.
    #[arg(long, env, default_value = DEFAULT_EXTERNAL_CLUSTERS_DIR)]
    external_clusters_dir: PathBuf,

    #[command(flatten)]
    cluster_info_opts: KubernetesClusterInfoOpts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Cmd::Crd => {
            PostgresCluster::merged_crd(PostgresCluster::V1Alpha1)?
                .print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?;
            crd::backup::Backup::merged_crd(crd::backup::Backup::V1Alpha1)?
                .print_yaml_schema(built_info::PKG_VERSION, SerializeOptions::default())?;
        }
        Cmd::Run(PostgresRun {
            snapshot_poll_interval_seconds,
            instance_manager_port,
            common:
                ProductOperatorRun {
                    watch_namespace,
                    tracing_target,
                    cluster_info_opts,
                    ..
                },
        }) => {
            stackable_operator::logging::initialize_logging(
                "POSTGRES_OPERATOR_LOG",
                "postgres-operator",
                tracing_target,
            );
            tracing::info!(
                built_info.pkg_version = built_info::PKG_VERSION,
                built_info.git_version = built_info::GIT_VERSION,
                built_info.target = built_info::TARGET,
                built_info.built_time_utc = built_info::BUILT_TIME_UTC,
                built_info.rustc_version = built_info::RUSTC_VERSION,
                "Starting {description}",
                description = built_info::PKG_DESCRIPTION
            );

            let client = stackable_operator::client::initialize_operator(
                Some(OPERATOR_NAME.to_string()),
                &cluster_info_opts,
            )
            .await?;

            let event_recorder = Arc::new(Recorder::new(client.as_kube_client(), Reporter {
                controller: BACKUP_FULL_CONTROLLER_NAME.to_string(),
                instance: None,
            }));
            let backend = KubeBackend::new(
                client.as_kube_client(),
                (*event_recorder).clone(),
                instance_manager_port,
            );

            let backup_controller = Controller::new(
                watch_namespace.get_api::<DeserializeGuard<Backup>>(&client),
                watcher::Config::default(),
            );
            let backup_store = backup_controller.store();

            backup_controller
                .watches(
                    watch_namespace.get_api::<DeserializeGuard<VolumeSnapshot>>(&client),
                    watcher::Config::default().labels(BACKUP_NAME_LABEL),
                    |snapshot| {
                        let namespace = snapshot.namespace();
                        snapshot
                            .labels()
                            .get(BACKUP_NAME_LABEL)
                            .zip(namespace)
                            .map(|(backup, namespace)| {
                                ObjectRef::<DeserializeGuard<Backup>>::new(backup)
                                    .within(&namespace)
                            })
                    },
                )
                .watches(
                    watch_namespace.get_api::<DeserializeGuard<v1alpha1::PostgresCluster>>(&client),
                    watcher::Config::default(),
                    move |cluster| {
                        let cluster_name = cluster.name_any();
                        let namespace = cluster.namespace();
                        backup_store
                            .state()
                            .into_iter()
                            .filter(move |backup| {
                                backup.namespace() == namespace
                                    && backup
                                        .0
                                        .as_ref()
                                        .is_ok_and(|backup| backup.spec.cluster == cluster_name)
                            })
                            .map(|backup| ObjectRef::from_obj(&*backup))
                    },
                )
                .shutdown_on_signal()
                .run(
                    backup::controller::reconcile_backup,
                    backup::controller::error_policy,
                    Arc::new(Ctx {
                        backend,
                        poll_interval: Duration::from_secs(snapshot_poll_interval_seconds),
                    }),
                )
                // We can let the reporting happen in the background
                .for_each_concurrent(
                    16, // concurrency limit
                    move |result| {
                        // The event_recorder needs to be shared across all invocations, so that
                        // events are correctly aggregated
                        let event_recorder = event_recorder.clone();
                        async move {
                            report_controller_reconciled(
                                &event_recorder,
                                BACKUP_FULL_CONTROLLER_NAME,
                                &result,
                            )
                            .await;
                        }
                    },
                )
                .await;
        }
        Cmd::RefreshReplica(RefreshReplicaArgs {
            pgdata,
            pod_name,
            cluster,
            namespace,
            external_clusters_dir,
            cluster_info_opts,
        }) => {
            stackable_operator::logging::initialize_logging(
                "POSTGRES_OPERATOR_LOG",
                "postgres-instance-manager",
                TracingTarget::None,
            );

            let client =
                stackable_operator::client::initialize_operator(None, &cluster_info_opts).await?;
            let recorder = Recorder::new(client.as_kube_client(), Reporter {
                controller: INSTANCE_MANAGER_NAME.to_string(),
                instance: Some(pod_name.clone()),
            });
            let backend = KubeBackend::new(
                client.as_kube_client(),
                recorder,
                DEFAULT_INSTANCE_MANAGER_PORT,
            );

            let postgres_cluster = backend.get_cluster(&namespace, &cluster).await?;
            let instance = Instance::new(pgdata, pod_name, namespace)
                .with_external_clusters_dir(external_clusters_dir);
            match instance
                .refresh_replica_configuration(&postgres_cluster, &backend)
                .await
            {
                Ok(changed) => tracing::info!(changed, "refreshed replica configuration"),
                Err(error) => {
                    if error.is_precondition_failure() {
                        tracing::error!(
                            cluster.name = %cluster,
                            "the PostgresCluster has to be fixed before the replica configuration can be refreshed"
                        );
                    }
                    return Err(error.into());
                }
            }
        }
    }

    Ok(())
}
