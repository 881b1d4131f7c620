//! Creates and finds the `VolumeSnapshot`s making up a [`Backup`].

use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod},
    kube::ResourceExt,
};

use crate::{
    crd::{
        BACKUP_NAME_LABEL, CLUSTER_MANIFEST_ANNOTATION, PG_CONTROLDATA_ANNOTATION,
        PVC_ROLE_LABEL, PVC_ROLE_PGWAL, SnapshotOwnerReference, VolumeSnapshotConfiguration,
        backup::v1alpha1::Backup,
        v1alpha1,
        volume_snapshot::{VolumeSnapshot, VolumeSnapshotSource, VolumeSnapshotSpec},
    },
    store::{BackupEvent, ControlDataProbe, EventSink, SnapshotStore, StoreError},
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,

    #[snafu(display("PostgresCluster {cluster} has no volume snapshot configuration"))]
    MissingVolumeSnapshotConfiguration { cluster: String },

    #[snafu(display("object is missing metadata to build owner reference"))]
    ObjectMissingMetadataForOwnerRef {
        source: stackable_operator::builder::meta::Error,
    },

    #[snafu(display("failed to serialize PostgresCluster {cluster}"))]
    SerializeCluster {
        source: serde_json::Error,
        cluster: String,
    },

    #[snafu(display("failed to create VolumeSnapshot {name}"))]
    CreateSnapshot { source: StoreError, name: String },

    #[snafu(display("failed to list VolumeSnapshots of Backup {backup}"))]
    ListSnapshots { source: StoreError, backup: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub fn snapshot_name(volume_name: &str, suffix: &str) -> String {
    format!("{volume_name}-{suffix}")
}

/// Seconds since the epoch, shared by all snapshots of one set.
pub fn snapshot_suffix() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
        .to_string()
}

/// WAL volumes use the WAL snapshot class if one is configured, everything else the default
/// class. `None` leaves the choice to the cluster's default `VolumeSnapshotClass`.
pub fn snapshot_class_name(
    config: &VolumeSnapshotConfiguration,
    pvc: &PersistentVolumeClaim,
) -> Option<String> {
    let is_wal = pvc.labels().get(PVC_ROLE_LABEL).map(String::as_str) == Some(PVC_ROLE_PGWAL);
    match &config.wal_class_name {
        Some(wal_class_name) if is_wal => Some(wal_class_name.clone()),
        _ => config.class_name.clone(),
    }
}

/// Builds the snapshot of one volume.
///
/// Labels and annotations are taken from the volume, overridden by the configured ones.
pub fn build_snapshot(
    cluster: &v1alpha1::PostgresCluster,
    backup: &Backup,
    pvc: &PersistentVolumeClaim,
    suffix: &str,
    control_data: Option<&str>,
) -> Result<VolumeSnapshot> {
    let config = cluster.volume_snapshot_config().with_context(|| {
        MissingVolumeSnapshotConfigurationSnafu {
            cluster: cluster.name_any(),
        }
    })?;
    let namespace = pvc.namespace().context(ObjectHasNoNamespaceSnafu)?;
    let pvc_name = pvc.name_any();

    let mut metadata_builder = ObjectMetaBuilder::new();
    metadata_builder
        .name(snapshot_name(&pvc_name, suffix))
        .namespace(namespace);
    match config.snapshot_owner_reference {
        SnapshotOwnerReference::Cluster => {
            metadata_builder
                .ownerreference_from_resource(cluster, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?;
        }
        SnapshotOwnerReference::Backup => {
            metadata_builder
                .ownerreference_from_resource(backup, None, Some(true))
                .context(ObjectMissingMetadataForOwnerRefSnafu)?;
        }
        SnapshotOwnerReference::None => {}
    }
    let mut metadata = metadata_builder.build();

    let mut labels = pvc.labels().clone();
    labels.extend(config.labels.clone());
    let mut annotations = pvc.annotations().clone();
    annotations.extend(config.annotations.clone());
    metadata.labels = Some(labels);
    metadata.annotations = Some(annotations);

    if config.snapshot_owner_reference == SnapshotOwnerReference::Cluster {
        cluster.inherit_metadata(&mut metadata);
    }

    let labels = metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(BACKUP_NAME_LABEL.to_string(), backup.name_any());

    let annotations = metadata.annotations.get_or_insert_with(BTreeMap::new);
    if let Some(control_data) = control_data {
        annotations.insert(
            PG_CONTROLDATA_ANNOTATION.to_string(),
            control_data.to_string(),
        );
    }
    let manifest = serde_json::to_string(cluster).with_context(|_| SerializeClusterSnafu {
        cluster: cluster.name_any(),
    })?;
    annotations.insert(CLUSTER_MANIFEST_ANNOTATION.to_string(), manifest);

    Ok(VolumeSnapshot {
        metadata,
        spec: VolumeSnapshotSpec {
            source: VolumeSnapshotSource {
                persistent_volume_claim_name: Some(pvc_name),
                volume_snapshot_content_name: None,
            },
            volume_snapshot_class_name: snapshot_class_name(config, pvc),
        },
        status: None,
    })
}

pub struct SnapshotGateway<'a, B: ?Sized> {
    backend: &'a B,
}

impl<'a, B> SnapshotGateway<'a, B>
where
    B: SnapshotStore + ControlDataProbe + EventSink + ?Sized,
{
    pub fn new(backend: &'a B) -> Self {
        Self { backend }
    }

    /// Creates one snapshot per volume and returns their names.
    ///
    /// The snapshots are only requested here, the snapshot controller takes them
    /// asynchronously.
    pub async fn create_snapshot_set(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        backup: &Backup,
        target_pod: &Pod,
        volumes: &[PersistentVolumeClaim],
        suffix: &str,
    ) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(volumes.len());
        for pvc in volumes {
            self.backend
                .publish(
                    backup,
                    BackupEvent::normal(
                        "CreateSnapshot",
                        format!("Creating VolumeSnapshot for PVC {}", pvc.name_any()),
                    ),
                )
                .await;

            // pg_controldata is taken right before the snapshot it describes
            let control_data = match self.backend.control_data(target_pod).await {
                Ok(control_data) => Some(control_data),
                Err(error) => {
                    tracing::error!(
                        pod.name = %target_pod.name_any(),
                        error = &error as &dyn std::error::Error,
                        "failed to query pg_controldata, continuing without it"
                    );
                    None
                }
            };

            let snapshot = build_snapshot(cluster, backup, pvc, suffix, control_data.as_deref())?;
            let name = snapshot.name_any();
            self.backend
                .create_snapshot(&snapshot)
                .await
                .with_context(|_| CreateSnapshotSnafu { name: name.clone() })?;
            tracing::info!(volume_snapshot.name = %name, "requested VolumeSnapshot");
            names.push(name);
        }
        Ok(names)
    }

    /// The snapshots already requested for `backup`, possibly none.
    pub async fn list_snapshots_for_backup(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        backup: &Backup,
    ) -> Result<Vec<VolumeSnapshot>> {
        let namespace = cluster.namespace().context(ObjectHasNoNamespaceSnafu)?;
        let labels = BTreeMap::from([(BACKUP_NAME_LABEL.to_string(), backup.name_any())]);
        self.backend
            .list_snapshots(&namespace, &labels)
            .await
            .with_context(|_| ListSnapshotsSnafu {
                backup: backup.name_any(),
            })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use stackable_operator::kube::Resource;

    use super::*;
    use crate::{
        crd::{INSTANCE_NAME_LABEL, PVC_ROLE_PGDATA},
        store::fake::{self, FakeBackend, NAMESPACE},
    };

    const SUFFIX: &str = "1700000000";

    fn snapshot_config(
        cluster: &mut v1alpha1::PostgresCluster,
    ) -> &mut VolumeSnapshotConfiguration {
        cluster
            .spec
            .backup
            .as_mut()
            .and_then(|backup| backup.volume_snapshot.as_mut())
            .unwrap()
    }

    #[rstest]
    #[case::data_default(PVC_ROLE_PGDATA, Some("data"), Some("wal"), Some("data"))]
    #[case::wal_override(PVC_ROLE_PGWAL, Some("data"), Some("wal"), Some("wal"))]
    #[case::wal_fallback(PVC_ROLE_PGWAL, Some("data"), None, Some("data"))]
    #[case::nothing_configured(PVC_ROLE_PGDATA, None, Some("wal"), None)]
    fn test_snapshot_class_name(
        #[case] role: &str,
        #[case] class_name: Option<&str>,
        #[case] wal_class_name: Option<&str>,
        #[case] expected: Option<&str>,
    ) {
        let config = VolumeSnapshotConfiguration {
            class_name: class_name.map(str::to_string),
            wal_class_name: wal_class_name.map(str::to_string),
            ..VolumeSnapshotConfiguration::default()
        };
        let pvc = fake::volume("pg-1-wal", "pg-1", role);

        assert_eq!(
            snapshot_class_name(&config, &pvc).as_deref(),
            expected
        );
    }

    #[test]
    fn test_build_snapshot_merges_metadata() {
        let mut cluster = fake::cluster("pg");
        let config = snapshot_config(&mut cluster);
        config.labels = BTreeMap::from([
            ("tier".to_string(), "backup".to_string()),
            (PVC_ROLE_LABEL.to_string(), "overridden".to_string()),
        ]);
        config.annotations = BTreeMap::from([("note".to_string(), "nightly".to_string())]);
        let backup = fake::backup("backup-1", "pg");
        let mut pvc = fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA);
        pvc.annotations_mut()
            .insert("note".to_string(), "from pvc".to_string());

        let snapshot =
            build_snapshot(&cluster, &backup, &pvc, SUFFIX, Some("pg_control version")).unwrap();

        assert_eq!(snapshot.name_any(), "pg-1-1700000000");
        assert_eq!(snapshot.namespace().as_deref(), Some(NAMESPACE));
        assert_eq!(
            snapshot.spec.source.persistent_volume_claim_name.as_deref(),
            Some("pg-1")
        );
        assert_eq!(
            snapshot.spec.volume_snapshot_class_name.as_deref(),
            Some("csi-snapclass")
        );
        assert_eq!(
            snapshot.labels(),
            &BTreeMap::from([
                (BACKUP_NAME_LABEL.to_string(), "backup-1".to_string()),
                (INSTANCE_NAME_LABEL.to_string(), "pg-1".to_string()),
                (PVC_ROLE_LABEL.to_string(), "overridden".to_string()),
                ("tier".to_string(), "backup".to_string()),
            ])
        );

        let annotations = snapshot.annotations();
        assert_eq!(annotations["note"], "nightly");
        assert_eq!(annotations[PG_CONTROLDATA_ANNOTATION], "pg_control version");
        let manifest: v1alpha1::PostgresCluster =
            serde_json::from_str(&annotations[CLUSTER_MANIFEST_ANNOTATION]).unwrap();
        assert_eq!(manifest.name_any(), "pg");
        assert!(snapshot.owner_references().is_empty());
    }

    #[test]
    fn test_build_snapshot_without_control_data() {
        let cluster = fake::cluster("pg");
        let backup = fake::backup("backup-1", "pg");
        let pvc = fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA);

        let snapshot = build_snapshot(&cluster, &backup, &pvc, SUFFIX, None).unwrap();

        assert!(!snapshot.annotations().contains_key(PG_CONTROLDATA_ANNOTATION));
        assert!(snapshot.annotations().contains_key(CLUSTER_MANIFEST_ANNOTATION));
    }

    #[rstest]
    #[case::cluster(SnapshotOwnerReference::Cluster, "PostgresCluster", "pg")]
    #[case::backup(SnapshotOwnerReference::Backup, "Backup", "backup-1")]
    fn test_build_snapshot_owner_reference(
        #[case] owner: SnapshotOwnerReference,
        #[case] kind: &str,
        #[case] name: &str,
    ) {
        let mut cluster = fake::cluster("pg");
        snapshot_config(&mut cluster).snapshot_owner_reference = owner;
        let backup = fake::backup("backup-1", "pg");
        let pvc = fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA);

        let snapshot = build_snapshot(&cluster, &backup, &pvc, SUFFIX, None).unwrap();

        let owners = snapshot.owner_references();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, kind);
        assert_eq!(owners[0].name, name);
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn test_build_snapshot_inherits_cluster_metadata_when_owned_by_cluster() {
        let mut cluster = fake::cluster("pg");
        snapshot_config(&mut cluster).snapshot_owner_reference = SnapshotOwnerReference::Cluster;
        cluster.spec.inherited_metadata = Some(crate::crd::InheritedMetadata {
            labels: BTreeMap::from([("team".to_string(), "storage".to_string())]),
            annotations: BTreeMap::new(),
        });
        let backup = fake::backup("backup-1", "pg");
        let pvc = fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA);

        let snapshot = build_snapshot(&cluster, &backup, &pvc, SUFFIX, None).unwrap();

        assert_eq!(snapshot.labels()["team"], "storage");
        assert_eq!(snapshot.meta().owner_references.as_ref().map(Vec::len), Some(1));
    }

    #[test]
    fn test_build_snapshot_requires_configuration() {
        let mut cluster = fake::cluster("pg");
        cluster.spec.backup = None;
        let backup = fake::backup("backup-1", "pg");
        let pvc = fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA);

        let result = build_snapshot(&cluster, &backup, &pvc, SUFFIX, None);

        assert!(matches!(
            result,
            Err(Error::MissingVolumeSnapshotConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_snapshot_set() {
        let backend = FakeBackend::new();
        backend.set_control_data(Some("Database cluster state: shut down"));
        let cluster = fake::cluster("pg");
        let backup = fake::backup("backup-1", "pg");
        let pod = fake::pod("pg-1", "pg", false);
        let volumes = vec![
            fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA),
            fake::volume("pg-1-wal", "pg-1", PVC_ROLE_PGWAL),
        ];
        let gateway = SnapshotGateway::new(&backend);

        let names = gateway
            .create_snapshot_set(&cluster, &backup, &pod, &volumes, SUFFIX)
            .await
            .unwrap();

        assert_eq!(names, vec!["pg-1-1700000000", "pg-1-wal-1700000000"]);
        assert_eq!(backend.snapshot_names(), names);
        assert_eq!(backend.event_reasons(), vec!["CreateSnapshot", "CreateSnapshot"]);
        assert!(backend
            .snapshots()
            .iter()
            .all(|snapshot| snapshot.annotations().contains_key(PG_CONTROLDATA_ANNOTATION)));
    }

    #[tokio::test]
    async fn test_create_snapshot_set_survives_control_data_failure() {
        let backend = FakeBackend::new();
        backend.set_control_data(None);
        let cluster = fake::cluster("pg");
        let backup = fake::backup("backup-1", "pg");
        let pod = fake::pod("pg-1", "pg", false);
        let volumes = vec![fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA)];

        SnapshotGateway::new(&backend)
            .create_snapshot_set(&cluster, &backup, &pod, &volumes, SUFFIX)
            .await
            .unwrap();

        let snapshots = backend.snapshots();
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].annotations().contains_key(PG_CONTROLDATA_ANNOTATION));
    }

    #[tokio::test]
    async fn test_list_snapshots_is_scoped_to_backup() {
        let backend = FakeBackend::new();
        backend.set_control_data(Some("data"));
        let cluster = fake::cluster("pg");
        let pod = fake::pod("pg-1", "pg", false);
        let volumes = vec![fake::volume("pg-1", "pg-1", PVC_ROLE_PGDATA)];
        let gateway = SnapshotGateway::new(&backend);

        let first = fake::backup("backup-1", "pg");
        let second = fake::backup("backup-2", "pg");
        gateway
            .create_snapshot_set(&cluster, &first, &pod, &volumes, "1")
            .await
            .unwrap();
        gateway
            .create_snapshot_set(&cluster, &second, &pod, &volumes, "2")
            .await
            .unwrap();

        let listed = gateway
            .list_snapshots_for_backup(&cluster, &second)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_any(), "pg-1-2");

        let none = gateway
            .list_snapshots_for_backup(&cluster, &fake::backup("backup-3", "pg"))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
