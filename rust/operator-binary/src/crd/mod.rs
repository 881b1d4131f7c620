pub mod backup;
pub mod fenced_instances;
pub mod volume_snapshot;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use stackable_operator::{
    k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    kube::{CustomResource, ResourceExt},
    schemars::{self, JsonSchema},
    versioned::versioned,
};
use strum::Display;

pub const CLUSTER_NAME_LABEL: &str = "postgres.stackable.tech/cluster";
pub const INSTANCE_NAME_LABEL: &str = "postgres.stackable.tech/instanceName";
pub const PVC_ROLE_LABEL: &str = "postgres.stackable.tech/pvcRole";
pub const BACKUP_NAME_LABEL: &str = "postgres.stackable.tech/backupName";

pub const CLUSTER_MANIFEST_ANNOTATION: &str = "postgres.stackable.tech/clusterManifest";
pub const PG_CONTROLDATA_ANNOTATION: &str = "postgres.stackable.tech/pgControldata";

pub const PVC_ROLE_PGDATA: &str = "PG_DATA";
pub const PVC_ROLE_PGWAL: &str = "PG_WAL";

pub const DEFAULT_SLOT_PREFIX: &str = "_stackable_";

pub const POSTGRES_PORT: u16 = 5432;
pub const STREAMING_REPLICA_USER: &str = "streaming_replica";

#[versioned(version(name = "v1alpha1"))]
pub mod versioned {
    /// A PostgreSQL cluster stacklet. This resource is managed by the Stackable operator for
    /// PostgreSQL.
    #[versioned(k8s(
        group = "postgres.stackable.tech",
        shortname = "pg",
        status = "PostgresClusterStatus",
        namespaced,
        crates(
            kube_core = "stackable_operator::kube::core",
            k8s_openapi = "stackable_operator::k8s_openapi",
            schemars = "stackable_operator::schemars"
        )
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PostgresClusterSpec {
        /// Number of instances (pods) of this cluster.
        pub instances: u16,

        /// Backup settings shared by every `Backup` targeting this cluster.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub backup: Option<BackupConfiguration>,

        /// Turns this cluster into a replica of one of the `externalClusters`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub replica: Option<ReplicaClusterConfiguration>,

        /// PostgreSQL servers living outside of this cluster, usable as a replication source.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        pub external_clusters: Vec<ExternalCluster>,

        #[serde(default)]
        pub replication_slots: ReplicationSlotsConfiguration,

        /// Labels and annotations copied onto every object created on behalf of this cluster.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub inherited_metadata: Option<InheritedMetadata>,
    }
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// The instance currently acting as primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_primary: Option<String>,

    /// The instance that should become (or stay) primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_primary: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot: Option<VolumeSnapshotConfiguration>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotConfiguration {
    /// `VolumeSnapshotClass` used for every volume unless overridden for WAL volumes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,

    /// `VolumeSnapshotClass` used for the WAL volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wal_class_name: Option<String>,

    /// Labels added to every snapshot. These win over the labels of the volume.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations added to every snapshot. These win over the annotations of the volume.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub snapshot_owner_reference: SnapshotOwnerReference,

    /// Take the snapshot without fencing the instance. Defaults to `false` (cold backup).
    #[serde(default)]
    pub online: bool,
}

/// Which object owns the created `VolumeSnapshot`s.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum SnapshotOwnerReference {
    #[default]
    None,
    Cluster,
    Backup,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaClusterConfiguration {
    #[serde(default)]
    pub enabled: bool,

    /// Name of the entry in `externalClusters` to replicate from.
    pub source: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCluster {
    pub name: String,

    /// libpq connection parameters, e.g. `host`, `user`, `dbname` or `sslmode`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connection_parameters: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretKeyReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<SecretKeyReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<SecretKeyReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_root_cert: Option<SecretKeyReference>,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Name of the `Secret` in the namespace of the cluster.
    pub name: String,
    pub key: String,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSlotsConfiguration {
    #[serde(default)]
    pub high_availability: HighAvailabilitySlotsConfiguration,
}

#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HighAvailabilitySlotsConfiguration {
    /// Prefix of the replication slots created for the instances of this cluster.
    #[serde(default = "default_slot_prefix")]
    pub slot_prefix: String,
}

impl Default for HighAvailabilitySlotsConfiguration {
    fn default() -> Self {
        Self {
            slot_prefix: default_slot_prefix(),
        }
    }
}

fn default_slot_prefix() -> String {
    DEFAULT_SLOT_PREFIX.to_string()
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InheritedMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl v1alpha1::PostgresCluster {
    /// Whether this cluster replicates from an external source.
    pub fn is_replica(&self) -> bool {
        self.spec.replica.as_ref().is_some_and(|replica| replica.enabled)
    }

    pub fn external_cluster(&self, name: &str) -> Option<&ExternalCluster> {
        self.spec
            .external_clusters
            .iter()
            .find(|external| external.name == name)
    }

    pub fn volume_snapshot_config(&self) -> Option<&VolumeSnapshotConfiguration> {
        self.spec
            .backup
            .as_ref()
            .and_then(|backup| backup.volume_snapshot.as_ref())
    }

    pub fn current_primary(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.current_primary.as_deref())
    }

    pub fn target_primary(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.target_primary.as_deref())
    }

    /// Name of the read-write Service, always routing to the current primary.
    pub fn primary_service_name(&self) -> String {
        format!("{cluster_name}-rw", cluster_name = self.name_any())
    }

    /// The replication slot used by `instance_name` on its upstream server.
    ///
    /// Slot names may only contain lower case letters, digits and underscores.
    pub fn slot_name_for_instance(&self, instance_name: &str) -> String {
        let sanitized: String = instance_name
            .chars()
            .map(|c| match c.to_ascii_lowercase() {
                c @ ('a'..='z' | '0'..='9' | '_') => c,
                _ => '_',
            })
            .collect();
        format!(
            "{prefix}{sanitized}",
            prefix = self.spec.replication_slots.high_availability.slot_prefix
        )
    }

    /// Copies the inherited labels and annotations of this cluster onto `meta`.
    pub fn inherit_metadata(&self, meta: &mut ObjectMeta) {
        let Some(inherited) = &self.spec.inherited_metadata else {
            return;
        };
        meta.labels
            .get_or_insert_with(BTreeMap::new)
            .extend(inherited.labels.clone());
        meta.annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(inherited.annotations.clone());
    }
}
