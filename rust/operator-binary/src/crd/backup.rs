use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
    versioned::versioned,
};
use strum::Display;

#[versioned(version(name = "v1alpha1"))]
pub mod versioned {
    /// A single backup attempt of a `PostgresCluster`, taken by snapshotting every volume of
    /// one of its instances.
    #[versioned(k8s(
        group = "postgres.stackable.tech",
        shortname = "pgbackup",
        status = "BackupStatus",
        namespaced,
        crates(
            kube_core = "stackable_operator::kube::core",
            k8s_openapi = "stackable_operator::k8s_openapi",
            schemars = "stackable_operator::schemars"
        )
    ))]
    #[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct BackupSpec {
        /// Name of the `PostgresCluster` in the same namespace.
        pub cluster: String,

        #[serde(default)]
        pub target: BackupTarget,

        /// Overrides `spec.backup.volumeSnapshot.online` of the cluster.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub online: Option<bool>,
    }
}

/// The instance the snapshots are taken from.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackupTarget {
    Primary,
    /// Use a ready standby if there is one, the primary otherwise.
    #[default]
    PreferStandby,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default)]
    pub phase: BackupPhase,

    /// The instance chosen as backup source. Fixed once the backup is running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,

    /// Names of the `VolumeSnapshot`s making up this backup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot_names: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Display, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum BackupPhase {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupPhase {
    pub fn is_done(self) -> bool {
        matches!(self, BackupPhase::Completed | BackupPhase::Failed)
    }
}

impl v1alpha1::Backup {
    pub fn phase(&self) -> BackupPhase {
        self.status
            .as_ref()
            .map(|status| status.phase)
            .unwrap_or_default()
    }

    pub fn instance_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|status| status.instance_name.as_deref())
    }

    /// Whether the instance stays writable while it is snapshotted.
    pub fn is_online(&self, cluster_default: bool) -> bool {
        self.spec.online.unwrap_or(cluster_default)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_backup_defaults() {
        let backup: v1alpha1::Backup = serde_yaml::from_str(
            r#"
            apiVersion: postgres.stackable.tech/v1alpha1
            kind: Backup
            metadata:
              name: backup-1
              namespace: default
            spec:
              cluster: cluster-example
            "#,
        )
        .expect("illegal test input");

        assert_eq!(backup.spec.target, BackupTarget::PreferStandby);
        assert_eq!(backup.phase(), BackupPhase::Pending);
        assert_eq!(backup.instance_name(), None);
        assert!(!backup.is_online(false));
        assert!(backup.is_online(true));
    }

    #[test]
    fn test_backup_status_round_trips_through_yaml() {
        let backup: v1alpha1::Backup = serde_yaml::from_str(
            r#"
            apiVersion: postgres.stackable.tech/v1alpha1
            kind: Backup
            metadata:
              name: backup-1
            spec:
              cluster: cluster-example
              target: primary
              online: false
            status:
              phase: completed
              instanceName: cluster-example-1
              snapshotNames:
                - cluster-example-1-1700000000
            "#,
        )
        .expect("illegal test input");

        assert_eq!(backup.spec.target, BackupTarget::Primary);
        assert_eq!(backup.phase(), BackupPhase::Completed);
        assert_eq!(backup.instance_name(), Some("cluster-example-1"));
        assert!(!backup.is_online(true));
    }

    #[rstest]
    #[case(BackupPhase::Pending, false)]
    #[case(BackupPhase::Running, false)]
    #[case(BackupPhase::Completed, true)]
    #[case(BackupPhase::Failed, true)]
    fn test_phase_is_done(#[case] phase: BackupPhase, #[case] done: bool) {
        assert_eq!(phase.is_done(), done);
    }
}
