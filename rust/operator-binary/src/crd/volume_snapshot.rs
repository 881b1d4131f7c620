//! The subset of the CSI `VolumeSnapshot` API (`snapshot.storage.k8s.io/v1`) the operator
//! reads and writes. The resource itself is reconciled by the external snapshot controller.

use serde::{Deserialize, Serialize};
use stackable_operator::{
    kube::CustomResource,
    schemars::{self, JsonSchema},
};

#[derive(Clone, CustomResource, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "snapshot.storage.k8s.io",
    version = "v1",
    kind = "VolumeSnapshot",
    status = "VolumeSnapshotStatus",
    namespaced,
    crates(
        kube_core = "stackable_operator::kube::core",
        k8s_openapi = "stackable_operator::k8s_openapi",
        schemars = "stackable_operator::schemars"
    )
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSpec {
    pub source: VolumeSnapshotSource,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_class_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_snapshot_content_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_volume_snapshot_content_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_to_use: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_size: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VolumeSnapshotError>,
}

#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSnapshotError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
}

/// State of a snapshot as reported by the snapshot provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotState {
    /// Still being taken.
    Pending,
    Ready,
    Failed { reason: String },
}

impl VolumeSnapshot {
    /// Interprets the provider reported status.
    ///
    /// A status that cannot be made sense of is reported as failed, so that a stuck resource
    /// is never polled forever.
    pub fn state(&self) -> SnapshotState {
        let Some(status) = &self.status else {
            return SnapshotState::Pending;
        };

        match (&status.error, status.ready_to_use) {
            (Some(_), Some(true)) => SnapshotState::Failed {
                reason: "status reports both readyToUse and an error".to_string(),
            },
            (Some(error), _) => match error.message.as_deref() {
                Some(message) if !message.trim().is_empty() => SnapshotState::Failed {
                    reason: message.to_string(),
                },
                _ => SnapshotState::Failed {
                    reason: "status reports an error without a message".to_string(),
                },
            },
            (None, Some(true)) => SnapshotState::Ready,
            (None, _) => SnapshotState::Pending,
        }
    }
}
