//! Suspends and resumes writes to a single instance by editing the fencing annotation of its
//! [`PostgresCluster`](v1alpha1::PostgresCluster).
//!
//! The annotation is shared with anything else fencing instances of the cluster, so every
//! change is a compare-and-swap on the cluster's `resourceVersion`, retried on conflict.

use snafu::{ResultExt, Snafu};
use stackable_operator::{k8s_openapi::api::core::v1::Pod, kube::ResourceExt};

use crate::{
    crd::{
        fenced_instances::{self, FencedInstances},
        v1alpha1,
    },
    store::{ClusterStore, ReplaceOutcome, StoreError},
};

pub const MAX_CONFLICT_RETRIES: usize = 5;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to get PostgresCluster {namespace}/{cluster}"))]
    GetCluster {
        source: StoreError,
        namespace: String,
        cluster: String,
    },

    #[snafu(display("failed to update PostgresCluster {namespace}/{cluster}"))]
    UpdateCluster {
        source: StoreError,
        namespace: String,
        cluster: String,
    },

    #[snafu(display("invalid fencing state of PostgresCluster {cluster}"))]
    FencingAnnotation {
        source: fenced_instances::Error,
        cluster: String,
    },

    #[snafu(display("instance {instance:?} is already fenced"))]
    AlreadyFenced { instance: String },

    #[snafu(display(
        "cannot fence instance {instance:?}, the cluster already has fenced instances {fenced:?}"
    ))]
    ConflictingFenceState {
        instance: String,
        fenced: Vec<String>,
    },

    #[snafu(display(
        "gave up updating PostgresCluster {namespace}/{cluster} after {attempts} conflicting writes"
    ))]
    TooManyConflicts {
        namespace: String,
        cluster: String,
        attempts: usize,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying cannot change the outcome without someone editing the cluster.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(
            self,
            Error::ConflictingFenceState { .. } | Error::FencingAnnotation { .. }
        )
    }
}

/// What fencing `instance` requires, given the currently fenced instances.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FenceDecision {
    /// `instance` already is the only fenced instance.
    Held,
    /// Nothing is fenced, the fence can be requested.
    Request,
    /// Something else is fenced. Only one exclusive fence may exist at a time.
    Conflict { fenced: Vec<String> },
}

pub fn fence_decision(fenced: &FencedInstances, instance: &str) -> FenceDecision {
    if fenced.is_only(instance) {
        FenceDecision::Held
    } else if fenced.is_empty() {
        FenceDecision::Request
    } else {
        FenceDecision::Conflict {
            fenced: fenced.names(),
        }
    }
}

/// Reads the fencing state of a cluster as last observed.
pub fn fenced_instances(cluster: &v1alpha1::PostgresCluster) -> Result<FencedInstances> {
    FencedInstances::from_annotations(cluster.annotations()).context(FencingAnnotationSnafu {
        cluster: cluster.name_any(),
    })
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == "Ready" && condition.status == "True")
        })
}

/// A fenced instance shuts PostgreSQL down, which the readiness probe reports. Until then
/// the instance may still accept writes.
pub fn is_fenced_in_effect(pod: &Pod) -> bool {
    !is_pod_ready(pod)
}

pub struct FencingController<'a, S: ?Sized> {
    store: &'a S,
    max_attempts: usize,
}

impl<'a, S> FencingController<'a, S>
where
    S: ClusterStore + ?Sized,
{
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            max_attempts: MAX_CONFLICT_RETRIES,
        }
    }

    /// Fences `instance` exclusively.
    ///
    /// Fails with [`Error::AlreadyFenced`] if `instance` already is the only fenced instance
    /// and with [`Error::ConflictingFenceState`] if anything else is fenced.
    pub async fn request_fence(
        &self,
        namespace: &str,
        cluster: &str,
        instance: &str,
    ) -> Result<()> {
        self.update_fenced_instances(namespace, cluster, |fenced| {
            match fence_decision(fenced, instance) {
                FenceDecision::Held => AlreadyFencedSnafu { instance }.fail(),
                FenceDecision::Conflict { fenced: names } => ConflictingFenceStateSnafu {
                    instance,
                    fenced: names,
                }
                .fail(),
                FenceDecision::Request => {
                    fenced
                        .add(instance)
                        .context(FencingAnnotationSnafu { cluster })?;
                    Ok(true)
                }
            }
        })
        .await
        .map(|_| ())
    }

    /// Lifts the fence of `instance` and returns whether the annotation changed. Does
    /// nothing if `instance` is not fenced.
    pub async fn request_unfence(
        &self,
        namespace: &str,
        cluster: &str,
        instance: &str,
    ) -> Result<bool> {
        self.update_fenced_instances(namespace, cluster, |fenced| {
            fenced
                .remove(instance)
                .context(FencingAnnotationSnafu { cluster })
        })
        .await
    }

    /// Read-modify-write of the fencing annotation. `mutate` returns whether it changed
    /// anything; unchanged state is not written back.
    async fn update_fenced_instances<F>(
        &self,
        namespace: &str,
        name: &str,
        mutate: F,
    ) -> Result<bool>
    where
        F: Fn(&mut FencedInstances) -> Result<bool> + Send + Sync,
    {
        for attempt in 1..=self.max_attempts {
            let mut cluster = self
                .store
                .get_cluster(namespace, name)
                .await
                .context(GetClusterSnafu {
                    namespace,
                    cluster: name,
                })?;

            let mut fenced = fenced_instances(&cluster)?;
            if !mutate(&mut fenced)? {
                return Ok(false);
            }
            fenced
                .write_to(cluster.annotations_mut())
                .context(FencingAnnotationSnafu { cluster: name })?;

            match self
                .store
                .replace_cluster(&cluster)
                .await
                .context(UpdateClusterSnafu {
                    namespace,
                    cluster: name,
                })? {
                ReplaceOutcome::Updated => return Ok(true),
                ReplaceOutcome::Conflict => {
                    tracing::debug!(
                        cluster.name = name,
                        attempt,
                        "PostgresCluster was modified concurrently, retrying"
                    );
                }
            }
        }

        TooManyConflictsSnafu {
            namespace,
            cluster: name,
            attempts: self.max_attempts,
        }
        .fail()
    }
}
