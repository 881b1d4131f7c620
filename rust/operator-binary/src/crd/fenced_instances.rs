//! Codec for the fencing annotation of a [`PostgresCluster`](super::v1alpha1::PostgresCluster).
//!
//! The annotation holds a JSON array of instance names whose writes are suspended. The
//! single entry `"*"` fences every instance of the cluster.

use std::collections::{BTreeMap, BTreeSet};

use snafu::{ResultExt, Snafu};

pub const FENCED_INSTANCES_ANNOTATION: &str = "postgres.stackable.tech/fencedInstances";
pub const FENCE_ALL_INSTANCES: &str = "*";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to parse the {FENCED_INSTANCES_ANNOTATION} annotation {value:?}"))]
    ParseAnnotation {
        source: serde_json::Error,
        value: String,
    },

    #[snafu(display("failed to serialize the {FENCED_INSTANCES_ANNOTATION} annotation"))]
    SerializeAnnotation { source: serde_json::Error },

    #[snafu(display("instance {instance:?} is already fenced"))]
    AlreadyFenced { instance: String },

    #[snafu(display(
        "cannot unfence instance {instance:?} while every instance of the cluster is fenced"
    ))]
    SingleInstanceUnfencing { instance: String },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FencedInstances(BTreeSet<String>);

impl FencedInstances {
    /// Reads the fenced instances out of an object's annotations. A missing annotation means
    /// nothing is fenced.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Self> {
        match annotations.get(FENCED_INSTANCES_ANNOTATION) {
            None => Ok(Self::default()),
            Some(value) => serde_json::from_str::<BTreeSet<String>>(value)
                .map(Self)
                .context(ParseAnnotationSnafu { value }),
        }
    }

    /// Writes the fenced instances back, dropping the annotation once nothing is fenced.
    pub fn write_to(&self, annotations: &mut BTreeMap<String, String>) -> Result<()> {
        if self.0.is_empty() {
            annotations.remove(FENCED_INSTANCES_ANNOTATION);
        } else {
            let value = serde_json::to_string(&self.0).context(SerializeAnnotationSnafu)?;
            annotations.insert(FENCED_INSTANCES_ANNOTATION.to_string(), value);
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `instance` is fenced, either by name or by the wildcard.
    pub fn is_fenced(&self, instance: &str) -> bool {
        self.0.contains(FENCE_ALL_INSTANCES) || self.0.contains(instance)
    }

    /// Whether `instance` is the one and only fenced entry.
    pub fn is_only(&self, instance: &str) -> bool {
        self.0.len() == 1 && self.0.contains(instance)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    pub fn add(&mut self, instance: &str) -> Result<()> {
        if self.is_fenced(instance) {
            return AlreadyFencedSnafu { instance }.fail();
        }
        self.0.insert(instance.to_string());
        Ok(())
    }

    /// Lifts the fence of `instance`, returning whether anything changed.
    ///
    /// Passing the wildcard lifts every fence.
    pub fn remove(&mut self, instance: &str) -> Result<bool> {
        if self.0.is_empty() {
            return Ok(false);
        }
        if instance == FENCE_ALL_INSTANCES {
            self.0.clear();
            return Ok(true);
        }
        if self.0.contains(FENCE_ALL_INSTANCES) {
            return SingleInstanceUnfencingSnafu { instance }.fail();
        }
        Ok(self.0.remove(instance))
    }
}
