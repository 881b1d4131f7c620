//! Volume snapshot backups of [`PostgresCluster`](crate::crd::v1alpha1::PostgresCluster) instances.

pub mod controller;
pub mod executor;
