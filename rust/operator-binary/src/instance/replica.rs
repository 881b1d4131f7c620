//! Points a standby at the server it replicates from.
//!
//! Standbys of a regular cluster stream from the current primary through the read-write
//! Service of the cluster. In a replica cluster the designated primary is itself a standby
//! and streams from the configured external cluster instead.

use std::{collections::BTreeMap, path::Path};

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::kube::ResourceExt;

use super::{Instance, STANDBY_SIGNAL_FILE, config_file, external};
use crate::{
    crd::{POSTGRES_PORT, STREAMING_REPLICA_USER, v1alpha1},
    store::SecretStore,
};

pub const POSTGRESQL_AUTO_CONF_FILE: &str = "postgresql.auto.conf";
pub const OVERRIDE_CONF_FILE: &str = "override.conf";

pub const CERTIFICATES_DIR: &str = "/stackable/certificates";
const STREAMING_REPLICA_CERT: &str = "streaming_replica.crt";
const STREAMING_REPLICA_KEY: &str = "streaming_replica.key";
const SERVER_CA_CERT: &str = "server-ca.crt";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to determine the role of the instance"))]
    DetermineRole { source: super::Error },

    #[snafu(display("failed to update {file}"))]
    UpdateConfiguration {
        source: config_file::Error,
        file: &'static str,
    },

    #[snafu(display(
        "replica source {source_name:?} of PostgresCluster {cluster} is not an external cluster"
    ))]
    MissingExternalSource { source_name: String, cluster: String },

    #[snafu(display("failed to configure the connection to external cluster {source_name}"))]
    ConfigureExternalConnection {
        source: external::Error,
        source_name: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the cluster definition has to change before a retry can succeed.
    pub fn is_precondition_failure(&self) -> bool {
        matches!(self, Error::MissingExternalSource { .. })
    }
}

/// Connection string of a standby to the primary of its own cluster.
pub fn primary_conninfo(cluster: &v1alpha1::PostgresCluster, pod_name: &str) -> String {
    let certificates = Path::new(CERTIFICATES_DIR);
    let parameters = BTreeMap::from([
        ("host".to_string(), cluster.primary_service_name()),
        ("port".to_string(), POSTGRES_PORT.to_string()),
        ("user".to_string(), STREAMING_REPLICA_USER.to_string()),
        ("application_name".to_string(), pod_name.to_string()),
        ("dbname".to_string(), "postgres".to_string()),
        ("sslmode".to_string(), "verify-ca".to_string()),
        (
            "sslcert".to_string(),
            certificates.join(STREAMING_REPLICA_CERT).display().to_string(),
        ),
        (
            "sslkey".to_string(),
            certificates.join(STREAMING_REPLICA_KEY).display().to_string(),
        ),
        (
            "sslrootcert".to_string(),
            certificates.join(SERVER_CA_CERT).display().to_string(),
        ),
    ]);
    external::build_conninfo(&parameters)
}

/// Writes the standby configuration to `pgdata`: the upstream connection and slot in
/// `override.conf`, and the `standby.signal` file.
pub fn update_replica_configuration(
    pgdata: &Path,
    conninfo: &str,
    slot_name: &str,
) -> Result<bool> {
    let settings = [
        ("primary_conninfo", config_file::quote_value(conninfo)),
        ("primary_slot_name", config_file::quote_value(slot_name)),
        ("recovery_target_timeline", config_file::quote_value("latest")),
    ];
    let config_changed = config_file::update_settings(&pgdata.join(OVERRIDE_CONF_FILE), &settings)
        .context(UpdateConfigurationSnafu {
            file: OVERRIDE_CONF_FILE,
        })?;
    let signal_created = config_file::touch(&pgdata.join(STANDBY_SIGNAL_FILE)).context(
        UpdateConfigurationSnafu {
            file: STANDBY_SIGNAL_FILE,
        },
    )?;
    Ok(config_changed || signal_created)
}

impl Instance {
    /// Brings the replication configuration on disk in line with `cluster`.
    ///
    /// Returns whether anything changed. The primary is left alone and always reports no
    /// change.
    pub async fn refresh_replica_configuration<S>(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        secrets: &S,
    ) -> Result<bool>
    where
        S: SecretStore + ?Sized,
    {
        // archive_mode used to be overridden here for designated primaries
        let archive_mode_removed = config_file::remove_setting(
            &self.pgdata_file(POSTGRESQL_AUTO_CONF_FILE),
            "archive_mode",
        )
        .context(UpdateConfigurationSnafu {
            file: POSTGRESQL_AUTO_CONF_FILE,
        })?;

        if self.is_primary().context(DetermineRoleSnafu)? {
            return Ok(false);
        }

        let conninfo = if cluster.is_replica()
            && cluster.target_primary() == Some(self.pod_name.as_str())
        {
            self.designated_primary_conninfo(cluster, secrets).await?
        } else {
            primary_conninfo(cluster, &self.pod_name)
        };
        let slot_name = cluster.slot_name_for_instance(&self.pod_name);

        let config_changed = update_replica_configuration(&self.pgdata, &conninfo, &slot_name)?;
        Ok(archive_mode_removed || config_changed)
    }

    async fn designated_primary_conninfo<S>(
        &self,
        cluster: &v1alpha1::PostgresCluster,
        secrets: &S,
    ) -> Result<String>
    where
        S: SecretStore + ?Sized,
    {
        let source_name = cluster
            .spec
            .replica
            .as_ref()
            .map(|replica| replica.source.as_str())
            .unwrap_or_default();
        let server = cluster
            .external_cluster(source_name)
            .with_context(|| MissingExternalSourceSnafu {
                source_name,
                cluster: cluster.name_any(),
            })?;

        external::configure_connection_to_server(
            secrets,
            &self.namespace,
            server,
            &self.external_clusters_dir,
        )
        .await
        .context(ConfigureExternalConnectionSnafu { source_name })
    }
}
