//! Connections to PostgreSQL servers outside of the cluster.

use std::{collections::BTreeMap, path::Path};

use snafu::{ResultExt, Snafu};

use super::config_file;
use crate::{
    crd::{ExternalCluster, SecretKeyReference},
    store::{SecretStore, StoreError},
};

const PGPASS_FILE: &str = "pgpass";
const PRIVATE_FILE_MODE: u32 = 0o600;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to read key {key:?} of Secret {secret}"))]
    ReadSecret {
        source: StoreError,
        secret: String,
        key: String,
    },

    #[snafu(display("failed to write a credential file of external cluster {server}"))]
    WriteCredentials {
        source: config_file::Error,
        server: String,
    },
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// Renders libpq connection parameters as a conninfo string.
///
/// Keys are sorted, every value is single quoted with `'` and `\` escaped.
pub fn build_conninfo(parameters: &BTreeMap<String, String>) -> String {
    parameters
        .iter()
        .map(|(key, value)| {
            let escaped = value.replace('\\', "\\\\").replace('\'', "\\'");
            format!("{key}='{escaped}'")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn pgpass_field(value: Option<&str>) -> String {
    match value {
        Some(value) => value.replace('\\', "\\\\").replace(':', "\\:"),
        None => "*".to_string(),
    }
}

/// A single `.pgpass` line matching the given connection parameters.
pub fn pgpass_entry(parameters: &BTreeMap<String, String>, password: &str) -> String {
    format!(
        "{host}:{port}:{dbname}:{user}:{password}\n",
        host = pgpass_field(parameters.get("host").map(String::as_str)),
        port = pgpass_field(parameters.get("port").map(String::as_str)),
        dbname = pgpass_field(parameters.get("dbname").map(String::as_str)),
        user = pgpass_field(parameters.get("user").map(String::as_str)),
        password = pgpass_field(Some(password)),
    )
}

/// Materialises the credentials of `server` below `directory` and returns the conninfo
/// string connecting to it.
///
/// TLS material ends up in files referenced by `sslcert`, `sslkey` and `sslrootcert`, the
/// password in a password file referenced by `passfile`. All of them are only readable by
/// the owner.
pub async fn configure_connection_to_server<S>(
    secrets: &S,
    namespace: &str,
    server: &ExternalCluster,
    directory: &Path,
) -> Result<String>
where
    S: SecretStore + ?Sized,
{
    let server_directory = directory.join(&server.name);
    let mut parameters = server.connection_parameters.clone();

    for (parameter, reference) in [
        ("sslcert", &server.ssl_cert),
        ("sslkey", &server.ssl_key),
        ("sslrootcert", &server.ssl_root_cert),
    ] {
        if let Some(reference) = reference {
            let value = read_secret(secrets, namespace, reference).await?;
            let path = server_directory.join(format!(
                "{secret}_{key}",
                secret = reference.name,
                key = reference.key
            ));
            write_private(&path, &value, server)?;
            parameters.insert(parameter.to_string(), path.display().to_string());
        }
    }

    if let Some(reference) = &server.password {
        let password = read_secret(secrets, namespace, reference).await?;
        let path = server_directory.join(PGPASS_FILE);
        let entry = pgpass_entry(&parameters, &String::from_utf8_lossy(&password));
        write_private(&path, entry.as_bytes(), server)?;
        parameters.insert("passfile".to_string(), path.display().to_string());
    }

    Ok(build_conninfo(&parameters))
}

async fn read_secret<S>(
    secrets: &S,
    namespace: &str,
    reference: &SecretKeyReference,
) -> Result<Vec<u8>>
where
    S: SecretStore + ?Sized,
{
    secrets
        .get_secret_key(namespace, &reference.name, &reference.key)
        .await
        .context(ReadSecretSnafu {
            secret: &reference.name,
            key: &reference.key,
        })
}

fn write_private(path: &Path, contents: &[u8], server: &ExternalCluster) -> Result<()> {
    let changed = config_file::write_if_changed(path, contents, Some(PRIVATE_FILE_MODE))
        .context(WriteCredentialsSnafu {
            server: &server.name,
        })?;
    if changed {
        tracing::info!(path = %path.display(), "updated credential file");
    }
    Ok(())
}
