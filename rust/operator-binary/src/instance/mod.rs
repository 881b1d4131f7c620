//! Operations running inside the instance pods, next to PostgreSQL.

use std::path::PathBuf;

use snafu::{ResultExt, Snafu};

pub mod config_file;
pub mod external;
pub mod replica;

pub const STANDBY_SIGNAL_FILE: &str = "standby.signal";

/// Credentials of external clusters are materialised below this directory.
pub const DEFAULT_EXTERNAL_CLUSTERS_DIR: &str = "/stackable/external";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to check for {}", path.display()))]
    CheckStandbySignal {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// The PostgreSQL instance managed from within its pod.
#[derive(Clone, Debug)]
pub struct Instance {
    pub pgdata: PathBuf,
    pub pod_name: String,
    pub namespace: String,
    pub external_clusters_dir: PathBuf,
}

impl Instance {
    pub fn new(
        pgdata: impl Into<PathBuf>,
        pod_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            pgdata: pgdata.into(),
            pod_name: pod_name.into(),
            namespace: namespace.into(),
            external_clusters_dir: PathBuf::from(DEFAULT_EXTERNAL_CLUSTERS_DIR),
        }
    }

    pub fn with_external_clusters_dir(mut self, directory: impl Into<PathBuf>) -> Self {
        self.external_clusters_dir = directory.into();
        self
    }

    pub fn pgdata_file(&self, name: &str) -> PathBuf {
        self.pgdata.join(name)
    }

    /// An instance is the primary as long as it has no `standby.signal` file.
    pub fn is_primary(&self) -> Result<bool, Error> {
        let path = self.pgdata_file(STANDBY_SIGNAL_FILE);
        let is_standby = path
            .try_exists()
            .context(CheckStandbySignalSnafu { path: &path })?;
        Ok(!is_standby)
    }
}
