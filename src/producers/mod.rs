//! Producers of backup artifacts.
//!
//! Currently the following producers are implemented:
//!
//! - [SnapshotProducer]: Snapshot of a VM taken with `vzdump`.
//! - [DatabaseDumpProducer]: Compressed dump of a MySQL/MariaDB database.
//! - [ArchiveProducer]: `tar` archive of configuration files and folders.
//!
//! Which producer backs a job is decided when the job is built, never by
//! looking at the resource itself.

pub mod archive;
pub mod database;
pub mod snapshot;

use std::io;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error, From};

pub use archive::{ArchiveConfig, ArchiveProducer};
pub use database::{DatabaseConfig, DatabaseCredentials, DatabaseDumpProducer};
pub use snapshot::{SnapshotConfig, SnapshotProducer};

use crate::artifact::{Artifact, Convention, ResourceId, Selector};
use crate::util::process::CommandError;

/// Name and resource label of the gauge pushed for a producer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MetricSpec {
    pub name: String,
    pub label: String,
}

impl MetricSpec {
    pub fn new(name: &str, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Display, Error, From)]
/// Errors on producing backup artifacts.
pub enum ProduceError {
    /// The backup directory can't be created.
    #[display("Unable to create backup directory {}: {_1}", _0.display())]
    CreateDirectory(PathBuf, #[error(source)] io::Error),
    /// The external backup tool failed.
    #[display("{_0}")]
    #[from]
    Command(CommandError),
    /// Reading the backup directory or writing the artifact failed.
    #[display("I/O on {} failed: {_1}", _0.display())]
    Io(PathBuf, #[error(source)] io::Error),
    /// None of the paths to archive exist.
    #[display("None of the configured paths exist, nothing to archive")]
    NothingToArchive,
    /// The backup tool succeeded but left no artifact behind.
    #[display("No artifact for {_0} found after backup")]
    NoArtifact(#[error(ignore)] ResourceId),
}

/// Generic producer of backup artifacts.
pub trait Producer {
    /// What is backed up, used in messages (e.g. `VM`, `DB`).
    fn subject(&self) -> &str;

    /// Kind part of the produced artifact names.
    fn kind(&self) -> &str;

    /// Naming convention of the produced artifacts.
    fn convention(&self) -> Convention;

    /// Directory the artifacts are written to.
    fn directory(&self) -> &Path;

    /// Gauge pushed after every backup, if any.
    fn metric(&self) -> Option<&MetricSpec>;

    /// Backups `resource` and returns the produced artifacts.
    ///
    /// # Dry Run
    ///
    /// On a dry run (`dry_run=true`) no files are altered and no artifacts
    /// are returned. Sanity checks may still be performed.
    fn produce(&self, resource: &ResourceId, dry_run: bool) -> Result<Vec<Artifact>, ProduceError>;

    /// The artifacts retention rules apply to after backing up `resource`.
    fn selector(&self, resource: &ResourceId) -> Selector {
        Selector::resource(self.kind(), resource)
    }
}

impl<P: Producer + ?Sized> Producer for Box<P> {
    fn subject(&self) -> &str {
        (**self).subject()
    }

    fn kind(&self) -> &str {
        (**self).kind()
    }

    fn convention(&self) -> Convention {
        (**self).convention()
    }

    fn directory(&self) -> &Path {
        (**self).directory()
    }

    fn metric(&self) -> Option<&MetricSpec> {
        (**self).metric()
    }

    fn produce(&self, resource: &ResourceId, dry_run: bool) -> Result<Vec<Artifact>, ProduceError> {
        (**self).produce(resource, dry_run)
    }

    fn selector(&self, resource: &ResourceId) -> Selector {
        (**self).selector(resource)
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
/// Tool settings of all available producers.
pub struct ProducersConfig {
    /// Configuration of the [SnapshotProducer].
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Configuration of the [DatabaseDumpProducer].
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Configuration of the [ArchiveProducer].
    #[serde(default)]
    pub archive: ArchiveConfig,
}

pub(crate) fn create_directory(directory: &Path) -> Result<(), ProduceError> {
    if directory.is_relative() {
        log::warn!(target: "producer", "backup directory is relative: {}", directory.display());
    }

    std::fs::create_dir_all(directory)
        .map_err(|e| ProduceError::CreateDirectory(directory.to_path_buf(), e))
}
