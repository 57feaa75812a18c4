//! Implements backups of configuration files using `tar`.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::artifact::{Artifact, ArtifactName, Convention, ResourceId};
use crate::util::process;

use super::{create_directory, MetricSpec, ProduceError, Producer};

const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Settings of the config archive.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArchiveConfig {
    /// Resource id the archive is named after.
    #[serde(default = "default_name")]
    pub name: String,

    /// Kind part of the archive file names.
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Files and folders to archive. Missing ones are skipped.
    #[serde(default = "default_paths")]
    pub paths: Vec<PathBuf>,

    #[serde(default = "default_metric")]
    pub metric: Option<MetricSpec>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            kind: default_kind(),
            paths: default_paths(),
            metric: default_metric(),
        }
    }
}

fn default_name() -> String {
    "virtualizor".to_string()
}

fn default_kind() -> String {
    "conf".to_string()
}

fn default_paths() -> Vec<PathBuf> {
    [
        "/usr/local/virtualizor/universal.php",
        "/usr/local/virtualizor/conf",
        "/var/virtualizor",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

fn default_metric() -> Option<MetricSpec> {
    Some(MetricSpec::new("conf_backup", "conf"))
}

/// Archives the configured paths into `{kind}_{name}_{timestamp}.tar.gz`.
pub struct ArchiveProducer {
    archive_dest: PathBuf,
    config: ArchiveConfig,
}

impl ArchiveProducer {
    pub fn with_config(backup_dir: &Path, config: ArchiveConfig) -> Self {
        Self {
            archive_dest: backup_dir.to_path_buf(),
            config,
        }
    }

    /// Resource id of the archive.
    pub fn resource(&self) -> ResourceId {
        ResourceId::new(&self.config.name)
    }

    fn existing_paths(&self) -> Vec<&Path> {
        self.config
            .paths
            .iter()
            .map(PathBuf::as_path)
            .filter(|path| {
                let exists = path.exists();
                if !exists {
                    log::debug!(target: "producer::archive", "Skipping missing {}", path.display());
                }
                exists
            })
            .collect()
    }
}

impl Producer for ArchiveProducer {
    fn subject(&self) -> &str {
        "config"
    }

    fn kind(&self) -> &str {
        &self.config.kind
    }

    fn convention(&self) -> Convention {
        Convention::Timestamped
    }

    fn directory(&self) -> &Path {
        &self.archive_dest
    }

    fn metric(&self) -> Option<&MetricSpec> {
        self.config.metric.as_ref()
    }

    fn produce(&self, resource: &ResourceId, dry_run: bool) -> Result<Vec<Artifact>, ProduceError> {
        log::info!(target: "producer::archive", "Create archive of {resource} config");

        let paths = self.existing_paths();
        if paths.is_empty() {
            return Err(ProduceError::NothingToArchive);
        }

        let name = ArtifactName::now(&self.config.kind, resource, ARCHIVE_EXTENSION);
        let archive = self
            .archive_dest
            .join(Convention::Timestamped.file_name(&name));

        let mut command = Command::new("tar");
        command.arg("-czf").arg(&archive).args(&paths);

        if dry_run {
            log::info!(target: "producer::archive", "Would run: {}", process::describe(&command));
            return Ok(Vec::new());
        }

        create_directory(&self.archive_dest)?;
        if let Err(e) = process::run(&mut command, "producer::archive") {
            if archive.exists() {
                if let Err(rm) = std::fs::remove_file(&archive) {
                    log::warn!(target: "producer::archive", "Removing partial archive {} failed: {rm}", archive.display());
                }
            }
            return Err(e.into());
        }

        log::info!(target: "producer::archive", "Finished archive {}", archive.display());
        Ok(vec![Artifact {
            path: archive,
            name,
        }])
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn config(paths: Vec<PathBuf>) -> ArchiveConfig {
        ArchiveConfig {
            paths,
            ..Default::default()
        }
    }

    #[test]
    fn archives_existing_paths_only() {
        let source = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let conf = source.path().join("universal.php");
        std::fs::write(&conf, "<?php $globals = [];").unwrap();

        let producer = ArchiveProducer::with_config(
            backups.path(),
            config(vec![conf, source.path().join("missing")]),
        );
        let artifacts = producer.produce(&producer.resource(), false).unwrap();

        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].name.kind, "conf");
        assert_eq!(artifacts[0].name.resource, "virtualizor".into());
        assert!(std::fs::metadata(&artifacts[0].path).unwrap().len() > 0);
    }

    #[test]
    fn fails_without_any_existing_path() {
        let source = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();

        let producer = ArchiveProducer::with_config(
            backups.path(),
            config(vec![source.path().join("missing")]),
        );
        let err = producer.produce(&producer.resource(), false).unwrap_err();

        assert!(matches!(err, ProduceError::NothingToArchive));
        assert_eq!(std::fs::read_dir(backups.path()).unwrap().count(), 0);
    }
}
