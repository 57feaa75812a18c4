//! Replication of artifacts to other nodes of the cluster.
//!
//! Every [TargetNode] is handled on its own: a failed copy or remote prune
//! on one node never prevents or rolls back the work on the others.

mod rsync;

use std::fmt;
use std::path::{Path, PathBuf};

use derive_more::{Display, Error};

pub use rsync::Rsync;

use crate::util::process::CommandError;
use crate::util::retention::PruneRequest;

/// Remote node receiving copies of the artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetNode {
    pub user: String,
    pub host: String,
    /// Directory on the node the artifacts are copied into.
    pub directory: PathBuf,
}

impl TargetNode {
    /// Parses `[user@]host[:/directory]`, filling in the defaults for missing parts.
    pub fn parse(spec: &str, default_user: &str, default_directory: &Path) -> Option<Self> {
        let spec = spec.trim();
        let (user, rest) = match spec.split_once('@') {
            Some((user, rest)) => (user, rest),
            None => (default_user, spec),
        };
        let (host, directory) = match rest.split_once(':') {
            Some((host, directory)) => (host, PathBuf::from(directory)),
            None => (rest, default_directory.to_path_buf()),
        };

        if user.is_empty() || host.is_empty() || directory.as_os_str().is_empty() {
            return None;
        }

        Some(Self {
            user: user.to_string(),
            host: host.to_string(),
            directory,
        })
    }

    /// `user@host`, as understood by ssh.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for TargetNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host)
    }
}

/// What to copy to the targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// The whole content of a directory.
    Directory(PathBuf),
    /// Individual files.
    Files(Vec<PathBuf>),
}

/// Errors on replicating to a single [TargetNode].
#[derive(Debug, Display, Error)]
pub enum ReplicationError {
    #[display("Copy to {_0} failed: {_1}")]
    Copy(String, #[error(source)] CommandError),
    #[display("Cleanup on {_0} failed: {_1}")]
    Prune(String, #[error(source)] CommandError),
}

/// Summary returned by a remote prune.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PruneSummary {
    pub kept: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl From<&crate::util::retention::PruneReport> for PruneSummary {
    fn from(report: &crate::util::retention::PruneReport) -> Self {
        Self {
            kept: report.kept.len(),
            deleted: report.deleted.len(),
            failed: report.failed.len(),
        }
    }
}

/// Mechanism moving artifacts to a node and running commands there.
pub trait Transport {
    /// Copies `source` into the directory of `target`.
    fn copy(&self, source: &Source, target: &TargetNode, dry_run: bool) -> Result<(), CommandError>;

    /// Has `target` apply `request` to its own directory.
    fn prune(&self, target: &TargetNode, request: &PruneRequest) -> Result<PruneSummary, CommandError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn copy(&self, source: &Source, target: &TargetNode, dry_run: bool) -> Result<(), CommandError> {
        (**self).copy(source, target, dry_run)
    }

    fn prune(&self, target: &TargetNode, request: &PruneRequest) -> Result<PruneSummary, CommandError> {
        (**self).prune(target, request)
    }
}

/// Outcome of replicating to one target.
#[derive(Debug)]
pub struct TargetOutcome {
    pub target: TargetNode,
    pub result: Result<Option<PruneSummary>, ReplicationError>,
}

impl TargetOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Copies artifacts to every target, then prunes them there.
pub struct Replicator {
    transport: Box<dyn Transport>,
    targets: Vec<TargetNode>,
    dry_run: bool,
}

impl Replicator {
    pub fn new(transport: Box<dyn Transport>, targets: Vec<TargetNode>) -> Self {
        Self {
            transport,
            targets,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Replicates `source` to every target and applies `retention` remotely.
    ///
    /// The directory of `retention` is replaced by the directory of each target.
    /// On a dry run the remote prune is skipped and its summary is [None].
    pub fn replicate(&self, source: &Source, retention: &PruneRequest) -> Vec<TargetOutcome> {
        self.targets
            .iter()
            .map(|target| TargetOutcome {
                target: target.clone(),
                result: self.replicate_to(source, retention, target),
            })
            .collect()
    }

    fn replicate_to(
        &self,
        source: &Source,
        retention: &PruneRequest,
        target: &TargetNode,
    ) -> Result<Option<PruneSummary>, ReplicationError> {
        log::info!(target: "replication", "Copy to {}", target.login());
        self.transport
            .copy(source, target, self.dry_run)
            .map_err(|e| ReplicationError::Copy(target.host.clone(), e))
            .inspect_err(|e| log::error!(target: "replication", "{e}"))?;

        if self.dry_run {
            log::info!(target: "replication", "Would apply {} on {target}", retention.rule);
            return Ok(None);
        }

        let request = PruneRequest {
            directory: target.directory.clone(),
            ..retention.clone()
        };
        let summary = self
            .transport
            .prune(target, &request)
            .map_err(|e| ReplicationError::Prune(target.host.clone(), e))
            .inspect_err(|e| log::error!(target: "replication", "{e}"))?;

        log::info!(
            target: "replication",
            "Cleanup on {target} done: kept {}, deleted {}, failed {}",
            summary.kept,
            summary.deleted,
            summary.failed
        );
        Ok(Some(summary))
    }
}
