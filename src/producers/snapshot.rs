//! Implements snapshot backups of VMs using [`vzdump`].
//!
//! [`vzdump`]: https://pve.proxmox.com/pve-docs/vzdump.1.html

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::artifact::{Artifact, Convention, ResourceId};
use crate::util::process;

use super::{create_directory, MetricSpec, ProduceError, Producer};

/// Settings of the snapshot tool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotConfig {
    /// Snapshot tool to invoke.
    #[serde(default = "default_tool")]
    pub tool: String,

    /// Guest type encoded into the artifact names (`qemu` or `lxc`).
    #[serde(default = "default_kind")]
    pub kind: String,

    /// Backup mode passed as `--mode`.
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Compression passed as `--compress`.
    #[serde(default = "default_compress")]
    pub compress: String,

    #[serde(default = "default_metric")]
    pub metric: MetricSpec,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            tool: default_tool(),
            kind: default_kind(),
            mode: default_mode(),
            compress: default_compress(),
            metric: default_metric(),
        }
    }
}

fn default_tool() -> String {
    "vzdump".to_string()
}

fn default_kind() -> String {
    "qemu".to_string()
}

fn default_mode() -> String {
    "snapshot".to_string()
}

fn default_compress() -> String {
    "lzo".to_string()
}

fn default_metric() -> MetricSpec {
    MetricSpec::new("vm_backup", "vm")
}

/// Backups a VM into the dump directory with the snapshot tool.
///
/// The tool chooses the artifact names itself. They follow
/// [`Convention::Vzdump`], so the produced files are found by comparing the
/// directory before and after the run.
pub struct SnapshotProducer {
    dump_dir: PathBuf,
    config: SnapshotConfig,
}

impl SnapshotProducer {
    pub fn with_config(dump_dir: &Path, config: SnapshotConfig) -> Self {
        Self {
            dump_dir: dump_dir.to_path_buf(),
            config,
        }
    }

    fn artifacts_of(&self, resource: &ResourceId) -> Result<BTreeSet<PathBuf>, ProduceError> {
        let entries = std::fs::read_dir(&self.dump_dir)
            .map_err(|e| ProduceError::Io(self.dump_dir.clone(), e))?;

        let artifacts = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                Artifact::from_path(path, Convention::Vzdump).is_some_and(|artifact| {
                    artifact.name.kind == self.config.kind && artifact.name.resource == *resource
                })
            })
            .collect();

        Ok(artifacts)
    }

    fn command(&self, resource: &ResourceId) -> Command {
        let mut command = Command::new(&self.config.tool);
        command
            .arg(resource.as_str())
            .arg("--dumpdir")
            .arg(&self.dump_dir)
            .arg("--mode")
            .arg(&self.config.mode)
            .arg("--compress")
            .arg(&self.config.compress)
            .arg("--remove") // retention is our business
            .arg("0");
        command
    }
}

impl Producer for SnapshotProducer {
    fn subject(&self) -> &str {
        "VM"
    }

    fn kind(&self) -> &str {
        &self.config.kind
    }

    fn convention(&self) -> Convention {
        Convention::Vzdump
    }

    fn directory(&self) -> &Path {
        &self.dump_dir
    }

    fn metric(&self) -> Option<&MetricSpec> {
        Some(&self.config.metric)
    }

    fn produce(&self, resource: &ResourceId, dry_run: bool) -> Result<Vec<Artifact>, ProduceError> {
        log::info!(target: "producer::snapshot", "Backup VM {resource}");

        let mut command = self.command(resource);
        if dry_run {
            log::info!(target: "producer::snapshot", "Would run: {}", process::describe(&command));
            return Ok(Vec::new());
        }

        create_directory(&self.dump_dir)?;
        let before = self.artifacts_of(resource)?;

        let stdout = process::run(&mut command, "producer::snapshot")?;
        for line in stdout.lines() {
            log::debug!(target: "producer::snapshot", "{line}");
        }

        let produced: Vec<Artifact> = self
            .artifacts_of(resource)?
            .difference(&before)
            .filter_map(|path| Artifact::from_path(path, Convention::Vzdump))
            .collect();
        if produced.is_empty() {
            return Err(ProduceError::NoArtifact(resource.clone()));
        }

        for artifact in &produced {
            log::debug!(target: "producer::snapshot", "Produced {}", artifact.path.display());
        }
        log::info!(target: "producer::snapshot", "Finished backup of VM {resource}");

        Ok(produced)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::util::testing::fake_tool;

    fn producer(dump_dir: &Path, tool: String) -> SnapshotProducer {
        let config = SnapshotConfig {
            tool,
            ..Default::default()
        };
        SnapshotProducer::with_config(dump_dir, config)
    }

    #[test]
    fn finds_newly_created_artifacts() {
        let tools = tempfile::tempdir().unwrap();
        let dump_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dump_dir.path().join("vzdump-qemu-101-2024_01_01-00_00_00.vma.lzo"),
            b"old",
        )
        .unwrap();

        // $1 = vm id, $3 = dump directory
        let tool = fake_tool(
            tools.path(),
            "vzdump",
            r#"touch "$3/vzdump-qemu-$1-2024_05_01-03_00_00.vma.lzo" "$3/vzdump-qemu-$1-2024_05_01-03_00_00.log""#,
        );
        let artifacts = producer(dump_dir.path(), tool)
            .produce(&"101".into(), false)
            .unwrap();

        let mut names: Vec<_> = artifacts
            .iter()
            .map(|a| a.name.extension.as_str())
            .collect();
        names.sort();
        assert_eq!(names, ["log", "vma.lzo"]);
        assert!(artifacts.iter().all(|a| a.name.timestamp == "2024_05_01-03_00_00"));
    }

    #[test]
    fn reports_tool_failure_with_stderr() {
        let tools = tempfile::tempdir().unwrap();
        let dump_dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(tools.path(), "vzdump", "echo 'unable to find VM 999' >&2; exit 255");

        let err = producer(dump_dir.path(), tool)
            .produce(&"999".into(), false)
            .unwrap_err();
        assert!(err.to_string().contains("unable to find VM 999"), "{err}");
    }

    #[test]
    fn reports_missing_artifacts() {
        let tools = tempfile::tempdir().unwrap();
        let dump_dir = tempfile::tempdir().unwrap();
        let tool = fake_tool(tools.path(), "vzdump", "exit 0");

        let err = producer(dump_dir.path(), tool)
            .produce(&"101".into(), false)
            .unwrap_err();
        assert!(matches!(err, ProduceError::NoArtifact(_)));
    }

    #[test]
    fn dry_run_does_not_invoke_tool() {
        let dump_dir = tempfile::tempdir().unwrap();
        let artifacts = producer(dump_dir.path(), "/nonexistent/vzdump".to_string())
            .produce(&"101".into(), true)
            .unwrap();
        assert!(artifacts.is_empty());
    }
}
