use std::io::Write;
use std::process::{Command, Stdio};

use crate::util::process::{self, CommandError};
use crate::util::retention::PruneRequest;

use super::{PruneSummary, Source, TargetNode, Transport};

/// Never prompt for passwords, a hanging prompt would stall the whole pass.
const SSH_OPTIONS: [&str; 4] = ["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"];

/// Copies with `rsync` over ssh and prunes by running this tool on the target.
///
/// The remote prune never builds a shell pipeline: the [PruneRequest] is
/// sent as JSON on stdin of `{remote_bin} prune --request -`.
#[derive(Debug, Clone)]
pub struct Rsync {
    remote_bin: String,
}

impl Rsync {
    pub fn new(remote_bin: &str) -> Self {
        Self {
            remote_bin: remote_bin.to_string(),
        }
    }

    fn copy_command(source: &Source, target: &TargetNode, dry_run: bool) -> Command {
        let mut command = Command::new("rsync");
        command
            .arg("-az")
            .arg("-e")
            .arg(format!("ssh {}", SSH_OPTIONS.join(" ")));
        if dry_run {
            command.arg("--dry-run");
        }

        match source {
            // trailing slash: copy the content, not the directory itself
            Source::Directory(dir) => {
                command.arg(format!("{}/", dir.display()));
            }
            Source::Files(files) => {
                command.args(files);
            }
        }
        command.arg(format!("{}:{}/", target.login(), target.directory.display()));

        command
    }

    fn prune_command(&self, target: &TargetNode) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(SSH_OPTIONS)
            .arg(target.login())
            .arg(&self.remote_bin)
            .arg("prune")
            .arg("--request")
            .arg("-");
        command
    }
}

impl Transport for Rsync {
    fn copy(&self, source: &Source, target: &TargetNode, dry_run: bool) -> Result<(), CommandError> {
        let mut command = Self::copy_command(source, target, dry_run);
        process::run(&mut command, "replication").map(|_| ())
    }

    fn prune(&self, target: &TargetNode, request: &PruneRequest) -> Result<PruneSummary, CommandError> {
        let mut command = self.prune_command(target);
        log::trace!(target: "replication", "Running: {}", process::describe(&command));

        let payload = serde_json::to_vec(request).map_err(|e| CommandError::not_run(&command, e.into()))?;
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError::not_run(&command, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .map_err(|e| CommandError::not_run(&command, e))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| CommandError::not_run(&command, e))?;
        if !output.status.success() {
            return Err(CommandError::failed(&command, output.status, &output.stderr));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            log::debug!(target: "replication", "{target}: {}", stderr.trim_end());
        }

        // older remote versions don't print a summary
        Ok(serde_json::from_slice(&output.stdout).unwrap_or_else(|e| {
            log::warn!(target: "replication", "Unreadable prune summary from {target}: {e}");
            PruneSummary::default()
        }))
    }
}
