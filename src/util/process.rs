//! Invocation of the external tools this crate orchestrates.

use std::ffi::OsStr;
use std::io;
use std::process::{Command, ExitStatus};

use derive_more::{Display, Error};

/// An external command could not be run or exited unsuccessfully.
#[derive(Debug, Display, Error)]
pub enum CommandError {
    /// The process could not be spawned or waited for.
    #[display("Failed to run {program}: {source}")]
    NotRun { program: String, source: io::Error },
    /// The process exited with a non-zero exit code.
    #[display("`{command}` failed ({status}): {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
}

impl CommandError {
    pub(crate) fn not_run(command: &Command, source: io::Error) -> Self {
        Self::NotRun {
            program: command.get_program().to_string_lossy().into_owned(),
            source,
        }
    }

    pub(crate) fn failed(command: &Command, status: ExitStatus, stderr: &[u8]) -> Self {
        Self::Failed {
            command: describe(command),
            status,
            stderr: String::from_utf8_lossy(stderr).trim().to_string(),
        }
    }
}

/// Renders program and arguments of a [Command] for log messages.
///
/// Environment variables are never rendered, which is where credentials go.
pub fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(OsStr::to_string_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the command to completion and returns its trimmed stdout.
///
/// Output on stderr of a successful run is relayed to the log using `target`.
pub fn run(command: &mut Command, target: &str) -> Result<String, CommandError> {
    log::trace!(target: target, "Running: {}", describe(command));

    let output = command
        .output()
        .map_err(|e| CommandError::not_run(command, e))?;
    if !output.status.success() {
        return Err(CommandError::failed(command, output.status, &output.stderr));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        log::warn!(target: target, "{}", stderr.trim_end());
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}
