//! Fake external tools for unit tests.

use std::path::Path;
use std::process::Command;

/// Installs a shell script named `name` into `dir` and returns its path.
///
/// The script is copied into place by `cp` so this process never holds a
/// writable descriptor of the executable, which would make concurrently
/// forked test threads fail its exec with `ETXTBSY`.
pub(crate) fn fake_tool(dir: &Path, name: &str, script: &str) -> String {
    let source = dir.join(format!("{name}.src"));
    let target = dir.join(name);
    std::fs::write(&source, format!("#!/bin/sh\n{script}\n")).unwrap();

    let status = Command::new("cp").arg(&source).arg(&target).status().unwrap();
    assert!(status.success(), "installing fake {name} failed");
    let status = Command::new("chmod").arg("755").arg(&target).status().unwrap();
    assert!(status.success(), "making fake {name} executable failed");

    target.to_string_lossy().into_owned()
}
