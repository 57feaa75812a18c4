//! Retention of backup artifacts.
//!
//! Two mutually exclusive rules are supported, chosen per deployment:
//!
//! - [`RetentionRule::KeepNewest`]: per group of artifacts (kind, resource and
//!   extension) the `keep` most recently modified files survive.
//! - [`RetentionRule::OlderThan`]: every matching file modified longer ago than
//!   `max_age` is deleted, regardless of grouping.
//!
//! Deletion is best-effort: a file that can't be removed is logged and
//! reported but doesn't stop the removal of the remaining files.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use derive_more::{Display, Error};

use crate::artifact::{Artifact, Convention, GroupKey, Selector};
use crate::util::duration::{format_duration, parse_duration, InvalidDuration};

/// Rule deciding which artifacts survive a backup pass.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum RetentionRule {
    /// Keep the `keep` newest artifacts of every group.
    KeepNewest { keep: usize },
    /// Delete artifacts modified longer ago than `max_age`.
    OlderThan { max_age: Duration },
}

impl Default for RetentionRule {
    fn default() -> Self {
        Self::KeepNewest { keep: 1 }
    }
}

impl fmt::Display for RetentionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeepNewest { keep } => write!(f, "newest:{keep}"),
            Self::OlderThan { max_age } => write!(f, "older-than:{}", format_duration(*max_age)),
        }
    }
}

/// Retention rule could not be parsed.
#[derive(Debug, Display, Error)]
pub enum InvalidRetentionRule {
    #[display("Unknown retention mode '{_0}', expected 'newest:<n>' or 'older-than:<duration>'")]
    UnknownMode(#[error(ignore)] String),
    #[display("Number of artifacts to keep must be a positive integer, got '{_0}'")]
    InvalidKeep(#[error(ignore)] String),
    #[display("{_0}")]
    InvalidAge(InvalidDuration),
}

impl FromStr for RetentionRule {
    type Err = InvalidRetentionRule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mode, arg) = s
            .trim()
            .split_once(':')
            .map_or((s.trim(), None), |(mode, arg)| (mode, Some(arg)));

        match mode {
            "newest" => {
                let keep = match arg {
                    None => 1,
                    Some(arg) => arg
                        .trim()
                        .parse()
                        .ok()
                        .filter(|keep| *keep > 0)
                        .ok_or_else(|| InvalidRetentionRule::InvalidKeep(arg.to_string()))?,
                };
                Ok(Self::KeepNewest { keep })
            }
            "older-than" => {
                let max_age = parse_duration(arg.unwrap_or_default())
                    .map_err(InvalidRetentionRule::InvalidAge)?;
                Ok(Self::OlderThan { max_age })
            }
            other => Err(InvalidRetentionRule::UnknownMode(other.to_string())),
        }
    }
}

/// Listing the artifacts of a directory failed.
#[derive(Debug, Display, Error)]
#[display("Listing artifacts in {} failed: {source}", directory.display())]
pub struct PruneError {
    directory: PathBuf,
    source: io::Error,
}

/// Result of applying a [RetentionRule] to a directory.
#[derive(Debug, Default)]
pub struct PruneReport {
    /// Matching artifacts that survived.
    pub kept: Vec<PathBuf>,
    /// Artifacts removed, or that would have been removed on a dry run.
    pub deleted: Vec<PathBuf>,
    /// Artifacts whose removal failed.
    pub failed: Vec<(PathBuf, io::Error)>,
}

impl PruneReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A retention rule bound to a directory and a set of artifacts.
///
/// This is also the structured command sent to replica nodes so they prune
/// with the same in-process logic instead of a composed shell pipeline.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PruneRequest {
    pub directory: PathBuf,
    pub convention: Convention,
    #[serde(default)]
    pub selector: Selector,
    pub rule: RetentionRule,
}

impl PruneRequest {
    /// Applies the rule, never touching any of the `protected` files.
    pub fn execute(&self, protected: &[PathBuf], dry_run: bool) -> Result<PruneReport, PruneError> {
        match self.rule {
            RetentionRule::KeepNewest { keep } => prune(
                &self.directory,
                self.convention,
                &self.selector,
                keep,
                protected,
                dry_run,
            ),
            RetentionRule::OlderThan { max_age } => prune_older_than(
                &self.directory,
                self.convention,
                &self.selector,
                max_age,
                SystemTime::now(),
                protected,
                dry_run,
            ),
        }
    }
}

struct Candidate {
    artifact: Artifact,
    modified: Option<SystemTime>,
}

fn list(directory: &Path, convention: Convention, selector: &Selector) -> Result<Vec<Candidate>, PruneError> {
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!(target: "retention", "{} doesn't exist, nothing to prune", directory.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(PruneError {
                directory: directory.to_path_buf(),
                source,
            })
        }
    };

    let mut candidates = Vec::new();
    for entry in readable(entries, directory) {
        let Ok(metadata) = entry.metadata() else {
            log::warn!(target: "retention", "Skipping unreadable entry {}", entry.path().display());
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let Some(artifact) = Artifact::from_path(&entry.path(), convention) else {
            continue;
        };
        if !selector.matches(&artifact.name) {
            continue;
        }

        candidates.push(Candidate {
            artifact,
            modified: metadata.modified().ok(),
        });
    }

    Ok(candidates)
}

/// Skips, and logs, the entries of `directory` that can't be read.
fn readable<'a, T: 'a>(
    entries: impl Iterator<Item = io::Result<T>> + 'a,
    directory: &'a Path,
) -> impl Iterator<Item = T> + 'a {
    entries.filter_map(move |entry| {
        entry
            .inspect_err(|e| {
                log::warn!(target: "retention", "Skipping unreadable entry in {}: {e}", directory.display())
            })
            .ok()
    })
}

fn delete(candidates: Vec<PathBuf>, protected: &[PathBuf], dry_run: bool, report: &mut PruneReport) {
    let protected: HashSet<&Path> = protected.iter().map(PathBuf::as_path).collect();

    for path in candidates {
        if protected.contains(path.as_path()) {
            log::debug!(target: "retention", "Keeping just produced {}", path.display());
            report.kept.push(path);
            continue;
        }

        if dry_run {
            log::info!(target: "retention", "Would delete {}", path.display());
            report.deleted.push(path);
            continue;
        }

        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!(target: "retention", "Deleted {}", path.display());
                report.deleted.push(path);
            }
            Err(e) => {
                log::warn!(target: "retention", "Deleting {} failed: {e}", path.display());
                report.failed.push((path, e));
            }
        }
    }
}

/// Keeps the `keep` newest artifacts per group in `directory` and deletes the rest.
///
/// Groups are ordered by modification time. If the modification time of any
/// member is unavailable the group falls back to the timestamp in the file
/// names, which sorts chronologically as well.
pub fn prune(
    directory: &Path,
    convention: Convention,
    selector: &Selector,
    keep: usize,
    protected: &[PathBuf],
    dry_run: bool,
) -> Result<PruneReport, PruneError> {
    let mut groups: BTreeMap<GroupKey, Vec<Candidate>> = BTreeMap::new();
    for candidate in list(directory, convention, selector)? {
        groups
            .entry(candidate.artifact.name.group_key())
            .or_default()
            .push(candidate);
    }

    let mut report = PruneReport::default();
    for ((kind, resource, extension), mut group) in groups {
        if group.iter().all(|c| c.modified.is_some()) {
            group.sort_by(|a, b| {
                (b.modified, &b.artifact.name.timestamp).cmp(&(a.modified, &a.artifact.name.timestamp))
            });
        } else {
            group.sort_by(|a, b| b.artifact.name.timestamp.cmp(&a.artifact.name.timestamp));
        }

        let outdated = group.split_off(keep.min(group.len()));
        log::debug!(
            target: "retention",
            "{kind} {resource} (.{extension}): keeping {}, pruning {}",
            group.len(),
            outdated.len()
        );

        report
            .kept
            .extend(group.into_iter().map(|c| c.artifact.path));
        let outdated = outdated.into_iter().map(|c| c.artifact.path).collect();
        delete(outdated, protected, dry_run, &mut report);
    }

    Ok(report)
}

/// Deletes every matching artifact in `directory` modified more than `max_age` before `now`.
///
/// Files without a readable modification time are kept.
pub fn prune_older_than(
    directory: &Path,
    convention: Convention,
    selector: &Selector,
    max_age: Duration,
    now: SystemTime,
    protected: &[PathBuf],
    dry_run: bool,
) -> Result<PruneReport, PruneError> {
    let mut report = PruneReport::default();
    let mut outdated = Vec::new();

    for candidate in list(directory, convention, selector)? {
        let age = candidate
            .modified
            .and_then(|modified| now.duration_since(modified).ok());

        match age {
            Some(age) if age > max_age => outdated.push(candidate.artifact.path),
            _ => report.kept.push(candidate.artifact.path),
        }
    }

    outdated.sort();
    delete(outdated, protected, dry_run, &mut report);

    Ok(report)
}
