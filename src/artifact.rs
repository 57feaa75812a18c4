//! Naming of backup artifacts.
//!
//! Two naming conventions are in use on the cluster and both have to be
//! understood by the retention logic:
//!
//! - [`Convention::Vzdump`]: `vzdump-{kind}-{resource}-{YYYY_MM_DD-HH_MM_SS}.{ext}`,
//!   the names chosen by the snapshot tool itself.
//! - [`Convention::Timestamped`]: `{kind}_{resource}_{timestamp}.{ext}`, the names
//!   chosen by this crate for database dumps and config archives.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

/// Format of the timestamps this crate embeds into artifact names.
///
/// Lexicographic order equals chronological order and the result contains
/// no colons, so it is safe in file names and on remote shells.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%SZ";

static VZDUMP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^vzdump-(?P<kind>[a-z]+)-(?P<resource>[0-9A-Za-z]+)-(?P<ts>\d{4}_\d{2}_\d{2}-\d{2}_\d{2}_\d{2})\.(?P<ext>.+)$",
    )
    .expect("vzdump naming regex is valid")
});

static TIMESTAMPED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<kind>[^_]+)_(?P<resource>.+)_(?P<ts>\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}(?:-\d{3})?Z?)\.(?P<ext>.+)$",
    )
    .expect("timestamped naming regex is valid")
});

/// Identifier of a VM or a database.
///
/// Drives the naming of artifacts and the labels of pushed metrics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl FromStr for ResourceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.trim()))
    }
}

/// Naming convention of artifact files.
#[derive(Copy, Clone, Debug, PartialEq, Eq, clap::ValueEnum, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Convention {
    /// `vzdump-{kind}-{resource}-{YYYY_MM_DD-HH_MM_SS}.{ext}`
    Vzdump,
    /// `{kind}_{resource}_{timestamp}.{ext}`
    Timestamped,
}

impl Convention {
    /// Parses a file name according to the convention.
    ///
    /// Returns [None] for files that don't follow it.
    pub fn parse(&self, file_name: &str) -> Option<ArtifactName> {
        let re = match self {
            Self::Vzdump => &*VZDUMP_RE,
            Self::Timestamped => &*TIMESTAMPED_RE,
        };
        let caps = re.captures(file_name)?;

        Some(ArtifactName {
            kind: caps["kind"].to_string(),
            resource: ResourceId::new(&caps["resource"]),
            timestamp: caps["ts"].to_string(),
            extension: caps["ext"].to_string(),
        })
    }

    /// Renders the file name of an artifact.
    pub fn file_name(&self, name: &ArtifactName) -> String {
        let ArtifactName {
            kind,
            resource,
            timestamp,
            extension,
        } = name;

        match self {
            Self::Vzdump => format!("vzdump-{kind}-{resource}-{timestamp}.{extension}"),
            Self::Timestamped => format!("{kind}_{resource}_{timestamp}.{extension}"),
        }
    }
}

/// The parts encoded into the name of an artifact file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub kind: String,
    pub resource: ResourceId,
    pub timestamp: String,
    pub extension: String,
}

/// Artifacts sharing a key are versions of the same backup.
pub type GroupKey = (String, ResourceId, String);

impl ArtifactName {
    /// Creates a name with the current time as timestamp.
    pub fn now(kind: &str, resource: &ResourceId, extension: &str) -> Self {
        Self::at(kind, resource, extension, Utc::now())
    }

    pub fn at(kind: &str, resource: &ResourceId, extension: &str, time: DateTime<Utc>) -> Self {
        Self {
            kind: kind.to_string(),
            resource: resource.clone(),
            timestamp: time.format(TIMESTAMP_FORMAT).to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn group_key(&self) -> GroupKey {
        (
            self.kind.clone(),
            self.resource.clone(),
            self.extension.clone(),
        )
    }
}

/// Restricts the artifacts a retention rule is applied to.
///
/// Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Selector {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub resource: Option<ResourceId>,
}

impl Selector {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn kind(kind: &str) -> Self {
        Self {
            kind: Some(kind.to_string()),
            resource: None,
        }
    }

    pub fn resource(kind: &str, resource: &ResourceId) -> Self {
        Self {
            kind: Some(kind.to_string()),
            resource: Some(resource.clone()),
        }
    }

    pub fn matches(&self, name: &ArtifactName) -> bool {
        self.kind.as_ref().is_none_or(|kind| *kind == name.kind)
            && self
                .resource
                .as_ref()
                .is_none_or(|resource| *resource == name.resource)
    }
}

/// A single backup output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub name: ArtifactName,
}

impl Artifact {
    /// Creates an [Artifact] from an existing file following `convention`.
    pub fn from_path(path: &Path, convention: Convention) -> Option<Self> {
        let file_name = path.file_name()?.to_str()?;
        let name = convention.parse(file_name)?;

        Some(Self {
            path: path.to_path_buf(),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn parses_vzdump_names() {
        let name = Convention::Vzdump
            .parse("vzdump-qemu-101-2024_05_01-03_00_12.vma.lzo")
            .unwrap();
        assert_eq!(name.kind, "qemu");
        assert_eq!(name.resource, ResourceId::from("101"));
        assert_eq!(name.timestamp, "2024_05_01-03_00_12");
        assert_eq!(name.extension, "vma.lzo");

        let log = Convention::Vzdump
            .parse("vzdump-qemu-101-2024_05_01-03_00_12.log")
            .unwrap();
        assert_ne!(name.group_key(), log.group_key());
    }

    #[test]
    fn parses_timestamped_names_with_underscores_in_resource() {
        let name = Convention::Timestamped
            .parse("db_my_app_2024-05-01T03-00-12Z.sql.gz")
            .unwrap();
        assert_eq!(name.kind, "db");
        assert_eq!(name.resource, ResourceId::from("my_app"));
        assert_eq!(name.extension, "sql.gz");

        // names written by the previous deployment carry milliseconds
        let legacy = Convention::Timestamped
            .parse("conf_virtualizor_2024-05-01T03-00-12-345Z.tar.gz")
            .unwrap();
        assert_eq!(legacy.timestamp, "2024-05-01T03-00-12-345Z");
    }

    #[test]
    fn rejects_foreign_files() {
        assert_eq!(Convention::Vzdump.parse("backup.log"), None);
        assert_eq!(Convention::Timestamped.parse("backup-error.log"), None);
        assert_eq!(
            Convention::Timestamped.parse("vzdump-qemu-101-2024_05_01-03_00_12.log"),
            None
        );
    }

    #[test]
    fn timestamps_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 9, 30, 23, 59, 59).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 10, 1, 0, 0, 0).unwrap();
        let id = ResourceId::from("app");

        let a = ArtifactName::at("db", &id, "sql.gz", earlier);
        let b = ArtifactName::at("db", &id, "sql.gz", later);
        assert!(a.timestamp < b.timestamp);

        let file_name = Convention::Timestamped.file_name(&b);
        assert_eq!(file_name, "db_app_2024-10-01T00-00-00Z.sql.gz");
        assert_eq!(Convention::Timestamped.parse(&file_name), Some(b));
    }

    #[test]
    fn selector_matches_unset_fields() {
        let name = Convention::Timestamped
            .parse("db_app_2024-05-01T03-00-12Z.sql.gz")
            .unwrap();

        assert!(Selector::all().matches(&name));
        assert!(Selector::kind("db").matches(&name));
        assert!(!Selector::kind("conf").matches(&name));
        assert!(Selector::resource("db", &"app".into()).matches(&name));
        assert!(!Selector::resource("db", &"other".into()).matches(&name));
    }
}
