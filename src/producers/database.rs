//! Implements compressed dumps of MySQL/MariaDB databases.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::artifact::{Artifact, ArtifactName, Convention, ResourceId};
use crate::util::process::{self, CommandError};

use super::{create_directory, MetricSpec, ProduceError, Producer};

const DUMP_EXTENSION: &str = "sql.gz";

/// Settings of the dump tool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    /// Dump binary, e.g. `mysqldump` or `mariadb-dump`.
    #[serde(default = "default_dump_bin")]
    pub dump_bin: String,

    /// Server socket passed as `--socket`.
    #[serde(default = "default_socket")]
    pub socket: Option<PathBuf>,

    /// Kind part of the dump file names.
    #[serde(default = "default_kind")]
    pub kind: String,

    #[serde(default = "default_metric")]
    pub metric: MetricSpec,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dump_bin: default_dump_bin(),
            socket: default_socket(),
            kind: default_kind(),
            metric: default_metric(),
        }
    }
}

fn default_dump_bin() -> String {
    "mysqldump".to_string()
}

fn default_socket() -> Option<PathBuf> {
    Some(PathBuf::from("/var/run/mysqld/mysqld.sock"))
}

fn default_kind() -> String {
    "db".to_string()
}

fn default_metric() -> MetricSpec {
    MetricSpec::new("db_backup", "db")
}

/// Credentials of the database user performing the dump.
#[derive(Clone, Default)]
pub struct DatabaseCredentials {
    pub user: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for DatabaseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Dumps a database into `{kind}_{database}_{timestamp}.sql.gz`.
pub struct DatabaseDumpProducer {
    db_dump_dest: PathBuf,
    credentials: DatabaseCredentials,
    config: DatabaseConfig,
}

impl DatabaseDumpProducer {
    pub fn with_config(backup_dir: &Path, credentials: DatabaseCredentials, config: DatabaseConfig) -> Self {
        Self {
            db_dump_dest: backup_dir.to_path_buf(),
            credentials,
            config,
        }
    }

    fn command(&self, database: &ResourceId) -> Command {
        let mut command = Command::new(&self.config.dump_bin);
        if let Some(socket) = &self.config.socket {
            command.arg(format!("--socket={}", socket.display()));
        }
        command
            .arg("--single-transaction")
            .arg(format!("--user={}", self.credentials.user))
            .arg(database.as_str());

        // never on the command line, where every user can read it
        if let Some(password) = &self.credentials.password {
            command.env("MYSQL_PWD", password);
        }

        command
    }

    /// Runs the dump tool and compresses its output into `db_dump_file`.
    fn dump(&self, mut command: Command, db_dump_file: File, path: &Path) -> Result<(), ProduceError> {
        let mut dump_process = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CommandError::not_run(&command, e))?;
        log::trace!(target: "producer::database", "Started {} process.", self.config.dump_bin);

        // drain stderr concurrently, a full pipe would block the dump
        let stderr_reader = dump_process.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf);
                buf
            })
        });

        let copied = match dump_process.stdout.take() {
            Some(stdout) => compress(&mut BufReader::new(stdout), db_dump_file, path),
            None => Ok(()),
        };

        if let Err(e) = copied {
            // report the I/O error, not the exit status of the killed dump
            let _ = dump_process.kill();
            let _ = dump_process.wait();
            return Err(e);
        }

        let exit_status = dump_process
            .wait()
            .map_err(|e| CommandError::not_run(&command, e))?;
        let stderr = stderr_reader
            .and_then(|reader| reader.join().ok())
            .unwrap_or_default();

        if !exit_status.success() {
            return Err(CommandError::failed(&command, exit_status, &stderr).into());
        }

        let stderr = String::from_utf8_lossy(&stderr);
        if !stderr.trim().is_empty() {
            log::warn!(target: "producer::database", "{}", stderr.trim_end());
        }

        Ok(())
    }
}

/// Compresses `reader` into `file`, which lives at `path`.
fn compress(reader: &mut impl Read, file: File, path: &Path) -> Result<(), ProduceError> {
    let io_err = |e| ProduceError::Io(path.to_path_buf(), e);
    let mut encoder = GzEncoder::new(file, Compression::default());
    io::copy(reader, &mut encoder).map_err(io_err)?;
    encoder.finish().map_err(io_err)?;

    Ok(())
}

impl Producer for DatabaseDumpProducer {
    fn subject(&self) -> &str {
        "DB"
    }

    fn kind(&self) -> &str {
        &self.config.kind
    }

    fn convention(&self) -> Convention {
        Convention::Timestamped
    }

    fn directory(&self) -> &Path {
        &self.db_dump_dest
    }

    fn metric(&self) -> Option<&MetricSpec> {
        Some(&self.config.metric)
    }

    fn produce(&self, database: &ResourceId, dry_run: bool) -> Result<Vec<Artifact>, ProduceError> {
        log::info!(target: "producer::database", "Create database dump of {database}");
        log::trace!(target: "producer::database", "Using user '{}' for backup", self.credentials.user);

        let command = self.command(database);
        if dry_run {
            log::info!(target: "producer::database", "Would run: {}", process::describe(&command));
            return Ok(Vec::new());
        }

        create_directory(&self.db_dump_dest)?;
        let name = ArtifactName::now(&self.config.kind, database, DUMP_EXTENSION);
        let db_dump_file = self
            .db_dump_dest
            .join(Convention::Timestamped.file_name(&name));
        log::debug!(target: "producer::database", "Save database dump at: {}", db_dump_file.display());

        // an existing file belongs to an earlier dump and is left alone
        let file = File::create_new(&db_dump_file)
            .map_err(|e| ProduceError::Io(db_dump_file.clone(), e))?;

        if let Err(e) = self.dump(command, file, &db_dump_file) {
            if let Err(rm) = std::fs::remove_file(&db_dump_file) {
                log::warn!(target: "producer::database", "Removing partial dump {} failed: {rm}", db_dump_file.display());
            }
            return Err(e);
        }

        log::info!(target: "producer::database", "Finished database dump of {database}");
        Ok(vec![Artifact {
            path: db_dump_file,
            name,
        }])
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::util::testing::fake_tool;

    fn producer(dir: &Path, dump_bin: String, password: Option<&str>) -> DatabaseDumpProducer {
        let credentials = DatabaseCredentials {
            user: "backup".to_string(),
            password: password.map(str::to_string),
        };
        let config = DatabaseConfig {
            dump_bin,
            socket: None,
            ..Default::default()
        };
        DatabaseDumpProducer::with_config(dir, credentials, config)
    }

    #[test]
    fn writes_compressed_timestamped_dump() {
        let tools = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        // echoes the arguments and the password seen through the environment
        let dump_bin = fake_tool(tools.path(), "mysqldump", r#"echo "-- $* pw=$MYSQL_PWD""#);

        let artifacts = producer(backups.path(), dump_bin, Some("s3cret"))
            .produce(&"virtualizor".into(), false)
            .unwrap();
        assert_eq!(artifacts.len(), 1);

        let artifact = &artifacts[0];
        let file_name = artifact.path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("db_virtualizor_"), "{file_name}");
        assert!(file_name.ends_with(".sql.gz"), "{file_name}");
        assert_eq!(
            Convention::Timestamped.parse(file_name).as_ref(),
            Some(&artifact.name)
        );

        let mut dump = String::new();
        GzDecoder::new(File::open(&artifact.path).unwrap())
            .read_to_string(&mut dump)
            .unwrap();
        assert_eq!(
            dump.trim(),
            "-- --single-transaction --user=backup virtualizor pw=s3cret"
        );
    }

    #[test]
    fn failed_dump_leaves_no_partial_file() {
        let tools = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let dump_bin = fake_tool(
            tools.path(),
            "mysqldump",
            "echo 'partial'; echo 'Access denied' >&2; exit 2",
        );

        let err = producer(backups.path(), dump_bin, None)
            .produce(&"virtualizor".into(), false)
            .unwrap_err();
        assert!(err.to_string().contains("Access denied"), "{err}");
        assert_eq!(std::fs::read_dir(backups.path()).unwrap().count(), 0);
    }

    #[test]
    fn dry_run_does_not_run_the_dump() {
        let tools = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let marker = tools.path().join("ran");
        let dump_bin = fake_tool(
            tools.path(),
            "mysqldump",
            &format!("touch '{}'; echo 'CREATE TABLE t;'", marker.display()),
        );

        let artifacts = producer(backups.path(), dump_bin, None)
            .produce(&"virtualizor".into(), true)
            .unwrap();
        assert!(artifacts.is_empty());
        assert!(!marker.exists());
        assert_eq!(std::fs::read_dir(backups.path()).unwrap().count(), 0);
    }

    #[test]
    fn same_second_dump_keeps_the_earlier_one() {
        let tools = tempfile::tempdir().unwrap();
        let backups = tempfile::tempdir().unwrap();
        let runs = tools.path().join("runs");
        let dump_bin = fake_tool(
            tools.path(),
            "mysqldump",
            &format!("echo run >> '{}'; echo '-- dump'", runs.display()),
        );
        let producer = producer(backups.path(), dump_bin, None);

        let first = producer.produce(&"app".into(), false).unwrap();
        let second = producer.produce(&"app".into(), false);

        assert!(first[0].path.exists());
        match second {
            // same timestamp: the dump isn't even started
            Err(ProduceError::Io(path, e)) => {
                assert_eq!(path, first[0].path);
                assert_eq!(e.kind(), io::ErrorKind::AlreadyExists);
                assert_eq!(std::fs::read_to_string(&runs).unwrap().lines().count(), 1);
            }
            // the clock moved on in between
            Ok(second) => assert_ne!(second[0].path, first[0].path),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}
