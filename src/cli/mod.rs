use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;
use reqwest::Url;

use crate::artifact::{Convention, ResourceId};
use crate::monitor::VmAddress;
use crate::report::notify::TELEGRAM_API_URL;
use crate::util::duration::parse_duration;
use crate::util::retention::RetentionRule;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, global = true)]
    pub verbose: Option<LevelFilter>,

    /// Also append the log to `backup.log` and errors to `backup-error.log` in this folder.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Tool settings of the backup producers. Created with defaults if missing.
    #[arg(long, env = "VM_BACKUP_CONFIG", default_value = "/etc/vm-backup.toml")]
    pub config: PathBuf,

    /// Identity of this node in notifications and metrics.
    #[arg(long = "node", env = "NODE_IP", default_value = "unknown")]
    pub node: String,

    /// Folder for backup artifacts. Defaults to `/var/backups/vm` or `/var/backups/db`.
    #[arg(long, env = "BACKUP_DIR")]
    pub backup_dir: Option<PathBuf>,

    /// Nodes to replicate backups to, as `[user@]host[:/directory]`.
    #[arg(long = "target", env = "RSYNC_TARGETS", value_delimiter = ',')]
    pub targets: Vec<String>,

    /// User on the replication targets, unless given per target.
    #[arg(long, env = "REMOTE_USER", default_value = "root")]
    pub remote_user: String,

    /// This tool's binary on the replication targets, used for remote cleanup.
    #[arg(long, env = "REMOTE_BIN", default_value = "vm-backup")]
    pub remote_bin: String,

    /// Retention of backups: `newest:<n>` or `older-than:<duration>`.
    #[arg(long, env = "RETENTION", default_value = "newest:1")]
    pub retention: RetentionRule,

    /// Time between two passes, e.g. `1h`. Defaults depend on the job.
    #[arg(long, env = "RUN_INTERVAL", value_parser = parse_duration)]
    pub interval: Option<Duration>,

    /// Telegram bot token for notifications.
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    pub telegram_token: Option<String>,

    /// Telegram chat receiving the notifications.
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    pub telegram_chat: Option<String>,

    /// Base URL of the Telegram bot API.
    #[arg(long, env = "TELEGRAM_API_URL", default_value = TELEGRAM_API_URL)]
    pub telegram_api: Url,

    /// Base URL of the Prometheus Pushgateway.
    #[arg(long, env = "PUSHGATEWAY_URL")]
    pub pushgateway: Option<Url>,

    /// Simulative run: no files are created, copied or deleted.
    #[arg(long)]
    pub dry_run: bool,

    /// Run a single pass and exit.
    #[arg(long)]
    pub once: bool,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand, Debug)]
pub enum Action {
    /// Snapshot VMs, replicate and clean up old backups.
    BackupVm(VmArgs),
    /// Dump databases and archive the config, replicate and clean up old backups.
    BackupDb(DbArgs),
    /// Start VMs which aren't running.
    MonitorStatus(VmArgs),
    /// Reboot VMs which are unreachable.
    MonitorNetwork(NetworkArgs),
    /// Copy the whole backup folder to the targets and clean up there.
    Replicate(SelectionArgs),
    /// Apply the retention to a backup folder.
    Prune(PruneArgs),
}

impl Action {
    /// Name of the job, passes with the same name never overlap.
    pub fn job_name(&self) -> &'static str {
        match self {
            Self::BackupVm(_) => "backup-vm",
            Self::BackupDb(_) => "backup-db",
            Self::MonitorStatus(_) => "monitor-status",
            Self::MonitorNetwork(_) => "monitor-network",
            Self::Replicate(_) => "replicate",
            Self::Prune(_) => "prune",
        }
    }

    pub fn default_interval(&self) -> Duration {
        match self {
            Self::MonitorStatus(_) => Duration::from_secs(30),
            Self::MonitorNetwork(_) => Duration::from_secs(60),
            _ => Duration::from_secs(60 * 60),
        }
    }

    pub fn default_backup_dir(&self) -> PathBuf {
        match self {
            Self::BackupDb(_) => PathBuf::from("/var/backups/db"),
            _ => PathBuf::from("/var/backups/vm"),
        }
    }
}

#[derive(Args, Debug)]
pub struct VmArgs {
    /// VMs to work on.
    #[arg(long = "vm", env = "VM_LIST", value_delimiter = ',', required = true)]
    pub vms: Vec<ResourceId>,
}

#[derive(Args, Debug)]
pub struct NetworkArgs {
    #[command(flatten)]
    pub vms: VmArgs,

    /// Addresses of the VMs as `<vm>:<ip>`.
    #[arg(long = "vm-ip", env = "VM_IPS", value_delimiter = ',')]
    pub addresses: Vec<VmAddress>,
}

#[derive(Args, Debug)]
pub struct DbArgs {
    /// Databases to dump.
    #[arg(long = "db", env = "DB_NAME", value_delimiter = ',', default_value = "virtualizor")]
    pub databases: Vec<ResourceId>,

    /// Database user performing the dump.
    #[arg(long, env = "DB_USER", default_value = "root")]
    pub db_user: String,

    /// Password of the database user.
    #[arg(long, env = "DB_PASS", hide_env_values = true)]
    pub db_pass: Option<String>,

    /// Skip the archive of the config files.
    #[arg(long)]
    pub no_archive: bool,
}

#[derive(Args, Debug, Clone)]
pub struct SelectionArgs {
    /// Naming convention of the artifacts.
    #[arg(long, value_enum, default_value = "vzdump")]
    pub convention: Convention,

    /// Only artifacts of this kind.
    #[arg(long)]
    pub kind: Option<String>,

    /// Only artifacts of this resource.
    #[arg(long)]
    pub resource: Option<ResourceId>,
}

#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Read the request as JSON from this file, `-` for stdin.
    ///
    /// All other options are ignored if given.
    #[arg(long)]
    pub request: Option<PathBuf>,

    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_backup_vm() {
        let cli = Cli::try_parse_from([
            "vm-backup",
            "--node",
            "10.0.0.5",
            "--target",
            "10.0.0.6,10.0.0.7",
            "--retention",
            "older-than:7d",
            "--log-dir",
            "/var/backups/vm",
            "backup-vm",
            "--vm",
            "101,102",
        ])
        .unwrap();

        assert_eq!(cli.node, "10.0.0.5");
        assert_eq!(cli.targets, ["10.0.0.6", "10.0.0.7"]);
        assert_eq!(cli.retention.to_string(), "older-than:7d");
        assert_eq!(cli.log_dir, Some(PathBuf::from("/var/backups/vm")));
        let Action::BackupVm(args) = cli.action else {
            panic!("expected backup-vm");
        };
        assert_eq!(args.vms, [ResourceId::from("101"), ResourceId::from("102")]);
    }

    #[test]
    fn parses_network_addresses() {
        let cli = Cli::try_parse_from([
            "vm-backup",
            "monitor-network",
            "--vm",
            "1008",
            "--vm-ip",
            "1008:192.168.80.120,1009:192.168.80.121",
        ])
        .unwrap();

        let Action::MonitorNetwork(args) = cli.action else {
            panic!("expected monitor-network");
        };
        assert_eq!(args.addresses.len(), 2);
        assert_eq!(args.addresses[1].ip, "192.168.80.121");
    }

    #[test]
    fn rejects_invalid_retention() {
        let result = Cli::try_parse_from(["vm-backup", "--retention", "newest:0", "replicate"]);
        assert!(result.is_err());
    }
}
