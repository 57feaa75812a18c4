//! Immutable settings built once at start-up.
//!
//! Command line and environment are parsed by [Cli]; the tool settings of
//! the producers come from a TOML file. Every component receives what it
//! needs from [Settings] instead of reading the environment itself.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error};
use reqwest::Url;

use crate::cli::Cli;
use crate::producers::ProducersConfig;
use crate::replication::{Replicator, Rsync, TargetNode};
use crate::report::{DisabledGateway, LogNotifier, MetricGateway, Notify, Pushgateway, TelegramNotifier};
use crate::util::retention::RetentionRule;

#[derive(Debug, Display, Error)]
/// Errors on building the [Settings].
pub enum ConfigError {
    /// The producer config file can't be read.
    #[display("Reading the config file {} failed: {_1}", _0.display())]
    Read(PathBuf, #[error(source)] io::Error),
    /// The producer config file is malformed.
    #[display("Parsing the config file {} failed: {_1}", _0.display())]
    Parse(PathBuf, #[error(source)] toml::de::Error),
    /// A replication target can't be parsed.
    #[display("Invalid replication target '{_0}'")]
    InvalidTarget(#[error(ignore)] String),
    /// An HTTP client can't be created.
    #[display("Creating the HTTP client failed: {_0}")]
    Http(reqwest::Error),
}

/// Telegram chat receiving the notifications.
#[derive(Clone)]
pub struct TelegramSettings {
    pub api: Url,
    pub token: String,
    pub chat_id: String,
}

impl std::fmt::Debug for TelegramSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramSettings")
            .field("api", &self.api.as_str())
            .field("token", &"***")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

/// Everything the jobs need to know about the deployment.
#[derive(Debug)]
pub struct Settings {
    pub node: String,
    pub backup_dir: PathBuf,
    pub targets: Vec<TargetNode>,
    pub remote_bin: String,
    pub retention: RetentionRule,
    pub interval: Duration,
    pub telegram: Option<TelegramSettings>,
    pub pushgateway: Option<Url>,
    pub dry_run: bool,
    pub once: bool,
    pub producers: ProducersConfig,
}

impl Settings {
    pub fn new(cli: &Cli, producers: ProducersConfig) -> Result<Self, ConfigError> {
        let backup_dir = cli
            .backup_dir
            .clone()
            .unwrap_or_else(|| cli.action.default_backup_dir());

        let targets = cli
            .targets
            .iter()
            .filter(|spec| !spec.trim().is_empty())
            .map(|spec| {
                TargetNode::parse(spec, &cli.remote_user, &backup_dir)
                    .ok_or_else(|| ConfigError::InvalidTarget(spec.clone()))
            })
            .collect::<Result<_, _>>()?;

        let telegram = match (&cli.telegram_token, &cli.telegram_chat) {
            (Some(token), Some(chat_id)) if !token.is_empty() && !chat_id.is_empty() => {
                Some(TelegramSettings {
                    api: cli.telegram_api.clone(),
                    token: token.clone(),
                    chat_id: chat_id.clone(),
                })
            }
            _ => None,
        };

        Ok(Self {
            node: cli.node.clone(),
            backup_dir,
            targets,
            remote_bin: cli.remote_bin.clone(),
            retention: cli.retention,
            interval: cli.interval.unwrap_or_else(|| cli.action.default_interval()),
            telegram,
            pushgateway: cli.pushgateway.clone(),
            dry_run: cli.dry_run,
            once: cli.once,
            producers,
        })
    }

    pub fn notifier(&self) -> Result<Box<dyn Notify>, ConfigError> {
        match &self.telegram {
            Some(telegram) => {
                let notifier =
                    TelegramNotifier::new(&telegram.api, &telegram.token, &telegram.chat_id, &self.node)
                        .map_err(ConfigError::Http)?;
                Ok(Box::new(notifier))
            }
            None => {
                log::debug!("No Telegram chat configured, notifications only go to the log");
                Ok(Box::new(LogNotifier::new(&self.node)))
            }
        }
    }

    pub fn metrics(&self) -> Result<Box<dyn MetricGateway>, ConfigError> {
        match &self.pushgateway {
            Some(url) => {
                let gateway = Pushgateway::new(url.clone()).map_err(ConfigError::Http)?;
                Ok(Box::new(gateway))
            }
            None => {
                log::debug!("No Pushgateway configured, metrics are dropped");
                Ok(Box::new(DisabledGateway))
            }
        }
    }

    pub fn replicator(&self) -> Replicator {
        Replicator::new(Box::new(Rsync::new(&self.remote_bin)), self.targets.clone())
            .dry_run(self.dry_run)
    }
}

/// Reads the producer config, writing the default one if `path` doesn't exist yet.
pub fn load_producers_config(path: &Path) -> Result<ProducersConfig, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(config_str) => {
            toml::from_str(&config_str).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!(
                "Writing default config to {} because it doesn't exist yet",
                path.display()
            );
            let default_config = ProducersConfig::default();
            match toml::to_string_pretty(&default_config) {
                Ok(config_str) => {
                    if let Err(e) = std::fs::write(path, config_str) {
                        log::warn!("Writing default config to {} failed {e}", path.display());
                    }
                }
                Err(e) => log::warn!("Serializing the default config failed: {e}"),
            }

            Ok(default_config)
        }
        Err(e) => Err(ConfigError::Read(path.to_path_buf(), e)),
    }
}
