use std::io::{self, Read};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;

use vm_backup_lib::artifact::{ResourceId, Selector};
use vm_backup_lib::cli::{Action, Cli, DbArgs, NetworkArgs, PruneArgs, SelectionArgs};
use vm_backup_lib::job::BackupJob;
use vm_backup_lib::monitor::{NetworkMonitor, Ping, Qm, StatusMonitor};
use vm_backup_lib::producers::{
    ArchiveProducer, DatabaseCredentials, DatabaseDumpProducer, SnapshotProducer,
};
use vm_backup_lib::replication::{PruneSummary, Source};
use vm_backup_lib::scheduler::{Job, Scheduler};
use vm_backup_lib::settings::{self, ConfigError, Settings};
use vm_backup_lib::util::log_file::LogFiles;
use vm_backup_lib::util::retention::PruneRequest;

fn main() -> ExitCode {
    // the deployments keep their settings in a .env file next to the binary
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Some(log_dir) = &cli.log_dir {
        match LogFiles::open(log_dir) {
            Ok(files) => files.attach(&mut env_logger),
            Err(e) => eprintln!("Opening the log files in {} failed: {e}", log_dir.display()),
        }
    }
    if env_logger.try_init().is_err() {
        eprintln!("Logger already initialized");
    }

    let producers = match settings::load_producers_config(&cli.config) {
        Ok(producers) => producers,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let settings = match Settings::new(&cli, producers) {
        Ok(settings) => settings,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if settings.dry_run {
        log::warn!("Running in dry-run mode");
    }

    let result = match &cli.action {
        Action::Prune(args) => return prune(&settings, args),
        Action::BackupVm(args) => backup_vm_job(&settings, cli.action.job_name(), &args.vms)
            .map(|job| schedule(&settings, &job)),
        Action::BackupDb(args) => {
            let credentials = DatabaseCredentials {
                user: args.db_user.clone(),
                password: args.db_pass.clone().filter(|p| !p.is_empty()),
            };
            backup_db_job(&settings, cli.action.job_name(), credentials, args)
                .map(|job| schedule(&settings, &job))
        }
        Action::MonitorStatus(args) => {
            status_monitor(&settings, &args.vms).map(|monitor| schedule(&settings, &monitor))
        }
        Action::MonitorNetwork(args) => {
            network_monitor(&settings, args).map(|monitor| schedule(&settings, &monitor))
        }
        Action::Replicate(selection) => replicate(&settings, selection),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn schedule<J: Job>(settings: &Settings, job: &J) {
    let scheduler = Scheduler::new(settings.interval);
    scheduler.run(job, settings.once.then_some(1));
}

fn backup_vm_job(
    settings: &Settings,
    name: &str,
    vms: &[ResourceId],
) -> Result<BackupJob, ConfigError> {
    let producer = SnapshotProducer::with_config(&settings.backup_dir, settings.producers.snapshot.clone());

    Ok(BackupJob::new(
        name,
        &settings.node,
        settings.retention,
        settings.replicator(),
        settings.notifier()?,
        settings.metrics()?,
    )
    .with_producer(Box::new(producer), vms.to_vec())
    .dry_run(settings.dry_run))
}

fn backup_db_job(
    settings: &Settings,
    name: &str,
    credentials: DatabaseCredentials,
    args: &DbArgs,
) -> Result<BackupJob, ConfigError> {
    let dump = DatabaseDumpProducer::with_config(
        &settings.backup_dir,
        credentials,
        settings.producers.database.clone(),
    );

    let mut job = BackupJob::new(
        name,
        &settings.node,
        settings.retention,
        settings.replicator(),
        settings.notifier()?,
        settings.metrics()?,
    )
    .with_producer(Box::new(dump), args.databases.clone())
    .dry_run(settings.dry_run);

    if !args.no_archive {
        let archive = ArchiveProducer::with_config(&settings.backup_dir, settings.producers.archive.clone());
        let resource = archive.resource();
        job = job.with_producer(Box::new(archive), vec![resource]);
    }

    Ok(job)
}

fn status_monitor(settings: &Settings, vms: &[ResourceId]) -> Result<StatusMonitor<Qm>, ConfigError> {
    Ok(StatusMonitor::new(
        &settings.node,
        vms.to_vec(),
        Qm::default(),
        settings.notifier()?,
        settings.metrics()?,
    ))
}

fn network_monitor(settings: &Settings, args: &NetworkArgs) -> Result<NetworkMonitor<Qm, Ping>, ConfigError> {
    Ok(NetworkMonitor::new(
        &settings.node,
        args.vms.vms.clone(),
        args.addresses.clone(),
        Qm::default(),
        Ping::default(),
        settings.notifier()?,
        settings.metrics()?,
    ))
}

fn selection_request(settings: &Settings, directory: &Path, selection: &SelectionArgs) -> PruneRequest {
    PruneRequest {
        directory: directory.to_path_buf(),
        convention: selection.convention,
        selector: Selector {
            kind: selection.kind.clone(),
            resource: selection.resource.clone(),
        },
        rule: settings.retention,
    }
}

fn replicate(settings: &Settings, selection: &SelectionArgs) -> Result<(), ConfigError> {
    let notifier = settings.notifier()?;
    let request = selection_request(settings, &settings.backup_dir, selection);
    let outcomes = settings
        .replicator()
        .replicate(&Source::Directory(settings.backup_dir.clone()), &request);

    for outcome in outcomes {
        match outcome.result {
            Ok(_) => {
                log::info!("Replication to {} done", outcome.target);
                notifier.notify(&format!("Backups replicated to {}", outcome.target));
            }
            Err(e) => {
                log::error!("{e}");
                notifier.notify(&format!("Replication to {} failed: {e}", outcome.target));
            }
        }
    }

    Ok(())
}

fn read_request(source: &Path) -> Result<PruneRequest, String> {
    let mut json = String::new();
    if source == Path::new("-") {
        io::stdin()
            .read_to_string(&mut json)
            .map_err(|e| format!("Reading the prune request from stdin failed: {e}"))?;
    } else {
        json = std::fs::read_to_string(source)
            .map_err(|e| format!("Reading the prune request {} failed: {e}", source.display()))?;
    }

    serde_json::from_str(&json).map_err(|e| format!("Invalid prune request: {e}"))
}

fn prune(settings: &Settings, args: &PruneArgs) -> ExitCode {
    let request = match &args.request {
        Some(source) => match read_request(source) {
            Ok(request) => request,
            Err(e) => {
                log::error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        None => selection_request(settings, &settings.backup_dir, &args.selection),
    };
    log::debug!("Applying {} to {}", request.rule, request.directory.display());

    match request.execute(&[], settings.dry_run) {
        Ok(report) => {
            let summary = PruneSummary::from(&report);
            match serde_json::to_string(&summary) {
                Ok(summary) => println!("{summary}"),
                Err(e) => log::warn!("Serializing the prune summary failed: {e}"),
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
