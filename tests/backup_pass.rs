use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use mockito::Matcher;
use reqwest::Url;

use vm_backup_lib::artifact::{Artifact, ArtifactName, Convention, ResourceId};
use vm_backup_lib::job::BackupJob;
use vm_backup_lib::producers::{MetricSpec, ProduceError, Producer};
use vm_backup_lib::replication::{PruneSummary, Replicator, Source, TargetNode, Transport};
use vm_backup_lib::report::{Pushgateway, TelegramNotifier};
use vm_backup_lib::scheduler::{Job, Scheduler};
use vm_backup_lib::util::process::CommandError;
use vm_backup_lib::util::retention::{PruneRequest, RetentionRule};

/// Writes vzdump-like artifacts, failing for the VMs in `broken`.
struct FakeSnapshot {
    directory: PathBuf,
    metric: MetricSpec,
    broken: Vec<ResourceId>,
}

impl Producer for FakeSnapshot {
    fn subject(&self) -> &str {
        "VM"
    }

    fn kind(&self) -> &str {
        "qemu"
    }

    fn convention(&self) -> Convention {
        Convention::Vzdump
    }

    fn directory(&self) -> &Path {
        &self.directory
    }

    fn metric(&self) -> Option<&MetricSpec> {
        Some(&self.metric)
    }

    fn produce(&self, resource: &ResourceId, _dry_run: bool) -> Result<Vec<Artifact>, ProduceError> {
        if self.broken.contains(resource) {
            return Err(ProduceError::NoArtifact(resource.clone()));
        }

        let name = ArtifactName {
            kind: "qemu".to_string(),
            resource: resource.clone(),
            timestamp: "2024_05_02-03_00_00".to_string(),
            extension: "vma.lzo".to_string(),
        };
        let path = self.directory.join(Convention::Vzdump.file_name(&name));
        std::fs::write(&path, "snapshot").unwrap();
        Ok(vec![Artifact { path, name }])
    }
}

/// Treats every target as a local folder.
struct LocalTransport {
    unreachable: Vec<String>,
    pruned: Rc<RefCell<Vec<String>>>,
}

impl Transport for LocalTransport {
    fn copy(&self, source: &Source, target: &TargetNode, _dry_run: bool) -> Result<(), CommandError> {
        if self.unreachable.contains(&target.host) {
            return Err(CommandError::NotRun {
                program: "rsync".to_string(),
                source: std::io::Error::other("no route to host"),
            });
        }

        let files = match source {
            Source::Files(files) => files.clone(),
            Source::Directory(dir) => std::fs::read_dir(dir)
                .unwrap()
                .map(|entry| entry.unwrap().path())
                .collect(),
        };
        std::fs::create_dir_all(&target.directory).unwrap();
        for file in files {
            std::fs::copy(&file, target.directory.join(file.file_name().unwrap())).unwrap();
        }
        Ok(())
    }

    fn prune(&self, target: &TargetNode, request: &PruneRequest) -> Result<PruneSummary, CommandError> {
        self.pruned.borrow_mut().push(target.host.clone());
        let report = request.execute(&[], false).unwrap();
        Ok(PruneSummary::from(&report))
    }
}

fn aged(dir: &Path, name: &str, age: Duration) -> PathBuf {
    let path = dir.join(name);
    let file = std::fs::File::create(&path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
    path
}

#[test]
fn pass_reports_and_replicates_every_healthy_vm() {
    let local = tempfile::tempdir().unwrap();
    let replicas = tempfile::tempdir().unwrap();
    let node3 = replicas.path().join("node3");
    std::fs::create_dir(&node3).unwrap();

    let day = Duration::from_secs(86_400);
    let old_local = aged(local.path(), "vzdump-qemu-101-2024_05_01-03_00_00.vma.lzo", day);
    let old_log = aged(local.path(), "vzdump-qemu-101-2024_05_01-03_00_00.log", day);
    let old_replica = aged(&node3, "vzdump-qemu-101-2024_05_01-03_00_00.vma.lzo", day);

    let mut server = mockito::Server::new();
    let ok_101 = server
        .mock("POST", "/metrics/job/vm_backup/instance/101")
        .match_body("vm_backup{vm=\"101\", node=\"10.0.0.5\"} 1\n")
        .create();
    let failed_102 = server
        .mock("POST", "/metrics/job/vm_backup/instance/102")
        .match_body("vm_backup{vm=\"102\", node=\"10.0.0.5\"} 0\n")
        .create();
    let ok_103 = server
        .mock("POST", "/metrics/job/vm_backup/instance/103")
        .match_body("vm_backup{vm=\"103\", node=\"10.0.0.5\"} 1\n")
        .create();
    let failure_message = server
        .mock("POST", "/botsecret/sendMessage")
        .match_body(Matcher::PartialJsonString(
            r#"{"chat_id": "-100", "text": "[10.0.0.5] Backup VM 102 failed: No artifact for 102 found after backup"}"#
                .to_string(),
        ))
        .create();
    let start_message = server
        .mock("POST", "/botsecret/sendMessage")
        .match_body(Matcher::PartialJsonString(
            r#"{"text": "[10.0.0.5] Starting backup-vm"}"#.to_string(),
        ))
        .create();

    let base = Url::parse(&server.url()).unwrap();
    let notifier = TelegramNotifier::new(&base, "secret", "-100", "10.0.0.5").unwrap();
    let metrics = Pushgateway::new(base).unwrap();

    let pruned = Rc::new(RefCell::new(Vec::new()));
    let transport = LocalTransport {
        unreachable: vec!["node2".to_string()],
        pruned: pruned.clone(),
    };
    let replicator = Replicator::new(
        Box::new(transport),
        vec![
            TargetNode::parse("node2", "root", &replicas.path().join("node2")).unwrap(),
            TargetNode::parse("node3", "root", &node3).unwrap(),
        ],
    );

    let producer = FakeSnapshot {
        directory: local.path().to_path_buf(),
        metric: MetricSpec::new("vm_backup", "vm"),
        broken: vec!["102".into()],
    };
    let job = BackupJob::new(
        "backup-vm",
        "10.0.0.5",
        RetentionRule::KeepNewest { keep: 1 },
        replicator,
        Box::new(notifier),
        Box::new(metrics),
    )
    .with_producer(Box::new(producer), vec!["101".into(), "102".into(), "103".into()]);

    let report = Scheduler::new(Duration::from_secs(3600))
        .trigger(&job)
        .expect("nothing else is running");

    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.failed().next().unwrap().resource, ResourceId::from("102"));

    ok_101.assert();
    failed_102.assert();
    ok_103.assert();
    failure_message.assert();
    start_message.assert();

    // the log of the old snapshot is its own group and stays
    assert!(!old_local.exists());
    assert!(old_log.exists());
    assert!(!old_replica.exists());
    assert!(node3.join("vzdump-qemu-101-2024_05_02-03_00_00.vma.lzo").exists());
    assert!(node3.join("vzdump-qemu-103-2024_05_02-03_00_00.vma.lzo").exists());
    assert!(!replicas.path().join("node2").exists());
    assert_eq!(*pruned.borrow(), ["node3", "node3"]);

    assert_eq!(job.name(), "backup-vm");
}

#[test]
fn replicate_directory_to_remaining_targets() {
    let local = tempfile::tempdir().unwrap();
    let replicas = tempfile::tempdir().unwrap();
    std::fs::write(local.path().join("db_app_2024-05-01T00-00-00Z.sql.gz"), "old").unwrap();
    std::fs::write(local.path().join("db_app_2024-05-02T00-00-00Z.sql.gz"), "new").unwrap();

    let pruned = Rc::new(RefCell::new(Vec::new()));
    let replicator = Replicator::new(
        Box::new(LocalTransport {
            unreachable: vec!["node2".to_string()],
            pruned: pruned.clone(),
        }),
        vec![
            TargetNode::parse("node2", "root", &replicas.path().join("node2")).unwrap(),
            TargetNode::parse("node3", "root", &replicas.path().join("node3")).unwrap(),
        ],
    );

    let request = PruneRequest {
        directory: local.path().to_path_buf(),
        convention: Convention::Timestamped,
        selector: Default::default(),
        rule: RetentionRule::OlderThan {
            max_age: Duration::from_secs(7 * 86_400),
        },
    };
    let outcomes = replicator.replicate(&Source::Directory(local.path().to_path_buf()), &request);

    assert!(!outcomes[0].is_success());
    assert!(outcomes[1].is_success());
    assert_eq!(std::fs::read_dir(replicas.path().join("node3")).unwrap().count(), 2);
    assert_eq!(*pruned.borrow(), ["node3"]);
}
