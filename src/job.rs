//! Backup passes: produce, report, prune locally, replicate, prune remotely.
//!
//! Resources are backed up one after the other, dumps and transfers share
//! the bandwidth and CPU of the node. A failed resource is reported and the
//! pass continues with the next one; nothing is retried before the next pass.

use std::collections::HashSet;

use crate::artifact::{Artifact, ResourceId};
use crate::producers::{ProduceError, Producer};
use crate::replication::{Replicator, Source, TargetOutcome};
use crate::report::{MetricGateway, MetricSample, Notify};
use crate::scheduler::Job;
use crate::util::retention::{PruneRequest, RetentionRule};

/// Result of backing up a single resource. Never persisted.
#[derive(Debug)]
pub struct JobOutcome {
    pub resource: ResourceId,
    pub succeeded: bool,
    pub error: Option<String>,
    pub artifacts: Vec<Artifact>,
    /// One entry per replication target, empty if the backup failed.
    pub replication: Vec<TargetOutcome>,
}

/// Outcomes of a full pass.
#[derive(Debug, Default)]
pub struct PassReport {
    pub outcomes: Vec<JobOutcome>,
}

impl PassReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| o.succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded)
    }
}

struct Plan {
    producer: Box<dyn Producer>,
    resources: Vec<ResourceId>,
}

/// A backup job over one or more producers and their resources.
pub struct BackupJob {
    name: String,
    node: String,
    plans: Vec<Plan>,
    rule: RetentionRule,
    replicator: Replicator,
    notifier: Box<dyn Notify>,
    metrics: Box<dyn MetricGateway>,
    dry_run: bool,
}

impl BackupJob {
    pub fn new(
        name: &str,
        node: &str,
        rule: RetentionRule,
        replicator: Replicator,
        notifier: Box<dyn Notify>,
        metrics: Box<dyn MetricGateway>,
    ) -> Self {
        Self {
            name: name.to_string(),
            node: node.to_string(),
            plans: Vec::new(),
            rule,
            replicator,
            notifier,
            metrics,
            dry_run: false,
        }
    }

    /// Adds `resources` to be backed up with `producer`, after the ones added before.
    ///
    /// A resource listed twice is backed up once.
    pub fn with_producer(mut self, producer: Box<dyn Producer>, mut resources: Vec<ResourceId>) -> Self {
        let mut seen = HashSet::new();
        resources.retain(|resource| {
            let first = seen.insert(resource.clone());
            if !first {
                log::warn!(target: "job", "{} listed more than once, backing it up once", resource);
            }
            first
        });

        self.plans.push(Plan {
            producer,
            resources,
        });
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    fn push_metric(&self, producer: &dyn Producer, resource: &ResourceId, success: bool) {
        if let Some(metric) = producer.metric() {
            let sample = MetricSample::new(&metric.name, &metric.label, resource, &self.node, success);
            self.metrics.push(&sample);
        }
    }

    fn retention(&self, producer: &dyn Producer, resource: &ResourceId) -> PruneRequest {
        PruneRequest {
            directory: producer.directory().to_path_buf(),
            convention: producer.convention(),
            selector: producer.selector(resource),
            rule: self.rule,
        }
    }

    /// Backups a single resource; the error is the one of the producer.
    fn backup(&self, producer: &dyn Producer, resource: &ResourceId) -> Result<JobOutcome, ProduceError> {
        let subject = producer.subject();
        let artifacts = producer.produce(resource, self.dry_run)?;

        let files = artifacts
            .iter()
            .filter_map(|a| a.path.file_name())
            .map(|name| name.to_string_lossy())
            .collect::<Vec<_>>()
            .join(", ");
        log::info!(target: "job", "Backup {subject} {resource} done: {files}");
        self.notifier
            .notify(&format!("Backup {subject} {resource} succeeded: {files}"));
        self.push_metric(producer, resource, true);

        let retention = self.retention(producer, resource);
        let produced: Vec<_> = artifacts.iter().map(|a| a.path.clone()).collect();
        match retention.execute(&produced, self.dry_run) {
            Ok(report) if report.is_clean() => {
                log::info!(target: "job", "Cleanup of old {subject} {resource} backups done");
            }
            Ok(report) => {
                log::warn!(
                    target: "job",
                    "Cleanup of old {subject} {resource} backups left {} file(s) behind",
                    report.failed.len()
                );
            }
            Err(e) => log::error!(target: "job", "Cleanup of old {subject} {resource} backups failed: {e}"),
        }

        let replication = if produced.is_empty() {
            Vec::new()
        } else {
            self.replicator
                .replicate(&Source::Files(produced), &retention)
        };
        for outcome in &replication {
            match &outcome.result {
                Ok(_) => self.notifier.notify(&format!(
                    "Replicated {subject} {resource} to {} and cleaned up old backups there",
                    outcome.target
                )),
                Err(e) => self
                    .notifier
                    .notify(&format!("Replication of {subject} {resource} failed: {e}")),
            }
        }

        Ok(JobOutcome {
            resource: resource.clone(),
            succeeded: true,
            error: None,
            artifacts,
            replication,
        })
    }

    fn failed(&self, producer: &dyn Producer, resource: &ResourceId, e: ProduceError) -> JobOutcome {
        let subject = producer.subject();
        log::error!(target: "job", "Backup {subject} {resource} failed: {e}");
        self.notifier
            .notify(&format!("Backup {subject} {resource} failed: {e}"));
        self.push_metric(producer, resource, false);

        JobOutcome {
            resource: resource.clone(),
            succeeded: false,
            error: Some(e.to_string()),
            artifacts: Vec::new(),
            replication: Vec::new(),
        }
    }
}

impl Job for BackupJob {
    type Report = PassReport;

    fn name(&self) -> &str {
        &self.name
    }

    fn run_pass(&self) -> PassReport {
        self.notifier.notify(&format!("Starting {}", self.name));

        let outcomes = self
            .plans
            .iter()
            .flat_map(|plan| {
                plan.resources
                    .iter()
                    .map(move |resource| (plan.producer.as_ref(), resource))
            })
            .map(|(producer, resource)| {
                self.backup(producer, resource)
                    .unwrap_or_else(|e| self.failed(producer, resource, e))
            })
            .collect();
        let report = PassReport { outcomes };

        log::info!(
            target: "job",
            "{} finished: {} succeeded, {} failed",
            self.name,
            report.succeeded().count(),
            report.failed().count()
        );
        report
    }
}
