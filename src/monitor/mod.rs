//! Health monitoring of VMs with automatic remediation.
//!
//! - [StatusMonitor]: starts VMs the hypervisor reports as not running.
//! - [NetworkMonitor]: reboots VMs that stopped answering on the network.

mod hypervisor;

use std::collections::HashMap;
use std::str::FromStr;

use derive_more::{Display, Error, From};

pub use hypervisor::{Hypervisor, Ping, Qm, Reachability};

use crate::artifact::ResourceId;
use crate::report::{MetricGateway, MetricSample, Notify};
use crate::scheduler::Job;
use crate::util::process::CommandError;

const STATUS_METRIC: &str = "vm_autofix";
const NETWORK_METRIC: &str = "vm_network";
const VM_LABEL: &str = "vm";

#[derive(Debug, Display, Error, From)]
/// Errors on checking or remediating a VM.
pub enum MonitorError {
    /// A hypervisor command failed.
    #[display("{_0}")]
    Command(CommandError),
}

/// Result of checking a single VM.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Health {
    /// The VM is running.
    Running,
    /// The VM wasn't running and has been started.
    Started,
    /// The VM answered the probe.
    Reachable,
    /// The VM didn't answer the probe and has been rebooted.
    Rebooted,
    /// The VM can't be checked, e.g. because no address is known.
    Skipped,
}

/// Outcomes of a monitor pass, in the order of the VMs.
pub type MonitorReport = Vec<(ResourceId, Result<Health, MonitorError>)>;

/// Network address of a VM, parsed from `{vm}:{ip}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmAddress {
    pub vm: ResourceId,
    pub ip: String,
}

impl FromStr for VmAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().split_once(':') {
            Some((vm, ip)) if !vm.trim().is_empty() && !ip.trim().is_empty() => Ok(Self {
                vm: ResourceId::new(vm.trim()),
                ip: ip.trim().to_string(),
            }),
            _ => Err(format!("expected '<vm>:<ip>', got '{s}'")),
        }
    }
}

/// Shared state of both monitors.
struct Monitor<H> {
    node: String,
    vms: Vec<ResourceId>,
    hypervisor: H,
    notifier: Box<dyn Notify>,
    metrics: Box<dyn MetricGateway>,
}

impl<H: Hypervisor> Monitor<H> {
    fn push_metric(&self, metric: &str, vm: &ResourceId, success: bool) {
        let sample = MetricSample::new(metric, VM_LABEL, vm, &self.node, success);
        self.metrics.push(&sample);
    }
}

/// Starts VMs which aren't running.
pub struct StatusMonitor<H> {
    inner: Monitor<H>,
}

impl<H: Hypervisor> StatusMonitor<H> {
    pub fn new(
        node: &str,
        vms: Vec<ResourceId>,
        hypervisor: H,
        notifier: Box<dyn Notify>,
        metrics: Box<dyn MetricGateway>,
    ) -> Self {
        Self {
            inner: Monitor {
                node: node.to_string(),
                vms,
                hypervisor,
                notifier,
                metrics,
            },
        }
    }

    fn check(&self, vm: &ResourceId) -> Result<Health, MonitorError> {
        let Monitor {
            hypervisor,
            notifier,
            ..
        } = &self.inner;

        let status = hypervisor.status(vm)?;
        if status.contains("running") {
            log::debug!(target: "monitor", "VM {vm} is running");
            return Ok(Health::Running);
        }

        log::warn!(target: "monitor", "VM {vm} is not running ({status}), starting it");
        notifier.notify(&format!("VM {vm} is not running, trying to start it..."));
        hypervisor.start(vm)?;
        notifier.notify(&format!("VM {vm} has been started"));

        Ok(Health::Started)
    }
}

impl<H: Hypervisor> Job for StatusMonitor<H> {
    type Report = MonitorReport;

    fn name(&self) -> &str {
        "monitor-status"
    }

    fn run_pass(&self) -> MonitorReport {
        self.inner
            .vms
            .iter()
            .map(|vm| {
                let result = self.check(vm);
                if let Err(e) = &result {
                    log::error!(target: "monitor", "Checking VM {vm} failed: {e}");
                    self.inner
                        .notifier
                        .notify(&format!("Checking VM {vm} failed: {e}"));
                }
                self.inner
                    .push_metric(STATUS_METRIC, vm, result.is_ok());
                (vm.clone(), result)
            })
            .collect()
    }
}

/// Reboots VMs which don't answer a reachability probe.
pub struct NetworkMonitor<H, R> {
    inner: Monitor<H>,
    addresses: HashMap<ResourceId, String>,
    probe: R,
}

impl<H: Hypervisor, R: Reachability> NetworkMonitor<H, R> {
    pub fn new(
        node: &str,
        vms: Vec<ResourceId>,
        addresses: Vec<VmAddress>,
        hypervisor: H,
        probe: R,
        notifier: Box<dyn Notify>,
        metrics: Box<dyn MetricGateway>,
    ) -> Self {
        Self {
            inner: Monitor {
                node: node.to_string(),
                vms,
                hypervisor,
                notifier,
                metrics,
            },
            addresses: addresses
                .into_iter()
                .map(|VmAddress { vm, ip }| (vm, ip))
                .collect(),
            probe,
        }
    }

    fn check(&self, vm: &ResourceId, ip: &str) -> Result<Health, MonitorError> {
        let Monitor {
            hypervisor,
            notifier,
            ..
        } = &self.inner;

        if self.probe.is_reachable(ip) {
            log::debug!(target: "monitor", "VM {vm} ({ip}) is online");
            return Ok(Health::Reachable);
        }

        log::warn!(target: "monitor", "VM {vm} ({ip}) is unreachable, rebooting");
        notifier.notify(&format!("VM {vm} ({ip}) is unreachable, rebooting..."));

        if let Err(e) = hypervisor.reboot(vm) {
            log::warn!(target: "monitor", "Rebooting VM {vm} failed, stopping and starting it instead: {e}");
            hypervisor.stop(vm)?;
            hypervisor.start(vm)?;
        }
        notifier.notify(&format!("VM {vm} has been rebooted"));

        Ok(Health::Rebooted)
    }
}

impl<H: Hypervisor, R: Reachability> Job for NetworkMonitor<H, R> {
    type Report = MonitorReport;

    fn name(&self) -> &str {
        "monitor-network"
    }

    fn run_pass(&self) -> MonitorReport {
        let mut report = Vec::with_capacity(self.inner.vms.len());

        for vm in &self.inner.vms {
            let Some(ip) = self.addresses.get(vm) else {
                log::info!(target: "monitor", "VM {vm} has no configured IP, skipping");
                report.push((vm.clone(), Ok(Health::Skipped)));
                continue;
            };

            let result = self.check(vm, ip);
            if let Err(e) = &result {
                log::error!(target: "monitor", "Checking VM {vm} failed: {e}");
                self.inner
                    .notifier
                    .notify(&format!("Checking VM {vm} failed: {e}"));
            }
            // a rebooted VM was down, that counts as failure
            let healthy = matches!(result, Ok(Health::Reachable));
            self.inner.push_metric(NETWORK_METRIC, vm, healthy);

            report.push((vm.clone(), result));
        }

        report
    }
}
