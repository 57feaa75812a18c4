use std::process::{Command, Stdio};
use std::time::Duration;

use crate::artifact::ResourceId;
use crate::util::process::{self, CommandError};

/// Control over the VMs of this node.
pub trait Hypervisor {
    /// Status line of the VM, e.g. `status: running`.
    fn status(&self, vm: &ResourceId) -> Result<String, CommandError>;
    fn start(&self, vm: &ResourceId) -> Result<(), CommandError>;
    fn stop(&self, vm: &ResourceId) -> Result<(), CommandError>;
    fn reboot(&self, vm: &ResourceId) -> Result<(), CommandError>;
}

/// The Proxmox VE `qm` command.
#[derive(Debug, Clone)]
pub struct Qm {
    bin: String,
}

impl Default for Qm {
    fn default() -> Self {
        Self::with_bin("qm")
    }
}

impl Qm {
    pub fn with_bin(bin: &str) -> Self {
        Self {
            bin: bin.to_string(),
        }
    }

    fn execute_command(&self, command: &str, vm: &ResourceId) -> Result<String, CommandError> {
        let mut qm = Command::new(&self.bin);
        qm.arg(command).arg(vm.as_str());
        process::run(&mut qm, "monitor::qm")
    }
}

impl Hypervisor for Qm {
    fn status(&self, vm: &ResourceId) -> Result<String, CommandError> {
        self.execute_command("status", vm)
    }

    fn start(&self, vm: &ResourceId) -> Result<(), CommandError> {
        self.execute_command("start", vm).map(|_| ())
    }

    fn stop(&self, vm: &ResourceId) -> Result<(), CommandError> {
        self.execute_command("stop", vm).map(|_| ())
    }

    fn reboot(&self, vm: &ResourceId) -> Result<(), CommandError> {
        self.execute_command("reboot", vm).map(|_| ())
    }
}

/// Reachability probe of a network address.
pub trait Reachability {
    fn is_reachable(&self, ip: &str) -> bool;
}

/// Sends a single ICMP echo request with `ping`.
#[derive(Debug, Clone)]
pub struct Ping {
    timeout: Duration,
}

impl Default for Ping {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
        }
    }
}

impl Reachability for Ping {
    fn is_reachable(&self, ip: &str) -> bool {
        let status = Command::new("ping")
            .arg("-c")
            .arg("1")
            .arg("-W")
            .arg(self.timeout.as_secs().max(1).to_string())
            .arg(ip)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) => status.success(),
            Err(e) => {
                log::error!(target: "monitor::ping", "Failed to run ping: {e}");
                false
            }
        }
    }
}
