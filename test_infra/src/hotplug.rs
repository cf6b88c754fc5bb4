// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The attach/detach verification loop and its collaborators' seams.
//!
//! Each cycle attaches a backend resource to the guest under a frontend
//! device name, checks the guest's live partition table for the frontend,
//! detaches it and checks again. The loop owns nothing beyond the iteration
//! counter; domain and console teardown is the caller's scoped-ownership
//! obligation.

use std::fmt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use thiserror::Error;

use crate::console::{ConsoleError, ConsoleSession};
use crate::domain::VirtMode;

pub const DEFAULT_ITERATIONS: u32 = 10;

/// Reads the kernel's live partition table; the one fixed introspection
/// command whose output the loop inspects.
pub const PARTITION_LIST_COMMAND: &str = "cat /proc/partitions";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// A host block device node, e.g. a ramdisk (`phy:ram1`).
    Physical,
    /// A disk image file on the host (`file:/path/to.img`).
    File,
}

#[derive(Error, Debug)]
pub enum ParseBackendError {
    #[error("backend specification is missing a ':' separator: {0}")]
    MissingSeparator(String),
    #[error("unknown backend resource kind: {0}")]
    UnknownKind(String),
    #[error("backend specification has an empty resource name")]
    EmptyResource,
}

/// Host-side half of a block-device binding: which resource kind and which
/// resource the hypervisor should expose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendSpec {
    pub kind: BackendKind,
    pub resource: String,
}

impl BackendSpec {
    /// The host path handed to the control plane.
    pub fn host_path(&self) -> PathBuf {
        match self.kind {
            BackendKind::Physical => Path::new("/dev").join(&self.resource),
            BackendKind::File => PathBuf::from(&self.resource),
        }
    }
}

impl FromStr for BackendSpec {
    type Err = ParseBackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, resource) = s
            .split_once(':')
            .ok_or_else(|| ParseBackendError::MissingSeparator(s.to_owned()))?;
        let kind = match kind {
            "phy" => BackendKind::Physical,
            "file" => BackendKind::File,
            _ => return Err(ParseBackendError::UnknownKind(kind.to_owned())),
        };
        if resource.is_empty() {
            return Err(ParseBackendError::EmptyResource);
        }
        Ok(BackendSpec {
            kind,
            resource: resource.to_owned(),
        })
    }
}

impl fmt::Display for BackendSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            BackendKind::Physical => "phy",
            BackendKind::File => "file",
        };
        write!(f, "{kind}:{}", self.resource)
    }
}

/// Pairing of a backend resource and the device name the guest should see.
/// Transient; lives for one attach/verify/detach/verify cycle at a time.
#[derive(Clone, Debug)]
pub struct BlockDeviceBinding {
    pub backend: BackendSpec,
    pub frontend: String,
}

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("connecting to the hypervisor API socket failed")]
    Connect(#[source] std::io::Error),
    #[error("hypervisor control-plane request failed")]
    Request(#[source] api_client::Error),
}

/// Issues attach/detach requests to the hypervisor control plane and blocks
/// until the operation completes or fails. No retry on failure; resilience
/// to transient hypervisor errors is explicitly not under test.
pub trait BlockDeviceOperator {
    fn attach(&mut self, binding: &BlockDeviceBinding) -> Result<(), OperatorError>;
    fn detach(&mut self, frontend: &str) -> Result<(), OperatorError>;
}

/// Runs commands inside the guest. The verification loop only ever needs
/// this one operation, so the full console session stays behind a seam.
pub trait GuestConsole {
    fn run_cmd(&mut self, command: &str) -> Result<String, ConsoleError>;
}

impl GuestConsole for ConsoleSession {
    fn run_cmd(&mut self, command: &str) -> Result<String, ConsoleError> {
        ConsoleSession::run_cmd(self, command)
    }
}

/// Control-plane backed operator: `PUT vm.add-disk` / `PUT vm.remove-device`
/// over the domain's API socket.
pub struct ApiBlockDeviceOperator {
    api_socket_path: PathBuf,
}

impl ApiBlockDeviceOperator {
    pub fn new<P: AsRef<Path>>(api_socket_path: P) -> Self {
        ApiBlockDeviceOperator {
            api_socket_path: api_socket_path.as_ref().to_path_buf(),
        }
    }

    fn api_command(&self, command: &str, body: &str) -> Result<(), OperatorError> {
        let mut socket =
            UnixStream::connect(&self.api_socket_path).map_err(OperatorError::Connect)?;
        let response = api_client::simple_api_command(&mut socket, "PUT", command, Some(body))
            .map_err(OperatorError::Request)?;
        if let Some(response) = response {
            debug!("vm.{command}: {response}");
        }
        Ok(())
    }
}

impl BlockDeviceOperator for ApiBlockDeviceOperator {
    fn attach(&mut self, binding: &BlockDeviceBinding) -> Result<(), OperatorError> {
        let body = serde_json::json!({
            "path": binding.backend.host_path().display().to_string(),
            "id": binding.frontend,
        })
        .to_string();
        self.api_command("add-disk", &body)
    }

    fn detach(&mut self, frontend: &str) -> Result<(), OperatorError> {
        let body = serde_json::json!({ "id": frontend }).to_string();
        self.api_command("remove-device", &body)
    }
}

/// Overall outcome of one test run. Exactly one verdict per run; a failing
/// iteration carries the 1-based iteration index and the direction that
/// broke in its diagnostic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail { iteration: u32, diagnostic: String },
    Skip { reason: String },
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail {
                iteration,
                diagnostic,
            } => write!(f, "FAIL (iteration {iteration}): {diagnostic}"),
            Verdict::Skip { reason } => write!(f, "SKIP: {reason}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum HotplugError {
    #[error("block device attach/detach request failed")]
    Operator(#[from] OperatorError),
    #[error("guest console command failed")]
    Console(#[from] ConsoleError),
}

/// The skip decision, taken once before any domain is created.
pub fn capability_verdict(mode: VirtMode) -> Option<Verdict> {
    if mode.supports_block_hotplug() {
        None
    } else {
        Some(Verdict::Skip {
            reason: format!("block hot-plug is not supported for {mode} guests"),
        })
    }
}

/// Whether the frontend identifier shows up in the guest's partition
/// listing. The listing is a table of device names, and the identifier may
/// be a prefix of a longer name (a device and its partitions share a
/// prefix), so this matches within each line rather than on whole lines.
pub fn device_visible(listing: &str, frontend: &str) -> bool {
    listing.lines().any(|line| line.contains(frontend))
}

/// Drive `iterations` attach/verify/detach/verify cycles, fail-fast.
///
/// Assertion mismatches produce `Verdict::Fail`; collaborator failures
/// (operator or console) propagate as errors and abort the run the same
/// way. Iterations after the first failure never execute.
pub fn run_attach_detach_loop(
    operator: &mut dyn BlockDeviceOperator,
    console: &mut dyn GuestConsole,
    binding: &BlockDeviceBinding,
    iterations: u32,
) -> Result<Verdict, HotplugError> {
    for iteration in 1..=iterations {
        info!(
            "iteration {iteration}/{iterations}: attach {} as {}",
            binding.backend, binding.frontend
        );
        operator.attach(binding)?;

        let listing = console.run_cmd(PARTITION_LIST_COMMAND)?;
        if !device_visible(&listing, &binding.frontend) {
            return Ok(Verdict::Fail {
                iteration,
                diagnostic: format!(
                    "attach did not become visible: '{}' missing from the guest partition listing",
                    binding.frontend
                ),
            });
        }

        operator.detach(&binding.frontend)?;

        let listing = console.run_cmd(PARTITION_LIST_COMMAND)?;
        if device_visible(&listing, &binding.frontend) {
            return Ok(Verdict::Fail {
                iteration,
                diagnostic: format!(
                    "detach did not take effect: '{}' still present in the guest partition listing",
                    binding.frontend
                ),
            });
        }
    }

    Ok(Verdict::Pass)
}
