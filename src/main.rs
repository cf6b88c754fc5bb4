// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

// Test driver for the repeated block-device attach/detach regression: boot a
// guest, then prove that every attach becomes visible in the guest's
// partition table and every detach stops being visible, for a fixed number
// of cycles.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use log::{debug, error, info};
use test_infra::{
    capability_verdict, run_attach_detach_loop, ApiBlockDeviceOperator, BackendSpec,
    BlockDeviceBinding, ConsoleError, ConsoleSession, DomainConfig, DomainController, DomainError,
    HotplugError, Verdict, VirtMode, DEFAULT_ITERATIONS,
};
use thiserror::Error;

const EXIT_PASS: i32 = 0;
const EXIT_FAIL: i32 = 1;
// Automake convention for a skipped test.
const EXIT_SKIP: i32 = 77;

#[derive(Error, Debug)]
enum Error {
    #[error("failed to start the test domain")]
    DomainStart(#[source] DomainError),
    #[error("failed to stop the test domain")]
    DomainStop(#[source] DomainError),
    #[error("guest console is not responding")]
    ConsoleProbe(#[source] ConsoleError),
    #[error("attach/detach cycle failed")]
    Hotplug(#[from] HotplugError),
}

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Repeatedly attach and detach a block device to a running guest \
             and verify each transition through the guest's partition table"
)]
struct Options {
    /// Number of attach/detach cycles to run
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    iterations: u32,

    /// Backend resource to attach, as '<kind>:<name>' (e.g. 'phy:ram1')
    #[arg(long, default_value = "phy:ram1")]
    backend: BackendSpec,

    /// Device name the guest is expected to see the backend as
    #[arg(long, default_value = "xvda1")]
    frontend: String,

    /// Virtualization mode of the guest under test ('pv' or 'hvm')
    #[arg(long, default_value_t = VirtMode::Paravirtualized)]
    mode: VirtMode,

    /// Hypervisor binary used to run the guest
    #[arg(long, default_value = "cloud-hypervisor")]
    hypervisor: PathBuf,

    /// Guest kernel image (defaults to $HOME/workloads/vmlinux)
    #[arg(long)]
    kernel: Option<PathBuf>,

    /// Guest OS disk image (defaults to the workloads image)
    #[arg(long)]
    disk: Option<PathBuf>,

    /// Guest boot timeout in seconds
    #[arg(long)]
    boot_timeout: Option<i32>,
}

fn domain_config(opts: &Options) -> DomainConfig {
    let mut config = DomainConfig::with_defaults(opts.hypervisor.clone(), opts.mode);
    if let Some(kernel) = &opts.kernel {
        config.kernel = kernel.clone();
    }
    if let Some(disk) = &opts.disk {
        config.os_disk = disk.clone();
    }
    config.boot_timeout = opts.boot_timeout;
    config
}

fn dump_history(console: &ConsoleSession) {
    for record in console.history() {
        debug!("guest> {}\n{}", record.command, record.output);
    }
}

fn run(opts: &Options) -> Result<Verdict, Error> {
    // Decided once, before any resource is acquired.
    if let Some(verdict) = capability_verdict(opts.mode) {
        return Ok(verdict);
    }

    let domain = DomainController::start(&domain_config(opts)).map_err(Error::DomainStart)?;
    info!("domain {} is up ({} mode)", domain.id(), domain.mode());

    let mut console = domain.console();
    console.set_history_save(true);

    // A command that cannot run at all is a setup failure, not an assertion
    // failure, so probe the console before the first cycle.
    if let Err(e) = console.run_cmd("ls") {
        dump_history(&console);
        return Err(Error::ConsoleProbe(e));
    }

    let binding = BlockDeviceBinding {
        backend: opts.backend.clone(),
        frontend: opts.frontend.clone(),
    };
    let mut operator = ApiBlockDeviceOperator::new(domain.api_socket_path());

    let verdict = match run_attach_detach_loop(
        &mut operator,
        &mut console,
        &binding,
        opts.iterations,
    ) {
        Ok(verdict) => verdict,
        Err(e) => {
            dump_history(&console);
            // The domain is dropped here, which tears the guest down.
            return Err(e.into());
        }
    };

    if let Verdict::Fail { .. } = &verdict {
        dump_history(&console);
    }

    domain.stop().map_err(Error::DomainStop)?;
    Ok(verdict)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opts = Options::parse();

    let code = match run(&opts) {
        Ok(verdict) => {
            println!("{verdict}");
            match verdict {
                Verdict::Pass => EXIT_PASS,
                Verdict::Fail { .. } => EXIT_FAIL,
                Verdict::Skip { .. } => EXIT_SKIP,
            }
        }
        Err(e) => {
            error!("{e}");
            let mut source = e.source();
            while let Some(cause) = source {
                error!("caused by: {cause}");
                source = cause.source();
            }
            EXIT_FAIL
        }
    };

    exit(code);
}
