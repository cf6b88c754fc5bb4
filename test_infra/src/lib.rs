// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Harness plumbing for the block hot-plug regression test: domain
//! lifecycle, guest console access and the attach/detach verification loop.

mod console;
mod domain;
mod hotplug;

pub use console::{
    CommandRecord, ConsoleError, ConsoleSession, PasswordAuth, DEFAULT_SSH_RETRIES,
    DEFAULT_SSH_TIMEOUT,
};
pub use domain::{
    Domain, DomainConfig, DomainController, DomainError, GuestNetworkConfig, VirtMode,
    WaitForBootError, DEFAULT_BOOT_TIMEOUT,
};
pub use hotplug::{
    capability_verdict, device_visible, run_attach_detach_loop, ApiBlockDeviceOperator,
    BackendKind, BackendSpec, BlockDeviceBinding, BlockDeviceOperator, GuestConsole, HotplugError,
    OperatorError, ParseBackendError, Verdict, DEFAULT_ITERATIONS, PARTITION_LIST_COMMAND,
};
