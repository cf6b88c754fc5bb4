// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt;
use std::fs;
use std::io;
use std::net::TcpListener;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::str::FromStr;
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use log::info;
use thiserror::Error;
use vmm_sys_util::tempdir::TempDir;
use wait_timeout::ChildExt;

use crate::console::{ConsoleSession, PasswordAuth};

pub const DEFAULT_BOOT_TIMEOUT: i32 = 120;

const DEFAULT_TCP_LISTENER_PORT: u16 = 8000;

/// How the guest is virtualized. Block-device hot-plug is only wired up for
/// paravirtualized guests; hardware-assisted guests make the whole test a
/// skip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirtMode {
    Paravirtualized,
    HardwareAssisted,
}

impl VirtMode {
    pub fn supports_block_hotplug(self) -> bool {
        matches!(self, VirtMode::Paravirtualized)
    }
}

impl fmt::Display for VirtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtMode::Paravirtualized => write!(f, "pv"),
            VirtMode::HardwareAssisted => write!(f, "hvm"),
        }
    }
}

impl FromStr for VirtMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pv" | "paravirt" | "paravirtualized" => Ok(VirtMode::Paravirtualized),
            "hvm" | "hardware" | "hardware-assisted" => Ok(VirtMode::HardwareAssisted),
            _ => Err(format!("unknown virtualization mode: {s}")),
        }
    }
}

#[derive(Error, Debug)]
pub enum WaitForBootError {
    #[error("failed to wait for epoll")]
    EpollWait(#[source] std::io::Error),
    #[error("failed to listen for boot")]
    Listen(#[source] std::io::Error),
    #[error("epoll wait timeout")]
    EpollWaitTimeout,
    #[error("wrong guest address")]
    WrongGuestAddr,
    #[error("failed to accept a TCP request")]
    Accept(#[source] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("failed to create the domain working directory")]
    TempDir(#[source] vmm_sys_util::errno::Error),
    #[error("failed to spawn the hypervisor")]
    Spawn(#[source] std::io::Error),
    #[error("waiting for the guest to boot failed")]
    WaitForBoot(#[source] WaitForBootError),
    #[error("connecting to the hypervisor API socket failed")]
    ApiConnect(#[source] std::io::Error),
    #[error("guest shutdown request failed")]
    ShutdownRequest(#[source] api_client::Error),
    #[error("the hypervisor did not exit after shutdown")]
    ShutdownTimeout,
    #[error("waiting for the hypervisor to exit failed")]
    Shutdown(#[source] std::io::Error),
}

/// Host/guest addressing for one domain, derived from the domain id so
/// concurrently running domains never collide.
pub struct GuestNetworkConfig {
    pub guest_ip: String,
    pub host_ip: String,
    pub guest_mac: String,
    pub tcp_listener_port: u16,
}

impl GuestNetworkConfig {
    fn new(id: u8) -> Self {
        GuestNetworkConfig {
            guest_ip: format!("192.168.{id}.2"),
            host_ip: format!("192.168.{id}.1"),
            guest_mac: format!("12:34:56:78:90:{id:02x}"),
            tcp_listener_port: DEFAULT_TCP_LISTENER_PORT + id as u16,
        }
    }

    /// Block until the guest phones home on the per-domain TCP port, or the
    /// timeout elapses. The guest image is provisioned to connect back to
    /// the host as its last boot step.
    pub fn wait_vm_boot(&self, custom_timeout: Option<i32>) -> Result<(), WaitForBootError> {
        // Listening on the wild-card ip avoids retrying on 'TcpListener::bind()'
        let listen_addr = format!("0.0.0.0:{}", self.tcp_listener_port);
        let expected_guest_addr = self.guest_ip.as_str();
        let timeout = custom_timeout.unwrap_or(DEFAULT_BOOT_TIMEOUT);

        let listener = TcpListener::bind(listen_addr.as_str()).map_err(WaitForBootError::Listen)?;
        listener
            .set_nonblocking(true)
            .expect("Cannot set non-blocking for tcp listener");

        // Rely on epoll w/ timeout to wait for guest connections faithfully
        let epoll_fd = epoll::create(true).expect("Cannot create epoll fd");
        // Use 'File' to enforce closing on 'epoll_fd'
        let _epoll_file = unsafe { fs::File::from_raw_fd(epoll_fd) };
        epoll::ctl(
            epoll_fd,
            epoll::ControlOptions::EPOLL_CTL_ADD,
            listener.as_raw_fd(),
            epoll::Event::new(epoll::Events::EPOLLIN, 0),
        )
        .expect("Cannot add 'tcp_listener' event to epoll");

        let mut events = [epoll::Event::new(epoll::Events::empty(), 0); 1];
        loop {
            let num_events = match epoll::wait(epoll_fd, timeout * 1000_i32, &mut events[..]) {
                Ok(num_events) => Ok(num_events),
                Err(e) => match e.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                    _ => Err(e),
                },
            }
            .map_err(WaitForBootError::EpollWait)?;
            if num_events == 0 {
                return Err(WaitForBootError::EpollWaitTimeout);
            }
            break;
        }

        match listener.accept() {
            Ok((_, addr)) => {
                if addr.ip() != std::net::IpAddr::from_str(expected_guest_addr).unwrap() {
                    return Err(WaitForBootError::WrongGuestAddr);
                }
                Ok(())
            }
            Err(e) => Err(WaitForBootError::Accept(e)),
        }
    }
}

/// Everything needed to boot one test guest.
pub struct DomainConfig {
    pub hypervisor_path: PathBuf,
    pub mode: VirtMode,
    pub kernel: PathBuf,
    pub cmdline: String,
    pub os_disk: PathBuf,
    pub cloudinit_disk: Option<PathBuf>,
    pub boot_timeout: Option<i32>,
}

impl DomainConfig {
    /// Defaults matching the provisioned images under `$HOME/workloads`.
    pub fn with_defaults(hypervisor_path: PathBuf, mode: VirtMode) -> Self {
        let mut workload_path = dirs::home_dir().unwrap();
        workload_path.push("workloads");

        DomainConfig {
            hypervisor_path,
            mode,
            kernel: workload_path.join("vmlinux"),
            cmdline: String::from("console=hvc0 root=/dev/vda1 rw"),
            os_disk: workload_path.join("focal-server-cloudimg-amd64.raw"),
            cloudinit_disk: Some(workload_path.join("cloudinit.img")),
            boot_timeout: None,
        }
    }
}

static NEXT_DOMAIN_ID: LazyLock<Mutex<u8>> = LazyLock::new(|| Mutex::new(1));

/// Opaque handle to a running guest. Owns the hypervisor child process; the
/// guest is force-killed on drop so no exit path can leak a running domain.
pub struct Domain {
    id: u8,
    mode: VirtMode,
    network: GuestNetworkConfig,
    api_socket_path: PathBuf,
    child: Option<Child>,
    _tmp_dir: TempDir,
}

impl Domain {
    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn mode(&self) -> VirtMode {
        self.mode
    }

    pub fn api_socket_path(&self) -> &Path {
        &self.api_socket_path
    }

    pub fn network(&self) -> &GuestNetworkConfig {
        &self.network
    }

    /// Open a console session into the guest. The session is only valid
    /// while the domain is running.
    pub fn console(&self) -> ConsoleSession {
        ConsoleSession::new(self.network.guest_ip.clone(), PasswordAuth::default())
    }

    /// Polite shutdown on the success path: ask the control plane to halt
    /// the guest cleanly, then reap the hypervisor process. Teardown on
    /// failure paths goes through `Drop` instead.
    pub fn stop(mut self) -> Result<(), DomainError> {
        let mut socket =
            UnixStream::connect(&self.api_socket_path).map_err(DomainError::ApiConnect)?;
        api_client::simple_api_command(&mut socket, "PUT", "shutdown", None)
            .map_err(DomainError::ShutdownRequest)?;

        if let Some(mut child) = self.child.take() {
            kill_child(&mut child);
            match child.wait_timeout(Duration::new(10, 0)) {
                Err(e) => return Err(DomainError::Shutdown(e)),
                Ok(None) => return Err(DomainError::ShutdownTimeout),
                Ok(Some(_)) => (),
            }
        }
        Ok(())
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            kill_child(&mut child);
            let _ = child.wait_timeout(Duration::new(10, 0));
        }
    }
}

/// Creates and boots test domains.
pub struct DomainController;

impl DomainController {
    pub fn start(config: &DomainConfig) -> Result<Domain, DomainError> {
        let id = {
            let mut guard = NEXT_DOMAIN_ID.lock().unwrap();
            let id = *guard;
            *guard = id + 1;
            id
        };

        let tmp_dir = TempDir::new_with_prefix("/tmp/bhp").map_err(DomainError::TempDir)?;
        let network = GuestNetworkConfig::new(id);
        let api_socket_path = tmp_dir.as_path().join("api.sock");

        let mut command = Command::new(&config.hypervisor_path);
        command
            .args(["--api-socket", api_socket_path.to_str().unwrap()])
            .args(["--kernel", config.kernel.to_str().unwrap()])
            .args(["--cmdline", config.cmdline.as_str()])
            .args([
                "--net",
                format!(
                    "tap=,mac={},ip={},mask=255.255.255.0",
                    network.guest_mac, network.host_ip
                )
                .as_str(),
            ]);

        command.args(["--disk", format!("path={}", config.os_disk.display()).as_str()]);
        if let Some(cloudinit_disk) = &config.cloudinit_disk {
            command.arg(format!("path={}", cloudinit_disk.display()));
        }

        info!("starting domain {id}: {command:?}");

        let child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(DomainError::Spawn)?;

        // From here on the child is owned by the domain, so an early return
        // below still tears the guest down.
        let domain = Domain {
            id,
            mode: config.mode,
            network,
            api_socket_path,
            child: Some(child),
            _tmp_dir: tmp_dir,
        };

        domain
            .network
            .wait_vm_boot(config.boot_timeout)
            .map_err(DomainError::WaitForBoot)?;

        Ok(domain)
    }
}

// SIGTERM first, SIGKILL only if the hypervisor does not wind down in time.
fn kill_child(child: &mut Child) {
    let r = unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };
    if r != 0 {
        let e = io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        eprintln!("Failed to kill child with SIGTERM: {e:?}");
    }

    // The timeout period elapsed without the child exiting
    if child.wait_timeout(Duration::new(10, 0)).unwrap().is_none() {
        let _ = child.kill();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixListener;
    use std::thread;

    use super::*;

    // Accepts one connection, answers 204 and hands back the raw request.
    fn fake_control_plane(listener: UnixListener) -> thread::JoinHandle<String> {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();

            let mut request = String::new();
            let mut buf = [0u8; 256];
            while !request.contains("\r\n\r\n") {
                let count = stream.read(&mut buf).unwrap();
                request.push_str(&String::from_utf8_lossy(&buf[..count]));
                if count == 0 {
                    break;
                }
            }

            stream
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .unwrap();

            request
        })
    }

    #[test]
    fn test_block_hotplug_capability() {
        assert!(VirtMode::Paravirtualized.supports_block_hotplug());
        assert!(!VirtMode::HardwareAssisted.supports_block_hotplug());
    }

    #[test]
    fn test_virt_mode_parsing() {
        assert_eq!("pv".parse::<VirtMode>().unwrap(), VirtMode::Paravirtualized);
        assert_eq!(
            "paravirtualized".parse::<VirtMode>().unwrap(),
            VirtMode::Paravirtualized
        );
        assert_eq!(
            "hvm".parse::<VirtMode>().unwrap(),
            VirtMode::HardwareAssisted
        );
        assert!("xen".parse::<VirtMode>().is_err());
    }

    #[test]
    fn test_virt_mode_round_trips_through_display() {
        for mode in [VirtMode::Paravirtualized, VirtMode::HardwareAssisted] {
            assert_eq!(mode.to_string().parse::<VirtMode>().unwrap(), mode);
        }
    }

    #[test]
    fn test_stop_requests_guest_shutdown_before_reaping() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/bhp").unwrap();
        let api_socket_path = tmp_dir.as_path().join("api.sock");
        let server = fake_control_plane(UnixListener::bind(&api_socket_path).unwrap());

        // A long-lived process stands in for the hypervisor; it only goes
        // away if `stop` reaps it.
        let child = Command::new("sleep").arg("60").spawn().unwrap();

        let domain = Domain {
            id: 0,
            mode: VirtMode::Paravirtualized,
            network: GuestNetworkConfig::new(0),
            api_socket_path,
            child: Some(child),
            _tmp_dir: tmp_dir,
        };

        domain.stop().unwrap();

        let request = server.join().unwrap();
        assert!(request.starts_with("PUT /api/v1/vm.shutdown HTTP/1.1\r\n"));
    }

    #[test]
    fn test_network_config_is_derived_from_id() {
        let network = GuestNetworkConfig::new(3);
        assert_eq!(network.guest_ip, "192.168.3.2");
        assert_eq!(network.host_ip, "192.168.3.1");
        assert_eq!(network.guest_mac, "12:34:56:78:90:03");
        assert_eq!(network.tcp_listener_port, DEFAULT_TCP_LISTENER_PORT + 3);
    }
}
