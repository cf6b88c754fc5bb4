// Copyright © 2025 The Block Hotplug Test Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::io::Read;
use std::net::TcpStream;
use std::thread;

use ssh2::Session;
use thiserror::Error;

pub const DEFAULT_SSH_RETRIES: u8 = 6;
pub const DEFAULT_SSH_TIMEOUT: u8 = 10;

#[derive(Debug)]
pub struct PasswordAuth {
    pub username: String,
    pub password: String,
}

impl Default for PasswordAuth {
    fn default() -> Self {
        PasswordAuth {
            username: String::from("cloud"),
            password: String::from("cloud123"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConsoleError {
    #[error("connection to the guest failed")]
    Connection(#[source] std::io::Error),
    #[error("ssh handshake failed")]
    Handshake(#[source] ssh2::Error),
    #[error("ssh authentication failed")]
    Authentication(#[source] ssh2::Error),
    #[error("ssh channel session failed")]
    ChannelSession(#[source] ssh2::Error),
    #[error("command execution failed")]
    Command(#[source] ssh2::Error),
    #[error("retrieving the command exit status failed")]
    ExitStatus(#[source] ssh2::Error),
    #[error("the command exited with status {0}")]
    NonZeroExitStatus(i32),
}

/// One executed command and its captured output.
#[derive(Clone, Debug)]
pub struct CommandRecord {
    pub command: String,
    pub output: String,
}

/// Interactive session into a running guest. Commands are executed one at a
/// time over ssh and their output captured; when history saving is enabled
/// every command/output pair is recorded so it can be dumped on failure.
pub struct ConsoleSession {
    guest_ip: String,
    auth: PasswordAuth,
    retries: u8,
    timeout: u8,
    save_history: bool,
    history: Vec<CommandRecord>,
}

impl ConsoleSession {
    pub fn new(guest_ip: String, auth: PasswordAuth) -> Self {
        ConsoleSession {
            guest_ip,
            auth,
            retries: DEFAULT_SSH_RETRIES,
            timeout: DEFAULT_SSH_TIMEOUT,
            save_history: false,
            history: Vec::new(),
        }
    }

    pub fn set_history_save(&mut self, value: bool) {
        self.save_history = value;
    }

    pub fn history(&self) -> &[CommandRecord] {
        &self.history
    }

    pub fn run_cmd(&mut self, command: &str) -> Result<String, ConsoleError> {
        let output = self.exec(command)?;
        if self.save_history {
            self.history.push(CommandRecord {
                command: String::from(command),
                output: output.clone(),
            });
        }
        Ok(output)
    }

    // The guest's sshd may not be up yet right after boot, so connection
    // establishment is wrapped in a retry envelope with linear backoff. The
    // command itself is only ever executed once per successful connection.
    fn exec(&self, command: &str) -> Result<String, ConsoleError> {
        retry_with_backoff(self.retries, self.timeout, || {
            // Fresh output buffer per attempt, so a failed attempt cannot
            // leak partial output into a later one.
            let mut s = String::new();

            let tcp = TcpStream::connect(format!("{}:22", self.guest_ip))
                .map_err(ConsoleError::Connection)?;
            let mut sess = Session::new().unwrap();
            sess.set_tcp_stream(tcp);
            sess.handshake().map_err(ConsoleError::Handshake)?;

            sess.userauth_password(&self.auth.username, &self.auth.password)
                .map_err(ConsoleError::Authentication)?;
            assert!(sess.authenticated());

            let mut channel = sess
                .channel_session()
                .map_err(ConsoleError::ChannelSession)?;
            channel.exec(command).map_err(ConsoleError::Command)?;

            // Intentionally ignore these results here as their failure
            // does not precipitate a repeat
            let _ = channel.read_to_string(&mut s);
            let _ = channel.close();
            let _ = channel.wait_close();

            let status = channel.exit_status().map_err(ConsoleError::ExitStatus)?;

            if status != 0 {
                Err(ConsoleError::NonZeroExitStatus(status))
            } else {
                Ok(s)
            }
        })
        .map_err(|e| {
            eprintln!(
                "\n\n==== Start guest command output (FAILED) ====\n\n\
                 command=\"{command}\"\n\
                 guest_ip=\"{}\"\n\
                 error=\"{e:?}\"\n\
                 \n==== End guest command output ====\n\n",
                self.guest_ip
            );

            e
        })
    }
}

fn retry_with_backoff<F>(retries: u8, timeout: u8, mut attempt: F) -> Result<String, ConsoleError>
where
    F: FnMut() -> Result<String, ConsoleError>,
{
    let mut counter = 0;
    loop {
        match attempt() {
            Ok(output) => return Ok(output),
            Err(e) => {
                counter += 1;
                if counter >= retries {
                    return Err(e);
                }
            }
        }
        thread::sleep(std::time::Duration::new((timeout * counter).into(), 0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_opt_in() {
        let console = ConsoleSession::new(String::from("192.168.1.2"), PasswordAuth::default());
        assert!(!console.save_history);
        assert!(console.history().is_empty());
    }

    #[test]
    fn test_default_auth() {
        let auth = PasswordAuth::default();
        assert_eq!(auth.username, "cloud");
        assert_eq!(auth.password, "cloud123");
    }

    #[test]
    fn test_each_attempt_reports_only_its_own_output() {
        // An attempt that captured partial output before failing must not
        // see that output prepended to a later attempt's result.
        let mut attempts = 0;
        let output = retry_with_backoff(3, 0, || {
            attempts += 1;
            if attempts == 1 {
                // Output was read before the non-zero exit status surfaced;
                // the attempt's buffer dies with the attempt.
                let _partial = String::from("partial output before the failure\n");
                Err(ConsoleError::NonZeroExitStatus(1))
            } else {
                Ok(String::from("full listing\n"))
            }
        })
        .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(output, "full listing\n");
    }

    #[test]
    fn test_retry_gives_up_after_the_configured_attempts() {
        let mut attempts = 0;
        let err = retry_with_backoff(3, 0, || {
            attempts += 1;
            Err(ConsoleError::NonZeroExitStatus(attempts))
        })
        .unwrap_err();

        assert_eq!(attempts, 3);
        assert!(matches!(err, ConsoleError::NonZeroExitStatus(3)));
    }
}
