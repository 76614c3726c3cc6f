//! Remote command execution over SSH.
//!
//! Backends drive their hosts through a [`RemoteShell`]. The production
//! implementation spawns the system `ssh` client (wrapped in `sshpass` for
//! password logins); tests substitute [`mock::MockShell`].
//!
//! [`RemoteSession`] layers connection state on top of a shell: it probes the
//! host on connect, marks itself disconnected on transport failures, and
//! reconnects through [`RemoteSession::ensure_connection`].

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};
use virtfleet_store::Provider;

use crate::error::{truncate, ProviderError, Result};

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit code; `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// A failed result with the given stderr and exit code.
    #[must_use]
    pub fn failed(stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    /// Returns true if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert into stdout, or a classified error for a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Connectivity` when stderr describes a transport
    /// failure, `ProviderError::Command` otherwise.
    pub fn into_stdout(self, command: &str) -> Result<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            let detail = if self.stderr.trim().is_empty() {
                &self.stdout
            } else {
                &self.stderr
            };
            Err(ProviderError::command(command, self.exit_code, detail))
        }
    }
}

/// Something that can run a shell command on a provider host.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Run `command` and capture its output, failing if it exceeds `timeout`.
    ///
    /// A non-zero exit is reported in [`CommandOutput`], not as an error.
    ///
    /// # Errors
    ///
    /// Returns a connectivity or timeout error when the host cannot be reached.
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// SSH connection parameters for a provider host.
#[derive(Debug, Clone)]
pub struct SshTarget {
    /// Host name or address, without port.
    pub host: String,
    /// SSH port.
    pub port: u16,
    /// Login user.
    pub username: String,
    /// Password; used through `sshpass`.
    pub password: Option<String>,
    /// Private key path on the orchestrator host.
    pub private_key_path: Option<String>,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl SshTarget {
    /// Build the SSH target of a provider.
    #[must_use]
    pub fn for_provider(provider: &Provider) -> Self {
        Self {
            host: provider.endpoint_host().to_string(),
            port: provider.ssh_port,
            username: provider.username.clone(),
            password: provider.credentials.password.clone(),
            private_key_path: provider.credentials.private_key_path.clone(),
            connect_timeout: Duration::from_secs(provider.ssh_connect_timeout_secs.max(1)),
        }
    }
}

/// [`RemoteShell`] backed by the system OpenSSH client.
#[derive(Debug, Clone)]
pub struct SshShell {
    target: SshTarget,
}

/// OpenSSH exits with 255 when the connection itself failed.
const SSH_TRANSPORT_EXIT: i32 = 255;

impl SshShell {
    /// Create a shell for the given target.
    #[must_use]
    pub const fn new(target: SshTarget) -> Self {
        Self { target }
    }

    fn build_command(&self, command: &str) -> Command {
        let target = &self.target;
        let mut cmd = match &target.password {
            Some(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg("ssh").env("SSHPASS", password);
                cmd
            }
            None => Command::new("ssh"),
        };

        cmd.arg("-p")
            .arg(target.port.to_string())
            .args(["-o", "StrictHostKeyChecking=no"])
            .args(["-o", "UserKnownHostsFile=/dev/null"])
            .args(["-o", "LogLevel=ERROR"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", target.connect_timeout.as_secs().max(1)));

        if target.password.is_none() {
            cmd.args(["-o", "BatchMode=yes"]);
        }
        if let Some(key) = &target.private_key_path {
            cmd.arg("-i").arg(key);
        }

        cmd.arg(format!("{}@{}", target.username, target.host))
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        debug!(
            host = %self.target.host,
            command = %truncate(command, 200),
            "Executing remote command"
        );

        let output = tokio::time::timeout(timeout, self.build_command(command).output())
            .await
            .map_err(|_| ProviderError::Timeout {
                operation: format!("ssh command `{}`", truncate(command, 80)),
                secs: timeout.as_secs(),
            })?
            .map_err(|e| ProviderError::Connectivity(format!("failed to spawn ssh: {e}")))?;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };

        if result.exit_code == Some(SSH_TRANSPORT_EXIT) {
            return Err(ProviderError::Connectivity(format!(
                "ssh to {}:{} failed: {}",
                self.target.host,
                self.target.port,
                truncate(result.stderr.trim(), 300)
            )));
        }

        Ok(result)
    }
}

/// A shell plus connection state and the provider's command deadline.
pub struct RemoteSession {
    shell: Arc<dyn RemoteShell>,
    connected: AtomicBool,
    connect_timeout: Duration,
    execute_timeout: Duration,
}

impl RemoteSession {
    /// Create a session over `shell`.
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>, connect_timeout: Duration, execute_timeout: Duration) -> Self {
        Self {
            shell,
            connected: AtomicBool::new(false),
            connect_timeout,
            execute_timeout,
        }
    }

    /// Create an SSH session for a provider using its configured timeouts.
    #[must_use]
    pub fn for_provider(provider: &Provider) -> Self {
        let target = SshTarget::for_provider(provider);
        Self::new(
            Arc::new(SshShell::new(target)),
            Duration::from_secs(provider.ssh_connect_timeout_secs.max(1)),
            Duration::from_secs(provider.ssh_execute_timeout_secs.max(1)),
        )
    }

    /// The underlying shell, shared with the health checker.
    #[must_use]
    pub fn shell(&self) -> Arc<dyn RemoteShell> {
        Arc::clone(&self.shell)
    }

    /// Per-command deadline.
    #[must_use]
    pub const fn execute_timeout(&self) -> Duration {
        self.execute_timeout
    }

    /// Probe the host and mark the session connected.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the probe fails.
    pub async fn connect(&self) -> Result<()> {
        let probe = self
            .shell
            .run("echo ok", self.connect_timeout + Duration::from_secs(5))
            .await?;
        if !probe.success() {
            return Err(ProviderError::Connectivity(format!(
                "connection probe failed: {}",
                truncate(probe.stderr.trim(), 200)
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Mark the session disconnected.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Returns true if the last probe or command reached the host.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Reconnect if the session was never connected or has broken.
    ///
    /// # Errors
    ///
    /// Returns a connectivity error if the host cannot be reached.
    pub async fn ensure_connection(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        warn!("Remote session not connected, reconnecting");
        self.connect().await
    }

    /// Run a command and return its raw output.
    ///
    /// # Errors
    ///
    /// Returns a connectivity or timeout error when the host cannot be
    /// reached; the session is then marked disconnected.
    pub async fn run(&self, command: &str) -> Result<CommandOutput> {
        self.run_with_timeout(command, self.execute_timeout).await
    }

    /// Run a command with an explicit deadline, for long transfers.
    ///
    /// # Errors
    ///
    /// Same as [`RemoteSession::run`].
    pub async fn run_with_timeout(&self, command: &str, timeout: Duration) -> Result<CommandOutput> {
        match self.shell.run(command, timeout).await {
            Ok(output) => Ok(output),
            Err(e) => {
                if e.is_connectivity() {
                    self.disconnect();
                }
                Err(e)
            }
        }
    }

    /// Run a command and return its stdout, failing on a non-zero exit.
    ///
    /// # Errors
    ///
    /// Returns a classified error for transport failures and non-zero exits.
    pub async fn exec(&self, command: &str) -> Result<String> {
        let result = self.run(command).await?.into_stdout(command);
        if let Err(e) = &result {
            if e.is_connectivity() {
                self.disconnect();
            }
        }
        result
    }

    /// Run a command and report whether it exited with status 0.
    ///
    /// # Errors
    ///
    /// Returns an error only when the host cannot be reached.
    pub async fn succeeds(&self, command: &str) -> Result<bool> {
        Ok(self.run(command).await?.success())
    }
}

/// Quote a value for a POSIX shell.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// A scripted shell for testing without real hosts.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// A shell that records commands and answers from a script.
    ///
    /// Responses are matched by substring in registration order; unmatched
    /// commands succeed with empty output.
    #[derive(Default)]
    pub struct MockShell {
        commands: Mutex<Vec<String>>,
        responses: Mutex<Vec<(String, CommandOutput)>>,
        transient_failures: AtomicUsize,
        offline: AtomicBool,
    }

    impl MockShell {
        /// Create a new mock shell.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer commands containing `pattern` with `stdout`.
        pub fn respond(&self, pattern: &str, stdout: &str) {
            self.responses
                .lock()
                .push((pattern.to_string(), CommandOutput::ok(stdout)));
        }

        /// Fail commands containing `pattern` with `stderr` and `exit_code`.
        pub fn respond_failure(&self, pattern: &str, stderr: &str, exit_code: i32) {
            self.responses
                .lock()
                .push((pattern.to_string(), CommandOutput::failed(stderr, exit_code)));
        }

        /// Fail the next `count` commands with a connection reset.
        pub fn fail_next(&self, count: usize) {
            self.transient_failures.store(count, Ordering::SeqCst);
        }

        /// Refuse every command until set back to false.
        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// All commands run so far.
        #[must_use]
        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }

        /// Commands containing `pattern`.
        #[must_use]
        pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
            self.commands
                .lock()
                .iter()
                .filter(|c| c.contains(pattern))
                .cloned()
                .collect()
        }

        /// Forget recorded commands.
        pub fn clear_commands(&self) {
            self.commands.lock().clear();
        }
    }

    #[async_trait]
    impl RemoteShell for MockShell {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
            self.commands.lock().push(command.to_string());

            if self.offline.load(Ordering::SeqCst) {
                return Err(ProviderError::Connectivity("connection refused".to_string()));
            }
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ProviderError::Connectivity(
                    "connection reset by peer".to_string(),
                ));
            }

            let responses = self.responses.lock();
            Ok(responses
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map_or_else(|| CommandOutput::ok(""), |(_, output)| output.clone()))
        }
    }
}
