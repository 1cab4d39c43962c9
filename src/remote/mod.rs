//! Remote command execution against provisioned VMs.
//!
//! Two transports implement [`RemoteSession`]: native SSH ([`ssh`]) and the
//! message-framed WebSocket exec protocol ([`websocket`]). A provider
//! describes which one reaches a VM through [`RemoteAccess`], and a
//! [`SessionConnector`] turns that description into a live channel.

pub mod reachability;
mod pump;
pub mod ssh;
pub mod terminal;
pub mod websocket;

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

use crate::credentials::{CredentialError, CredentialResolver};
use ssh::{SshClient, SshSettings};
use websocket::WsClient;

const HTTPS_PORT: u16 = 443;

/// Which transport reaches a VM.
#[derive(Clone, Eq, PartialEq)]
pub enum RemoteAccess {
    /// Plain SSH to `host:port`.
    Ssh {
        /// Address of the VM.
        host: String,
        /// SSH port.
        port: u16,
    },
    /// WebSocket exec endpoint of a backend without plain SSH.
    WebSocket(WsTarget),
}

impl RemoteAccess {
    /// Host and port used by the readiness check.
    #[must_use]
    pub fn reachability_target(&self) -> (&str, u16) {
        match self {
            Self::Ssh { host, port } => (host.as_str(), *port),
            Self::WebSocket(target) => (target.host.as_str(), HTTPS_PORT),
        }
    }

    /// Returns `true` for SSH-reachable VMs.
    #[must_use]
    pub const fn is_ssh(&self) -> bool {
        matches!(self, Self::Ssh { .. })
    }
}

impl fmt::Debug for RemoteAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh { host, port } => f
                .debug_struct("Ssh")
                .field("host", host)
                .field("port", port)
                .finish(),
            Self::WebSocket(target) => f.debug_tuple("WebSocket").field(target).finish(),
        }
    }
}

/// Location and credentials of a WebSocket exec endpoint, reached at
/// `wss://<host>/<path>/<name>/exec`.
#[derive(Clone, Eq, PartialEq)]
pub struct WsTarget {
    /// API host, without scheme.
    pub host: String,
    /// Path prefix in front of the VM name.
    pub path: String,
    /// Name of the VM on the backend.
    pub name: String,
    /// Bearer token sent in the `Authorization` header.
    pub token: String,
    /// Erase the current terminal line when the first frame is a control
    /// frame.
    pub clear_first_control_line: bool,
}

impl fmt::Debug for WsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsTarget")
            .field("host", &self.host)
            .field("path", &self.path)
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("clear_first_control_line", &self.clear_first_control_line)
            .finish()
    }
}

/// Output collected from a non-interactive command.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Remote exit status, when the remote reported one.
    pub exit_code: Option<i32>,
    /// Bytes written to standard output.
    pub stdout: Vec<u8>,
    /// Bytes written to standard error. WebSocket transports interleave both
    /// streams into `stdout`.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Returns `true` when the command exited with status zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.exit_code, Some(0))
    }

    /// Standard output decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error decoded lossily as UTF-8.
    #[must_use]
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Pseudo-terminal parameters for interactive sessions.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TtyOptions {
    /// Terminal type advertised to the remote (`TERM`).
    pub term: String,
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl TtyOptions {
    /// Options matching the local terminal.
    #[must_use]
    pub fn from_terminal() -> Self {
        let (cols, rows) = terminal::current_size();
        let term = std::env::var("TERM")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| String::from("xterm-256color"));
        Self { term, cols, rows }
    }
}

/// Errors raised by remote sessions.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Raised when the transport cannot be established.
    #[error("failed to connect to {target}: {message}")]
    Connect {
        /// Host or URL being connected to.
        target: String,
        /// Underlying error message.
        message: String,
    },
    /// Raised when connecting or authenticating exceeds the connection
    /// timeout.
    #[error("connection to {target} timed out after {seconds}s")]
    Timeout {
        /// Host or URL being connected to.
        target: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
    /// Raised when the server rejects every offered key.
    #[error("authentication as {user} failed on {target}")]
    Auth {
        /// Login user.
        user: String,
        /// Host being connected to.
        target: String,
    },
    /// Raised when no signer can be obtained.
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    /// Raised when the channel fails mid-stream. Output already received is
    /// preserved.
    #[error("remote channel failed: {message}")]
    Channel {
        /// Underlying error message.
        message: String,
        /// Output streamed before the failure.
        partial: Box<CommandOutput>,
    },
    /// Raised when the WebSocket peer closes with a non-normal code.
    #[error("remote closed the session with code {code}: {reason}")]
    AbnormalClose {
        /// Close code sent by the peer.
        code: u16,
        /// Close reason sent by the peer.
        reason: String,
        /// Output streamed before the close.
        partial: Box<CommandOutput>,
    },
    /// Raised when the local terminal cannot be configured.
    #[error("terminal error: {0}")]
    Terminal(String),
    /// Raised when the session has already been closed.
    #[error("remote session already closed")]
    Closed,
}

impl RemoteError {
    /// Output streamed before a mid-stream failure, if any.
    #[must_use]
    pub fn partial_output(&self) -> Option<&CommandOutput> {
        match self {
            Self::Channel { partial, .. } | Self::AbnormalClose { partial, .. } => Some(&**partial),
            _ => None,
        }
    }
}

/// Future returned by remote session operations.
pub type RemoteFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RemoteError>> + Send + 'a>>;

/// Command and interactive execution against one VM.
pub trait RemoteSession: Send + Sync {
    /// Runs `command` and collects its output.
    fn run_command<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, CommandOutput>;

    /// Runs an interactive shell bound to the local terminal and returns the
    /// remote exit status.
    fn run_interactive<'a>(&'a self, tty: &'a TtyOptions) -> RemoteFuture<'a, Option<i32>>;

    /// Releases the channel. Safe to call more than once and concurrently;
    /// only the first call closes the transport.
    fn close(&self) -> RemoteFuture<'_, ()>;
}

/// Opens a [`RemoteSession`] for a [`RemoteAccess`] description.
pub trait SessionConnector: Send + Sync {
    /// Opens a session reaching `access`.
    fn open<'a>(&'a self, access: &'a RemoteAccess) -> RemoteFuture<'a, Box<dyn RemoteSession>>;

    /// Public key (OpenSSH text) of the identity this connector
    /// authenticates with, used for provider key upload.
    fn public_key(&self) -> RemoteFuture<'_, Option<String>>;
}

/// Production connector: SSH through the credential resolver, WebSocket
/// through the target's bearer token.
#[derive(Debug)]
pub struct TransportConnector {
    settings: SshSettings,
    resolver: CredentialResolver,
    fingerprint: Option<String>,
}

impl TransportConnector {
    /// Creates a connector authenticating as `fingerprint` (or the first
    /// identity found when `None`).
    #[must_use]
    pub const fn new(
        settings: SshSettings,
        resolver: CredentialResolver,
        fingerprint: Option<String>,
    ) -> Self {
        Self {
            settings,
            resolver,
            fingerprint,
        }
    }
}

impl SessionConnector for TransportConnector {
    fn open<'a>(&'a self, access: &'a RemoteAccess) -> RemoteFuture<'a, Box<dyn RemoteSession>> {
        Box::pin(async move {
            match access {
                RemoteAccess::Ssh { host, port } => {
                    let signer = self.resolver.get_signer(self.fingerprint.as_deref()).await?;
                    let settings = self.settings.clone().with_port(*port);
                    let client = SshClient::new(host.clone(), settings, signer);
                    client.connect().await?;
                    Ok(Box::new(client) as Box<dyn RemoteSession>)
                }
                RemoteAccess::WebSocket(target) => Ok(Box::new(WsClient::new(
                    target.clone(),
                    self.settings.connect_timeout,
                )) as Box<dyn RemoteSession>),
            }
        })
    }

    fn public_key(&self) -> RemoteFuture<'_, Option<String>> {
        Box::pin(async move {
            let signer = self.resolver.get_signer(self.fingerprint.as_deref()).await?;
            Ok(Some(signer.identity().public_key.clone()))
        })
    }
}
