//! SSH transport built on `russh`.
//!
//! The connection is opened lazily on first use, reused for every command on
//! the same client, and released by [`RemoteSession::close`]. Connecting and
//! authenticating share one deadline.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::agent::client::AgentClient;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::terminal::{self, RawModeGuard, write_flush};
use super::{CommandOutput, RemoteError, RemoteFuture, RemoteSession, TtyOptions, pump};
use crate::credentials::{CredentialError, Signer};

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default login user for cloud images.
pub const DEFAULT_SSH_USER: &str = "ubuntu";
/// Default bound on connecting plus authenticating.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const INPUT_QUEUE: usize = 32;

/// Raised when a host key policy string cannot be parsed.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid host key fingerprint '{0}': expected the SHA256:... form printed by ssh-keygen -l")]
pub struct HostKeyPolicyError(pub String);

/// How server host keys are verified.
///
/// Ephemeral VMs have no persisted known-hosts entry, so [`AcceptAny`]
/// is the default. [`Pinned`] accepts only the listed SHA-256 fingerprints.
///
/// [`AcceptAny`]: HostKeyPolicy::AcceptAny
/// [`Pinned`]: HostKeyPolicy::Pinned
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents.
    #[default]
    AcceptAny,
    /// Accept only these fingerprints.
    Pinned(Vec<String>),
}

impl HostKeyPolicy {
    /// Returns `true` when a key with `fingerprint` is acceptable.
    #[must_use]
    pub fn accepts_fingerprint(&self, fingerprint: &str) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned(allowed) => allowed.iter().any(|pinned| pinned == fingerprint),
        }
    }

    fn accepts(&self, key: &PublicKey) -> bool {
        match self {
            Self::AcceptAny => true,
            Self::Pinned(_) => {
                self.accepts_fingerprint(&key.fingerprint(HashAlg::Sha256).to_string())
            }
        }
    }
}

impl FromStr for HostKeyPolicy {
    type Err = HostKeyPolicyError;

    /// Parses a comma-separated fingerprint list; an empty list means
    /// [`HostKeyPolicy::AcceptAny`].
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let pinned = value
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                if entry.starts_with("SHA256:") {
                    Ok(entry.to_owned())
                } else {
                    Err(HostKeyPolicyError(entry.to_owned()))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        if pinned.is_empty() {
            Ok(Self::AcceptAny)
        } else {
            Ok(Self::Pinned(pinned))
        }
    }
}

/// Connection settings for [`SshClient`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshSettings {
    /// Login user.
    pub user: String,
    /// Server port.
    pub port: u16,
    /// Bound on connecting plus authenticating.
    pub connect_timeout: Duration,
    /// Host key verification policy.
    pub host_keys: HostKeyPolicy,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: DEFAULT_SSH_USER.to_owned(),
            port: DEFAULT_SSH_PORT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_keys: HostKeyPolicy::default(),
        }
    }
}

impl SshSettings {
    /// Returns a copy targeting `port`.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

struct ClientHandler {
    host: String,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let accepted = self.policy.accepts(server_public_key);
        if !accepted {
            warn!(
                host = %self.host,
                fingerprint = %server_public_key.fingerprint(HashAlg::Sha256),
                "host key is not pinned; refusing connection"
            );
        }
        Ok(accepted)
    }
}

/// SSH client for one host.
pub struct SshClient {
    host: String,
    settings: SshSettings,
    signer: Signer,
    handle: Mutex<Option<Handle<ClientHandler>>>,
    closed: AtomicBool,
}

impl fmt::Debug for SshClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshClient")
            .field("host", &self.host)
            .field("settings", &self.settings)
            .field("identity", &self.signer.identity().fingerprint)
            .finish_non_exhaustive()
    }
}

impl SshClient {
    /// Creates a client; nothing is connected until first use.
    #[must_use]
    pub fn new(host: impl Into<String>, settings: SshSettings, signer: Signer) -> Self {
        Self {
            host: host.into(),
            settings,
            signer,
            handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    fn target(&self) -> String {
        format!("{}@{}:{}", self.settings.user, self.host, self.settings.port)
    }

    /// Connects and authenticates unless already connected.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Timeout`] when the connection timeout elapses,
    /// [`RemoteError::Connect`] or [`RemoteError::Auth`] when the server
    /// refuses, and [`RemoteError::Closed`] after [`RemoteSession::close`].
    pub async fn connect(&self) -> Result<(), RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }
        let mut slot = self.handle.lock().await;
        if slot.is_none() {
            *slot = Some(self.establish().await?);
        }
        Ok(())
    }

    async fn establish(&self) -> Result<Handle<ClientHandler>, RemoteError> {
        let config = Arc::new(client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..client::Config::default()
        });
        let handler = ClientHandler {
            host: self.host.clone(),
            policy: self.settings.host_keys.clone(),
        };
        let attempt = async {
            let mut handle = client::connect(
                config,
                (self.host.as_str(), self.settings.port),
                handler,
            )
            .await
            .map_err(|err| RemoteError::Connect {
                target: self.target(),
                message: err.to_string(),
            })?;
            if !authenticate(&mut handle, &self.signer, &self.settings.user).await? {
                return Err(RemoteError::Auth {
                    user: self.settings.user.clone(),
                    target: self.target(),
                });
            }
            Ok(handle)
        };

        let handle = timeout(self.settings.connect_timeout, attempt)
            .await
            .map_err(|_| RemoteError::Timeout {
                target: self.target(),
                seconds: self.settings.connect_timeout.as_secs(),
            })??;
        info!(target = %self.target(), identity = %self.signer.identity(), "ssh session established");
        Ok(handle)
    }

    async fn open_channel(&self) -> Result<Channel<client::Msg>, RemoteError> {
        self.connect().await?;
        let slot = self.handle.lock().await;
        let handle = slot.as_ref().ok_or(RemoteError::Closed)?;
        handle
            .channel_open_session()
            .await
            .map_err(|err| channel_failed(&err, CommandOutput::default()))
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut channel = self.open_channel().await?;
        debug!(target = %self.target(), command, "running remote command");
        channel
            .exec(true, command)
            .await
            .map_err(|err| channel_failed(&err, CommandOutput::default()))?;
        collect_output(&mut channel).await
    }

    async fn interactive(&self, tty: &TtyOptions) -> Result<Option<i32>, RemoteError> {
        let channel = self.open_channel().await?;
        channel
            .request_pty(
                false,
                &tty.term,
                u32::from(tty.cols),
                u32::from(tty.rows),
                0,
                0,
                &[],
            )
            .await
            .map_err(|err| channel_failed(&err, CommandOutput::default()))?;
        channel
            .request_shell(true)
            .await
            .map_err(|err| channel_failed(&err, CommandOutput::default()))?;

        let _raw = RawModeGuard::enable()?;
        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let resizes = terminal::watch_resizes(cancel.clone());
        pump::run_duplex(
            pump::forward_stdin(input_tx),
            pump_channel(channel, input_rx, resizes),
            cancel,
        )
        .await
    }

    async fn shutdown(&self) -> Result<(), RemoteError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let taken = self.handle.lock().await.take();
        if let Some(handle) = taken {
            handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
                .map_err(|err| RemoteError::Connect {
                    target: self.target(),
                    message: err.to_string(),
                })?;
            debug!(target = %self.target(), "ssh session closed");
        }
        Ok(())
    }
}

impl RemoteSession for SshClient {
    fn run_command<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, CommandOutput> {
        Box::pin(self.exec(command))
    }

    fn run_interactive<'a>(&'a self, tty: &'a TtyOptions) -> RemoteFuture<'a, Option<i32>> {
        Box::pin(self.interactive(tty))
    }

    fn close(&self) -> RemoteFuture<'_, ()> {
        Box::pin(self.shutdown())
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    signer: &Signer,
    user: &str,
) -> Result<bool, RemoteError> {
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|err| RemoteError::Connect {
            target: user.to_owned(),
            message: err.to_string(),
        })?
        .flatten();

    let result = match signer {
        Signer::Agent { endpoint, identity } => {
            let agent_error = |message: String| CredentialError::Agent {
                endpoint: endpoint.to_string(),
                message,
            };
            let key = PublicKey::from_openssh(&identity.public_key)
                .map_err(|err| agent_error(err.to_string()))?;
            let mut agent = AgentClient::connect_uds(endpoint.path.as_std_path())
                .await
                .map_err(|err| agent_error(err.to_string()))?;
            handle
                .authenticate_publickey_with(user, key, hash_alg, &mut agent)
                .await
                .map_err(|err| agent_error(err.to_string()))?
        }
        Signer::KeyFile { path, .. } => {
            let key_error = |message: String| CredentialError::KeyFile {
                path: path.clone(),
                message,
            };
            let key = load_secret_key(path.as_std_path(), None)
                .map_err(|err| key_error(err.to_string()))?;
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
                .map_err(|err| key_error(err.to_string()))?
        }
    };
    Ok(result.success())
}

fn channel_failed(err: &russh::Error, partial: CommandOutput) -> RemoteError {
    RemoteError::Channel {
        message: err.to_string(),
        partial: Box::new(partial),
    }
}

async fn collect_output(channel: &mut Channel<client::Msg>) -> Result<CommandOutput, RemoteError> {
    let mut output = CommandOutput::default();
    while let Some(message) = channel.wait().await {
        match message {
            ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, .. } => output.stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => {
                output.exit_code = i32::try_from(exit_status).ok();
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                return Err(RemoteError::Channel {
                    message: format!("remote command terminated by signal {signal_name:?}"),
                    partial: Box::new(output),
                });
            }
            _ => {}
        }
    }
    Ok(output)
}

async fn relay_message(
    message: Option<ChannelMsg>,
    exit_code: &mut Option<i32>,
) -> Result<bool, RemoteError> {
    match message {
        Some(ChannelMsg::Data { data }) => write_flush(&mut tokio::io::stdout(), &data).await?,
        Some(ChannelMsg::ExtendedData { data, .. }) => {
            write_flush(&mut tokio::io::stderr(), &data).await?;
        }
        Some(ChannelMsg::ExitStatus { exit_status }) => {
            *exit_code = i32::try_from(exit_status).ok();
        }
        Some(ChannelMsg::Close) | None => return Ok(true),
        Some(_) => {}
    }
    Ok(false)
}

async fn pump_channel(
    mut channel: Channel<client::Msg>,
    mut input: mpsc::Receiver<Vec<u8>>,
    mut resizes: mpsc::Receiver<(u16, u16)>,
) -> Result<Option<i32>, RemoteError> {
    let mut exit_code = None;
    loop {
        tokio::select! {
            message = channel.wait() => {
                if relay_message(message, &mut exit_code).await? {
                    return Ok(exit_code);
                }
            }
            Some(bytes) = input.recv() => {
                channel
                    .data(bytes.as_slice())
                    .await
                    .map_err(|err| channel_failed(&err, CommandOutput::default()))?;
            }
            Some((cols, rows)) = resizes.recv() => {
                channel
                    .window_change(u32::from(cols), u32::from(rows), 0, 0)
                    .await
                    .map_err(|err| channel_failed(&err, CommandOutput::default()))?;
            }
        }
    }
}
