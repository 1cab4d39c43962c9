//! Session orchestration: provisioning, remote access and teardown.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::console::{ConsoleAlias, ConsoleRegistry};
use super::reconcile::{self, ProviderFailure};
use super::store::{SessionStore, StoreError};
use super::{Session, SessionError, SessionStatus};
use crate::cloud_init::{first_boot_command, wait_for_boot_command};
use crate::config::DrydockConfig;
use crate::provider::{CreateRequest, Provider, ProviderRegistry, Vm};
use crate::remote::{CommandOutput, RemoteAccess, SessionConnector, TtyOptions};

/// Name under which the operator's public key is registered with providers
/// that manage keys.
const MANAGED_KEY_NAME: &str = "drydock";

/// Tunables for [`SessionManager`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ManagerSettings {
    /// Deadline for a VM to become reachable after creation.
    pub wait_timeout: Duration,
    /// Login user written into console aliases.
    pub ssh_user: String,
}

impl ManagerSettings {
    /// Settings taken from the loaded configuration.
    #[must_use]
    pub fn from_config(config: &DrydockConfig) -> Self {
        Self {
            wait_timeout: config.wait_timeout(),
            ssh_user: config.ssh_user.clone(),
        }
    }
}

/// A session recorded by [`SessionManager::create`] and the background task
/// provisioning it.
#[derive(Debug)]
pub struct Provisioning {
    /// The record as first saved, in [`SessionStatus::Provisioning`].
    pub session: Session,
    /// Resolves to the final record once provisioning settles.
    pub handle: JoinHandle<Result<Session, SessionError>>,
}

/// Result of [`SessionManager::list`].
#[derive(Clone, Debug, Default)]
pub struct SessionListing {
    /// Every record, reconciled where its provider could be consulted.
    pub sessions: Vec<Session>,
    /// Providers that could not be consulted.
    pub failures: Vec<ProviderFailure>,
}

/// Drives the lifecycle of sessions.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn SessionStore>,
    connector: Arc<dyn SessionConnector>,
    console: Arc<ConsoleRegistry>,
    settings: ManagerSettings,
    cancel: CancellationToken,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("registry", &self.registry)
            .field("console", &self.console.path())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Creates a manager over the given collaborators.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn SessionStore>,
        connector: Arc<dyn SessionConnector>,
        console: Arc<ConsoleRegistry>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            registry,
            store,
            connector,
            console,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelling every in-flight readiness wait.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records a new session and starts provisioning it in the background.
    ///
    /// The record is saved before this returns, so a second call with the
    /// same name fails even while the first is still provisioning.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Request`] for an invalid request,
    /// [`SessionError::Registry`] for an unknown provider and
    /// [`SessionError::Duplicate`] when the name is taken.
    pub async fn create(
        &self,
        request: CreateRequest,
        provider_name: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Provisioning, SessionError> {
        request.validate()?;
        let provider = self.registry.resolve(provider_name)?;
        let mut session = Session::provisioning(&request.name, provider_name);
        session.expires_at = expires_at;
        self.store.insert(&session).await.map_err(|err| match err {
            StoreError::Duplicate(name) => SessionError::Duplicate(name),
            other => SessionError::Store(other),
        })?;
        info!(session = %session.id, provider = provider_name, "session recorded");

        let manager = self.clone();
        let pending = session.clone();
        let handle =
            tokio::spawn(async move { manager.provision(provider, request, pending).await });
        Ok(Provisioning { session, handle })
    }

    async fn provision(
        &self,
        provider: Arc<dyn Provider>,
        request: CreateRequest,
        mut session: Session,
    ) -> Result<Session, SessionError> {
        match self.bring_up(provider.as_ref(), &request, &mut session).await {
            Ok(()) => {
                session.status = SessionStatus::Running;
                self.store.save(&session).await?;
                info!(session = %session.id, address = %session.address, "session running");
                Ok(session)
            }
            Err(err) => {
                warn!(session = %session.id, error = %err, "provisioning failed");
                if let Some(vm_id) = session.vm_id.as_deref()
                    && let Err(cleanup) = provider.delete(vm_id).await
                {
                    warn!(session = %session.id, vm = vm_id, error = %cleanup, "cleanup failed");
                }
                session.status = SessionStatus::Failed;
                session.failure = Some(err.to_string());
                self.store.save(&session).await?;
                Err(err)
            }
        }
    }

    async fn bring_up(
        &self,
        provider: &dyn Provider,
        request: &CreateRequest,
        session: &mut Session,
    ) -> Result<(), SessionError> {
        let keyed = self.with_managed_key(provider, request).await?;
        let created = provider.create(&keyed).await?;
        session.vm_id = Some(created.id.clone());
        session.address.clone_from(&created.address);
        self.store.save(session).await?;

        let ready = provider
            .wait_ready(&created.id, self.settings.wait_timeout, &self.cancel)
            .await?;
        session.address.clone_from(&ready.address);
        self.after_boot(provider, request, session, &ready).await
    }

    async fn with_managed_key(
        &self,
        provider: &dyn Provider,
        request: &CreateRequest,
    ) -> Result<CreateRequest, SessionError> {
        let Some(keys) = provider.key_manager() else {
            return Ok(request.clone());
        };
        if request.key_id.is_some() {
            return Ok(request.clone());
        }
        let Some(public_key) = self.connector.public_key().await? else {
            return Ok(request.clone());
        };
        let key_id = keys.ensure_key(MANAGED_KEY_NAME, &public_key).await?;
        Ok(request.with_key_id(key_id))
    }

    async fn after_boot(
        &self,
        provider: &dyn Provider,
        request: &CreateRequest,
        session: &Session,
        vm: &Vm,
    ) -> Result<(), SessionError> {
        let access = provider.access(vm);
        if let Some(payload) = request.user_data.as_deref() {
            let (step, command) = if provider.applies_user_data() {
                ("cloud-init", wait_for_boot_command())
            } else {
                ("first-boot", first_boot_command(payload))
            };
            let output = self.run_on(&access, &command).await?;
            if !output.is_success() {
                return Err(SessionError::BootStep {
                    id: session.id.clone(),
                    step,
                    exit_code: output.exit_code,
                    stderr: output.stderr_lossy(),
                });
            }
            info!(session = %session.id, step, "boot step finished");
        }

        if let RemoteAccess::Ssh { host, port } = &access {
            let alias = ConsoleAlias {
                name: session.id.clone(),
                host: host.clone(),
                port: *port,
                user: self.settings.ssh_user.clone(),
            };
            self.console
                .register(&alias)
                .await
                .map_err(SessionError::Console)?;
        }
        Ok(())
    }

    /// Opens a channel, runs `command` and closes the channel once.
    async fn run_on(
        &self,
        access: &RemoteAccess,
        command: &str,
    ) -> Result<CommandOutput, SessionError> {
        let remote = self.connector.open(access).await?;
        let outcome = remote.run_command(command).await;
        if let Err(err) = remote.close().await {
            warn!(error = %err, "failed to close remote channel");
        }
        Ok(outcome?)
    }

    async fn load(&self, id: &str) -> Result<Session, SessionError> {
        self.store
            .load(id)
            .await?
            .ok_or_else(|| SessionError::NotFound(id.to_owned()))
    }

    /// Resolves a running session to a freshly fetched transport.
    async fn reachable(&self, id: &str) -> Result<RemoteAccess, SessionError> {
        let session = self.load(id).await?;
        let vm_id = match (session.status, session.vm_id.as_deref()) {
            (SessionStatus::Running, Some(vm_id)) => vm_id,
            (status, _) => {
                return Err(SessionError::NotReady {
                    id: session.id,
                    status,
                });
            }
        };
        let provider = self.registry.resolve(&session.provider)?;
        let vm = provider.get(vm_id).await?;
        Ok(provider.access(&vm))
    }

    /// Runs a command on a running session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] or [`SessionError::NotReady`] when
    /// the session cannot be reached, and transport errors otherwise.
    pub async fn exec(&self, id: &str, command: &str) -> Result<CommandOutput, SessionError> {
        let access = self.reachable(id).await?;
        self.run_on(&access, command).await
    }

    /// Attaches the local terminal to a shell on a running session and
    /// returns the remote exit status.
    ///
    /// # Errors
    ///
    /// As for [`SessionManager::exec`].
    pub async fn console(&self, id: &str, tty: &TtyOptions) -> Result<Option<i32>, SessionError> {
        let access = self.reachable(id).await?;
        let remote = self.connector.open(&access).await?;
        let outcome = remote.run_interactive(tty).await;
        if let Err(err) = remote.close().await {
            warn!(session = id, error = %err, "failed to close remote channel");
        }
        Ok(outcome?)
    }

    /// Deletes the VM, the console alias and the record.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for an unknown name and provider
    /// errors when deletion fails. The record is kept when the VM could not
    /// be deleted.
    pub async fn destroy(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.load(id).await?;
        if let Some(vm_id) = session.vm_id.as_deref() {
            let provider = self.registry.resolve(&session.provider)?;
            provider.delete(vm_id).await?;
        }
        self.console
            .remove(id)
            .await
            .map_err(SessionError::Console)?;
        self.store.remove(id).await?;
        info!(session = id, "session destroyed");
        Ok(session)
    }

    /// Refreshes one session from its provider and saves any change.
    ///
    /// The change is only written while the stored record is still the one
    /// that was refreshed; otherwise the current record is returned.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for an unknown name and provider
    /// errors other than a missing VM.
    pub async fn status(&self, id: &str) -> Result<Session, SessionError> {
        let session = self.load(id).await?;
        let provider = self.registry.resolve(&session.provider)?;
        let Some(updated) = reconcile::refresh(&session, provider.as_ref()).await? else {
            return Ok(session);
        };
        if self.store.replace(&session, &updated).await? {
            return Ok(updated);
        }
        debug!(session = id, "record changed while refreshing; keeping it");
        self.load(id).await
    }

    /// Lists every session, reconciling against each provider once.
    ///
    /// Reconciled records are written only over the snapshot they were
    /// derived from, so a record destroyed, failed or finished by another
    /// task in the meantime keeps that outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] when records cannot be read or saved.
    /// Provider failures are reported in the listing instead.
    pub async fn list(&self) -> Result<SessionListing, SessionError> {
        let snapshot = self.store.load_all().await?;
        let outcome = reconcile::reconcile(&snapshot, &self.registry).await;
        for (previous, updated) in &outcome.changed {
            if !self.store.replace(previous, updated).await? {
                debug!(session = %previous.id, "record changed while reconciling; keeping it");
            }
        }
        Ok(SessionListing {
            sessions: self.store.load_all().await?,
            failures: outcome.failures,
        })
    }

    /// Destroys every session whose expiry is at or before `now`.
    /// Sessions that fail to destroy are logged and kept.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] when records cannot be read.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>, SessionError> {
        let mut reaped = Vec::new();
        for session in self.store.load_all().await? {
            if !session.is_expired(now) || session.status == SessionStatus::Provisioning {
                continue;
            }
            match self.destroy(&session.id).await {
                Ok(_) => reaped.push(session.id),
                Err(err) => warn!(session = %session.id, error = %err, "failed to reap session"),
            }
        }
        Ok(reaped)
    }
}
