//! Test doubles shared across unit and integration tests.
//!
//! [`ScriptedProvider`] answers provider calls from queued or stored state
//! and records every call. [`ScriptedConnector`] hands out sessions that
//! replay queued command output and count how often they are closed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::provider::{
    CreateRequest, KeyManager, Provider, ProviderError, ProviderFuture, Vm, VmStatus,
};
use crate::readiness::{self, ReachabilityFuture, ReachabilityCheck, ReadinessOptions};
use crate::remote::{
    CommandOutput, RemoteAccess, RemoteError, RemoteFuture, RemoteSession, SessionConnector,
    TtyOptions, WsTarget,
};

/// Address assigned to VMs once they reach the running state.
pub const READY_ADDRESS: &str = "203.0.113.10";

/// Builds a VM snapshot for assertions and scripted responses.
#[must_use]
pub fn vm(id: &str, status: VmStatus, address: &str) -> Vm {
    Vm {
        id: id.to_owned(),
        name: id.to_owned(),
        status,
        address: address.to_owned(),
        created_at: None,
        region: String::from("test-1"),
        hardware: String::from("small"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct ProviderState {
    gets: VecDeque<Result<Vm, ProviderError>>,
    repeat: Option<Vm>,
    vms: BTreeMap<String, Vm>,
    listed: Option<Vec<Vm>>,
    list_scope: Option<String>,
    list_error: Option<ProviderError>,
    create_error: Option<ProviderError>,
    delete_error: Option<ProviderError>,
    list_calls: usize,
    calls: Vec<String>,
    requests: Vec<CreateRequest>,
}

/// Provider answering from scripted state.
///
/// Created VMs start in `starting` with no address and report `running` at
/// [`READY_ADDRESS`] on the next fetch, unless fetches are scripted.
#[derive(Clone)]
pub struct ScriptedProvider {
    name: String,
    state: Arc<Mutex<ProviderState>>,
    websocket: bool,
    applies_user_data: bool,
    manages_keys: bool,
}

impl ScriptedProvider {
    /// Provider registered as `name`, reached over SSH, applying user-data
    /// and without key management.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            state: Arc::default(),
            websocket: false,
            applies_user_data: true,
            manages_keys: false,
        }
    }

    /// Reaches VMs over the WebSocket transport and runs boot payloads as
    /// first-boot scripts.
    #[must_use]
    pub const fn websocket(mut self) -> Self {
        self.websocket = true;
        self.applies_user_data = false;
        self
    }

    /// Exposes a [`KeyManager`].
    #[must_use]
    pub const fn with_key_manager(mut self) -> Self {
        self.manages_keys = true;
        self
    }

    /// Queues the result of the next `get` call.
    pub fn push_get(&self, result: Result<Vm, ProviderError>) {
        lock(&self.state).gets.push_back(result);
    }

    /// Returns `vm` from every `get` once the queue is drained.
    pub fn repeat_get(&self, snapshot: Vm) {
        lock(&self.state).repeat = Some(snapshot);
    }

    /// Fixes the result of `list`.
    pub fn set_listed(&self, vms: Vec<Vm>) {
        lock(&self.state).listed = Some(vms);
    }

    /// Restricts `list` coverage to VM ids starting with `prefix`.
    pub fn set_list_scope(&self, prefix: &str) {
        lock(&self.state).list_scope = Some(prefix.to_owned());
    }

    /// Makes `list` fail.
    pub fn fail_list(&self, err: ProviderError) {
        lock(&self.state).list_error = Some(err);
    }

    /// Makes `create` fail.
    pub fn fail_create(&self, err: ProviderError) {
        lock(&self.state).create_error = Some(err);
    }

    /// Makes `delete` fail.
    pub fn fail_delete(&self, err: ProviderError) {
        lock(&self.state).delete_error = Some(err);
    }

    /// Number of `list` calls so far.
    #[must_use]
    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    /// Every call so far, as `operation:argument`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    /// Requests passed to `create`.
    #[must_use]
    pub fn requests(&self) -> Vec<CreateRequest> {
        lock(&self.state).requests.clone()
    }

    /// VMs that exist on the fake backend.
    #[must_use]
    pub fn existing(&self) -> Vec<String> {
        lock(&self.state).vms.keys().cloned().collect()
    }

    fn record(&self, call: String) {
        lock(&self.state).calls.push(call);
    }
}

impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn create<'a>(&'a self, request: &'a CreateRequest) -> ProviderFuture<'a, Vm> {
        Box::pin(async move {
            self.record(format!("create:{}", request.name));
            let mut state = lock(&self.state);
            state.requests.push(request.clone());
            if let Some(err) = state.create_error.clone() {
                return Err(err);
            }
            let id = format!("vm-{}", request.name);
            state.vms.insert(
                id.clone(),
                vm(&id, VmStatus::Running, READY_ADDRESS),
            );
            Ok(vm(&id, VmStatus::Starting, ""))
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, Vm> {
        Box::pin(async move {
            self.record(format!("get:{id}"));
            let mut state = lock(&self.state);
            if let Some(next) = state.gets.pop_front() {
                return next;
            }
            if let Some(snapshot) = state.repeat.clone() {
                return Ok(snapshot);
            }
            state
                .vms
                .get(id)
                .cloned()
                .ok_or_else(|| ProviderError::vm_not_found(id))
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("delete:{id}"));
            let mut state = lock(&self.state);
            if let Some(err) = state.delete_error.clone() {
                return Err(err);
            }
            state.vms.remove(id);
            Ok(())
        })
    }

    fn list(&self) -> ProviderFuture<'_, Vec<Vm>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.list_calls += 1;
            if let Some(err) = state.list_error.clone() {
                return Err(err);
            }
            Ok(state
                .listed
                .clone()
                .unwrap_or_else(|| state.vms.values().cloned().collect()))
        })
    }

    fn lists(&self, vm_id: &str) -> bool {
        lock(&self.state)
            .list_scope
            .as_deref()
            .is_none_or(|prefix| vm_id.starts_with(prefix))
    }

    fn access(&self, target: &Vm) -> RemoteAccess {
        if self.websocket {
            RemoteAccess::WebSocket(WsTarget {
                host: String::from("exec.test"),
                path: String::from("v1/sprites"),
                name: target.id.clone(),
                token: String::from("test-token"),
                clear_first_control_line: false,
            })
        } else {
            RemoteAccess::Ssh {
                host: target.address.clone(),
                port: 22,
            }
        }
    }

    fn wait_ready<'a>(
        &'a self,
        id: &'a str,
        timeout: Duration,
        cancel: &'a CancellationToken,
    ) -> ProviderFuture<'a, Vm> {
        Box::pin(async move {
            let options = ReadinessOptions::new(timeout)
                .with_poll_interval(Duration::from_millis(5))
                .with_reachability(Arc::new(AlwaysReachable));
            readiness::wait_ready(self, id, &options, cancel).await
        })
    }

    fn applies_user_data(&self) -> bool {
        self.applies_user_data
    }

    fn key_manager(&self) -> Option<&dyn KeyManager> {
        self.manages_keys.then_some(self as &dyn KeyManager)
    }
}

impl KeyManager for ScriptedProvider {
    fn ensure_key<'a>(
        &'a self,
        name: &'a str,
        _public_key: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("ensure_key:{name}"));
            Ok(format!("key-{name}"))
        })
    }
}

/// Reachability check that always succeeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysReachable;

impl ReachabilityCheck for AlwaysReachable {
    fn is_reachable<'a>(&'a self, _host: &'a str, _port: u16) -> ReachabilityFuture<'a> {
        Box::pin(async { true })
    }
}

#[derive(Default)]
struct ConnectorState {
    outputs: VecDeque<CommandOutput>,
    commands: Vec<String>,
    opened: Vec<RemoteAccess>,
    open_error: Option<String>,
    interactive_exit: Option<i32>,
    gate: Option<Arc<Notify>>,
    failure: Option<CommandOutput>,
    closes: usize,
}

/// Connector handing out [`ScriptedSession`]s.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    state: Arc<Mutex<ConnectorState>>,
    public_key: Option<String>,
}

impl ScriptedConnector {
    /// Connector whose sessions succeed with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `key` as the operator's public key.
    #[must_use]
    pub fn with_public_key(mut self, key: &str) -> Self {
        self.public_key = Some(key.to_owned());
        self
    }

    /// Queues the output of the next command.
    pub fn push_output(&self, output: CommandOutput) {
        lock(&self.state).outputs.push_back(output);
    }

    /// Makes every `open` fail with `message`.
    pub fn fail_open(&self, message: &str) {
        lock(&self.state).open_error = Some(message.to_owned());
    }

    /// Makes commands wait until the returned gate is notified once per
    /// command.
    #[must_use]
    pub fn hold_commands(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        lock(&self.state).gate = Some(Arc::clone(&gate));
        gate
    }

    /// Makes the next command fail mid-stream after producing `partial`.
    pub fn fail_command_after(&self, partial: CommandOutput) {
        lock(&self.state).failure = Some(partial);
    }

    /// Exit status returned by interactive sessions.
    pub fn set_interactive_exit(&self, code: Option<i32>) {
        lock(&self.state).interactive_exit = code;
    }

    /// Commands run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state).commands.clone()
    }

    /// Targets opened so far.
    #[must_use]
    pub fn opened(&self) -> Vec<RemoteAccess> {
        lock(&self.state).opened.clone()
    }

    /// Total `close` calls across every session.
    #[must_use]
    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }
}

impl SessionConnector for ScriptedConnector {
    fn open<'a>(&'a self, access: &'a RemoteAccess) -> RemoteFuture<'a, Box<dyn RemoteSession>> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            if let Some(message) = state.open_error.clone() {
                return Err(RemoteError::Connect {
                    target: access.reachability_target().0.to_owned(),
                    message,
                });
            }
            state.opened.push(access.clone());
            Ok(Box::new(ScriptedSession {
                state: Arc::clone(&self.state),
                closed: AtomicBool::new(false),
            }) as Box<dyn RemoteSession>)
        })
    }

    fn public_key(&self) -> RemoteFuture<'_, Option<String>> {
        Box::pin(async move { Ok(self.public_key.clone()) })
    }
}

/// Session replaying the connector's queued output.
pub struct ScriptedSession {
    state: Arc<Mutex<ConnectorState>>,
    closed: AtomicBool,
}

impl RemoteSession for ScriptedSession {
    fn run_command<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, CommandOutput> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::Closed);
            }
            let gate = lock(&self.state).gate.clone();
            if let Some(held) = gate {
                held.notified().await;
            }
            let mut state = lock(&self.state);
            state.commands.push(command.to_owned());
            if let Some(partial) = state.failure.take() {
                return Err(RemoteError::Channel {
                    message: String::from("connection reset"),
                    partial: Box::new(partial),
                });
            }
            Ok(state.outputs.pop_front().unwrap_or_else(|| CommandOutput {
                exit_code: Some(0),
                ..CommandOutput::default()
            }))
        })
    }

    fn run_interactive<'a>(&'a self, _tty: &'a TtyOptions) -> RemoteFuture<'a, Option<i32>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(RemoteError::Closed);
            }
            Ok(lock(&self.state).interactive_exit)
        })
    }

    fn close(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            lock(&self.state).closes += 1;
            Ok(())
        })
    }
}
