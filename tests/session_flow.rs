//! End-to-end session lifecycle against a file-backed store.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use drydock::provider::{CreateRequest, Provider, ProviderRegistry, VmStatus};
use drydock::session::{
    ConsoleRegistry, FileSessionStore, ManagerSettings, SessionStore,
};
use drydock::test_support::{READY_ADDRESS, ScriptedConnector, ScriptedProvider, vm};
use drydock::{DrydockConfig, SessionError, SessionManager, SessionStatus};
use tempfile::TempDir;

struct Workspace {
    _tmp: TempDir,
    sessions: Utf8PathBuf,
    console: Utf8PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let dir = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        Self {
            _tmp: tmp,
            sessions: dir.join("state/sessions.toml"),
            console: dir.join("ssh/drydock.conf"),
        }
    }

    fn manager(&self, provider: &ScriptedProvider, connector: &ScriptedConnector) -> SessionManager {
        let mut registry = ProviderRegistry::new(DrydockConfig::default());
        let shared = provider.clone();
        registry
            .register(provider.name(), move |_| {
                Ok(Arc::new(shared.clone()) as Arc<dyn Provider>)
            })
            .unwrap_or_else(|err| panic!("register: {err}"));
        SessionManager::new(
            Arc::new(registry),
            Arc::new(FileSessionStore::new(self.sessions.clone())),
            Arc::new(connector.clone()),
            Arc::new(ConsoleRegistry::new(self.console.clone())),
            ManagerSettings {
                wait_timeout: Duration::from_secs(5),
                ssh_user: String::from("ubuntu"),
            },
        )
    }
}

fn request(name: &str) -> CreateRequest {
    CreateRequest::builder(name)
        .build()
        .unwrap_or_else(|err| panic!("request: {err}"))
}

#[tokio::test]
async fn sessions_survive_a_restart_and_can_be_destroyed() {
    let workspace = Workspace::new();
    let provider = ScriptedProvider::new("cloud");
    let connector = ScriptedConnector::new();

    let first = workspace.manager(&provider, &connector);
    let provisioning = first
        .create(request("dev-box"), "cloud", None)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"));
    let session = provisioning
        .handle
        .await
        .unwrap_or_else(|err| panic!("join: {err}"))
        .unwrap_or_else(|err| panic!("provision: {err}"));
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.address, READY_ADDRESS);

    let reopened = FileSessionStore::new(workspace.sessions.clone());
    let stored = reopened
        .load("dev-box")
        .await
        .unwrap_or_else(|err| panic!("load: {err}"))
        .unwrap_or_else(|| panic!("session should be persisted"));
    assert_eq!(stored.vm_id.as_deref(), Some("vm-dev-box"));

    let second = workspace.manager(&provider, &connector);
    let output = second
        .exec("dev-box", "uname -a")
        .await
        .unwrap_or_else(|err| panic!("exec: {err}"));
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(connector.commands().last().map(String::as_str), Some("uname -a"));

    let destroyed = second
        .destroy("dev-box")
        .await
        .unwrap_or_else(|err| panic!("destroy: {err}"));
    assert_eq!(destroyed.id, "dev-box");
    assert!(provider.existing().is_empty());
    let listing = second
        .list()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert!(listing.sessions.is_empty());
}

#[tokio::test]
async fn listing_marks_vanished_vms_stopped_on_disk() {
    let workspace = Workspace::new();
    let provider = ScriptedProvider::new("cloud");
    let connector = ScriptedConnector::new();
    let manager = workspace.manager(&provider, &connector);
    manager
        .create(request("dev-box"), "cloud", None)
        .await
        .unwrap_or_else(|err| panic!("create: {err}"))
        .handle
        .await
        .unwrap_or_else(|err| panic!("join: {err}"))
        .unwrap_or_else(|err| panic!("provision: {err}"));

    provider.set_listed(vec![vm("vm-other", VmStatus::Running, "198.51.100.7")]);
    let listing = manager
        .list()
        .await
        .unwrap_or_else(|err| panic!("list: {err}"));
    assert_eq!(listing.sessions.len(), 1);
    assert!(
        listing
            .sessions
            .iter()
            .all(|session| session.status == SessionStatus::Stopped)
    );

    let reopened = FileSessionStore::new(workspace.sessions.clone());
    let stored = reopened
        .load("dev-box")
        .await
        .unwrap_or_else(|err| panic!("load: {err}"))
        .unwrap_or_else(|| panic!("session should be persisted"));
    assert_eq!(stored.status, SessionStatus::Stopped);

    let Err(err) = manager.exec("dev-box", "true").await else {
        panic!("stopped sessions should refuse commands");
    };
    assert!(matches!(err, SessionError::NotReady { .. }), "{err}");
}
