//! Tests for signer resolution order and failure reporting.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use camino::Utf8Path;
use rstest::rstest;
use tempfile::TempDir;

use super::*;

#[derive(Default)]
struct FakeConnector {
    agents: HashMap<Utf8PathBuf, Vec<(&'static str, &'static str)>>,
    calls: Mutex<Vec<Utf8PathBuf>>,
}

impl FakeConnector {
    fn with_agent(mut self, path: &Utf8Path, keys: &[(&'static str, &'static str)]) -> Self {
        self.agents.insert(path.to_path_buf(), keys.to_vec());
        self
    }

    fn calls(&self) -> Vec<Utf8PathBuf> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AgentConnector for FakeConnector {
    fn list_identities<'a>(
        &'a self,
        endpoint: &'a AgentEndpoint,
    ) -> CredentialFuture<'a, Vec<Identity>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(endpoint.path.clone());
        let result = self
            .agents
            .get(&endpoint.path)
            .map(|keys| {
                keys.iter()
                    .map(|(fingerprint, label)| Identity {
                        fingerprint: (*fingerprint).to_owned(),
                        label: (*label).to_owned(),
                        public_key: format!("ssh-ed25519 AAAA {label}"),
                        source: IdentitySource::Agent(endpoint.clone()),
                    })
                    .collect()
            })
            .ok_or_else(|| CredentialError::Agent {
                endpoint: endpoint.to_string(),
                message: String::from("connection refused"),
            });
        Box::pin(async move { result })
    }
}

/// Three agent sockets: one from ssh config, the 1Password socket, and
/// `SSH_AUTH_SOCK`.
struct Agents {
    _tmp: TempDir,
    home: Utf8PathBuf,
    config: Utf8PathBuf,
    onepassword: Utf8PathBuf,
    env: Utf8PathBuf,
}

impl Agents {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let home = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp path should be utf8: {}", path.display()));
        let config = home.join("a.sock");
        let onepassword = home.join(".1password/agent.sock");
        for path in [&config, &onepassword] {
            crate::util::write_ambient(path, "").unwrap_or_else(|err| panic!("socket: {err}"));
        }
        let env = home.join("c.sock");
        Self {
            _tmp: tmp,
            home,
            config,
            onepassword,
            env,
        }
    }

    fn discovery(&self) -> Discovery {
        Discovery::new(Some(self.home.clone()), Platform::Linux)
            .with_ssh_config(Some(format!("IdentityAgent {}\n", self.config)))
            .with_auth_sock(Some(self.env.to_string()))
    }

    fn resolver(&self, connector: FakeConnector) -> CredentialResolver<FakeConnector> {
        CredentialResolver::new(connector, self.discovery(), Vec::new())
    }
}

#[tokio::test]
async fn fingerprint_on_third_agent_is_found() {
    let agents = Agents::new();
    let connector = FakeConnector::default()
        .with_agent(&agents.config, &[("SHA256:aaa", "first")])
        .with_agent(&agents.onepassword, &[])
        .with_agent(&agents.env, &[("SHA256:ccc", "third")]);
    let resolver = agents.resolver(connector);

    let signer = resolver
        .get_signer(Some("SHA256:ccc"))
        .await
        .unwrap_or_else(|err| panic!("signer: {err}"));

    assert_eq!(signer.identity().label, "third");
    assert!(matches!(signer, Signer::Agent { ref endpoint, .. } if endpoint.path == agents.env));
}

#[tokio::test]
async fn first_agent_match_stops_the_search() {
    let agents = Agents::new();
    let connector = FakeConnector::default()
        .with_agent(&agents.config, &[("SHA256:aaa", "first")])
        .with_agent(&agents.onepassword, &[("SHA256:bbb", "second")])
        .with_agent(&agents.env, &[("SHA256:ccc", "third")]);
    let resolver = agents.resolver(connector);

    let signer = resolver
        .get_signer(Some("SHA256:aaa"))
        .await
        .unwrap_or_else(|err| panic!("signer: {err}"));

    assert_eq!(signer.identity().fingerprint, "SHA256:aaa");
    assert_eq!(resolver.connector.calls(), vec![agents.config.clone()]);
}

#[tokio::test]
async fn no_fingerprint_takes_first_identity_after_unreachable_agent() {
    let agents = Agents::new();
    let connector = FakeConnector::default()
        .with_agent(&agents.onepassword, &[("SHA256:bbb", "second")])
        .with_agent(&agents.env, &[("SHA256:ccc", "third")]);
    let resolver = agents.resolver(connector);

    let signer = resolver
        .get_signer(None)
        .await
        .unwrap_or_else(|err| panic!("signer: {err}"));

    assert_eq!(signer.identity().fingerprint, "SHA256:bbb");
}

#[tokio::test]
async fn missing_fingerprint_lists_identities_found() {
    let agents = Agents::new();
    let connector = FakeConnector::default()
        .with_agent(&agents.config, &[("SHA256:aaa", "first")])
        .with_agent(&agents.env, &[("SHA256:ccc", "third")]);
    let resolver = agents.resolver(connector);

    let err = resolver
        .get_signer(Some("SHA256:zzz"))
        .await
        .expect_err("unknown fingerprint should fail");

    let CredentialError::IdentityNotFound { available, .. } = &err else {
        panic!("expected IdentityNotFound, got {err}");
    };
    assert!(available.contains("SHA256:aaa (first)"), "{available}");
    assert!(available.contains("SHA256:ccc (third)"), "{available}");
}

#[rstest]
#[case(Some("SHA256:aaa"))]
#[case(None)]
#[tokio::test]
async fn reachable_but_empty_agents_suggest_ssh_add(#[case] fingerprint: Option<&str>) {
    let agents = Agents::new();
    let connector = FakeConnector::default()
        .with_agent(&agents.config, &[])
        .with_agent(&agents.onepassword, &[])
        .with_agent(&agents.env, &[]);
    let resolver = agents.resolver(connector);

    let err = resolver
        .get_signer(fingerprint)
        .await
        .expect_err("empty agents should fail");

    assert!(matches!(err, CredentialError::NoIdentities { .. }), "{err}");
    assert!(err.to_string().contains("ssh-add"), "{err}");
}

#[tokio::test]
async fn unreachable_agents_report_every_endpoint() {
    let agents = Agents::new();
    let resolver = agents.resolver(FakeConnector::default());

    let err = resolver
        .get_signer(None)
        .await
        .expect_err("unreachable agents should fail");

    let CredentialError::ConnectionFailed { details } = &err else {
        panic!("expected ConnectionFailed, got {err}");
    };
    for path in [&agents.config, &agents.onepassword, &agents.env] {
        assert!(details.contains(path.as_str()), "{details}");
    }
}

#[tokio::test]
async fn nothing_to_consult_is_no_agent_available() {
    let resolver = CredentialResolver::new(
        FakeConnector::default(),
        Discovery::new(None, Platform::Linux),
        Vec::new(),
    );

    let err = resolver
        .get_signer(None)
        .await
        .expect_err("no sources should fail");

    assert_eq!(err, CredentialError::NoAgentAvailable);
}

#[tokio::test]
async fn key_files_are_consulted_after_agents() {
    let agents = Agents::new();
    let key = agents.home.join("id_ed25519");
    crate::util::write_ambient(
        &agents.home.join("id_ed25519.pub"),
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICOsv8SCLicvrJ8lBezPdorcBx/4IN/iQ/BXO6LoSmsr ops@laptop",
    )
    .unwrap_or_else(|err| panic!("write key: {err}"));
    let connector = FakeConnector::default().with_agent(&agents.env, &[("SHA256:ccc", "third")]);
    let resolver = CredentialResolver::new(connector, agents.discovery(), vec![key.clone()]);

    let signer = resolver
        .get_signer(Some("SHA256:gWxx9ACtlaOjv//ClQY9H7M14549Rt7AoPV965ESqVs"))
        .await
        .unwrap_or_else(|err| panic!("signer: {err}"));

    assert!(matches!(signer, Signer::KeyFile { ref path, .. } if *path == key));
    assert_eq!(resolver.connector.calls().len(), 3);
}
