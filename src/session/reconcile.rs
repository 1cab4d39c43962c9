//! Keeps local session records in step with what providers report.
//!
//! Reconciliation only ever demotes a record to [`SessionStatus::Stopped`]
//! when its provider no longer reports the VM. It never invents a VM for a
//! record, and records still owned by a provisioning task are left alone.
//! VMs outside what a provider's `list()` covers are fetched one by one
//! instead of being judged missing.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use super::{Session, SessionStatus};
use crate::provider::{ErrorKind, Provider, ProviderError, ProviderRegistry, Vm};

/// A provider that could not be consulted during a batch reconcile.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderFailure {
    /// Registry name of the provider.
    pub provider: String,
    /// Why the provider could not be consulted.
    pub message: String,
}

/// Outcome of a batch reconcile.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reconciliation {
    /// Records whose status or address changed, paired with the snapshot
    /// they were derived from. Only these need saving.
    pub changed: Vec<(Session, Session)>,
    /// Providers whose sessions were left untouched.
    pub failures: Vec<ProviderFailure>,
}

impl Reconciliation {
    fn fail(&mut self, provider: &str, message: String) {
        warn!(provider, error = %message, "skipping reconcile for provider");
        self.failures.push(ProviderFailure {
            provider: provider.to_owned(),
            message,
        });
    }

    fn record(&mut self, previous: &Session, updated: Session) {
        debug!(
            session = %previous.id,
            from = %previous.status,
            to = %updated.status,
            "session reconciled"
        );
        self.changed.push((previous.clone(), updated));
    }
}

/// Returns `true` while the background provisioning task owns the record.
/// The task keeps the record in [`SessionStatus::Provisioning`] until the
/// post-boot steps have finished.
const fn is_owned_by_provisioning(session: &Session) -> bool {
    matches!(session.status, SessionStatus::Provisioning)
}

/// Applies a VM snapshot to a record, returning the updated record when
/// anything changed.
fn apply(session: &Session, vm: Option<&Vm>) -> Option<Session> {
    let mut updated = session.clone();
    match vm {
        Some(found) => {
            updated.status = SessionStatus::from_vm(found.status);
            if found.has_address() && found.address != session.address {
                updated.address.clone_from(&found.address);
            }
        }
        None if session.status.is_active() => updated.status = SessionStatus::Stopped,
        None => return None,
    }
    (updated != *session).then_some(updated)
}

fn group_by_provider(sessions: &[Session]) -> BTreeMap<&str, Vec<&Session>> {
    let mut by_provider: BTreeMap<&str, Vec<&Session>> = BTreeMap::new();
    for session in sessions {
        if is_owned_by_provisioning(session) || session.vm_id.is_none() {
            continue;
        }
        by_provider
            .entry(session.provider.as_str())
            .or_default()
            .push(session);
    }
    by_provider
}

/// Reconciles every record against one `list()` call per distinct provider.
pub async fn reconcile(sessions: &[Session], registry: &ProviderRegistry) -> Reconciliation {
    let mut outcome = Reconciliation::default();
    for (name, group) in group_by_provider(sessions) {
        match registry.resolve(name) {
            Ok(provider) => reconcile_provider(provider.as_ref(), name, group, &mut outcome).await,
            Err(err) => outcome.fail(name, err.to_string()),
        }
    }
    outcome
}

async fn reconcile_provider(
    provider: &dyn Provider,
    name: &str,
    group: Vec<&Session>,
    outcome: &mut Reconciliation,
) {
    let (listed, fetched): (Vec<&Session>, Vec<&Session>) = group
        .into_iter()
        .partition(|session| session.vm_id.as_deref().is_some_and(|id| provider.lists(id)));

    if !listed.is_empty() {
        match provider.list().await {
            Ok(vms) => {
                let lookup: HashMap<&str, &Vm> =
                    vms.iter().map(|vm| (vm.id.as_str(), vm)).collect();
                for session in listed {
                    let found = session
                        .vm_id
                        .as_deref()
                        .and_then(|id| lookup.get(id).copied());
                    if let Some(updated) = apply(session, found) {
                        outcome.record(session, updated);
                    }
                }
            }
            Err(err) => outcome.fail(name, err.to_string()),
        }
    }

    for session in fetched {
        match refresh(session, provider).await {
            Ok(Some(updated)) => outcome.record(session, updated),
            Ok(None) => {}
            Err(err) => outcome.fail(name, format!("session '{}': {err}", session.id)),
        }
    }
}

/// Refreshes one record with a `get()` call.
///
/// Returns the updated record, or `None` when nothing changed.
///
/// # Errors
///
/// Returns [`ProviderError`] for fetch failures other than
/// [`ProviderError::NotFound`], which demotes an active record instead.
pub async fn refresh(
    session: &Session,
    provider: &dyn Provider,
) -> Result<Option<Session>, ProviderError> {
    if is_owned_by_provisioning(session) {
        return Ok(None);
    }
    let Some(vm_id) = session.vm_id.as_deref() else {
        return Ok(None);
    };
    match provider.get(vm_id).await {
        Ok(vm) => Ok(apply(session, Some(&vm))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(apply(session, None)),
        Err(err) => Err(err),
    }
}
