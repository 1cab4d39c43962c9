//! Readiness polling shared by every provider.
//!
//! A VM is ready when its provider reports it running, it has an address,
//! and the transport port answers a TCP connect. The loop ends with exactly
//! one of: the ready VM, [`ProviderError::Timeout`] when the deadline passes,
//! [`ProviderError::ProvisionFailed`] on a fatal state, or
//! [`ProviderError::Cancelled`] when the caller cancels.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::provider::{ErrorKind, Provider, ProviderError, Vm, VmStatus};
use crate::remote::reachability::TcpReachability;

/// Interval between polls when the caller does not override it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

const ACTION: &str = "wait_ready";

/// Future returned by [`ReachabilityCheck::is_reachable`].
pub type ReachabilityFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// Transport-level check that a VM answers on its access port.
pub trait ReachabilityCheck: Send + Sync {
    /// Returns `true` when `host:port` accepts a connection.
    fn is_reachable<'a>(&'a self, host: &'a str, port: u16) -> ReachabilityFuture<'a>;
}

/// Tunables for [`wait_ready`].
#[derive(Clone)]
pub struct ReadinessOptions {
    timeout: Duration,
    poll_interval: Duration,
    reachability: Arc<dyn ReachabilityCheck>,
}

impl ReadinessOptions {
    /// Options with the given overall deadline, the default poll interval
    /// and a TCP connect check.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reachability: Arc::new(TcpReachability::default()),
        }
    }

    /// Overrides the interval between polls.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Replaces the reachability check.
    #[must_use]
    pub fn with_reachability(mut self, reachability: Arc<dyn ReachabilityCheck>) -> Self {
        self.reachability = reachability;
        self
    }
}

enum Poll {
    Ready(Vm),
    Pending,
}

/// Polls `provider` until VM `id` is reachable.
///
/// Cancellation is observed while fetching, probing and sleeping. Sleeps are
/// clipped to the deadline. Fetch errors other than
/// [`ProviderError::NotFound`] are treated as transient and retried.
///
/// # Errors
///
/// Returns [`ProviderError::Timeout`] when the deadline passes,
/// [`ProviderError::ProvisionFailed`] when the VM disappears or enters the
/// failed state, and [`ProviderError::Cancelled`] when `cancel` fires.
pub async fn wait_ready<P>(
    provider: &P,
    id: &str,
    options: &ReadinessOptions,
    cancel: &CancellationToken,
) -> Result<Vm, ProviderError>
where
    P: Provider + ?Sized,
{
    let deadline = Instant::now() + options.timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(ProviderError::Timeout {
                action: ACTION.to_owned(),
                id: id.to_owned(),
            });
        }

        if let Poll::Ready(vm) = poll_once(provider, id, options, cancel, deadline).await? {
            info!(provider = provider.name(), vm = %vm.id, address = %vm.address, "vm ready");
            return Ok(vm);
        }

        let wake = (Instant::now() + options.poll_interval).min(deadline);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            () = sleep_until(wake) => {}
        }
    }
}

async fn poll_once<P>(
    provider: &P,
    id: &str,
    options: &ReadinessOptions,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Result<Poll, ProviderError>
where
    P: Provider + ?Sized,
{
    let fetched = tokio::select! {
        biased;
        () = cancel.cancelled() => return Err(cancelled()),
        result = timeout_at(deadline, provider.get(id)) => result,
    };

    let vm = match fetched {
        Err(_elapsed) => return Ok(Poll::Pending),
        Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
            return Err(ProviderError::provision(format!(
                "vm {id} disappeared while waiting for it to become ready"
            )));
        }
        Ok(Err(err)) => {
            debug!(provider = provider.name(), vm = id, error = %err, "transient fetch error");
            return Ok(Poll::Pending);
        }
        Ok(Ok(vm)) => vm,
    };

    match vm.status {
        VmStatus::Failed => Err(ProviderError::provision(format!(
            "vm {id} entered the failed state"
        ))),
        VmStatus::Running if vm.has_address() => {
            let access = provider.access(&vm);
            let (host, port) = access.reachability_target();
            let reachable = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled()),
                result = timeout_at(deadline, options.reachability.is_reachable(host, port)) => {
                    result.unwrap_or(false)
                }
            };
            if reachable {
                Ok(Poll::Ready(vm))
            } else {
                debug!(vm = id, host, port, "vm running but not reachable yet");
                Ok(Poll::Pending)
            }
        }
        status => {
            debug!(vm = id, %status, address = %vm.address, "vm not ready yet");
            Ok(Poll::Pending)
        }
    }
}

fn cancelled() -> ProviderError {
    ProviderError::Cancelled {
        action: ACTION.to_owned(),
    }
}
