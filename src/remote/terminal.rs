//! Local terminal handling for interactive sessions.

use crossterm::terminal;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::RemoteError;

const FALLBACK_SIZE: (u16, u16) = (80, 24);

/// Puts the local terminal in raw mode and restores it when dropped, so
/// every exit path (normal return, error, panic unwind) leaves the terminal
/// usable.
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    /// Switches the terminal to raw mode.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Terminal`] when the terminal rejects the mode
    /// change (for example when stdin is not a TTY).
    pub fn enable() -> Result<Self, RemoteError> {
        terminal::enable_raw_mode().map_err(|err| RemoteError::Terminal(err.to_string()))?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        terminal::disable_raw_mode().ok();
    }
}

/// Current terminal size as `(cols, rows)`, falling back to 80x24.
#[must_use]
pub fn current_size() -> (u16, u16) {
    terminal::size().unwrap_or(FALLBACK_SIZE)
}

/// Writes `bytes` and flushes so remote output appears immediately.
pub(crate) async fn write_flush<W>(target: &mut W, bytes: &[u8]) -> Result<(), RemoteError>
where
    W: AsyncWrite + Unpin,
{
    if bytes.is_empty() {
        return Ok(());
    }
    target
        .write_all(bytes)
        .await
        .map_err(|err| RemoteError::Terminal(err.to_string()))?;
    target
        .flush()
        .await
        .map_err(|err| RemoteError::Terminal(err.to_string()))
}

/// Emits the new terminal size on every window-change signal until `cancel`
/// fires.
pub(crate) fn watch_resizes(cancel: CancellationToken) -> mpsc::Receiver<(u16, u16)> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let Ok(mut winch) = signal(SignalKind::window_change()) else {
                debug!("window-change signal unavailable; resizes will not be forwarded");
                return;
            };
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    received = winch.recv() => {
                        if received.is_none() || tx.send(current_size()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            drop(tx);
            cancel.cancelled().await;
            debug!("resize forwarding is unix-only");
        }
    });
    rx
}

/// Resolves when the process receives a termination or hangup signal.
pub(crate) async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let (Ok(mut term), Ok(mut hangup)) = (
            signal(SignalKind::terminate()),
            signal(SignalKind::hangup()),
        ) else {
            std::future::pending::<()>().await;
            return;
        };
        tokio::select! {
            _ = term.recv() => debug!("received SIGTERM"),
            _ = hangup.recv() => debug!("received SIGHUP"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
