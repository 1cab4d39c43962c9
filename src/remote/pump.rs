//! Two-pump driver for interactive sessions.
//!
//! One pump moves local input to the remote, the other moves remote output
//! to the local terminal. Both share a cancellation token; whichever
//! finishes first (or a termination signal) cancels the other. Completion is
//! reported on a channel with room for both pumps so neither blocks on exit.

use std::future::Future;

use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{RemoteError, terminal};

const INPUT_CHUNK: usize = 4096;

enum PumpExit {
    Input(Result<(), RemoteError>),
    Output(Result<Option<i32>, RemoteError>),
}

/// Runs `input` and `output` until either finishes, then cancels the other
/// and returns the output pump's result. An input failure is surfaced only
/// when the output pump itself succeeded.
pub(crate) async fn run_duplex<I, O>(
    input: I,
    output: O,
    cancel: CancellationToken,
) -> Result<Option<i32>, RemoteError>
where
    I: Future<Output = Result<(), RemoteError>> + Send + 'static,
    O: Future<Output = Result<Option<i32>, RemoteError>> + Send + 'static,
{
    let (done_tx, mut done_rx) = mpsc::channel::<PumpExit>(2);

    let input_done = done_tx.clone();
    let input_cancel = cancel.clone();
    let input_task = tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            result = input => result,
            () = input_cancel.cancelled() => Ok(()),
        };
        input_done.send(PumpExit::Input(result)).await.ok();
    });

    let output_cancel = cancel.clone();
    let output_task = tokio::spawn(async move {
        let result = tokio::select! {
            biased;
            result = output => result,
            () = output_cancel.cancelled() => Ok(None),
        };
        done_tx.send(PumpExit::Output(result)).await.ok();
    });

    let mut input_result = None;
    let mut output_result = None;

    tokio::select! {
        first = done_rx.recv() => record(first, &mut input_result, &mut output_result),
        () = terminal::termination_signal() => debug!("termination signal; ending session"),
    }
    cancel.cancel();

    while let Some(exit) = done_rx.recv().await {
        record(Some(exit), &mut input_result, &mut output_result);
    }
    input_task.await.ok();
    output_task.await.ok();

    let output = output_result.unwrap_or(Ok(None))?;
    if let Some(Err(err)) = input_result {
        return Err(err);
    }
    Ok(output)
}

fn record(
    exit: Option<PumpExit>,
    input: &mut Option<Result<(), RemoteError>>,
    output: &mut Option<Result<Option<i32>, RemoteError>>,
) {
    match exit {
        Some(PumpExit::Input(result)) => *input = Some(result),
        Some(PumpExit::Output(result)) => *output = Some(result),
        None => {}
    }
}

/// Reads local stdin in chunks and forwards each chunk to `tx` until EOF or
/// until the receiver is dropped.
pub(crate) async fn forward_stdin(tx: mpsc::Sender<Vec<u8>>) -> Result<(), RemoteError> {
    let mut stdin = tokio::io::stdin();
    let mut buffer = vec![0_u8; INPUT_CHUNK];
    loop {
        let read = stdin
            .read(&mut buffer)
            .await
            .map_err(|err| RemoteError::Terminal(err.to_string()))?;
        let Some(chunk) = buffer.get(..read).filter(|chunk| !chunk.is_empty()) else {
            return Ok(());
        };
        if tx.send(chunk.to_vec()).await.is_err() {
            return Ok(());
        }
    }
}
