//! WebSocket exec transport for backends without plain SSH.
//!
//! Each command opens `wss://<host>/<path>/<name>/exec` with the command,
//! TTY flags and dimensions in the query string. Input travels as binary
//! frames; output arrives as binary or text frames. JSON control envelopes
//! (`{"type": ...}`) are consumed rather than displayed, and the exit notice
//! among them carries the exit code.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use reqwest::Url;
use serde::Deserialize;
use tokio::io::AsyncWrite;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::terminal::{self, RawModeGuard, write_flush};
use super::{CommandOutput, RemoteError, RemoteFuture, RemoteSession, TtyOptions, WsTarget, pump};

/// Erases the current terminal line.
const CLEAR_LINE: &[u8] = b"\r\x1b[2K";
const INTERACTIVE_SHELL: &[&str] = &["bash", "-l"];
const INPUT_QUEUE: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

#[derive(Debug, Deserialize)]
struct ControlFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    exit_code: Option<i32>,
}

fn parse_control(payload: &[u8]) -> Option<ControlFrame> {
    if payload.first() != Some(&b'{') {
        return None;
    }
    serde_json::from_slice(payload).ok()
}

/// Result of passing one inbound payload through [`OutputFilter`].
#[derive(Debug, Default, Eq, PartialEq)]
pub(crate) struct Filtered {
    /// Bytes to show the operator.
    pub(crate) display: Vec<u8>,
    /// Exit code announced by a control frame.
    pub(crate) exit_code: Option<i32>,
}

/// Separates control envelopes from terminal output.
#[derive(Debug)]
pub(crate) struct OutputFilter {
    seen_first: bool,
    clear_first_control_line: bool,
}

impl OutputFilter {
    pub(crate) const fn new(clear_first_control_line: bool) -> Self {
        Self {
            seen_first: false,
            clear_first_control_line,
        }
    }

    pub(crate) fn filter(&mut self, payload: &[u8]) -> Filtered {
        let first = !self.seen_first;
        self.seen_first = true;
        let Some(control) = parse_control(payload) else {
            return Filtered {
                display: payload.to_vec(),
                exit_code: None,
            };
        };
        debug!(kind = %control.kind, "control frame");
        let display = if first && self.clear_first_control_line {
            CLEAR_LINE.to_vec()
        } else {
            Vec::new()
        };
        Filtered {
            display,
            exit_code: control.exit_code,
        }
    }
}

/// Write half of the active socket. Taking it out of the slot is the only
/// way to close it, so the close frame goes out once.
pub(crate) struct SinkSlot<S> {
    sink: Mutex<Option<S>>,
}

impl<S> SinkSlot<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: fmt::Display,
{
    pub(crate) fn new() -> Self {
        Self {
            sink: Mutex::new(None),
        }
    }

    pub(crate) async fn install(&self, sink: S) -> Result<(), RemoteError> {
        let mut slot = self.sink.lock().await;
        if slot.is_some() {
            return Err(RemoteError::Channel {
                message: String::from("another command is already streaming on this session"),
                partial: Box::default(),
            });
        }
        *slot = Some(sink);
        Ok(())
    }

    pub(crate) async fn send(&self, message: Message) -> Result<(), RemoteError> {
        let mut slot = self.sink.lock().await;
        let sink = slot.as_mut().ok_or(RemoteError::Closed)?;
        sink.send(message)
            .await
            .map_err(|err| RemoteError::Channel {
                message: err.to_string(),
                partial: Box::default(),
            })
    }

    pub(crate) async fn close(&self) {
        let taken = self.sink.lock().await.take();
        let Some(mut sink) = taken else {
            return;
        };
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: String::new().into(),
        };
        if let Err(err) = sink.send(Message::Close(Some(frame))).await {
            debug!(error = %err, "close frame not delivered");
        }
        sink.close().await.ok();
    }
}

/// Builds the exec URL for `command`, optionally with a pseudo-terminal.
///
/// # Errors
///
/// Returns [`RemoteError::Connect`] when the target does not form a valid
/// URL.
pub fn exec_url(
    target: &WsTarget,
    command: &[&str],
    tty: Option<&TtyOptions>,
) -> Result<Url, RemoteError> {
    let path = [target.path.trim_matches('/'), target.name.as_str(), "exec"]
        .into_iter()
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/");
    let base = format!("wss://{}/{path}", target.host.trim_end_matches('/'));
    let mut url = Url::parse(&base).map_err(|err| RemoteError::Connect {
        target: base.clone(),
        message: err.to_string(),
    })?;
    {
        let mut query = url.query_pairs_mut();
        for part in command {
            query.append_pair("cmd", part);
        }
        let interactive = if tty.is_some() { "true" } else { "false" };
        query.append_pair("tty", interactive);
        query.append_pair("stdin", interactive);
        if let Some(options) = tty {
            query.append_pair("cols", &options.cols.to_string());
            query.append_pair("rows", &options.rows.to_string());
        }
    }
    Ok(url)
}

enum Inbound {
    Payload(Vec<u8>),
    Ignored,
    Finished,
    Abnormal { code: u16, reason: String },
    Failed(String),
}

fn classify(message: Option<Result<Message, WsError>>) -> Inbound {
    match message {
        None | Some(Err(WsError::ConnectionClosed)) => Inbound::Finished,
        Some(Err(err)) => Inbound::Failed(err.to_string()),
        Some(Ok(Message::Binary(data))) => Inbound::Payload(data.to_vec()),
        Some(Ok(Message::Text(text))) => Inbound::Payload(text.as_str().as_bytes().to_vec()),
        Some(Ok(Message::Close(frame))) => match frame {
            Some(close) if close.code != CloseCode::Normal => Inbound::Abnormal {
                code: u16::from(close.code),
                reason: close.reason.as_str().to_owned(),
            },
            _ => Inbound::Finished,
        },
        Some(Ok(_)) => Inbound::Ignored,
    }
}

/// Reads frames until the peer closes, echoing displayable bytes to `echo`
/// when given. Displayed bytes are also collected so a failure can carry
/// them.
async fn receive<S, W>(
    source: &mut S,
    filter: &mut OutputFilter,
    mut echo: Option<W>,
) -> Result<CommandOutput, RemoteError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut output = CommandOutput::default();
    loop {
        match classify(source.next().await) {
            Inbound::Payload(bytes) => {
                let frame = filter.filter(&bytes);
                if frame.exit_code.is_some() {
                    output.exit_code = frame.exit_code;
                }
                if let Some(writer) = echo.as_mut() {
                    write_flush(writer, &frame.display).await?;
                }
                output.stdout.extend_from_slice(&frame.display);
            }
            Inbound::Ignored => {}
            Inbound::Finished => return Ok(output),
            Inbound::Abnormal { code, reason } => {
                return Err(RemoteError::AbnormalClose {
                    code,
                    reason,
                    partial: Box::new(output),
                });
            }
            Inbound::Failed(message) => {
                return Err(RemoteError::Channel {
                    message,
                    partial: Box::new(output),
                });
            }
        }
    }
}

async fn stream_to_terminal(
    mut source: WsSource,
    mut filter: OutputFilter,
) -> Result<Option<i32>, RemoteError> {
    receive(&mut source, &mut filter, Some(tokio::io::stdout()))
        .await
        .map(|output| output.exit_code)
}

fn resize_message(cols: u16, rows: u16) -> Message {
    Message::Text(
        serde_json::json!({ "type": "resize", "cols": cols, "rows": rows })
            .to_string()
            .into(),
    )
}

async fn send_input(
    slot: Arc<SinkSlot<WsSink>>,
    mut input: mpsc::Receiver<Vec<u8>>,
    mut resizes: mpsc::Receiver<(u16, u16)>,
) -> Result<(), RemoteError> {
    loop {
        tokio::select! {
            chunk = input.recv() => match chunk {
                Some(bytes) => slot.send(Message::binary(bytes)).await?,
                None => return Ok(()),
            },
            Some((cols, rows)) = resizes.recv() => slot.send(resize_message(cols, rows)).await?,
        }
    }
}

/// WebSocket exec client for one VM.
pub struct WsClient {
    target: WsTarget,
    connect_timeout: Duration,
    active: Arc<SinkSlot<WsSink>>,
    closed: AtomicBool,
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("target", &self.target)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl WsClient {
    /// Creates a client; each command opens its own socket.
    #[must_use]
    pub fn new(target: WsTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
            active: Arc::new(SinkSlot::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn open_socket(&self, url: Url) -> Result<WsSource, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }
        let endpoint = url.to_string();
        let connect_failed = |message: String| RemoteError::Connect {
            target: endpoint.clone(),
            message,
        };
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|err| connect_failed(err.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.target.token))
            .map_err(|err| connect_failed(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| RemoteError::Timeout {
                target: endpoint.clone(),
                seconds: self.connect_timeout.as_secs(),
            })?
            .map_err(|err| connect_failed(err.to_string()))?;
        debug!(target = %endpoint, "websocket connected");

        let (sink, source) = stream.split();
        self.active.install(sink).await?;
        if self.closed.load(Ordering::SeqCst) {
            self.active.close().await;
            return Err(RemoteError::Closed);
        }
        Ok(source)
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, RemoteError> {
        let url = exec_url(&self.target, &["sh", "-c", command], None)?;
        let mut source = self.open_socket(url).await?;
        let mut filter = OutputFilter::new(false);
        let result = receive(&mut source, &mut filter, None::<tokio::io::Stdout>).await;
        self.active.close().await;
        result
    }

    async fn interactive(&self, tty: &TtyOptions) -> Result<Option<i32>, RemoteError> {
        let url = exec_url(&self.target, INTERACTIVE_SHELL, Some(tty))?;
        let source = self.open_socket(url).await?;
        let result = self.drive_terminal(source).await;
        self.active.close().await;
        result
    }

    async fn drive_terminal(&self, source: WsSource) -> Result<Option<i32>, RemoteError> {
        let _raw = RawModeGuard::enable()?;
        let cancel = CancellationToken::new();
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let resizes = terminal::watch_resizes(cancel.clone());
        let slot = Arc::clone(&self.active);
        let input = async move {
            let (read, sent) = tokio::join!(
                pump::forward_stdin(input_tx),
                send_input(slot, input_rx, resizes)
            );
            read.and(sent)
        };
        let filter = OutputFilter::new(self.target.clear_first_control_line);
        pump::run_duplex(input, stream_to_terminal(source, filter), cancel).await
    }
}

impl RemoteSession for WsClient {
    fn run_command<'a>(&'a self, command: &'a str) -> RemoteFuture<'a, CommandOutput> {
        Box::pin(self.exec(command))
    }

    fn run_interactive<'a>(&'a self, tty: &'a TtyOptions) -> RemoteFuture<'a, Option<i32>> {
        Box::pin(self.interactive(tty))
    }

    fn close(&self) -> RemoteFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            self.active.close().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::pin::Pin;
    use std::sync::{Mutex as StdMutex, PoisonError};

    use futures_util::stream;
    use rstest::rstest;

    use super::*;

    type Captured = Arc<StdMutex<Vec<Message>>>;
    type TestSink = Pin<Box<dyn Sink<Message, Error = Infallible> + Send>>;

    fn capturing_sink(log: Captured) -> TestSink {
        Box::pin(futures_util::sink::unfold(
            log,
            |log, message: Message| async move {
                log.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(message);
                Ok::<_, Infallible>(log)
            },
        ))
    }

    fn close_frames(log: &Captured) -> usize {
        log.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|message| matches!(message, Message::Close(_)))
            .count()
    }

    fn target() -> WsTarget {
        WsTarget {
            host: String::from("api.sprites.dev"),
            path: String::from("/v1/sprites/"),
            name: String::from("scratch"),
            token: String::from("token"),
            clear_first_control_line: true,
        }
    }

    fn text(value: &str) -> Result<Message, WsError> {
        Ok(Message::Text(String::from(value).into()))
    }

    fn binary(value: &[u8]) -> Result<Message, WsError> {
        Ok(Message::binary(value.to_vec()))
    }

    fn close_with(code: u16, reason: &str) -> Result<Message, WsError> {
        Ok(Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: String::from(reason).into(),
        })))
    }

    #[tokio::test]
    async fn concurrent_close_sends_one_close_frame() {
        let log = Captured::default();
        let slot = SinkSlot::new();
        slot.install(capturing_sink(Arc::clone(&log)))
            .await
            .unwrap_or_else(|err| panic!("install: {err}"));

        tokio::join!(slot.close(), slot.close(), slot.close());
        slot.close().await;

        assert_eq!(close_frames(&log), 1);
    }

    #[tokio::test]
    async fn send_after_close_reports_closed() {
        let slot = SinkSlot::new();
        slot.install(capturing_sink(Captured::default()))
            .await
            .unwrap_or_else(|err| panic!("install: {err}"));
        slot.close().await;

        let err = slot
            .send(Message::binary(b"ls".to_vec()))
            .await
            .expect_err("closed slot must reject input");
        assert!(matches!(err, RemoteError::Closed), "{err}");
    }

    #[tokio::test]
    async fn second_stream_on_same_slot_is_rejected() {
        let slot = SinkSlot::new();
        slot.install(capturing_sink(Captured::default()))
            .await
            .unwrap_or_else(|err| panic!("first install: {err}"));
        let result = slot.install(capturing_sink(Captured::default())).await;
        assert!(result.is_err());
    }

    #[test]
    fn first_control_frame_clears_the_line_when_enabled() {
        let mut filter = OutputFilter::new(true);
        let first = filter.filter(br#"{"type":"session_info","session_id":7}"#);
        let second = filter.filter(br#"{"type":"exit","exit_code":2}"#);

        assert_eq!(first.display, CLEAR_LINE);
        assert!(second.display.is_empty());
        assert_eq!(second.exit_code, Some(2));
    }

    #[rstest]
    #[case(false, br#"{"type":"session_info"}"#.as_slice(), b"".as_slice())]
    #[case(true, b"{not json".as_slice(), b"{not json".as_slice())]
    #[case(true, br#"{"no_type":1}"#.as_slice(), br#"{"no_type":1}"#.as_slice())]
    #[case(true, b"plain output".as_slice(), b"plain output".as_slice())]
    fn filter_first_frame(#[case] clear: bool, #[case] payload: &[u8], #[case] shown: &[u8]) {
        let mut filter = OutputFilter::new(clear);
        assert_eq!(filter.filter(payload).display, shown);
    }

    #[test]
    fn control_frame_after_output_does_not_clear() {
        let mut filter = OutputFilter::new(true);
        filter.filter(b"$ ");
        assert!(filter.filter(br#"{"type":"session_info"}"#).display.is_empty());
    }

    #[tokio::test]
    async fn receive_collects_output_and_exit_code() {
        let mut source = stream::iter(vec![
            text(r#"{"type":"session_info"}"#),
            binary(b"hello "),
            text("world"),
            text(r#"{"type":"exit","exit_code":3}"#),
            close_with(1000, ""),
        ]);
        let mut filter = OutputFilter::new(false);

        let output = receive(&mut source, &mut filter, None::<tokio::io::Stdout>)
            .await
            .unwrap_or_else(|err| panic!("receive: {err}"));

        assert_eq!(output.stdout_lossy(), "hello world");
        assert_eq!(output.exit_code, Some(3));
    }

    #[tokio::test]
    async fn abnormal_close_carries_streamed_output() {
        let mut source = stream::iter(vec![binary(b"half"), close_with(1011, "internal")]);
        let mut filter = OutputFilter::new(false);

        let err = receive(&mut source, &mut filter, None::<tokio::io::Stdout>)
            .await
            .expect_err("abnormal close must fail");

        let RemoteError::AbnormalClose { code, partial, .. } = &err else {
            panic!("expected AbnormalClose, got {err}");
        };
        assert_eq!(*code, 1011);
        assert_eq!(partial.stdout_lossy(), "half");
    }

    #[tokio::test]
    async fn read_error_carries_streamed_output() {
        let mut source = stream::iter(vec![
            binary(b"partial"),
            Err(WsError::Io(std::io::Error::other("reset"))),
        ]);
        let mut filter = OutputFilter::new(false);

        let err = receive(&mut source, &mut filter, None::<tokio::io::Stdout>)
            .await
            .expect_err("read error must fail");

        assert_eq!(
            err.partial_output().map(CommandOutput::stdout_lossy),
            Some(String::from("partial"))
        );
    }

    #[tokio::test]
    async fn stream_end_without_close_frame_is_normal() {
        let mut source = stream::iter(vec![binary(b"done")]);
        let mut filter = OutputFilter::new(false);

        let output = receive(&mut source, &mut filter, None::<tokio::io::Stdout>)
            .await
            .unwrap_or_else(|err| panic!("receive: {err}"));

        assert_eq!(output.exit_code, None);
        assert_eq!(output.stdout_lossy(), "done");
    }

    #[test]
    fn exec_url_encodes_command_and_terminal() {
        let tty = TtyOptions {
            term: String::from("xterm"),
            cols: 120,
            rows: 40,
        };
        let url = exec_url(&target(), &["sh", "-c", "echo a&b"], Some(&tty))
            .unwrap_or_else(|err| panic!("url: {err}"));

        assert_eq!(
            url.as_str(),
            "wss://api.sprites.dev/v1/sprites/scratch/exec?cmd=sh&cmd=-c&cmd=echo+a%26b\
             &tty=true&stdin=true&cols=120&rows=40"
        );
    }

    #[test]
    fn exec_url_without_terminal_disables_stdin() {
        let url = exec_url(&target(), &["uptime"], None).unwrap_or_else(|err| panic!("url: {err}"));
        assert_eq!(url.query(), Some("cmd=uptime&tty=false&stdin=false"));
    }

    #[test]
    fn resize_is_a_text_control_message() {
        let Message::Text(body) = resize_message(100, 30) else {
            panic!("resize should be text");
        };
        let value: serde_json::Value =
            serde_json::from_str(body.as_str()).unwrap_or_else(|err| panic!("json: {err}"));
        assert_eq!(
            value.get("type").and_then(serde_json::Value::as_str),
            Some("resize")
        );
        assert_eq!(value.get("cols").and_then(serde_json::Value::as_u64), Some(100));
        assert_eq!(value.get("rows").and_then(serde_json::Value::as_u64), Some(30));
    }

    #[tokio::test]
    async fn closed_client_refuses_commands() {
        let client = WsClient::new(target(), Duration::from_secs(1));
        client
            .close()
            .await
            .unwrap_or_else(|err| panic!("close: {err}"));

        let err = client
            .run_command("true")
            .await
            .expect_err("closed client must refuse");
        assert!(matches!(err, RemoteError::Closed), "{err}");
    }
}
