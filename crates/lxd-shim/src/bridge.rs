//! Byte relay between a pseudo-terminal session and one WebSocket.
//!
//! PTY reads and writes block, so each runs on its own blocking thread and
//! talks to the async relay loops through bounded channels. Output, input,
//! control and the idle timer run side by side until one of them ends the
//! session.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use lxd_shim_core::{Dimensions, OperationId, OperationStatus};
use lxd_shim_session::pty::{self, PtySession, SessionProcess};

use crate::sessions::SessionSlot;

/// PTY read buffer size; each read becomes at most one binary frame.
pub const CHUNK_SIZE: usize = 4096;

const CHANNEL_DEPTH: usize = 32;
// RFC 6455 limits close reasons to 123 bytes
const MAX_CLOSE_REASON: usize = 123;

/// Out-of-band request for a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Change the terminal size
    Resize(Dimensions),
    /// Deliver a signal to the process
    Signal(i32),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Either side closed normally
    Closed,
    /// Ended by a cancel request
    Cancelled,
    /// I/O failure or idle timeout
    Failed(String),
}

impl SessionEnd {
    /// Final operation status for this ending.
    pub fn status(&self) -> OperationStatus {
        match self {
            SessionEnd::Closed => OperationStatus::Success,
            SessionEnd::Cancelled | SessionEnd::Failed(_) => OperationStatus::Failure,
        }
    }

    /// Error text for the operation (empty on success).
    pub fn error(&self) -> String {
        match self {
            SessionEnd::Closed => String::new(),
            SessionEnd::Cancelled => "operation cancelled".to_string(),
            SessionEnd::Failed(err) => err.clone(),
        }
    }

    fn close_frame(&self) -> CloseFrame {
        let (code, reason) = match self {
            SessionEnd::Closed => (close_code::NORMAL, String::new()),
            SessionEnd::Cancelled => (close_code::NORMAL, self.error()),
            SessionEnd::Failed(err) => (close_code::ERROR, err.clone()),
        };
        CloseFrame {
            code,
            reason: truncate_reason(reason).into(),
        }
    }
}

/// Trim a close reason to the protocol limit on a char boundary.
pub fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Called exactly once with the session's ending, after teardown.
pub type Finisher = Box<dyn FnOnce(SessionEnd) + Send>;

/// Releases a session's resources on every exit path.
///
/// Dropping the guard terminates and reaps the process (which also closes the
/// PTY descriptors it owns), frees the session slot and then reports the
/// ending. Reaping blocks, so inside a runtime the release runs on the
/// blocking pool. An ending that was never recorded is reported as a failure.
struct Teardown {
    id: OperationId,
    process: Option<Box<dyn SessionProcess>>,
    slot: Option<SessionSlot>,
    finish: Option<Finisher>,
    end: Option<SessionEnd>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let id = self.id;
        let process = self.process.take();
        let slot = self.slot.take();
        let finish = self.finish.take();
        let end = self
            .end
            .take()
            .unwrap_or_else(|| SessionEnd::Failed("session aborted".to_string()));

        let release = move || {
            if let Some(mut process) = process {
                if let Err(e) = process.terminate() {
                    warn!("Failed to terminate session {}: {}", id, e);
                }
            }
            drop(slot);
            info!("Session {} ended: {:?}", id, end);
            if let Some(finish) = finish {
                finish(end);
            }
        };

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(release);
            }
            Err(_) => release(),
        }
    }
}

/// Time of the last byte relayed in either direction.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }
}

/// Relays one session.
pub struct StreamBridge {
    id: OperationId,
    session: PtySession,
    slot: SessionSlot,
    idle_timeout: Option<Duration>,
    finish: Finisher,
}

impl StreamBridge {
    /// Bridge `session`, taking its control queue and cancel token from `slot`.
    pub fn new(session: PtySession, slot: SessionSlot, finish: Finisher) -> Self {
        Self {
            id: slot.id(),
            session,
            slot,
            idle_timeout: None,
            finish,
        }
    }

    /// End the session after this long without traffic; zero disables.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    /// Relay until either side closes, a failure occurs or the session is cancelled.
    ///
    /// Each direction runs as its own loop so a stalled direction never holds
    /// up the other; whichever finishes first ends the session.
    pub async fn run(self, socket: WebSocket) {
        let StreamBridge {
            id,
            session,
            mut slot,
            idle_timeout,
            finish,
        } = self;
        let PtySession {
            reader,
            writer,
            process,
        } = session;
        let cancel = slot.cancel_token();
        let control = slot.take_control();

        let mut teardown = Teardown {
            id,
            process: Some(process),
            slot: Some(slot),
            finish: Some(finish),
            end: None,
        };

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        task::spawn_blocking(move || pump_output(reader, out_tx));

        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_DEPTH);
        let writer_task = task::spawn_blocking(move || pump_input(writer, in_rx));

        let (mut ws_tx, ws_rx) = socket.split();
        let activity = Activity::new();

        info!("Session {} attached", id);

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => SessionEnd::Cancelled,
            result = writer_task => match result {
                Ok(Ok(())) => SessionEnd::Closed,
                Ok(Err(e)) if is_closed_pty(&e) => SessionEnd::Closed,
                Ok(Err(e)) => SessionEnd::Failed(format!("pty write failed: {e}")),
                Err(e) => SessionEnd::Failed(format!("pty writer panicked: {e}")),
            },
            end = relay_output(id, out_rx, &mut ws_tx, &activity) => end,
            end = relay_input(id, ws_rx, in_tx, &activity) => end,
            end = apply_controls(id, control, teardown.process.as_mut()) => end,
            end = watch_idle(idle_timeout, &activity) => end,
        };

        if let SessionEnd::Failed(err) = &end {
            error!("Session {} failed: {}", id, err);
        }

        if let Err(e) = ws_tx.send(Message::Close(Some(end.close_frame()))).await {
            debug!("Failed to send close frame for session {}: {}", id, e);
        }
        teardown.end = Some(end);
    }
}

/// PTY output to the client until the PTY closes or the send fails.
async fn relay_output(
    id: OperationId,
    mut out_rx: mpsc::Receiver<std::result::Result<Vec<u8>, String>>,
    ws_tx: &mut SplitSink<WebSocket, Message>,
    activity: &Activity,
) -> SessionEnd {
    while let Some(chunk) = out_rx.recv().await {
        let data = match chunk {
            Ok(data) => data,
            Err(e) => return SessionEnd::Failed(e),
        };
        debug!("Session {}: {} bytes to client", id, data.len());
        activity.touch();
        if let Err(e) = ws_tx.send(Message::Binary(data.into())).await {
            return SessionEnd::Failed(format!("websocket send failed: {e}"));
        }
    }
    SessionEnd::Closed
}

/// Client input onto the PTY queue until the client goes away.
///
/// Owns the queue sender, so the writer thread sees end of input once this
/// loop is dropped.
async fn relay_input(
    id: OperationId,
    mut ws_rx: SplitStream<WebSocket>,
    in_tx: mpsc::Sender<Vec<u8>>,
    activity: &Activity,
) -> SessionEnd {
    while let Some(msg) = ws_rx.next().await {
        let data = match msg {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return SessionEnd::Closed,
            Err(e) => return SessionEnd::Failed(format!("websocket receive failed: {e}")),
        };
        debug!("Session {}: {} bytes from client", id, data.len());
        activity.touch();
        if in_tx.send(data).await.is_err() {
            // The writer exited; its result decides the ending
            return std::future::pending().await;
        }
    }
    SessionEnd::Closed
}

/// Apply resize and signal requests for as long as the session lives.
async fn apply_controls(
    id: OperationId,
    control: Option<mpsc::Receiver<ControlCommand>>,
    process: Option<&mut Box<dyn SessionProcess>>,
) -> SessionEnd {
    if let (Some(mut control), Some(process)) = (control, process) {
        while let Some(command) = control.recv().await {
            apply_control(id, process.as_mut(), command);
        }
    }
    std::future::pending().await
}

/// Resolves once nothing has been relayed for `timeout`; never when disabled.
async fn watch_idle(timeout: Option<Duration>, activity: &Activity) -> SessionEnd {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        let deadline = activity.last() + timeout;
        if Instant::now() >= deadline {
            return SessionEnd::Failed(format!("session idle for {}s", timeout.as_secs()));
        }
        tokio::time::sleep_until(deadline).await;
    }
}

fn apply_control(id: OperationId, process: &mut dyn SessionProcess, command: ControlCommand) {
    let result = match command {
        ControlCommand::Resize(dimensions) => process.resize(dimensions),
        ControlCommand::Signal(signal) => process.signal(signal),
    };
    if let Err(e) = result {
        warn!("Control command failed for session {}: {}", id, e);
    }
}

fn is_closed_pty(err: &std::io::Error) -> bool {
    pty::is_hangup(err) || err.kind() == std::io::ErrorKind::BrokenPipe
}

/// Blocking loop: PTY output into the relay queue.
fn pump_output(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<std::result::Result<Vec<u8>, String>>,
) {
    let mut buf = [0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) if is_closed_pty(&e) => break,
            Err(e) => {
                let _ = tx.blocking_send(Err(format!("pty read failed: {e}")));
                break;
            }
        }
    }
    debug!("PTY reader finished");
}

/// Blocking loop: client input onto the PTY, in order.
fn pump_input(
    mut writer: Box<dyn Write + Send>,
    mut rx: mpsc::Receiver<Vec<u8>>,
) -> std::io::Result<()> {
    while let Some(data) = rx.blocking_recv() {
        writer.write_all(&data)?;
        writer.flush()?;
    }
    Ok(())
}
