//! PTY (Pseudo-Terminal) handling with portable-pty.

use std::io::{Read, Write};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tracing::{debug, error, info, warn};

use lxd_shim_core::{Dimensions, Error, Result};

/// Control surface of a process running behind a pseudo-terminal.
pub trait SessionProcess: Send {
    /// Resize the terminal.
    fn resize(&mut self, dimensions: Dimensions) -> Result<()>;

    /// Deliver a signal to the process.
    fn signal(&mut self, signal: i32) -> Result<()>;

    /// Kill the process if still running and reap it.
    fn terminate(&mut self) -> Result<()>;

    /// OS process id, if known.
    fn pid(&self) -> Option<u32>;
}

/// A spawned session: blocking byte streams plus a process handle.
///
/// The reader and writer are moved onto dedicated blocking threads by the
/// bridge; the process handle stays with the bridge for teardown.
pub struct PtySession {
    /// Terminal output
    pub reader: Box<dyn Read + Send>,
    /// Terminal input
    pub writer: Box<dyn Write + Send>,
    /// Process control
    pub process: Box<dyn SessionProcess>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("pid", &self.process.pid())
            .finish_non_exhaustive()
    }
}

/// Process handle for a real pseudo-terminal.
pub struct PtyProcess {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    dimensions: Dimensions,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess")
            .field("dimensions", &self.dimensions)
            .field("pid", &self.child.process_id())
            .finish_non_exhaustive()
    }
}

impl PtyProcess {
    /// Current terminal size.
    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }
}

impl SessionProcess for PtyProcess {
    fn resize(&mut self, dimensions: Dimensions) -> Result<()> {
        debug!("Resizing PTY to {}x{}", dimensions.rows, dimensions.cols);
        self.master
            .resize(pty_size(dimensions))
            .map_err(|e| Error::StreamError(format!("Resize failed: {e}")))?;
        self.dimensions = dimensions;
        Ok(())
    }

    fn signal(&mut self, signal: i32) -> Result<()> {
        let pid = self
            .child
            .process_id()
            .ok_or_else(|| Error::StreamError("process id unavailable".to_string()))?;
        send_signal(pid, signal)
    }

    fn terminate(&mut self) -> Result<()> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!("PTY process already exited: {:?}", status);
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to poll PTY process: {}", e),
        }

        info!("Killing PTY process {:?}", self.child.process_id());
        if let Err(e) = self.child.kill() {
            // Raced with a normal exit
            debug!("Kill failed: {}", e);
        }
        self.child
            .wait()
            .map(|_| ())
            .map_err(|e| Error::StreamError(format!("Wait failed: {e}")))
    }

    fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: i32) -> Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| Error::InvalidInput(format!("pid out of range: {pid}")))?;
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == -1 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, signal: i32) -> Result<()> {
    Err(Error::InvalidInput(format!(
        "signal {signal} not supported on this platform"
    )))
}

fn pty_size(dimensions: Dimensions) -> PtySize {
    PtySize {
        rows: dimensions.rows,
        cols: dimensions.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Spawn `program` with `args` on a new pseudo-terminal.
///
/// # Example
/// ```no_run
/// use lxd_shim_session::pty;
/// use lxd_shim_core::Dimensions;
///
/// # fn example() -> lxd_shim_core::Result<()> {
/// let session = pty::spawn("/bin/sh", &[], Dimensions::new(24, 80))?;
/// # Ok(())
/// # }
/// ```
pub fn spawn(program: &str, args: &[String], dimensions: Dimensions) -> Result<PtySession> {
    info!(
        "Spawning PTY: program='{}' args={:?}, dimensions={}x{}",
        program, args, dimensions.rows, dimensions.cols
    );

    let pty_system = native_pty_system();

    let pair = pty_system.openpty(pty_size(dimensions)).map_err(|e| {
        error!("Failed to open PTY: {}", e);
        Error::SpawnFailure(format!("Failed to open PTY: {e}"))
    })?;

    let mut cmd = CommandBuilder::new(program);
    cmd.args(args);

    let child = pair.slave.spawn_command(cmd).map_err(|e| {
        error!("Failed to spawn command '{}': {}", program, e);
        Error::SpawnFailure(format!("Failed to spawn {program}: {e}"))
    })?;
    // Only the child may hold the slave end, or the reader never sees EOF
    drop(pair.slave);

    let writer = pair.master.take_writer().map_err(|e| {
        error!("Failed to take PTY writer: {}", e);
        Error::SpawnFailure(format!("Failed to take writer: {e}"))
    })?;

    let reader = pair.master.try_clone_reader().map_err(|e| {
        error!("Failed to clone PTY reader: {}", e);
        Error::SpawnFailure(format!("Failed to clone reader: {e}"))
    })?;

    info!(
        "PTY spawned successfully: program='{}' pid={:?}",
        program,
        child.process_id()
    );

    Ok(PtySession {
        reader,
        writer,
        process: Box::new(PtyProcess {
            master: pair.master,
            child,
            dimensions,
        }),
    })
}

/// Whether a PTY read error means the slave side closed.
///
/// Linux reports `EIO` on the master once the last slave descriptor is gone.
pub fn is_hangup(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        err.kind() == std::io::ErrorKind::BrokenPipe
    }
}
