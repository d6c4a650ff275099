//! PTY-backed shell sessions.
//!
//! A [`Terminal`] owns one child shell process and its PTY master fd. Output
//! is pumped off the master and emitted as [`TerminalEvent::Data`] on the
//! terminal's event channel; input, resize, and teardown go through the
//! methods here. The event channel replaces the callback wiring a terminal
//! would otherwise need into its consumer — the tunnel controller just
//! drains the channel.
//!
//! ## Lifecycle
//!
//! ```text
//! starting --ok--> running --close()/read-err/child-exit--> closing --reaped--> closed
//! ```
//!
//! The first caller to move the terminal out of `running` performs the whole
//! teardown (kill, bounded reap, master close) and emits
//! [`TerminalEvent::Closed`]; every later close request is a no-op, so the
//! close notification fires exactly once per terminal.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Read size of the output pump. Each non-empty read becomes one
/// [`TerminalEvent::Data`] burst.
const PUMP_BUFFER_SIZE: usize = 1024;

/// How long [`Terminal::close`] waits for the killed child to be reaped
/// before abandoning it and closing the PTY anyway.
const REAP_GRACE: Duration = Duration::from_secs(1);

/// Initial terminal size until the peer sends a resize.
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Events emitted by a terminal on its event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// A burst of output read from the PTY (lossy UTF-8).
    Data(String),
    /// The terminal finished its teardown. Sent exactly once.
    Closed,
}

/// Terminal lifecycle states, stored as an atomic for lock-free checks.
/// `starting` has no stored value: spawn either returns a running terminal
/// or no terminal at all.
const STATE_RUNNING: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Errors from spawning or driving a terminal.
#[derive(Debug)]
pub enum TerminalError {
    /// PTY allocation failed.
    Pty(nix::Error),
    /// The shell binary could not be started.
    Spawn(std::io::Error),
    /// Write or resize was attempted while the terminal is not running.
    NotRunning,
    /// Read/write on the PTY master failed.
    Io(std::io::Error),
    /// The resize ioctl failed.
    Resize(nix::Error),
}

impl std::fmt::Display for TerminalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalError::Pty(e) => write!(f, "failed to allocate PTY: {e}"),
            TerminalError::Spawn(e) => write!(f, "failed to spawn shell: {e}"),
            TerminalError::NotRunning => write!(f, "terminal is not running"),
            TerminalError::Io(e) => write!(f, "terminal I/O error: {e}"),
            TerminalError::Resize(e) => write!(f, "failed to resize terminal: {e}"),
        }
    }
}

impl std::error::Error for TerminalError {}

fn winsize(cols: u16, rows: u16) -> Winsize {
    Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

/// Open a PTY and spawn `command` on its slave side.
///
/// The child calls `setsid()` and claims the slave as its controlling
/// terminal, then dups the slave over stdin/stdout/stderr. Returns the
/// child together with the master fd, which the terminal keeps for I/O and
/// resize until teardown.
fn spawn_on_pty(command: &str, cols: u16, rows: u16) -> Result<(Child, OwnedFd), TerminalError> {
    let OpenptyResult { master, slave } =
        openpty(&winsize(cols, rows), None).map_err(TerminalError::Pty)?;
    let slave_fd = slave.as_raw_fd();

    let mut cmd = Command::new(command);
    cmd.env("TERM", "xterm-256color").kill_on_drop(true);
    // Stdio is wired to the PTY slave inside pre_exec; no pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: only async-signal-safe syscalls between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            for fd in 0..=2 {
                libc::dup2(slave_fd, fd);
            }
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(TerminalError::Spawn)?;
    // The child owns its stdio copies of the slave; the parent's copy is
    // closed here so master reads see EOF once the child exits.
    drop(slave);
    Ok((child, master))
}

/// Apply a new window size to the PTY master.
fn set_winsize(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), TerminalError> {
    let size = winsize(cols, rows);
    // SAFETY: TIOCSWINSZ reads the Winsize struct we point it at.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(size),
        )
    };
    if ret == -1 {
        Err(TerminalError::Resize(nix::Error::last()))
    } else {
        Ok(())
    }
}

/// Write side of the PTY master plus the original fd kept for resize.
/// Behind one lock so concurrent writes and resizes are serialized.
struct TerminalIo {
    writer: tokio::fs::File,
    master: OwnedFd,
}

struct TerminalInner {
    state: AtomicU8,
    io: Mutex<Option<TerminalIo>>,
    child: Mutex<Option<Child>>,
    events: mpsc::Sender<TerminalEvent>,
}

/// A running shell under a PTY. Cheaply cloneable handle.
#[derive(Clone)]
pub struct Terminal {
    /// OS process ID of the shell.
    pid: u32,
    inner: Arc<TerminalInner>,
}

impl Terminal {
    /// Spawn `command` under a freshly allocated PTY and start the output
    /// pump. Events are delivered on `events` until [`TerminalEvent::Closed`].
    pub fn spawn(
        command: &str,
        events: mpsc::Sender<TerminalEvent>,
    ) -> Result<Terminal, TerminalError> {
        let (child, master) = spawn_on_pty(command, DEFAULT_COLS, DEFAULT_ROWS)?;
        let pid = child.id().unwrap_or(0);

        let master_raw: RawFd = master.as_raw_fd();

        // Dup the master fd: one for writing, one for reading; the original
        // OwnedFd stays alive for resize and is closed on teardown.
        let writer_fd: RawFd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(TerminalError::Io(std::io::Error::last_os_error()));
        }
        let reader_fd: RawFd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(TerminalError::Io(std::io::Error::last_os_error()));
        }

        // SAFETY: the dup'd fds are exclusively ours from here on
        let writer = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let reader = tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        let inner = Arc::new(TerminalInner {
            state: AtomicU8::new(STATE_RUNNING),
            io: Mutex::new(Some(TerminalIo { writer, master })),
            child: Mutex::new(Some(child)),
            events,
        });

        let terminal = Terminal { pid, inner };
        terminal.spawn_pump(reader);
        Ok(terminal)
    }

    /// OS process ID of the shell child.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Output pump: reads bursts from the PTY master and emits them as
    /// events. Terminates on any read error (including EOF after child
    /// exit) by driving the close path. Never takes the write lock.
    fn spawn_pump(&self, mut reader: tokio::fs::File) {
        let terminal = self.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; PUMP_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&buffer[..n]).into_owned();
                        if terminal
                            .inner
                            .events
                            .send(TerminalEvent::Data(data))
                            .await
                            .is_err()
                        {
                            // Consumer is gone; nothing left to pump for.
                            break;
                        }
                    }
                }
            }
            debug!(pid = terminal.pid, "terminal output closed");
            terminal.close().await;
        });
    }

    /// Forward input to the PTY master.
    ///
    /// Embedded NUL bytes are stripped first; input that is empty after
    /// stripping is a successful no-op. Fails with
    /// [`TerminalError::NotRunning`] once the terminal has left `running`.
    pub async fn write(&self, data: &str) -> Result<(), TerminalError> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(TerminalError::NotRunning);
        }
        let cleaned = data.replace('\0', "");
        if cleaned.is_empty() {
            return Ok(());
        }
        let mut io = self.inner.io.lock().await;
        let Some(io) = io.as_mut() else {
            return Err(TerminalError::NotRunning);
        };
        io.writer
            .write_all(cleaned.as_bytes())
            .await
            .map_err(TerminalError::Io)?;
        io.writer.flush().await.map_err(TerminalError::Io)
    }

    /// Resize the PTY window. `(0, 0)` is accepted and forwarded.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_RUNNING {
            return Err(TerminalError::NotRunning);
        }
        let io = self.inner.io.lock().await;
        let Some(io) = io.as_ref() else {
            return Err(TerminalError::NotRunning);
        };
        set_winsize(&io.master, cols, rows)
    }

    /// Nudge the shell into printing its first prompt by sending a newline.
    pub async fn init_prompt(&self) -> Result<(), TerminalError> {
        self.write("\n").await
    }

    /// Tear the terminal down: kill the child, reap it with a bounded
    /// grace, close the PTY master, and emit [`TerminalEvent::Closed`].
    ///
    /// Only the first caller performs the teardown; later calls (including
    /// the pump's own close after EOF) return immediately.
    pub async fn close(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_RUNNING,
                STATE_CLOSING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(pid = self.pid, "kill failed: {e}");
            }
            match tokio::time::timeout(REAP_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(pid = self.pid, "child reaped: {status}"),
                Ok(Err(e)) => warn!(pid = self.pid, "child wait failed: {e}"),
                // kill_on_drop re-kills the abandoned child.
                Err(_) => warn!(pid = self.pid, "child not reaped within grace, abandoning"),
            }
        }

        // Dropping the writer dup and the master OwnedFd closes our side of
        // the PTY; the pump's reader dup dies on its next read.
        self.inner.io.lock().await.take();

        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        let _ = self.inner.events.send(TerminalEvent::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const TEST_SHELL: &str = "/bin/sh";

    async fn next_data(rx: &mut mpsc::Receiver<TerminalEvent>) -> String {
        match timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for terminal event")
        {
            Some(TerminalEvent::Data(data)) => data,
            Some(TerminalEvent::Closed) => panic!("terminal closed before producing data"),
            None => panic!("event channel closed"),
        }
    }

    /// Drain events until the output seen so far contains `needle`.
    async fn wait_for_output(rx: &mut mpsc::Receiver<TerminalEvent>, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            seen.push_str(&next_data(rx).await);
        }
        seen
    }

    #[tokio::test]
    async fn spawns_and_echoes_command_output() {
        let (tx, mut rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");
        assert!(terminal.pid() > 0);

        terminal.write("echo tunnel-check\n").await.unwrap();
        let output = wait_for_output(&mut rx, "tunnel-check").await;
        assert!(output.contains("tunnel-check"));

        terminal.close().await;
    }

    #[tokio::test]
    async fn write_of_only_nul_bytes_is_a_noop() {
        let (tx, _rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");

        terminal.write("\0").await.unwrap();
        terminal.write("\0\0\0").await.unwrap();

        terminal.close().await;
    }

    #[tokio::test]
    async fn strips_embedded_nul_bytes_from_input() {
        let (tx, mut rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");

        terminal.write("echo a\0b\0c\n").await.unwrap();
        let output = wait_for_output(&mut rx, "abc").await;
        assert!(output.contains("abc"));

        terminal.close().await;
    }

    #[tokio::test]
    async fn resize_accepts_zero_by_zero() {
        let (tx, _rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");

        terminal.resize(120, 40).await.unwrap();
        terminal.resize(0, 0).await.unwrap();

        terminal.close().await;
    }

    #[tokio::test]
    async fn close_fires_closed_exactly_once() {
        let (tx, mut rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");

        terminal.close().await;
        terminal.close().await;

        let mut closed_count = 0;
        while let Ok(Some(event)) = timeout(Duration::from_millis(500), rx.recv()).await {
            if event == TerminalEvent::Closed {
                closed_count += 1;
            }
        }
        assert_eq!(closed_count, 1);
    }

    #[tokio::test]
    async fn write_and_resize_fail_after_close() {
        let (tx, _rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");

        terminal.close().await;

        assert!(matches!(
            terminal.write("echo nope\n").await,
            Err(TerminalError::NotRunning)
        ));
        assert!(matches!(
            terminal.resize(80, 24).await,
            Err(TerminalError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn child_exit_drives_close_path() {
        let (tx, mut rx) = mpsc::channel(64);
        let terminal = Terminal::spawn(TEST_SHELL, tx).expect("spawn shell");

        terminal.write("exit\n").await.unwrap();

        let mut saw_closed = false;
        while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
            if event == TerminalEvent::Closed {
                saw_closed = true;
                break;
            }
        }
        assert!(saw_closed, "terminal did not close after child exit");
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_binary() {
        let (tx, _rx) = mpsc::channel(64);
        let result = Terminal::spawn("/nonexistent/shell", tx);
        assert!(matches!(result, Err(TerminalError::Spawn(_))));
    }
}
