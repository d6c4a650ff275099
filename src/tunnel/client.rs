//! Tunnel controller — outbound WS connection from device to controller.
//!
//! [`Tunnel::run`] maintains the persistent connection: dial, dispatch
//! inbound envelopes until disconnect, tear down every session, then
//! reconnect with exponential backoff. Session terminals feed their output
//! back through per-session forwarder tasks that turn
//! [`TerminalEvent`]s into outbound `output`/`end` envelopes.
//!
//! Sessions never survive a disconnect: the registry is drained and every
//! terminal closed before a new connection is attempted, so the peer must
//! re-issue `start` after a reconnect.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::envelope::{self, Envelope};
use super::registry::SessionRegistry;
use super::socket::{Socket, SocketEvent};
use super::Backoff;
use crate::config::Config;
use crate::terminal::{Terminal, TerminalEvent};

/// Buffer size of the socket and terminal event channels.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Reconnect backoff and the shutdown latch, behind one lock.
struct TunnelState {
    backoff: Backoff,
    exiting: bool,
}

struct TunnelInner {
    config: Arc<Config>,
    registry: SessionRegistry,
    state: Mutex<TunnelState>,
    /// The live connection, absent between reconnects.
    socket: Mutex<Option<Socket>>,
    /// Wakes the backoff sleep when shutdown is requested.
    shutdown: Notify,
}

/// The tunnel controller. Cheaply cloneable handle.
#[derive(Clone)]
pub struct Tunnel {
    inner: Arc<TunnelInner>,
}

impl Tunnel {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(TunnelInner {
                config: Arc::new(config),
                registry: SessionRegistry::new(),
                state: Mutex::new(TunnelState {
                    backoff: Backoff::new(),
                    exiting: false,
                }),
                socket: Mutex::new(None),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Main loop: connect, handle messages, reconnect on failure. Returns
    /// once [`Tunnel::close`] has been called.
    pub async fn run(&self) {
        loop {
            if self.exiting().await {
                break;
            }

            let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
            info!(url = %self.inner.config.cloud, "tunnel connecting");
            match Socket::connect(&self.inner.config.cloud, events_tx).await {
                Ok(socket) => {
                    if self.exiting().await {
                        socket.close().await;
                        break;
                    }
                    *self.inner.socket.lock().await = Some(socket);
                    self.run_connection(events_rx).await;
                    if let Some(socket) = self.inner.socket.lock().await.take() {
                        socket.close().await;
                    }
                    // Sessions do not carry across reconnects.
                    self.close_all_terminals().await;
                }
                Err(e) => warn!("tunnel connect failed: {e}"),
            }

            // Register for shutdown before re-checking the flag, so a close
            // racing this gap still cancels the backoff sleep.
            let mut shutdown = std::pin::pin!(self.inner.shutdown.notified());
            shutdown.as_mut().enable();
            if self.exiting().await {
                break;
            }
            let delay = { self.inner.state.lock().await.backoff.next_delay() };
            info!("tunnel reconnecting in {}s", delay.as_secs());
            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(delay) => {}
            }
        }
        debug!("tunnel loop exited");
    }

    /// Consume socket events for one connection until it disconnects.
    async fn run_connection(&self, mut events: mpsc::Receiver<SocketEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                SocketEvent::Connected => {
                    info!(url = %self.inner.config.cloud, "tunnel connected");
                    self.inner.state.lock().await.backoff.reset();
                }
                SocketEvent::Message(text) => self.dispatch(&text).await,
                SocketEvent::Disconnected(error) => {
                    match error {
                        Some(e) => warn!("tunnel disconnected: {e}"),
                        None => info!("tunnel disconnected"),
                    }
                    return;
                }
            }
        }
    }

    /// Validate and route one inbound message. Malformed envelopes are
    /// dropped here with no state change.
    async fn dispatch(&self, text: &str) {
        let envelope = match envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(payload = text, "{e}");
                return;
            }
        };

        match envelope {
            Envelope::Start { session_id } => self.handle_start(session_id).await,
            Envelope::Input { session_id, data } => {
                let Some(terminal) = self.inner.registry.get(&session_id).await else {
                    debug!(session = %session_id, "input for unknown session, dropping");
                    return;
                };
                if let Err(e) = terminal.write(&data).await {
                    warn!(session = %session_id, "terminal write failed: {e}");
                }
            }
            Envelope::Resize {
                session_id,
                width,
                height,
            } => {
                let Some(terminal) = self.inner.registry.get(&session_id).await else {
                    debug!(session = %session_id, "resize for unknown session, dropping");
                    return;
                };
                debug!(session = %session_id, width, height, "resizing terminal");
                if let Err(e) = terminal.resize(width, height).await {
                    warn!(session = %session_id, "terminal resize failed: {e}");
                }
            }
            Envelope::End { session_id } => {
                let Some(terminal) = self.inner.registry.get(&session_id).await else {
                    debug!(session = %session_id, "end for unknown session, dropping");
                    return;
                };
                info!(session = %session_id, "session ended by peer, closing terminal");
                // close() waits on the child reap; keep the receive loop
                // responsive.
                tokio::spawn(async move { terminal.close().await });
            }
            Envelope::Output { session_id, .. } => {
                error!(session = %session_id, "dropping inbound output envelope");
            }
        }
    }

    /// Inbound `start`: spawn a terminal, register it, and wire its event
    /// channel to the outbound side.
    async fn handle_start(&self, session_id: String) {
        if self.inner.registry.has(&session_id).await {
            warn!(session = %session_id, "duplicate start for live session, dropping");
            return;
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let terminal = match Terminal::spawn(&self.inner.config.command, events_tx) {
            Ok(terminal) => terminal,
            Err(e) => {
                error!(session = %session_id, "failed to start terminal: {e}");
                return;
            }
        };

        info!(session = %session_id, pid = terminal.pid(), "new session, terminal created");
        self.inner
            .registry
            .set(session_id.clone(), terminal.clone())
            .await;
        self.spawn_forwarder(session_id, events_rx);

        if let Err(e) = terminal.init_prompt().await {
            debug!("prompt nudge failed: {e}");
        }
    }

    /// Per-session task: terminal events out, envelopes in flight.
    fn spawn_forwarder(&self, session_id: String, mut events: mpsc::Receiver<TerminalEvent>) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TerminalEvent::Data(data) => tunnel.send(&session_id, &data).await,
                    TerminalEvent::Closed => {
                        tunnel.inner.registry.clear(&session_id).await;
                        info!(session = %session_id, "terminal exited, notifying peer");
                        tunnel.end(&session_id).await;
                        return;
                    }
                }
            }
        });
    }

    /// Queue an `output` envelope for a session. Silently a no-op when the
    /// session is not registered — its terminal may have just closed.
    pub async fn send(&self, session_id: &str, payload: &str) {
        if !self.inner.registry.has(session_id).await {
            return;
        }
        self.send_envelope(&Envelope::Output {
            session_id: session_id.to_string(),
            data: payload.to_string(),
        })
        .await;
    }

    /// Queue an `end` envelope for a session; the payload echoes the ID.
    pub async fn end(&self, session_id: &str) {
        self.send_envelope(&Envelope::End {
            session_id: session_id.to_string(),
        })
        .await;
    }

    async fn send_envelope(&self, envelope: &Envelope) {
        let sender = self.inner.socket.lock().await.as_ref().map(Socket::sender);
        let Some(sender) = sender else {
            warn!(kind = envelope.kind(), "not connected, dropping envelope");
            return;
        };
        if let Err(e) = sender.send_text(envelope::encode(envelope)).await {
            warn!(kind = envelope.kind(), "tunnel send failed: {e}");
        }
    }

    /// Shut the tunnel down: no further reconnects, socket closed, every
    /// terminal torn down. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.exiting {
                return;
            }
            state.exiting = true;
        }
        info!("tunnel closing");
        self.inner.shutdown.notify_waiters();
        if let Some(socket) = self.inner.socket.lock().await.take() {
            socket.close().await;
        }
        self.close_all_terminals().await;
    }

    async fn exiting(&self) -> bool {
        self.inner.state.lock().await.exiting
    }

    async fn close_all_terminals(&self) {
        for (session_id, terminal) in self.inner.registry.drain().await {
            debug!(session = %session_id, "closing terminal");
            terminal.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config::from_json(r#"{"cloud":"ws://127.0.0.1:1/terminal","command":"/bin/sh"}"#).unwrap()
    }

    #[tokio::test]
    async fn send_without_connection_is_a_noop() {
        let tunnel = Tunnel::new(test_config());
        // No socket, no registered session; both paths must not panic.
        tunnel.send("s1", "data").await;
        tunnel.end("s1").await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let tunnel = Tunnel::new(test_config());
        tunnel.close().await;
        tunnel.close().await;
        assert!(tunnel.exiting().await);
    }

    #[tokio::test]
    async fn run_returns_immediately_after_close() {
        let tunnel = Tunnel::new(test_config());
        tunnel.close().await;
        // exiting is set, so the loop must not attempt to connect.
        tokio::time::timeout(std::time::Duration::from_secs(1), tunnel.run())
            .await
            .expect("run did not observe the exiting flag");
    }
}
