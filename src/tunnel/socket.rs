//! WebSocket transport for the tunnel.
//!
//! [`Socket`] wraps one `tokio-tungstenite` connection. A dedicated reader
//! task drains frames and forwards them as [`SocketEvent`]s; writes come
//! from arbitrary tasks and are serialized by the send lock inside
//! [`SocketSender`]. Per connection the event stream is exactly one
//! `Connected`, then zero or more `Message`s, then exactly one
//! `Disconnected` — the emitted-once guard is shared between the reader and
//! [`Socket::close`] so a locally initiated close cannot double-fire it.
//!
//! Only text frames carry protocol data; binary frames are logged and
//! dropped. Ping/pong stays inside tungstenite.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// How long a locally initiated close waits for the peer to acknowledge the
/// close frame before tearing down anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Events emitted by a socket on its event channel, in connection order.
#[derive(Debug)]
pub enum SocketEvent {
    /// The connection is established. First event, exactly once.
    Connected,
    /// One inbound text frame.
    Message(String),
    /// The connection is gone. Last event, exactly once. Carries the
    /// transport error for abnormal closures, `None` for a normal close.
    Disconnected(Option<WsError>),
}

/// Errors from dialing or writing to the socket.
#[derive(Debug)]
pub enum SocketError {
    /// The initial dial failed.
    Connect(WsError),
    /// A write on the established connection failed.
    Send(WsError),
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SocketError::Connect(e) => write!(f, "failed to connect: {e}"),
            SocketError::Send(e) => write!(f, "failed to send: {e}"),
        }
    }
}

impl std::error::Error for SocketError {}

/// Cheap cloneable write handle. All clones share the send lock, so
/// concurrent producers are serialized and frames never interleave.
#[derive(Clone)]
pub struct SocketSender {
    sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
}

impl SocketSender {
    /// Send one text frame.
    pub async fn send_text(&self, text: String) -> Result<(), SocketError> {
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(text))
            .await
            .map_err(SocketError::Send)
    }
}

/// One live WebSocket connection.
pub struct Socket {
    sender: SocketSender,
    events: mpsc::Sender<SocketEvent>,
    disconnect_sent: Arc<AtomicBool>,
    reader: tokio::task::JoinHandle<()>,
}

impl Socket {
    /// Dial `url` and start the reader task. On success `Connected` has
    /// already been queued on `events` before this returns.
    pub async fn connect(
        url: &str,
        events: mpsc::Sender<SocketEvent>,
    ) -> Result<Socket, SocketError> {
        let (ws_stream, _response) = connect_async(url).await.map_err(SocketError::Connect)?;
        let (sink, stream) = ws_stream.split();

        let _ = events.send(SocketEvent::Connected).await;

        let disconnect_sent = Arc::new(AtomicBool::new(false));
        let reader = tokio::spawn(read_loop(stream, events.clone(), disconnect_sent.clone()));

        Ok(Socket {
            sender: SocketSender {
                sink: Arc::new(Mutex::new(sink)),
            },
            events,
            disconnect_sent,
            reader,
        })
    }

    /// Write handle for this connection.
    pub fn sender(&self) -> SocketSender {
        self.sender.clone()
    }

    /// Close the connection: send a normal close frame, give the peer
    /// [`CLOSE_GRACE`] to acknowledge, then tear down regardless.
    pub async fn close(mut self) {
        {
            let mut sink = self.sender.sink.lock().await;
            if let Err(e) = sink.send(Message::Close(None)).await {
                debug!("close frame write failed: {e}");
            }
        }
        if tokio::time::timeout(CLOSE_GRACE, &mut self.reader)
            .await
            .is_err()
        {
            debug!("peer did not acknowledge close, tearing down");
            self.reader.abort();
            emit_disconnected(&self.disconnect_sent, &self.events, None).await;
        }
    }
}

/// Reader task: drain frames until the connection dies, then emit the one
/// `Disconnected`.
async fn read_loop(
    mut stream: SplitStream<WsStream>,
    events: mpsc::Sender<SocketEvent>,
    disconnect_sent: Arc<AtomicBool>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                if events.send(SocketEvent::Message(text)).await.is_err() {
                    // Consumer hung up; the connection is being torn down.
                    return;
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!("peer sent close frame");
                emit_disconnected(&disconnect_sent, &events, None).await;
                return;
            }
            Some(Ok(other)) => {
                // Binary frames are not part of the protocol; ping/pong is
                // answered by tungstenite before we see it here.
                debug!("dropping unsupported frame: {other:?}");
            }
            Some(Err(e)) => {
                emit_disconnected(&disconnect_sent, &events, Some(e)).await;
                return;
            }
            None => {
                emit_disconnected(&disconnect_sent, &events, None).await;
                return;
            }
        }
    }
}

async fn emit_disconnected(
    sent: &AtomicBool,
    events: &mpsc::Sender<SocketEvent>,
    error: Option<WsError>,
) {
    if !sent.swap(true, Ordering::SeqCst) {
        let _ = events.send(SocketEvent::Disconnected(error)).await;
    }
}
