use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use super::NodeError;
use crate::constants::close_codes;
use crate::internal::prelude::*;
use crate::internal::tokio::spawn_named;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Handshake state of one physical connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadyState {
    NotYetConnected,
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
pub(crate) enum Command {
    Text(String),
    Close(u16, String),
}

/// What a physical connection reports to its owner.
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    Open,
    Message(String),
    Close { code: u16, reason: String, remote: bool },
    Error(Error),
}

/// A [`ConnectionEvent`] together with the physical connection it came from.
#[derive(Debug)]
pub(crate) struct TaggedEvent {
    pub generation: u64,
    pub event: ConnectionEvent,
}

/// Everything needed to open a physical connection to a node.
#[derive(Clone, Debug)]
pub(crate) struct ConnectOptions {
    pub url: Url,
    pub headers: Vec<(&'static str, HeaderValue)>,
    pub handshake_timeout: Duration,
    pub connection_lost_timeout: Duration,
}

impl ConnectOptions {
    pub(crate) fn request(&self) -> Result<Request> {
        let mut request = self.url.as_str().into_client_request()?;

        for (name, value) in &self.headers {
            request.headers_mut().insert(*name, value.clone());
        }

        Ok(request)
    }
}

/// One physical connection. Single use: once closed it is replaced, never reopened.
///
/// Dropping it drops the command sender, which makes its task close the connection.
struct Socket {
    generation: u64,
    state: watch::Receiver<ReadyState>,
    commands: mpsc::UnboundedSender<Command>,
    failure: Arc<Mutex<Option<NodeError>>>,
    #[cfg(test)]
    loopback: Option<watch::Sender<ReadyState>>,
}

impl Socket {
    fn ready_state(&self) -> ReadyState {
        // A driver that went away without saying so is as good as closed.
        if self.state.has_changed().is_err() {
            return ReadyState::Closed;
        }

        *self.state.borrow()
    }
}

/// A reconnect-capable control channel to a node.
///
/// The connection presents one long-lived channel over a sequence of physical connections.
/// Sending is at-most-once: frames sent while the channel is not open are dropped, not queued,
/// and never replayed after a reconnect.
///
/// Lifecycle notifications are pushed as [`TaggedEvent`]s onto the channel given at construction,
/// so no owner code ever runs on the connection's own task.
pub struct NodeConnection {
    name: Arc<str>,
    options: ConnectOptions,
    events: mpsc::UnboundedSender<TaggedEvent>,
    socket: Mutex<Option<Socket>>,
    generation: AtomicU64,
}

impl NodeConnection {
    pub(crate) fn new(
        name: Arc<str>,
        options: ConnectOptions,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Self {
        Self {
            name,
            options,
            events,
            socket: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Opens a new physical connection, unless one is already open or opening.
    ///
    /// This does not wait for the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the handshake request could not be built from the node address.
    #[cfg_attr(feature = "tracing_instrument", tracing::instrument(skip(self)))]
    pub fn connect(&self) -> Result<()> {
        let mut socket = self.socket.lock();

        if socket.as_ref().is_some_and(|s| s.ready_state() != ReadyState::Closed) {
            return Ok(());
        }

        let request = self.options.request()?;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (state_tx, state_rx) = watch::channel(ReadyState::NotYetConnected);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let failure = Arc::new(Mutex::new(None));

        let task = ConnectionTask {
            name: Arc::clone(&self.name),
            generation,
            handshake_timeout: self.options.handshake_timeout,
            connection_lost_timeout: self.options.connection_lost_timeout,
            state: state_tx,
            commands: command_rx,
            events: self.events.clone(),
            failure: Arc::clone(&failure),
        };

        debug!("[Node {}] Opening connection #{} to {}", self.name, generation, self.options.url);
        spawn_named("node::connection", task.run(request));

        *socket = Some(Socket {
            generation,
            state: state_rx,
            commands: command_tx,
            failure,
            #[cfg(test)]
            loopback: None,
        });

        Ok(())
    }

    /// Like [`Self::connect`], but waits until the handshake has completed or failed.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError`] if the handshake failed or timed out.
    pub async fn connect_blocking(&self) -> Result<()> {
        self.connect()?;

        let (mut state, failure) = {
            let socket = self.socket.lock();
            let socket = socket.as_ref().ok_or(NodeError::Closed)?;

            (socket.state.clone(), Arc::clone(&socket.failure))
        };

        let ready = state.wait_for(|s| *s != ReadyState::NotYetConnected).await.map(|s| *s);

        match ready {
            Ok(ReadyState::Open) => Ok(()),
            _ => {
                let why = failure.lock().clone().unwrap_or(NodeError::Closed);

                Err(why.into())
            },
        }
    }

    /// Sends a frame if the channel is open, otherwise drops it.
    pub fn send(&self, frame: &Value) {
        self.send_text(frame.to_string());
    }

    pub(crate) fn send_text(&self, text: String) {
        let socket = self.socket.lock();

        match socket.as_ref() {
            Some(socket) if socket.ready_state() == ReadyState::Open => {
                trace!("[Node {}] Sending {}", self.name, text);

                if socket.commands.send(Command::Text(text)).is_err() {
                    debug!("[Node {}] Connection task gone, dropping frame", self.name);
                }
            },
            Some(socket) if socket.ready_state() == ReadyState::NotYetConnected => {
                warn!("[Node {}] Attempting to send while connecting, dropping frame", self.name);
            },
            _ => {
                warn!("[Node {}] Attempting to send while not open, dropping frame", self.name);
            },
        }
    }

    /// Starts closing the current physical connection, if any.
    ///
    /// A connection that is still in its handshake is abandoned.
    pub fn close(&self, code: u16, reason: &str) {
        let socket = self.socket.lock();

        let Some(socket) = socket.as_ref() else { return };

        if matches!(socket.ready_state(), ReadyState::NotYetConnected | ReadyState::Open)
            && socket.commands.send(Command::Close(code, reason.to_owned())).is_err()
        {
            debug!("[Node {}] Connection task gone while closing", self.name);
        }
    }

    /// The handshake state of the current physical connection.
    ///
    /// Without any physical connection yet, this reports [`ReadyState::Closed`].
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.socket.lock().as_ref().map_or(ReadyState::Closed, Socket::ready_state)
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ready_state() == ReadyState::Open
    }

    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.ready_state() == ReadyState::NotYetConnected
    }

    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.ready_state() == ReadyState::Closing
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ready_state() == ReadyState::Closed
    }

    /// Whether events of the given physical connection are still relevant.
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.socket.lock().as_ref().is_some_and(|s| s.generation == generation)
    }

    /// Installs an open physical connection whose outbound frames end up in the returned receiver.
    #[cfg(test)]
    pub(crate) fn open_loopback(&self) -> (u64, mpsc::UnboundedReceiver<Command>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (state_tx, state_rx) = watch::channel(ReadyState::Open);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        *self.socket.lock() = Some(Socket {
            generation,
            state: state_rx,
            commands: command_tx,
            failure: Arc::new(Mutex::new(None)),
            loopback: Some(state_tx),
        });

        (generation, command_rx)
    }

    /// Moves a loopback connection to the given state.
    #[cfg(test)]
    pub(crate) fn set_loopback_state(&self, state: ReadyState) {
        if let Some(tx) = self.socket.lock().as_ref().and_then(|s| s.loopback.as_ref()) {
            tx.send_replace(state);
        }
    }
}

struct ConnectionTask {
    name: Arc<str>,
    generation: u64,
    handshake_timeout: Duration,
    connection_lost_timeout: Duration,
    state: watch::Sender<ReadyState>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<TaggedEvent>,
    failure: Arc<Mutex<Option<NodeError>>>,
}

impl ConnectionTask {
    fn emit(&self, event: ConnectionEvent) {
        let tagged = TaggedEvent {
            generation: self.generation,
            event,
        };

        if self.events.send(tagged).is_err() {
            trace!("[Node {}] Event receiver gone", self.name);
        }
    }

    fn fail(&self, why: NodeError) {
        *self.failure.lock() = Some(why);
        self.state.send_replace(ReadyState::Closed);
    }

    async fn run(mut self, request: Request) {
        let handshake = timeout(self.handshake_timeout, connect_async(request));

        let stream = tokio::select! {
            result = handshake => match result {
                Ok(Ok((stream, _))) => stream,
                Ok(Err(why)) => {
                    let failure = NodeError::HandshakeFailed(why.to_string());

                    self.emit(ConnectionEvent::Error(why.into()));
                    self.fail(failure);

                    return;
                },
                Err(_) => {
                    self.emit(ConnectionEvent::Error(NodeError::HandshakeTimeout.into()));
                    self.fail(NodeError::HandshakeTimeout);

                    return;
                },
            },
            _ = self.commands.recv() => {
                debug!("[Node {}] Closed before the handshake completed", self.name);
                self.fail(NodeError::Closed);

                return;
            },
        };

        self.state.send_replace(ReadyState::Open);
        self.emit(ConnectionEvent::Open);

        let (code, reason, remote) = self.drive(stream).await;

        // Must precede the state change: events of a replacement connection queue behind it.
        self.emit(ConnectionEvent::Close {
            code,
            reason,
            remote,
        });
        self.state.send_replace(ReadyState::Closed);
    }

    async fn drive(&mut self, mut stream: WsStream) -> (u16, String, bool) {
        let keepalive_period = self.connection_lost_timeout / 2;
        let mut keepalive = interval_at(Instant::now() + keepalive_period, keepalive_period);
        let mut last_seen = Instant::now();
        let mut remote_close = None;

        loop {
            let deadline = last_seen + self.connection_lost_timeout;

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Text(text)) => {
                        if let Err(why) = stream.send(Message::Text(text)).await {
                            self.emit(ConnectionEvent::Error(why.into()));

                            return (close_codes::ABNORMAL, String::new(), false);
                        }
                    },
                    Some(Command::Close(code, reason)) => {
                        self.close(&mut stream, code, &reason).await;

                        return (code, reason, false);
                    },
                    None => {
                        self.close(&mut stream, close_codes::NORMAL, "").await;

                        return (close_codes::NORMAL, String::new(), false);
                    },
                },
                message = stream.next() => {
                    last_seen = Instant::now();

                    match message {
                        Some(Ok(Message::Text(text))) => self.emit(ConnectionEvent::Message(text)),
                        Some(Ok(Message::Close(frame))) => {
                            self.state.send_replace(ReadyState::Closing);
                            remote_close = Some(frame.map_or((1005, String::new()), |f| {
                                (u16::from(f.code), f.reason.into_owned())
                            }));
                        },
                        Some(Ok(_)) => {},
                        Some(Err(WsError::ConnectionClosed)) | None => {
                            let (code, reason) =
                                remote_close.take().unwrap_or((close_codes::ABNORMAL, String::new()));

                            return (code, reason, true);
                        },
                        Some(Err(why)) => {
                            if let Some((code, reason)) = remote_close.take() {
                                return (code, reason, true);
                            }

                            self.emit(ConnectionEvent::Error(why.into()));

                            return (close_codes::ABNORMAL, String::new(), true);
                        },
                    }
                },
                _ = keepalive.tick() => {
                    if let Err(why) = stream.send(Message::Ping(Vec::new())).await {
                        self.emit(ConnectionEvent::Error(why.into()));

                        return (close_codes::ABNORMAL, String::new(), false);
                    }
                },
                () = sleep_until(deadline) => {
                    warn!("[Node {}] Nothing received for {:?}, connection lost", self.name, self.connection_lost_timeout);

                    return (close_codes::ABNORMAL, "Connection lost".to_owned(), false);
                },
            }
        }
    }

    async fn close(&self, stream: &mut WsStream, code: u16, reason: &str) {
        self.state.send_replace(ReadyState::Closing);
        info!("[Node {}] Closing connection with {}", self.name, code);

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };

        if let Err(why) = stream.close(Some(frame)).await {
            debug!("[Node {}] Error sending close frame: {:?}", self.name, why);

            return;
        }

        // Wait for the node to acknowledge the close.
        let drain = async { while let Some(Ok(_)) = stream.next().await {} };

        if timeout(self.handshake_timeout, drain).await.is_err() {
            debug!("[Node {}] Close handshake timed out", self.name);
        }
    }
}
