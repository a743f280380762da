#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use strum_macros::Display;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, sleep_until, timeout};
use tokio_util::sync::CancellationToken;

use super::batch::{BatchProcessor, Dispatch, InboundBuffer, processor_for};
use super::config::Config;
use super::error::WsError;
use super::events::{EventRegistry, HandlerId};
use super::heartbeat::HeartbeatState;
use super::message::{
    ABNORMAL_CLOSURE, ConnectionEvent, ErrorEvent, ErrorSource, Event, EventKind,
    MANUAL_DISCONNECT_REASON, NORMAL_CLOSURE, OrderRequest, OutboundMessage, Side,
    parse_messages,
};
use super::reconnect::ReconnectPolicy;
use super::traits::{CloseFrame, Connector, Frame, FrameSink, FrameStream};
use super::transport::TungsteniteConnector;

/// Upper bound for delivering the close frame of a manual disconnect.
const CLOSE_FRAME_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected
    #[default]
    Idle,
    /// Handshake in progress
    Connecting,
    /// Handshake completed, frames flowing
    Open,
    /// Manual disconnect in progress
    Closing,
    /// Closed, possibly with a reconnect scheduled
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Manages the WebSocket lifecycle: connect timeout, reconnection with exponential backoff,
/// heartbeat probing, inbound batching and event dispatch.
///
/// Every connection attempt bumps a generation counter. The session task, reconnect timer and
/// flushed batches carry the generation they were started with and are ignored once a newer
/// attempt exists, so callbacks of an old connection never act on a new one.
///
/// Cloning is cheap; all clones drive the same connection.
///
/// # Example
///
/// ```ignore
/// let connection = ConnectionManager::new("wss://example.com/automation", Config::default());
/// connection.on(EventKind::TickData, |event| println!("{event:?}"));
/// connection.connect();
///
/// connection.subscribe_symbol("AAPL");
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    config: Config,
    connector: Arc<dyn Connector>,
    registry: Arc<EventRegistry>,
    processor: Arc<dyn BatchProcessor>,
    machine: Mutex<Machine>,
    state_tx: watch::Sender<ConnectionState>,
}

struct Machine {
    state: ConnectionState,
    generation: u64,
    reconnect: ReconnectPolicy,
    heartbeat: HeartbeatState,
    /// Set by `disconnect()` or a peer close carrying the manual reason
    manual: bool,
    session: Option<Session>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Session {
    cancel: CancellationToken,
    /// Present once the handshake completed
    outbound: Option<mpsc::UnboundedSender<String>>,
}

/// Why a session's read loop ended.
enum CloseOutcome {
    Manual,
    Remote(Option<CloseFrame>),
    Failed(WsError),
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.url)
            .field("state", &*self.inner.state_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager for `url` that connects with `tokio-tungstenite`.
    ///
    /// Nothing happens on the network until [`connect`](Self::connect) is called.
    #[must_use]
    pub fn new<S: Into<String>>(url: S, config: Config) -> Self {
        Self::with_connector(url, config, TungsteniteConnector)
    }

    /// Create a manager that opens its connections through `connector`.
    #[must_use]
    pub fn with_connector<S, C>(url: S, config: Config, connector: C) -> Self
    where
        S: Into<String>,
        C: Connector,
    {
        let registry = Arc::new(EventRegistry::new());
        let processor = processor_for(config.processor, Arc::clone(&registry));
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let machine = Machine {
            state: ConnectionState::Idle,
            generation: 0,
            reconnect: ReconnectPolicy::new(&config.reconnect),
            heartbeat: HeartbeatState::new(&config.heartbeat),
            manual: false,
            session: None,
            reconnect_timer: None,
        };

        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                config,
                connector: Arc::new(connector),
                registry,
                processor,
                machine: Mutex::new(machine),
                state_tx,
            }),
        }
    }

    /// Start connecting. No-op while already connecting or open.
    ///
    /// Called after a manual disconnect or after reconnection gave up, the attempt counter starts
    /// over from zero.
    pub fn connect(&self) {
        let mut machine = self.inner.lock();
        if matches!(
            machine.state,
            ConnectionState::Connecting | ConnectionState::Open
        ) {
            return;
        }

        if machine.manual || machine.reconnect.is_exhausted() {
            machine.reconnect.reset();
        }
        machine.manual = false;
        self.inner.begin_connect(&mut machine);
    }

    /// Close the connection with `1000 "Manual disconnect"` and stop reconnecting.
    pub fn disconnect(&self) {
        let mut machine = self.inner.lock();
        machine.manual = true;
        machine.reconnect.exhaust();
        if let Some(timer) = machine.reconnect_timer.take() {
            timer.abort();
        }

        match machine.state {
            ConnectionState::Open => {
                // The session sends the close frame and finishes the transition to `Closed`
                self.inner.set_state(&mut machine, ConnectionState::Closing);
                if let Some(session) = &machine.session {
                    session.cancel.cancel();
                }
            }
            ConnectionState::Connecting => {
                machine.generation += 1;
                if let Some(session) = machine.session.take() {
                    session.cancel.cancel();
                }
                self.inner.set_state(&mut machine, ConnectionState::Closed);
            }
            ConnectionState::Idle | ConnectionState::Closing | ConnectionState::Closed => {}
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(url = %self.inner.url, "manual disconnect requested");
    }

    /// Disconnect and drop every registered handler.
    pub fn dispose(&self) {
        self.disconnect();
        self.inner.registry.clear();
    }

    /// Serialize `message` and write it as a text frame.
    ///
    /// Returns `false` unless the connection is open; nothing is queued for a later connection.
    pub fn send<R: Serialize>(&self, message: &R) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "unable to serialize outbound message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                false
            }
        }
    }

    /// Write a raw text frame. Returns `false` unless the connection is open.
    pub fn send_text<S: Into<String>>(&self, text: S) -> bool {
        let machine = self.inner.lock();
        if !machine.state.is_open() {
            return false;
        }
        machine
            .session
            .as_ref()
            .and_then(|session| session.outbound.as_ref())
            .is_some_and(|outbound| outbound.send(text.into()).is_ok())
    }

    pub fn subscribe_symbol(&self, symbol: &str) -> bool {
        self.send(&OutboundMessage::Subscribe {
            symbol: symbol.to_owned(),
        })
    }

    pub fn unsubscribe_symbol(&self, symbol: &str) -> bool {
        self.send(&OutboundMessage::Unsubscribe {
            symbol: symbol.to_owned(),
        })
    }

    pub fn place_order(&self, side: Side, order: OrderRequest) -> bool {
        self.send(&OutboundMessage::order(side, order))
    }

    pub fn request_portfolio(&self) -> bool {
        self.send(&OutboundMessage::GetPortfolio)
    }

    pub fn ping(&self) -> bool {
        self.send(&OutboundMessage::Ping)
    }

    /// Register `handler` for events of `kind`. See [`EventRegistry::on`].
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.registry.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.inner.registry.off(kind, id)
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Receiver notified on every state transition.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    #[must_use]
    pub fn heartbeat(&self) -> HeartbeatState {
        self.inner.lock().heartbeat
    }

    /// Whether the open connection has been silent for longer than the heartbeat timeout.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        let machine = self.inner.lock();
        machine.state.is_open() && machine.heartbeat.is_degraded(Instant::now())
    }

    /// Reconnects scheduled in the current outage.
    #[must_use]
    pub fn reconnect_attempt(&self) -> u32 {
        self.inner.lock().reconnect.attempt()
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.inner.url
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Machine> {
        // Never held across a handler call or an await point, so poisoning leaves it consistent
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, machine: &mut Machine, state: ConnectionState) {
        if machine.state != state {
            #[cfg(feature = "tracing")]
            tracing::debug!(from = %machine.state, to = %state, generation = machine.generation, "connection state changed");
            machine.state = state;
            self.state_tx.send_replace(state);
        }
    }

    fn dispatch(&self, events: Vec<Event>) {
        for event in events {
            self.processor.submit(Dispatch::Event(event));
        }
    }

    fn begin_connect(self: &Arc<Self>, machine: &mut Machine) {
        machine.generation += 1;
        let generation = machine.generation;

        if let Some(timer) = machine.reconnect_timer.take() {
            timer.abort();
        }
        if let Some(session) = machine.session.take() {
            session.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        machine.session = Some(Session {
            cancel: cancel.clone(),
            outbound: None,
        });
        self.set_state(machine, ConnectionState::Connecting);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.run_session(generation, cancel).await;
        });
    }

    async fn run_session(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let connect_timeout = self.config.connect_timeout;
        let attempt = timeout(connect_timeout, self.connector.connect(&self.url));

        let result = tokio::select! {
            () = cancel.cancelled() => return,
            result = attempt => result.unwrap_or_else(|_elapsed| Err(WsError::Timeout)),
        };

        let (sink, stream) = match result {
            Ok(halves) => halves,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(url = %self.url, timeout = ?connect_timeout, error = %e, "unable to connect");
                let error = match e {
                    WsError::Timeout => ErrorEvent::new(
                        ErrorSource::Timeout,
                        format!("{e} after {connect_timeout:?}"),
                    ),
                    e => ErrorEvent::new(ErrorSource::Transport, e.to_string()),
                };
                self.connect_failed(generation, error);
                return;
            }
        };

        let Some(outbound) = self.opened(generation) else {
            return;
        };
        let outcome = self
            .drive(generation, sink, stream, outbound, &cancel)
            .await;
        self.closed(generation, outcome);
    }

    fn opened(&self, generation: u64) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut machine = self.lock();
        if machine.generation != generation || machine.state != ConnectionState::Connecting {
            return None;
        }

        machine.reconnect.reset();
        machine.heartbeat = HeartbeatState::opened(&self.config.heartbeat, Instant::now());
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(session) = machine.session.as_mut() {
            session.outbound = Some(tx);
        }
        self.set_state(&mut machine, ConnectionState::Open);
        drop(machine);

        #[cfg(feature = "tracing")]
        tracing::info!(url = %self.url, generation, "connection open");
        self.dispatch(vec![Event::Connection(ConnectionEvent::connected())]);
        Some(rx)
    }

    fn connect_failed(self: &Arc<Self>, generation: u64, error: ErrorEvent) {
        let mut machine = self.lock();
        if machine.generation != generation || machine.state != ConnectionState::Connecting {
            return;
        }

        machine.session = None;
        self.set_state(&mut machine, ConnectionState::Closed);
        let mut events = vec![Event::Error(error)];
        events.extend(self.schedule_reconnect(&mut machine, generation));
        drop(machine);

        self.dispatch(events);
    }

    fn closed(self: &Arc<Self>, generation: u64, outcome: CloseOutcome) {
        let mut machine = self.lock();
        if machine.generation != generation {
            return;
        }

        let (code, reason) = match outcome {
            CloseOutcome::Manual => (NORMAL_CLOSURE, MANUAL_DISCONNECT_REASON.to_owned()),
            CloseOutcome::Remote(Some(frame)) => (frame.code, frame.reason),
            CloseOutcome::Remote(None) => (ABNORMAL_CLOSURE, "connection lost".to_owned()),
            CloseOutcome::Failed(e) => (ABNORMAL_CLOSURE, e.to_string()),
        };
        let planned =
            machine.manual || (code == NORMAL_CLOSURE && reason == MANUAL_DISCONNECT_REASON);

        #[cfg(feature = "tracing")]
        tracing::info!(url = %self.url, code, %reason, planned, "connection closed");

        machine.session = None;
        self.set_state(&mut machine, ConnectionState::Closed);
        let mut events = vec![Event::Connection(ConnectionEvent::disconnected(
            code, reason,
        ))];
        if planned {
            machine.manual = true;
            machine.reconnect.exhaust();
        } else {
            events.extend(self.schedule_reconnect(&mut machine, generation));
        }
        drop(machine);

        self.dispatch(events);
    }

    /// Schedule the next reconnect, or produce the terminal error once attempts ran out.
    fn schedule_reconnect(self: &Arc<Self>, machine: &mut Machine, generation: u64) -> Option<Event> {
        let Some(delay) = machine.reconnect.next_delay() else {
            let max_attempts = machine.reconnect.max_attempts();
            #[cfg(feature = "tracing")]
            tracing::error!(url = %self.url, max_attempts, "giving up reconnecting");
            return Some(Event::Error(ErrorEvent::reconnect_exhausted(max_attempts)));
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            url = %self.url,
            attempt = machine.reconnect.attempt(),
            ?delay,
            "scheduling reconnect"
        );

        let inner = Arc::clone(self);
        machine.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            inner.reconnect_due(generation);
        }));
        None
    }

    fn reconnect_due(self: &Arc<Self>, generation: u64) {
        let mut machine = self.lock();
        if machine.generation != generation
            || machine.manual
            || machine.state != ConnectionState::Closed
        {
            return;
        }

        // This is the running timer; detach it instead of aborting it
        drop(machine.reconnect_timer.take());
        self.begin_connect(&mut machine);
    }

    async fn drive(
        &self,
        generation: u64,
        mut sink: FrameSink,
        mut stream: FrameStream,
        mut outbound: mpsc::UnboundedReceiver<String>,
        cancel: &CancellationToken,
    ) -> CloseOutcome {
        let heartbeat = &self.config.heartbeat;
        let mut ticker = interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buffer = InboundBuffer::new(self.config.batch);

        let outcome = loop {
            let deadline = buffer.deadline();

            tokio::select! {
                () = cancel.cancelled() => {
                    let close = Frame::Close(Some(CloseFrame::new(
                        NORMAL_CLOSURE,
                        MANUAL_DISCONNECT_REASON,
                    )));
                    let delivered =
                        matches!(timeout(CLOSE_FRAME_TIMEOUT, sink.send(close)).await, Ok(Ok(())));
                    #[cfg(feature = "tracing")]
                    if !delivered {
                        tracing::debug!("close frame not delivered");
                    }
                    #[cfg(not(feature = "tracing"))]
                    let _ = delivered;
                    break CloseOutcome::Manual;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Frame::Text(text))) => self.receive(generation, &text, &mut buffer),
                    Some(Ok(Frame::Close(close))) => break CloseOutcome::Remote(close),
                    Some(Err(e)) => break CloseOutcome::Failed(e),
                    None => break CloseOutcome::Remote(None),
                },
                Some(text) = outbound.recv() => {
                    if let Err(e) = sink.send(Frame::Text(text)).await {
                        break CloseOutcome::Failed(e);
                    }
                }
                _ = ticker.tick() => self.send_ping(generation, &mut sink).await,
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(generation, &mut buffer);
                }
            }
        };

        // Subscribers see every message of this connection before its disconnect event
        self.flush(generation, &mut buffer);
        outcome
    }

    fn receive(&self, generation: u64, text: &str, buffer: &mut InboundBuffer) {
        let now = Instant::now();
        {
            let mut machine = self.lock();
            if machine.generation == generation {
                machine.heartbeat.frame_seen(now);
            }
        }

        let ack_kind = self.config.heartbeat.ack_kind.as_str();
        if text.trim().eq_ignore_ascii_case(ack_kind) {
            return;
        }

        match parse_messages(text.as_bytes()) {
            Ok(messages) => {
                for message in messages {
                    if message.kind.eq_ignore_ascii_case(ack_kind) {
                        continue;
                    }
                    if buffer.push(message, now) {
                        self.flush(generation, buffer);
                    }
                }
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(%text, error = %e, "failed to parse websocket message");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    fn flush(&self, generation: u64, buffer: &mut InboundBuffer) {
        if buffer.is_empty() {
            return;
        }

        let batch = buffer.take();
        if self.lock().generation != generation {
            #[cfg(feature = "tracing")]
            tracing::debug!(dropped = batch.len(), "discarding batch of a superseded connection");
            return;
        }
        self.processor.submit(Dispatch::Batch(batch));
    }

    async fn send_ping(&self, generation: u64, sink: &mut FrameSink) {
        let ping = match serde_json::to_string(&OutboundMessage::Ping) {
            Ok(ping) => ping,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "unable to encode heartbeat ping");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        // A failed ping is only logged; the read loop notices a dead socket on its own
        if let Err(e) = sink.send(Frame::Text(ping)).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "heartbeat ping failed");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return;
        }

        let mut machine = self.lock();
        if machine.generation == generation {
            machine.heartbeat.ping_sent(Instant::now());
        }
    }
}
