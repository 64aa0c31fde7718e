//! kdash stream: one always-on push connection per client, with bounded
//! reconnect, heartbeat pings and isolated listener fan-out.
//!
//! The client knows nothing about resource semantics. It parses each inbound
//! text frame as a [`WireMessage`] and hands it to every registered listener,
//! in receipt order, on the connection task itself.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kdash_core::{ConnectionStatus, WireMessage, HEARTBEAT_PING, HEARTBEAT_PONG};
use metrics::counter;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

mod config;
mod registry;
mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;


pub use config::{
    StreamConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL,
    MIN_HEARTBEAT_INTERVAL,
};
pub use registry::{ListenerFn, Subscription};
pub use transport::{Connector, Transport, TransportError, WsConnector};

use registry::Registry;

struct Shared {
    id: Uuid,
    status: watch::Sender<ConnectionStatus>,
    attempts: AtomicU32,
    registry: Arc<Registry>,
    last_error: Mutex<Option<TransportError>>,
}

impl Shared {
    /// Move to `next` unless already disposed; disposal is terminal.
    fn set_status(&self, next: ConnectionStatus) {
        let changed = self.status.send_if_modified(|cur| {
            if *cur == ConnectionStatus::Disposed || *cur == next {
                return false;
            }
            *cur = next;
            true
        });
        if changed {
            debug!(client_id = %self.id, status = %next, "stream: status changed");
        }
    }

    /// Record `err` and pass through `Error`.
    fn fail(&self, err: TransportError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        self.set_status(ConnectionStatus::Error);
    }

    fn deliver(&self, text: &str) {
        let text = text.trim();
        if text == HEARTBEAT_PONG {
            trace!(client_id = %self.id, "stream: heartbeat acknowledged");
            return;
        }
        counter!("stream_messages_total", 1u64);
        match serde_json::from_str::<WireMessage>(text) {
            Ok(msg) => self.registry.dispatch(&msg),
            Err(e) => {
                counter!("stream_decode_failures_total", 1u64);
                warn!(client_id = %self.id, error = %e, len = text.len(), "stream: dropping malformed message");
            }
        }
    }
}

/// Reconnecting event-stream client.
///
/// Created eagerly connecting; lives until [`dispose`](Self::dispose) is called,
/// the handle is dropped, or reconnect attempts run out.
pub struct EventStreamClient {
    endpoint: String,
    shared: Arc<Shared>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventStreamClient {
    /// Start connecting to `config.endpoint` through `connector`.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn start(config: StreamConfig, connector: Arc<dyn Connector>) -> Self {
        let id = Uuid::new_v4();
        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let shared = Arc::new(Shared {
            id,
            status,
            attempts: AtomicU32::new(0),
            registry: Arc::new(Registry::new()),
            last_error: Mutex::new(None),
        });
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        info!(client_id = %id, endpoint = %config.endpoint, "stream: starting");
        let endpoint = config.endpoint.clone();
        let task = tokio::spawn(run(config, connector, Arc::clone(&shared), stop_rx));
        Self { endpoint, shared, stop: Mutex::new(Some(stop_tx)), task: Mutex::new(Some(task)) }
    }

    /// Start a client speaking WebSocket to `config.endpoint`.
    pub fn connect_ws(config: StreamConfig) -> Self {
        Self::start(config, Arc::new(WsConnector))
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Receiver for status transitions, e.g. to await `Disposed`.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    /// Consecutive reconnect attempts since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Cause of the most recent failed connect or broken session, cleared on
    /// the next successful connect.
    pub fn last_error(&self) -> Option<TransportError> {
        self.shared.last_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// Register `listener` for every message received from now on. Registering
    /// the same closure twice yields two independent registrations. On a
    /// disposed client the returned subscription is inert.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&WireMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.shared.registry.add(Arc::new(listener));
        if id.is_none() {
            debug!(client_id = %self.shared.id, "stream: subscribe on disposed client ignored");
        }
        Subscription::new(id, Arc::downgrade(&self.shared.registry))
    }

    /// Tear down: stop timers, close the socket, drop all listeners. Idempotent.
    pub fn dispose(&self) {
        let stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(tx) = stop {
            info!(client_id = %self.shared.id, "stream: disposing");
            let _ = tx.send(());
        }
        self.shared.status.send_replace(ConnectionStatus::Disposed);
        self.shared.registry.close();
    }

    /// Dispose and wait for the connection task to finish closing the socket.
    pub async fn shutdown(&self) {
        self.dispose();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(client_id = %self.shared.id, error = %e, "stream: connection task ended abnormally");
            }
        }
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

enum SessionEnd {
    Stopped,
    Closed,
    Failed(TransportError),
}

enum Step {
    Heartbeat,
    Frame(Option<Result<String, TransportError>>),
}

async fn run(
    config: StreamConfig,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let id = shared.id;
    loop {
        shared.set_status(ConnectionStatus::Connecting);
        let attempt = shared.attempts.load(Ordering::SeqCst);
        debug!(client_id = %id, attempt, endpoint = %config.endpoint, "stream: connecting");
        let opened = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            res = connector.connect(&config.endpoint) => res,
        };
        match opened {
            Ok(mut transport) => {
                shared.attempts.store(0, Ordering::SeqCst);
                *shared.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
                shared.set_status(ConnectionStatus::Connected);
                counter!("stream_connects_total", 1u64);
                info!(client_id = %id, attempt, "stream: connected");
                match session(&shared, transport.as_mut(), &mut stop_rx, config.heartbeat_interval).await {
                    SessionEnd::Stopped => {
                        transport.close().await;
                        break;
                    }
                    SessionEnd::Closed => info!(client_id = %id, "stream: connection closed"),
                    SessionEnd::Failed(e) => {
                        warn!(client_id = %id, error = %e, "stream: transport error");
                        shared.fail(e);
                    }
                }
                shared.set_status(ConnectionStatus::Disconnected);
            }
            Err(e) => {
                warn!(client_id = %id, attempt, error = %e, "stream: connect failed");
                shared.fail(e);
                shared.set_status(ConnectionStatus::Disconnected);
            }
        }

        let attempts = shared.attempts.load(Ordering::SeqCst);
        if attempts >= config.max_reconnect_attempts {
            warn!(client_id = %id, attempts, "stream: reconnect attempts exhausted; giving up");
            break;
        }
        debug!(client_id = %id, delay_ms = %config.reconnect_interval.as_millis(), "stream: reconnect scheduled");
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(config.reconnect_interval) => {}
        }
        shared.attempts.fetch_add(1, Ordering::SeqCst);
        counter!("stream_reconnects_total", 1u64);
    }
    shared.status.send_replace(ConnectionStatus::Disposed);
    shared.registry.close();
    debug!(client_id = %id, "stream: task stopped");
}

async fn session(
    shared: &Shared,
    transport: &mut dyn Transport,
    stop_rx: &mut oneshot::Receiver<()>,
    heartbeat: Duration,
) -> SessionEnd {
    // `heartbeat_interval` is a public field; a zero period would panic the ticker.
    let heartbeat = heartbeat.max(MIN_HEARTBEAT_INTERVAL);
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        let step = tokio::select! {
            biased;
            _ = &mut *stop_rx => return SessionEnd::Stopped,
            _ = ticker.tick() => Step::Heartbeat,
            frame = transport.recv() => Step::Frame(frame),
        };
        match step {
            Step::Heartbeat => {
                if let Err(e) = transport.send(HEARTBEAT_PING).await {
                    return SessionEnd::Failed(e);
                }
                trace!(client_id = %shared.id, "stream: heartbeat sent");
            }
            Step::Frame(Some(Ok(text))) => shared.deliver(&text),
            Step::Frame(Some(Err(e))) => return SessionEnd::Failed(e),
            Step::Frame(None) => return SessionEnd::Closed,
        }
    }
}
