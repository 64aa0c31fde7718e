//! Scripted in-memory connector for deterministic tests.
//!
//! Each call to `connect` consumes the next scripted outcome; an empty script
//! fails the attempt. Accepted connections hand the test a [`ServerEnd`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::{Connector, Transport, TransportError};

enum Outcome {
    Accept(ChannelTransport),
    Fail(String),
    Hang,
}

#[derive(Default)]
struct Script {
    outcomes: VecDeque<Outcome>,
    attempts: usize,
}

#[derive(Clone, Default)]
pub struct ChannelConnector {
    script: Arc<Mutex<Script>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept the next connection attempt.
    pub fn accept_next(&self) -> ServerEnd {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(false));
        let transport = ChannelTransport { rx, sent: Arc::clone(&sent), closed: Arc::clone(&closed) };
        self.lock().outcomes.push_back(Outcome::Accept(transport));
        ServerEnd { tx: Some(tx), sent, closed }
    }

    /// Fail the next connection attempt.
    pub fn fail_next(&self, reason: &str) {
        self.lock().outcomes.push_back(Outcome::Fail(reason.to_string()));
    }

    /// Leave the next connection attempt pending forever.
    pub fn hang_next(&self) {
        self.lock().outcomes.push_back(Outcome::Hang);
    }

    /// Number of `connect` calls made so far.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }
}

#[async_trait::async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Box<dyn Transport>, TransportError> {
        let outcome = {
            let mut script = self.lock();
            script.attempts += 1;
            script.outcomes.pop_front()
        };
        match outcome {
            Some(Outcome::Accept(t)) => Ok(Box::new(t)),
            Some(Outcome::Fail(reason)) => Err(TransportError::Connect(reason)),
            Some(Outcome::Hang) => std::future::pending().await,
            None => Err(TransportError::Connect("no scripted connection".to_string())),
        }
    }
}

struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        if *self.closed.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(TransportError::Send("closed".to_string()));
        }
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).push(text.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await
    }

    async fn close(&mut self) {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.rx.close();
    }
}

/// Server side of an accepted [`ChannelConnector`] connection.
pub struct ServerEnd {
    tx: Option<mpsc::UnboundedSender<Result<String, TransportError>>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl ServerEnd {
    /// Push a raw text frame to the client.
    pub fn push(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(text.into()));
        }
    }

    /// Push a JSON value as a text frame.
    pub fn push_json(&self, value: &serde_json::Value) {
        self.push(value.to_string());
    }

    /// Deliver a transport error to the client.
    pub fn fail(&self, reason: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(TransportError::Receive(reason.to_string())));
        }
    }

    /// Close the connection from the server side.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Frames the client sent on this connection.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Whether the client closed this connection.
    pub fn client_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
