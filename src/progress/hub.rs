//! Registration and delivery of progress endpoints.
//!
//! Each guarded remote step registers its own endpoint, identified by a
//! random token and addressed as `<base>/progress/<token>`. The endpoint
//! accepts messages until it is closed, either because a terminal message
//! arrived or because the step resolved through another channel. Dropping
//! the endpoint removes its registration, so a stray late message can never
//! reach a later step.

use super::{ProgressEvent, ProgressMessage};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Why a delivered message was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("no progress endpoint registered for token {0}")]
    UnknownEndpoint(String),

    #[error("POST after end")]
    AfterEnd,

    #[error("malformed progress message: {0}")]
    Malformed(String),
}

struct Registration {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    closed: Arc<AtomicBool>,
}

/// Registry of live progress endpoints, shared with the HTTP server.
#[derive(Clone)]
pub struct ProgressHub {
    endpoints: Arc<DashMap<String, Registration>>,
    base_url: Arc<str>,
}

impl ProgressHub {
    /// Create a hub whose endpoint URLs are rooted at `base_url`.
    pub fn new(base_url: &str) -> Self {
        Self {
            endpoints: Arc::new(DashMap::new()),
            base_url: Arc::from(base_url.trim_end_matches('/')),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register a fresh, uniquely addressable endpoint.
    pub fn register(&self) -> ProgressEndpoint {
        let token = Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        self.endpoints.insert(
            token.clone(),
            Registration {
                tx,
                closed: closed.clone(),
            },
        );

        ProgressEndpoint {
            url: format!("{}/progress/{}", self.base_url, token),
            token,
            rx,
            closed,
            hub: self.clone(),
        }
    }

    /// Deliver a message to the endpoint registered under `token`.
    ///
    /// A terminal message closes the endpoint, so at most one terminal
    /// message is ever accepted.
    pub fn deliver(&self, token: &str, message: ProgressMessage) -> Result<(), DeliveryError> {
        let registration = self
            .endpoints
            .get(token)
            .ok_or_else(|| DeliveryError::UnknownEndpoint(token.to_string()))?;

        if registration.closed.load(Ordering::SeqCst) {
            return Err(DeliveryError::AfterEnd);
        }

        let event = ProgressEvent::try_from(message)
            .map_err(|e| DeliveryError::Malformed(e.to_string()))?;

        if event.is_terminal() && registration.closed.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::AfterEnd);
        }

        registration
            .tx
            .send(event)
            .map_err(|_| DeliveryError::AfterEnd)
    }

    /// Number of endpoints currently registered.
    pub fn active_endpoints(&self) -> usize {
        self.endpoints.len()
    }

    fn deregister(&self, token: &str) {
        self.endpoints.remove(token);
    }
}

/// A registered endpoint, owned by the step that is waiting on it.
pub struct ProgressEndpoint {
    token: String,
    url: String,
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
    closed: Arc<AtomicBool>,
    hub: ProgressHub,
}

impl ProgressEndpoint {
    /// URL the remote script should POST to.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Wait for the next accepted message.
    ///
    /// Never returns `None` while the endpoint is alive, because the hub
    /// holds the sending half until deregistration.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    /// Take a message that has already been accepted, without waiting.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting messages. Later deliveries are rejected with
    /// [`DeliveryError::AfterEnd`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for ProgressEndpoint {
    fn drop(&mut self) {
        self.close();
        self.hub.deregister(&self.token);
    }
}
