//! The node's single MQTT connection, shared by every device.
//!
//! One background task drives the rumqttc event loop: it tracks the
//! connection state in a `watch` channel, re-issues subscriptions after each
//! ConnAck and hands inbound publishes to the registered callbacks. Devices
//! only ever see `connect()` (wait until up), `publish()` (returns an outcome,
//! never an error) and callback registration.

use anyhow::Result;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Delay before the event loop is polled again after a transport error.
pub const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// What happened to a publish request.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport.
    Sent,
    /// Dropped because the link is down. Nothing is queued.
    NotConnected,
    /// The transport (or payload encoding) rejected it.
    Failed,
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, filter: &str) -> Result<()>;
}

#[async_trait]
impl Transport for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<()> {
        AsyncClient::subscribe(self, filter, QoS::AtLeastOnce).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BrokerLink
// ---------------------------------------------------------------------------

type Handler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

#[derive(Clone)]
pub struct BrokerLink {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    handlers: RwLock<Vec<(String, Handler)>>,
    subscriptions: Mutex<Vec<String>>,
    /// Taken by the first `connect()`; `None` afterwards.
    driver: Mutex<Option<EventLoop>>,
}

impl BrokerLink {
    pub fn new(options: MqttOptions) -> Self {
        let (client, events) = AsyncClient::new(options, 20);
        Self::from_parts(Arc::new(client), Some(events))
    }

    fn from_parts(transport: Arc<dyn Transport>, driver: Option<EventLoop>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                state,
                handlers: RwLock::new(Vec::new()),
                subscriptions: Mutex::new(Vec::new()),
                driver: Mutex::new(driver),
            }),
        }
    }

    /// A link with no event loop behind it; state only changes through
    /// `set_state`.
    #[cfg(test)]
    pub(crate) fn detached(transport: Arc<dyn Transport>) -> Self {
        Self::from_parts(transport, None)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Wait until the link is up. The first caller starts the event loop
    /// task; concurrent callers all wait on the same connection attempt.
    pub async fn connect(&self) {
        let mut state = self.inner.state.subscribe();
        if *state.borrow() == ConnectionState::Connected {
            return;
        }
        self.start_driver();
        // The sender lives in `inner`, so this only errors if `self` is gone.
        let _ = state.wait_for(|s| *s == ConnectionState::Connected).await;
    }

    fn start_driver(&self) {
        let events = self
            .inner
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(events) = events {
            self.set_state(ConnectionState::Connecting);
            info!("connecting to mqtt broker");
            tokio::spawn(self.clone().drive(events));
        }
    }

    async fn drive(self, mut events: EventLoop) {
        loop {
            match events.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        info!("connected to mqtt broker");
                        self.set_state(ConnectionState::Connected);
                        // Subscribing feeds the request channel this loop
                        // drains, so it must not run inline.
                        let link = self.clone();
                        tokio::spawn(async move { link.resubscribe().await });
                    } else {
                        warn!(code = ?ack.code, "mqtt broker refused connection");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.dispatch(&p.topic, &p.payload);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt broker sent disconnect");
                    self.set_state(ConnectionState::Disconnected);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt connection error; retrying in {}s", RETRY_DELAY.as_secs());
                    self.set_state(ConnectionState::Disconnected);
                    sleep(RETRY_DELAY).await;
                    self.set_state(ConnectionState::Connecting);
                }
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!(from = ?*current, to = ?next, "mqtt link state");
            *current = next;
            true
        });
    }

    // -- Outbound -----------------------------------------------------------

    /// Fire-and-forget publish. Never blocks on a dead link: when not
    /// connected the message is dropped and `NotConnected` returned.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> PublishOutcome {
        if self.state() != ConnectionState::Connected {
            warn!(topic, "publish skipped: not connected");
            return PublishOutcome::NotConnected;
        }
        match self.inner.transport.publish(topic, payload).await {
            Ok(()) => PublishOutcome::Sent,
            Err(e) => {
                error!(topic, error = %e, "publish failed");
                PublishOutcome::Failed
            }
        }
    }

    pub async fn publish_json<T: Serialize + ?Sized>(&self, topic: &str, value: &T) -> PublishOutcome {
        match serde_json::to_vec(value) {
            Ok(payload) => self.publish(topic, payload).await,
            Err(e) => {
                error!(topic, error = %e, "failed to encode payload");
                PublishOutcome::Failed
            }
        }
    }

    // -- Inbound ------------------------------------------------------------

    /// Subscribe to `filter`, now if connected and again after every
    /// reconnect.
    pub async fn subscribe(&self, filter: &str) {
        {
            let mut subs = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !subs.iter().any(|s| s == filter) {
                subs.push(filter.to_string());
            }
        }
        if self.state() == ConnectionState::Connected {
            if let Err(e) = self.inner.transport.subscribe(filter).await {
                error!(topic = filter, error = %e, "subscribe failed; will retry on reconnect");
            }
        }
    }

    /// Call `handler` for every inbound message whose topic matches `filter`.
    /// Handlers run on the event loop task and must not block.
    pub fn register_callback<F>(&self, filter: impl Into<String>, handler: F)
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((filter.into(), Arc::new(handler)));
    }

    pub(crate) fn dispatch(&self, topic: &str, payload: &[u8]) {
        let matched: Vec<Handler> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, h)| Arc::clone(h))
            .collect();
        if matched.is_empty() {
            debug!(topic, "no handler for inbound message");
        }
        for handler in matched {
            handler(topic, payload);
        }
    }

    async fn resubscribe(&self) {
        let filters = self
            .inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for filter in filters {
            match self.inner.transport.subscribe(&filter).await {
                Ok(()) => debug!(topic = %filter, "subscribed"),
                Err(e) => error!(topic = %filter, error = %e, "subscribe failed"),
            }
        }
    }
}

/// MQTT topic filter matching with `+` (one level) and `#` (rest).
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut f = filter.split('/');
    let mut t = topic.split('/');
    loop {
        match (f.next(), t.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ===========================================================================
// Tests
// ===========================================================================
