//! In-memory push channel with scripted failures, for tests and local runs.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use ovm_hardware::TrustMaterial;
use ovm_scmb::{BrokerEndpoint, ChannelError, Delivery, PushChannel, PushSession};
use parking_lot::Mutex;
use tokio::sync::mpsc;

type Feed = mpsc::UnboundedSender<Result<Delivery, ChannelError>>;

#[derive(Default)]
struct State {
    connect_failures: VecDeque<ChannelError>,
    bind_failures: VecDeque<ChannelError>,
    bindings: Vec<(String, String)>,
    feed: Option<Feed>,
    trust_material: Option<TrustMaterial>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

/// Push channel whose broker lives in process.
///
/// Messages published while no session is consuming are dropped, like an
/// exclusive broker queue that does not exist yet.
#[derive(Clone, Default)]
pub struct MemoryPushChannel {
    inner: Arc<Inner>,
}

impl MemoryPushChannel {
    /// Creates a channel that accepts every connection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next connection attempt fail with `error`.
    pub fn fail_next_connect(&self, error: ChannelError) {
        self.inner.state.lock().connect_failures.push_back(error);
    }

    /// Makes the next queue binding fail with `error`.
    pub fn fail_next_bind(&self, error: ChannelError) {
        self.inner.state.lock().bind_failures.push_back(error);
    }

    /// Sends a message to the consuming session. Returns whether a session
    /// was consuming.
    pub fn publish(&self, routing_key: impl Into<String>, body: impl Into<Bytes>) -> bool {
        let delivery = Delivery {
            routing_key: routing_key.into(),
            body: body.into(),
        };
        self.feed(Ok(delivery))
    }

    /// Breaks the consuming session with `error`.
    pub fn break_session(&self, error: ChannelError) -> bool {
        self.feed(Err(error))
    }

    /// Closes the consuming session from the broker side.
    pub fn close_session(&self) {
        self.inner.state.lock().feed.take();
    }

    /// Whether a session is bound and consuming.
    #[must_use]
    pub fn is_consuming(&self) -> bool {
        self.inner
            .state
            .lock()
            .feed
            .as_ref()
            .is_some_and(|feed| !feed.is_closed())
    }

    /// Number of connection attempts so far.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of sessions closed by their owner so far.
    #[must_use]
    pub fn sessions_closed(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Every `(exchange, routing_key)` binding made so far.
    #[must_use]
    pub fn bindings(&self) -> Vec<(String, String)> {
        self.inner.state.lock().bindings.clone()
    }

    /// Trust material presented by the last connection attempt.
    #[must_use]
    pub fn last_trust_material(&self) -> Option<TrustMaterial> {
        self.inner.state.lock().trust_material.clone()
    }

    fn feed(&self, item: Result<Delivery, ChannelError>) -> bool {
        self.inner
            .state
            .lock()
            .feed
            .as_ref()
            .is_some_and(|feed| feed.send(item).is_ok())
    }
}

#[async_trait]
impl PushChannel for MemoryPushChannel {
    async fn connect(
        &self,
        _endpoint: &BrokerEndpoint,
        trust_material: &TrustMaterial,
    ) -> Result<Box<dyn PushSession>, ChannelError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        let mut state = self.inner.state.lock();
        state.trust_material = Some(trust_material.clone());
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        drop(state);

        Ok(Box::new(MemoryPushSession {
            inner: self.inner.clone(),
            receiver: None,
        }))
    }
}

/// Session opened by [`MemoryPushChannel`].
pub struct MemoryPushSession {
    inner: Arc<Inner>,
    receiver: Option<mpsc::UnboundedReceiver<Result<Delivery, ChannelError>>>,
}

#[async_trait]
impl PushSession for MemoryPushSession {
    async fn bind_and_consume(
        &mut self,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), ChannelError> {
        let mut state = self.inner.state.lock();
        if let Some(error) = state.bind_failures.pop_front() {
            return Err(error);
        }

        state
            .bindings
            .push((exchange.to_string(), routing_key.to_string()));

        let (sender, receiver) = mpsc::unbounded_channel();
        state.feed = Some(sender);
        drop(state);

        self.receiver = Some(receiver);
        Ok(())
    }

    async fn next_delivery(&mut self) -> Result<Option<Delivery>, ChannelError> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(ChannelError::Other("not consuming".to_string()));
        };

        receiver.recv().await.transpose()
    }

    async fn close(&mut self) {
        self.receiver.take();
        self.inner.closes.fetch_add(1, Ordering::SeqCst);
    }
}
