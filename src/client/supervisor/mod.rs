//! Connection supervision.
//!
//! Owns the single connection/channel pair. `connect()` walks the candidate
//! endpoints in order with bounded failover, runs channel setup, and only
//! then publishes the session as ready. A watcher per session logs broker
//! errors and tears the session down on disconnect or channel loss so the
//! next `connect()` rebuilds from scratch.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use super::channel;
use super::replies::ReplyRegistry;
use crate::broker::{BrokerChannel, BrokerConnection, ConnectionEvent, Connector};
use crate::config::{redact_url, BrokerEndpoint, ClientConfig};
use crate::error::{ClientError, Result};

/// A connected session with a ready channel and an active reply consumer.
pub(crate) struct Session {
    pub(crate) generation: u64,
    pub(crate) url: String,
    pub(crate) channel: Arc<dyn BrokerChannel>,
    connection: Box<dyn BrokerConnection>,
}

impl Session {
    /// Close channel then connection. Failures are logged and swallowed.
    async fn shutdown(&self) {
        if let Err(e) = self.channel.close().await {
            debug!(url = %self.url, error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close().await {
            debug!(url = %self.url, error = %e, "Connection close failed");
        }
    }
}

type ConnectAttempt = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

enum LinkState {
    Absent,
    Connecting {
        generation: u64,
        attempt: ConnectAttempt,
    },
    Ready(Arc<Session>),
    Failed(ClientError),
}

/// Observable state of the client's broker link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStatus {
    Absent,
    Connecting,
    Ready,
    /// Last connect attempt failed; the next `connect()` starts over.
    Failed(String),
}

/// Decision after an endpoint failed to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failover {
    /// Try the candidate at this index.
    Next(usize),
    /// No candidates left; the attempt is terminal.
    Exhausted,
}

/// Counts connect failures against the candidate list.
///
/// A failure on any endpoint but the last moves on to the next one; a
/// failure on the last is terminal. The failure count bounds the walk even
/// if indices were reported out of order.
#[derive(Debug)]
pub(crate) struct FailoverCursor {
    candidates: usize,
    failures: usize,
}

impl FailoverCursor {
    pub(crate) fn new(candidates: usize) -> Self {
        Self {
            candidates,
            failures: 0,
        }
    }

    pub(crate) fn on_connect_failed(&mut self, index: usize) -> Failover {
        self.failures += 1;
        if index + 1 >= self.candidates || self.failures >= self.candidates {
            Failover::Exhausted
        } else {
            Failover::Next(index + 1)
        }
    }
}

/// Owns the connection lifecycle.
pub(crate) struct ConnectionSupervisor {
    config: Arc<ClientConfig>,
    connector: Arc<dyn Connector>,
    replies: ReplyRegistry,
    state: Mutex<LinkState>,
    generations: AtomicU64,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        connector: Arc<dyn Connector>,
        replies: ReplyRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            replies,
            state: Mutex::new(LinkState::Absent),
            generations: AtomicU64::new(0),
        })
    }

    /// Return the ready session, joining or starting a connect attempt.
    ///
    /// Concurrent callers share one in-flight attempt.
    pub(crate) async fn connect(self: &Arc<Self>) -> Result<Arc<Session>> {
        let attempt = {
            let mut state = self.state.lock().await;
            match &*state {
                LinkState::Ready(session) => return Ok(Arc::clone(session)),
                LinkState::Connecting { attempt, .. } => attempt.clone(),
                LinkState::Absent | LinkState::Failed(_) => {
                    let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
                    let attempt = Arc::clone(self).establish(generation).boxed().shared();
                    *state = LinkState::Connecting {
                        generation,
                        attempt: attempt.clone(),
                    };
                    attempt
                }
            }
        };
        attempt.await
    }

    pub(crate) async fn status(&self) -> LinkStatus {
        match &*self.state.lock().await {
            LinkState::Absent => LinkStatus::Absent,
            LinkState::Connecting { .. } => LinkStatus::Connecting,
            LinkState::Ready(_) => LinkStatus::Ready,
            LinkState::Failed(e) => LinkStatus::Failed(e.to_string()),
        }
    }

    /// Tear down whatever is live and return to `Absent`.
    pub(crate) async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, LinkState::Absent);
        if let LinkState::Ready(session) = previous {
            session.shutdown().await;
            info!(url = %redact_url(&session.url), "Client closed");
        }
    }

    async fn establish(self: Arc<Self>, generation: u64) -> Result<Arc<Session>> {
        let outcome = self.open_session(generation).await;

        let mut state = self.state.lock().await;
        let current = matches!(
            &*state,
            LinkState::Connecting { generation: g, .. } if *g == generation
        );

        match outcome {
            Ok((session, events)) if current => {
                *state = LinkState::Ready(Arc::clone(&session));
                drop(state);
                tokio::spawn(Self::watch(
                    Arc::downgrade(&self),
                    generation,
                    session.url.clone(),
                    events,
                ));
                info!(
                    url = %redact_url(&session.url),
                    queue = %self.config.queue,
                    "Client ready"
                );
                Ok(session)
            }
            Ok((session, _)) => {
                drop(state);
                session.shutdown().await;
                Err(ClientError::Connection(
                    "client closed while connecting".to_string(),
                ))
            }
            Err(e) => {
                if current {
                    *state = LinkState::Failed(e.clone());
                }
                Err(e)
            }
        }
    }

    /// Connect with failover, attach observers, then set up the channel.
    async fn open_session(
        &self,
        generation: u64,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<ConnectionEvent>)> {
        let urls: Vec<String> = self.config.urls.iter().map(BrokerEndpoint::to_url).collect();
        if urls.is_empty() {
            return Err(ClientError::Config(
                "at least one broker endpoint is required".to_string(),
            ));
        }

        let mut cursor = FailoverCursor::new(urls.len());
        let mut delays = ExponentialBuilder::default()
            .with_min_delay(self.config.failover.min_delay())
            .with_max_delay(self.config.failover.max_delay())
            .with_max_times(urls.len().saturating_sub(1))
            .with_jitter()
            .build();

        let mut index = 0;
        let (url, connection) = loop {
            let url = &urls[index];
            match self.connector.connect(url).await {
                Ok(connection) => break (url.clone(), connection),
                Err(e) => match cursor.on_connect_failed(index) {
                    Failover::Next(next) => {
                        let delay = delays.next().unwrap_or_default();
                        warn!(
                            url = %redact_url(url),
                            next = %redact_url(&urls[next]),
                            backoff_ms = %delay.as_millis(),
                            error = %e,
                            "Broker endpoint unavailable, failing over"
                        );
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        index = next;
                    }
                    Failover::Exhausted => {
                        error!(
                            url = %redact_url(url),
                            candidates = urls.len(),
                            error = %e,
                            "All broker endpoints failed"
                        );
                        return Err(ClientError::Connection(e.to_string()));
                    }
                },
            }
        };

        // Observers go on before the connection is used for anything
        let (events_tx, mut events) = mpsc::unbounded_channel();
        connection.observe(Box::new(move |event: ConnectionEvent| {
            let _ = events_tx.send(event);
        }));

        let result = {
            let setup = channel::initialize(connection.as_ref(), &self.config, &self.replies);
            tokio::pin!(setup);

            loop {
                tokio::select! {
                    result = &mut setup => break result,
                    event = events.recv() => match event {
                        Some(ConnectionEvent::Error(cause)) => {
                            error!(url = %redact_url(&url), error = %cause, "Broker connection error");
                        }
                        // Setup reports the failing operation itself
                        Some(ConnectionEvent::ChannelLost(cause)) => {
                            error!(url = %redact_url(&url), error = %cause, "Channel closed during setup");
                        }
                        Some(ConnectionEvent::Disconnected(cause)) => {
                            error!(
                                url = %redact_url(&url),
                                error = %cause,
                                "Disconnected from broker during channel setup"
                            );
                            break Err(ClientError::Connection(cause));
                        }
                        // Nothing left to report; only setup can finish the attempt
                        None => break (&mut setup).await,
                    },
                }
            }
        };

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Connection close after failed setup failed");
                }
                return Err(e);
            }
        };

        let session = Arc::new(Session {
            generation,
            url,
            channel,
            connection,
        });
        Ok((session, events))
    }

    /// Log broker signals for one session; tear it down on disconnect.
    async fn watch(
        supervisor: Weak<Self>,
        generation: u64,
        url: String,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Error(cause) => {
                    error!(url = %redact_url(&url), error = %cause, "Broker connection error");
                }
                ConnectionEvent::Disconnected(cause) | ConnectionEvent::ChannelLost(cause) => {
                    error!(
                        url = %redact_url(&url),
                        error = %cause,
                        "Broker session lost, tearing down connection"
                    );
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.teardown(generation).await;
                    }
                    break;
                }
            }
        }
    }

    /// Drop the session of `generation` if it is still the live one.
    async fn teardown(&self, generation: u64) {
        let session = {
            let mut state = self.state.lock().await;
            match &*state {
                LinkState::Ready(session) if session.generation == generation => {
                    let session = Arc::clone(session);
                    *state = LinkState::Absent;
                    Some(session)
                }
                _ => None,
            }
        };

        if let Some(session) = session {
            session.shutdown().await;
            info!(url = %redact_url(&session.url), "Connection torn down");
        }
    }
}

#[cfg(test)]
mod tests;
