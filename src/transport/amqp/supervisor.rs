//! Self-healing broker connection supervisor
//!
//! The supervisor owns exactly one logical broker session and keeps it alive:
//!
//! ```text
//! DIALING -> DECLARING -> LIVE -> (close notification) -> DIALING
//! ```
//!
//! `DIALING` and `DECLARING` retry in place with the configured
//! [`RetryPolicy`]; there is no failure state and no attempt limit. A single
//! watcher task per supervisor waits for the live connection to close, runs
//! the dial/declare sequence to completion, swaps the new session into the
//! shared [`ConnectionHandle`] and re-arms on the new connection.
//!
//! The session is held in an [`ArcSwap`], so readers always observe either
//! the old or the new connection/channel pair, never a mix of both. The first
//! [`ConnectionSupervisor::acquire`] creates the session and its watcher; every
//! later call shares them.

use super::endpoint::Endpoint;
use super::retry::RetryPolicy;
use super::topology::{ResourceKind, Topology, TopologyError};
use crate::broker_span;
use crate::config::RelayConfig;
use crate::error::sanitize_error_message;
use crate::transport::{Broker, BrokerConnection, ChannelOf, CloseNotifier};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, OnceCell};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle state of the supervised session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Sweeping the candidate hosts
    Dialing,
    /// Connected, declaring exchanges, queues and bindings
    Declaring,
    /// Connection up and topology declared; publishing is expected to work
    Live,
}

/// Current state plus the generation of the most recent live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Incremented each time a session becomes live; 0 before the first one
    pub generation: u64,
}

/// Point-in-time supervisor counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorMetrics {
    pub dial_attempts: u64,
    pub reconnects: u64,
    pub armed_watchers: usize,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dial_attempts: AtomicU64,
    reconnects: AtomicU64,
    armed_watchers: AtomicUsize,
    generation: AtomicU64,
}

/// A connection together with its topology-ready channel
pub struct Session<C: BrokerConnection> {
    pub connection: C,
    pub channel: C::Channel,
    pub generation: u64,
}

type SharedSession<C> = Arc<ArcSwap<Session<C>>>;

/// The one session a supervisor hands out, plus its watcher
struct Supervised<C: BrokerConnection> {
    current: SharedSession<C>,
    watcher: AbortHandle,
}

/// Keeps one live, topology-ready broker session available
pub struct ConnectionSupervisor<B: Broker> {
    broker: B,
    endpoints: Vec<Endpoint>,
    topology: Topology,
    retry: RetryPolicy,
    status_tx: watch::Sender<SessionStatus>,
    counters: Arc<Counters>,
    supervised: OnceCell<Supervised<B::Connection>>,
}

impl<B: Broker> ConnectionSupervisor<B> {
    pub fn new(broker: B, endpoints: Vec<Endpoint>, topology: Topology, retry: RetryPolicy) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus {
            state: SessionState::Dialing,
            generation: 0,
        });

        Self {
            broker,
            endpoints,
            topology,
            retry,
            status_tx,
            counters: Arc::new(Counters::default()),
            supervised: OnceCell::new(),
        }
    }

    /// Build a supervisor from relay configuration
    pub fn from_config(broker: B, config: &RelayConfig) -> Self {
        Self::new(
            broker,
            config.endpoints(),
            Topology::from_names(&config.topology),
            config.retry_policy(),
        )
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn status(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    pub fn metrics(&self) -> SupervisorMetrics {
        SupervisorMetrics {
            dial_attempts: self.counters.dial_attempts.load(Ordering::SeqCst),
            reconnects: self.counters.reconnects.load(Ordering::SeqCst),
            armed_watchers: self.counters.armed_watchers.load(Ordering::SeqCst),
            generation: self.counters.generation.load(Ordering::SeqCst),
        }
    }

    /// Dial candidates in configured order until one accepts
    ///
    /// Every sweep starts again from the first candidate. Between failed
    /// sweeps the retry policy pauses. This never returns an error; it only
    /// returns once a connection is up.
    pub async fn establish(&self) -> B::Connection {
        if self.endpoints.is_empty() {
            error!("No broker endpoints configured; dialing cannot succeed");
        }

        let mut sweep = 0u32;
        loop {
            sweep = sweep.saturating_add(1);

            for endpoint in &self.endpoints {
                self.counters.dial_attempts.fetch_add(1, Ordering::SeqCst);
                info!(broker = %endpoint.redacted(), sweep, "Trying to connect to broker");

                match self.broker.dial(endpoint).await {
                    Ok(connection) => {
                        info!(broker = %endpoint.redacted(), "Connected to broker");
                        return connection;
                    }
                    Err(e) => {
                        warn!(
                            broker = %endpoint.redacted(),
                            error = %sanitize_error_message(&e.to_string()),
                            "Failed to connect to broker"
                        );
                    }
                }
            }

            let delay = self.retry.delay_for(sweep);
            warn!(
                sweep,
                delay_ms = delay.as_millis() as u64,
                "Failed to connect to any broker, retrying"
            );
            self.retry.pause(sweep).await;
        }
    }

    /// Open a channel on `connection` and declare the full topology on it
    pub async fn declare_topology(
        &self,
        connection: &B::Connection,
    ) -> Result<ChannelOf<B>, TopologyError> {
        let channel = connection.open_channel().await.map_err(|source| {
            error!(error = %source, "Failed to open a channel");
            TopologyError {
                kind: ResourceKind::Channel,
                resource: "channel".to_string(),
                source,
            }
        })?;

        self.topology.declare(&channel).await?;
        debug!(resources = ?self.topology.resource_names(), "Topology declared");
        Ok(channel)
    }

    /// Dial and declare until both succeed, restarting from scratch on declare failure
    async fn connect_and_declare(&self) -> Session<B::Connection> {
        let mut attempt = 0u32;
        loop {
            attempt = attempt.saturating_add(1);

            self.set_state(SessionState::Dialing);
            let connection = self.establish().await;

            self.set_state(SessionState::Declaring);
            match self.declare_topology(&connection).await {
                Ok(channel) => {
                    let generation = self.counters.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    return Session {
                        connection,
                        channel,
                        generation,
                    };
                }
                Err(e) => {
                    warn!(
                        error = %sanitize_error_message(&e.to_string()),
                        attempt,
                        "Topology declaration failed, restarting connection"
                    );
                    connection.close().await;
                    self.retry.pause(attempt).await;
                }
            }
        }
    }

    /// Block until a live, topology-ready session exists and return a handle to it
    ///
    /// The first call dials, declares and arms the close watcher that keeps
    /// the session fresh. Concurrent and later calls wait for that same
    /// session; a supervisor never runs more than one.
    pub async fn acquire(self: &Arc<Self>) -> ConnectionHandle<B> {
        let supervised = self.supervised.get_or_init(|| self.start()).await;

        ConnectionHandle {
            current: Arc::clone(&supervised.current),
            status: self.status_tx.subscribe(),
            supervisor: Arc::clone(self),
            watcher: supervised.watcher.clone(),
        }
    }

    async fn start(self: &Arc<Self>) -> Supervised<B::Connection> {
        let session = self.connect_and_declare().await;
        let notifier = session.connection.close_notifier();
        let generation = session.generation;

        let current = Arc::new(ArcSwap::from_pointee(session));
        let armed = self.arm_watcher();
        self.mark_live(generation);

        let watcher = tokio::spawn(
            Arc::clone(self)
                .watch_for_close(Arc::clone(&current), notifier, armed)
                .instrument(broker_span!(operation = "close_watcher")),
        );

        Supervised {
            current,
            watcher: watcher.abort_handle(),
        }
    }

    /// Reconnect loop: wait for close, reconnect, swap, re-arm
    async fn watch_for_close(
        self: Arc<Self>,
        current: SharedSession<B::Connection>,
        mut notifier: CloseNotifier,
        mut armed: ArmedWatcher,
    ) {
        loop {
            let reason = notifier.closed().await;
            drop(armed);

            let closed_generation = current.load().generation;
            warn!(
                reason = %sanitize_error_message(&reason.to_string()),
                generation = closed_generation,
                "Broker connection closed, attempting to reconnect"
            );
            self.counters.reconnects.fetch_add(1, Ordering::SeqCst);

            let session = self.connect_and_declare().await;
            let generation = session.generation;
            notifier = session.connection.close_notifier();
            armed = self.arm_watcher();

            let previous = current.swap(Arc::new(session));
            previous.connection.close().await;
            self.mark_live(generation);

            info!(generation, "Successfully reconnected to broker");
        }
    }

    fn arm_watcher(&self) -> ArmedWatcher {
        self.counters.armed_watchers.fetch_add(1, Ordering::SeqCst);
        ArmedWatcher {
            counters: Arc::clone(&self.counters),
        }
    }

    fn set_state(&self, state: SessionState) {
        let mut previous = state;
        self.status_tx.send_modify(|status| {
            previous = status.state;
            status.state = state;
        });
        log_state_transition(previous, state);
    }

    fn mark_live(&self, generation: u64) {
        let previous = self.status_tx.send_replace(SessionStatus {
            state: SessionState::Live,
            generation,
        });
        log_state_transition(previous.state, SessionState::Live);
    }
}

/// Counts a close watcher as armed until dropped
struct ArmedWatcher {
    counters: Arc<Counters>,
}

impl Drop for ArmedWatcher {
    fn drop(&mut self) {
        self.counters.armed_watchers.fetch_sub(1, Ordering::SeqCst);
    }
}

fn log_state_transition(from: SessionState, to: SessionState) {
    match (from, to) {
        (SessionState::Live, SessionState::Dialing) => {
            warn!("Broker session lost, dialing");
        }
        (SessionState::Declaring, SessionState::Live) => {
            info!("Broker session live");
        }
        (a, b) if a == b => {}
        _ => {
            debug!("Broker session state: {:?} -> {:?}", from, to);
        }
    }
}

/// Shared reference to the supervisor's current session
///
/// Holders must re-read the channel for every operation: the session is
/// replaced wholesale after a reconnect, and a channel cloned before the swap
/// fails with a stale-channel error.
pub struct ConnectionHandle<B: Broker> {
    current: SharedSession<B::Connection>,
    status: watch::Receiver<SessionStatus>,
    supervisor: Arc<ConnectionSupervisor<B>>,
    watcher: AbortHandle,
}

impl<B: Broker> Clone for ConnectionHandle<B> {
    fn clone(&self) -> Self {
        Self {
            current: Arc::clone(&self.current),
            status: self.status.clone(),
            supervisor: Arc::clone(&self.supervisor),
            watcher: self.watcher.clone(),
        }
    }
}

impl<B: Broker> ConnectionHandle<B> {
    /// The current session
    pub fn session(&self) -> Arc<Session<B::Connection>> {
        self.current.load_full()
    }

    /// The current channel
    pub fn channel(&self) -> ChannelOf<B> {
        self.current.load().channel.clone()
    }

    /// Generation of the session currently held
    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.status().state == SessionState::Live
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn metrics(&self) -> SupervisorMetrics {
        self.supervisor.metrics()
    }

    /// Wait until the session is live, returning its generation
    pub async fn wait_until_live(&self) -> u64 {
        let mut status = self.status.clone();
        status
            .wait_for(|s| s.state == SessionState::Live)
            .await
            .map(|s| s.generation)
            .unwrap_or_else(|_| self.generation())
    }

    /// Stop reconnecting and close the live connection; for process shutdown
    ///
    /// Final for the supervisor: later `acquire` calls return the stopped session.
    pub async fn shutdown(&self) {
        self.watcher.abort();
        self.current.load().connection.close().await;
        info!("Broker connection supervisor stopped");
    }
}
