// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker core: listeners, session map, subscription/retained indexes and
//! the broadcast fan-out loop.

mod acceptor;
mod broadcast;
mod connection;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use codec::QoS;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::auth::{AuthContext, AuthDecision, AuthPolicy, TopicAction};
use crate::config::{Config, General, Protocol};
use crate::constants::BROADCAST_DRAIN_TIMEOUT;
use crate::error::{Error, ErrorKind};
use crate::events::{Event, EventBus, Observer};
use crate::handler::ProtocolHandler;
use crate::retained::RetainedStore;
use crate::session::{RetainedMessage, Session};
use crate::stream::load_tls_acceptor;
use crate::subscriptions::SubscriptionIndex;

/// Broker lifecycle states.
///
/// `new → starting → {started | not_started}`,
/// `started → stopping → {stopped | not_stopped}`, `stopped → starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    New,
    Starting,
    Started,
    NotStarted,
    Stopping,
    Stopped,
    NotStopped,
}

/// One queued fan-out item, consumed by the broadcast loop strictly FIFO.
#[derive(Debug, Clone)]
pub(crate) struct BroadcastItem {
    pub source_client_id: Option<String>,
    pub topic: String,
    pub data: Bytes,
    pub qos_override: Option<QoS>,
}

/// Session map entry. The handler slot is empty while the client is
/// offline.
pub(crate) struct ClientEntry {
    pub session: Arc<Mutex<Session>>,
    pub handler: Option<Arc<ProtocolHandler>>,
}

/// State shared between acceptors, per-client loops and the broadcast
/// loop.
pub(crate) struct BrokerInner {
    pub general: General,
    pub event_bus: Arc<EventBus>,
    pub policies: Vec<Arc<dyn AuthPolicy>>,

    pub sessions: Mutex<HashMap<String, ClientEntry>>,
    pub subscriptions: Mutex<SubscriptionIndex>,
    pub retained: Mutex<RetainedStore>,

    pub broadcast_tx: Mutex<Option<UnboundedSender<BroadcastItem>>>,
    pub broadcast_depth: AtomicUsize,
}

impl BrokerInner {
    /// Enqueue a fan-out item. Items queued while no broadcast loop runs
    /// are dropped with a warning.
    pub fn send_broadcast(&self, item: BroadcastItem) {
        let guard = self.broadcast_tx.lock().unwrap();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(item).is_ok() {
                    self.broadcast_depth.fetch_add(1, Ordering::SeqCst);
                }
            }
            None => log::warn!("broker: Broadcast queue is not running, message dropped"),
        }
    }

    /// Store or clear a retained message [MQTT-3.3.1-10].
    pub fn retain_message(
        &self,
        source_client_id: Option<String>,
        topic: &str,
        data: Bytes,
        qos: QoS,
    ) {
        self.retained
            .lock()
            .unwrap()
            .put(RetainedMessage::new(source_client_id, topic, data, qos));
    }

    /// Combined decision of all policies: allow iff none denies.
    pub async fn authenticate(&self, context: &AuthContext) -> bool {
        for policy in &self.policies {
            if policy.authenticate(context).await == AuthDecision::Deny {
                log::debug!(
                    "broker: Authentication of {} denied by policy",
                    context.client_id
                );
                return false;
            }
        }
        true
    }

    /// Topic access check, disabled unless `topic_check` is configured.
    pub async fn topic_allowed(
        &self,
        context: &AuthContext,
        topic: &str,
        action: TopicAction,
    ) -> bool {
        if !self.general.topic_check() {
            return true;
        }
        for policy in &self.policies {
            if !policy.topic_allowed(context, topic, action).await {
                return false;
            }
        }
        true
    }
}

/// Build an [`AuthContext`] snapshot from a session.
pub(crate) fn auth_context(session: &Arc<Mutex<Session>>) -> AuthContext {
    let session = session.lock().unwrap();
    AuthContext {
        client_id: session.client_id().to_string(),
        username: session.username().map(ToString::to_string),
        password: session.password().map(<[u8]>::to_vec),
        remote_address: session.remote_address(),
    }
}

/// MQTT 3.1.1 broker.
pub struct Broker {
    config: Config,
    state: Mutex<BrokerState>,
    inner: Arc<BrokerInner>,

    accept_tasks: Mutex<Vec<JoinHandle<()>>>,
    broadcast_task: Mutex<Option<JoinHandle<()>>>,
    broadcast_shutdown: Mutex<Option<watch::Sender<bool>>>,
    bound_addrs: Mutex<Vec<SocketAddr>>,
}

impl Broker {
    /// Create a broker with the anonymous auth policy and no observers.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_extensions(config, Vec::new(), Vec::new())
    }

    /// Create a broker with lifecycle observers and auth policies.
    ///
    /// An empty policy list falls back to accepting every connection.
    #[must_use]
    pub fn with_extensions(
        config: Config,
        observers: Vec<Arc<dyn Observer>>,
        policies: Vec<Arc<dyn AuthPolicy>>,
    ) -> Self {
        let mut event_bus = EventBus::new();
        for observer in observers {
            event_bus.register(observer);
        }
        let policies = if policies.is_empty() {
            vec![Arc::new(crate::auth::AllowAnonymous::default()) as Arc<dyn AuthPolicy>]
        } else {
            policies
        };

        let inner = Arc::new(BrokerInner {
            general: config.general().clone(),
            event_bus: Arc::new(event_bus),
            policies,
            sessions: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(SubscriptionIndex::new()),
            retained: Mutex::new(RetainedStore::new()),
            broadcast_tx: Mutex::new(None),
            broadcast_depth: AtomicUsize::new(0),
        });

        Self {
            config,
            state: Mutex::new(BrokerState::New),
            inner,
            accept_tasks: Mutex::new(Vec::new()),
            broadcast_task: Mutex::new(None),
            broadcast_shutdown: Mutex::new(None),
            bound_addrs: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> BrokerState {
        *self.state.lock().unwrap()
    }

    /// Addresses the listeners are bound to, available once started.
    ///
    /// Useful with port 0 in the listener config.
    #[must_use]
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().unwrap().clone()
    }

    /// Bind all configured listeners and spawn the broadcast loop.
    ///
    /// # Errors
    ///
    /// Returns error and transitions to `not_started` if a listener
    /// cannot be bound.
    pub async fn start(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                BrokerState::New | BrokerState::Stopped => *state = BrokerState::Starting,
                current => {
                    return Err(Error::from_string(
                        ErrorKind::InternalError,
                        format!("Broker cannot be started from state {current:?}"),
                    ));
                }
            }
        }
        log::debug!("broker: Starting");

        self.inner.sessions.lock().unwrap().clear();
        *self.inner.subscriptions.lock().unwrap() = SubscriptionIndex::new();
        self.inner.retained.lock().unwrap().clear();

        self.inner.event_bus.fire_wait(Event::PreStart).await;

        match self.start_listeners().await {
            Ok(()) => {}
            Err(err) => {
                log::error!("broker: Startup failed: {err}");
                *self.state.lock().unwrap() = BrokerState::NotStarted;
                return Err(err);
            }
        }

        *self.state.lock().unwrap() = BrokerState::Started;
        self.inner.event_bus.fire_wait(Event::PostStart).await;

        let (broadcast_tx, broadcast_rx) = unbounded_channel();
        *self.inner.broadcast_tx.lock().unwrap() = Some(broadcast_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.broadcast_shutdown.lock().unwrap() = Some(shutdown_tx);
        let task = tokio::spawn(broadcast::broadcast_loop(
            Arc::clone(&self.inner),
            broadcast_rx,
            shutdown_rx,
        ));
        *self.broadcast_task.lock().unwrap() = Some(task);

        log::debug!("broker: Started");
        Ok(())
    }

    async fn start_listeners(&self) -> Result<(), Error> {
        let mut accept_tasks = Vec::new();
        let mut bound_addrs = Vec::new();

        for listener_config in self.config.listeners() {
            let addr: SocketAddr = listener_config.address().parse().map_err(|_| {
                Error::from_string(
                    ErrorKind::ConfigError,
                    format!("Invalid listener address: {}", listener_config.address()),
                )
            })?;
            let tcp_listener = TcpListener::bind(addr).await.map_err(|err| {
                Error::from_string(
                    ErrorKind::SocketError,
                    format!("Failed to bind {addr}: {err}"),
                )
            })?;
            let local_addr = tcp_listener.local_addr()?;
            bound_addrs.push(local_addr);

            let tls_acceptor = match listener_config.protocol() {
                Protocol::Mqtts | Protocol::Wss => {
                    let (Some(cert_file), Some(key_file)) =
                        (listener_config.cert_file(), listener_config.key_file())
                    else {
                        return Err(Error::from_string(
                            ErrorKind::ConfigError,
                            format!(
                                "Listener {} requires cert_file and key_file",
                                listener_config.name()
                            ),
                        ));
                    };
                    Some(load_tls_acceptor(cert_file, key_file)?)
                }
                Protocol::Mqtt | Protocol::Ws => None,
            };

            let server = Arc::new(acceptor::Server::new(
                listener_config.name(),
                listener_config.max_connections(),
            ));
            log::info!(
                "broker: Listener {} bound to {} (max_connections={:?})",
                listener_config.name(),
                local_addr,
                listener_config.max_connections()
            );

            accept_tasks.push(tokio::spawn(acceptor::accept_loop(
                Arc::clone(&self.inner),
                server,
                tcp_listener,
                listener_config.protocol(),
                tls_acceptor,
            )));
        }

        *self.bound_addrs.lock().unwrap() = bound_addrs;
        self.accept_tasks.lock().unwrap().extend(accept_tasks);
        Ok(())
    }

    /// Stop the broker: close sessions and listeners, drain the broadcast
    /// loop and clear all state.
    ///
    /// # Errors
    ///
    /// Returns error if the broker is not started.
    pub async fn shutdown(&self) -> Result<(), Error> {
        log::info!("broker: Shutting down");
        self.inner.event_bus.fire_wait(Event::PreShutdown).await;

        {
            let mut state = self.state.lock().unwrap();
            if *state != BrokerState::Started {
                return Err(Error::from_string(
                    ErrorKind::InternalError,
                    format!("Broker cannot be stopped from state {:?}", *state),
                ));
            }
            *state = BrokerState::Stopping;
        }

        // Cleanup all sessions.
        let entries: Vec<(String, Arc<Mutex<Session>>, Option<Arc<ProtocolHandler>>)> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions
                .drain()
                .map(|(client_id, entry)| (client_id, entry.session, entry.handler))
                .collect()
        };
        for (client_id, session, handler) in entries {
            log::debug!("broker: Stopping session {client_id}");
            if let Some(handler) = handler {
                handler.handle_connection_closed();
                handler.stop().await;
            }
            self.inner
                .subscriptions
                .lock()
                .unwrap()
                .remove_all(&client_id);
            let mut session = session.lock().unwrap();
            session.disconnect();
            session.clear_queues();
        }

        {
            let mut retained = self.inner.retained.lock().unwrap();
            log::debug!("broker: Clearing {} retained messages", retained.len());
            retained.clear();
        }

        // Stop the broadcast loop with a drain deadline.
        *self.inner.broadcast_tx.lock().unwrap() = None;
        if let Some(shutdown_tx) = self.broadcast_shutdown.lock().unwrap().take() {
            let _ = shutdown_tx.send(true);
        }
        let broadcast_task = self.broadcast_task.lock().unwrap().take();
        if let Some(task) = broadcast_task {
            if timeout(BROADCAST_DRAIN_TIMEOUT, task).await.is_err() {
                log::warn!("broker: Failed to cleanly shutdown broadcast loop");
            }
        }
        let undelivered = self.inner.broadcast_depth.swap(0, Ordering::SeqCst);
        if undelivered > 0 {
            log::warn!("broker: {undelivered} messages not broadcasted");
        }

        // Close listener instances.
        let accept_tasks: Vec<JoinHandle<()>> =
            self.accept_tasks.lock().unwrap().drain(..).collect();
        for task in accept_tasks {
            task.abort();
        }
        self.bound_addrs.lock().unwrap().clear();

        self.inner.event_bus.fire_wait(Event::PostShutdown).await;
        *self.state.lock().unwrap() = BrokerState::Stopped;
        log::info!("broker: Closed");
        Ok(())
    }

    /// Publish a message on behalf of the broker itself, e.g. telemetry.
    pub fn broadcast(&self, topic: &str, data: Bytes, qos: Option<QoS>) {
        self.inner.send_broadcast(BroadcastItem {
            source_client_id: None,
            topic: topic.to_string(),
            data,
            qos_override: qos,
        });
    }

    /// Store a retained message programmatically.
    pub fn retain(&self, topic: &str, data: Bytes, qos: QoS) {
        self.inner.retain_message(None, topic, data, qos);
    }

    /// Number of known sessions, connected or not.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }

    /// Number of topic filters with at least one subscriber.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().unwrap().len()
    }
}
