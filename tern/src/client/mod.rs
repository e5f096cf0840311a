// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! MQTT client core: connect/reconnect, publish/subscribe API and the
//! inbound delivery queue.

mod options;
mod stream;

pub use options::{BrokerAddress, ConnectOptions, Transport};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use codec::{ConnectPacket, ConnectReturnCode, QoS, SubscribeAck};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::error::{Error, ErrorKind};
use crate::events::{EventBus, Observer};
use crate::handler::{ClientHandler, HandlerRole, ProtocolHandler};
use crate::session::{ApplicationMessage, Session, SessionState, Will};

struct ClientInner {
    config: ClientConfig,
    client_id: String,
    event_bus: Arc<EventBus>,

    session: Mutex<Option<Arc<Mutex<Session>>>>,
    handler: Mutex<Option<Arc<ClientHandler>>>,
    connect_options: Mutex<Option<ConnectOptions>>,
    delivery_rx: tokio::sync::Mutex<Option<UnboundedReceiver<ApplicationMessage>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,

    connected_tx: watch::Sender<bool>,
    connected_rx: watch::Receiver<bool>,
    no_more_tx: watch::Sender<bool>,
    no_more_rx: watch::Receiver<bool>,
}

/// MQTT 3.1.1 client.
///
/// Provides the API for connecting to a broker and exchanging messages
/// using the MQTT protocol. API calls issued while disconnected block
/// until the connection is back, or fail once the supervisor gave up
/// reconnecting.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client. A missing `client_id` is generated randomly.
    ///
    /// # Errors
    ///
    /// Returns error if `config` is invalid.
    pub fn new(client_id: Option<&str>, config: ClientConfig) -> Result<Self, Error> {
        Self::with_observers(client_id, config, Vec::new())
    }

    /// Create a client with lifecycle observers.
    ///
    /// # Errors
    ///
    /// Returns error if `config` is invalid.
    pub fn with_observers(
        client_id: Option<&str>,
        config: ClientConfig,
        observers: Vec<Arc<dyn Observer>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let client_id = client_id.map_or_else(codec::utils::random_client_id, ToString::to_string);

        let mut event_bus = EventBus::new();
        for observer in observers {
            event_bus.register(observer);
        }

        let (connected_tx, connected_rx) = watch::channel(false);
        let (no_more_tx, no_more_rx) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                client_id,
                event_bus: Arc::new(event_bus),
                session: Mutex::new(None),
                handler: Mutex::new(None),
                connect_options: Mutex::new(None),
                delivery_rx: tokio::sync::Mutex::new(None),
                supervisor: Mutex::new(None),
                connected_tx,
                connected_rx,
                no_more_tx,
                no_more_rx,
            }),
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Session-present flag of the last CONNACK: the broker resumed a
    /// stored session for this client id.
    #[must_use]
    pub fn session_present(&self) -> bool {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(false, |session| session.lock().unwrap().parent() == 1)
    }

    /// Connect to a broker.
    ///
    /// Opens the transport named by the URI scheme, performs the
    /// CONNECT/CONNACK handshake and spawns a supervisor task watching
    /// for disconnection. With `auto_reconnect` configured, a failed
    /// connection is retried with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails or the broker rejects the
    /// CONNECT; a rejection carries the CONNACK return code.
    pub async fn connect(&self, connect_options: ConnectOptions) -> Result<ConnectReturnCode, Error> {
        let inner = &self.inner;
        let clean_session = connect_options.clean_session();

        // A clean session drops all prior state; a kept session survives
        // reconnects with its inflight windows.
        let new_delivery_rx = {
            let mut guard = inner.session.lock().unwrap();
            if clean_session || guard.is_none() {
                let (mut session, delivery_rx) = Session::new(&inner.client_id, clean_session);
                session.set_keep_alive(inner.config.effective_keep_alive());
                if let Some(will) = inner.config.will() {
                    session.set_will(Some(Will {
                        topic: will.topic.clone(),
                        message: Bytes::copy_from_slice(will.message.as_bytes()),
                        qos: will.qos,
                        retain: will.retain,
                    }));
                }
                *guard = Some(Arc::new(Mutex::new(session)));
                Some(delivery_rx)
            } else {
                None
            }
        };
        if let Some(delivery_rx) = new_delivery_rx {
            *inner.delivery_rx.lock().await = Some(delivery_rx);
        }

        let _ = inner.no_more_tx.send(false);
        *inner.connect_options.lock().unwrap() = Some(connect_options);

        match do_connect(inner).await {
            Ok(code) => Ok(code),
            Err(err) => {
                log::warn!("client: Connection failed: {err}");
                if inner.config.auto_reconnect() {
                    reconnect_with_backoff(inner).await
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Reconnect a previously connected broker, with exponential backoff
    /// `min(reconnect_max_interval, 2^n)` for up to `reconnect_retries`
    /// attempts (negative means unlimited).
    ///
    /// # Errors
    ///
    /// Returns error once the attempts are exhausted.
    pub async fn reconnect(&self) -> Result<ConnectReturnCode, Error> {
        reconnect_with_backoff(&self.inner).await
    }

    /// Send DISCONNECT and close the connection. A no-op when not
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns error if closing the stream fails.
    pub async fn disconnect(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if let Some(supervisor) = inner.supervisor.lock().unwrap().take() {
            supervisor.abort();
        }

        let handler = inner.handler.lock().unwrap().take();
        let Some(handler) = handler else {
            log::warn!("client: Not connected, ignoring disconnect");
            return Ok(());
        };
        let session = inner.session.lock().unwrap().clone();
        let connected = session
            .as_ref()
            .map_or(false, |session| {
                session.lock().unwrap().state() == SessionState::Connected
            });
        if !connected {
            log::warn!("client: Session not connected, ignoring disconnect");
            return Ok(());
        }

        if let Err(err) = handler.disconnect().await {
            log::warn!("client: Failed to send DISCONNECT: {err}");
        }
        let _ = inner.connected_tx.send(false);
        handler.stop().await;
        if let Some(session) = session {
            session.lock().unwrap().disconnect();
        }
        Ok(())
    }

    /// Publish a message.
    ///
    /// `qos` and `retain` fall back to the configured defaults. The call
    /// completes when the `QoS` flow does; `ack_timeout` bounds it.
    ///
    /// # Errors
    ///
    /// Returns error on timeout or when no more connections will be made.
    pub async fn publish(
        &self,
        topic: &str,
        data: &[u8],
        qos: Option<QoS>,
        retain: Option<bool>,
        ack_timeout: Option<Duration>,
    ) -> Result<ApplicationMessage, Error> {
        self.wait_connected().await?;
        let inner = &self.inner;
        let qos = qos.unwrap_or_else(|| inner.config.default_qos());
        let retain = retain.unwrap_or_else(|| inner.config.default_retain());
        let handler = current_handler(inner)?;
        handler
            .handler()
            .publish(topic, Bytes::copy_from_slice(data), qos, retain, ack_timeout)
            .await
    }

    /// Subscribe to topic filters, returning the granted codes in request
    /// order.
    ///
    /// # Errors
    ///
    /// Returns error if the connection drops before the SUBACK arrives.
    pub async fn subscribe(&self, topics: &[(String, QoS)]) -> Result<Vec<SubscribeAck>, Error> {
        self.wait_connected().await?;
        let inner = &self.inner;
        let handler = current_handler(inner)?;
        let packet_id = current_session(inner)?.lock().unwrap().next_packet_id()?;
        handler.subscribe(topics, packet_id).await
    }

    /// Unsubscribe from topic filters.
    ///
    /// # Errors
    ///
    /// Returns error if the connection drops before the UNSUBACK arrives.
    pub async fn unsubscribe(&self, topics: &[String]) -> Result<(), Error> {
        self.wait_connected().await?;
        let inner = &self.inner;
        let handler = current_handler(inner)?;
        let packet_id = current_session(inner)?.lock().unwrap().next_packet_id()?;
        handler.unsubscribe(topics, packet_id).await
    }

    /// Send PINGREQ and wait for the broker's PINGRESP.
    ///
    /// # Errors
    ///
    /// Returns error if the connection drops first.
    pub async fn ping(&self) -> Result<(), Error> {
        self.wait_connected().await?;
        let handler = current_handler(&self.inner)?;
        handler.ping().await
    }

    /// Deliver the next message received from the broker.
    ///
    /// Waits until a message arrives or `timeout_duration` passes.
    ///
    /// # Errors
    ///
    /// Returns a `Timeout` error when the deadline expires first.
    pub async fn deliver_message(
        &self,
        timeout_duration: Option<Duration>,
    ) -> Result<ApplicationMessage, Error> {
        let mut guard = self.inner.delivery_rx.lock().await;
        let delivery_rx = guard
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::InternalError, "Client was never connected"))?;

        let message = match timeout_duration {
            Some(duration) => timeout(duration, delivery_rx.recv())
                .await
                .map_err(|_elapsed| {
                    Error::new(ErrorKind::Timeout, "Timeout waiting for message")
                })?,
            None => delivery_rx.recv().await,
        };
        message.ok_or_else(|| Error::new(ErrorKind::ConnectionLost, "Delivery queue closed"))
    }

    /// Block until connected, or fail once the supervisor declared that
    /// no more connections will be made.
    async fn wait_connected(&self) -> Result<(), Error> {
        let mut connected_rx = self.inner.connected_rx.clone();
        let mut no_more_rx = self.inner.no_more_rx.clone();
        loop {
            if *connected_rx.borrow() {
                return Ok(());
            }
            if *no_more_rx.borrow() {
                return Err(Error::new(ErrorKind::ConnectionLost, "Will not reconnect"));
            }
            log::debug!("client: {} Not connected, waiting for it", self.inner.client_id);
            tokio::select! {
                changed = connected_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::new(ErrorKind::InternalError, "Client state is gone"));
                    }
                }
                changed = no_more_rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::new(ErrorKind::InternalError, "Client state is gone"));
                    }
                }
            }
        }
    }
}

fn current_handler(inner: &ClientInner) -> Result<Arc<ClientHandler>, Error> {
    inner
        .handler
        .lock()
        .unwrap()
        .as_ref()
        .map(Arc::clone)
        .ok_or_else(|| Error::new(ErrorKind::InternalError, "Handler is not initialized"))
}

fn current_session(inner: &ClientInner) -> Result<Arc<Mutex<Session>>, Error> {
    inner
        .session
        .lock()
        .unwrap()
        .as_ref()
        .map(Arc::clone)
        .ok_or_else(|| Error::new(ErrorKind::InternalError, "Session is not initialized"))
}

/// One connection attempt: open transport, handshake, start the handler.
fn _assert_send<T: Send>(_: T) {}

async fn do_connect(inner: &Arc<ClientInner>) -> Result<ConnectReturnCode, Error> {
    let connect_options = inner
        .connect_options
        .lock()
        .unwrap()
        .clone()
        .ok_or_else(|| Error::new(ErrorKind::InternalError, "Missing connection parameters"))?;
    let address = BrokerAddress::parse(connect_options.uri())?;
    let session = current_session(inner)?;

    // Userinfo in the URI seeds CONNECT credentials.
    {
        let mut locked = session.lock().unwrap();
        if locked.username().is_none() {
            locked.set_username(address.username().map(ToString::to_string));
        }
        if locked.password().is_none() {
            locked.set_password(address.password().map(|password| password.as_bytes().to_vec()));
        }
    }

    log::debug!("client: Connecting to {}", connect_options.uri());
    let (reader, writer) = stream::connect_transport(&address, &connect_options).await?;

    let (control_tx, control_rx) = unbounded_channel();
    let handler = ProtocolHandler::attach(
        HandlerRole::Client,
        Arc::clone(&session),
        Arc::clone(&inner.event_bus),
        reader,
        writer,
        control_tx,
    );
    let client_handler = Arc::new(ClientHandler::new(handler, control_rx));

    // The announced keep-alive includes the ping head start: the PINGREQ
    // timer runs at `keep_alive - ping_delay` while the broker's read
    // deadline uses the announced value.
    let connect_packet = build_connect_packet(&session, inner.config.keep_alive())?;
    let connack = client_handler.mqtt_connect(&connect_packet).await?;
    if connack.return_code() != ConnectReturnCode::Accepted {
        log::warn!(
            "client: Connection rejected with code {:?}",
            connack.return_code()
        );
        session.lock().unwrap().disconnect();
        client_handler.stop().await;
        return Err(Error::connect_rejected(connack.return_code()));
    }

    client_handler.handler().start().await;
    {
        let mut locked = session.lock().unwrap();
        locked.set_parent(u8::from(connack.session_present()));
        let _ = locked.connect();
    }
    *inner.handler.lock().unwrap() = Some(Arc::clone(&client_handler));
    let _ = inner.connected_tx.send(true);
    log::debug!("client: Connected to {}:{}", address.host(), address.port());

    let supervisor_inner = Arc::clone(inner);
    let supervisor = tokio::spawn(supervise(supervisor_inner, client_handler));
    if let Some(old) = inner.supervisor.lock().unwrap().replace(supervisor) {
        old.abort();
    }

    Ok(ConnectReturnCode::Accepted)
}

fn build_connect_packet(
    session: &Arc<Mutex<Session>>,
    keep_alive: u64,
) -> Result<ConnectPacket, Error> {
    let locked = session.lock().unwrap();
    let mut packet = ConnectPacket::new(locked.client_id())?;
    packet.set_keep_alive(u16::try_from(keep_alive).unwrap_or(u16::MAX));
    if let Some(username) = locked.username() {
        packet.set_username(username)?;
    }
    if let Some(password) = locked.password() {
        packet.set_password(password)?;
    }
    if let Some(will) = locked.will() {
        packet.set_will(&will.topic, &will.message, will.qos, will.retain)?;
    }
    let mut flags = *packet.connect_flags();
    flags.set_clean_session(locked.clean_session());
    packet.set_connect_flags(flags);
    Ok(packet)
}

/// Watch for connection loss; reconnect or give up depending on config.
async fn supervise(inner: Arc<ClientInner>, handler: Arc<ClientHandler>) {
    log::debug!("client: Monitoring broker disconnection");
    handler.wait_closed().await;
    log::warn!("client: Disconnected from broker");

    let _ = inner.connected_tx.send(false);
    handler.stop().await;
    if let Some(session) = inner.session.lock().unwrap().clone() {
        session.lock().unwrap().disconnect();
    }

    if inner.config.auto_reconnect() {
        log::debug!("client: Auto-reconnecting");
        if reconnect_with_backoff(&inner).await.is_err() {
            let _ = inner.no_more_tx.send(true);
        }
    } else {
        let _ = inner.no_more_tx.send(true);
    }
}

async fn reconnect_with_backoff(inner: &Arc<ClientInner>) -> Result<ConnectReturnCode, Error> {
    {
        let session = current_session(inner)?;
        if session.lock().unwrap().state() == SessionState::Connected {
            log::warn!("client: Already connected");
            return Ok(ConnectReturnCode::Accepted);
        }
    }

    let max_interval = inner.config.reconnect_max_interval();
    let retries = inner.config.reconnect_retries();
    let mut attempt: u32 = 1;

    loop {
        log::debug!("client: Reconnect attempt {attempt}");
        match do_connect(inner).await {
            Ok(code) => return Ok(code),
            Err(err) => {
                log::warn!("client: Reconnection attempt failed: {err}");
                if retries >= 0 && attempt > retries.unsigned_abs() {
                    log::error!("client: Maximum connection attempts reached, aborting");
                    return Err(Error::new(
                        ErrorKind::ConnectionLost,
                        "Too many failed reconnection attempts",
                    ));
                }
                let delay = max_interval.min(2_u64.saturating_pow(attempt));
                log::debug!("client: Waiting {delay} seconds before next attempt");
                tokio::time::sleep(Duration::from_secs(delay)).await;
                attempt += 1;
            }
        }
    }
}
