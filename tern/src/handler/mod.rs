// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Per-connection protocol driver shared by broker and client.
//!
//! The handler runs a reader task which decodes one packet at a time and
//! either resolves acknowledgement waiters (PUBACK/PUBREC/PUBREL/PUBCOMP),
//! spawns a message-flow task (PUBLISH), or forwards the packet to the
//! role-specific owner through the control channel. All writes pass
//! through a single async mutex so concurrent publishes cannot interleave
//! bytes on the wire.

mod broker;
mod client;

pub use broker::{read_connect, session_from_connect, validate_connect};
pub use client::ClientHandler;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use codec::{
    AnyPacket, EncodePacket, Packet, PingRequestPacket, PublishAckPacket, PublishCompletePacket,
    PublishPacket, PublishReceivedPacket, PublishReleasePacket, QoS,
};
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::constants::{PUBACK_TIMEOUT, REDELIVERY_TIMEOUT};
use crate::error::{Error, ErrorKind};
use crate::events::{Event, EventBus};
use crate::session::{ApplicationMessage, Direction, Session};
use crate::stream::{StreamReader, StreamWriter};

/// Which end of the protocol this handler drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerRole {
    Broker,
    Client,
}

/// Messages from the handler to its role-specific owner.
///
/// Acknowledgement and PUBLISH packets are consumed inside the handler;
/// everything else ends up here.
#[derive(Debug)]
pub enum Control {
    Packet(AnyPacket),

    /// No packet arrived within the keep-alive window.
    ReadTimeout,

    /// EOF, malformed packet or write failure. Fired once.
    Closed,
}

#[derive(Default)]
struct AckWaiters {
    puback: HashMap<u16, oneshot::Sender<PublishAckPacket>>,
    pubrec: HashMap<u16, oneshot::Sender<PublishReceivedPacket>>,
    pubrel: HashMap<u16, oneshot::Sender<PublishReleasePacket>>,
    pubcomp: HashMap<u16, oneshot::Sender<PublishCompletePacket>>,
}

impl AckWaiters {
    fn cancel_all(&mut self) {
        // Dropping the senders fails every pending flow with ConnectionLost.
        self.puback.clear();
        self.pubrec.clear();
        self.pubrel.clear();
        self.pubcomp.clear();
    }
}

/// Protocol handler state shared by the reader task and publish flows.
pub struct ProtocolHandler {
    role: HandlerRole,
    client_id: String,
    session: Arc<Mutex<Session>>,
    event_bus: Arc<EventBus>,

    reader: tokio::sync::Mutex<Option<StreamReader>>,
    writer: tokio::sync::Mutex<StreamWriter>,
    waiters: Mutex<AckWaiters>,
    control_tx: UnboundedSender<Control>,

    /// Reader deadline; `None` turns the keep-alive read bound off.
    read_timeout: Option<Duration>,

    /// Write-side keep-alive period; `None` turns the PINGREQ timer off.
    keepalive: Option<Duration>,
    keepalive_reset: Notify,

    closed: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProtocolHandler {
    /// Attach a handler to a session and a connection.
    ///
    /// `control_tx` receives control packets and connection lifecycle
    /// notifications for the role-specific owner.
    #[must_use]
    pub fn attach(
        role: HandlerRole,
        session: Arc<Mutex<Session>>,
        event_bus: Arc<EventBus>,
        reader: StreamReader,
        writer: StreamWriter,
        control_tx: UnboundedSender<Control>,
    ) -> Arc<Self> {
        let (client_id, keep_alive) = {
            let session = session.lock().unwrap();
            (session.client_id().to_string(), session.keep_alive())
        };
        let (read_timeout, keepalive) = match role {
            // The broker bounds reads by the negotiated keep-alive and
            // never pings.
            HandlerRole::Broker => (
                (keep_alive > 0).then(|| Duration::from_secs(keep_alive)),
                None,
            ),
            // The client pings when the write side has been idle for the
            // keep-alive period.
            HandlerRole::Client => (None, (keep_alive > 0).then(|| Duration::from_secs(keep_alive))),
        };

        Arc::new(Self {
            role,
            client_id,
            session,
            event_bus,
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(writer),
            waiters: Mutex::new(AckWaiters::default()),
            control_tx,
            read_timeout,
            keepalive,
            keepalive_reset: Notify::new(),
            closed: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub fn session(&self) -> &Arc<Mutex<Session>> {
        &self.session
    }

    /// Read one packet directly from the stream.
    ///
    /// Only valid before [`Self::start`]; used for the CONNECT/CONNACK
    /// handshake which precedes the reader loop.
    ///
    /// # Errors
    ///
    /// Returns error if the reader task already owns the stream, or on
    /// read failure.
    pub async fn read_packet_direct(&self) -> Result<AnyPacket, Error> {
        let mut guard = self.reader.lock().await;
        match guard.as_mut() {
            Some(reader) => reader.read_packet().await,
            None => Err(Error::new(
                ErrorKind::InternalError,
                "Reader is owned by the reader task",
            )),
        }
    }

    /// Start the reader loop and keep-alive timer, then replay inflight
    /// messages of a resumed session [MQTT-4.4.0-1].
    pub async fn start(self: &Arc<Self>) {
        let reader_task = tokio::spawn(Arc::clone(self).reader_loop());
        let mut tasks = vec![reader_task];
        if let Some(period) = self.keepalive {
            if self.role == HandlerRole::Client {
                tasks.push(tokio::spawn(Arc::clone(self).keepalive_loop(period)));
            }
        }
        self.tasks.lock().unwrap().extend(tasks);

        self.retry_deliveries().await;
    }

    /// Stop handler tasks, cancel pending waiters and close the writer.
    /// Idempotent.
    pub async fn stop(&self) {
        self.waiters.lock().unwrap().cancel_all();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        if let Err(err) = writer.close().await {
            log::debug!("handler: {} Failed to close writer: {}", self.client_id, err);
        }
    }

    /// Cancel all waiters and notify the owner, once.
    ///
    /// Every pending publish flow fails with `ConnectionLost`.
    pub fn handle_connection_closed(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("handler: {} Connection closed", self.client_id);
        self.waiters.lock().unwrap().cancel_all();
        let _ = self.control_tx.send(Control::Closed);
    }

    /// Send a packet through the write mutex and reset the keep-alive
    /// timer.
    ///
    /// # Errors
    ///
    /// Returns error if encoding fails or the connection is gone.
    pub async fn send_packet<P: EncodePacket + Packet>(&self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        {
            let mut writer = self.writer.lock().await;
            if let Err(err) = writer.write(&buf).await {
                self.handle_connection_closed();
                return Err(err);
            }
        }
        self.keepalive_reset.notify_one();
        self.event_bus.fire(Event::PacketSent {
            client_id: self.client_id.clone(),
            packet_type: packet.packet_type(),
        });
        Ok(())
    }

    /// Publish a message and drive its `QoS` flow to completion.
    ///
    /// The call returns once the flow finished: immediately for `QoS` 0,
    /// on PUBACK for `QoS` 1, on PUBCOMP for `QoS` 2. With `ack_timeout`
    /// set, the whole flow is bounded and unwinds on expiry.
    ///
    /// # Errors
    ///
    /// Returns error on timeout, lost connection or exhausted packet ids.
    pub async fn publish(
        self: &Arc<Self>,
        topic: &str,
        data: Bytes,
        qos: QoS,
        retain: bool,
        ack_timeout: Option<Duration>,
    ) -> Result<ApplicationMessage, Error> {
        let packet_id = if qos == QoS::AtMostOnce {
            None
        } else {
            Some(self.session.lock().unwrap().next_packet_id()?)
        };
        let message =
            ApplicationMessage::new(packet_id, topic, qos, data, retain, Direction::Outbound);

        match ack_timeout {
            Some(deadline) => match timeout(deadline, self.outbound_flow(message)).await {
                Ok(ret) => ret,
                // The dropped flow future removed its waiter and inflight
                // entry on unwind.
                Err(_elapsed) => Err(Error::from_string(
                    ErrorKind::Timeout,
                    format!("Publish to {topic} was not acknowledged in time"),
                )),
            },
            None => self.outbound_flow(message).await,
        }
    }

    async fn outbound_flow(
        self: &Arc<Self>,
        mut message: ApplicationMessage,
    ) -> Result<ApplicationMessage, Error> {
        match message.qos {
            QoS::AtMostOnce => {
                let packet = message.build_publish_packet(false)?;
                self.send_packet(&packet).await?;
                message.publish_packet = Some(packet);
                Ok(message)
            }
            QoS::AtLeastOnce => self.outbound_qos1(message).await,
            QoS::ExactOnce => self.outbound_qos2(message).await,
        }
    }

    async fn outbound_qos1(
        self: &Arc<Self>,
        mut message: ApplicationMessage,
    ) -> Result<ApplicationMessage, Error> {
        let packet_id = required_packet_id(&message)?;

        // A publish packet already built means this is a redelivery.
        let dup = message.publish_packet.is_some();
        let packet = message.build_publish_packet(dup)?;
        message.publish_packet = Some(packet.clone());
        self.session
            .lock()
            .unwrap()
            .inflight_out_mut()
            .insert(packet_id, message.clone());

        let rx = self.register_puback_waiter(packet_id)?;
        let mut guard = FlowGuard::new(self, packet_id, WaiterKind::PubAck, true);
        if let Err(err) = self.send_packet(&packet).await {
            // A lost connection keeps the message inflight so that it is
            // redelivered with DUP=1 on reconnect.
            if err.kind() == ErrorKind::ConnectionLost {
                guard.disarm();
            }
            return Err(err);
        }

        match timeout(PUBACK_TIMEOUT, rx).await {
            Err(_elapsed) => {
                log::warn!(
                    "handler: {} Timeout waiting for PUBACK of packet id {}",
                    self.client_id,
                    packet_id
                );
                Err(Error::from_string(
                    ErrorKind::Timeout,
                    format!("No PUBACK for packet id {packet_id}"),
                ))
            }
            Ok(Err(_recv)) => {
                guard.disarm();
                Err(Error::new(ErrorKind::ConnectionLost, "Connection lost"))
            }
            Ok(Ok(puback)) => {
                message.puback_packet = Some(puback);
                Ok(message)
            }
        }
    }

    async fn outbound_qos2(
        self: &Arc<Self>,
        mut message: ApplicationMessage,
    ) -> Result<ApplicationMessage, Error> {
        let packet_id = required_packet_id(&message)?;

        // Step 1: PUBLISH, wait for PUBREC. Skipped when redelivering a
        // message whose PUBREL was already sent.
        if message.pubrel_packet.is_none() {
            let dup = message.publish_packet.is_some();
            let packet = message.build_publish_packet(dup)?;
            message.publish_packet = Some(packet.clone());
            self.session
                .lock()
                .unwrap()
                .inflight_out_mut()
                .insert(packet_id, message.clone());

            let rx = self.register_pubrec_waiter(packet_id)?;
            let mut guard = FlowGuard::new(self, packet_id, WaiterKind::PubRec, true);
            if let Err(err) = self.send_packet(&packet).await {
                if err.kind() == ErrorKind::ConnectionLost {
                    guard.disarm();
                }
                return Err(err);
            }
            let pubrec = match rx.await {
                Ok(pubrec) => pubrec,
                Err(_recv) => {
                    // Keep the message inflight for redelivery on reconnect.
                    guard.disarm();
                    return Err(Error::new(ErrorKind::ConnectionLost, "Connection lost"));
                }
            };
            // The message stays inflight until PUBCOMP.
            guard.disarm();

            message.pubrec_packet = Some(pubrec);
            self.session
                .lock()
                .unwrap()
                .inflight_out_mut()
                .insert(packet_id, message.clone());
        }

        // Step 2: PUBREL, wait for PUBCOMP. On redelivery the same PUBREL
        // is sent again, no DUP bit applies.
        let pubrel = PublishReleasePacket::new(codec::PacketId::new(packet_id));
        message.pubrel_packet = Some(pubrel);
        self.session
            .lock()
            .unwrap()
            .inflight_out_mut()
            .insert(packet_id, message.clone());

        let rx = self.register_pubcomp_waiter(packet_id)?;
        let mut guard = FlowGuard::new(self, packet_id, WaiterKind::PubComp, true);
        if let Err(err) = self.send_packet(&pubrel).await {
            if err.kind() == ErrorKind::ConnectionLost {
                guard.disarm();
            }
            return Err(err);
        }
        let pubcomp = match rx.await {
            Ok(pubcomp) => pubcomp,
            Err(_recv) => {
                // The PUBREL stage is replayed on reconnect.
                guard.disarm();
                return Err(Error::new(ErrorKind::ConnectionLost, "Connection lost"));
            }
        };
        message.pubcomp_packet = Some(pubcomp);
        Ok(message)
    }

    /// Replay inflight messages of both directions with a per-message
    /// deadline, in insertion order [MQTT-4.4.0-1].
    async fn retry_deliveries(self: &Arc<Self>) {
        let (out_messages, in_messages) = {
            let session = self.session.lock().unwrap();
            let out: Vec<ApplicationMessage> = session.inflight_out().iter().cloned().collect();
            let input: Vec<ApplicationMessage> = session.inflight_in().iter().cloned().collect();
            (out, input)
        };
        if out_messages.is_empty() && in_messages.is_empty() {
            return;
        }
        log::debug!(
            "handler: {} Begin message delivery retries, out: {}, in: {}",
            self.client_id,
            out_messages.len(),
            in_messages.len()
        );

        let mut tasks = Vec::new();
        for message in out_messages {
            let handler = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                timeout(REDELIVERY_TIMEOUT, handler.outbound_flow(message))
                    .await
                    .is_ok()
            }));
        }
        for message in in_messages {
            let handler = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                timeout(REDELIVERY_TIMEOUT, handler.incoming_qos2(message))
                    .await
                    .is_ok()
            }));
        }

        let mut redelivered = 0;
        let total = tasks.len();
        for task in tasks {
            if let Ok(true) = task.await {
                redelivered += 1;
            }
        }
        log::debug!(
            "handler: {} {}/{} messages redelivered",
            self.client_id,
            redelivered,
            total
        );
    }

    async fn reader_loop(self: Arc<Self>) {
        log::debug!("handler: {} Starting reader loop", self.client_id);
        let mut reader = match self.reader.lock().await.take() {
            Some(reader) => reader,
            None => {
                log::error!("handler: {} Reader is already taken", self.client_id);
                return;
            }
        };

        let mut running_tasks: std::collections::VecDeque<JoinHandle<()>> =
            std::collections::VecDeque::new();
        loop {
            while running_tasks
                .front()
                .map_or(false, tokio::task::JoinHandle::is_finished)
            {
                running_tasks.pop_front();
            }

            let ret = if let Some(deadline) = self.read_timeout {
                match timeout(deadline, reader.read_packet()).await {
                    Ok(ret) => ret,
                    Err(_elapsed) => {
                        log::debug!("handler: {} Read timeout", self.client_id);
                        let _ = self.control_tx.send(Control::ReadTimeout);
                        break;
                    }
                }
            } else {
                reader.read_packet().await
            };

            match ret {
                Ok(packet) => {
                    self.event_bus.fire(Event::PacketReceived {
                        client_id: self.client_id.clone(),
                        packet_type: packet.packet_type(),
                    });
                    self.dispatch(packet, &mut running_tasks);
                }
                Err(err) if err.kind() == ErrorKind::ConnectionLost => {
                    log::debug!("handler: {} No more data, EOF received", self.client_id);
                    break;
                }
                Err(err) => {
                    // Malformed packets escalate to connection close.
                    log::warn!(
                        "handler: {} Closing connection on read error: {}",
                        self.client_id,
                        err
                    );
                    break;
                }
            }
        }

        for task in running_tasks {
            task.abort();
        }
        self.handle_connection_closed();
        log::debug!("handler: {} Reader loop stopped", self.client_id);
    }

    /// Route one decoded packet. The reader never blocks on flow
    /// completion; PUBLISH flows run as subtasks.
    fn dispatch(
        self: &Arc<Self>,
        packet: AnyPacket,
        running_tasks: &mut std::collections::VecDeque<JoinHandle<()>>,
    ) {
        match packet {
            AnyPacket::Publish(publish) => {
                let handler = Arc::clone(self);
                running_tasks.push_back(tokio::spawn(async move {
                    handler.handle_incoming_publish(publish).await;
                }));
            }
            AnyPacket::PublishAck(puback) => self.handle_puback(&puback),
            AnyPacket::PublishReceived(pubrec) => self.handle_pubrec(&pubrec),
            AnyPacket::PublishRelease(pubrel) => self.handle_pubrel(&pubrel),
            AnyPacket::PublishComplete(pubcomp) => self.handle_pubcomp(&pubcomp),
            packet => {
                let _ = self.control_tx.send(Control::Packet(packet));
            }
        }
    }

    async fn handle_incoming_publish(self: Arc<Self>, packet: PublishPacket) {
        let qos = packet.qos();
        let packet_id = (qos != QoS::AtMostOnce).then(|| packet.packet_id());
        let mut message = ApplicationMessage::new(
            packet_id,
            packet.topic(),
            qos,
            Bytes::copy_from_slice(packet.message()),
            packet.retain(),
            Direction::Inbound,
        );
        message.publish_packet = Some(packet.clone());

        match qos {
            QoS::AtMostOnce => {
                if packet.dup() {
                    // [MQTT-3.3.1-2] DUP must be 0 for QoS 0 messages.
                    log::warn!(
                        "handler: {} DUP flag set on QoS 0 message, ignored",
                        self.client_id
                    );
                    return;
                }
                if let Err(err) = self.session.lock().unwrap().deliver(message) {
                    log::warn!(
                        "handler: {} Delivery queue is gone, QoS 0 message discarded: {}",
                        self.client_id,
                        err
                    );
                }
            }
            QoS::AtLeastOnce => {
                if let Err(err) = self.session.lock().unwrap().deliver(message.clone()) {
                    log::warn!(
                        "handler: {} Delivery queue is gone, QoS 1 message discarded: {}",
                        self.client_id,
                        err
                    );
                }
                // The acknowledgement is fire-and-forget; redelivery is the
                // sender's responsibility.
                let puback = PublishAckPacket::new(packet.packet_id());
                if let Err(err) = self.send_packet(&puback).await {
                    log::warn!("handler: {} Failed to send PUBACK: {}", self.client_id, err);
                }
            }
            QoS::ExactOnce => self.incoming_qos2(message).await,
        }
    }

    async fn incoming_qos2(self: &Arc<Self>, mut message: ApplicationMessage) {
        let Some(packet_id) = message.packet_id else {
            log::error!("handler: {} QoS 2 message without packet id", self.client_id);
            return;
        };
        let pid = packet_id.value();

        self.session
            .lock()
            .unwrap()
            .inflight_in_mut()
            .insert(pid, message.clone());

        // A new PUBLISH for a pending packet id means the sender retried:
        // the existing PUBREL waiter is replaced and its flow cancelled.
        let rx = {
            let mut waiters = self.waiters.lock().unwrap();
            if waiters.pubrel.remove(&pid).is_some() {
                log::warn!(
                    "handler: {} A PUBREL waiter already exists for packet id {}, replacing it",
                    self.client_id,
                    pid
                );
            }
            let (tx, rx) = oneshot::channel();
            waiters.pubrel.insert(pid, tx);
            rx
        };

        let pubrec = PublishReceivedPacket::new(packet_id);
        message.pubrec_packet = Some(pubrec);
        if let Err(err) = self.send_packet(&pubrec).await {
            log::warn!("handler: {} Failed to send PUBREC: {}", self.client_id, err);
            return;
        }

        match rx.await {
            // Replaced by a retried PUBLISH or cancelled by teardown.
            Err(_recv) => log::debug!("handler: {} QoS 2 inbound flow cancelled", self.client_id),
            Ok(pubrel) => {
                message.pubrel_packet = Some(pubrel);
                {
                    let mut session = self.session.lock().unwrap();
                    if let Err(err) = session.deliver(message.clone()) {
                        log::warn!(
                            "handler: {} Delivery queue is gone, QoS 2 message discarded: {}",
                            self.client_id,
                            err
                        );
                    }
                    session.inflight_in_mut().remove(pid);
                }
                let pubcomp = PublishCompletePacket::new(packet_id);
                if let Err(err) = self.send_packet(&pubcomp).await {
                    log::warn!(
                        "handler: {} Failed to send PUBCOMP: {}",
                        self.client_id,
                        err
                    );
                }
            }
        }
    }

    fn handle_puback(&self, packet: &PublishAckPacket) {
        let pid = packet.packet_id().value();
        let waiter = self.waiters.lock().unwrap().puback.remove(&pid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(*packet);
            }
            None => log::warn!(
                "handler: {} Received PUBACK for unknown packet id {}",
                self.client_id,
                pid
            ),
        }
    }

    fn handle_pubrec(&self, packet: &PublishReceivedPacket) {
        let pid = packet.packet_id().value();
        let waiter = self.waiters.lock().unwrap().pubrec.remove(&pid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(*packet);
            }
            None => log::warn!(
                "handler: {} Received PUBREC for unknown packet id {}",
                self.client_id,
                pid
            ),
        }
    }

    fn handle_pubrel(&self, packet: &PublishReleasePacket) {
        let pid = packet.packet_id().value();
        let waiter = self.waiters.lock().unwrap().pubrel.remove(&pid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(*packet);
            }
            None => log::warn!(
                "handler: {} Received PUBREL for unknown packet id {}",
                self.client_id,
                pid
            ),
        }
    }

    fn handle_pubcomp(&self, packet: &PublishCompletePacket) {
        let pid = packet.packet_id().value();
        let waiter = self.waiters.lock().unwrap().pubcomp.remove(&pid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(*packet);
            }
            None => log::warn!(
                "handler: {} Received PUBCOMP for unknown packet id {}",
                self.client_id,
                pid
            ),
        }
    }

    fn register_puback_waiter(
        &self,
        pid: u16,
    ) -> Result<oneshot::Receiver<PublishAckPacket>, Error> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.puback.contains_key(&pid) {
            return Err(waiter_exists(pid));
        }
        let (tx, rx) = oneshot::channel();
        waiters.puback.insert(pid, tx);
        Ok(rx)
    }

    fn register_pubrec_waiter(
        &self,
        pid: u16,
    ) -> Result<oneshot::Receiver<PublishReceivedPacket>, Error> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.pubrec.contains_key(&pid) {
            return Err(waiter_exists(pid));
        }
        let (tx, rx) = oneshot::channel();
        waiters.pubrec.insert(pid, tx);
        Ok(rx)
    }

    fn register_pubcomp_waiter(
        &self,
        pid: u16,
    ) -> Result<oneshot::Receiver<PublishCompletePacket>, Error> {
        let mut waiters = self.waiters.lock().unwrap();
        if waiters.pubcomp.contains_key(&pid) {
            return Err(waiter_exists(pid));
        }
        let (tx, rx) = oneshot::channel();
        waiters.pubcomp.insert(pid, tx);
        Ok(rx)
    }

    async fn keepalive_loop(self: Arc<Self>, period: Duration) {
        loop {
            tokio::select! {
                // Any outbound write reschedules the timer.
                _ = self.keepalive_reset.notified() => {}
                _ = tokio::time::sleep(period) => {
                    log::debug!("handler: {} Keep-alive expired, sending PINGREQ", self.client_id);
                    if self.send_packet(&PingRequestPacket::new()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn required_packet_id(message: &ApplicationMessage) -> Result<u16, Error> {
    message
        .packet_id
        .map(|packet_id| packet_id.value())
        .ok_or_else(|| Error::new(ErrorKind::InternalError, "Packet id is not set"))
}

fn waiter_exists(pid: u16) -> Error {
    Error::from_string(
        ErrorKind::InternalError,
        format!("A waiter already exists for packet id {pid}"),
    )
}

#[derive(Clone, Copy)]
enum WaiterKind {
    PubAck,
    PubRec,
    PubComp,
}

/// Unwinds a cancelled or failed outbound flow: the registered waiter and
/// the inflight entry are removed when the guard drops, so an aborted
/// `publish` leaves the session consistent.
struct FlowGuard<'a> {
    handler: &'a ProtocolHandler,
    packet_id: u16,
    kind: WaiterKind,
    remove_inflight: bool,
}

impl<'a> FlowGuard<'a> {
    fn new(
        handler: &'a ProtocolHandler,
        packet_id: u16,
        kind: WaiterKind,
        remove_inflight: bool,
    ) -> Self {
        Self {
            handler,
            packet_id,
            kind,
            remove_inflight,
        }
    }

    /// Keep the inflight entry on drop; the waiter entry is still removed.
    fn disarm(&mut self) {
        self.remove_inflight = false;
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        {
            let mut waiters = self.handler.waiters.lock().unwrap();
            match self.kind {
                WaiterKind::PubAck => {
                    waiters.puback.remove(&self.packet_id);
                }
                WaiterKind::PubRec => {
                    waiters.pubrec.remove(&self.packet_id);
                }
                WaiterKind::PubComp => {
                    waiters.pubcomp.remove(&self.packet_id);
                }
            }
        }
        if self.remove_inflight {
            self.handler
                .session
                .lock()
                .unwrap()
                .inflight_out_mut()
                .remove(self.packet_id);
        }
    }
}
