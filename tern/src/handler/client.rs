// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Client-side specialization of the protocol handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use codec::{
    AnyPacket, ConnectAckPacket, ConnectPacket, DisconnectPacket, PacketId, PingRequestPacket,
    SubscribeAck, SubscribePacket, SubscribeTopic, UnsubscribePacket, QoS, SubTopic,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::{Control, ProtocolHandler};
use crate::error::{Error, ErrorKind};

type SubAckWaiters = Arc<Mutex<HashMap<u16, oneshot::Sender<Vec<SubscribeAck>>>>>;
type UnsubAckWaiters = Arc<Mutex<HashMap<u16, oneshot::Sender<()>>>>;

/// Drives the client end of the protocol: CONNECT/CONNACK round trip,
/// subscribe/unsubscribe round trips and PINGREQ/PINGRESP.
///
/// Owns the control channel of its [`ProtocolHandler`] and resolves
/// SUBACK/UNSUBACK waiters from it.
pub struct ClientHandler {
    handler: Arc<ProtocolHandler>,
    suback_waiters: SubAckWaiters,
    unsuback_waiters: UnsubAckWaiters,
    pingresp_rx: tokio::sync::Mutex<UnboundedReceiver<()>>,
    closed_rx: watch::Receiver<bool>,
    control_task: JoinHandle<()>,
}

impl ClientHandler {
    #[must_use]
    pub fn new(handler: Arc<ProtocolHandler>, control_rx: UnboundedReceiver<Control>) -> Self {
        let suback_waiters: SubAckWaiters = Arc::new(Mutex::new(HashMap::new()));
        let unsuback_waiters: UnsubAckWaiters = Arc::new(Mutex::new(HashMap::new()));
        let (pingresp_tx, pingresp_rx) = unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);

        let control_task = tokio::spawn(control_loop(
            handler.client_id().to_string(),
            control_rx,
            Arc::clone(&suback_waiters),
            Arc::clone(&unsuback_waiters),
            pingresp_tx,
            closed_tx,
        ));

        Self {
            handler,
            suback_waiters,
            unsuback_waiters,
            pingresp_rx: tokio::sync::Mutex::new(pingresp_rx),
            closed_rx,
            control_task,
        }
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    /// Send CONNECT and wait for CONNACK, returning the broker's answer.
    ///
    /// Called before [`ProtocolHandler::start`]; the CONNACK is read
    /// directly off the stream.
    ///
    /// # Errors
    ///
    /// Returns error on I/O failure or a non-CONNACK reply.
    pub async fn mqtt_connect(&self, packet: &ConnectPacket) -> Result<ConnectAckPacket, Error> {
        self.handler.send_packet(packet).await?;
        match self.handler.read_packet_direct().await? {
            AnyPacket::ConnectAck(connack) => Ok(connack),
            packet => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!(
                    "Expected CONNACK as first packet, got {:?}",
                    packet.packet_type()
                ),
            )),
        }
    }

    /// Subscribe to topics and wait for the SUBACK return codes, in
    /// request order.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is lost before the SUBACK arrives.
    pub async fn subscribe(
        &self,
        topics: &[(String, QoS)],
        packet_id: PacketId,
    ) -> Result<Vec<SubscribeAck>, Error> {
        let mut subscribe_topics = Vec::with_capacity(topics.len());
        for (topic, qos) in topics {
            subscribe_topics.push(SubscribeTopic::new(topic, *qos)?);
        }
        let packet = SubscribePacket::with_topics(packet_id, subscribe_topics)?;

        let rx = {
            let (tx, rx) = oneshot::channel();
            self.suback_waiters
                .lock()
                .unwrap()
                .insert(packet_id.value(), tx);
            rx
        };
        if let Err(err) = self.handler.send_packet(&packet).await {
            self.suback_waiters
                .lock()
                .unwrap()
                .remove(&packet_id.value());
            return Err(err);
        }
        rx.await
            .map_err(|_| Error::new(ErrorKind::ConnectionLost, "Connection lost"))
    }

    /// Unsubscribe from topics and wait for UNSUBACK.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is lost before the UNSUBACK arrives.
    pub async fn unsubscribe(&self, topics: &[String], packet_id: PacketId) -> Result<(), Error> {
        let mut unsubscribe_topics = Vec::with_capacity(topics.len());
        for topic in topics {
            unsubscribe_topics.push(SubTopic::new(topic)?);
        }
        let packet = UnsubscribePacket::with_topics(packet_id, unsubscribe_topics)?;

        let rx = {
            let (tx, rx) = oneshot::channel();
            self.unsuback_waiters
                .lock()
                .unwrap()
                .insert(packet_id.value(), tx);
            rx
        };
        if let Err(err) = self.handler.send_packet(&packet).await {
            self.unsuback_waiters
                .lock()
                .unwrap()
                .remove(&packet_id.value());
            return Err(err);
        }
        rx.await
            .map_err(|_| Error::new(ErrorKind::ConnectionLost, "Connection lost"))
    }

    /// Send PINGREQ and wait for PINGRESP.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is lost before the PINGRESP arrives.
    pub async fn ping(&self) -> Result<(), Error> {
        self.handler.send_packet(&PingRequestPacket::new()).await?;
        let mut rx = self.pingresp_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| Error::new(ErrorKind::ConnectionLost, "Connection lost"))
    }

    /// Send DISCONNECT. The caller closes the connection afterwards.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.handler.send_packet(&DisconnectPacket::new()).await
    }

    /// Wait until the broker connection is gone.
    pub async fn wait_closed(&self) {
        let mut closed_rx = self.closed_rx.clone();
        while !*closed_rx.borrow() {
            if closed_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop the underlying handler and the control task.
    pub async fn stop(&self) {
        self.handler.stop().await;
        self.control_task.abort();
    }
}

async fn control_loop(
    client_id: String,
    mut control_rx: UnboundedReceiver<Control>,
    suback_waiters: SubAckWaiters,
    unsuback_waiters: UnsubAckWaiters,
    pingresp_tx: UnboundedSender<()>,
    closed_tx: watch::Sender<bool>,
) {
    while let Some(control) = control_rx.recv().await {
        match control {
            Control::Closed => break,
            // The client bounds no reads; keep-alive is write driven.
            Control::ReadTimeout => {}
            Control::Packet(AnyPacket::SubscribeAck(suback)) => {
                let pid = suback.packet_id().value();
                let waiter = suback_waiters.lock().unwrap().remove(&pid);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(suback.acknowledgements().to_vec());
                    }
                    None => log::warn!(
                        "handler: {client_id} Received SUBACK for unknown packet id {pid}"
                    ),
                }
            }
            Control::Packet(AnyPacket::UnsubscribeAck(unsuback)) => {
                let pid = unsuback.packet_id().value();
                let waiter = unsuback_waiters.lock().unwrap().remove(&pid);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(());
                    }
                    None => log::warn!(
                        "handler: {client_id} Received UNSUBACK for unknown packet id {pid}"
                    ),
                }
            }
            Control::Packet(AnyPacket::PingResponse(..)) => {
                let _ = pingresp_tx.send(());
            }
            Control::Packet(packet) => {
                log::warn!(
                    "handler: {client_id} Unexpected packet: {:?}",
                    packet.packet_type()
                );
            }
        }
    }

    // Fail pending round trips and wake the supervisor.
    suback_waiters.lock().unwrap().clear();
    unsuback_waiters.lock().unwrap().clear();
    let _ = closed_tx.send(true);
}
