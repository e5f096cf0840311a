// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use bytes::Bytes;
use codec::{
    EncodeError, PacketId, PublishAckPacket, PublishCompletePacket, PublishPacket,
    PublishReceivedPacket, PublishReleasePacket, QoS,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::error::{Error, ErrorKind};

/// Connection state of a session.
///
/// `new → connected` on an accepted CONNECT, `connected → disconnected` on
/// DISCONNECT or error, `disconnected → connected` on reconnect. Disconnect
/// is idempotent from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Connected,
    Disconnected,
}

/// Message flow direction relative to this peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

/// Will message carried in CONNECT, published by the broker when the client
/// disconnects abnormally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// `ApplicationMessage` stores published message information flow.
///
/// Created when a PUBLISH is produced or received; destroyed when the `QoS`
/// flow completes. The ack packet fields record flow progress so that a
/// retried message resumes at the right step.
#[derive(Debug, Clone)]
pub struct ApplicationMessage {
    pub packet_id: Option<PacketId>,
    pub topic: String,
    pub qos: QoS,
    pub data: Bytes,
    pub retain: bool,
    pub direction: Direction,

    pub publish_packet: Option<PublishPacket>,
    pub puback_packet: Option<PublishAckPacket>,
    pub pubrec_packet: Option<PublishReceivedPacket>,
    pub pubrel_packet: Option<PublishReleasePacket>,
    pub pubcomp_packet: Option<PublishCompletePacket>,
}

impl ApplicationMessage {
    #[must_use]
    pub fn new(
        packet_id: Option<PacketId>,
        topic: &str,
        qos: QoS,
        data: Bytes,
        retain: bool,
        direction: Direction,
    ) -> Self {
        Self {
            packet_id,
            topic: topic.to_string(),
            qos,
            data,
            retain,
            direction,
            publish_packet: None,
            puback_packet: None,
            pubrec_packet: None,
            pubrel_packet: None,
            pubcomp_packet: None,
        }
    }

    /// Build a `PublishPacket` from message attributes.
    ///
    /// # Errors
    ///
    /// Returns error if the stored topic is invalid.
    pub fn build_publish_packet(&self, dup: bool) -> Result<PublishPacket, EncodeError> {
        let mut packet = PublishPacket::new(&self.topic, self.qos, &self.data)?;
        packet.set_retain(self.retain);
        if let Some(packet_id) = self.packet_id {
            packet.set_packet_id(packet_id);
        }
        if dup {
            packet.set_dup(true)?;
        }
        Ok(packet)
    }
}

/// Two application messages are equal iff their packet ids match.
impl PartialEq for ApplicationMessage {
    fn eq(&self, other: &Self) -> bool {
        self.packet_id == other.packet_id
    }
}

/// A retained message stored by the broker, or queued for an offline session.
///
/// The source client id is kept for audit only; the store owns the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub source_client_id: Option<String>,
    pub topic: String,
    pub data: Bytes,
    pub qos: QoS,
}

impl RetainedMessage {
    #[must_use]
    pub fn new(source_client_id: Option<String>, topic: &str, data: Bytes, qos: QoS) -> Self {
        Self {
            source_client_id,
            topic: topic.to_string(),
            data,
            qos,
        }
    }
}

/// Insertion-ordered map of inflight messages keyed by packet id.
///
/// Iteration order is first-inserted-first so that redelivery on reconnect
/// replays messages in their original order [MQTT-4.4.0-1].
#[derive(Debug, Default, Clone)]
pub struct InflightMap {
    order: VecDeque<u16>,
    entries: HashMap<u16, ApplicationMessage>,
}

impl InflightMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.contains_key(&packet_id)
    }

    #[must_use]
    pub fn get(&self, packet_id: u16) -> Option<&ApplicationMessage> {
        self.entries.get(&packet_id)
    }

    pub fn get_mut(&mut self, packet_id: u16) -> Option<&mut ApplicationMessage> {
        self.entries.get_mut(&packet_id)
    }

    /// Insert a message, replacing any existing entry with the same packet id
    /// in place (its position in the replay order is kept).
    pub fn insert(&mut self, packet_id: u16, message: ApplicationMessage) {
        if self.entries.insert(packet_id, message).is_none() {
            self.order.push_back(packet_id);
        }
    }

    pub fn remove(&mut self, packet_id: u16) -> Option<ApplicationMessage> {
        let message = self.entries.remove(&packet_id)?;
        self.order.retain(|id| *id != packet_id);
        Some(message)
    }

    /// Iterate messages in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &ApplicationMessage> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }
}

/// Per-client session state, shared by broker and client cores.
///
/// A session outlives its network connection when `clean_session` is false;
/// the broker adopts it again on reconnect and replays inflight messages.
#[derive(Debug)]
pub struct Session {
    client_id: String,
    clean_session: bool,
    keep_alive: u64,
    state: SessionState,

    /// Session-present flag sent in CONNACK, 1 when an existing session
    /// was resumed.
    parent: u8,

    will: Option<Will>,
    username: Option<String>,
    password: Option<Vec<u8>>,
    remote_address: Option<SocketAddr>,

    packet_id_counter: u16,

    /// Outgoing messages pending acknowledgement.
    inflight_out: InflightMap,

    /// Incoming messages pending acknowledgement.
    inflight_in: InflightMap,

    /// Messages retained for this session while it was offline, delivered
    /// on reconnect.
    retained_queue: VecDeque<RetainedMessage>,

    /// Hand-off of received messages from the protocol handler to the
    /// delivery consumer. The receiving half is held by the broker's
    /// per-client loop or by the client API.
    delivery_tx: UnboundedSender<ApplicationMessage>,
}

impl Session {
    /// Create a new session, returning it together with the receiving half
    /// of its delivery queue.
    #[must_use]
    pub fn new(client_id: &str, clean_session: bool) -> (Self, UnboundedReceiver<ApplicationMessage>) {
        let (delivery_tx, delivery_rx) = unbounded_channel();
        let session = Self {
            client_id: client_id.to_string(),
            clean_session,
            keep_alive: 0,
            state: SessionState::New,
            parent: 0,
            will: None,
            username: None,
            password: None,
            remote_address: None,
            packet_id_counter: 0,
            inflight_out: InflightMap::new(),
            inflight_in: InflightMap::new(),
            retained_queue: VecDeque::new(),
            delivery_tx,
        };
        (session, delivery_rx)
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.clean_session
    }

    pub fn set_clean_session(&mut self, clean_session: bool) {
        self.clean_session = clean_session;
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u64 {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: u64) {
        self.keep_alive = keep_alive;
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub const fn parent(&self) -> u8 {
        self.parent
    }

    pub fn set_parent(&mut self, parent: u8) {
        self.parent = parent;
    }

    #[must_use]
    pub const fn will(&self) -> Option<&Will> {
        self.will.as_ref()
    }

    pub fn set_will(&mut self, will: Option<Will>) {
        self.will = will;
    }

    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn set_username(&mut self, username: Option<String>) {
        self.username = username;
    }

    #[must_use]
    pub fn password(&self) -> Option<&[u8]> {
        self.password.as_deref()
    }

    pub fn set_password(&mut self, password: Option<Vec<u8>>) {
        self.password = password;
    }

    #[must_use]
    pub const fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    pub fn set_remote_address(&mut self, addr: Option<SocketAddr>) {
        self.remote_address = addr;
    }

    /// Transition to `connected`.
    ///
    /// # Errors
    ///
    /// Returns error if the session is already connected; the caller then
    /// performs a take-over of the existing connection.
    pub fn connect(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::New | SessionState::Disconnected => {
                self.state = SessionState::Connected;
                Ok(())
            }
            SessionState::Connected => Err(Error::from_string(
                ErrorKind::ProtocolError,
                format!("Session {} is already connected", self.client_id),
            )),
        }
    }

    /// Transition to `disconnected`. Idempotent from any state.
    pub fn disconnect(&mut self) {
        self.state = SessionState::Disconnected;
    }

    /// Allocate the next free packet id.
    ///
    /// The counter is monotone in `[1, 65535]` and skips ids that are still
    /// inflight in either direction.
    ///
    /// # Errors
    ///
    /// Returns error if all 65535 ids are inflight.
    pub fn next_packet_id(&mut self) -> Result<PacketId, Error> {
        self.packet_id_counter = (self.packet_id_counter % 65535) + 1;
        let limit = self.packet_id_counter;
        while self.inflight_in.contains(self.packet_id_counter)
            || self.inflight_out.contains(self.packet_id_counter)
        {
            self.packet_id_counter = (self.packet_id_counter % 65535) + 1;
            if self.packet_id_counter == limit {
                return Err(Error::new(
                    ErrorKind::NoFreePacketId,
                    "More than 65535 messages pending. No free packet id",
                ));
            }
        }
        Ok(PacketId::new(self.packet_id_counter))
    }

    #[must_use]
    pub const fn inflight_out(&self) -> &InflightMap {
        &self.inflight_out
    }

    pub fn inflight_out_mut(&mut self) -> &mut InflightMap {
        &mut self.inflight_out
    }

    #[must_use]
    pub const fn inflight_in(&self) -> &InflightMap {
        &self.inflight_in
    }

    pub fn inflight_in_mut(&mut self) -> &mut InflightMap {
        &mut self.inflight_in
    }

    /// Queue a message retained for this session while it is offline.
    pub fn push_retained(&mut self, message: RetainedMessage) {
        self.retained_queue.push_back(message);
    }

    /// Drain messages queued while the session was offline, FIFO.
    pub fn drain_retained(&mut self) -> Vec<RetainedMessage> {
        self.retained_queue.drain(..).collect()
    }

    #[must_use]
    pub fn retained_queue_len(&self) -> usize {
        self.retained_queue.len()
    }

    /// Hand a received message over to the delivery consumer.
    ///
    /// # Errors
    ///
    /// Returns error if the receiving half is gone.
    pub fn deliver(&self, message: ApplicationMessage) -> Result<(), Error> {
        self.delivery_tx
            .send(message)
            .map_err(|_err| Error::new(ErrorKind::ChannelError, "Delivery queue receiver is gone"))
    }

    /// Replace the delivery queue, returning the new receiving half.
    ///
    /// The broker installs a fresh hand-off for every connection so that the
    /// per-client loop of a previous connection cannot consume messages of
    /// the new one.
    pub fn reset_delivery_queue(&mut self) -> UnboundedReceiver<ApplicationMessage> {
        let (tx, rx) = unbounded_channel();
        self.delivery_tx = tx;
        rx
    }

    /// Clear inflight maps and queues on session destruction or
    /// `clean_session` reconnect.
    pub fn clear_queues(&mut self) {
        self.inflight_out.clear();
        self.inflight_in.clear();
        self.retained_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound_message(packet_id: u16) -> ApplicationMessage {
        ApplicationMessage::new(
            Some(PacketId::new(packet_id)),
            "a/b",
            QoS::AtLeastOnce,
            Bytes::from_static(b"x"),
            false,
            Direction::Outbound,
        )
    }

    #[test]
    fn test_state_machine() {
        let (mut session, _rx) = Session::new("c1", true);
        assert_eq!(session.state(), SessionState::New);
        assert!(session.connect().is_ok());
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.connect().is_err());

        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        // Disconnect is idempotent.
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);

        assert!(session.connect().is_ok());
    }

    #[test]
    fn test_packet_id_allocation() {
        let (mut session, _rx) = Session::new("c1", true);
        assert_eq!(session.next_packet_id().unwrap().value(), 1);
        assert_eq!(session.next_packet_id().unwrap().value(), 2);

        // Ids still inflight are skipped.
        session.inflight_out_mut().insert(3, outbound_message(3));
        assert_eq!(session.next_packet_id().unwrap().value(), 4);
    }

    #[test]
    fn test_packet_id_wraps() {
        let (mut session, _rx) = Session::new("c1", true);
        session.packet_id_counter = 65534;
        assert_eq!(session.next_packet_id().unwrap().value(), 65535);
        assert_eq!(session.next_packet_id().unwrap().value(), 1);
    }

    #[test]
    fn test_packet_id_exhaustion() {
        let (mut session, _rx) = Session::new("c1", true);
        for id in 1..=u16::MAX {
            session.inflight_out_mut().insert(id, outbound_message(id));
        }
        let ret = session.next_packet_id();
        assert!(ret.is_err());
        assert_eq!(ret.unwrap_err().kind(), ErrorKind::NoFreePacketId);
    }

    #[test]
    fn test_inflight_fifo_order() {
        let mut map = InflightMap::new();
        map.insert(5, outbound_message(5));
        map.insert(1, outbound_message(1));
        map.insert(9, outbound_message(9));
        map.remove(1);
        map.insert(2, outbound_message(2));

        let order: Vec<u16> = map.iter().map(|msg| msg.packet_id.unwrap().value()).collect();
        assert_eq!(order, vec![5, 9, 2]);
    }

    #[test]
    fn test_message_equality_by_packet_id() {
        let first = outbound_message(7);
        let mut second = outbound_message(7);
        second.topic = "other".to_string();
        assert_eq!(first, second);
        assert_ne!(first, outbound_message(8));
    }

    #[test]
    fn test_clear_queues() {
        let (mut session, _rx) = Session::new("c1", false);
        session.inflight_out_mut().insert(1, outbound_message(1));
        session.push_retained(RetainedMessage::new(
            None,
            "t",
            Bytes::from_static(b"r"),
            QoS::AtMostOnce,
        ));
        session.clear_queues();
        assert!(session.inflight_out().is_empty());
        assert_eq!(session.retained_queue_len(), 0);
    }
}
