// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! CONNECT handshake, session adoption/take-over and the per-client loop.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use codec::{
    AnyPacket, ConnectAckPacket, ConnectReturnCode, PingResponsePacket, SubscribeAck,
    SubscribeAckPacket, SubscribePacket, TopicFilter, UnsubscribeAckPacket, UnsubscribePacket,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use super::{auth_context, BroadcastItem, BrokerInner, ClientEntry};
use crate::auth::TopicAction;
use crate::constants::TAKEOVER_RETRY_DELAY;
use crate::events::Event;
use crate::handler::{
    read_connect, session_from_connect, validate_connect, Control, HandlerRole, ProtocolHandler,
};
use crate::session::{ApplicationMessage, Session};
use crate::stream::{StreamReader, StreamWriter};

/// How the per-client loop ended; an abnormal end triggers the will.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disconnect {
    /// The client sent DISCONNECT [MQTT-3.14].
    Normal,

    /// EOF, keep-alive expiry or protocol violation.
    Abnormal,
}

/// Drive one accepted connection from CONNECT to disconnect.
pub(crate) async fn client_connected(
    inner: Arc<BrokerInner>,
    mut reader: StreamReader,
    mut writer: StreamWriter,
    peer_addr: SocketAddr,
) {
    log::info!("broker: Connection from {peer_addr}");

    // Wait for the first packet and expect a CONNECT [MQTT-3.1.0-1].
    let connect = match read_connect(&mut reader).await {
        Ok(packet) => packet,
        Err(err) => {
            log::warn!("broker: {peer_addr}: Can't read first packet as CONNECT: {err}");
            let _ = writer.close().await;
            return;
        }
    };

    if let Some(code) = validate_connect(&connect) {
        log::warn!("broker: {peer_addr}: CONNECT rejected with code {code:?}");
        // A rejected CONNECT gets session_present=0 [MQTT-3.2.2-4].
        let _ = writer
            .write_packet(&ConnectAckPacket::new(false, code))
            .await;
        let _ = writer.close().await;
        return;
    }

    let client_id = connect.client_id().to_string();

    // A clean-session CONNECT deletes all prior state for this client id.
    if connect.clean_session() {
        delete_session(&inner, &client_id).await;
    }

    // Build a fresh session or adopt the stored one.
    let (session, delivery_rx) = {
        let existing = if connect.clean_session() {
            None
        } else {
            inner
                .sessions
                .lock()
                .unwrap()
                .get(&client_id)
                .map(|entry| Arc::clone(&entry.session))
        };
        match existing {
            Some(session) => {
                log::debug!("broker: Found old session for {client_id}");
                let delivery_rx = {
                    let mut locked = session.lock().unwrap();
                    locked.set_parent(1);
                    locked.set_remote_address(Some(peer_addr));
                    locked.reset_delivery_queue()
                };
                (session, delivery_rx)
            }
            None => {
                let (mut session, delivery_rx) = session_from_connect(
                    &connect,
                    peer_addr,
                    inner.general.timeout_disconnect_delay(),
                );
                session.set_parent(0);
                (Arc::new(Mutex::new(session)), delivery_rx)
            }
        }
    };

    // Authentication: allow iff no policy denies.
    let context = auth_context(&session);
    if !inner.authenticate(&context).await {
        let _ = writer
            .write_packet(&ConnectAckPacket::new(
                false,
                ConnectReturnCode::NotAuthorized,
            ))
            .await;
        let _ = writer.close().await;
        return;
    }

    // Transition to connected; an already-connected session means a
    // take-over of the existing connection.
    loop {
        let old_handler = {
            let mut locked = session.lock().unwrap();
            if locked.connect().is_ok() {
                None
            } else {
                inner
                    .sessions
                    .lock()
                    .unwrap()
                    .get(&client_id)
                    .and_then(|entry| entry.handler.as_ref().map(Arc::clone))
            }
        };
        match old_handler {
            None => break,
            Some(old) => {
                log::warn!("broker: Client {client_id} is already connected, performing take-over");
                old.handle_connection_closed();
                old.stop().await;
                // The old per-client loop transitions the session to
                // disconnected on its way out; wait for it before retrying.
                tokio::time::sleep(TAKEOVER_RETRY_DELAY).await;
            }
        }
    }

    let (control_tx, control_rx) = unbounded_channel();
    let handler = ProtocolHandler::attach(
        HandlerRole::Broker,
        Arc::clone(&session),
        Arc::clone(&inner.event_bus),
        reader,
        writer,
        control_tx,
    );
    let session_present = {
        let locked = session.lock().unwrap();
        inner.sessions.lock().unwrap().insert(
            client_id.clone(),
            ClientEntry {
                session: Arc::clone(&session),
                handler: Some(Arc::clone(&handler)),
            },
        );
        locked.parent() == 1
    };

    let connack = ConnectAckPacket::new(session_present, ConnectReturnCode::Accepted);
    if handler.send_packet(&connack).await.is_err() {
        log::warn!("broker: {client_id}: Failed to send CONNACK");
        cleanup_connection(&inner, &session, &handler, &client_id).await;
        return;
    }
    inner
        .event_bus
        .fire_wait(Event::ClientConnected {
            client_id: client_id.clone(),
        })
        .await;

    log::debug!("broker: {client_id}: Start messages handling");
    handler.start().await;
    publish_session_retained_messages(&session, &handler).await;

    let disconnect = client_loop(&inner, &session, &handler, control_rx, delivery_rx).await;

    // Publish the will on abnormal disconnect, honoring will_retain.
    if disconnect == Disconnect::Abnormal {
        let will = session.lock().unwrap().will().cloned();
        if let Some(will) = will {
            log::debug!("broker: {client_id}: Abnormal disconnect, sending will message");
            inner.send_broadcast(BroadcastItem {
                source_client_id: Some(client_id.clone()),
                topic: will.topic.clone(),
                data: will.message.clone(),
                qos_override: Some(will.qos),
            });
            if will.retain {
                inner.retain_message(
                    Some(client_id.clone()),
                    &will.topic,
                    will.message.clone(),
                    will.qos,
                );
            }
        }
    }

    cleanup_connection(&inner, &session, &handler, &client_id).await;
    inner
        .event_bus
        .fire_wait(Event::ClientDisconnected {
            client_id: client_id.clone(),
        })
        .await;
    log::debug!("broker: {client_id}: Client disconnected");
}

/// Stop the handler and detach it from the session map, unless a newer
/// connection already took the slot over.
async fn cleanup_connection(
    inner: &Arc<BrokerInner>,
    session: &Arc<Mutex<Session>>,
    handler: &Arc<ProtocolHandler>,
    client_id: &str,
) {
    handler.handle_connection_closed();
    handler.stop().await;

    let owned = {
        let mut sessions = inner.sessions.lock().unwrap();
        match sessions.get_mut(client_id) {
            Some(entry) => match &entry.handler {
                Some(current) if Arc::ptr_eq(current, handler) => {
                    entry.handler = None;
                    true
                }
                _ => false,
            },
            None => false,
        }
    };
    if owned {
        session.lock().unwrap().disconnect();
    }
}

/// Delete an existing session, e.g. due to clean session set in CONNECT.
async fn delete_session(inner: &Arc<BrokerInner>, client_id: &str) {
    let entry = inner.sessions.lock().unwrap().remove(client_id);
    let Some(entry) = entry else {
        return;
    };
    log::debug!("broker: Deleting existing session {client_id}");

    if let Some(handler) = entry.handler {
        handler.handle_connection_closed();
        handler.stop().await;
    }
    inner.subscriptions.lock().unwrap().remove_all(client_id);
    let mut session = entry.session.lock().unwrap();
    session.disconnect();
    session.clear_queues();
}

/// Deliver messages queued for this session while it was offline.
async fn publish_session_retained_messages(
    session: &Arc<Mutex<Session>>,
    handler: &Arc<ProtocolHandler>,
) {
    let queued = session.lock().unwrap().drain_retained();
    if queued.is_empty() {
        return;
    }
    log::debug!(
        "broker: {}: Publishing {} messages retained for session",
        handler.client_id(),
        queued.len()
    );
    let mut tasks = Vec::with_capacity(queued.len());
    for message in queued {
        let handler = Arc::clone(handler);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = handler
                .publish(&message.topic, message.data, message.qos, true, None)
                .await
            {
                log::warn!(
                    "broker: {}: Failed to deliver queued message: {err}",
                    handler.client_id()
                );
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Service the connection until it disconnects: control packets from the
/// handler on one side, locally delivered PUBLISH messages on the other.
async fn client_loop(
    inner: &Arc<BrokerInner>,
    session: &Arc<Mutex<Session>>,
    handler: &Arc<ProtocolHandler>,
    mut control_rx: UnboundedReceiver<Control>,
    mut delivery_rx: UnboundedReceiver<ApplicationMessage>,
) -> Disconnect {
    let client_id = handler.client_id();
    loop {
        tokio::select! {
            control = control_rx.recv() => match control {
                None | Some(Control::Closed) => return Disconnect::Abnormal,
                Some(Control::ReadTimeout) => {
                    log::warn!("broker: {client_id}: Keep-alive expired, closing connection");
                    return Disconnect::Abnormal;
                }
                Some(Control::Packet(AnyPacket::Disconnect(..))) => return Disconnect::Normal,
                Some(Control::Packet(AnyPacket::Connect(..))) => {
                    // [MQTT-3.1.0-2] A second CONNECT is a protocol violation.
                    log::error!("broker: {client_id}: CONNECT received during messages handling");
                    return Disconnect::Abnormal;
                }
                Some(Control::Packet(AnyPacket::PingRequest(..))) => {
                    if let Err(err) = handler.send_packet(&PingResponsePacket::new()).await {
                        log::warn!("broker: {client_id}: Failed to send PINGRESP: {err}");
                    }
                }
                Some(Control::Packet(AnyPacket::Subscribe(packet))) => {
                    handle_subscription(inner, session, handler, packet).await;
                }
                Some(Control::Packet(AnyPacket::Unsubscribe(packet))) => {
                    handle_unsubscription(inner, session, handler, packet).await;
                }
                Some(Control::Packet(packet)) => {
                    log::warn!(
                        "broker: {client_id}: Unexpected packet: {:?}",
                        packet.packet_type()
                    );
                }
            },
            delivered = delivery_rx.recv() => match delivered {
                None => return Disconnect::Abnormal,
                Some(message) => {
                    if !handle_message_delivery(inner, session, message).await {
                        return Disconnect::Abnormal;
                    }
                }
            },
        }
    }
}

/// Grant each requested filter, answer SUBACK in request order and replay
/// matching retained messages.
async fn handle_subscription(
    inner: &Arc<BrokerInner>,
    session: &Arc<Mutex<Session>>,
    handler: &Arc<ProtocolHandler>,
    packet: SubscribePacket,
) {
    let client_id = handler.client_id().to_string();
    log::debug!("broker: {client_id}: Handling subscription");
    let context = auth_context(session);

    let mut acks = Vec::with_capacity(packet.topics().len());
    for topic in packet.topics() {
        let permitted = inner
            .topic_allowed(&context, topic.topic(), TopicAction::Subscribe)
            .await;
        let ack = if permitted {
            inner.subscriptions.lock().unwrap().add(
                topic.topic(),
                &client_id,
                topic.qos(),
                inner.general.max_qos(),
            )
        } else {
            SubscribeAck::Failed
        };
        acks.push(ack);
    }

    let suback = SubscribeAckPacket::with_vec(packet.packet_id(), acks.clone());
    if let Err(err) = handler.send_packet(&suback).await {
        log::warn!("broker: {client_id}: Failed to send SUBACK: {err}");
        return;
    }

    for (topic, ack) in packet.topics().iter().zip(acks) {
        let SubscribeAck::QoS(granted_qos) = ack else {
            continue;
        };
        inner
            .event_bus
            .fire_wait(Event::ClientSubscribed {
                client_id: client_id.clone(),
                topic: topic.topic().to_string(),
                qos: granted_qos,
            })
            .await;
        publish_retained_for_subscription(inner, handler, topic.topic(), granted_qos).await;
    }
}

/// Replay retained messages matching a fresh subscription, each at
/// `min(sub_qos, retained_qos)` with the retain flag set.
async fn publish_retained_for_subscription(
    inner: &Arc<BrokerInner>,
    handler: &Arc<ProtocolHandler>,
    filter: &str,
    sub_qos: codec::QoS,
) {
    let Ok(compiled) = TopicFilter::parse(filter) else {
        return;
    };
    let matches = inner.retained.lock().unwrap().scan(&compiled);
    if matches.is_empty() {
        return;
    }
    log::debug!(
        "broker: {}: Replaying {} retained messages for {filter}",
        handler.client_id(),
        matches.len()
    );

    let mut tasks = Vec::with_capacity(matches.len());
    for retained in matches {
        let handler = Arc::clone(handler);
        let qos = sub_qos.min(retained.qos);
        tasks.push(tokio::spawn(async move {
            if let Err(err) = handler
                .publish(&retained.topic, retained.data, qos, true, None)
                .await
            {
                log::warn!(
                    "broker: {}: Failed to replay retained message: {err}",
                    handler.client_id()
                );
            }
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
}

/// Remove each filter and acknowledge. UNSUBACK is sent even when the
/// client had no such subscription.
async fn handle_unsubscription(
    inner: &Arc<BrokerInner>,
    _session: &Arc<Mutex<Session>>,
    handler: &Arc<ProtocolHandler>,
    packet: UnsubscribePacket,
) {
    let client_id = handler.client_id().to_string();
    log::debug!("broker: {client_id}: Handling unsubscription");

    for topic in packet.topics() {
        inner
            .subscriptions
            .lock()
            .unwrap()
            .remove(topic.as_ref(), &client_id);
        inner
            .event_bus
            .fire_wait(Event::ClientUnsubscribed {
                client_id: client_id.clone(),
                topic: topic.as_ref().to_string(),
            })
            .await;
    }

    let unsuback = UnsubscribeAckPacket::new(packet.packet_id());
    if let Err(err) = handler.send_packet(&unsuback).await {
        log::warn!("broker: {client_id}: Failed to send UNSUBACK: {err}");
    }
}

/// Process one message published by this client. Returns false when the
/// connection must be closed.
async fn handle_message_delivery(
    inner: &Arc<BrokerInner>,
    session: &Arc<Mutex<Session>>,
    message: ApplicationMessage,
) -> bool {
    let client_id = session.lock().unwrap().client_id().to_string();

    if message.topic.is_empty() {
        log::warn!("broker: {client_id}: Empty TOPIC sent in PUBLISH message, closing connection");
        return false;
    }
    // [MQTT-3.3.2-2] Topic names must not contain wildcards. The codec
    // rejects them already; this guards the internal publish path.
    if message.topic.contains(|c| c == '#' || c == '+') {
        log::warn!(
            "broker: {client_id}: Invalid TOPIC sent in PUBLISH message, closing connection"
        );
        return false;
    }

    let context = auth_context(session);
    let permitted = inner
        .topic_allowed(&context, &message.topic, TopicAction::Publish)
        .await;
    if permitted {
        inner
            .event_bus
            .fire_wait(Event::MessageReceived {
                client_id: client_id.clone(),
                message: message.clone(),
            })
            .await;
        inner.send_broadcast(BroadcastItem {
            source_client_id: Some(client_id.clone()),
            topic: message.topic.clone(),
            data: message.data.clone(),
            qos_override: None,
        });
        if message.retain {
            inner.retain_message(Some(client_id), &message.topic, message.data, message.qos);
        }
    } else {
        log::info!("broker: {client_id}: Forbidden TOPIC {} in PUBLISH", message.topic);
    }
    true
}
