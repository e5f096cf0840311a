// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Broker-side CONNECT handshake helpers.

use std::net::SocketAddr;

use bytes::Bytes;
use codec::{AnyPacket, ConnectPacket, ConnectReturnCode, ProtocolLevel};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Error, ErrorKind};
use crate::session::{ApplicationMessage, Session, Will};
use crate::stream::StreamReader;

/// Read exactly one packet and require it to be CONNECT [MQTT-3.1.0-1].
///
/// # Errors
///
/// Returns error on EOF, malformed bytes, or a packet of a different type.
pub async fn read_connect(reader: &mut StreamReader) -> Result<ConnectPacket, Error> {
    match reader.read_packet().await? {
        AnyPacket::Connect(packet) => Ok(packet),
        packet => Err(Error::from_string(
            ErrorKind::ProtocolError,
            format!(
                "Expected CONNECT as first packet, got {:?}",
                packet.packet_type()
            ),
        )),
    }
}

/// Validate a CONNECT packet against the acceptance rules.
///
/// Returns the CONNACK return code to reject with, or `None` when the
/// packet is acceptable. Violations that forbid any CONNACK (wrong
/// protocol name, reserved flag) are rejected at decode time already.
#[must_use]
pub fn validate_connect(packet: &ConnectPacket) -> Option<ConnectReturnCode> {
    // Only MQTT 3.1.1 is supported [MQTT-3.1.2-1].
    if packet.protocol_level() != ProtocolLevel::V311 {
        return Some(ConnectReturnCode::UnacceptableProtocolVersion);
    }

    // If the username flag is 0, the password flag must be 0
    // [MQTT-3.1.2-22].
    if !packet.connect_flags().has_username() && packet.connect_flags().has_password() {
        return Some(ConnectReturnCode::BadUsernamePassword);
    }

    // A generated client id together with clean_session=0 is rejected
    // [MQTT-3.1.3-8] [MQTT-3.1.3-9].
    if !packet.clean_session() && packet.client_id_is_random() {
        return Some(ConnectReturnCode::IdentifierRejected);
    }

    None
}

/// Build a fresh session from an accepted CONNECT packet.
///
/// `timeout_disconnect_delay` is added to a non-zero keep-alive on the
/// broker side only, as read-timeout grace.
#[must_use]
pub fn session_from_connect(
    packet: &ConnectPacket,
    remote_address: SocketAddr,
    timeout_disconnect_delay: u64,
) -> (Session, UnboundedReceiver<ApplicationMessage>) {
    let (mut session, delivery_rx) = Session::new(packet.client_id(), packet.clean_session());
    session.set_remote_address(Some(remote_address));

    let keep_alive = u64::from(packet.keep_alive());
    if keep_alive > 0 {
        session.set_keep_alive(keep_alive + timeout_disconnect_delay);
    }

    if packet.connect_flags().will() {
        if let Some(topic) = packet.will_topic() {
            session.set_will(Some(Will {
                topic: topic.to_string(),
                message: Bytes::copy_from_slice(packet.will_message()),
                qos: packet.connect_flags().will_qos(),
                retain: packet.connect_flags().will_retain(),
            }));
        }
    }

    if packet.connect_flags().has_username() {
        session.set_username(Some(packet.username().to_string()));
    }
    if packet.connect_flags().has_password() {
        session.set_password(Some(packet.password().to_vec()));
    }

    (session, delivery_rx)
}

#[cfg(test)]
mod tests {
    use codec::QoS;

    use super::*;

    #[test]
    fn test_validate_accepted() {
        let packet = ConnectPacket::new("c1").unwrap();
        assert_eq!(validate_connect(&packet), None);
    }

    #[test]
    fn test_validate_password_without_username() {
        let mut packet = ConnectPacket::new("c1").unwrap();
        let mut flags = *packet.connect_flags();
        flags.set_password(true);
        packet.set_connect_flags(flags);
        assert_eq!(
            validate_connect(&packet),
            Some(ConnectReturnCode::BadUsernamePassword)
        );
    }

    #[test]
    fn test_session_from_connect_carries_will() {
        let mut packet = ConnectPacket::new("c1").unwrap();
        packet.set_keep_alive(20);
        packet
            .set_will("will/t", b"gone", QoS::AtLeastOnce, true)
            .unwrap();
        let addr: SocketAddr = "127.0.0.1:1883".parse().unwrap();
        let (session, _rx) = session_from_connect(&packet, addr, 5);

        assert_eq!(session.client_id(), "c1");
        assert_eq!(session.keep_alive(), 25);
        let will = session.will().unwrap();
        assert_eq!(will.topic, "will/t");
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }
}
