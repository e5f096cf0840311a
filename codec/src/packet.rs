// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, ConnectAckPacket, ConnectPacket, DecodeError, DecodePacket, DisconnectPacket,
    EncodeError, EncodePacket, PacketType, PingRequestPacket, PingResponsePacket,
    PublishAckPacket, PublishCompletePacket, PublishPacket, PublishReceivedPacket,
    PublishReleasePacket, SubscribeAckPacket, SubscribePacket, UnsubscribeAckPacket,
    UnsubscribePacket,
};

/// Tagged variant over the 14 MQTT 3.1.1 packet types.
///
/// Decoding dispatches on the packet type in the first byte of the fixed
/// header; reserved types 0 and 15 are rejected there.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, PartialEq)]
pub enum AnyPacket {
    Connect(ConnectPacket),
    ConnectAck(ConnectAckPacket),
    Publish(PublishPacket),
    PublishAck(PublishAckPacket),
    PublishReceived(PublishReceivedPacket),
    PublishRelease(PublishReleasePacket),
    PublishComplete(PublishCompletePacket),
    Subscribe(SubscribePacket),
    SubscribeAck(SubscribeAckPacket),
    Unsubscribe(UnsubscribePacket),
    UnsubscribeAck(UnsubscribeAckPacket),
    PingRequest(PingRequestPacket),
    PingResponse(PingResponsePacket),
    Disconnect(DisconnectPacket),
}

impl AnyPacket {
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Connect(..) => PacketType::Connect,
            Self::ConnectAck(..) => PacketType::ConnectAck,
            Self::Publish(packet) => PacketType::Publish {
                dup: packet.dup(),
                qos: packet.qos(),
                retain: packet.retain(),
            },
            Self::PublishAck(..) => PacketType::PublishAck,
            Self::PublishReceived(..) => PacketType::PublishReceived,
            Self::PublishRelease(..) => PacketType::PublishRelease,
            Self::PublishComplete(..) => PacketType::PublishComplete,
            Self::Subscribe(..) => PacketType::Subscribe,
            Self::SubscribeAck(..) => PacketType::SubscribeAck,
            Self::Unsubscribe(..) => PacketType::Unsubscribe,
            Self::UnsubscribeAck(..) => PacketType::UnsubscribeAck,
            Self::PingRequest(..) => PacketType::PingRequest,
            Self::PingResponse(..) => PacketType::PingResponse,
            Self::Disconnect(..) => PacketType::Disconnect,
        }
    }
}

impl DecodePacket for AnyPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        // Peek the packet type; each packet decoder consumes the whole
        // fixed header itself.
        let packet_type = PacketType::try_from(ba.peek_byte()?)?;

        match packet_type {
            PacketType::Connect => ConnectPacket::decode(ba).map(Self::Connect),
            PacketType::ConnectAck => ConnectAckPacket::decode(ba).map(Self::ConnectAck),
            PacketType::Publish { .. } => PublishPacket::decode(ba).map(Self::Publish),
            PacketType::PublishAck => PublishAckPacket::decode(ba).map(Self::PublishAck),
            PacketType::PublishReceived => {
                PublishReceivedPacket::decode(ba).map(Self::PublishReceived)
            }
            PacketType::PublishRelease => {
                PublishReleasePacket::decode(ba).map(Self::PublishRelease)
            }
            PacketType::PublishComplete => {
                PublishCompletePacket::decode(ba).map(Self::PublishComplete)
            }
            PacketType::Subscribe => SubscribePacket::decode(ba).map(Self::Subscribe),
            PacketType::SubscribeAck => SubscribeAckPacket::decode(ba).map(Self::SubscribeAck),
            PacketType::Unsubscribe => UnsubscribePacket::decode(ba).map(Self::Unsubscribe),
            PacketType::UnsubscribeAck => {
                UnsubscribeAckPacket::decode(ba).map(Self::UnsubscribeAck)
            }
            PacketType::PingRequest => PingRequestPacket::decode(ba).map(Self::PingRequest),
            PacketType::PingResponse => PingResponsePacket::decode(ba).map(Self::PingResponse),
            PacketType::Disconnect => DisconnectPacket::decode(ba).map(Self::Disconnect),
        }
    }
}

impl EncodePacket for AnyPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        match self {
            Self::Connect(packet) => packet.encode(buf),
            Self::ConnectAck(packet) => packet.encode(buf),
            Self::Publish(packet) => packet.encode(buf),
            Self::PublishAck(packet) => packet.encode(buf),
            Self::PublishReceived(packet) => packet.encode(buf),
            Self::PublishRelease(packet) => packet.encode(buf),
            Self::PublishComplete(packet) => packet.encode(buf),
            Self::Subscribe(packet) => packet.encode(buf),
            Self::SubscribeAck(packet) => packet.encode(buf),
            Self::Unsubscribe(packet) => packet.encode(buf),
            Self::UnsubscribeAck(packet) => packet.encode(buf),
            Self::PingRequest(packet) => packet.encode(buf),
            Self::PingResponse(packet) => packet.encode(buf),
            Self::Disconnect(packet) => packet.encode(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;
    use crate::{PacketId, QoS, SubscribeAck, SubscribeTopic};

    fn round_trip(packet: &AnyPacket) {
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = AnyPacket::decode(&mut ba).unwrap();
        assert_eq!(&decoded, packet);
        assert_eq!(ba.remaining_bytes(), 0);
    }

    #[test]
    fn test_round_trip_simple_packets() {
        round_trip(&AnyPacket::PingRequest(PingRequestPacket::new()));
        round_trip(&AnyPacket::PingResponse(PingResponsePacket::new()));
        round_trip(&AnyPacket::Disconnect(DisconnectPacket::new()));
        round_trip(&AnyPacket::PublishAck(PublishAckPacket::new(PacketId::new(1))));
        round_trip(&AnyPacket::PublishReceived(PublishReceivedPacket::new(
            PacketId::new(2),
        )));
        round_trip(&AnyPacket::PublishRelease(PublishReleasePacket::new(
            PacketId::new(3),
        )));
        round_trip(&AnyPacket::PublishComplete(PublishCompletePacket::new(
            PacketId::new(4),
        )));
        round_trip(&AnyPacket::UnsubscribeAck(UnsubscribeAckPacket::new(
            PacketId::new(5),
        )));
    }

    #[test]
    fn test_round_trip_random_publish() {
        // decode(encode(p)) == p over randomized payloads and flags.
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let qos = match rng.gen_range(0..3) {
                0 => QoS::AtMostOnce,
                1 => QoS::AtLeastOnce,
                _ => QoS::ExactOnce,
            };
            let payload_len = rng.gen_range(0..512);
            let payload: Vec<u8> = (0..payload_len).map(|_| rng.gen()).collect();
            let mut packet = PublishPacket::new("sensors/temp/0", qos, &payload).unwrap();
            packet.set_retain(rng.gen());
            if qos != QoS::AtMostOnce {
                packet.set_packet_id(PacketId::new(rng.gen_range(1..=u16::MAX)));
                packet.set_dup(rng.gen()).unwrap();
            }
            round_trip(&AnyPacket::Publish(packet));
        }
    }

    #[test]
    fn test_round_trip_random_subscribe() {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let count = rng.gen_range(1..8);
            let topics: Vec<SubscribeTopic> = (0..count)
                .map(|i| {
                    let qos = match rng.gen_range(0..3) {
                        0 => QoS::AtMostOnce,
                        1 => QoS::AtLeastOnce,
                        _ => QoS::ExactOnce,
                    };
                    SubscribeTopic::new(&format!("topic/{i}"), qos).unwrap()
                })
                .collect();
            let packet =
                SubscribePacket::with_topics(PacketId::new(rng.gen_range(1..=u16::MAX)), topics)
                    .unwrap();
            round_trip(&AnyPacket::Subscribe(packet));
        }
    }

    #[test]
    fn test_round_trip_connect() {
        let mut packet = ConnectPacket::new("round-trip").unwrap();
        packet.set_keep_alive(10);
        packet
            .set_will("will/topic", b"bye", QoS::ExactOnce, false)
            .unwrap();
        round_trip(&AnyPacket::Connect(packet));
    }

    #[test]
    fn test_round_trip_acks() {
        round_trip(&AnyPacket::ConnectAck(ConnectAckPacket::new(
            false,
            crate::ConnectReturnCode::IdentifierRejected,
        )));
        round_trip(&AnyPacket::SubscribeAck(SubscribeAckPacket::with_vec(
            PacketId::new(12),
            vec![
                SubscribeAck::QoS(QoS::AtMostOnce),
                SubscribeAck::QoS(QoS::AtLeastOnce),
                SubscribeAck::Failed,
            ],
        )));
    }

    #[test]
    fn test_decode_reserved_type() {
        let buf = [0xf0, 0x00];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(AnyPacket::decode(&mut ba), Err(DecodeError::InvalidPacketType));
    }
}
