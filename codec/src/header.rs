// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, QoS, VarInt, VarIntError,
};

/// Packet type and flags in the first byte of the fixed header.
///
/// Types 0 and 15 are reserved and forbidden on the wire in MQTT 3.1.1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PacketType {
    /// Request to connect to broker
    #[default]
    Connect,

    /// Broker reply to connect request
    ConnectAck,

    /// Publish message
    Publish { dup: bool, qos: QoS, retain: bool },

    /// Publish acknowledgement
    PublishAck,

    /// Publish received
    PublishReceived,

    /// Publish release
    PublishRelease,

    /// Publish complete
    PublishComplete,

    /// Client subscribe request
    Subscribe,

    /// Subscribe acknowledgement
    SubscribeAck,

    /// Unsubscribe request
    Unsubscribe,

    /// Unsubscribe acknowledgement
    UnsubscribeAck,

    /// Client ping request
    PingRequest,

    /// Server ping response
    PingResponse,

    /// Client is disconnecting
    Disconnect,
}

impl PacketType {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        let type_bits = match packet_type {
            PacketType::Connect => 1,
            PacketType::ConnectAck => 2,
            PacketType::Publish { .. } => 3,
            PacketType::PublishAck => 4,
            PacketType::PublishReceived => 5,
            PacketType::PublishRelease => 6,
            PacketType::PublishComplete => 7,
            PacketType::Subscribe => 8,
            PacketType::SubscribeAck => 9,
            PacketType::Unsubscribe => 10,
            PacketType::UnsubscribeAck => 11,
            PacketType::PingRequest => 12,
            PacketType::PingResponse => 13,
            PacketType::Disconnect => 14,
        };

        let flags_bits = match packet_type {
            PacketType::Publish { dup, qos, retain } => {
                let dup = if dup { 0b0000_1000 } else { 0b0000_0000 };
                let qos = match qos {
                    QoS::AtMostOnce => 0b0000_0000,
                    QoS::AtLeastOnce => 0b0000_0010,
                    QoS::ExactOnce => 0b0000_0100,
                };
                let retain = if retain { 0b0000_0001 } else { 0b0000_0000 };
                dup | qos | retain
            }
            // Bits 3,2,1 and 0 of the fixed header in the PUBREL, SUBSCRIBE and
            // UNSUBSCRIBE Control Packets are reserved and MUST be set to 0,0,1
            // and 0 respectively [MQTT-3.6.1-1] [MQTT-3.8.1-1] [MQTT-3.10.1-1].
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        (type_bits << 4) | flags_bits
    }
}

impl TryFrom<u8> for PacketType {
    type Error = DecodeError;

    /// Parse packet type from the first byte of the fixed header.
    ///
    /// Where a flag bit is marked as "Reserved", it MUST be set to the value
    /// listed [MQTT-2.2.2-1]. If invalid flags are received, the receiver
    /// MUST close the Network Connection [MQTT-2.2.2-2].
    ///
    /// # Errors
    ///
    /// Returns `InvalidPacketType` for reserved types 0/15 and
    /// `InvalidPacketFlags` if flag bits are not as expected.
    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let type_bits = (v & 0b1111_0000) >> 4;
        let flag = v & 0b0000_1111;
        let packet_type = match type_bits {
            1 => Self::Connect,
            2 => Self::ConnectAck,
            3 => {
                let dup = (flag & 0b0000_1000) == 0b0000_1000;
                let retain = (flag & 0b0000_0001) == 0b0000_0001;
                let qos = match flag & 0b0000_0110 {
                    0b0000_0000 => QoS::AtMostOnce,
                    0b0000_0010 => QoS::AtLeastOnce,
                    0b0000_0100 => QoS::ExactOnce,
                    _ => return Err(DecodeError::InvalidPacketFlags),
                };
                return Ok(Self::Publish { dup, qos, retain });
            }
            4 => Self::PublishAck,
            5 => Self::PublishReceived,
            6 => Self::PublishRelease,
            7 => Self::PublishComplete,
            8 => Self::Subscribe,
            9 => Self::SubscribeAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubscribeAck,
            12 => Self::PingRequest,
            13 => Self::PingResponse,
            14 => Self::Disconnect,
            t => {
                // Types 0 and 15 are reserved and forbidden on the wire.
                log::error!("header: Got reserved packet type: {t:#b}");
                return Err(DecodeError::InvalidPacketType);
            }
        };

        let expected_flag = match packet_type {
            PacketType::PublishRelease | PacketType::Subscribe | PacketType::Unsubscribe => {
                0b0000_0010
            }
            _ => 0b0000_0000,
        };
        if flag != expected_flag {
            log::error!("header: Got invalid packet flag in {packet_type:?}: {flag:#b}");
            return Err(DecodeError::InvalidPacketFlags);
        }
        Ok(packet_type)
    }
}

/// Fixed header part of a mqtt control packet. It consists of at least two bytes.
///
/// ```txt
///  7 6 5 4 3 2 1 0
/// +-------+-------+
/// | Type  | Flags |
/// +-------+-------+
/// | Remaining Len |
/// +-------+-------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    packet_type: PacketType,

    /// `Remaining Length` uses variable length encoding method. The 7th bit
    /// in a byte is used to indicate that more bytes are available. The maximum
    /// number of bytes in the `Remaining Length` field is 4.
    remaining_length: VarInt,
}

impl FixedHeader {
    /// Create a new fixed header with `packet_type` and `remaining_length`.
    ///
    /// # Errors
    ///
    /// Returns error if `remaining_length` is invalid.
    pub const fn new(packet_type: PacketType, remaining_length: usize) -> Result<Self, VarIntError> {
        let remaining_length = match VarInt::from(remaining_length) {
            Ok(val) => val,
            Err(err) => return Err(err),
        };
        Ok(Self {
            packet_type,
            remaining_length,
        })
    }

    #[must_use]
    pub const fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    #[must_use]
    pub const fn remaining_length(&self) -> usize {
        self.remaining_length.value()
    }

    /// Get byte length in packet.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        PacketType::bytes() + self.remaining_length.bytes()
    }
}

impl DecodePacket for FixedHeader {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let flag = ba.read_byte()?;

        let packet_type = PacketType::try_from(flag)?;
        let remaining_length = VarInt::decode(ba)?;

        Ok(Self {
            packet_type,
            remaining_length,
        })
    }
}

impl EncodePacket for FixedHeader {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let packet_type: u8 = self.packet_type.into();
        v.push(packet_type);

        self.remaining_length.encode(v)?;
        Ok(PacketType::bytes() + self.remaining_length.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let mut buf = Vec::new();
        let fixed_header = FixedHeader::new(PacketType::PingResponse, 0);
        assert!(fixed_header.is_ok());
        let fixed_header = fixed_header.unwrap();
        let ret = fixed_header.encode(&mut buf);
        assert_eq!(ret, Ok(2));
        assert_eq!(&buf, &[0xd0, 0x00]);
    }

    #[test]
    fn test_decode() {
        let buf = vec![
            0x30, 0x13, 0x00, 0x05, 0x68, 0x65, 0x6c, 0x6c, 0x6f, 0x48, 0x65, 0x6c, 0x6c, 0x6f,
            0x2c, 0x20, 0x77, 0x6f, 0x72,
        ];
        let mut ba = ByteArray::new(&buf);
        let fixed_header = FixedHeader::decode(&mut ba);
        assert!(fixed_header.is_ok());
        let fixed_header = fixed_header.unwrap();
        assert_eq!(
            fixed_header.packet_type(),
            PacketType::Publish {
                dup: false,
                qos: QoS::AtMostOnce,
                retain: false
            }
        );
        assert_eq!(fixed_header.remaining_length(), 19);
    }

    #[test]
    fn test_decode_reserved_types() {
        // Types 0 and 15 are forbidden on the wire.
        for byte in [0x00u8, 0xf0] {
            let buf = [byte, 0x00];
            let mut ba = ByteArray::new(&buf);
            let ret = FixedHeader::decode(&mut ba);
            assert_eq!(ret, Err(DecodeError::InvalidPacketType));
        }
    }

    #[test]
    fn test_decode_reserved_flags() {
        // SUBSCRIBE with flags other than 0b0010 must be rejected.
        let buf = [0x80, 0x00];
        let mut ba = ByteArray::new(&buf);
        let ret = FixedHeader::decode(&mut ba);
        assert_eq!(ret, Err(DecodeError::InvalidPacketFlags));

        // PUBREL fixed flags must be 0b0010.
        let buf = [0x60, 0x02];
        let mut ba = ByteArray::new(&buf);
        let ret = FixedHeader::decode(&mut ba);
        assert_eq!(ret, Err(DecodeError::InvalidPacketFlags));

        let buf = [0x62, 0x02];
        let mut ba = ByteArray::new(&buf);
        let ret = FixedHeader::decode(&mut ba);
        assert!(ret.is_ok());
    }
}
