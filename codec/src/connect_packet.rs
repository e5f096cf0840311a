// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use crate::base::PROTOCOL_NAME;
use crate::utils::{random_client_id, validate_client_id};
use crate::{
    BinaryData, ByteArray, ConnectFlags, DecodeError, DecodePacket, EncodeError, EncodePacket,
    FixedHeader, Packet, PacketType, ProtocolLevel, PubTopic, QoS, StringData, U16Data,
    VarIntError,
};

/// `ConnectPacket` is the first packet sent from the Client to the Server.
///
/// Basic struct of `ConnectPacket` is as below:
/// ```txt
///  7                          0
/// +----------------------------+
/// | Fixed header               |
/// |                            |
/// +----------------------------+
/// | Protocol name length       |
/// |                            |
/// +----------------------------+
/// | Protocol name string ...   |
/// +----------------------------+
/// | Protocol level             |
/// +----------------------------+
/// | Connect flags              |
/// +----------------------------+
/// | Keep alive                 |
/// |                            |
/// +----------------------------+
/// | Client id length           |
/// |                            |
/// +----------------------------+
/// | Client id string ...       |
/// +----------------------------+
/// | Will topic length          |
/// |                            |
/// +----------------------------+
/// | Will topic string ...      |
/// +----------------------------+
/// | Will message length        |
/// |                            |
/// +----------------------------+
/// | Will message bytes ...     |
/// +----------------------------+
/// | Username length            |
/// |                            |
/// +----------------------------+
/// | Username string ...        |
/// +----------------------------+
/// | Password length            |
/// |                            |
/// +----------------------------+
/// | Password bytes ...         |
/// +----------------------------+
/// ```
///
/// Will topic/message, username and password fields are only present when the
/// corresponding connect flag is set.
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectPacket {
    /// Protocol name can only be `MQTT` in specification.
    protocol_name: StringData,

    protocol_level: ProtocolLevel,

    connect_flags: ConnectFlags,

    /// Time interval between two packets in seconds.
    ///
    /// Client must send PingRequest Packet before exceeding this interval.
    /// If this value is not zero and time exceeds after last packet, the Server
    /// will disconnect the network. If this value is zero, the Server is not
    /// required to disconnect the network.
    keep_alive: U16Data,

    /// `client_id` identifies the session on the server side.
    ///
    /// A zero-byte client id in the payload is replaced with a generated one
    /// at decode time [MQTT-3.1.3-6] and `client_id_is_random` is set, so the
    /// server can still reject `clean_session=false` connections with return
    /// code 0x02 [MQTT-3.1.3-8].
    client_id: StringData,

    /// True if the client id was generated rather than read from the payload.
    /// Not part of the wire format.
    client_id_is_random: bool,

    /// Topic of the Will Message, present iff the `will` flag is set.
    will_topic: Option<PubTopic>,

    /// Payload of the Will Message, present iff the `will` flag is set.
    will_message: BinaryData,

    /// Present iff the `username` flag is set.
    username: StringData,

    /// Present iff the `password` flag is set.
    password: BinaryData,
}

impl ConnectPacket {
    /// Create a new connect packet with `client_id`.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn new(client_id: &str) -> Result<Self, EncodeError> {
        let protocol_name = StringData::from(PROTOCOL_NAME)?;
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        let client_id = StringData::from(client_id)?;
        Ok(Self {
            protocol_name,
            keep_alive: U16Data::new(60),
            client_id,
            ..Self::default()
        })
    }

    /// Get current protocol level.
    #[must_use]
    pub const fn protocol_level(&self) -> ProtocolLevel {
        self.protocol_level
    }

    /// Update connect flags.
    pub fn set_connect_flags(&mut self, flags: ConnectFlags) -> &mut Self {
        self.connect_flags = flags;
        self
    }

    /// Get current connect flags.
    #[must_use]
    pub const fn connect_flags(&self) -> &ConnectFlags {
        &self.connect_flags
    }

    #[must_use]
    pub const fn clean_session(&self) -> bool {
        self.connect_flags.clean_session()
    }

    /// Update keep alive value in seconds.
    pub fn set_keep_alive(&mut self, keep_alive: u16) -> &mut Self {
        self.keep_alive = U16Data::new(keep_alive);
        self
    }

    /// Get current keep alive value in seconds.
    #[must_use]
    pub const fn keep_alive(&self) -> u16 {
        self.keep_alive.value()
    }

    /// Update client id.
    ///
    /// # Errors
    ///
    /// Returns error if `client_id` is invalid.
    pub fn set_client_id(&mut self, client_id: &str) -> Result<&mut Self, EncodeError> {
        validate_client_id(client_id).map_err(|_err| EncodeError::InvalidClientId)?;
        self.client_id = StringData::from(client_id)?;
        self.client_id_is_random = false;
        Ok(self)
    }

    /// Get current client id.
    #[must_use]
    pub fn client_id(&self) -> &str {
        self.client_id.as_ref()
    }

    /// Returns true if the client id was generated at decode time because
    /// the payload carried a zero-byte client id.
    #[must_use]
    pub const fn client_id_is_random(&self) -> bool {
        self.client_id_is_random
    }

    /// Update username value.
    ///
    /// # Errors
    ///
    /// Returns error if `username` is too long.
    pub fn set_username(&mut self, username: &str) -> Result<&mut Self, EncodeError> {
        self.username = StringData::from(username)?;
        self.connect_flags.set_username(!username.is_empty());
        Ok(self)
    }

    /// Get current username value.
    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_ref()
    }

    /// Update password value.
    ///
    /// # Errors
    ///
    /// Returns error if `password` is too long.
    pub fn set_password(&mut self, password: &[u8]) -> Result<&mut Self, EncodeError> {
        self.password = BinaryData::from_slice(password)?;
        self.connect_flags.set_password(!password.is_empty());
        Ok(self)
    }

    /// Get current password value.
    #[must_use]
    pub fn password(&self) -> &[u8] {
        self.password.as_ref()
    }

    /// Set will topic, message, `QoS` and retain flag.
    ///
    /// # Errors
    ///
    /// Returns error if `topic` is invalid or `message` too long.
    pub fn set_will(
        &mut self,
        topic: &str,
        message: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<&mut Self, EncodeError> {
        self.will_topic = Some(PubTopic::new(topic)?);
        self.will_message = BinaryData::from_slice(message)?;
        self.connect_flags
            .set_will(true)
            .set_will_qos(qos)
            .set_will_retain(retain);
        Ok(self)
    }

    /// Get current will-topic value.
    #[must_use]
    pub fn will_topic(&self) -> Option<&str> {
        self.will_topic.as_ref().map(AsRef::as_ref)
    }

    /// Get current will-message value.
    #[must_use]
    pub fn will_message(&self) -> &[u8] {
        self.will_message.as_ref()
    }

    fn get_fixed_header(&self) -> Result<FixedHeader, VarIntError> {
        let mut remaining_length = self.protocol_name.bytes()
            + ProtocolLevel::bytes()
            + ConnectFlags::bytes()
            + U16Data::bytes()
            + self.client_id.bytes();

        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                remaining_length += will_topic.bytes();
            }
            remaining_length += self.will_message.bytes();
        }
        if self.connect_flags.has_username() {
            remaining_length += self.username.bytes();
        }
        if self.connect_flags.has_password() {
            remaining_length += self.password.bytes();
        }
        FixedHeader::new(PacketType::Connect, remaining_length)
    }
}

impl EncodePacket for ConnectPacket {
    fn encode(&self, v: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = v.len();

        let fixed_header = self.get_fixed_header()?;
        fixed_header.encode(v)?;

        // Write variable header
        self.protocol_name.encode(v)?;
        self.protocol_level.encode(v)?;
        self.connect_flags.encode(v)?;
        self.keep_alive.encode(v)?;

        // Write payload
        self.client_id.encode(v)?;
        if self.connect_flags.will() {
            if let Some(will_topic) = &self.will_topic {
                will_topic.encode(v)?;
            }
            self.will_message.encode(v)?;
        }
        if self.connect_flags.has_username() {
            self.username.encode(v)?;
        }
        if self.connect_flags.has_password() {
            self.password.encode(v)?;
        }

        Ok(v.len() - old_len)
    }
}

impl DecodePacket for ConnectPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::Connect {
            return Err(DecodeError::InvalidPacketType);
        }

        let protocol_name = StringData::decode(ba)?;
        if protocol_name.as_ref() != PROTOCOL_NAME {
            // [MQTT-3.1.2-1] The Server MAY disconnect the Client without
            // sending a CONNACK if the protocol name is incorrect.
            return Err(DecodeError::InvalidProtocolName);
        }

        // Unsupported protocol levels are kept as data so that the server can
        // reply with return code 0x01 instead of dropping the connection.
        let protocol_level = ProtocolLevel::try_from(ba.read_byte()?)?;

        let connect_flags = ConnectFlags::decode(ba)?;

        // If the Will Flag is set to 0 the Will QoS and Will Retain fields
        // MUST be set to zero [MQTT-3.1.2-11] [MQTT-3.1.2-13].
        if !connect_flags.will()
            && (connect_flags.will_qos() != QoS::AtMostOnce || connect_flags.will_retain())
        {
            return Err(DecodeError::InvalidConnectFlags);
        }

        let keep_alive = U16Data::decode(ba)?;

        // A zero-byte client id is replaced with a generated one; the Server
        // then processes the CONNECT packet as if the Client had provided that
        // unique client id [MQTT-3.1.3-6].
        let client_id = StringData::decode(ba).map_err(|_err| DecodeError::InvalidClientId)?;
        let client_id_is_random = client_id.is_empty();
        let client_id = if client_id_is_random {
            StringData::from(&random_client_id()).map_err(|_err| DecodeError::InvalidClientId)?
        } else {
            client_id
        };

        // If the Will Flag is set to 1, the Will Topic and Will Message fields
        // MUST be present in the payload [MQTT-3.1.2-9].
        let will_topic = if connect_flags.will() {
            Some(PubTopic::decode(ba)?)
        } else {
            None
        };
        let will_message = if connect_flags.will() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        let username = if connect_flags.has_username() {
            StringData::decode(ba)?
        } else {
            StringData::new()
        };

        let password = if connect_flags.has_password() {
            BinaryData::decode(ba)?
        } else {
            BinaryData::new()
        };

        Ok(Self {
            protocol_name,
            protocol_level,
            connect_flags,
            keep_alive,
            client_id,
            client_id_is_random,
            will_topic,
            will_message,
            username,
            password,
        })
    }
}

impl Packet for ConnectPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::Connect
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        let fixed_header = self.get_fixed_header()?;
        Ok(fixed_header.bytes() + fixed_header.remaining_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, 77, 81, 84, 84, 4, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67, 119,
        ];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectPacket::decode(&mut ba);
        assert!(packet.is_ok());
        let packet = packet.unwrap();
        assert_eq!(packet.client_id(), "wvPTXcCw");
        assert!(packet.clean_session());
        assert!(!packet.client_id_is_random());
        assert_eq!(packet.keep_alive(), 60);
    }

    #[test]
    fn test_decode_empty_client_id() {
        // Zero-byte client id gets a generated replacement.
        let buf: Vec<u8> = vec![16, 12, 0, 4, 77, 81, 84, 84, 4, 2, 0, 60, 0, 0];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectPacket::decode(&mut ba).unwrap();
        assert!(packet.client_id_is_random());
        assert!(!packet.client_id().is_empty());
    }

    #[test]
    fn test_decode_invalid_protocol_name() {
        let buf: Vec<u8> = vec![
            16, 20, 0, 4, b'M', b'Q', b'T', b'X', 4, 2, 0, 60, 0, 8, 119, 118, 80, 84, 88, 99, 67,
            119,
        ];
        let mut ba = ByteArray::new(&buf);
        assert_eq!(
            ConnectPacket::decode(&mut ba),
            Err(DecodeError::InvalidProtocolName)
        );
    }

    #[test]
    fn test_round_trip_with_will() {
        let mut packet = ConnectPacket::new("client-1").unwrap();
        packet.set_keep_alive(30);
        packet
            .set_will("last/will", b"gone", QoS::AtLeastOnce, true)
            .unwrap();
        packet.set_username("user").unwrap();
        packet.set_password(b"pass").unwrap();

        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        let mut ba = ByteArray::new(&buf);
        let decoded = ConnectPacket::decode(&mut ba).unwrap();
        assert_eq!(decoded, packet);
        assert_eq!(decoded.will_topic(), Some("last/will"));
        assert_eq!(decoded.will_message(), b"gone");
        assert_eq!(decoded.username(), "user");
        assert_eq!(decoded.password(), b"pass");
    }
}
