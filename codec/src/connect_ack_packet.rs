// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;

use serde::{Deserialize, Serialize};

use crate::{
    ByteArray, DecodeError, DecodePacket, EncodeError, EncodePacket, FixedHeader, Packet,
    PacketType, VarIntError,
};

/// Return code in the CONNACK variable header.
#[repr(u8)]
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, Deserialize, Serialize,
)]
pub enum ConnectReturnCode {
    /// Connection accepted.
    #[default]
    Accepted = 0,

    /// The Server does not support the level of the MQTT protocol requested
    /// by the Client.
    UnacceptableProtocolVersion = 1,

    /// The Client identifier is correct UTF-8 but not allowed by the Server.
    IdentifierRejected = 2,

    /// The Network Connection has been made but the MQTT service is unavailable.
    ServerUnavailable = 3,

    /// The data in the user name or password is malformed.
    BadUsernamePassword = 4,

    /// The Client is not authorized to connect.
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::Accepted),
            1 => Ok(Self::UnacceptableProtocolVersion),
            2 => Ok(Self::IdentifierRejected),
            3 => Ok(Self::ServerUnavailable),
            4 => Ok(Self::BadUsernamePassword),
            5 => Ok(Self::NotAuthorized),
            _ => Err(DecodeError::InvalidReturnCode),
        }
    }
}

/// `ConnectAckPacket` is the packet sent by the Server in response to a
/// `ConnectPacket` received from a Client.
///
/// The first packet sent from the Server to the Client MUST be a
/// `ConnectAckPacket` [MQTT-3.2.0-1].
///
/// Basic struct of packet:
/// ```txt
///  7                     0
/// +-----------------------+
/// | Fixed header          |
/// |                       |
/// +-----------------------+
/// | Ack flags             |
/// +-----------------------+
/// | Return code           |
/// +-----------------------+
/// ```
#[allow(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectAckPacket {
    /// Session present flag.
    ///
    /// If the Server accepts a connection with `clean_session` set to true,
    /// it MUST set this flag to false [MQTT-3.2.2-1]. If the Server has stored
    /// session state, it MUST set it to true [MQTT-3.2.2-2]. If a connection is
    /// refused, it MUST be false [MQTT-3.2.2-4].
    session_present: bool,

    return_code: ConnectReturnCode,
}

impl ConnectAckPacket {
    #[must_use]
    pub const fn new(session_present: bool, return_code: ConnectReturnCode) -> Self {
        Self {
            session_present,
            return_code,
        }
    }

    #[must_use]
    pub const fn session_present(&self) -> bool {
        self.session_present
    }

    #[must_use]
    pub const fn return_code(&self) -> ConnectReturnCode {
        self.return_code
    }
}

impl DecodePacket for ConnectAckPacket {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let fixed_header = FixedHeader::decode(ba)?;
        if fixed_header.packet_type() != PacketType::ConnectAck {
            return Err(DecodeError::InvalidPacketType);
        }
        if fixed_header.remaining_length() != 2 {
            return Err(DecodeError::InvalidRemainingLength);
        }

        let ack_flags = ba.read_byte()?;
        // Bits 7-1 are reserved and MUST be set to 0 [MQTT-3.2.2-1].
        if ack_flags & 0b1111_1110 != 0 {
            return Err(DecodeError::InvalidPacketFlags);
        }
        let session_present = ack_flags & 0b0000_0001 == 0b0000_0001;
        let return_code = ConnectReturnCode::try_from(ba.read_byte()?)?;

        Ok(Self {
            session_present,
            return_code,
        })
    }
}

impl EncodePacket for ConnectAckPacket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        let old_len = buf.len();

        let fixed_header = FixedHeader::new(PacketType::ConnectAck, 2)?;
        fixed_header.encode(buf)?;

        let ack_flags = if self.session_present { 0b0000_0001 } else { 0 };
        buf.push(ack_flags);
        buf.push(self.return_code as u8);

        Ok(buf.len() - old_len)
    }
}

impl Packet for ConnectAckPacket {
    fn packet_type(&self) -> PacketType {
        PacketType::ConnectAck
    }

    fn bytes(&self) -> Result<usize, VarIntError> {
        Ok(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode() {
        let packet = ConnectAckPacket::new(true, ConnectReturnCode::Accepted);
        let mut buf = Vec::new();
        packet.encode(&mut buf).unwrap();
        assert_eq!(&buf, &[0x20, 0x02, 0x01, 0x00]);
    }

    #[test]
    fn test_decode() {
        let buf = [0x20, 0x02, 0x00, 0x05];
        let mut ba = ByteArray::new(&buf);
        let packet = ConnectAckPacket::decode(&mut ba).unwrap();
        assert!(!packet.session_present());
        assert_eq!(packet.return_code(), ConnectReturnCode::NotAuthorized);
    }
}
