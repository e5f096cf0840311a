// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::convert::TryFrom;
use std::fmt;

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::{ByteArray, DecodeError, EncodeError, VarIntError};

/// Protocol name of MQTT is fixed.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Decode byte stream into a packet struct.
pub trait DecodePacket: Sized {
    /// Decode packet from byte array.
    ///
    /// # Errors
    ///
    /// Returns error if byte stream is invalid.
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError>;
}

/// Encode a packet struct into byte stream.
pub trait EncodePacket {
    /// Encode packet into byte buffer, returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns error if packet struct contains invalid data.
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError>;
}

/// Common packet interface.
pub trait Packet: Send + fmt::Debug {
    fn packet_type(&self) -> crate::PacketType;

    /// Get byte length in packet.
    ///
    /// # Errors
    ///
    /// Returns error if packet size is invalid.
    fn bytes(&self) -> Result<usize, VarIntError>;
}

/// Packet identifier used in `QoS` 1/2 message flows.
///
/// SUBSCRIBE, UNSUBSCRIBE, and PUBLISH (in cases where `QoS` > 0) Control Packets
/// MUST contain a non-zero 16-bit Packet Identifier [MQTT-2.3.1-1].
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId(u16);

impl PacketId {
    #[must_use]
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        2
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DecodePacket for PacketId {
    fn decode(ba: &mut ByteArray) -> Result<Self, DecodeError> {
        let value = ba.read_u16()?;
        Ok(Self(value))
    }
}

impl EncodePacket for PacketId {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.write_u16::<BigEndian>(self.0)?;
        Ok(Self::bytes())
    }
}

/// Protocol version in CONNECT packet.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum ProtocolLevel {
    V31 = 3,

    #[default]
    V311 = 4,

    V5 = 5,
}

impl ProtocolLevel {
    /// Get byte length used in packet.
    #[must_use]
    pub const fn bytes() -> usize {
        1
    }
}

impl TryFrom<u8> for ProtocolLevel {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            3 => Ok(Self::V31),
            4 => Ok(Self::V311),
            5 => Ok(Self::V5),
            _ => Err(DecodeError::InvalidProtocolLevel),
        }
    }
}

impl EncodePacket for ProtocolLevel {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<usize, EncodeError> {
        buf.push(*self as u8);
        Ok(Self::bytes())
    }
}

/// Quality of service level of a message.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum QoS {
    /// At most once delivery.
    #[default]
    AtMostOnce = 0,

    /// At least once delivery.
    AtLeastOnce = 1,

    /// Exactly once delivery.
    ExactOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(Self::AtMostOnce),
            1 => Ok(Self::AtLeastOnce),
            2 => Ok(Self::ExactOnce),
            _ => Err(DecodeError::InvalidQoS),
        }
    }
}

/// `QoS` is written as its protocol number in config files.
impl Serialize for QoS {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for QoS {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Self::try_from(value).map_err(|_err| serde::de::Error::custom("QoS must be 0, 1 or 2"))
    }
}
