// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Byte-oriented read/write halves over TCP, TLS and WebSocket transports.
//!
//! The reader side frames complete MQTT packets: one fixed-header byte,
//! a variable-byte remaining length, then the packet body. WebSocket
//! transports concatenate binary frames into an internal buffer until
//! enough bytes are available; a close frame is surfaced as EOF.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use codec::{AnyPacket, ByteArray, DecodePacket, EncodePacket};
use futures::stream::Stream;
use futures::Sink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{Error, ErrorKind};

type WsFrames = Box<dyn Stream<Item = Result<Message, tungstenite::Error>> + Send + Unpin>;
type WsSink = Box<dyn Sink<Message, Error = tungstenite::Error> + Send + Unpin>;

/// Read half of a connection.
pub enum StreamReader {
    Raw {
        reader: Box<dyn AsyncRead + Send + Unpin>,
    },
    Ws {
        frames: WsFrames,
        buffer: BytesMut,
    },
}

/// Write half of a connection.
pub enum StreamWriter {
    Raw {
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    },
    Ws {
        sink: WsSink,
    },
}

/// Split a byte stream (TCP or TLS) into framed halves.
pub fn split_io<S>(stream: S) -> (StreamReader, StreamWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        StreamReader::Raw {
            reader: Box::new(reader),
        },
        StreamWriter::Raw {
            writer: Box::new(writer),
        },
    )
}

/// Split a websocket stream into framed halves carrying MQTT bytes in
/// binary frames.
pub fn split_ws<S>(stream: WebSocketStream<S>) -> (StreamReader, StreamWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, frames) = stream.split();
    (
        StreamReader::Ws {
            frames: Box::new(frames),
            buffer: BytesMut::new(),
        },
        StreamWriter::Ws {
            sink: Box::new(sink),
        },
    )
}

impl StreamReader {
    /// Read exactly `buf.len()` bytes.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` on EOF or a websocket close frame.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        match self {
            Self::Raw { reader } => {
                reader.read_exact(buf).await?;
                Ok(())
            }
            Self::Ws { frames, buffer } => {
                while buffer.len() < buf.len() {
                    match frames.next().await {
                        Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(Error::new(ErrorKind::ConnectionLost, "Websocket closed"));
                        }
                        // Control frames carry no MQTT bytes.
                        Some(Ok(_)) => {}
                        Some(Err(err)) => return Err(err.into()),
                    }
                }
                buffer.copy_to_slice(buf);
                Ok(())
            }
        }
    }

    /// Read and decode one complete MQTT packet.
    ///
    /// The read consumes the fixed header byte, 1 to 4 remaining-length
    /// bytes and the packet body. A fifth continuation byte in the
    /// remaining length is malformed.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` on EOF, `DecodeError` on malformed bytes.
    pub async fn read_packet(&mut self) -> Result<AnyPacket, Error> {
        let mut byte = [0_u8; 1];
        self.read_exact(&mut byte).await?;

        let mut packet_bytes = Vec::with_capacity(64);
        packet_bytes.push(byte[0]);

        let mut remaining_length: usize = 0;
        let mut multiplier: usize = 1;
        let mut vbi_bytes = 0;
        loop {
            if vbi_bytes == 4 {
                return Err(Error::new(
                    ErrorKind::DecodeError,
                    "Malformed remaining length: fifth continuation byte",
                ));
            }
            self.read_exact(&mut byte).await?;
            packet_bytes.push(byte[0]);
            vbi_bytes += 1;
            remaining_length += ((byte[0] & 0x7f) as usize) * multiplier;
            if byte[0] & 0x80 == 0 {
                break;
            }
            multiplier *= 128;
        }

        let body_offset = packet_bytes.len();
        packet_bytes.resize(body_offset + remaining_length, 0);
        self.read_exact(&mut packet_bytes[body_offset..]).await?;

        let mut ba = ByteArray::new(&packet_bytes);
        let packet = AnyPacket::decode(&mut ba)?;
        Ok(packet)
    }
}

impl StreamWriter {
    /// Write and flush a byte buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails.
    pub async fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        match self {
            Self::Raw { writer } => {
                writer.write_all(buf).await?;
                writer.flush().await?;
                Ok(())
            }
            Self::Ws { sink } => {
                sink.send(Message::binary(buf.to_vec())).await?;
                Ok(())
            }
        }
    }

    /// Encode and write one packet.
    ///
    /// # Errors
    ///
    /// Returns error if encoding or the transport fails.
    pub async fn write_packet<P: EncodePacket>(&mut self, packet: &P) -> Result<(), Error> {
        let mut buf = Vec::new();
        packet.encode(&mut buf)?;
        self.write(&buf).await
    }

    /// Close the write half. Best effort, errors are ignored by callers
    /// on the teardown path.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails.
    pub async fn close(&mut self) -> Result<(), Error> {
        match self {
            Self::Raw { writer } => {
                writer.shutdown().await?;
                Ok(())
            }
            Self::Ws { sink } => {
                sink.close().await?;
                Ok(())
            }
        }
    }
}

/// Build a TLS acceptor from PEM cert/key files.
///
/// # Errors
///
/// Returns error if the files cannot be read or contain no usable
/// certificate/key.
pub fn load_tls_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, Error> {
    let certs: Vec<Certificate> = {
        let mut reader = BufReader::new(File::open(cert_file).map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("Failed to open cert file {}: {err}", cert_file.display()),
            )
        })?);
        rustls_pemfile::certs(&mut reader)
            .map_err(|err| {
                Error::from_string(ErrorKind::CertError, format!("Invalid cert file: {err}"))
            })?
            .into_iter()
            .map(Certificate)
            .collect()
    };
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::CertError, "No certificate found"));
    }

    let key: PrivateKey = {
        let mut reader = BufReader::new(File::open(key_file).map_err(|err| {
            Error::from_string(
                ErrorKind::CertError,
                format!("Failed to open key file {}: {err}", key_file.display()),
            )
        })?);
        let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader).map_err(|err| {
            Error::from_string(ErrorKind::CertError, format!("Invalid key file: {err}"))
        })?;
        if keys.is_empty() {
            return Err(Error::new(ErrorKind::CertError, "No private key found"));
        }
        PrivateKey(keys.remove(0))
    };

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| {
            Error::from_string(ErrorKind::CertError, format!("Invalid cert chain: {err}"))
        })?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use codec::{PacketId, PublishAckPacket};

    use super::*;

    #[tokio::test]
    async fn test_read_packet_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = split_io(server);
        let (_client_reader, mut client_writer) = split_io(client);

        let packet = PublishAckPacket::new(PacketId::new(3));
        client_writer.write_packet(&packet).await.unwrap();

        let decoded = reader.read_packet().await.unwrap();
        assert_eq!(decoded, AnyPacket::PublishAck(packet));
    }

    #[tokio::test]
    async fn test_read_packet_eof() {
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = split_io(server);
        drop(client);

        let ret = reader.read_packet().await;
        assert!(ret.is_err());
        assert_eq!(ret.unwrap_err().kind(), ErrorKind::ConnectionLost);
    }

    #[tokio::test]
    async fn test_read_packet_split_writes() {
        // A packet arriving in two chunks is reassembled.
        let (client, server) = tokio::io::duplex(64);
        let (mut reader, _writer) = split_io(server);
        let (_client_reader, mut client_writer) = split_io(client);

        let handle = tokio::spawn(async move {
            client_writer.write(&[0x40, 0x02]).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client_writer.write(&[0x00, 0x07]).await.unwrap();
        });

        let decoded = reader.read_packet().await.unwrap();
        assert_eq!(
            decoded,
            AnyPacket::PublishAck(PublishAckPacket::new(PacketId::new(7)))
        );
        handle.await.unwrap();
    }
}
