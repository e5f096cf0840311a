// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::fmt::{self, Display};
use std::io;

use codec::ConnectReturnCode;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

/// Represent the types of errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Error occurred while performing I/O.
    IoError,

    /// Packet encode error.
    EncodeError,

    /// Framing or constraint violation in received bytes. Fatal to the
    /// connection.
    DecodeError,

    /// Semantically illegal packet in current state. Fatal to the connection.
    ProtocolError,

    /// CONNECT was not accepted; carries the CONNACK return code.
    ConnectRejected(ConnectReturnCode),

    /// Authentication or topic policy denied the operation.
    AuthFailed,

    /// Peer closed the connection, or an operation raced with the close.
    ConnectionLost,

    /// Keep-alive or acknowledgement deadline expired.
    Timeout,

    /// All 65535 packet ids are inflight.
    NoFreePacketId,

    /// Socket/websocket stream error.
    SocketError,

    /// TLS certificate files error.
    CertError,

    /// Invalid config option.
    ConfigError,

    /// Observer or policy callback failed; logged and isolated.
    PluginError,

    /// Session with this client id not found.
    SessionNotFound,

    /// mpsc/oneshot channel error.
    ChannelError,

    /// Invariant violation; the affected connection is closed.
    InternalError,
}

/// Error type used through broker and client.
#[derive(Clone, Debug)]
pub struct Error {
    /// Type of current error.
    kind: ErrorKind,

    /// Detail message about this error.
    message: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, message: &str) -> Self {
        Self {
            kind,
            message: message.to_owned(),
        }
    }

    #[must_use]
    pub const fn from_string(kind: ErrorKind, message: String) -> Self {
        Self { kind, message }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn connect_rejected(code: ConnectReturnCode) -> Self {
        Self::from_string(
            ErrorKind::ConnectRejected(code),
            format!("Connection rejected with code {code:?}"),
        )
    }

    #[must_use]
    pub fn session_not_found(client_id: &str) -> Self {
        Self::from_string(
            ErrorKind::SessionNotFound,
            format!("Session with client id {client_id} not found"),
        )
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => {
                Self::from_string(ErrorKind::ConnectionLost, format!("Connection lost: {err}"))
            }
            _ => Self::from_string(ErrorKind::IoError, format!("IoError: {err}")),
        }
    }
}

impl From<tungstenite::Error> for Error {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                Self::new(ErrorKind::ConnectionLost, "Websocket closed")
            }
            err => Self::from_string(ErrorKind::SocketError, format!("Websocket error: {err}")),
        }
    }
}

impl From<codec::EncodeError> for Error {
    fn from(err: codec::EncodeError) -> Self {
        Self::from_string(ErrorKind::EncodeError, format!("{err:?}"))
    }
}

impl From<codec::DecodeError> for Error {
    fn from(err: codec::DecodeError) -> Self {
        Self::from_string(ErrorKind::DecodeError, format!("{err:?}"))
    }
}

impl From<codec::TopicError> for Error {
    fn from(err: codec::TopicError) -> Self {
        Self::from_string(ErrorKind::ProtocolError, format!("{err:?}"))
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::from_string(ErrorKind::ConfigError, format!("Invalid config: {err}"))
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for Error {
    fn from(_err: tokio::sync::oneshot::error::RecvError) -> Self {
        // The sending half was dropped by the connection teardown path.
        Self::new(ErrorKind::ConnectionLost, "Ack waiter cancelled")
    }
}

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_err: mpsc::error::SendError<T>) -> Self {
        Self::new(ErrorKind::ChannelError, "Channel receiver closed")
    }
}
