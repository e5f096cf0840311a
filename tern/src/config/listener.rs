// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Error, ErrorKind};

/// Transport protocol of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// MQTT over plain TCP.
    Mqtt,

    /// MQTT over TLS.
    Mqtts,

    /// MQTT over WebSocket.
    Ws,

    /// MQTT over secure WebSocket.
    Wss,
}

impl Protocol {
    #[must_use]
    pub const fn is_tls(self) -> bool {
        matches!(self, Self::Mqtts | Self::Wss)
    }
}

/// One network listener of the broker.
#[derive(Debug, Clone, Deserialize)]
pub struct Listener {
    /// Name used in log messages; defaults to the bind address.
    #[serde(default)]
    name: Option<String>,

    protocol: Protocol,

    /// Bind address, like `127.0.0.1:1883` or `[::1]:1883`.
    address: String,

    /// Maximum simultaneous connections; unset means unbounded.
    #[serde(default)]
    max_connections: Option<usize>,

    /// PEM certificate chain, required for tls protocols.
    #[serde(default)]
    cert_file: Option<PathBuf>,

    /// PEM private key, required for tls protocols.
    #[serde(default)]
    key_file: Option<PathBuf>,
}

impl Listener {
    #[must_use]
    pub fn new(protocol: Protocol, address: &str) -> Self {
        Self {
            name: None,
            protocol,
            address: address.to_string(),
            max_connections: None,
            cert_file: None,
            key_file: None,
        }
    }

    /// Default listener set: plain MQTT on localhost.
    #[must_use]
    pub fn default_listeners() -> Vec<Self> {
        vec![Self::new(Protocol::Mqtt, "127.0.0.1:1883")]
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.address)
    }

    #[must_use]
    pub const fn protocol(&self) -> Protocol {
        self.protocol
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub const fn max_connections(&self) -> Option<usize> {
        self.max_connections
    }

    #[must_use]
    pub fn cert_file(&self) -> Option<&PathBuf> {
        self.cert_file.as_ref()
    }

    #[must_use]
    pub fn key_file(&self) -> Option<&PathBuf> {
        self.key_file.as_ref()
    }

    /// Validate listener options.
    ///
    /// # Errors
    ///
    /// Returns error if the address does not parse or TLS material is
    /// missing for a tls protocol.
    pub fn validate(&self) -> Result<(), Error> {
        if self.address.parse::<SocketAddr>().is_err() {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!("Invalid listener address: {}", self.address),
            ));
        }
        if self.protocol.is_tls() && (self.cert_file.is_none() || self.key_file.is_none()) {
            return Err(Error::from_string(
                ErrorKind::ConfigError,
                format!(
                    "Listener {} requires cert_file and key_file",
                    self.name()
                ),
            ));
        }
        Ok(())
    }
}
