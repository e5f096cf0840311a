// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use serde::Deserialize;

use crate::error::Error;

mod client;
mod general;
mod listener;

pub use client::{ClientConfig, WillConfig};
pub use general::General;
pub use listener::{Listener, Protocol};

/// Broker main config.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "General::default")]
    general: General,

    #[serde(default = "Listener::default_listeners")]
    listeners: Vec<Listener>,
}

impl Config {
    /// Parse config from a toml string.
    ///
    /// # Errors
    ///
    /// Returns error if the toml document is invalid.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub const fn general(&self) -> &General {
        &self.general
    }

    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn set_listeners(&mut self, listeners: Vec<Listener>) {
        self.listeners = listeners;
    }

    /// Validate config options.
    ///
    /// # Errors
    ///
    /// Returns error if some option is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        self.general.validate()?;
        for listener in &self.listeners {
            listener.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.listeners().len(), 1);
        assert_eq!(config.general().max_qos(), codec::QoS::ExactOnce);
    }

    #[test]
    fn test_parse_listeners() {
        let content = r#"
[general]
max_qos = 1
timeout_disconnect_delay = 2

[[listeners]]
protocol = "mqtt"
address = "127.0.0.1:1883"

[[listeners]]
protocol = "ws"
address = "127.0.0.1:8083"
max_connections = 100
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.general().max_qos(), codec::QoS::AtLeastOnce);
        assert_eq!(config.general().timeout_disconnect_delay(), 2);
        assert_eq!(config.listeners().len(), 2);
        assert_eq!(config.listeners()[1].protocol(), Protocol::Ws);
        assert_eq!(config.listeners()[1].max_connections(), Some(100));
    }

    #[test]
    fn test_invalid_listener_address() {
        let content = r#"
[[listeners]]
protocol = "mqtt"
address = "not-an-address"
"#;
        assert!(Config::from_toml(content).is_err());
    }
}
