// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::Deserialize;

use crate::error::{Error, ErrorKind};

/// Will message announced in CONNECT.
#[derive(Debug, Clone, Deserialize)]
pub struct WillConfig {
    pub topic: String,
    pub message: String,

    #[serde(default)]
    pub qos: QoS,

    #[serde(default)]
    pub retain: bool,
}

/// Client options.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Keep-alive announced to the broker, in seconds.
    #[serde(default = "ClientConfig::default_keep_alive")]
    keep_alive: u64,

    /// Seconds subtracted from `keep_alive` so the PINGREQ leaves before
    /// the broker's deadline.
    #[serde(default = "ClientConfig::default_ping_delay")]
    ping_delay: u64,

    /// `QoS` used by `publish` when none is given.
    #[serde(default)]
    default_qos: QoS,

    /// Retain flag used by `publish` when none is given.
    #[serde(default)]
    default_retain: bool,

    /// Reconnect automatically when the connection drops.
    #[serde(default = "ClientConfig::default_auto_reconnect")]
    auto_reconnect: bool,

    /// Upper bound of the exponential reconnect backoff, in seconds.
    #[serde(default = "ClientConfig::default_reconnect_max_interval")]
    reconnect_max_interval: u64,

    /// Reconnect attempts before giving up; negative means unlimited.
    #[serde(default = "ClientConfig::default_reconnect_retries")]
    reconnect_retries: i32,

    /// Will message announced in CONNECT.
    #[serde(default)]
    will: Option<WillConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive: Self::default_keep_alive(),
            ping_delay: Self::default_ping_delay(),
            default_qos: QoS::AtMostOnce,
            default_retain: false,
            auto_reconnect: Self::default_auto_reconnect(),
            reconnect_max_interval: Self::default_reconnect_max_interval(),
            reconnect_retries: Self::default_reconnect_retries(),
            will: None,
        }
    }
}

impl ClientConfig {
    const fn default_keep_alive() -> u64 {
        10
    }

    const fn default_ping_delay() -> u64 {
        1
    }

    const fn default_auto_reconnect() -> bool {
        false
    }

    const fn default_reconnect_max_interval() -> u64 {
        10
    }

    const fn default_reconnect_retries() -> i32 {
        2
    }

    #[must_use]
    pub const fn keep_alive(&self) -> u64 {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: u64) -> &mut Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub const fn ping_delay(&self) -> u64 {
        self.ping_delay
    }

    /// Keep-alive carried in CONNECT, with the ping head start applied.
    #[must_use]
    pub const fn effective_keep_alive(&self) -> u64 {
        self.keep_alive.saturating_sub(self.ping_delay)
    }

    #[must_use]
    pub const fn default_qos(&self) -> QoS {
        self.default_qos
    }

    pub fn set_default_qos(&mut self, qos: QoS) -> &mut Self {
        self.default_qos = qos;
        self
    }

    #[must_use]
    pub const fn default_retain(&self) -> bool {
        self.default_retain
    }

    #[must_use]
    pub const fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn set_auto_reconnect(&mut self, auto_reconnect: bool) -> &mut Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    #[must_use]
    pub const fn reconnect_max_interval(&self) -> u64 {
        self.reconnect_max_interval
    }

    #[must_use]
    pub const fn reconnect_retries(&self) -> i32 {
        self.reconnect_retries
    }

    pub fn set_reconnect_retries(&mut self, retries: i32) -> &mut Self {
        self.reconnect_retries = retries;
        self
    }

    #[must_use]
    pub const fn will(&self) -> Option<&WillConfig> {
        self.will.as_ref()
    }

    pub fn set_will(&mut self, will: Option<WillConfig>) -> &mut Self {
        self.will = will;
        self
    }

    /// Validate client options.
    ///
    /// # Errors
    ///
    /// Returns error if some option is invalid.
    pub fn validate(&self) -> Result<(), Error> {
        if self.keep_alive > 0 && self.ping_delay >= self.keep_alive {
            return Err(Error::new(
                ErrorKind::ConfigError,
                "ping_delay must be smaller than keep_alive",
            ));
        }
        Ok(())
    }
}
