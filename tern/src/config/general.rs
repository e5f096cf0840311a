// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use codec::QoS;
use serde::Deserialize;

use crate::error::Error;

/// General broker options.
#[derive(Debug, Clone, Deserialize)]
pub struct General {
    /// Maximum `QoS` granted to subscriptions; requested values are capped.
    #[serde(default = "General::default_max_qos")]
    max_qos: QoS,

    /// Grace seconds added to a non-zero client keep-alive before the
    /// broker's read deadline fires.
    #[serde(default = "General::default_timeout_disconnect_delay")]
    timeout_disconnect_delay: u64,

    /// Consult auth policies for publish/subscribe topic access. When off,
    /// every topic check passes.
    #[serde(default = "General::default_topic_check")]
    topic_check: bool,
}

impl Default for General {
    fn default() -> Self {
        Self {
            max_qos: Self::default_max_qos(),
            timeout_disconnect_delay: Self::default_timeout_disconnect_delay(),
            topic_check: Self::default_topic_check(),
        }
    }
}

impl General {
    fn default_max_qos() -> QoS {
        QoS::ExactOnce
    }

    const fn default_timeout_disconnect_delay() -> u64 {
        0
    }

    const fn default_topic_check() -> bool {
        false
    }

    #[must_use]
    pub const fn max_qos(&self) -> QoS {
        self.max_qos
    }

    #[must_use]
    pub const fn timeout_disconnect_delay(&self) -> u64 {
        self.timeout_disconnect_delay
    }

    #[must_use]
    pub const fn topic_check(&self) -> bool {
        self.topic_check
    }

    /// Validate general options.
    ///
    /// # Errors
    ///
    /// Returns error if some option is invalid.
    pub const fn validate(&self) -> Result<(), Error> {
        Ok(())
    }
}
