// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::time::Duration;

/// Default port of plain MQTT protocol.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default port of MQTT over TLS.
pub const DEFAULT_MQTTS_PORT: u16 = 8883;

/// Default port of MQTT over WebSocket.
pub const DEFAULT_WS_PORT: u16 = 80;

/// Default port of MQTT over secure WebSocket.
pub const DEFAULT_WSS_PORT: u16 = 443;

/// WebSocket subprotocol carrying MQTT bytes.
pub const WS_SUBPROTOCOL: &str = "mqtt";

/// Time to wait for a PUBACK before the `QoS` 1 flow fails.
pub const PUBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-message deadline when replaying inflight messages on reconnect.
pub const REDELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Time the broker waits for the broadcast loop to drain at shutdown.
pub const BROADCAST_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay before retrying a session transition during a reconnect storm.
pub const TAKEOVER_RETRY_DELAY: Duration = Duration::from_secs(1);
