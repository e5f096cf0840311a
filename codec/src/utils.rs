// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

/// Byte length of generated client ids.
pub const RANDOM_CLIENT_ID_LEN: usize = 16;

/// Generate a random client id of [A-Za-z0-9] chars.
///
/// Used when CONNECT payload carries a zero-byte client id [MQTT-3.1.3-6].
#[must_use]
pub fn random_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_CLIENT_ID_LEN)
        .map(char::from)
        .collect()
}

/// Convert bytes into a UTF-8 string, replacing invalid sequences.
///
/// The reader is lenient: opaque bytes in string fields are preserved
/// as replacement chars instead of aborting the whole packet.
#[must_use]
pub fn to_utf8_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdError {
    /// Larger than 65535 bytes.
    TooLong,
}

/// Validate client id supplied by user code.
///
/// The 23-byte limit of [MQTT-3.1.3-5] is a server MAY, not enforced here;
/// only the wire-format length limit applies.
///
/// # Errors
///
/// Returns error if `client_id` does not fit into a length-prefixed field.
pub fn validate_client_id(client_id: &str) -> Result<(), ClientIdError> {
    if client_id.len() > u16::MAX as usize {
        return Err(ClientIdError::TooLong);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_client_id() {
        let id = random_client_id();
        assert_eq!(id.len(), RANDOM_CLIENT_ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));

        let other = random_client_id();
        assert_ne!(id, other);
    }
}
