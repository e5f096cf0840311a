// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! In-memory store of retained messages, one per topic.

use std::collections::HashMap;

use codec::TopicFilter;

use crate::session::RetainedMessage;

/// Maps topic names to their retained message.
///
/// A zero-length payload removes the stored entry [MQTT-3.3.1-10].
#[derive(Debug, Default)]
pub struct RetainedStore {
    map: HashMap<String, RetainedMessage>,
}

impl RetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Store `message` for its topic, replacing any existing value.
    ///
    /// An empty payload clears the topic instead.
    pub fn put(&mut self, message: RetainedMessage) {
        if message.data.is_empty() {
            log::debug!("retained: Clearing retained message of {}", message.topic);
            self.map.remove(&message.topic);
        } else {
            log::debug!("retained: Retaining message on {}", message.topic);
            self.map.insert(message.topic.clone(), message);
        }
    }

    #[must_use]
    pub fn get(&self, topic: &str) -> Option<&RetainedMessage> {
        self.map.get(topic)
    }

    /// Collect every stored message whose topic matches `filter`, for
    /// replay on a new subscription.
    #[must_use]
    pub fn scan(&self, filter: &TopicFilter) -> Vec<RetainedMessage> {
        self.map
            .values()
            .filter(|message| filter.is_match(&message.topic))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use codec::QoS;

    use super::*;

    fn message(topic: &str, data: &'static [u8]) -> RetainedMessage {
        RetainedMessage::new(None, topic, Bytes::from_static(data), QoS::AtLeastOnce)
    }

    #[test]
    fn test_put_replaces() {
        let mut store = RetainedStore::new();
        store.put(message("a/b", b"one"));
        store.put(message("a/b", b"two"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("a/b").unwrap().data.as_ref(), b"two");
    }

    #[test]
    fn test_empty_payload_clears() {
        let mut store = RetainedStore::new();
        store.put(message("a/b", b"one"));
        store.put(message("a/b", b""));
        assert!(store.is_empty());

        // Clearing an absent topic is a no-op.
        store.put(message("c/d", b""));
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan() {
        let mut store = RetainedStore::new();
        store.put(message("sport/tennis", b"t"));
        store.put(message("sport/golf", b"g"));
        store.put(message("news", b"n"));

        let filter = TopicFilter::parse("sport/+").unwrap();
        let mut topics: Vec<String> = store
            .scan(&filter)
            .into_iter()
            .map(|msg| msg.topic)
            .collect();
        topics.sort();
        assert_eq!(topics, vec!["sport/golf", "sport/tennis"]);
    }
}
