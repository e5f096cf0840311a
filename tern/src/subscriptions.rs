// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

//! Topic-filter to subscriber index used for broadcast fan-out.

use std::collections::HashMap;

use codec::{QoS, SubscribeAck, TopicFilter};

#[derive(Debug, Clone)]
struct SubEntry {
    client_id: String,
    qos: QoS,
}

/// Maps topic filters to subscribed sessions with their granted `QoS`.
///
/// Filters are compiled once on first subscribe and reused for every
/// broadcast lookup. At most one entry exists per client id per filter;
/// a re-subscribe overwrites the granted `QoS` in place.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    map: HashMap<String, (TopicFilter, Vec<SubEntry>)>,
}

impl SubscriptionIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    /// Number of filters with at least one subscriber.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Add a subscription and compute the granted `QoS`.
    ///
    /// An invalid filter is answered with `Failed` (0x80) instead of an
    /// error; requested `QoS` is capped by the broker's `max_qos`.
    pub fn add(&mut self, filter: &str, client_id: &str, qos: QoS, max_qos: QoS) -> SubscribeAck {
        let compiled = match TopicFilter::parse(filter) {
            Ok(compiled) => compiled,
            Err(err) => {
                log::info!("subscriptions: Invalid topic filter {filter:?}: {err:?}");
                return SubscribeAck::Failed;
            }
        };

        let granted = qos.min(max_qos);
        let (_, entries) = self
            .map
            .entry(filter.to_string())
            .or_insert_with(|| (compiled, Vec::new()));
        if let Some(entry) = entries
            .iter_mut()
            .find(|entry| entry.client_id == client_id)
        {
            entry.qos = granted;
        } else {
            entries.push(SubEntry {
                client_id: client_id.to_string(),
                qos: granted,
            });
        }
        SubscribeAck::QoS(granted)
    }

    /// Remove one subscription. A no-op if absent; empty filter lists are
    /// pruned.
    pub fn remove(&mut self, filter: &str, client_id: &str) -> bool {
        let Some((_, entries)) = self.map.get_mut(filter) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.client_id != client_id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.map.remove(filter);
        }
        removed
    }

    /// Remove every subscription of `client_id`, on session destroy.
    pub fn remove_all(&mut self, client_id: &str) {
        self.map.retain(|_, (_, entries)| {
            entries.retain(|entry| entry.client_id != client_id);
            !entries.is_empty()
        });
    }

    /// Collect subscribers whose filter matches `topic`.
    ///
    /// Filters beginning with a wildcard never match `$` topics
    /// [MQTT-4.7.2-1]; the compiled matcher enforces this.
    #[must_use]
    pub fn matches(&self, topic: &str) -> Vec<(String, QoS)> {
        let mut result = Vec::new();
        for (filter, entries) in self.map.values() {
            if !filter.is_match(topic) {
                continue;
            }
            for entry in entries {
                result.push((entry.client_id.clone(), entry.qos));
            }
        }
        result
    }

    /// Count subscriptions of one client, over all filters.
    #[must_use]
    pub fn count_for_client(&self, client_id: &str) -> usize {
        self.map
            .values()
            .filter(|(_, entries)| entries.iter().any(|entry| entry.client_id == client_id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_match() {
        let mut index = SubscriptionIndex::new();
        let ack = index.add("sport/+", "c1", QoS::AtLeastOnce, QoS::ExactOnce);
        assert_eq!(ack, SubscribeAck::QoS(QoS::AtLeastOnce));

        let matches = index.matches("sport/tennis");
        assert_eq!(matches, vec![("c1".to_string(), QoS::AtLeastOnce)]);
        assert!(index.matches("other").is_empty());
    }

    #[test]
    fn test_invalid_filter_failed() {
        let mut index = SubscriptionIndex::new();
        assert_eq!(
            index.add("sport+", "c1", QoS::AtMostOnce, QoS::ExactOnce),
            SubscribeAck::Failed
        );
        assert!(index.is_empty());
    }

    #[test]
    fn test_max_qos_cap() {
        let mut index = SubscriptionIndex::new();
        let ack = index.add("a", "c1", QoS::ExactOnce, QoS::AtLeastOnce);
        assert_eq!(ack, SubscribeAck::QoS(QoS::AtLeastOnce));
    }

    #[test]
    fn test_resubscribe_overwrites_qos() {
        let mut index = SubscriptionIndex::new();
        index.add("a/b", "c1", QoS::AtMostOnce, QoS::ExactOnce);
        index.add("a/b", "c1", QoS::ExactOnce, QoS::ExactOnce);

        // Still a single entry for this client.
        let matches = index.matches("a/b");
        assert_eq!(matches, vec![("c1".to_string(), QoS::ExactOnce)]);
    }

    #[test]
    fn test_remove_prunes_empty_filters() {
        let mut index = SubscriptionIndex::new();
        index.add("a/b", "c1", QoS::AtMostOnce, QoS::ExactOnce);
        assert!(index.remove("a/b", "c1"));
        assert!(!index.remove("a/b", "c1"));
        assert!(index.is_empty());
    }

    #[test]
    fn test_remove_all() {
        let mut index = SubscriptionIndex::new();
        index.add("a", "c1", QoS::AtMostOnce, QoS::ExactOnce);
        index.add("b", "c1", QoS::AtMostOnce, QoS::ExactOnce);
        index.add("b", "c2", QoS::AtMostOnce, QoS::ExactOnce);
        index.remove_all("c1");
        assert_eq!(index.count_for_client("c1"), 0);
        assert_eq!(index.matches("b"), vec![("c2".to_string(), QoS::AtMostOnce)]);
    }

    #[test]
    fn test_dollar_topic_isolation() {
        let mut index = SubscriptionIndex::new();
        index.add("#", "c1", QoS::AtMostOnce, QoS::ExactOnce);
        index.add("$SYS/#", "c2", QoS::AtMostOnce, QoS::ExactOnce);

        let matches = index.matches("$SYS/uptime");
        assert_eq!(matches, vec![("c2".to_string(), QoS::AtMostOnce)]);
    }
}
