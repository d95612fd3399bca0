// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

//! Subscription trie.

use codec::{QoS, TopicFilter, TopicPart};
use std::collections::HashMap;

/// One trie node per topic level.
///
/// Wildcard children are kept apart from the exact-match children so a lookup
/// only ever descends into at most one exact child plus the wildcard children
/// of each visited node.
#[derive(Debug, Default, Clone)]
struct TrieNode {
    /// Exact-match children, keyed by level literal.
    children: HashMap<String, TrieNode>,

    /// `+` child, matching any single level.
    single_wildcard: Option<Box<TrieNode>>,

    /// `#` child. Its subscriptions match this prefix and anything below.
    multi_wildcard: Option<Box<TrieNode>>,

    /// Subscriptions terminating at this node, client id to granted qos.
    subscriptions: HashMap<String, QoS>,
}

impl TrieNode {
    fn is_unused(&self) -> bool {
        self.children.is_empty()
            && self.single_wildcard.is_none()
            && self.multi_wildcard.is_none()
            && self.subscriptions.is_empty()
    }
}

/// Maps topic filters to subscribers and, given a concrete topic, returns the
/// set of matching subscriptions, one entry per client at the highest granted
/// qos.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Default, Clone)]
pub struct SubTrie {
    root: TrieNode,
    subscription_count: usize,
}

impl SubTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.subscription_count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.subscription_count == 0
    }

    /// Insert a subscription. A repeated insertion for the same
    /// (filter, client) pair replaces the granted qos.
    ///
    /// Returns false when an existing subscription was replaced.
    pub fn subscribe(&mut self, client_id: &str, filter: &TopicFilter, qos: QoS) -> bool {
        let mut node = &mut self.root;
        for part in filter.parts() {
            node = match part {
                TopicPart::Normal(level) => node.children.entry(level.clone()).or_default(),
                TopicPart::Empty => node.children.entry(String::new()).or_default(),
                TopicPart::SingleWildcard => {
                    &mut **node.single_wildcard.get_or_insert_with(Box::default)
                }
                TopicPart::MultiWildcard => {
                    &mut **node.multi_wildcard.get_or_insert_with(Box::default)
                }
            };
        }

        let is_new = node
            .subscriptions
            .insert(client_id.to_string(), qos)
            .is_none();
        if is_new {
            self.subscription_count += 1;
        }
        is_new
    }

    /// Remove the subscription of `client_id` terminating at `filter`,
    /// pruning nodes which become subscription-free and child-free.
    ///
    /// Returns true when a subscription was removed.
    pub fn unsubscribe(&mut self, client_id: &str, filter: &TopicFilter) -> bool {
        let removed = Self::remove_filter(&mut self.root, client_id, filter.parts());
        if removed {
            self.subscription_count -= 1;
        }
        removed
    }

    fn remove_filter(node: &mut TrieNode, client_id: &str, parts: &[TopicPart]) -> bool {
        let Some(part) = parts.first() else {
            return node.subscriptions.remove(client_id).is_some();
        };

        match part {
            TopicPart::Normal(level) => {
                let Some(child) = node.children.get_mut(level.as_str()) else {
                    return false;
                };
                let removed = Self::remove_filter(child, client_id, &parts[1..]);
                if child.is_unused() {
                    node.children.remove(level.as_str());
                }
                removed
            }
            TopicPart::Empty => {
                let Some(child) = node.children.get_mut("") else {
                    return false;
                };
                let removed = Self::remove_filter(child, client_id, &parts[1..]);
                if child.is_unused() {
                    node.children.remove("");
                }
                removed
            }
            TopicPart::SingleWildcard => {
                let Some(child) = node.single_wildcard.as_mut() else {
                    return false;
                };
                let removed = Self::remove_filter(child, client_id, &parts[1..]);
                if child.is_unused() {
                    node.single_wildcard = None;
                }
                removed
            }
            TopicPart::MultiWildcard => {
                let Some(child) = node.multi_wildcard.as_mut() else {
                    return false;
                };
                let removed = Self::remove_filter(child, client_id, &parts[1..]);
                if child.is_unused() {
                    node.multi_wildcard = None;
                }
                removed
            }
        }
    }

    /// Remove every subscription of `client_id`, pruning empty nodes.
    ///
    /// Returns the number of subscriptions removed.
    pub fn unsubscribe_client(&mut self, client_id: &str) -> usize {
        let removed = Self::purge_client(&mut self.root, client_id);
        self.subscription_count -= removed;
        removed
    }

    fn purge_client(node: &mut TrieNode, client_id: &str) -> usize {
        let mut removed = usize::from(node.subscriptions.remove(client_id).is_some());

        node.children.retain(|_level, child| {
            removed += Self::purge_client(child, client_id);
            !child.is_unused()
        });
        if let Some(child) = node.single_wildcard.as_mut() {
            removed += Self::purge_client(child, client_id);
            if child.is_unused() {
                node.single_wildcard = None;
            }
        }
        if let Some(child) = node.multi_wildcard.as_mut() {
            removed += Self::purge_client(child, client_id);
            if child.is_unused() {
                node.multi_wildcard = None;
            }
        }

        removed
    }

    /// Find subscribers whose filter matches the concrete `topic`.
    ///
    /// The result holds one entry per client, at the highest granted qos
    /// across that client's matching subscriptions.
    #[must_use]
    pub fn matches(&self, topic: &str) -> HashMap<String, QoS> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = HashMap::new();
        Self::collect_matches(&self.root, &levels, &mut out);
        out
    }

    fn collect_matches(node: &TrieNode, levels: &[&str], out: &mut HashMap<String, QoS>) {
        // A `#` child matches the remaining levels including the parent
        // level itself [MQTT-4.7.1-2].
        if let Some(multi) = &node.multi_wildcard {
            Self::merge(out, &multi.subscriptions);
        }

        let Some((level, rest)) = levels.split_first() else {
            Self::merge(out, &node.subscriptions);
            return;
        };

        if let Some(child) = node.children.get(*level) {
            Self::collect_matches(child, rest, out);
        }
        if let Some(single) = &node.single_wildcard {
            Self::collect_matches(single, rest, out);
        }
    }

    fn merge(out: &mut HashMap<String, QoS>, subscriptions: &HashMap<String, QoS>) {
        for (client_id, qos) in subscriptions {
            out.entry(client_id.clone())
                .and_modify(|granted| {
                    if *qos > *granted {
                        *granted = *qos;
                    }
                })
                .or_insert(*qos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    #[test]
    fn test_exact_match() {
        let mut trie = SubTrie::new();
        trie.subscribe("sub", &filter("a/b"), QoS::AtMostOnce);

        assert!(trie.matches("a/b").contains_key("sub"));
        assert!(trie.matches("a/B").is_empty());
        assert!(trie.matches("a").is_empty());
        assert!(trie.matches("a/b/c").is_empty());
    }

    #[test]
    fn test_single_wildcard() {
        let mut trie = SubTrie::new();
        trie.subscribe("sub", &filter("sensors/+/temp"), QoS::AtMostOnce);

        assert!(trie.matches("sensors/a/temp").contains_key("sub"));
        assert!(trie.matches("sensors/b/temp").contains_key("sub"));
        assert!(trie.matches("sensors/a/b/temp").is_empty());
        assert!(trie.matches("sensors/a").is_empty());
    }

    #[test]
    fn test_multi_wildcard_matches_parent() {
        let mut trie = SubTrie::new();
        trie.subscribe("sub", &filter("a/#"), QoS::AtMostOnce);

        assert!(trie.matches("a").contains_key("sub"));
        assert!(trie.matches("a/b").contains_key("sub"));
        assert!(trie.matches("a/b/c").contains_key("sub"));
        assert!(trie.matches("b").is_empty());
    }

    #[test]
    fn test_highest_qos_per_client() {
        let mut trie = SubTrie::new();
        trie.subscribe("sub", &filter("q/#"), QoS::AtMostOnce);
        trie.subscribe("sub", &filter("q/1"), QoS::ExactOnce);
        trie.subscribe("other", &filter("q/1"), QoS::AtLeastOnce);

        let matched = trie.matches("q/1");
        assert_eq!(matched.len(), 2);
        assert_eq!(matched.get("sub"), Some(&QoS::ExactOnce));
        assert_eq!(matched.get("other"), Some(&QoS::AtLeastOnce));

        let matched = trie.matches("q/2");
        assert_eq!(matched.get("sub"), Some(&QoS::AtMostOnce));
    }

    #[test]
    fn test_resubscribe_replaces_qos() {
        let mut trie = SubTrie::new();
        assert!(trie.subscribe("sub", &filter("a/b"), QoS::AtMostOnce));
        assert!(!trie.subscribe("sub", &filter("a/b"), QoS::AtLeastOnce));
        assert_eq!(trie.len(), 1);
        assert_eq!(trie.matches("a/b").get("sub"), Some(&QoS::AtLeastOnce));
    }

    #[test]
    fn test_unsubscribe_prunes_nodes() {
        let mut trie = SubTrie::new();
        trie.subscribe("sub", &filter("a/b/c"), QoS::AtMostOnce);
        trie.subscribe("sub", &filter("a/+"), QoS::AtMostOnce);

        assert!(trie.unsubscribe("sub", &filter("a/b/c")));
        assert!(!trie.unsubscribe("sub", &filter("a/b/c")));
        assert!(trie.matches("a/b/c").is_empty());
        assert!(trie.matches("a/b").contains_key("sub"));

        assert!(trie.unsubscribe("sub", &filter("a/+")));
        assert!(trie.is_empty());
        assert!(trie.root.is_unused());
    }

    #[test]
    fn test_unsubscribe_client_purges_all() {
        let mut trie = SubTrie::new();
        trie.subscribe("sub", &filter("a/#"), QoS::AtMostOnce);
        trie.subscribe("sub", &filter("b/+/c"), QoS::AtLeastOnce);
        trie.subscribe("other", &filter("a/#"), QoS::AtMostOnce);

        assert_eq!(trie.unsubscribe_client("sub"), 2);
        assert_eq!(trie.len(), 1);
        assert!(trie.matches("a/x").contains_key("other"));
        assert!(!trie.matches("a/x").contains_key("sub"));
    }

    #[test]
    fn test_index_equivalence_with_filter_match() {
        // The trie agrees with TopicFilter::is_match for every pair.
        let filters = ["a/b", "a/#", "+/b", "a/+/c", "#", "a//b", "+"];
        let topics = ["a", "a/b", "a/b/c", "b", "a/x/c", "a//b", ""];

        for f in filters {
            let parsed = filter(f);
            let mut trie = SubTrie::new();
            trie.subscribe("sub", &parsed, QoS::AtMostOnce);
            for t in topics {
                assert_eq!(
                    trie.matches(t).contains_key("sub"),
                    parsed.is_match(t),
                    "filter: {f}, topic: {t}"
                );
            }
        }
    }
}
