//! Handler trie keyed by topic filter.
//!
//! Lookup walks every branch a topic can take and returns the handlers of
//! *all* matching filters, so overlapping subscriptions (`a/#`, `a/+`, `a/b`)
//! each see the message.

use crate::error::Result;
use crate::serve_mux::Handler;
use crate::topic;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Trie node for MQTT topic filter matching.
#[derive(Default)]
pub struct TrieNode {
    children: HashMap<String, TrieNode>,
    match_any: Option<Box<TrieNode>>, // + wildcard
    match_all: Option<Box<TrieNode>>, // # wildcard
    handlers: Vec<Arc<dyn Handler>>,
}

impl TrieNode {
    /// Create a new empty trie node.
    pub fn new() -> Self {
        Self::default()
    }

    fn node_mut(&mut self, levels: &[&str]) -> &mut TrieNode {
        let Some((first, rest)) = levels.split_first() else {
            return self;
        };
        let child = match *first {
            "+" => self.match_any.get_or_insert_with(Box::default).as_mut(),
            "#" => self.match_all.get_or_insert_with(Box::default).as_mut(),
            level => self.children.entry(level.to_string()).or_default(),
        };
        child.node_mut(rest)
    }

    fn collect(&self, levels: &[&str], at_root: bool, out: &mut Vec<Arc<dyn Handler>>) {
        // A filter starting with a wildcard never sees `$` topics.
        let dollar = at_root && levels.first().is_some_and(|l| l.starts_with('$'));

        if let Some(all) = &self.match_all {
            if !dollar {
                out.extend(all.handlers.iter().cloned());
            }
        }

        let Some((first, rest)) = levels.split_first() else {
            out.extend(self.handlers.iter().cloned());
            return;
        };

        if let Some(child) = self.children.get(*first) {
            child.collect(rest, false, out);
        }
        if let Some(any) = &self.match_any {
            if !dollar {
                any.collect(rest, false, out);
            }
        }
    }

    /// Drop handlers selected by `pred` under `levels`. Returns how many
    /// were removed; empty branches are pruned on the way back up.
    fn remove_where<P>(&mut self, levels: &[&str], pred: &P) -> usize
    where
        P: Fn(&Arc<dyn Handler>) -> bool,
    {
        let Some((first, rest)) = levels.split_first() else {
            let before = self.handlers.len();
            self.handlers.retain(|h| !pred(h));
            return before - self.handlers.len();
        };

        match *first {
            "+" | "#" => {
                let slot = if *first == "+" {
                    &mut self.match_any
                } else {
                    &mut self.match_all
                };
                let Some(node) = slot.as_mut() else {
                    return 0;
                };
                let removed = node.remove_where(rest, pred);
                if node.is_empty() {
                    *slot = None;
                }
                removed
            }
            level => {
                let Some(node) = self.children.get_mut(level) else {
                    return 0;
                };
                let removed = node.remove_where(rest, pred);
                if node.is_empty() {
                    self.children.remove(level);
                }
                removed
            }
        }
    }

    /// True when neither this node nor anything below it holds a handler.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
            && self.children.is_empty()
            && self.match_any.is_none()
            && self.match_all.is_none()
    }

    /// Walk the trie and call the function for each node with its path.
    pub fn walk_with_path<F>(&self, path: &mut Vec<String>, f: &mut F)
    where
        F: FnMut(&[String], &TrieNode),
    {
        for (seg, child) in &self.children {
            path.push(seg.clone());
            child.walk_with_path(path, f);
            path.pop();
        }
        for (seg, node) in [("+", &self.match_any), ("#", &self.match_all)] {
            if let Some(node) = node {
                path.push(seg.to_string());
                node.walk_with_path(path, f);
                path.pop();
            }
        }
        f(path, self);
    }

    /// Add a handler to this node.
    pub fn add_handler(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    /// Number of handlers registered exactly at this node.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl fmt::Debug for TrieNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lines = Vec::new();
        self.walk_with_path(&mut Vec::new(), &mut |path, node| {
            if node.handler_count() > 0 {
                lines.push(format!("{}: {} handlers", path.join("/"), node.handler_count()));
            }
        });
        lines.sort();
        write!(f, "{}", lines.join("\n"))
    }
}

/// Thread-safe trie of topic filters to handlers.
#[derive(Default)]
pub struct Trie {
    root: RwLock<TrieNode>,
}

impl Trie {
    /// Create a new empty trie.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the node for `filter`, creating it if needed.
    pub fn set<F>(&self, filter: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TrieNode),
    {
        topic::validate_filter(filter)?;
        let levels: Vec<&str> = filter.split('/').collect();
        f(self.root.write().node_mut(&levels));
        Ok(())
    }

    /// Handlers of every filter matching `topic`. Empty when nothing matches.
    pub fn get(&self, topic: &str) -> Vec<Arc<dyn Handler>> {
        let levels: Vec<&str> = topic.split('/').collect();
        let mut out = Vec::new();
        self.root.read().collect(&levels, true, &mut out);
        out
    }

    /// Remove every handler registered under `filter`.
    pub fn remove(&self, filter: &str) -> usize {
        let levels: Vec<&str> = filter.split('/').collect();
        self.root.write().remove_where(&levels, &|_| true)
    }

    /// Remove one specific handler registered under `filter`.
    pub fn remove_handler(&self, filter: &str, handler: &Arc<dyn Handler>) -> bool {
        let levels: Vec<&str> = filter.split('/').collect();
        let removed = self
            .root
            .write()
            .remove_where(&levels, &|h| Arc::ptr_eq(h, handler));
        removed > 0
    }

    /// True when no handler is registered at all.
    pub fn is_empty(&self) -> bool {
        self.root.read().is_empty()
    }
}

impl fmt::Debug for Trie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.root.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serve_mux::Message;
    use proptest::prelude::*;

    struct MockHandler;

    impl Handler for MockHandler {
        fn handle_message(&self, _msg: &Message) -> crate::Result<()> {
            Ok(())
        }
    }

    fn handler() -> Arc<dyn Handler> {
        Arc::new(MockHandler)
    }

    fn register(trie: &Trie, filter: &str) {
        let handler = handler();
        trie.set(filter, |node| node.add_handler(handler)).unwrap();
    }

    #[test]
    fn test_exact_match() {
        let trie = Trie::new();
        register(&trie, "device/gear-001/state");

        assert_eq!(trie.get("device/gear-001/state").len(), 1);
        assert!(trie.get("device/gear-002/state").is_empty());
        assert!(trie.get("device/gear-001").is_empty());
    }

    #[test]
    fn test_single_level_wildcard() {
        let trie = Trie::new();
        register(&trie, "device/+/state");

        assert_eq!(trie.get("device/gear-001/state").len(), 1);
        assert_eq!(trie.get("device/abc/state").len(), 1);

        assert!(trie.get("device/state").is_empty());
        assert!(trie.get("device/a/b/state").is_empty());
        assert!(trie.get("other/gear-001/state").is_empty());
    }

    #[test]
    fn test_multi_level_wildcard() {
        let trie = Trie::new();
        register(&trie, "device/#");

        assert_eq!(trie.get("device").len(), 1);
        assert_eq!(trie.get("device/gear-001").len(), 1);
        assert_eq!(trie.get("device/a/b/c/d/e").len(), 1);
        assert!(trie.get("other/gear-001").is_empty());
    }

    #[test]
    fn test_invalid_filters_rejected() {
        let trie = Trie::new();
        assert!(trie.set("device/#/state", |_| {}).is_err());
        assert!(trie.set("", |_| {}).is_err());
        assert!(trie.set("device/gear+", |_| {}).is_err());
        assert!(trie.is_empty());
    }

    #[test]
    fn test_overlapping_filters_all_match() {
        let trie = Trie::new();
        for filter in ["device/#", "device/+/state", "device/gear-001/state", "#"] {
            register(&trie, filter);
        }

        assert_eq!(trie.get("device/gear-001/state").len(), 4);
        assert_eq!(trie.get("device/gear-002/state").len(), 3);
        assert_eq!(trie.get("device/gear-002/stats").len(), 2);
        assert_eq!(trie.get("other").len(), 1);
    }

    #[test]
    fn test_dollar_topics_skip_leading_wildcards() {
        let trie = Trie::new();
        register(&trie, "#");
        register(&trie, "+/uptime");
        register(&trie, "$SYS/#");

        assert_eq!(trie.get("$SYS/uptime").len(), 1);
        assert_eq!(trie.get("host/uptime").len(), 2);
    }

    #[test]
    fn test_multiple_handlers_per_filter() {
        let trie = Trie::new();
        for _ in 0..3 {
            register(&trie, "device/+/state");
        }
        assert_eq!(trie.get("device/gear-001/state").len(), 3);
    }

    #[test]
    fn test_remove_prunes_branches() {
        let trie = Trie::new();
        register(&trie, "device/+/state");
        register(&trie, "device/+/state");
        register(&trie, "server/push/#");

        assert_eq!(trie.remove("device/+/state"), 2);
        assert!(trie.get("device/x/state").is_empty());
        assert_eq!(trie.remove("device/+/state"), 0);

        assert_eq!(trie.remove("server/push/#"), 1);
        assert!(trie.is_empty());
    }

    #[test]
    fn test_remove_single_handler() {
        let trie = Trie::new();
        let first = handler();
        let second = handler();
        let h = first.clone();
        trie.set("a/b", |node| node.add_handler(h)).unwrap();
        let h = second.clone();
        trie.set("a/b", |node| node.add_handler(h)).unwrap();

        assert!(trie.remove_handler("a/b", &first));
        assert!(!trie.remove_handler("a/b", &first));
        let left = trie.get("a/b");
        assert_eq!(left.len(), 1);
        assert!(Arc::ptr_eq(&left[0], &second));
    }

    #[test]
    fn test_debug_lists_filters() {
        let trie = Trie::new();
        register(&trie, "a/+");
        register(&trie, "b/#");
        let out = format!("{:?}", trie);
        assert!(out.contains("a/+: 1 handlers"));
        assert!(out.contains("b/#: 1 handlers"));
    }

    fn level() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("a".to_string()),
            Just("b".to_string()),
            Just("".to_string()),
            Just("$x".to_string()),
        ]
    }

    fn filter_level() -> impl Strategy<Value = String> {
        prop_oneof![level(), Just("+".to_string())]
    }

    fn filter() -> impl Strategy<Value = String> {
        (prop::collection::vec(filter_level(), 1..4), any::<bool>()).prop_map(|(mut levels, hash)| {
            if hash {
                levels.push("#".to_string());
            }
            levels.join("/")
        })
    }

    fn topic_name() -> impl Strategy<Value = String> {
        prop::collection::vec(level(), 1..5).prop_map(|levels| levels.join("/"))
    }

    proptest! {
        #[test]
        fn prop_trie_agrees_with_matches(f in filter(), t in topic_name()) {
            prop_assume!(!f.is_empty() && !t.is_empty());
            let trie = Trie::new();
            register(&trie, &f);
            prop_assert_eq!(!trie.get(&t).is_empty(), topic::matches(&f, &t));
        }
    }
}
