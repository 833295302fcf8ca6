//! Topic Trie for subscription matching
//!
//! A prefix tree keyed by filter level. Wildcard levels get dedicated slots
//! so that a topic lookup only walks the branches that can match.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

use super::validation::{parse_levels, TopicLevel};

/// Node in the topic trie
#[derive(Debug)]
struct TrieNode<V> {
    /// Value of the filter ending exactly at this node
    value: Option<V>,
    /// Literal children (CompactString avoids heap allocation for short levels)
    children: AHashMap<CompactString, TrieNode<V>>,
    /// Single-level wildcard (+) child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value of the filter ending in a multi-level wildcard (#) at this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

/// Topic Trie mapping filters to values
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
        }
    }

    /// Get the value stored for a filter, inserting one built by `default` if absent
    pub fn get_or_insert_with<F>(&mut self, filter: &str, default: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let mut node = &mut self.root;

        for level in parse_levels(filter) {
            node = match level {
                TopicLevel::MultiWildcard => {
                    // Anything after # is rejected by validation; stop here
                    return node.multi_wildcard.get_or_insert_with(default);
                }
                TopicLevel::SingleWildcard => node
                    .single_wildcard
                    .get_or_insert_with(|| Box::new(TrieNode::new()))
                    .as_mut(),
                TopicLevel::Normal(name) => node
                    .children
                    .entry(CompactString::new(name))
                    .or_insert_with(TrieNode::new),
            };
        }

        node.value.get_or_insert_with(default)
    }

    /// Get a mutable reference to the value at a filter
    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;

        for level in parse_levels(filter) {
            node = match level {
                TopicLevel::MultiWildcard => return node.multi_wildcard.as_mut(),
                TopicLevel::SingleWildcard => node.single_wildcard.as_deref_mut()?,
                TopicLevel::Normal(name) => node.children.get_mut(name)?,
            };
        }

        node.value.as_mut()
    }

    /// Remove a filter, pruning branches left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[TopicLevel<'_>; 8]> = parse_levels(filter).collect();
        Self::remove_recursive(&mut self.root, &levels)
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[TopicLevel<'_>]) -> Option<V> {
        let Some((level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            TopicLevel::MultiWildcard => node.multi_wildcard.take(),
            TopicLevel::SingleWildcard => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            TopicLevel::Normal(name) => {
                let child = node.children.get_mut(*name)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(*name);
                }
                removed
            }
        }
    }

    /// Drop every value for which `pred` returns true, pruning empty branches
    pub fn remove_by_predicate<F>(&mut self, mut pred: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        Self::remove_by_predicate_recursive(&mut self.root, &mut pred);
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, pred: &mut F)
    where
        F: FnMut(&mut V) -> bool,
    {
        if node.value.as_mut().is_some_and(|v| pred(v)) {
            node.value = None;
        }

        if node.multi_wildcard.as_mut().is_some_and(|v| pred(v)) {
            node.multi_wildcard = None;
        }

        if let Some(child) = node.single_wildcard.as_deref_mut() {
            Self::remove_by_predicate_recursive(child, pred);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }

        node.children.retain(|_, child| {
            Self::remove_by_predicate_recursive(child, pred);
            !child.is_empty()
        });
    }

    /// Call `callback` with the value of every filter matching `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        // $-topics don't match filters starting with + or #
        let is_system_topic = topic.starts_with('$');

        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        Self::matches_recursive(&self.root, &levels, is_system_topic, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        at_root_of_system: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        if !at_root_of_system {
            if let Some(v) = &node.multi_wildcard {
                callback(v);
            }
        }

        let Some((level, rest)) = levels.split_first() else {
            if let Some(v) = &node.value {
                callback(v);
            }
            return;
        };

        if !at_root_of_system {
            if let Some(child) = &node.single_wildcard {
                Self::matches_recursive(child, rest, false, callback);
            }
        }

        if let Some(child) = node.children.get(*level) {
            Self::matches_recursive(child, rest, false, callback);
        }
    }

    /// Whether the trie holds no filters at all
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
