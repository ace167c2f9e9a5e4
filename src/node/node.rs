//! Hierarchical configuration nodes with dotted-path access.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tracing::debug;

use super::value::Value;
use crate::error::StoreError;

/// Section of the persisted document holding the tree.
pub const DATA_KEY: &str = "__data__";
/// Section of the persisted document holding per-path type hints.
pub const TYPE_HINTS_KEY: &str = "__type_hints__";
/// Derived pseudo-field reporting whether the process runs in debug mode.
pub const DEBUG_MODE_KEY: &str = "debug_mode";
/// Name of the back-reference to the owning manager.
pub const ROOT_KEY: &str = "__root__";

/// Keys that never live inside a node's mapping.
pub const RESERVED_KEYS: [&str; 4] = [DATA_KEY, TYPE_HINTS_KEY, DEBUG_MODE_KEY, ROOT_KEY];

/// Returns true for keys the public mutation surface silently drops.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Hooks a node uses to reach the manager at the root of its tree.
pub trait Root: Send + Sync {
    /// Called after every successful mutation anywhere in the tree.
    fn schedule_autosave(&self);

    /// Evaluated every time the `debug_mode` pseudo-field is read.
    fn debug_mode(&self) -> bool;
}

/// Non-owning handle from a node to its root.
///
/// Never keeps the root alive; a dropped root makes every hook a no-op.
#[derive(Clone, Default)]
pub struct RootRef(Option<Weak<dyn Root>>);

impl RootRef {
    /// A handle that belongs to no root.
    pub fn detached() -> Self {
        Self(None)
    }

    /// A back-reference to `root`.
    pub fn new(root: Weak<dyn Root>) -> Self {
        Self(Some(root))
    }

    fn upgrade(&self) -> Option<Arc<dyn Root>> {
        self.0.as_ref().and_then(Weak::upgrade)
    }

    /// Whether the root is still alive.
    pub fn is_attached(&self) -> bool {
        self.upgrade().is_some()
    }

    fn notify(&self) {
        if let Some(root) = self.upgrade() {
            root.schedule_autosave();
        }
    }

    fn debug_mode(&self) -> bool {
        self.upgrade().map(|root| root.debug_mode()).unwrap_or(false)
    }
}

impl fmt::Debug for RootRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_attached() {
            write!(f, "RootRef(attached)")
        } else {
            write!(f, "RootRef(detached)")
        }
    }
}

/// A mapping from string keys to [`Value`]s.
///
/// Nested mappings are always stored as child nodes that share this node's
/// root handle, so a write deep in the tree still reaches the root.
#[derive(Default)]
pub struct Node {
    entries: BTreeMap<String, Value>,
    root: RootRef,
}

impl Node {
    /// An empty, detached node.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty node tagged with `root`.
    pub fn with_root(root: RootRef) -> Self {
        Self {
            entries: BTreeMap::new(),
            root,
        }
    }

    /// The root this node reports mutations to.
    pub fn root(&self) -> &RootRef {
        &self.root
    }

    /// Re-tags this node and every nested node with `root`.
    pub fn attach(&mut self, root: RootRef) {
        for value in self.entries.values_mut() {
            attach_value(value, &root);
        }
        self.root = root;
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the node has no children.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Child keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Children with their keys, in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether this node holds `key` directly (no path splitting).
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether a value exists at the dotted `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.get_ref(path).is_some()
    }

    /// Borrows the stored value at a dotted path.
    ///
    /// Derived fields are not stored, so `debug_mode` is never found here.
    pub fn get_ref(&self, path: &str) -> Option<&Value> {
        let (parents, leaf) = split_path(path)?;
        let mut current = self;
        for segment in parents {
            current = current.entries.get(segment)?.as_node()?;
        }
        current.entries.get(leaf)
    }

    /// Reads the value at a dotted path, including the derived `debug_mode` field.
    pub fn get(&self, path: &str) -> Option<Value> {
        let (parents, leaf) = split_path(path)?;
        let mut current = self;
        for segment in parents {
            current = current.entries.get(segment)?.as_node()?;
        }
        if leaf == DEBUG_MODE_KEY {
            return Some(Value::Bool(current.debug_mode()));
        }
        current.entries.get(leaf).cloned()
    }

    /// Reads and converts the value at `path`; `None` when missing or not convertible.
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        self.get(path).and_then(|value| value.convert())
    }

    /// Reads and converts the value at `path`, falling back to `default`.
    pub fn get_or<T: DeserializeOwned>(&self, path: &str, default: T) -> T {
        self.get_as(path).unwrap_or(default)
    }

    /// Borrows the child node at a dotted path.
    pub fn node(&self, path: &str) -> Option<&Node> {
        self.get_ref(path).and_then(Value::as_node)
    }

    /// Mutably borrows the child node at a dotted path.
    pub fn node_mut(&mut self, path: &str) -> Option<&mut Node> {
        let (parents, leaf) = split_path(path)?;
        let mut current = self;
        for segment in parents {
            current = current.entries.get_mut(segment)?.as_node_mut()?;
        }
        current.entries.get_mut(leaf)?.as_node_mut()
    }

    /// Attribute-style read of a single key.
    ///
    /// Unlike [`Node::get`], a missing key is an error, so typos never read as null.
    pub fn field(&self, key: &str) -> Result<Value, StoreError> {
        if key == DEBUG_MODE_KEY {
            return Ok(Value::Bool(self.debug_mode()));
        }
        self.entries
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NoSuchField {
                field: key.to_string(),
                suggestion: self.closest_key(key),
            })
    }

    /// Attribute-style write of a single key; `key` is never split on dots.
    pub fn set_field(&mut self, key: &str, value: impl Into<Value>) {
        if is_reserved(key) {
            debug!(key, "Ignoring write to reserved key");
            return;
        }
        let built = build(value.into(), &self.root);
        self.entries.insert(key.to_string(), built);
        self.root.notify();
    }

    /// Stores `value` at a dotted path, creating intermediate nodes as needed.
    pub fn set(&mut self, path: &str, value: impl Into<Value>) {
        if self.store(path, value.into()) {
            self.root.notify();
        }
    }

    /// Removes the value at a dotted path.
    pub fn remove(&mut self, path: &str) -> Option<Value> {
        let removed = self.take(path);
        if removed.is_some() {
            self.root.notify();
        }
        removed
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.root.notify();
        }
    }

    /// The derived `debug_mode` flag; asks the root every time.
    pub fn debug_mode(&self) -> bool {
        self.root.debug_mode()
    }

    /// Produces a plain nested mapping without reserved keys.
    pub fn to_mapping(&self) -> serde_yaml::Mapping {
        let mut mapping = serde_yaml::Mapping::new();
        for (key, value) in &self.entries {
            if is_reserved(key) {
                continue;
            }
            mapping.insert(serde_yaml::Value::String(key.clone()), value.to_yaml());
        }
        mapping
    }

    /// Stores without notifying the root. Returns whether anything was stored.
    pub(crate) fn store(&mut self, path: &str, value: Value) -> bool {
        let Some((parents, leaf)) = split_path(path) else {
            debug!(path, "Ignoring write to malformed path");
            return false;
        };
        if is_reserved(leaf) || parents.iter().any(|segment| is_reserved(segment)) {
            debug!(path, "Ignoring write to reserved key");
            return false;
        }

        let root = self.root.clone();
        let mut current = self;
        for segment in parents {
            let slot = current
                .entries
                .entry(segment.to_string())
                .or_insert_with(|| Value::Node(Node::with_root(root.clone())));
            if slot.as_node().is_none() {
                *slot = Value::Node(Node::with_root(root.clone()));
            }
            current = match slot {
                Value::Node(node) => node,
                _ => return false,
            };
        }

        current.entries.insert(leaf.to_string(), build(value, &root));
        true
    }

    /// Removes without notifying the root.
    pub(crate) fn take(&mut self, path: &str) -> Option<Value> {
        let (parents, leaf) = split_path(path)?;
        let mut current = self;
        for segment in parents {
            current = current.entries.get_mut(segment)?.as_node_mut()?;
        }
        current.entries.remove(leaf)
    }

    /// Inserts an already-built value without filtering or notification.
    pub(crate) fn insert_raw(&mut self, key: String, value: Value) {
        self.entries.insert(key, value);
    }

    fn closest_key(&self, key: &str) -> Option<String> {
        self.entries
            .keys()
            .map(|candidate| (strsim::levenshtein(key, candidate), candidate))
            .filter(|(distance, _)| *distance <= 3)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, candidate)| candidate.clone())
    }
}

/// Tags a value (and everything nested in it) with `root`.
///
/// Mappings are already nodes by construction; lists keep their shape and
/// have each element built.
fn build(mut value: Value, root: &RootRef) -> Value {
    attach_value(&mut value, root);
    value
}

fn attach_value(value: &mut Value, root: &RootRef) {
    match value {
        Value::Node(node) => node.attach(root.clone()),
        Value::List(items) => {
            for item in items {
                attach_value(item, root);
            }
        }
        _ => {}
    }
}

/// Splits a dotted path into parent segments and the leaf key.
///
/// Empty paths and empty segments (`a..b`) are rejected.
fn split_path(path: &str) -> Option<(Vec<&str>, &str)> {
    let mut segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return None;
    }
    let leaf = segments.pop()?;
    Some((segments, leaf))
}

/// Copies share no state with the original and are detached from its root.
impl Clone for Node {
    fn clone(&self) -> Self {
        Node {
            entries: self.entries.clone(),
            root: RootRef::detached(),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl Serialize for Node {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let visible = self.entries.iter().filter(|(key, _)| !is_reserved(key));
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in visible {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Node {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut node = Node::new();
        for (key, value) in iter {
            let key = key.into();
            if is_reserved(&key) {
                continue;
            }
            node.insert_raw(key, value.into());
        }
        node
    }
}
