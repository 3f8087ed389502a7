//! Windows registry hive (REGF) reading and editing.
//!
//! A hive is parsed into an in-memory key tree, mutated through node
//! handles, and written back out as a complete REGF image. Rewriting the
//! whole file (rather than patching cells in place) keeps the format
//! logic small and the output deterministic.
//!
//! Value data is kept as raw bytes plus a type tag, so edits that must be
//! byte-exact (`REG_BINARY` records, UTF-16LE terminators) round-trip
//! unchanged. Typed accessors decode on demand.
//!
//! # Quick start
//!
//! ```
//! use vmlift_hive::{Hive, RegValue};
//!
//! let mut hive = Hive::create("SYSTEM");
//! let key = hive.ensure_path(r"ControlSet001\Services\viostor").unwrap();
//! hive.set_value(key, "Start", RegValue::dword(0));
//! let bytes = hive.to_bytes();
//!
//! let reread = Hive::from_bytes(&bytes).unwrap();
//! let key = reread.lookup(reread.root(), r"ControlSet001\Services\viostor").unwrap();
//! assert_eq!(reread.value(key, "Start").unwrap().as_dword(), Some(0));
//! ```

mod regf;
mod value;

use std::collections::VecDeque;

pub use value::{RegType, RegValue, utf16le, utf16le_of};

/// Alias for `Result<T, vmlift_hive::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while parsing or serializing a hive.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The file does not start with a valid REGF base block.
    #[error("not a registry hive: bad base block")]
    BadBaseBlock,

    /// A cell reference points outside the hive bins area.
    #[error("corrupt hive: cell offset {0:#x} out of range")]
    BadCellOffset(u32),

    /// A record carries an unknown or mismatched signature.
    #[error("corrupt hive: expected {expected} record at {offset:#x}")]
    BadSignature {
        /// The record signature that was expected.
        expected: &'static str,
        /// Cell offset where the record was found.
        offset: u32,
    },

    /// Value data is stored in a big-data (`db`) record, which this
    /// implementation does not read.
    #[error("unsupported hive feature: big-data value records")]
    BigData,

    /// A key path component was not found.
    #[error("key not found: {0}")]
    KeyNotFound(String),
}

/// Handle to a key inside a [`Hive`].
///
/// Handles are indices into the hive's node arena; they stay valid for
/// the lifetime of the hive (deleted nodes leave tombstones).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId(pub(crate) usize);

/// One registry key: name, subkeys, values.
#[derive(Debug, Clone)]
pub(crate) struct Node {
    /// Key name as stored (original case preserved).
    pub name: String,
    /// Parent node, `None` for the root.
    pub parent: Option<usize>,
    /// Child node indices, in insertion order.
    pub children: Vec<usize>,
    /// Values as `(name, value)`; the default value has an empty name.
    pub values: Vec<(String, RegValue)>,
    /// Last-write FILETIME carried through from parse (0 for new keys).
    pub timestamp: u64,
    /// Tombstone flag set by [`Hive::delete_key`].
    pub deleted: bool,
}

/// An in-memory registry hive.
#[derive(Debug, Clone)]
pub struct Hive {
    /// Node arena; index 0 is always the root key.
    nodes: Vec<Node>,
    /// Embedded hive file name (UTF-16LE, base block bytes 48..112).
    filename: String,
    /// Sequence number carried through from parse.
    sequence: u32,
}

impl Hive {
    /// Creates a new hive with an empty root key.
    ///
    /// `filename` is the name embedded in the base block (Windows uses
    /// the path fragment, e.g. `SYSTEM`).
    pub fn create(filename: &str) -> Self {
        Self {
            nodes: vec![Node {
                name: "ROOT".to_owned(),
                parent: None,
                children: Vec::new(),
                values: Vec::new(),
                timestamp: 0,
                deleted: false,
            }],
            filename: filename.to_owned(),
            sequence: 1,
        }
    }

    /// Parses a hive from its on-disk bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        regf::parse(data)
    }

    /// Serializes the hive to a complete REGF image.
    pub fn to_bytes(&self) -> Vec<u8> {
        regf::serialize(self)
    }

    /// Returns the root key handle.
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Returns a key's name.
    pub fn name(&self, node: NodeId) -> &str {
        &self.nodes[node.0].name
    }

    /// Returns the live children of a key.
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes[node.0]
            .children
            .iter()
            .copied()
            .filter(|&c| !self.nodes[c].deleted)
            .map(NodeId)
            .collect()
    }

    /// Looks up a direct child by name, case-insensitively (registry
    /// key names are case-preserving but case-insensitive).
    pub fn child(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.children(node)
            .into_iter()
            .find(|&c| self.nodes[c.0].name.eq_ignore_ascii_case(name))
    }

    /// Walks a backslash-separated path below `from`.
    pub fn lookup(&self, from: NodeId, path: &str) -> Result<NodeId> {
        let mut cur = from;
        for part in path.split('\\').filter(|p| !p.is_empty()) {
            cur = self
                .child(cur, part)
                .ok_or_else(|| Error::KeyNotFound(path.to_owned()))?;
        }
        Ok(cur)
    }

    /// Walks a path below the root, creating missing intermediate keys.
    pub fn ensure_path(&mut self, path: &str) -> Result<NodeId> {
        let mut cur = self.root();
        for part in path.split('\\').filter(|p| !p.is_empty()) {
            cur = match self.child(cur, part) {
                Some(c) => c,
                None => self.add_child(cur, part),
            };
        }
        Ok(cur)
    }

    /// Adds a child key. The caller must ensure the name is not taken.
    pub fn add_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            name: name.to_owned(),
            parent: Some(parent.0),
            children: Vec::new(),
            values: Vec::new(),
            timestamp: 0,
            deleted: false,
        });
        self.nodes[parent.0].children.push(id);
        NodeId(id)
    }

    /// Deletes a key and, recursively, everything below it.
    pub fn delete_key(&mut self, node: NodeId) {
        let mut queue = VecDeque::from([node.0]);
        while let Some(idx) = queue.pop_front() {
            self.nodes[idx].deleted = true;
            queue.extend(self.nodes[idx].children.iter().copied());
        }
    }

    /// Returns all values of a key as `(name, value)` pairs.
    pub fn values(&self, node: NodeId) -> &[(String, RegValue)] {
        &self.nodes[node.0].values
    }

    /// Looks up a value by name, case-insensitively.
    pub fn value(&self, node: NodeId, name: &str) -> Option<&RegValue> {
        self.nodes[node.0]
            .values
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Sets (or replaces) a value on a key.
    pub fn set_value(&mut self, node: NodeId, name: &str, value: RegValue) {
        let values = &mut self.nodes[node.0].values;
        if let Some(slot) = values.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            slot.1 = value;
        } else {
            values.push((name.to_owned(), value));
        }
    }

    /// Removes a value by name. Returns `true` if it existed.
    pub fn delete_value(&mut self, node: NodeId, name: &str) -> bool {
        let values = &mut self.nodes[node.0].values;
        let before = values.len();
        values.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        values.len() != before
    }

    /// Embedded file name from the base block.
    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub(crate) fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn sequence(&self) -> u32 {
        self.sequence
    }

    pub(crate) fn from_parts(nodes: Vec<Node>, filename: String, sequence: u32) -> Self {
        Self {
            nodes,
            filename,
            sequence,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers_create_and_find_keys() {
        let mut hive = Hive::create("SOFTWARE");
        let deep = hive.ensure_path(r"Microsoft\Windows\CurrentVersion").unwrap();
        hive.set_value(deep, "DevicePath", RegValue::expand_sz("%SystemRoot%\\inf"));

        // ensure_path is idempotent.
        let again = hive.ensure_path(r"Microsoft\Windows\CurrentVersion").unwrap();
        assert_eq!(deep, again);

        // Lookups are case-insensitive.
        let found = hive.lookup(hive.root(), r"microsoft\WINDOWS\currentversion").unwrap();
        assert_eq!(found, deep);
        assert!(hive.value(found, "devicepath").is_some());
    }

    #[test]
    fn delete_key_removes_subtree() {
        let mut hive = Hive::create("SYSTEM");
        hive.ensure_path(r"Services\prl_strg\Parameters").unwrap();
        let svc = hive.lookup(hive.root(), r"Services\prl_strg").unwrap();
        hive.delete_key(svc);

        let services = hive.lookup(hive.root(), "Services").unwrap();
        assert!(hive.child(services, "prl_strg").is_none());
        assert!(hive.lookup(hive.root(), r"Services\prl_strg\Parameters").is_err());
    }

    #[test]
    fn set_value_replaces_case_insensitively() {
        let mut hive = Hive::create("SYSTEM");
        let key = hive.ensure_path("CrashControl").unwrap();
        hive.set_value(key, "AutoReboot", RegValue::dword(1));
        hive.set_value(key, "autoreboot", RegValue::dword(0));
        assert_eq!(hive.values(key).len(), 1);
        assert_eq!(hive.value(key, "AutoReboot").unwrap().as_dword(), Some(0));
    }
}
