// src/trie.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::trace;

use crate::crypto::sha512_half;
use crate::store::{NodeKind, NodeStore, StoreError, StoredNode};
use crate::types::{Hash, ZERO_HASH};

/// 32-byte keys are consumed one nibble per level.
pub const KEY_NIBBLES: usize = 64;

const INNER_ENCODED_LEN: usize = 16 * 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrieError {
    /// A node referenced by hash is absent from the durable store.
    MissingNode(Hash),
    /// Stored bytes do not decode, or decode to a different hash.
    CorruptNode(Hash),
    /// Descent ran past the last nibble of the key.
    KeyExhausted,
    Store(StoreError),
}

impl fmt::Display for TrieError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrieError::MissingNode(h) => write!(f, "missing node {}", hex::encode(h)),
            TrieError::CorruptNode(h) => write!(f, "corrupt node {}", hex::encode(h)),
            TrieError::KeyExhausted => write!(f, "key exhausted during descent"),
            TrieError::Store(e) => write!(f, "store: {}", e),
        }
    }
}

impl std::error::Error for TrieError {}

impl From<StoreError> for TrieError {
    fn from(e: StoreError) -> Self {
        TrieError::Store(e)
    }
}

/// One of the 16 child positions of an inner node. A child known only
/// by hash stays unloaded until a descent needs it.
#[derive(Debug, Clone)]
enum Slot {
    Empty,
    Unloaded(Hash),
    Loaded(Arc<Node>),
}

/// Nodes are immutable once built; mutation path-copies root to leaf,
/// which is what lets a child ledger share its parent's account trie
/// without deep-copying it. The hash cache fills at most once per node.
#[derive(Debug)]
enum Node {
    Inner {
        children: Box<[Slot; 16]>,
        hash: OnceLock<Hash>,
    },
    Leaf {
        key: Hash,
        value: Vec<u8>,
        hash: OnceLock<Hash>,
    },
}

impl Node {
    fn leaf(key: Hash, value: Vec<u8>) -> Self {
        Node::Leaf { key, value, hash: OnceLock::new() }
    }

    fn inner(children: Box<[Slot; 16]>) -> Self {
        Node::Inner { children, hash: OnceLock::new() }
    }
}

fn empty_children() -> Box<[Slot; 16]> {
    Box::new(std::array::from_fn(|_| Slot::Empty))
}

fn nibble(key: &Hash, depth: usize) -> usize {
    let byte = key[depth / 2];
    if depth % 2 == 0 {
        (byte >> 4) as usize
    } else {
        (byte & 0x0f) as usize
    }
}

/// Leaf: H(key || value). Inner: H(h0 || .. || h15), zero hash for an
/// empty slot. No I/O: unloaded children hash to their inline hash.
fn node_hash(node: &Node) -> Hash {
    match node {
        Node::Leaf { key, value, hash } => *hash.get_or_init(|| {
            let mut buf = Vec::with_capacity(32 + value.len());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
            sha512_half(&buf)
        }),
        Node::Inner { children, hash } => *hash.get_or_init(|| {
            let mut buf = Vec::with_capacity(INNER_ENCODED_LEN);
            for child in children.iter() {
                buf.extend_from_slice(&slot_hash(child));
            }
            sha512_half(&buf)
        }),
    }
}

fn slot_hash(slot: &Slot) -> Hash {
    match slot {
        Slot::Empty => ZERO_HASH,
        Slot::Unloaded(h) => *h,
        Slot::Loaded(node) => node_hash(node),
    }
}

/// Canonical store encoding; the hash preimage of a node is exactly its
/// encoding, so stored bytes re-hash to their own key.
fn encode_node(node: &Node) -> Vec<u8> {
    match node {
        Node::Leaf { key, value, .. } => {
            let mut buf = Vec::with_capacity(32 + value.len());
            buf.extend_from_slice(key);
            buf.extend_from_slice(value);
            buf
        }
        Node::Inner { children, .. } => {
            let mut buf = Vec::with_capacity(INNER_ENCODED_LEN);
            for child in children.iter() {
                buf.extend_from_slice(&slot_hash(child));
            }
            buf
        }
    }
}

fn decode_node(hash: &Hash, stored: &StoredNode) -> Result<Node, TrieError> {
    let node = if stored.leaf {
        if stored.bytes.len() < 32 {
            return Err(TrieError::CorruptNode(*hash));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&stored.bytes[..32]);
        Node::leaf(key, stored.bytes[32..].to_vec())
    } else {
        if stored.bytes.len() != INNER_ENCODED_LEN {
            return Err(TrieError::CorruptNode(*hash));
        }
        let mut children = empty_children();
        for (i, chunk) in stored.bytes.chunks_exact(32).enumerate() {
            let child_hash: Hash = chunk.try_into().unwrap();
            if child_hash != ZERO_HASH {
                children[i] = Slot::Unloaded(child_hash);
            }
        }
        Node::inner(children)
    };
    if node_hash(&node) != *hash {
        return Err(TrieError::CorruptNode(*hash));
    }
    Ok(node)
}

struct TrieInner {
    root: Slot,
    /// Fault-in cache: nodes paged from the store, keyed by their hash.
    loaded: HashMap<Hash, Arc<Node>>,
}

/// Descent context over one locked trie.
struct Ctx<'a> {
    store: &'a dyn NodeStore,
    kind: NodeKind,
    loaded: &'a mut HashMap<Hash, Arc<Node>>,
}

impl Ctx<'_> {
    fn resolve(&mut self, slot: &Slot) -> Result<Option<Arc<Node>>, TrieError> {
        match slot {
            Slot::Empty => Ok(None),
            Slot::Loaded(node) => Ok(Some(node.clone())),
            Slot::Unloaded(h) => {
                if let Some(node) = self.loaded.get(h) {
                    return Ok(Some(node.clone()));
                }
                let stored = self.store.fetch_node(h)?.ok_or(TrieError::MissingNode(*h))?;
                let node = Arc::new(decode_node(h, &stored)?);
                self.loaded.insert(*h, node.clone());
                trace!(hash = %hex::encode(h), "faulted trie node in");
                Ok(Some(node))
            }
        }
    }

    fn peek(&mut self, slot: &Slot, key: &Hash, depth: usize) -> Result<Option<Vec<u8>>, TrieError> {
        let node = match self.resolve(slot)? {
            None => return Ok(None),
            Some(node) => node,
        };
        match &*node {
            Node::Leaf { key: k, value, .. } => Ok((k == key).then(|| value.clone())),
            Node::Inner { children, .. } => {
                if depth >= KEY_NIBBLES {
                    return Err(TrieError::KeyExhausted);
                }
                self.peek(&children[nibble(key, depth)], key, depth + 1)
            }
        }
    }

    /// Returns the replacement slot, or None if the key already exists.
    fn insert(&mut self, slot: &Slot, key: &Hash, value: &[u8], depth: usize) -> Result<Option<Slot>, TrieError> {
        let node = match self.resolve(slot)? {
            None => return Ok(Some(Slot::Loaded(Arc::new(Node::leaf(*key, value.to_vec()))))),
            Some(node) => node,
        };
        match &*node {
            Node::Leaf { key: existing, .. } => {
                if existing == key {
                    return Ok(None);
                }
                Ok(Some(split_leaf(node.clone(), *existing, key, value, depth)?))
            }
            Node::Inner { children, .. } => {
                if depth >= KEY_NIBBLES {
                    return Err(TrieError::KeyExhausted);
                }
                let idx = nibble(key, depth);
                match self.insert(&children[idx], key, value, depth + 1)? {
                    None => Ok(None),
                    Some(new_child) => {
                        let mut children = children.clone();
                        children[idx] = new_child;
                        Ok(Some(Slot::Loaded(Arc::new(Node::inner(children)))))
                    }
                }
            }
        }
    }

    /// Returns the replacement slot, or None if the key is absent.
    fn update(&mut self, slot: &Slot, key: &Hash, value: &[u8], depth: usize) -> Result<Option<Slot>, TrieError> {
        let node = match self.resolve(slot)? {
            None => return Ok(None),
            Some(node) => node,
        };
        match &*node {
            Node::Leaf { key: existing, .. } => {
                if existing == key {
                    Ok(Some(Slot::Loaded(Arc::new(Node::leaf(*key, value.to_vec())))))
                } else {
                    Ok(None)
                }
            }
            Node::Inner { children, .. } => {
                if depth >= KEY_NIBBLES {
                    return Err(TrieError::KeyExhausted);
                }
                let idx = nibble(key, depth);
                match self.update(&children[idx], key, value, depth + 1)? {
                    None => Ok(None),
                    Some(new_child) => {
                        let mut children = children.clone();
                        children[idx] = new_child;
                        Ok(Some(Slot::Loaded(Arc::new(Node::inner(children)))))
                    }
                }
            }
        }
    }

    /// Returns the replacement slot, or None if the key is absent.
    fn remove(&mut self, slot: &Slot, key: &Hash, depth: usize) -> Result<Option<Slot>, TrieError> {
        let node = match self.resolve(slot)? {
            None => return Ok(None),
            Some(node) => node,
        };
        match &*node {
            Node::Leaf { key: existing, .. } => {
                if existing == key {
                    Ok(Some(Slot::Empty))
                } else {
                    Ok(None)
                }
            }
            Node::Inner { children, .. } => {
                if depth >= KEY_NIBBLES {
                    return Err(TrieError::KeyExhausted);
                }
                let idx = nibble(key, depth);
                let new_child = match self.remove(&children[idx], key, depth + 1)? {
                    None => return Ok(None),
                    Some(slot) => slot,
                };
                let mut children = children.clone();
                children[idx] = new_child;

                let live: Vec<usize> = children
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !matches!(s, Slot::Empty))
                    .map(|(i, _)| i)
                    .collect();
                if live.is_empty() {
                    return Ok(Some(Slot::Empty));
                }
                // canonical form: a lone leaf child floats up over its parent
                if live.len() == 1 {
                    let only = children[live[0]].clone();
                    if let Some(child) = self.resolve(&only)? {
                        if matches!(&*child, Node::Leaf { .. }) {
                            return Ok(Some(Slot::Loaded(child)));
                        }
                    }
                }
                Ok(Some(Slot::Loaded(Arc::new(Node::inner(children)))))
            }
        }
    }

    /// Post-order flush of nodes the store does not yet contain. A
    /// stored inner node implies a stored subtree, because children are
    /// always written before their parent. Returns true while dirty
    /// nodes remain beyond the batch budget.
    fn flush(&mut self, slot: &Slot, ledger_seq: u32, limit: usize, written: &mut usize) -> Result<bool, TrieError> {
        let node = match slot {
            Slot::Empty | Slot::Unloaded(_) => return Ok(false),
            Slot::Loaded(node) => node.clone(),
        };
        let hash = node_hash(&node);
        if self.store.contains_node(&hash)? {
            return Ok(false);
        }
        if let Node::Inner { children, .. } = &*node {
            for child in children.iter() {
                if self.flush(child, ledger_seq, limit, written)? {
                    return Ok(true);
                }
            }
        }
        if *written == limit {
            return Ok(true);
        }
        let leaf = matches!(&*node, Node::Leaf { .. });
        self.store.store_node(
            hash,
            StoredNode {
                kind: self.kind,
                leaf,
                ledger_seq,
                bytes: encode_node(&node),
            },
        )?;
        *written += 1;
        Ok(false)
    }
}

fn split_leaf(existing: Arc<Node>, existing_key: Hash, key: &Hash, value: &[u8], depth: usize) -> Result<Slot, TrieError> {
    let mut split = depth;
    while split < KEY_NIBBLES && nibble(&existing_key, split) == nibble(key, split) {
        split += 1;
    }
    if split == KEY_NIBBLES {
        return Err(TrieError::KeyExhausted);
    }

    let mut children = empty_children();
    children[nibble(&existing_key, split)] = Slot::Loaded(existing);
    children[nibble(key, split)] = Slot::Loaded(Arc::new(Node::leaf(*key, value.to_vec())));
    let mut slot = Slot::Loaded(Arc::new(Node::inner(children)));

    // wrap the divergence point back up to the insertion depth
    let mut d = split;
    while d > depth {
        d -= 1;
        let mut children = empty_children();
        children[nibble(key, d)] = slot;
        slot = Slot::Loaded(Arc::new(Node::inner(children)));
    }
    Ok(slot)
}

/// Copy-on-write Merkle trie over 256-bit keys. Every public operation
/// holds the trie's own mutex for the duration of the call; ordering
/// across tries is the caller's concern.
pub struct StateTrie {
    kind: NodeKind,
    store: Arc<dyn NodeStore>,
    inner: Mutex<TrieInner>,
}

impl StateTrie {
    pub fn empty(kind: NodeKind, store: Arc<dyn NodeStore>) -> Self {
        Self {
            kind,
            store,
            inner: Mutex::new(TrieInner { root: Slot::Empty, loaded: HashMap::new() }),
        }
    }

    /// Attach to a persisted root. Nodes page in lazily as descents
    /// reach them; an all-zero root is the empty trie.
    pub fn from_root(kind: NodeKind, store: Arc<dyn NodeStore>, root: Hash) -> Self {
        let root = if root == ZERO_HASH { Slot::Empty } else { Slot::Unloaded(root) };
        Self {
            kind,
            store,
            inner: Mutex::new(TrieInner { root, loaded: HashMap::new() }),
        }
    }

    /// Structural share for a successor ledger: same root reference,
    /// mutations in either trie copy their own path.
    pub fn fork(&self) -> Self {
        let inner = self.inner.lock().unwrap();
        Self {
            kind: self.kind,
            store: self.store.clone(),
            inner: Mutex::new(TrieInner { root: inner.root.clone(), loaded: inner.loaded.clone() }),
        }
    }

    pub fn peek(&self, key: &Hash) -> Result<Option<Vec<u8>>, TrieError> {
        let mut inner = self.inner.lock().unwrap();
        let TrieInner { root, loaded } = &mut *inner;
        let root = root.clone();
        let mut ctx = Ctx { store: self.store.as_ref(), kind: self.kind, loaded };
        ctx.peek(&root, key, 0)
    }

    /// Insert only if the key is absent; false if it was present.
    pub fn insert(&self, key: &Hash, value: &[u8]) -> Result<bool, TrieError> {
        let mut inner = self.inner.lock().unwrap();
        let TrieInner { root, loaded } = &mut *inner;
        let mut ctx = Ctx { store: self.store.as_ref(), kind: self.kind, loaded };
        match ctx.insert(root, key, value, 0)? {
            Some(new_root) => {
                *root = new_root;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace only if the key is present; false if it was absent.
    pub fn update(&self, key: &Hash, value: &[u8]) -> Result<bool, TrieError> {
        let mut inner = self.inner.lock().unwrap();
        let TrieInner { root, loaded } = &mut *inner;
        let mut ctx = Ctx { store: self.store.as_ref(), kind: self.kind, loaded };
        match ctx.update(root, key, value, 0)? {
            Some(new_root) => {
                *root = new_root;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove(&self, key: &Hash) -> Result<bool, TrieError> {
        let mut inner = self.inner.lock().unwrap();
        let TrieInner { root, loaded } = &mut *inner;
        let mut ctx = Ctx { store: self.store.as_ref(), kind: self.kind, loaded };
        match ctx.remove(root, key, 0)? {
            Some(new_root) => {
                *root = new_root;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Deterministic hash over the full contents; all zeros when empty.
    pub fn root_hash(&self) -> Hash {
        let inner = self.inner.lock().unwrap();
        slot_hash(&inner.root)
    }

    /// Persist up to `limit` dirty nodes tagged with this trie's kind
    /// and `ledger_seq`; true while more dirty nodes remain. Call
    /// repeatedly until false.
    pub fn flush_dirty(&self, limit: usize, ledger_seq: u32) -> Result<bool, TrieError> {
        let mut inner = self.inner.lock().unwrap();
        let TrieInner { root, loaded } = &mut *inner;
        let root = root.clone();
        let mut ctx = Ctx { store: self.store.as_ref(), kind: self.kind, loaded };
        let mut written = 0;
        ctx.flush(&root, ledger_seq, limit, &mut written)
    }
}
