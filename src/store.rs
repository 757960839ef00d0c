// src/store.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::types::Hash;

/// Which trie a stored node belongs to. Rows carry this together with
/// the ledger sequence so operators can prune node storage by ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Account,
    Transaction,
}

/// One content-addressed node row: the canonical node bytes plus tags.
/// `leaf` disambiguates the two encodings (a leaf value can be any
/// length, including the 512 bytes an inner node always occupies).
#[derive(Debug, Clone)]
pub struct StoredNode {
    pub kind: NodeKind,
    pub leaf: bool,
    pub ledger_seq: u32,
    pub bytes: Vec<u8>,
}

/// One accepted-ledger header row, unique by sequence and by hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerHeader {
    pub hash: Hash,
    pub sequence: u32,
    pub parent_hash: Hash,
    pub fee_held: u64,
    pub closing_time: u64,
    pub account_root: Hash,
    pub tx_root: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(e) => write!(f, "store backend: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Paging and persistence interface the trie consumes. Writing the same
/// hash twice must be idempotent.
pub trait NodeStore: Send + Sync {
    fn fetch_node(&self, hash: &Hash) -> Result<Option<StoredNode>, StoreError>;
    fn contains_node(&self, hash: &Hash) -> Result<bool, StoreError>;
    fn store_node(&self, hash: Hash, node: StoredNode) -> Result<(), StoreError>;
}

/// Header-row interface the ledger consumes for accept and load.
pub trait HeaderStore: Send + Sync {
    fn insert_header(&self, header: LedgerHeader) -> Result<(), StoreError>;
    fn header_by_seq(&self, seq: u32) -> Result<Option<LedgerHeader>, StoreError>;
    fn header_by_hash(&self, hash: &Hash) -> Result<Option<LedgerHeader>, StoreError>;
}

/// In-memory store backing both tries and headers. Interior locking so
/// callers share one instance behind an `Arc`.
#[derive(Default)]
pub struct MemStore {
    nodes: RwLock<HashMap<Hash, StoredNode>>,
    headers_by_seq: RwLock<HashMap<u32, LedgerHeader>>,
    headers_by_hash: RwLock<HashMap<Hash, LedgerHeader>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().unwrap().len()
    }

    pub fn header_count(&self) -> usize {
        self.headers_by_seq.read().unwrap().len()
    }
}

impl NodeStore for MemStore {
    fn fetch_node(&self, hash: &Hash) -> Result<Option<StoredNode>, StoreError> {
        Ok(self.nodes.read().unwrap().get(hash).cloned())
    }

    fn contains_node(&self, hash: &Hash) -> Result<bool, StoreError> {
        Ok(self.nodes.read().unwrap().contains_key(hash))
    }

    fn store_node(&self, hash: Hash, node: StoredNode) -> Result<(), StoreError> {
        self.nodes.write().unwrap().insert(hash, node);
        Ok(())
    }
}

impl HeaderStore for MemStore {
    fn insert_header(&self, header: LedgerHeader) -> Result<(), StoreError> {
        self.headers_by_seq
            .write()
            .unwrap()
            .insert(header.sequence, header.clone());
        self.headers_by_hash.write().unwrap().insert(header.hash, header);
        Ok(())
    }

    fn header_by_seq(&self, seq: u32) -> Result<Option<LedgerHeader>, StoreError> {
        Ok(self.headers_by_seq.read().unwrap().get(&seq).cloned())
    }

    fn header_by_hash(&self, hash: &Hash) -> Result<Option<LedgerHeader>, StoreError> {
        Ok(self.headers_by_hash.read().unwrap().get(hash).cloned())
    }
}
