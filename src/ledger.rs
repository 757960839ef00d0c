// src/ledger.rs

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::account::{account_key, AccountState};
use crate::codec::Serializer;
use crate::crypto::addr_hex;
use crate::store::{HeaderStore, LedgerHeader, NodeKind, NodeStore, StoreError};
use crate::trie::{StateTrie, TrieError};
use crate::types::{Address, Hash, Transaction, TxStatus};

/// Nodes persisted per flush call while accepting a ledger.
const FLUSH_BATCH: usize = 64;

/// Encoded header size: seq (4) + fee (8) + three hashes (96) + time (8).
const HEADER_LEN: usize = 116;

/// Outcome of applying, reversing or querying a transaction. These are
/// expected conditions returned as values; callers branch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransResult {
    Success,
    /// The transaction is already in this ledger.
    Already,
    /// Source (or destination, when auto-create is off) does not exist.
    BadAccount,
    Insufficient,
    /// Amount does not cover the fee.
    TooSmall,
    /// Source account sequence is behind the transaction's.
    PreSeq,
    /// Source account sequence is ahead of the transaction's.
    PastSeq,
    /// Transaction targets a ledger past this one.
    BadLedgerSeq,
    NotFound,
    /// Structural failure; the ledger must be considered suspect.
    Error,
}

/// Gates for behavior still being settled upstream.
#[derive(Debug, Clone, Copy)]
pub struct LedgerConfig {
    /// Create a missing destination account (balance 0, sequence 1) on
    /// first receipt instead of rejecting the transfer.
    pub auto_create_destination: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { auto_create_destination: true }
    }
}

/// Structural failures. Unlike `TransResult`, these are not expected
/// outcomes; upstream logic treats them as fatal for the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Mutation attempted on an accepted ledger.
    Frozen,
    /// Mutation or close attempted on a closed ledger.
    Closed,
    /// Accept requires a closed ledger.
    NotClosed,
    HashMismatch { stored: Hash, computed: Hash },
    CorruptAccount(Address),
    CorruptTransaction(Hash),
    Trie(TrieError),
    Store(StoreError),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Frozen => write!(f, "ledger is accepted and frozen"),
            LedgerError::Closed => write!(f, "ledger is closed"),
            LedgerError::NotClosed => write!(f, "ledger is still open"),
            LedgerError::HashMismatch { stored, computed } => write!(
                f,
                "header hash mismatch: stored {}, computed {}",
                hex::encode(stored),
                hex::encode(computed)
            ),
            LedgerError::CorruptAccount(addr) => {
                write!(f, "undecodable account state for {}", addr_hex(addr))
            }
            LedgerError::CorruptTransaction(id) => {
                write!(f, "undecodable transaction {}", hex::encode(id))
            }
            LedgerError::Trie(e) => write!(f, "trie: {}", e),
            LedgerError::Store(e) => write!(f, "store: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<TrieError> for LedgerError {
    fn from(e: TrieError) -> Self {
        LedgerError::Trie(e)
    }
}

impl From<StoreError> for LedgerError {
    fn from(e: StoreError) -> Self {
        LedgerError::Store(e)
    }
}

struct LedgerInner {
    sequence: u32,
    parent_hash: Hash,
    timestamp: u64,
    fee_held: u64,
    closed: bool,
    accepted: bool,
    /// Memoized own-hash; cleared whenever any header input changes.
    hash: Option<Hash>,
    tx_map: StateTrie,
    account_map: StateTrie,
}

impl LedgerInner {
    /// Own-hash over (seq, fee, parent, tx root, account root, time) in
    /// exactly that binary order.
    fn compute_hash(&mut self) -> Hash {
        if let Some(h) = self.hash {
            return h;
        }
        let mut s = Serializer::with_capacity(HEADER_LEN);
        s.add_u32(self.sequence);
        s.add_u64(self.fee_held);
        s.add_u256(&self.parent_hash);
        s.add_u256(&self.tx_map.root_hash());
        s.add_u256(&self.account_map.root_hash());
        s.add_u64(self.timestamp);
        let h = s.finish_digest();
        self.hash = Some(h);
        h
    }

    fn header(&mut self) -> LedgerHeader {
        LedgerHeader {
            hash: self.compute_hash(),
            sequence: self.sequence,
            parent_hash: self.parent_hash,
            fee_held: self.fee_held,
            closing_time: self.timestamp,
            account_root: self.account_map.root_hash(),
            tx_root: self.tx_map.root_hash(),
        }
    }

    fn account_state(&self, addr: &Address) -> Result<Option<AccountState>, LedgerError> {
        match self.account_map.peek(&account_key(addr))? {
            None => Ok(None),
            Some(bytes) => AccountState::decode(&bytes)
                .map(Some)
                .map_err(|_| LedgerError::CorruptAccount(*addr)),
        }
    }
}

/// One ledger version: two authenticated tries plus header metadata,
/// moving one-way through Open, Closed, Accepted. Public methods lock
/// the ledger before touching either trie; the lock order is always
/// ledger, then trie, then store.
pub struct Ledger {
    config: LedgerConfig,
    node_store: Arc<dyn NodeStore>,
    header_store: Arc<dyn HeaderStore>,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Genesis: an empty transaction trie and a single master account
    /// holding the starting amount at sequence 0.
    pub fn genesis(
        master: Address,
        start_amount: u64,
        config: LedgerConfig,
        node_store: Arc<dyn NodeStore>,
        header_store: Arc<dyn HeaderStore>,
    ) -> Result<Self, LedgerError> {
        let tx_map = StateTrie::empty(NodeKind::Transaction, node_store.clone());
        let account_map = StateTrie::empty(NodeKind::Account, node_store.clone());
        let mut state = AccountState::new();
        state.credit(start_amount);
        account_map.insert(&account_key(&master), &state.encode())?;
        Ok(Self {
            config,
            node_store,
            header_store,
            inner: Mutex::new(LedgerInner {
                sequence: 0,
                parent_hash: [0u8; 32],
                timestamp: 0,
                fee_held: 0,
                closed: false,
                accepted: false,
                hash: None,
                tx_map,
                account_map,
            }),
        })
    }

    /// Reconstruct from a stored header. The tries attach lazily
    /// against the node store; the header hash must recompute exactly.
    pub fn from_header(
        header: &LedgerHeader,
        config: LedgerConfig,
        node_store: Arc<dyn NodeStore>,
        header_store: Arc<dyn HeaderStore>,
    ) -> Result<Self, LedgerError> {
        let ledger = Self {
            config,
            node_store: node_store.clone(),
            header_store,
            inner: Mutex::new(LedgerInner {
                sequence: header.sequence,
                parent_hash: header.parent_hash,
                timestamp: header.closing_time,
                fee_held: header.fee_held,
                closed: true,
                accepted: true,
                hash: None,
                tx_map: StateTrie::from_root(NodeKind::Transaction, node_store.clone(), header.tx_root),
                account_map: StateTrie::from_root(NodeKind::Account, node_store, header.account_root),
            }),
        };
        let computed = ledger.hash();
        if computed != header.hash {
            return Err(LedgerError::HashMismatch { stored: header.hash, computed });
        }
        Ok(ledger)
    }

    pub fn load_by_seq(
        seq: u32,
        config: LedgerConfig,
        node_store: Arc<dyn NodeStore>,
        header_store: Arc<dyn HeaderStore>,
    ) -> Result<Option<Self>, LedgerError> {
        match header_store.header_by_seq(seq)? {
            None => Ok(None),
            Some(header) => Self::from_header(&header, config, node_store, header_store).map(Some),
        }
    }

    pub fn load_by_hash(
        hash: &Hash,
        config: LedgerConfig,
        node_store: Arc<dyn NodeStore>,
        header_store: Arc<dyn HeaderStore>,
    ) -> Result<Option<Self>, LedgerError> {
        match header_store.header_by_hash(hash)? {
            None => Ok(None),
            Some(header) => Self::from_header(&header, config, node_store, header_store).map(Some),
        }
    }

    /// Apply one checked transfer. On success both tries are updated,
    /// the fee moves into `fee_held` and the transaction is marked
    /// included; every other outcome leaves the header inputs alone.
    pub fn apply_transaction(&self, tx: &mut Transaction) -> TransResult {
        let mut inner = self.inner.lock().unwrap();
        match self.apply_locked(&mut inner, tx) {
            Ok(res) => res,
            Err(e) => {
                warn!(tx = %hex::encode(tx.id), error = %e, "apply failed");
                TransResult::Error
            }
        }
    }

    fn apply_locked(&self, inner: &mut LedgerInner, tx: &mut Transaction) -> Result<TransResult, LedgerError> {
        if inner.accepted {
            return Err(LedgerError::Frozen);
        }
        if inner.closed {
            return Err(LedgerError::Closed);
        }
        if tx.ledger_seq > inner.sequence {
            return Ok(TransResult::BadLedgerSeq);
        }
        if tx.amount < tx.fee {
            return Ok(TransResult::TooSmall);
        }
        if inner.tx_map.peek(&tx.id)?.is_some() {
            return Ok(TransResult::Already);
        }

        let mut from = match inner.account_state(&tx.from)? {
            Some(state) => state,
            None => return Ok(TransResult::BadAccount),
        };
        // a missing destination becomes a fresh account at sequence 1,
        // but its leaf is only written once every check has passed
        let (mut to, to_created) = match inner.account_state(&tx.to)? {
            Some(state) => (state, false),
            None => {
                if !self.config.auto_create_destination {
                    return Ok(TransResult::BadAccount);
                }
                let mut created = AccountState::new();
                created.inc_seq();
                (created, true)
            }
        };

        if from.balance < tx.amount {
            return Ok(TransResult::Insufficient);
        }
        if from.sequence > tx.from_seq {
            return Ok(TransResult::PastSeq);
        }
        if from.sequence < tx.from_seq {
            return Ok(TransResult::PreSeq);
        }

        from.charge(tx.amount);
        from.inc_seq();
        to.credit(tx.amount - tx.fee);

        if !inner.tx_map.insert(&tx.id, &tx.raw)? {
            return Ok(TransResult::Error);
        }
        if !inner.account_map.update(&account_key(&tx.from), &from.encode())? {
            return Ok(TransResult::Error);
        }
        let to_written = if to_created {
            debug!(to = %addr_hex(&tx.to), "created destination account");
            inner.account_map.insert(&account_key(&tx.to), &to.encode())?
        } else {
            inner.account_map.update(&account_key(&tx.to), &to.encode())?
        };
        if !to_written {
            return Ok(TransResult::Error);
        }

        inner.fee_held += tx.fee;
        inner.hash = None;
        tx.status = TxStatus::Included;
        Ok(TransResult::Success)
    }

    /// Precise inverse of a successful apply: credits the source back,
    /// rewinds its sequence, charges the destination and releases the
    /// fee. The transaction must still be in this ledger.
    pub fn remove_transaction(&self, tx: &mut Transaction) -> TransResult {
        let mut inner = self.inner.lock().unwrap();
        match self.remove_locked(&mut inner, tx) {
            Ok(res) => res,
            Err(e) => {
                warn!(tx = %hex::encode(tx.id), error = %e, "remove failed");
                TransResult::Error
            }
        }
    }

    fn remove_locked(&self, inner: &mut LedgerInner, tx: &mut Transaction) -> Result<TransResult, LedgerError> {
        if inner.accepted {
            return Err(LedgerError::Frozen);
        }
        if inner.closed {
            return Err(LedgerError::Closed);
        }
        if inner.tx_map.peek(&tx.id)?.is_none() {
            return Ok(TransResult::NotFound);
        }
        let mut from = match inner.account_state(&tx.from)? {
            Some(state) => state,
            None => return Ok(TransResult::BadAccount),
        };
        let mut to = match inner.account_state(&tx.to)? {
            Some(state) => state,
            None => return Ok(TransResult::BadAccount),
        };

        // reverse bound checks the full amount, fee included
        if to.balance < tx.amount {
            return Ok(TransResult::Insufficient);
        }
        if from.sequence != tx.from_seq + 1 {
            return Ok(TransResult::PastSeq);
        }

        from.credit(tx.amount);
        from.dec_seq();
        to.charge(tx.amount - tx.fee);

        if !inner.tx_map.remove(&tx.id)? {
            return Ok(TransResult::Error);
        }
        if !inner.account_map.update(&account_key(&tx.from), &from.encode())? {
            return Ok(TransResult::Error);
        }
        // an account the reversal returns to its creation state leaves
        // the ledger entirely
        if self.config.auto_create_destination && to.balance == 0 && to.sequence == 1 {
            if !inner.account_map.remove(&account_key(&tx.to))? {
                return Ok(TransResult::Error);
            }
        } else if !inner.account_map.update(&account_key(&tx.to), &to.encode())? {
            return Ok(TransResult::Error);
        }

        inner.fee_held -= tx.fee;
        inner.hash = None;
        tx.status = TxStatus::Removed;
        Ok(TransResult::Success)
    }

    pub fn has_transaction(&self, id: &Hash) -> TransResult {
        let inner = self.inner.lock().unwrap();
        match inner.tx_map.peek(id) {
            Ok(Some(_)) => TransResult::Success,
            Ok(None) => TransResult::NotFound,
            Err(e) => {
                warn!(tx = %hex::encode(id), error = %e, "membership check failed");
                TransResult::Error
            }
        }
    }

    /// Reconstruct an included transaction from its stored bytes. The
    /// status annotation comes from context: committed once the ledger
    /// is closed, included while it is still open.
    pub fn transaction(&self, id: &Hash) -> Result<Option<Transaction>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        match inner.tx_map.peek(id)? {
            None => Ok(None),
            Some(bytes) => {
                let mut tx = Transaction::decode(&bytes)
                    .map_err(|_| LedgerError::CorruptTransaction(*id))?;
                tx.status = if inner.closed || inner.accepted {
                    TxStatus::Committed
                } else {
                    TxStatus::Included
                };
                Ok(Some(tx))
            }
        }
    }

    pub fn account_state(&self, addr: &Address) -> Result<Option<AccountState>, LedgerError> {
        self.inner.lock().unwrap().account_state(addr)
    }

    /// Convenience read: absent accounts report a zero balance.
    pub fn balance(&self, addr: &Address) -> u64 {
        self.account_state(addr)
            .ok()
            .flatten()
            .map(|state| state.balance)
            .unwrap_or(0)
    }

    /// Seal this ledger and open its successor: same account trie by
    /// structural share, fresh transaction trie, sequence advanced and
    /// parent hash chained to this ledger's own hash.
    pub fn close(&self, timestamp: u64) -> Result<Ledger, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accepted {
            return Err(LedgerError::Frozen);
        }
        if inner.closed {
            return Err(LedgerError::Closed);
        }
        inner.closed = true;
        inner.hash = None;
        let parent_hash = inner.compute_hash();
        debug!(seq = inner.sequence, hash = %hex::encode(parent_hash), "ledger closed");
        Ok(Ledger {
            config: self.config,
            node_store: self.node_store.clone(),
            header_store: self.header_store.clone(),
            inner: Mutex::new(LedgerInner {
                sequence: inner.sequence + 1,
                parent_hash,
                timestamp,
                fee_held: 0,
                closed: false,
                accepted: false,
                hash: None,
                tx_map: StateTrie::empty(NodeKind::Transaction, self.node_store.clone()),
                account_map: inner.account_map.fork(),
            }),
        })
    }

    /// Persist the header row, then drain dirty nodes from both tries
    /// in bounded batches. After this the ledger is frozen.
    pub fn accept(&self) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.accepted {
            return Err(LedgerError::Frozen);
        }
        if !inner.closed {
            return Err(LedgerError::NotClosed);
        }
        let header = inner.header();
        self.header_store.insert_header(header)?;
        while inner.tx_map.flush_dirty(FLUSH_BATCH, inner.sequence)? {}
        while inner.account_map.flush_dirty(FLUSH_BATCH, inner.sequence)? {}
        inner.accepted = true;
        debug!(seq = inner.sequence, "ledger accepted");
        Ok(())
    }

    pub fn hash(&self) -> Hash {
        self.inner.lock().unwrap().compute_hash()
    }

    pub fn sequence(&self) -> u32 {
        self.inner.lock().unwrap().sequence
    }

    pub fn parent_hash(&self) -> Hash {
        self.inner.lock().unwrap().parent_hash
    }

    pub fn timestamp(&self) -> u64 {
        self.inner.lock().unwrap().timestamp
    }

    pub fn fee_held(&self) -> u64 {
        self.inner.lock().unwrap().fee_held
    }

    pub fn tx_root(&self) -> Hash {
        self.inner.lock().unwrap().tx_map.root_hash()
    }

    pub fn account_root(&self) -> Hash {
        self.inner.lock().unwrap().account_map.root_hash()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn is_accepted(&self) -> bool {
        self.inner.lock().unwrap().accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    fn stores() -> (Arc<MemStore>, Arc<dyn NodeStore>, Arc<dyn HeaderStore>) {
        let store = Arc::new(MemStore::new());
        (store.clone(), store.clone(), store)
    }

    #[test]
    fn genesis_holds_the_master_balance() {
        let (_, nodes, headers) = stores();
        let master = [1u8; 20];
        let ledger = Ledger::genesis(master, 100_000, LedgerConfig::default(), nodes, headers)
            .expect("genesis");
        assert_eq!(ledger.sequence(), 0);
        assert_eq!(ledger.balance(&master), 100_000);
        let state = ledger.account_state(&master).unwrap().unwrap();
        assert_eq!(state.sequence, 0);
        assert_eq!(ledger.balance(&[2u8; 20]), 0);
    }

    #[test]
    fn lifecycle_is_one_way() {
        let (_, nodes, headers) = stores();
        let ledger =
            Ledger::genesis([1u8; 20], 10, LedgerConfig::default(), nodes, headers).unwrap();
        assert!(matches!(ledger.accept(), Err(LedgerError::NotClosed)));
        let next = ledger.close(5).unwrap();
        assert!(ledger.is_closed());
        assert!(matches!(ledger.close(6), Err(LedgerError::Closed)));
        ledger.accept().unwrap();
        assert!(ledger.is_accepted());
        assert!(matches!(ledger.accept(), Err(LedgerError::Frozen)));

        assert_eq!(next.sequence(), 1);
        assert_eq!(next.parent_hash(), ledger.hash());
        assert_eq!(next.timestamp(), 5);
        assert_eq!(next.fee_held(), 0);
    }

    #[test]
    fn hash_covers_the_header_fields_in_order() {
        let (_, nodes, headers) = stores();
        let ledger =
            Ledger::genesis([3u8; 20], 42, LedgerConfig::default(), nodes, headers).unwrap();
        let mut s = Serializer::with_capacity(HEADER_LEN);
        s.add_u32(ledger.sequence());
        s.add_u64(ledger.fee_held());
        s.add_u256(&ledger.parent_hash());
        s.add_u256(&ledger.tx_root());
        s.add_u256(&ledger.account_root());
        s.add_u64(ledger.timestamp());
        assert_eq!(s.len(), HEADER_LEN);
        assert_eq!(ledger.hash(), s.finish_digest());
    }
}
