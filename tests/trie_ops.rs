use std::sync::Arc;

use ledger_core::store::{MemStore, NodeKind};
use ledger_core::trie::StateTrie;
use ledger_core::types::{Hash, ZERO_HASH};

fn key(fill: u8, last: u8) -> Hash {
    let mut k = [fill; 32];
    k[31] = last;
    k
}

fn fresh_trie() -> StateTrie {
    StateTrie::empty(NodeKind::Account, Arc::new(MemStore::new()))
}

#[test]
fn empty_trie_has_zero_root() {
    assert_eq!(fresh_trie().root_hash(), ZERO_HASH);
}

#[test]
fn single_leaf_floats_to_the_root() {
    let trie = fresh_trie();
    trie.insert(&key(0xab, 1), b"v1").unwrap();
    assert_eq!(trie.peek(&key(0xab, 1)).unwrap().as_deref(), Some(&b"v1"[..]));
    assert_eq!(trie.peek(&key(0xab, 2)).unwrap(), None);
}

#[test]
fn root_is_independent_of_insertion_order() {
    // includes keys that diverge at the first nibble and keys that
    // share a long prefix and diverge only in the last byte
    let entries: Vec<(Hash, Vec<u8>)> = vec![
        (key(0x11, 0), b"a".to_vec()),
        (key(0x11, 1), b"b".to_vec()),
        (key(0x11, 2), b"c".to_vec()),
        (key(0x22, 0), b"d".to_vec()),
        (key(0xfe, 9), b"e".to_vec()),
    ];

    let forward = fresh_trie();
    for (k, v) in &entries {
        assert!(forward.insert(k, v).unwrap());
    }

    let backward = fresh_trie();
    for (k, v) in entries.iter().rev() {
        assert!(backward.insert(k, v).unwrap());
    }

    assert_eq!(forward.root_hash(), backward.root_hash());
    assert_ne!(forward.root_hash(), ZERO_HASH);
}

#[test]
fn insert_rejects_present_update_rejects_absent() {
    let trie = fresh_trie();
    assert!(trie.insert(&key(1, 1), b"one").unwrap());
    assert!(!trie.insert(&key(1, 1), b"two").unwrap());
    assert_eq!(trie.peek(&key(1, 1)).unwrap().as_deref(), Some(&b"one"[..]));

    assert!(!trie.update(&key(1, 2), b"zzz").unwrap());
    assert!(trie.update(&key(1, 1), b"two").unwrap());
    assert_eq!(trie.peek(&key(1, 1)).unwrap().as_deref(), Some(&b"two"[..]));
}

#[test]
fn update_changes_the_root_hash() {
    let trie = fresh_trie();
    trie.insert(&key(1, 1), b"one").unwrap();
    let before = trie.root_hash();
    trie.update(&key(1, 1), b"two").unwrap();
    assert_ne!(trie.root_hash(), before);
}

#[test]
fn remove_collapses_back_to_the_smaller_trie() {
    // the two keys differ only in the final nibble, forcing a deep
    // chain of inner nodes that must fully collapse again
    let deep_a = key(0xaa, 0xa1);
    let deep_b = key(0xaa, 0xa2);

    let reference = fresh_trie();
    reference.insert(&deep_a, b"a").unwrap();
    let expected = reference.root_hash();

    let trie = fresh_trie();
    trie.insert(&deep_a, b"a").unwrap();
    trie.insert(&deep_b, b"b").unwrap();
    assert_ne!(trie.root_hash(), expected);

    assert!(trie.remove(&deep_b).unwrap());
    assert_eq!(trie.root_hash(), expected);

    assert!(!trie.remove(&deep_b).unwrap());
    assert!(trie.remove(&deep_a).unwrap());
    assert_eq!(trie.root_hash(), ZERO_HASH);
}

#[test]
fn fork_shares_structure_without_sharing_mutations() {
    let store = Arc::new(MemStore::new());
    let parent = StateTrie::empty(NodeKind::Account, store);
    parent.insert(&key(5, 0), b"p0").unwrap();
    parent.insert(&key(5, 1), b"p1").unwrap();
    let parent_root = parent.root_hash();

    let child = parent.fork();
    assert_eq!(child.root_hash(), parent_root);

    child.update(&key(5, 0), b"c0").unwrap();
    child.insert(&key(6, 0), b"c1").unwrap();

    assert_ne!(child.root_hash(), parent_root);
    assert_eq!(parent.root_hash(), parent_root);
    assert_eq!(parent.peek(&key(5, 0)).unwrap().as_deref(), Some(&b"p0"[..]));
    assert_eq!(parent.peek(&key(6, 0)).unwrap(), None);
}

#[test]
fn flush_then_lazy_reload_round_trips() {
    let store = Arc::new(MemStore::new());
    let trie = StateTrie::empty(NodeKind::Transaction, store.clone());
    for last in 0..20u8 {
        trie.insert(&key(0x3c, last), &[last; 8]).unwrap();
    }
    let root = trie.root_hash();

    // small batches force several passes before everything is clean
    let mut passes = 0;
    while trie.flush_dirty(4, 7).unwrap() {
        passes += 1;
        assert!(passes < 100, "flush did not converge");
    }
    assert!(passes > 0);
    assert!(store.node_count() > 0);

    // a second flush finds nothing dirty
    assert!(!trie.flush_dirty(4, 7).unwrap());
    let persisted = store.node_count();
    assert!(!trie.flush_dirty(4, 7).unwrap());
    assert_eq!(store.node_count(), persisted);

    let reloaded = StateTrie::from_root(NodeKind::Transaction, store, root);
    assert_eq!(reloaded.root_hash(), root);
    for last in 0..20u8 {
        assert_eq!(
            reloaded.peek(&key(0x3c, last)).unwrap().as_deref(),
            Some(&[last; 8][..])
        );
    }
}

#[test]
fn reloaded_trie_accepts_further_mutation() {
    let store = Arc::new(MemStore::new());
    let trie = StateTrie::empty(NodeKind::Account, store.clone());
    trie.insert(&key(9, 0), b"zero").unwrap();
    trie.insert(&key(9, 1), b"one").unwrap();
    while trie.flush_dirty(64, 1).unwrap() {}

    let reloaded = StateTrie::from_root(NodeKind::Account, store, trie.root_hash());
    assert!(reloaded.update(&key(9, 0), b"patched").unwrap());
    assert!(reloaded.insert(&key(9, 2), b"two").unwrap());
    assert!(reloaded.remove(&key(9, 1)).unwrap());
    assert_eq!(reloaded.peek(&key(9, 0)).unwrap().as_deref(), Some(&b"patched"[..]));

    // the original is untouched by the reloaded trie's writes
    assert_eq!(trie.peek(&key(9, 0)).unwrap().as_deref(), Some(&b"zero"[..]));
}
