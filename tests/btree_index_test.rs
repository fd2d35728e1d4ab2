use anyhow::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use rookdb::common::EngineConfig;
use rookdb::common::types::Rid;
use rookdb::{BTreeError, BTreeIndex};
use std::sync::Arc;

mod common;
use common::{create_test_buffer_pool, create_test_tree};

fn rid(n: i64) -> Rid {
    Rid::new(n as u32, 0)
}

fn collect_keys(tree: &BTreeIndex<i64>) -> Result<Vec<i64>> {
    let mut keys = Vec::new();
    for entry in tree.iter()? {
        keys.push(entry?.0);
    }
    Ok(keys)
}

#[test]
fn test_insert_and_lookup() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;

    assert!(tree.is_empty());
    tree.insert(7, rid(7))?;
    assert!(!tree.is_empty());

    assert_eq!(tree.get_value(&7)?, Some(rid(7)));
    assert_eq!(tree.get_value(&8)?, None);

    Ok(())
}

#[test]
fn test_duplicate_key_rejected() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;

    tree.insert(1, rid(1))?;
    match tree.insert(1, rid(99)) {
        Err(BTreeError::DuplicateKey) => {}
        other => panic!("expected DuplicateKey, got {:?}", other.err()),
    }
    // The original mapping is untouched.
    assert_eq!(tree.get_value(&1)?, Some(rid(1)));

    Ok(())
}

#[test]
fn test_leaf_split_promotes_middle_key() -> Result<()> {
    // leaf_max = internal_max = 4; inserting 1..=5 splits the first leaf
    // into {1,2} and {3,4,5} under a fresh root.
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;

    for k in 1..=5 {
        tree.insert(k, rid(k))?;
    }

    assert_eq!(tree.height()?, 2);
    assert_eq!(collect_keys(&tree)?, vec![1, 2, 3, 4, 5]);
    assert_eq!(tree.get_value(&3)?, Some(rid(3)));
    tree.check_integrity()?;

    Ok(())
}

#[test]
fn test_remove_borrows_from_right_sibling() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;
    for k in 1..=5 {
        tree.insert(k, rid(k))?;
    }

    // {1,2} | {3,4,5} -> removing 1 underflows the left leaf, which borrows
    // key 3; no collapse happens.
    tree.remove(&1)?;
    assert_eq!(tree.height()?, 2);
    assert_eq!(collect_keys(&tree)?, vec![2, 3, 4, 5]);
    assert_eq!(tree.get_value(&3)?, Some(rid(3)));
    tree.check_integrity()?;

    Ok(())
}

#[test]
fn test_remove_merges_and_collapses_root() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;
    for k in 1..=5 {
        tree.insert(k, rid(k))?;
    }

    // After borrowing ({2,3} | {4,5}), removing 2 forces a merge back into
    // a single leaf and the root collapses.
    tree.remove(&1)?;
    tree.remove(&2)?;

    assert_eq!(tree.height()?, 1);
    assert_eq!(collect_keys(&tree)?, vec![3, 4, 5]);
    tree.check_integrity()?;

    Ok(())
}

#[test]
fn test_remove_absent_key_is_noop() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;
    for k in [1, 3, 5] {
        tree.insert(k, rid(k))?;
    }

    tree.remove(&2)?;
    tree.remove(&99)?;
    assert_eq!(collect_keys(&tree)?, vec![1, 3, 5]);

    // Removing from an empty tree is also fine.
    let (empty, _pool2, _file2) = create_test_tree(16, 4, 4)?;
    empty.remove(&1)?;
    assert!(empty.is_empty());

    Ok(())
}

#[test]
fn test_tree_empties_and_regrows() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;

    for k in 1..=9 {
        tree.insert(k, rid(k))?;
    }
    for k in 1..=9 {
        tree.remove(&k)?;
    }
    assert!(tree.is_empty());
    assert_eq!(tree.height()?, 0);
    assert_eq!(tree.get_value(&5)?, None);

    // The tree keeps working after being emptied.
    tree.insert(42, rid(42))?;
    assert_eq!(tree.get_value(&42)?, Some(rid(42)));
    assert_eq!(tree.height()?, 1);

    Ok(())
}

#[test]
fn test_random_permutation_insert_remove() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(64, 6, 6)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5EED);

    let mut keys: Vec<i64> = (0..500).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.insert(k, rid(k))?;
    }

    tree.check_integrity()?;
    assert_eq!(tree.count()?, 500);
    assert_eq!(collect_keys(&tree)?, (0..500).collect::<Vec<_>>());

    // Remove in a different random order; spot-check integrity as the tree
    // shrinks through merges and root collapses.
    keys.shuffle(&mut rng);
    for (i, &k) in keys.iter().enumerate() {
        tree.remove(&k)?;
        if i % 97 == 0 {
            tree.check_integrity()?;
        }
    }

    assert!(tree.is_empty());
    tree.check_integrity()?;

    Ok(())
}

#[test]
fn test_iterator_walks_leaf_chain_in_order() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(32, 4, 4)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);

    let mut keys: Vec<i64> = (0..100).map(|i| i * 3).collect();
    keys.shuffle(&mut rng);
    for &k in &keys {
        tree.insert(k, rid(k))?;
    }

    let collected = collect_keys(&tree)?;
    assert_eq!(collected, (0..100).map(|i| i * 3).collect::<Vec<_>>());

    Ok(())
}

#[test]
fn test_iter_from_positions_at_key() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(32, 4, 4)?;
    for k in (0..50).map(|i| i * 2) {
        tree.insert(k, rid(k))?;
    }

    let mut iter = tree.iter_from(&40)?;
    let (first, value) = iter.next().unwrap()?;
    assert_eq!(first, 40);
    assert_eq!(value, rid(40));
    let rest: Vec<i64> = iter.map(|e| e.unwrap().0).collect();
    assert_eq!(rest, (21..50).map(|i| i * 2).collect::<Vec<_>>());

    // An absent key yields the end iterator.
    let mut missing = tree.iter_from(&41)?;
    assert!(missing.is_end());
    assert!(missing.next().is_none());

    Ok(())
}

#[test]
fn test_iterator_on_empty_tree() -> Result<()> {
    let (tree, _pool, _file) = create_test_tree(16, 4, 4)?;
    assert!(tree.iter()?.next().is_none());
    assert!(tree.iter_from(&5)?.next().is_none());
    Ok(())
}

#[test]
fn test_reopen_preserves_tree() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(32)?;
    let config = EngineConfig {
        leaf_max_size: 4,
        internal_max_size: 4,
        ..EngineConfig::default()
    };

    let header_page_id;
    {
        let tree = BTreeIndex::<i64>::create(Arc::clone(&buffer_pool), &config)?;
        header_page_id = tree.header_page_id();
        for k in 1..=20 {
            tree.insert(k, rid(k))?;
        }
    }

    let reopened = BTreeIndex::<i64>::open(Arc::clone(&buffer_pool), header_page_id, &config)?;
    assert_eq!(reopened.count()?, 20);
    assert_eq!(reopened.get_value(&13)?, Some(rid(13)));
    reopened.check_integrity()?;

    Ok(())
}

#[test]
fn test_string_keys() -> Result<()> {
    let (buffer_pool, _file) = create_test_buffer_pool(32)?;
    let config = EngineConfig {
        leaf_max_size: 4,
        internal_max_size: 4,
        ..EngineConfig::default()
    };
    let tree = BTreeIndex::<String>::create(buffer_pool, &config)?;

    let words = [
        "pelican", "auk", "tern", "skua", "gannet", "fulmar", "shag", "gull",
    ];
    for (i, w) in words.iter().enumerate() {
        tree.insert(w.to_string(), Rid::new(i as u32 + 1, 0))?;
    }

    assert_eq!(tree.get_value(&"skua".to_string())?, Some(Rid::new(4, 0)));
    assert_eq!(tree.get_value(&"albatross".to_string())?, None);

    let mut sorted: Vec<String> = words.iter().map(|w| w.to_string()).collect();
    sorted.sort();
    let collected: Vec<String> = tree.iter()?.map(|e| e.unwrap().0).collect();
    assert_eq!(collected, sorted);
    tree.check_integrity()?;

    Ok(())
}

#[test]
fn test_deep_tree_with_internal_splits() -> Result<()> {
    // Small fanout forces several levels of internal splits.
    let (tree, _pool, _file) = create_test_tree(64, 3, 3)?;

    for k in 0..200 {
        tree.insert(k, rid(k))?;
    }
    assert!(tree.height()? >= 4);
    tree.check_integrity()?;
    assert_eq!(collect_keys(&tree)?, (0..200).collect::<Vec<_>>());

    for k in (0..200).rev() {
        tree.remove(&k)?;
    }
    assert!(tree.is_empty());

    Ok(())
}
