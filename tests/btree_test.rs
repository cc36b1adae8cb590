mod common;

use std::collections::BTreeMap;

use bit_vec::BitVec;
use rand::{rngs::StdRng, Rng, SeedableRng};
use strata_db::{
    btree::BtreeFile, FileId, OpenMode, Progress, StorageError, Transaction,
    VerifyTreatment, UNDEFINED_PAGE_ID,
};

fn open_tree(dir: &std::path::Path) -> (BtreeFile, Transaction) {
    let tx = Transaction::new();
    let mut tree = BtreeFile::new(FileId::new(dir.join("tree"))).unwrap();
    tree.create(&tx).unwrap();
    tree.open(&tx, OpenMode::Update).unwrap();
    (tree, tx)
}

/// Collect (count per leaf, all keys in chain order).
fn walk_leaves(tree: &BtreeFile, tx: &Transaction) -> (Vec<usize>, Vec<u32>) {
    let mut counts = Vec::new();
    let mut keys = Vec::new();
    let mut page_id = tree.get_next_leaf_page_id(tx, 0).unwrap();
    while page_id != UNDEFINED_PAGE_ID {
        let data = tree.get_page_data(tx, page_id).unwrap();
        counts.push(data.len());
        keys.extend(data.iter().map(|(k, _)| *k));
        page_id = tree.get_next_leaf_page_id(tx, page_id).unwrap();
    }
    (counts, keys)
}

#[test]
fn test_insert_until_split() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    // 4 KB pages hold 340 entries after the page header
    assert_eq!(tree.get_count_per_page(), 340);

    // the first 340 inserts stay on a single leaf
    for k in 1..=340u32 {
        tree.insert(&tx, k, (k, 0)).unwrap();
    }
    let (counts, _) = walk_leaves(&tree, &tx);
    assert_eq!(counts, vec![340]);

    // the 341st forces a new root and an even redistribution
    tree.insert(&tx, 341, (341, 0)).unwrap();
    let (counts, keys) = walk_leaves(&tree, &tx);
    assert_eq!(counts.len(), 2);
    assert!(counts.iter().all(|c| *c >= 170));
    assert_eq!(keys, (1..=341).collect::<Vec<u32>>());

    assert_eq!(tree.get_count(&tx).unwrap(), 341);
    assert_eq!(tree.get(&tx, 170).unwrap(), Some((170, 0)));
    assert_eq!(tree.get(&tx, 341).unwrap(), Some((341, 0)));
    assert_eq!(tree.get(&tx, 342).unwrap(), None);
}

#[test]
fn test_duplicate_key_raises() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    tree.insert(&tx, 10, (1, 0)).unwrap();
    match tree.insert(&tx, 10, (2, 0)) {
        Err(StorageError::UniquenessViolation(10)) => {}
        other => panic!("expected UniquenessViolation, got {:?}", other.err()),
    }
    // the first value survives
    assert_eq!(tree.get(&tx, 10).unwrap(), Some((1, 0)));
    assert_eq!(tree.get_count(&tx).unwrap(), 1);
}

#[test]
fn test_expunge_keeps_pages_half_full() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    for k in 1..=1000u32 {
        tree.insert(&tx, k, (k, k % 7)).unwrap();
    }
    // removing every third key triggers redistributes and merges
    for k in (1..=1000u32).filter(|k| k % 3 == 0) {
        tree.expunge(&tx, k).unwrap();
    }
    assert_eq!(tree.get_count(&tx).unwrap(), 667);

    let mut progress = Progress::new();
    tree.verify(&tx, VerifyTreatment::Continue, &mut progress)
        .unwrap();
    assert!(
        progress.is_consistent(),
        "verify found: {:?}",
        progress.get_inconsistencies()
    );

    for k in 1..=1000u32 {
        let expected = if k % 3 == 0 { None } else { Some((k, k % 7)) };
        assert_eq!(tree.get(&tx, k).unwrap(), expected, "key {}", k);
    }
}

#[test]
fn test_expunge_all_collapses_root() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    for k in 0..900u32 {
        tree.insert(&tx, k, (k, 0)).unwrap();
    }
    for k in 0..900u32 {
        tree.expunge(&tx, k).unwrap();
    }

    assert_eq!(tree.get_count(&tx).unwrap(), 0);
    assert_eq!(
        tree.get_next_leaf_page_id(&tx, 0).unwrap(),
        UNDEFINED_PAGE_ID
    );
    assert_eq!(tree.get(&tx, 5).unwrap(), None);

    // the emptied tree accepts inserts again
    tree.insert(&tx, 42, (7, 3)).unwrap();
    assert_eq!(tree.get(&tx, 42).unwrap(), Some((7, 3)));
}

#[test]
fn test_expunge_missing_key_is_bad_argument() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    tree.insert(&tx, 1, (1, 0)).unwrap();
    match tree.expunge(&tx, 2) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
    assert_eq!(tree.get_count(&tx).unwrap(), 1);
}

#[test]
fn test_get_all_sets_one_bit_per_key() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    let keys = [3u32, 17, 256, 511, 900];
    for k in keys {
        tree.insert(&tx, k, (k, 0)).unwrap();
    }

    let mut bits = BitVec::new();
    tree.get_all(&tx, &mut bits).unwrap();
    for k in 0..1024usize {
        let expected = keys.contains(&(k as u32));
        assert_eq!(bits.get(k).unwrap_or(false), expected, "bit {}", k);
    }
}

#[test]
fn test_reopen_after_close() {
    let dir = common::setup();
    let path = dir.path().join("tree");
    let tx = Transaction::new();

    let mut tree = BtreeFile::new(FileId::new(&path)).unwrap();
    tree.create(&tx).unwrap();
    tree.open(&tx, OpenMode::Update).unwrap();
    for k in 1..=600u32 {
        tree.insert(&tx, k, (k * 2, 1)).unwrap();
    }
    tree.close(&tx).unwrap();
    drop(tree);

    let tx = Transaction::new();
    let mut tree = BtreeFile::new(FileId::new(&path)).unwrap();
    tree.open(&tx, OpenMode::Read).unwrap();
    assert_eq!(tree.get_count(&tx).unwrap(), 600);
    for k in 1..=600u32 {
        assert_eq!(tree.get(&tx, k).unwrap(), Some((k * 2, 1)));
    }
    tree.close(&tx).unwrap();
}

#[test]
fn test_random_workload_against_reference() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut reference: BTreeMap<u32, (u32, u32)> = BTreeMap::new();

    for _ in 0..4000 {
        let key = rng.gen_range(0..2000u32);
        if rng.gen_bool(0.6) {
            let value = (rng.gen_range(0..1u32 << 20), rng.gen_range(0..16));
            match tree.insert(&tx, key, value) {
                Ok(()) => {
                    assert!(reference.insert(key, value).is_none());
                }
                Err(StorageError::UniquenessViolation(_)) => {
                    assert!(reference.contains_key(&key));
                }
                Err(e) => panic!("insert failed: {}", e),
            }
        } else {
            match tree.expunge(&tx, key) {
                Ok(()) => {
                    assert!(reference.remove(&key).is_some());
                }
                Err(StorageError::BadArgument(_)) => {
                    assert!(!reference.contains_key(&key));
                }
                Err(e) => panic!("expunge failed: {}", e),
            }
        }
    }

    assert_eq!(tree.get_count(&tx).unwrap() as usize, reference.len());
    for (k, v) in &reference {
        assert_eq!(tree.get(&tx, *k).unwrap(), Some(*v));
    }

    // the leaf chain agrees with the reference order
    let (_, keys) = walk_leaves(&tree, &tx);
    assert_eq!(keys, reference.keys().copied().collect::<Vec<u32>>());

    let mut progress = Progress::new();
    tree.verify(&tx, VerifyTreatment::Continue, &mut progress)
        .unwrap();
    assert!(
        progress.is_consistent(),
        "verify found: {:?}",
        progress.get_inconsistencies()
    );
}

#[test]
fn test_clear_resets_to_empty() {
    let dir = common::setup();
    let (tree, tx) = open_tree(dir.path());

    for k in 1..=500u32 {
        tree.insert(&tx, k, (k, 0)).unwrap();
    }
    tree.clear(&tx).unwrap();

    assert_eq!(tree.get_count(&tx).unwrap(), 0);
    assert_eq!(tree.get(&tx, 250).unwrap(), None);

    tree.insert(&tx, 1, (1, 0)).unwrap();
    assert_eq!(tree.get_count(&tx).unwrap(), 1);
}
