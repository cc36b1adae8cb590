mod common;

use rand::{rngs::StdRng, Rng, SeedableRng};
use strata_db::{
    direct::DirectAreaFile, FileId, OpenMode, Progress, StorageError,
    Transaction, VerifyTreatment,
};

fn open_file(dir: &std::path::Path) -> (DirectAreaFile, Transaction) {
    let tx = Transaction::new();
    let mut file =
        DirectAreaFile::new(FileId::new(dir.join("blobs"))).unwrap();
    file.create(&tx).unwrap();
    file.open(&tx, OpenMode::Update).unwrap();
    (file, tx)
}

fn blob(row: u32, len: usize) -> Vec<u8> {
    (0..len).map(|i| (row as usize + i) as u8).collect()
}

#[test]
fn test_insert_get_round_trip() {
    let dir = common::setup();
    let (file, tx) = open_file(dir.path());

    let data = blob(1, 100);
    let (page_id, area_id) = file.insert(&tx, 1, &data).unwrap();

    assert_eq!(file.get(&tx, 1).unwrap().unwrap(), data);
    // the durable pointer reads the same bytes without the index
    assert_eq!(file.read_area(&tx, page_id, area_id).unwrap(), data);
    assert!(file.get(&tx, 2).unwrap().is_none());
    assert_eq!(file.get_count(&tx).unwrap(), 1);
}

#[test]
fn test_small_blobs_share_a_page() {
    let dir = common::setup();
    let (file, tx) = open_file(dir.path());

    let mut pointers = Vec::new();
    for row in 0..10u32 {
        pointers.push(file.insert(&tx, row, &blob(row, 64)).unwrap());
    }
    let first_page = pointers[0].0;
    assert!(pointers.iter().all(|(p, _)| *p == first_page));

    for row in 0..10u32 {
        assert_eq!(file.get(&tx, row).unwrap().unwrap(), blob(row, 64));
    }
}

#[test]
fn test_oversized_blob_is_rejected() {
    let dir = common::setup();
    let (file, tx) = open_file(dir.path());

    let too_big = vec![0u8; file.get_max_storable_size() + 1];
    match file.insert(&tx, 1, &too_big) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }

    // the largest storable size fits exactly
    let max = vec![7u8; file.get_max_storable_size()];
    file.insert(&tx, 1, &max).unwrap();
    assert_eq!(file.get(&tx, 1).unwrap().unwrap(), max);
}

#[test]
fn test_expunge_frees_and_reuses_space() {
    let dir = common::setup();
    let (file, tx) = open_file(dir.path());

    for row in 0..5u32 {
        file.insert(&tx, row, &blob(row, 200)).unwrap();
    }
    for row in 0..5u32 {
        file.expunge(&tx, row).unwrap();
    }
    assert_eq!(file.get_count(&tx).unwrap(), 0);
    assert!(file.get(&tx, 0).unwrap().is_none());

    match file.expunge(&tx, 0) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }

    // the emptied pages went back to the store and get reused
    let (page_id, _) = file.insert(&tx, 9, &blob(9, 200)).unwrap();
    assert_eq!(page_id, 0);
    assert_eq!(file.get(&tx, 9).unwrap().unwrap(), blob(9, 200));
}

#[test]
fn test_duplicate_row_rolls_back_area() {
    let dir = common::setup();
    let (file, tx) = open_file(dir.path());

    file.insert(&tx, 4, &blob(4, 32)).unwrap();
    match file.insert(&tx, 4, &blob(4, 32)) {
        Err(StorageError::UniquenessViolation(4)) => {}
        other => panic!("expected UniquenessViolation, got {:?}", other.err()),
    }

    // the orphaned area was taken back; the original row is intact
    assert_eq!(file.get(&tx, 4).unwrap().unwrap(), blob(4, 32));
    assert_eq!(file.get_count(&tx).unwrap(), 1);

    let mut progress = Progress::new();
    file.verify(&tx, VerifyTreatment::Continue, &mut progress)
        .unwrap();
    assert!(
        progress.is_consistent(),
        "verify found: {:?}",
        progress.get_inconsistencies()
    );
}

#[test]
fn test_mixed_sizes_random() {
    let dir = common::setup();
    let (file, tx) = open_file(dir.path());

    let mut rng = StdRng::seed_from_u64(42);
    let mut live: Vec<(u32, Vec<u8>)> = Vec::new();

    for row in 0..300u32 {
        let len = rng.gen_range(1..2000usize);
        let data = blob(row, len);
        file.insert(&tx, row, &data).unwrap();
        live.push((row, data));
    }
    // drop a random half
    for row in 0..300u32 {
        if rng.gen_bool(0.5) {
            file.expunge(&tx, row).unwrap();
            live.retain(|(r, _)| *r != row);
        }
    }

    assert_eq!(file.get_count(&tx).unwrap() as usize, live.len());
    for (row, data) in &live {
        assert_eq!(file.get(&tx, *row).unwrap().unwrap(), *data, "row {}", row);
    }

    let mut progress = Progress::new();
    file.verify(&tx, VerifyTreatment::Continue, &mut progress)
        .unwrap();
    assert!(
        progress.is_consistent(),
        "verify found: {:?}",
        progress.get_inconsistencies()
    );
}

#[test]
fn test_reopen_after_close() {
    let dir = common::setup();
    let path = dir.path().join("blobs");
    let tx = Transaction::new();

    let mut file = DirectAreaFile::new(FileId::new(&path)).unwrap();
    file.create(&tx).unwrap();
    file.open(&tx, OpenMode::Update).unwrap();
    for row in 0..20u32 {
        file.insert(&tx, row, &blob(row, 500)).unwrap();
    }
    file.close(&tx).unwrap();
    drop(file);

    let tx = Transaction::new();
    let mut file = DirectAreaFile::new(FileId::new(&path)).unwrap();
    file.open(&tx, OpenMode::Read).unwrap();
    assert_eq!(file.get_count(&tx).unwrap(), 20);
    for row in 0..20u32 {
        assert_eq!(file.get(&tx, row).unwrap().unwrap(), blob(row, 500));
    }
    file.close(&tx).unwrap();
}

#[test]
fn test_move_carries_the_sidecar() {
    let dir = common::setup();
    let old_path = dir.path().join("old");
    let new_path = dir.path().join("new");
    let tx = Transaction::new();

    let mut file = DirectAreaFile::new(FileId::new(&old_path)).unwrap();
    file.create(&tx).unwrap();
    file.open(&tx, OpenMode::Update).unwrap();
    file.insert(&tx, 8, &blob(8, 300)).unwrap();
    file.close(&tx).unwrap();

    file.move_to(&tx, &new_path).unwrap();
    assert!(!old_path.exists());
    assert!(new_path.join("btree").exists());

    file.open(&tx, OpenMode::Read).unwrap();
    assert_eq!(file.get(&tx, 8).unwrap().unwrap(), blob(8, 300));
    file.close(&tx).unwrap();
}
