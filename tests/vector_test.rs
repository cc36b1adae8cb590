mod common;

use bit_vec::BitVec;
use strata_db::{
    vector::{FieldType, Value, VectorFile},
    FileId, OpenMode, Progress, StorageError, Transaction, VerifyTreatment,
};

fn open_vector(
    dir: &std::path::Path,
    fields: Vec<FieldType>,
) -> (VectorFile, Transaction) {
    let tx = Transaction::new();
    let mut file =
        VectorFile::new(FileId::new(dir.join("vector")), fields).unwrap();
    file.create(&tx).unwrap();
    file.open(&tx, OpenMode::Update).unwrap();
    (file, tx)
}

/// Two u32 fields: an 8-byte record, 511 records per 4 KB page.
fn pair_schema() -> Vec<FieldType> {
    vec![FieldType::UInt32, FieldType::UInt32]
}

fn pair(row: u32) -> Vec<Value> {
    vec![Value::UInt32(row), Value::UInt32(row * 2)]
}

#[test]
fn test_sparse_then_dense() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    file.insert(&tx, 1, &pair(1)).unwrap();
    assert_eq!(file.get_max_page_id(&tx).unwrap(), 1);

    // a far row materializes every page on the way
    file.insert(&tx, 100_000, &pair(100_000)).unwrap();
    let max = file.get_max_page_id(&tx).unwrap();
    assert_eq!(max, 100_000 / 511 + 1);
    assert_eq!(file.get_count(&tx).unwrap(), 2);

    // iteration skips the empty middle pages in both directions
    let (row, data) = file.next(&tx, 0, &[]).unwrap().unwrap();
    assert_eq!(row, 1);
    assert_eq!(data, pair(1));

    let (row, _) = file.next(&tx, 2, &[]).unwrap().unwrap();
    assert_eq!(row, 100_000);

    let (row, _) = file.prev(&tx, 100_000, &[]).unwrap().unwrap();
    assert_eq!(row, 1);

    assert!(file.next(&tx, 100_000, &[]).unwrap().is_none());
    assert!(file.prev(&tx, 1, &[]).unwrap().is_none());
}

#[test]
fn test_next_of_prev_round_trip() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    for row in [5u32, 600, 601, 5000] {
        file.insert(&tx, row, &pair(row)).unwrap();
    }
    for row in [600u32, 601, 5000] {
        let (p, _) = file.prev(&tx, row, &[]).unwrap().unwrap();
        let (n, _) = file.next(&tx, p, &[]).unwrap().unwrap();
        assert_eq!(n, row);
    }
}

#[test]
fn test_delete_to_empty() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    file.insert(&tx, 7, &pair(7)).unwrap();
    assert!(file.is_valid(&tx, 7).unwrap());

    file.expunge(&tx, 7).unwrap();
    assert!(file.is_empty(&tx).unwrap());
    assert!(!file.is_valid(&tx, 7).unwrap());
    assert!(file.fetch(&tx, 7, &[]).unwrap().is_none());
    assert!(file.next(&tx, 0, &[]).unwrap().is_none());

    // the data page survives, its presence bit does not
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
fn test_fetch_is_none_iff_not_inserted() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    assert!(file.fetch(&tx, 3, &[]).unwrap().is_none());
    file.insert(&tx, 3, &pair(3)).unwrap();
    assert_eq!(file.fetch(&tx, 3, &[]).unwrap().unwrap(), pair(3));

    // a neighbour slot on the same page stays empty
    assert!(file.fetch(&tx, 4, &[]).unwrap().is_none());

    file.expunge(&tx, 3).unwrap();
    assert!(file.fetch(&tx, 3, &[]).unwrap().is_none());
}

#[test]
fn test_duplicate_insert_is_bad_argument() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    file.insert(&tx, 9, &pair(9)).unwrap();
    match file.insert(&tx, 9, &pair(9)) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
    match file.expunge(&tx, 10) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
    assert_eq!(file.get_count(&tx).unwrap(), 1);
}

#[test]
fn test_update_and_projection() {
    let dir = common::setup();
    let fields =
        vec![FieldType::UInt32, FieldType::Int32, FieldType::UInt64];
    let (mut file, tx) = open_vector(dir.path(), fields);

    let record = vec![
        Value::UInt32(11),
        Value::Int32(-4),
        Value::UInt64(1 << 33),
    ];
    file.insert(&tx, 0, &record).unwrap();

    // single-field update leaves the rest alone
    file.update(&tx, 0, &[Value::Int32(8)], &[1]).unwrap();
    let got = file.fetch(&tx, 0, &[]).unwrap().unwrap();
    assert_eq!(
        got,
        vec![Value::UInt32(11), Value::Int32(8), Value::UInt64(1 << 33)]
    );

    // projection reorders as asked
    let got = file.fetch(&tx, 0, &[2, 0]).unwrap().unwrap();
    assert_eq!(got, vec![Value::UInt64(1 << 33), Value::UInt32(11)]);

    match file.update(&tx, 1, &[Value::Int32(1)], &[1]) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
}

#[test]
fn test_null_fields() {
    let dir = common::setup();
    let fields = vec![FieldType::UInt32, FieldType::Int32];
    let (mut file, tx) = open_vector(dir.path(), fields);

    file.insert(&tx, 2, &[Value::UInt32(5), Value::Null]).unwrap();
    let got = file.fetch(&tx, 2, &[]).unwrap().unwrap();
    assert_eq!(got, vec![Value::UInt32(5), Value::Null]);
    assert!(file.is_valid(&tx, 2).unwrap());

    // the null sentinel bit patterns are not storable values
    match file.insert(&tx, 3, &[Value::UInt32(u32::MAX), Value::Null]) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
    match file.insert(&tx, 3, &[Value::UInt32(1), Value::Int32(-1)]) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
    // an all-null record would read back as an empty slot
    match file.insert(&tx, 3, &[Value::Null, Value::Null]) {
        Err(StorageError::BadArgument(_)) => {}
        other => panic!("expected BadArgument, got {:?}", other.err()),
    }
}

#[test]
fn test_get_all_bitset() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    let rows = [0u32, 1, 510, 511, 512, 2000];
    for row in rows {
        file.insert(&tx, row, &pair(row)).unwrap();
    }

    let mut bits = BitVec::new();
    file.get_all(&tx, &mut bits).unwrap();
    for row in 0..2100usize {
        let expected = rows.contains(&(row as u32));
        assert_eq!(bits.get(row).unwrap_or(false), expected, "row {}", row);
    }
}

#[test]
fn test_reopen_after_close() {
    let dir = common::setup();
    let path = dir.path().join("vector");
    let tx = Transaction::new();

    let mut file =
        VectorFile::new(FileId::new(&path), pair_schema()).unwrap();
    file.create(&tx).unwrap();
    file.open(&tx, OpenMode::Update).unwrap();
    for row in (0..3000u32).step_by(7) {
        file.insert(&tx, row, &pair(row)).unwrap();
    }
    file.close(&tx).unwrap();
    drop(file);

    let tx = Transaction::new();
    let mut file =
        VectorFile::new(FileId::new(&path), pair_schema()).unwrap();
    file.open(&tx, OpenMode::Read).unwrap();
    for row in 0..3000u32 {
        let expected = row % 7 == 0;
        assert_eq!(file.is_valid(&tx, row).unwrap(), expected, "row {}", row);
    }
    file.close(&tx).unwrap();
}

#[test]
fn test_clear_truncates() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    for row in (0..5000u32).step_by(100) {
        file.insert(&tx, row, &pair(row)).unwrap();
    }
    assert!(file.get_max_page_id(&tx).unwrap() > 1);

    file.clear(&tx).unwrap();
    assert_eq!(file.get_count(&tx).unwrap(), 0);
    assert_eq!(file.get_max_page_id(&tx).unwrap(), 0);
    assert!(file.next(&tx, 0, &[]).unwrap().is_none());

    // a cleared file accepts inserts again
    file.insert(&tx, 17, &pair(17)).unwrap();
    assert_eq!(file.get_count(&tx).unwrap(), 1);
}

#[test]
fn test_dense_page_boundaries() {
    let dir = common::setup();
    let (mut file, tx) = open_vector(dir.path(), pair_schema());

    // rows straddling the first two data pages (511 records each)
    for row in 500..530u32 {
        file.insert(&tx, row, &pair(row)).unwrap();
    }
    let mut row = 499;
    let mut seen = Vec::new();
    while let Some((next, data)) = file.next(&tx, row, &[]).unwrap() {
        assert_eq!(data, pair(next));
        seen.push(next);
        row = next;
    }
    assert_eq!(seen, (500..530u32).collect::<Vec<u32>>());

    let mut progress = Progress::new();
    file.verify(&tx, VerifyTreatment::Continue, &mut progress)
        .unwrap();
    assert!(progress.is_consistent());
}
