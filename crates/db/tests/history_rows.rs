use std::collections::HashSet;
use std::sync::Arc;

use utxod_chain::HashX;
use utxod_db::history::{History, MAX_HIST_ROW_ENTRIES};
use utxod_db::DbError;
use utxod_storage::memory::MemoryStore;
use utxod_storage::{Column, KeyValueStore};

fn hash_x(tag: u8) -> HashX {
    let mut out = [0u8; 11];
    out[0] = tag;
    out[10] = tag.wrapping_mul(7);
    out
}

fn add_block(history: &mut History<Arc<MemoryStore>>, hashxs: &[HashX], first_tx_num: u32) {
    let by_tx: Vec<HashSet<HashX>> = hashxs
        .iter()
        .map(|hash_x| HashSet::from([*hash_x]))
        .collect();
    history.add_unflushed(&by_tx, first_tx_num);
}

#[test]
fn rows_read_back_in_append_order() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store).expect("open");

    let a = hash_x(1);
    let b = hash_x(2);
    add_block(&mut history, &[a, b, a], 0);
    history.flush().expect("flush");
    add_block(&mut history, &[b, a], 3);
    history.flush().expect("flush");

    assert_eq!(history.tx_nums(&a, None).expect("read"), vec![0, 2, 4]);
    assert_eq!(history.tx_nums(&b, None).expect("read"), vec![1, 3]);
    assert_eq!(history.tx_nums(&a, Some(2)).expect("read"), vec![0, 2]);
    assert_eq!(history.tx_nums(&hash_x(9), None).expect("read"), Vec::<u32>::new());
}

#[test]
fn backup_drops_entries_at_or_past_tx_count() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store.clone()).expect("open");

    let a = hash_x(1);
    add_block(&mut history, &[a, a, a], 0);
    history.flush().expect("flush");
    add_block(&mut history, &[a, a], 3);
    history.flush().expect("flush");

    let removed = history
        .backup(&HashSet::from([a]), 2)
        .expect("backup");
    assert_eq!(removed, 3);
    assert_eq!(history.tx_nums(&a, None).expect("read"), vec![0, 1]);
    // A backup spends a flush id of its own; rows flushed after it must
    // not share ids with the ones rewritten here.
    assert_eq!(history.flush_count, 3);

    // Backing up an untouched hashX changes nothing but the id.
    let removed = history
        .backup(&HashSet::from([hash_x(5)]), 0)
        .expect("backup");
    assert_eq!(removed, 0);
    assert_eq!(history.tx_nums(&a, None).expect("read"), vec![0, 1]);
    assert_eq!(history.flush_count, 4);

    // The bumped count is part of the persisted state.
    let history = History::open(store).expect("reopen");
    assert_eq!(history.flush_count, 4);
}

#[test]
fn flush_fails_when_flush_ids_run_out() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store).expect("open");
    history.flush_count = u16::MAX as u32;

    assert!(matches!(
        history.backup(&HashSet::new(), 0),
        Err(DbError::OutOfRange(_))
    ));

    let a = hash_x(1);
    add_block(&mut history, &[a], 0);
    assert!(matches!(history.flush(), Err(DbError::OutOfRange(_))));
}

#[test]
fn clear_excess_removes_rows_past_utxo_flush() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store.clone()).expect("open");

    let a = hash_x(3);
    add_block(&mut history, &[a], 0);
    history.flush().expect("flush 1");
    add_block(&mut history, &[a], 1);
    history.flush().expect("flush 2");
    assert_eq!(history.flush_count, 2);

    // Pretend the UTXO flush only covered the first history flush.
    history.clear_excess(1).expect("clear");
    assert_eq!(history.flush_count, 1);
    assert_eq!(history.tx_nums(&a, None).expect("read"), vec![0]);

    // Reopen sees the trimmed state.
    let history = History::open(store).expect("reopen");
    assert_eq!(history.flush_count, 1);
    assert_eq!(history.tx_nums(&a, None).expect("read"), vec![0]);
}

#[test]
fn compaction_is_invisible_to_readers() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store.clone()).expect("open");

    let a = hash_x(1);
    let b = hash_x(200);
    for round in 0..5u32 {
        add_block(&mut history, &[a, b], round * 2);
        history.flush().expect("flush");
    }
    assert_eq!(history.flush_count, 5);
    let before_a = history.tx_nums(&a, None).expect("read");
    let before_b = history.tx_nums(&b, None).expect("read");
    assert_eq!(before_a.len(), 5);

    // A large budget compacts the whole prefix space in one call.
    let done = history.compact_once(usize::MAX).expect("compact");
    assert!(done);
    assert!(!history.compaction_in_progress());

    assert_eq!(history.tx_nums(&a, None).expect("read"), before_a);
    assert_eq!(history.tx_nums(&b, None).expect("read"), before_b);
    // Everything fits one row per hashX, so flush ids restart at zero.
    assert_eq!(history.flush_count, 0);
    let rows = store.scan_prefix(Column::History, &a[..]).expect("scan");
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0].0[11..], &[0, 0]);
}

#[test]
fn compaction_splits_large_histories_into_full_rows() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store.clone()).expect("open");

    let a = hash_x(4);
    let total = MAX_HIST_ROW_ENTRIES + 17;
    for chunk_start in (0..total).step_by(5000) {
        let count = 5000.min(total - chunk_start);
        let by_tx: Vec<HashSet<HashX>> = (0..count).map(|_| HashSet::from([a])).collect();
        history.add_unflushed(&by_tx, chunk_start as u32);
        history.flush().expect("flush");
    }

    let done = history.compact_once(usize::MAX).expect("compact");
    assert!(done);
    let rows = store.scan_prefix(Column::History, &a[..]).expect("scan");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].1.len(), MAX_HIST_ROW_ENTRIES * 4);
    assert_eq!(rows[1].1.len(), 17 * 4);
    // Two rows per hashX means the next flush id starts past row one.
    assert_eq!(history.flush_count, 1);

    let tx_nums = history.tx_nums(&a, None).expect("read");
    assert_eq!(tx_nums.len(), total);
    assert!(tx_nums.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn bounded_budget_compacts_incrementally() {
    let store = Arc::new(MemoryStore::new());
    let mut history = History::open(store).expect("open");

    // Two hashXs in different 16-bit prefixes, each with two rows.
    let a = hash_x(0);
    let b = hash_x(255);
    for round in 0..2u32 {
        add_block(&mut history, &[a, b], round * 2);
        history.flush().expect("flush");
    }

    let mut passes = 0;
    while !history.compact_once(1).expect("compact") {
        passes += 1;
        assert!(passes < 70_000, "compaction failed to converge");
    }
    assert_eq!(history.tx_nums(&a, None).expect("read"), vec![0, 2]);
    assert_eq!(history.tx_nums(&b, None).expect("read"), vec![1, 3]);
}
