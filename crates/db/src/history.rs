//! Per-script confirmed history rows with online compaction.
//!
//! Rows are keyed `hashX + be_u16(flush_id)` and hold packed
//! little-endian tx_nums. Key order therefore equals append order, and a
//! reader concatenating rows for one hashX sees tx_nums ascending.
//! Compaction rewrites a hashX's whole history into full rows with fresh
//! flush ids starting at zero; readers cannot observe the difference.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use utxod_chain::{HashX, HASHX_LEN};
use utxod_log::{log_info, log_warn};
use utxod_primitives::encoding::{Decoder, Encoder};
use utxod_storage::{Column, KeyValueStore, WriteBatch};

use crate::DbError;

pub const MAX_HIST_ROW_ENTRIES: usize = 12_500;

const HIST_STATE_KEY: &[u8] = b"hist_state";
const HIST_VERSION: u8 = 0;
const HIST_KEY_LEN: usize = HASHX_LEN + 2;

/// Compaction cursor position past the last 16-bit prefix.
const COMPACTION_FINISHED: u32 = 65_536;

pub struct History<S> {
    store: S,
    /// Id used by the next flushed row; capped at `u16::MAX`.
    pub flush_count: u32,
    /// Highest flush id written by the current compaction cycle.
    comp_flush_count: Option<u32>,
    /// Next 16-bit hashX prefix to compact; `None` when idle.
    comp_cursor: Option<u32>,
    unflushed: HashMap<HashX, Vec<u32>>,
    unflushed_count: usize,
}

impl<S: KeyValueStore> History<S> {
    pub fn open(store: S) -> Result<Self, DbError> {
        let mut history = Self {
            store,
            flush_count: 0,
            comp_flush_count: None,
            comp_cursor: None,
            unflushed: HashMap::new(),
            unflushed_count: 0,
        };
        history.read_state()?;
        if history.comp_cursor.is_some() {
            log_info!("cancelling interrupted history compaction");
            history.comp_cursor = None;
            history.comp_flush_count = None;
            let mut batch = WriteBatch::new();
            history.write_state(&mut batch);
            history.store.write_batch(&batch)?;
        }
        Ok(history)
    }

    fn read_state(&mut self) -> Result<(), DbError> {
        let Some(raw) = self.store.get(Column::Meta, HIST_STATE_KEY)? else {
            return Ok(());
        };
        let mut decoder = Decoder::new(&raw);
        let version = decoder.read_u8()?;
        if version != HIST_VERSION {
            return Err(DbError::Corrupt(format!(
                "unknown history version {version}"
            )));
        }
        self.flush_count = decoder.read_u32_le()?;
        self.comp_flush_count = read_opt_u32(&mut decoder)?;
        self.comp_cursor = read_opt_u32(&mut decoder)?;
        Ok(())
    }

    pub fn write_state(&self, batch: &mut WriteBatch) {
        let mut encoder = Encoder::new();
        encoder.write_u8(HIST_VERSION);
        encoder.write_u32_le(self.flush_count);
        write_opt_u32(&mut encoder, self.comp_flush_count);
        write_opt_u32(&mut encoder, self.comp_cursor);
        batch.put(Column::Meta, HIST_STATE_KEY, encoder.into_inner());
    }

    /// Delete rows flushed after the last UTXO flush. Needed after a
    /// crash between the history flush and the UTXO flush.
    pub fn clear_excess(&mut self, utxo_flush_count: u32) -> Result<(), DbError> {
        if self.flush_count <= utxo_flush_count {
            return Ok(());
        }
        log_warn!(
            "hist flush count {} exceeds utxo flush count {}, deleting excess history rows",
            self.flush_count,
            utxo_flush_count,
        );
        let mut batch = WriteBatch::new();
        self.store
            .for_each_prefix(Column::History, &[], &mut |key, _value| {
                if key.len() == HIST_KEY_LEN {
                    let flush_id = u16::from_be_bytes([key[HASHX_LEN], key[HASHX_LEN + 1]]);
                    if flush_id as u32 > utxo_flush_count {
                        batch.delete(Column::History, key);
                    }
                }
                Ok(())
            })?;
        let deleted = batch.len();
        self.flush_count = utxo_flush_count;
        self.comp_flush_count = None;
        self.comp_cursor = None;
        self.write_state(&mut batch);
        self.store.write_batch(&batch)?;
        log_warn!("deleted {deleted} excess history rows");
        Ok(())
    }

    pub fn add_unflushed(&mut self, hashxs_by_tx: &[HashSet<HashX>], first_tx_num: u32) {
        for (offset, hashxs) in hashxs_by_tx.iter().enumerate() {
            let tx_num = first_tx_num + offset as u32;
            for hash_x in hashxs {
                self.unflushed.entry(*hash_x).or_default().push(tx_num);
            }
            self.unflushed_count += hashxs.len();
        }
    }

    pub fn unflushed_count(&self) -> usize {
        self.unflushed_count
    }

    pub fn assert_flushed(&self) {
        assert!(self.unflushed.is_empty(), "history has unflushed entries");
    }

    /// Flush ids must fit the 16-bit key suffix; compaction restarts
    /// them from zero.
    fn bump_flush_count(&mut self) -> Result<(), DbError> {
        if self.flush_count >= u16::MAX as u32 {
            return Err(DbError::OutOfRange(
                "history flush ids exhausted, compact the history first".to_string(),
            ));
        }
        self.flush_count += 1;
        Ok(())
    }

    /// Flush pending entries as one new row per hashX.
    pub fn flush(&mut self) -> Result<usize, DbError> {
        let start = Instant::now();
        self.bump_flush_count()?;
        let flush_id = (self.flush_count as u16).to_be_bytes();

        let mut items: Vec<(&HashX, &Vec<u32>)> = self.unflushed.iter().collect();
        items.sort_by_key(|(hash_x, _)| **hash_x);

        let mut batch = WriteBatch::new();
        batch.reserve(items.len() + 1);
        for (hash_x, tx_nums) in &items {
            let mut key = [0u8; HIST_KEY_LEN];
            key[..HASHX_LEN].copy_from_slice(&hash_x[..]);
            key[HASHX_LEN..].copy_from_slice(&flush_id);
            batch.put(Column::History, key, pack_tx_nums(tx_nums));
        }
        self.write_state(&mut batch);
        self.store.write_batch(&batch)?;

        let rows = items.len();
        let count = self.unflushed_count;
        self.unflushed.clear();
        self.unflushed_count = 0;
        log_info!(
            "flushed history: {count} entries in {rows} rows, {}ms",
            start.elapsed().as_millis(),
        );
        Ok(count)
    }

    /// Drop tx_nums at or past `tx_count` for the touched hashXs. Rows
    /// are walked newest-first; the first partially surviving row is
    /// rewritten and everything after it deleted.
    pub fn backup(&mut self, hashxs: &HashSet<HashX>, tx_count: u32) -> Result<usize, DbError> {
        self.assert_flushed();
        // A backup counts as a flush; later flushes must not share ids
        // with rows rewritten here or clear_excess cannot tell them
        // apart after a crash.
        self.bump_flush_count()?;
        let mut sorted: Vec<&HashX> = hashxs.iter().collect();
        sorted.sort();

        let mut removed = 0usize;
        let mut batch = WriteBatch::new();
        for hash_x in sorted {
            let rows = self.store.scan_prefix(Column::History, &hash_x[..])?;
            for (key, value) in rows.iter().rev() {
                let tx_nums = unpack_tx_nums(value)?;
                let keep = tx_nums.partition_point(|tx_num| *tx_num < tx_count);
                removed += tx_nums.len() - keep;
                if keep > 0 {
                    if keep < tx_nums.len() {
                        batch.put(
                            Column::History,
                            key.clone(),
                            pack_tx_nums(&tx_nums[..keep]),
                        );
                    }
                    break;
                }
                batch.delete(Column::History, key.clone());
            }
        }
        self.write_state(&mut batch);
        self.store.write_batch(&batch)?;
        log_info!("backed up history to tx_count {tx_count}, removed {removed} entries");
        Ok(removed)
    }

    /// Confirmed tx_nums for a hashX, ascending, up to `limit`.
    pub fn tx_nums(&self, hash_x: &HashX, limit: Option<usize>) -> Result<Vec<u32>, DbError> {
        let mut out = Vec::new();
        let mut error = None;
        self.store
            .for_each_prefix(Column::History, &hash_x[..], &mut |_key, value| {
                match unpack_tx_nums(value) {
                    Ok(tx_nums) => out.extend(tx_nums),
                    Err(err) => {
                        if error.is_none() {
                            error = Some(err);
                        }
                    }
                }
                Ok(())
            })?;
        if let Some(err) = error {
            return Err(err);
        }
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    pub fn compaction_in_progress(&self) -> bool {
        self.comp_cursor.is_some()
    }

    /// Run one compaction slice bounded by `write_size_budget` bytes of
    /// rewritten rows. Starts a cycle when idle. Returns true when the
    /// cycle has finished.
    pub fn compact_once(&mut self, write_size_budget: usize) -> Result<bool, DbError> {
        self.assert_flushed();
        if self.comp_cursor.is_none() {
            self.comp_cursor = Some(0);
            self.comp_flush_count = Some(0);
            log_info!("starting history compaction");
        }

        let mut cursor = self.comp_cursor.unwrap_or(0);
        let mut write_items: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut keys_to_delete: BTreeSet<Vec<u8>> = BTreeSet::new();
        let mut write_size = 0usize;
        while cursor < COMPACTION_FINISHED {
            let prefix = (cursor as u16).to_be_bytes();
            write_size += self.compact_prefix(&prefix, &mut write_items, &mut keys_to_delete)?;
            cursor += 1;
            if write_size >= write_size_budget {
                break;
            }
        }
        self.flush_compaction(cursor, write_items, keys_to_delete)?;
        Ok(self.comp_cursor.is_none())
    }

    /// Compact every hashX sharing one 16-bit prefix.
    fn compact_prefix(
        &mut self,
        prefix: &[u8; 2],
        write_items: &mut Vec<(Vec<u8>, Vec<u8>)>,
        keys_to_delete: &mut BTreeSet<Vec<u8>>,
    ) -> Result<usize, DbError> {
        let rows = self.store.scan_prefix(Column::History, prefix)?;
        let mut write_size = 0usize;
        let mut group: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (key, value) in rows {
            if key.len() != HIST_KEY_LEN {
                return Err(DbError::Corrupt(format!(
                    "history key of length {}",
                    key.len()
                )));
            }
            if let Some((last_key, _)) = group.last() {
                if last_key[..HASHX_LEN] != key[..HASHX_LEN] {
                    write_size += self.compact_hashx(&group, write_items, keys_to_delete);
                    group.clear();
                }
            }
            group.push((key, value));
        }
        if !group.is_empty() {
            write_size += self.compact_hashx(&group, write_items, keys_to_delete);
        }
        Ok(write_size)
    }

    /// Rewrite one hashX's history into full rows with flush ids from
    /// zero. Unchanged rows are left alone; everything else is deleted
    /// and the replacements written in the same batch.
    fn compact_hashx(
        &mut self,
        rows: &[(Vec<u8>, Vec<u8>)],
        write_items: &mut Vec<(Vec<u8>, Vec<u8>)>,
        keys_to_delete: &mut BTreeSet<Vec<u8>>,
    ) -> usize {
        let hash_x = &rows[0].0[..HASHX_LEN];
        let hist: Vec<u8> = rows
            .iter()
            .flat_map(|(_, value)| value.iter().copied())
            .collect();
        let max_row_size = MAX_HIST_ROW_ENTRIES * 4;
        let nrows = hist.len().div_ceil(max_row_size);
        if nrows > 4 {
            log_info!(
                "hashX {} is large: {} entries in {nrows} rows",
                hex_prefix(hash_x),
                hist.len() / 4,
            );
        }
        if nrows > 1 {
            let needed = (nrows - 1) as u32;
            self.comp_flush_count = Some(self.comp_flush_count.unwrap_or(0).max(needed));
        }

        for (key, _) in rows {
            keys_to_delete.insert(key.clone());
        }
        let mut write_size = 0usize;
        for (n, chunk) in hist.chunks(max_row_size).enumerate() {
            let mut key = hash_x.to_vec();
            key.extend_from_slice(&(n as u16).to_be_bytes());
            if rows
                .iter()
                .any(|(old_key, old_value)| *old_key == key && old_value == chunk)
            {
                keys_to_delete.remove(&key);
                continue;
            }
            write_size += chunk.len();
            write_items.push((key, chunk.to_vec()));
        }
        write_size
    }

    fn flush_compaction(
        &mut self,
        cursor: u32,
        write_items: Vec<(Vec<u8>, Vec<u8>)>,
        keys_to_delete: BTreeSet<Vec<u8>>,
    ) -> Result<(), DbError> {
        let deletes = keys_to_delete.len();
        let writes = write_items.len();
        self.comp_cursor = Some(cursor);
        let mut batch = WriteBatch::new();
        batch.reserve(deletes + writes + 1);
        // Deletes strictly before puts; rewritten keys appear in both and
        // the put must win.
        for key in keys_to_delete {
            batch.delete(Column::History, key);
        }
        for (key, value) in write_items {
            batch.put(Column::History, key, value);
        }
        if cursor == COMPACTION_FINISHED {
            self.flush_count = self.comp_flush_count.take().unwrap_or(0);
            self.comp_cursor = None;
            log_info!(
                "history compaction complete, flush count reset to {}",
                self.flush_count,
            );
        }
        self.write_state(&mut batch);
        self.store.write_batch(&batch)?;
        if deletes + writes > 0 {
            log_info!("history compaction: {writes} rows written, {deletes} rows deleted");
        }
        Ok(())
    }
}

fn pack_tx_nums(tx_nums: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tx_nums.len() * 4);
    for tx_num in tx_nums {
        out.extend_from_slice(&tx_num.to_le_bytes());
    }
    out
}

fn unpack_tx_nums(raw: &[u8]) -> Result<Vec<u32>, DbError> {
    if raw.len() % 4 != 0 {
        return Err(DbError::Corrupt("ragged history row".to_string()));
    }
    Ok(raw
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn read_opt_u32(decoder: &mut Decoder) -> Result<Option<u32>, DbError> {
    let present = decoder.read_u8()?;
    let value = decoder.read_u32_le()?;
    Ok((present != 0).then_some(value))
}

fn write_opt_u32(encoder: &mut Encoder, value: Option<u32>) {
    encoder.write_u8(value.is_some() as u8);
    encoder.write_u32_le(value.unwrap_or(0));
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
