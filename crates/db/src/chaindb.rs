//! Chain database: headers, tx hashes, UTXO set, undo data, chain state.
//!
//! Flush ordering is the crash-safety story. Flat files go first (an
//! interrupted append is overwritten next time because file positions
//! derive from the persisted height), history rows second, and the UTXO
//! batch plus chain state last in one atomic write. Anything the files or
//! history hold past the persisted state is unreferenced and harmless.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use utxod_chain::{ChainCodec, ChainParams, HashX, HASHX_LEN};
use utxod_log::log_info;
use utxod_primitives::encoding::{Decoder, Encoder};
use utxod_primitives::merkle::{HashSource, MerkleCache, MerkleError};
use utxod_primitives::{hash_to_hex, Hash256};
use utxod_storage::{Column, KeyValueStore, WriteBatch};

use crate::flatfiles::TableFile;
use crate::history::History;
use crate::DbError;

const DB_VERSION: u8 = 1;
const STATE_KEY: &[u8] = b"state";

const UTXO_KEY_LEN: usize = HASHX_LEN + 8;
const LOOKUP_KEY_LEN: usize = 12;
const UNDO_ENTRY_LEN: usize = HASHX_LEN + 12;

/// A spendable output as tracked between flushes and in undo data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CachedUtxo {
    pub hash_x: HashX,
    pub tx_num: u32,
    pub value: u64,
}

/// One confirmed historical transaction for a hashX. The hash is `None`
/// when the tx_num points past the flushed file state (reorg race).
#[derive(Clone, Debug)]
pub struct HistoryItem {
    pub tx_num: u32,
    pub tx_hash: Option<Hash256>,
    pub height: u32,
}

#[derive(Clone, Debug)]
pub struct Utxo {
    pub tx_num: u32,
    pub tx_pos: u32,
    pub tx_hash: Option<Hash256>,
    pub height: u32,
    pub value: u64,
}

/// Everything the block processor has accumulated since the last flush.
#[derive(Default)]
pub struct FlushData {
    pub height: i32,
    pub tx_count: u32,
    pub tip: Hash256,
    pub headers: Vec<Vec<u8>>,
    pub block_tx_hashes: Vec<Vec<Hash256>>,
    /// New outputs keyed by (tx_hash, tx_pos).
    pub adds: HashMap<(Hash256, u32), CachedUtxo>,
    pub deletes_utxo: Vec<[u8; UTXO_KEY_LEN]>,
    pub deletes_lookup: Vec<[u8; LOOKUP_KEY_LEN]>,
    pub undo_infos: Vec<(u32, Vec<u8>)>,
    pub raw_blocks: Vec<(u32, Vec<u8>)>,
}

impl FlushData {
    pub fn new() -> Self {
        Self {
            height: -1,
            ..Self::default()
        }
    }
}

pub struct ChainDb<S> {
    store: S,
    pub codec: Arc<dyn ChainCodec>,
    pub params: ChainParams,
    pub history: History<S>,

    headers_file: TableFile,
    tx_counts_file: TableFile,
    hashes_file: TableFile,
    /// Per-height header byte offsets, only for variable-size headers.
    offsets_file: Option<TableFile>,

    /// Cumulative tx count per height. The block processor appends while
    /// advancing; `flush_fs` persists the new tail.
    pub tx_counts: Vec<u32>,

    pub db_height: i32,
    pub db_tx_count: u32,
    pub db_tip: Hash256,
    fs_height: i32,
    fs_tx_count: u32,
    pub utxo_flush_count: u32,
    pub wall_time_secs: u64,
    pub first_sync: bool,

    header_mc: Mutex<MerkleCache>,
}

impl<S: KeyValueStore + Clone> ChainDb<S> {
    pub fn open(
        dir: &Path,
        store: S,
        codec: Arc<dyn ChainCodec>,
        params: ChainParams,
    ) -> Result<Self, DbError> {
        fs::create_dir_all(dir)?;

        let headers_file = TableFile::open(dir.join("headers.dat"))?;
        let tx_counts_file = TableFile::open(dir.join("tx_counts.dat"))?;
        let hashes_file = TableFile::open(dir.join("tx_hashes.dat"))?;
        let offsets_file = if codec.static_header_len().is_none() {
            let file = TableFile::open(dir.join("header_offsets.dat"))?;
            if file.is_empty()? {
                file.write(0, &0u64.to_le_bytes())?;
            }
            Some(file)
        } else {
            None
        };

        let mut history = History::open(store.clone())?;

        let state = match store.get(Column::Meta, STATE_KEY)? {
            Some(raw) => Some(decode_state(&raw, &params)?),
            None => None,
        };
        let fresh = state.is_none();
        let state = state.unwrap_or_else(|| ChainState::fresh(&params));

        history.clear_excess(state.utxo_flush_count)?;
        // Compaction restarts history flush ids from zero; the stored
        // count would feed a stale ceiling into the next clear_excess.
        let utxo_flush_count = history.flush_count;

        let heights = (state.height + 1) as usize;
        let mut tx_counts = Vec::with_capacity(heights);
        if heights > 0 {
            let raw = tx_counts_file.read(0, heights * 4)?;
            for chunk in raw.chunks_exact(4) {
                tx_counts.push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
            }
        }
        let file_tx_count = tx_counts.last().copied().unwrap_or(0);
        if file_tx_count != state.tx_count {
            return Err(DbError::Corrupt(format!(
                "tx count file says {file_tx_count}, state says {}",
                state.tx_count,
            )));
        }

        let db = Self {
            store,
            codec,
            params,
            history,
            headers_file,
            tx_counts_file,
            hashes_file,
            offsets_file,
            tx_counts,
            db_height: state.height,
            db_tx_count: state.tx_count,
            db_tip: state.tip,
            fs_height: state.height,
            fs_tx_count: state.tx_count,
            utxo_flush_count,
            wall_time_secs: state.wall_time_secs,
            first_sync: state.first_sync,
            header_mc: Mutex::new(MerkleCache::new()),
        };

        if fresh {
            let mut batch = WriteBatch::new();
            db.write_state(&mut batch);
            db.store.write_batch(&batch)?;
            log_info!("created fresh database for {}", db.params.network.as_str());
        }

        {
            let source = BlockHashSource { db: &db };
            let mut cache = db.header_mc.lock().expect("header merkle cache lock");
            cache.initialize(&source, (db.db_height + 1) as usize)?;
        }
        db.clear_excess_undo_info()?;

        log_info!(
            "opened database: height {}, {} txs, tip {}, flush count {}",
            db.db_height,
            db.db_tx_count,
            hash_to_hex(&db.db_tip),
            db.utxo_flush_count,
        );
        Ok(db)
    }

    // --- flush pipeline ---

    /// Everything pending must already be flushed; asserts the
    /// accumulator agrees with the persisted state.
    pub fn assert_flushed(&self, flush_data: &FlushData) {
        assert_eq!(flush_data.height, self.db_height);
        assert_eq!(flush_data.tx_count, self.db_tx_count);
        assert_eq!(flush_data.tip, self.db_tip);
        assert!(flush_data.headers.is_empty());
        assert!(flush_data.block_tx_hashes.is_empty());
        assert!(flush_data.adds.is_empty());
        assert!(flush_data.deletes_utxo.is_empty());
        assert!(flush_data.deletes_lookup.is_empty());
        assert!(flush_data.undo_infos.is_empty());
        assert!(flush_data.raw_blocks.is_empty());
        self.history.assert_flushed();
    }

    /// Flush in the order that keeps a crash recoverable: flat files,
    /// then history, then (optionally) the UTXO batch with chain state.
    pub fn flush_dbs(&mut self, flush_data: &mut FlushData, flush_utxos: bool) -> Result<(), DbError> {
        if flush_data.height == self.db_height {
            self.assert_flushed(flush_data);
            return Ok(());
        }

        let start = Instant::now();
        let prior_height = self.db_height;
        let tx_delta = flush_data.tx_count as i64 - self.db_tx_count as i64;

        self.flush_fs(flush_data)?;
        if self.history.unflushed_count() > 0 {
            self.history.flush()?;
        }
        if flush_utxos {
            self.flush_utxo_db(flush_data)?;
        }

        let elapsed = start.elapsed();
        self.wall_time_secs += elapsed.as_secs();
        log_info!(
            "flush took {}ms: height {} -> {} ({tx_delta} txs, utxos {})",
            elapsed.as_millis(),
            prior_height,
            flush_data.height,
            flush_utxos,
        );
        Ok(())
    }

    fn flush_fs(&mut self, flush_data: &mut FlushData) -> Result<(), DbError> {
        let prior_tx_count = if self.fs_height >= 0 {
            self.tx_counts[self.fs_height as usize]
        } else {
            0
        };
        assert_eq!(flush_data.headers.len(), flush_data.block_tx_hashes.len());
        assert_eq!(
            flush_data.height,
            self.fs_height + flush_data.headers.len() as i32
        );
        assert_eq!(
            flush_data.tx_count,
            self.tx_counts.last().copied().unwrap_or(0)
        );
        assert_eq!(self.tx_counts.len(), (flush_data.height + 1) as usize);

        let mut hashes = Vec::new();
        for block_hashes in &flush_data.block_tx_hashes {
            for hash in block_hashes {
                hashes.extend_from_slice(hash);
            }
        }
        assert_eq!(
            hashes.len() / 32,
            (flush_data.tx_count - prior_tx_count) as usize
        );

        let height_start = (self.fs_height + 1) as u32;
        let offset = self.header_offset(height_start)?;
        self.headers_file.write(offset, &flush_data.headers.concat())?;
        self.update_header_offsets(offset, height_start, &flush_data.headers)?;

        let mut counts = Vec::with_capacity((self.tx_counts.len() - height_start as usize) * 4);
        for count in &self.tx_counts[height_start as usize..] {
            counts.extend_from_slice(&count.to_le_bytes());
        }
        self.tx_counts_file.write(height_start as u64 * 4, &counts)?;
        self.hashes_file.write(prior_tx_count as u64 * 32, &hashes)?;

        flush_data.headers.clear();
        flush_data.block_tx_hashes.clear();
        self.fs_height = flush_data.height;
        self.fs_tx_count = flush_data.tx_count;
        Ok(())
    }

    /// UTXO tables, undo data, raw blocks and chain state in one atomic
    /// batch. Deletes go in strictly before adds.
    fn flush_utxo_db(&mut self, flush_data: &mut FlushData) -> Result<(), DbError> {
        let adds = flush_data.adds.len();
        let spends = flush_data.deletes_utxo.len();

        let mut batch = WriteBatch::new();
        batch.reserve(spends * 2 + adds * 2 + flush_data.undo_infos.len() + 2);

        flush_data.deletes_utxo.sort_unstable();
        for key in flush_data.deletes_utxo.drain(..) {
            batch.delete(Column::Utxo, key);
        }
        flush_data.deletes_lookup.sort_unstable();
        for key in flush_data.deletes_lookup.drain(..) {
            batch.delete(Column::HashxLookup, key);
        }

        let mut new_utxos: Vec<((Hash256, u32), CachedUtxo)> = flush_data.adds.drain().collect();
        new_utxos.sort_unstable_by_key(|((tx_hash, tx_pos), _)| (*tx_hash, *tx_pos));
        for ((tx_hash, tx_pos), utxo) in new_utxos {
            batch.put(
                Column::HashxLookup,
                lookup_key(&tx_hash, tx_pos, utxo.tx_num),
                utxo.hash_x,
            );
            batch.put(
                Column::Utxo,
                utxo_key(&utxo.hash_x, tx_pos, utxo.tx_num),
                utxo.value.to_le_bytes(),
            );
        }

        for (height, blob) in flush_data.undo_infos.drain(..) {
            batch.put(Column::Undo, height.to_be_bytes(), blob);
        }
        for (height, raw) in flush_data.raw_blocks.drain(..) {
            batch.put(Column::RawBlock, height.to_be_bytes(), raw);
        }

        self.utxo_flush_count = self.history.flush_count;
        self.db_height = flush_data.height;
        self.db_tx_count = flush_data.tx_count;
        self.db_tip = flush_data.tip;
        self.write_state(&mut batch);
        self.store.write_batch(&batch)?;

        log_info!("flushed utxos: {adds} adds, {spends} spends");
        Ok(())
    }

    /// Undo one or more blocks' worth of state. History and UTXO changes
    /// flush unconditionally; the flat files are only logically
    /// truncated.
    pub fn flush_backup(
        &mut self,
        flush_data: &mut FlushData,
        touched: &HashSet<HashX>,
    ) -> Result<(), DbError> {
        assert!(flush_data.headers.is_empty());
        assert!(flush_data.block_tx_hashes.is_empty());
        assert!(flush_data.height < self.db_height);
        self.history.assert_flushed();

        let start = Instant::now();
        self.history.backup(touched, flush_data.tx_count)?;
        self.backup_fs(flush_data.height, flush_data.tx_count);
        self.flush_utxo_db(flush_data)?;
        log_info!(
            "backup flush took {}ms: height now {}, {} scripts touched",
            start.elapsed().as_millis(),
            self.db_height,
            touched.len(),
        );
        Ok(())
    }

    fn backup_fs(&mut self, height: i32, tx_count: u32) {
        self.fs_height = height;
        self.fs_tx_count = tx_count;
        self.tx_counts.truncate((height + 1) as usize);
        let mut cache = self.header_mc.lock().expect("header merkle cache lock");
        cache.truncate((height + 1) as usize);
    }

    fn write_state(&self, batch: &mut WriteBatch) {
        let state = ChainState {
            genesis: self.params.genesis_hash,
            height: self.db_height,
            tx_count: self.db_tx_count,
            tip: self.db_tip,
            utxo_flush_count: self.utxo_flush_count,
            wall_time_secs: self.wall_time_secs,
            first_sync: self.first_sync,
        };
        batch.put(Column::Meta, STATE_KEY, state.encode());
    }

    /// Persist state outside a flush, for first-sync completion.
    pub fn flush_state(&mut self) -> Result<(), DbError> {
        let mut batch = WriteBatch::new();
        self.write_state(&mut batch);
        self.store.write_batch(&batch)?;
        Ok(())
    }

    // --- file state reads ---

    fn header_offset(&self, height: u32) -> Result<u64, DbError> {
        if let Some(offset) = self.codec.static_header_offset(height) {
            return Ok(offset);
        }
        let file = self
            .offsets_file
            .as_ref()
            .ok_or_else(|| DbError::Corrupt("missing header offsets file".to_string()))?;
        let raw = file.read(height as u64 * 8, 8)?;
        Ok(u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ]))
    }

    fn update_header_offsets(
        &self,
        start_offset: u64,
        height_start: u32,
        headers: &[Vec<u8>],
    ) -> Result<(), DbError> {
        let Some(file) = self.offsets_file.as_ref() else {
            return Ok(());
        };
        let mut raw = Vec::with_capacity(headers.len() * 8);
        let mut offset = start_offset;
        for header in headers {
            offset += header.len() as u64;
            raw.extend_from_slice(&offset.to_le_bytes());
        }
        file.write((height_start as u64 + 1) * 8, &raw)
    }

    /// Headers for `count` heights starting at `start`, one blob per
    /// height.
    pub fn read_headers(&self, start: u32, count: usize) -> Result<Vec<Vec<u8>>, DbError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let end = start as u64 + count as u64;
        if end > (self.db_height + 1) as u64 {
            return Err(DbError::OutOfRange(format!(
                "headers {start}..{end} beyond height {}",
                self.db_height,
            )));
        }
        if let Some(len) = self.codec.static_header_len() {
            let raw = self
                .headers_file
                .read(start as u64 * len as u64, count * len)?;
            return Ok(raw.chunks_exact(len).map(|chunk| chunk.to_vec()).collect());
        }
        let mut offsets = Vec::with_capacity(count + 1);
        for height in start..=start + count as u32 {
            offsets.push(self.header_offset(height)?);
        }
        let span = self
            .headers_file
            .read(offsets[0], (offsets[count] - offsets[0]) as usize)?;
        let base = offsets[0];
        Ok((0..count)
            .map(|i| {
                span[(offsets[i] - base) as usize..(offsets[i + 1] - base) as usize].to_vec()
            })
            .collect())
    }

    pub fn raw_header(&self, height: u32) -> Result<Vec<u8>, DbError> {
        let mut headers = self.read_headers(height, 1)?;
        Ok(headers.swap_remove(0))
    }

    /// Map a tx_num to its hash and height. The hash is `None` when the
    /// tx_num runs past the flushed files, which a reader can hit midway
    /// through a reorg.
    pub fn fs_tx_hash(&self, tx_num: u32) -> Result<(Option<Hash256>, u32), DbError> {
        let height = self.tx_counts.partition_point(|count| *count <= tx_num) as u32;
        if height as i64 > self.db_height as i64 {
            return Ok((None, height));
        }
        let raw = self.hashes_file.read(tx_num as u64 * 32, 32)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&raw);
        Ok((Some(hash), height))
    }

    pub fn fs_block_hashes(&self, start: u32, count: usize) -> Result<Vec<Hash256>, DbError> {
        let headers = self.read_headers(start, count)?;
        Ok(headers
            .iter()
            .map(|header| self.codec.header_hash(header))
            .collect())
    }

    /// Merkle branch and root over the first `length` block hashes for
    /// the header at `height`.
    pub fn header_branch_and_root(
        &self,
        length: usize,
        height: u32,
    ) -> Result<(Vec<Hash256>, Hash256), DbError> {
        let source = BlockHashSource { db: self };
        let mut cache = self.header_mc.lock().expect("header merkle cache lock");
        Ok(cache.branch_and_root(&source, length, height as usize)?)
    }

    // --- script queries ---

    pub fn limited_history(
        &self,
        hash_x: &HashX,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryItem>, DbError> {
        let tx_nums = self.history.tx_nums(hash_x, limit)?;
        let mut out = Vec::with_capacity(tx_nums.len());
        for tx_num in tx_nums {
            let (tx_hash, height) = self.fs_tx_hash(tx_num)?;
            out.push(HistoryItem {
                tx_num,
                tx_hash,
                height,
            });
        }
        Ok(out)
    }

    pub fn all_utxos(&self, hash_x: &HashX) -> Result<Vec<Utxo>, DbError> {
        let rows = self.store.scan_prefix(Column::Utxo, &hash_x[..])?;
        let mut out = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            if key.len() != UTXO_KEY_LEN || value.len() != 8 {
                return Err(DbError::Corrupt("malformed utxo row".to_string()));
            }
            let tx_pos = u32::from_le_bytes([key[11], key[12], key[13], key[14]]);
            let tx_num = u32::from_le_bytes([key[15], key[16], key[17], key[18]]);
            let amount = u64::from_le_bytes([
                value[0], value[1], value[2], value[3], value[4], value[5], value[6], value[7],
            ]);
            let (tx_hash, height) = self.fs_tx_hash(tx_num)?;
            out.push(Utxo {
                tx_num,
                tx_pos,
                tx_hash,
                height,
                value: amount,
            });
        }
        Ok(out)
    }

    /// Find the flushed UTXO for an outpoint, resolving 4-byte lookup
    /// prefix collisions against the tx hash file.
    pub fn db_utxo(
        &self,
        tx_hash: &Hash256,
        tx_pos: u32,
    ) -> Result<Option<(HashX, u32, u64)>, DbError> {
        let Some((hash_x, tx_num)) = self.resolve_lookup(tx_hash, tx_pos)? else {
            return Ok(None);
        };
        match self.utxo_value(&hash_x, tx_pos, tx_num)? {
            Some(value) => Ok(Some((hash_x, tx_num, value))),
            None => Ok(None),
        }
    }

    /// Resolve confirmed outpoints for the mempool: first the lookup
    /// table, then the value fetch.
    pub fn lookup_utxos(
        &self,
        prevouts: &[(Hash256, u32)],
    ) -> Result<Vec<Option<(HashX, u64)>>, DbError> {
        let mut out = Vec::with_capacity(prevouts.len());
        for (tx_hash, tx_pos) in prevouts {
            match self.resolve_lookup(tx_hash, *tx_pos)? {
                Some((hash_x, tx_num)) => {
                    out.push(
                        self.utxo_value(&hash_x, *tx_pos, tx_num)?
                            .map(|value| (hash_x, value)),
                    );
                }
                None => out.push(None),
            }
        }
        Ok(out)
    }

    fn resolve_lookup(
        &self,
        tx_hash: &Hash256,
        tx_pos: u32,
    ) -> Result<Option<(HashX, u32)>, DbError> {
        let mut prefix = [0u8; 8];
        prefix[..4].copy_from_slice(&tx_hash[..4]);
        prefix[4..].copy_from_slice(&tx_pos.to_le_bytes());
        let rows = self.store.scan_prefix(Column::HashxLookup, &prefix)?;
        for (key, value) in rows {
            if key.len() != LOOKUP_KEY_LEN || value.len() != HASHX_LEN {
                return Err(DbError::Corrupt("malformed lookup row".to_string()));
            }
            let tx_num = u32::from_le_bytes([key[8], key[9], key[10], key[11]]);
            // A 4-byte prefix can collide; check the full hash.
            let (full_hash, _height) = self.fs_tx_hash(tx_num)?;
            if full_hash.as_ref() == Some(tx_hash) {
                let mut hash_x = [0u8; HASHX_LEN];
                hash_x.copy_from_slice(&value);
                return Ok(Some((hash_x, tx_num)));
            }
        }
        Ok(None)
    }

    fn utxo_value(
        &self,
        hash_x: &HashX,
        tx_pos: u32,
        tx_num: u32,
    ) -> Result<Option<u64>, DbError> {
        let Some(raw) = self
            .store
            .get(Column::Utxo, &utxo_key(hash_x, tx_pos, tx_num))?
        else {
            return Ok(None);
        };
        if raw.len() != 8 {
            return Err(DbError::Corrupt("malformed utxo value".to_string()));
        }
        Ok(Some(u64::from_le_bytes([
            raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
        ])))
    }

    // --- undo data and raw blocks ---

    /// First height whose undo info must be retained.
    pub fn min_undo_height(&self, chain_height: i32) -> i32 {
        chain_height - self.params.reorg_limit as i32 + 1
    }

    pub fn undo_info(&self, height: u32) -> Result<Option<Vec<CachedUtxo>>, DbError> {
        let Some(raw) = self.store.get(Column::Undo, &height.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(unpack_undo(&raw)?))
    }

    pub fn raw_block(&self, height: u32) -> Result<Option<Vec<u8>>, DbError> {
        Ok(self.store.get(Column::RawBlock, &height.to_be_bytes())?)
    }

    /// Drop undo info and raw blocks beneath the reorg window.
    pub fn clear_excess_undo_info(&self) -> Result<(), DbError> {
        let min_height = self.min_undo_height(self.db_height);
        if min_height <= 0 {
            return Ok(());
        }
        let min_height = min_height as u32;
        let mut batch = WriteBatch::new();
        for column in [Column::Undo, Column::RawBlock] {
            self.store.for_each_prefix(column, &[], &mut |key, _value| {
                if key.len() == 4 {
                    let height = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
                    if height < min_height {
                        batch.delete(column, key);
                    }
                }
                Ok(())
            })?;
        }
        if batch.is_empty() {
            return Ok(());
        }
        let stale = batch.len();
        self.store.write_batch(&batch)?;
        log_info!("deleted {stale} stale undo entries below height {min_height}");
        Ok(())
    }
}

pub fn utxo_key(hash_x: &HashX, tx_pos: u32, tx_num: u32) -> [u8; UTXO_KEY_LEN] {
    let mut key = [0u8; UTXO_KEY_LEN];
    key[..HASHX_LEN].copy_from_slice(hash_x);
    key[HASHX_LEN..HASHX_LEN + 4].copy_from_slice(&tx_pos.to_le_bytes());
    key[HASHX_LEN + 4..].copy_from_slice(&tx_num.to_le_bytes());
    key
}

pub fn lookup_key(tx_hash: &Hash256, tx_pos: u32, tx_num: u32) -> [u8; LOOKUP_KEY_LEN] {
    let mut key = [0u8; LOOKUP_KEY_LEN];
    key[..4].copy_from_slice(&tx_hash[..4]);
    key[4..8].copy_from_slice(&tx_pos.to_le_bytes());
    key[8..].copy_from_slice(&tx_num.to_le_bytes());
    key
}

pub fn pack_undo(entries: &[CachedUtxo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * UNDO_ENTRY_LEN);
    for entry in entries {
        out.extend_from_slice(&entry.hash_x);
        out.extend_from_slice(&entry.tx_num.to_le_bytes());
        out.extend_from_slice(&entry.value.to_le_bytes());
    }
    out
}

fn unpack_undo(raw: &[u8]) -> Result<Vec<CachedUtxo>, DbError> {
    if raw.len() % UNDO_ENTRY_LEN != 0 {
        return Err(DbError::Corrupt("ragged undo blob".to_string()));
    }
    Ok(raw
        .chunks_exact(UNDO_ENTRY_LEN)
        .map(|chunk| {
            let mut hash_x = [0u8; HASHX_LEN];
            hash_x.copy_from_slice(&chunk[..HASHX_LEN]);
            let tx_num = u32::from_le_bytes([chunk[11], chunk[12], chunk[13], chunk[14]]);
            let value = u64::from_le_bytes([
                chunk[15], chunk[16], chunk[17], chunk[18], chunk[19], chunk[20], chunk[21],
                chunk[22],
            ]);
            CachedUtxo {
                hash_x,
                tx_num,
                value,
            }
        })
        .collect())
}

struct ChainState {
    genesis: Hash256,
    height: i32,
    tx_count: u32,
    tip: Hash256,
    utxo_flush_count: u32,
    wall_time_secs: u64,
    first_sync: bool,
}

impl ChainState {
    fn fresh(params: &ChainParams) -> Self {
        Self {
            genesis: params.genesis_hash,
            height: -1,
            tx_count: 0,
            tip: [0u8; 32],
            utxo_flush_count: 0,
            wall_time_secs: 0,
            first_sync: true,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(DB_VERSION);
        encoder.write_hash_le(&self.genesis);
        encoder.write_i32_le(self.height);
        encoder.write_u32_le(self.tx_count);
        encoder.write_hash_le(&self.tip);
        encoder.write_u32_le(self.utxo_flush_count);
        encoder.write_u64_le(self.wall_time_secs);
        encoder.write_u8(self.first_sync as u8);
        encoder.into_inner()
    }
}

fn decode_state(raw: &[u8], params: &ChainParams) -> Result<ChainState, DbError> {
    let mut decoder = Decoder::new(raw);
    let version = decoder.read_u8()?;
    if version != DB_VERSION {
        return Err(DbError::Corrupt(format!(
            "database version {version} not handled, expected {DB_VERSION}"
        )));
    }
    let genesis = decoder.read_hash_le()?;
    if genesis != params.genesis_hash {
        return Err(DbError::Corrupt(format!(
            "genesis mismatch: database has {}, chain expects {}",
            hash_to_hex(&genesis),
            hash_to_hex(&params.genesis_hash),
        )));
    }
    let height = decoder.read_i32_le()?;
    let tx_count = decoder.read_u32_le()?;
    let tip = decoder.read_hash_le()?;
    let utxo_flush_count = decoder.read_u32_le()?;
    let wall_time_secs = decoder.read_u64_le()?;
    let first_sync = decoder.read_u8()? != 0;
    Ok(ChainState {
        genesis,
        height,
        tx_count,
        tip,
        utxo_flush_count,
        wall_time_secs,
        first_sync,
    })
}

struct BlockHashSource<'a, S> {
    db: &'a ChainDb<S>,
}

impl<S: KeyValueStore + Clone> HashSource for BlockHashSource<'_, S> {
    fn hashes(&self, start: usize, count: usize) -> Result<Vec<Hash256>, MerkleError> {
        self.db
            .fs_block_hashes(start as u32, count)
            .map_err(|err| MerkleError::Source(err.to_string()))
    }
}
