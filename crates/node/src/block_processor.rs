//! Block sync pipeline: prefetch, advance, reorg, flush scheduling.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use utxod_chain::{Block, ChainCodec, CodecError, HashX};
use utxod_db::chaindb::{lookup_key, pack_undo, utxo_key, CachedUtxo, ChainDb, FlushData};
use utxod_db::DbError;
use utxod_log::{log_info, log_warn};
use utxod_primitives::{hash_to_hex, Hash256};
use utxod_storage::KeyValueStore;

use crate::daemon::{ChainSource, SourceError};

/// Prefetch refills until roughly this much raw block data is in flight.
const PREFETCH_TARGET_BYTES: usize = 10 * 1024 * 1024;
const MAX_PREFETCH_BLOCKS: usize = 2500;
const INITIAL_AVE_BLOCK_SIZE: usize = 150_000;
const POLL_INTERVAL_SECS: u64 = 5;

pub const DEFAULT_FLUSH_THRESHOLD: usize = 200_000;

#[derive(Debug)]
pub enum ProcessError {
    Db(DbError),
    Source(SourceError),
    Codec(CodecError),
    Chain(String),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::Db(err) => write!(f, "db: {err}"),
            ProcessError::Source(err) => write!(f, "{err}"),
            ProcessError::Codec(err) => write!(f, "{err}"),
            ProcessError::Chain(message) => write!(f, "chain: {message}"),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<DbError> for ProcessError {
    fn from(err: DbError) -> Self {
        ProcessError::Db(err)
    }
}

impl From<SourceError> for ProcessError {
    fn from(err: SourceError) -> Self {
        ProcessError::Source(err)
    }
}

impl From<CodecError> for ProcessError {
    fn from(err: CodecError) -> Self {
        ProcessError::Codec(err)
    }
}

pub struct BlockProcessor<S, C> {
    db: Arc<RwLock<ChainDb<S>>>,
    source: C,
    flush_data: FlushData,
    tip: Hash256,
    touched: HashSet<HashX>,
    ave_block_size: usize,
    /// Flush once this many UTXO cache plus history entries accumulate.
    flush_threshold: usize,
}

impl<S: KeyValueStore + Clone, C: ChainSource> BlockProcessor<S, C> {
    pub fn new(db: Arc<RwLock<ChainDb<S>>>, source: C, flush_threshold: usize) -> Self {
        let mut flush_data = FlushData::new();
        let tip = {
            let db = db.read().expect("chain db lock");
            flush_data.height = db.db_height;
            flush_data.tx_count = db.db_tx_count;
            flush_data.tip = db.db_tip;
            db.db_tip
        };
        Self {
            db,
            source,
            flush_data,
            tip,
            touched: HashSet::new(),
            ave_block_size: INITIAL_AVE_BLOCK_SIZE,
            flush_threshold: flush_threshold.max(1),
        }
    }

    pub fn height(&self) -> i32 {
        self.flush_data.height
    }

    /// hashXs touched since the last drain, for cache invalidation.
    pub fn drain_touched(&mut self) -> HashSet<HashX> {
        std::mem::take(&mut self.touched)
    }

    /// Advance until level with the source, then flush everything.
    pub async fn catch_up(&mut self) -> Result<(), ProcessError> {
        loop {
            let daemon_height = self.source.height().await?;
            if self.flush_data.height >= daemon_height {
                break;
            }
            self.sync_to(daemon_height).await?;
        }
        self.flush(true)?;

        let db_arc = Arc::clone(&self.db);
        let mut db = db_arc.write().expect("chain db lock");
        if db.first_sync {
            db.first_sync = false;
            db.flush_state()?;
            log_info!("initial sync complete at height {}", db.db_height);
        }
        Ok(())
    }

    /// Catch up, then poll for new blocks until shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ProcessError> {
        loop {
            self.catch_up().await?;
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
            }
        }
        self.flush(true)?;
        Ok(())
    }

    async fn sync_to(&mut self, daemon_height: i32) -> Result<(), ProcessError> {
        while self.flush_data.height < daemon_height {
            let first = (self.flush_data.height + 1) as u32;
            let remaining = (daemon_height - self.flush_data.height) as usize;
            let count = (PREFETCH_TARGET_BYTES / self.ave_block_size.max(1))
                .clamp(1, MAX_PREFETCH_BLOCKS)
                .min(remaining);
            let hashes = self.source.block_hashes(first, count).await?;
            if hashes.is_empty() {
                break;
            }
            let raw_blocks = self.source.raw_blocks(&hashes).await?;
            if raw_blocks.len() != hashes.len() {
                return Err(ProcessError::Source(SourceError::Protocol(format!(
                    "asked for {} blocks, received {}",
                    hashes.len(),
                    raw_blocks.len(),
                ))));
            }
            let total: usize = raw_blocks.iter().map(|raw| raw.len()).sum();
            self.ave_block_size =
                (total + 9 * raw_blocks.len() * self.ave_block_size) / (10 * raw_blocks.len());

            if !self.advance_blocks(&raw_blocks, first, daemon_height)? {
                self.reorg(None, daemon_height).await?;
                return Ok(());
            }

            let pending = {
                let db = self.db.read().expect("chain db lock");
                self.flush_data.adds.len() + db.history.unflushed_count()
            };
            if pending >= self.flush_threshold {
                self.flush(true)?;
            }
        }
        Ok(())
    }

    /// Returns false when the first block does not build on our tip and a
    /// reorg is needed.
    fn advance_blocks(
        &mut self,
        raw_blocks: &[Vec<u8>],
        first: u32,
        daemon_height: i32,
    ) -> Result<bool, ProcessError> {
        let db_arc = Arc::clone(&self.db);
        let mut db = db_arc.write().expect("chain db lock");
        for (offset, raw) in raw_blocks.iter().enumerate() {
            let height = first + offset as u32;
            let block = db.codec.parse_block(raw)?;
            if height == 0 {
                let hash = db.codec.header_hash(&block.header);
                if hash != db.params.genesis_hash {
                    return Err(ProcessError::Chain(format!(
                        "genesis block {} does not match the configured chain",
                        hash_to_hex(&hash),
                    )));
                }
            } else {
                let prev = db.codec.header_prevhash(&block.header)?;
                if prev != self.tip {
                    if offset == 0 {
                        log_info!("block at height {height} does not build on our tip");
                        return Ok(false);
                    }
                    return Err(ProcessError::Chain(format!(
                        "blocks from source do not link at height {height}"
                    )));
                }
            }
            self.advance_block(&mut db, &block, raw, height, daemon_height)?;
        }
        Ok(true)
    }

    fn advance_block(
        &mut self,
        db: &mut ChainDb<S>,
        block: &Block,
        raw: &[u8],
        height: u32,
        daemon_height: i32,
    ) -> Result<(), ProcessError> {
        let first_tx_num = self.flush_data.tx_count;
        let mut undo = Vec::new();
        let mut hashxs_by_tx = Vec::with_capacity(block.txs.len());

        for (tx_offset, block_tx) in block.txs.iter().enumerate() {
            let tx_num = first_tx_num + tx_offset as u32;
            let mut tx_hashxs = HashSet::new();
            if !block_tx.tx.is_coinbase() {
                for input in &block_tx.tx.inputs {
                    let spent =
                        self.spend_utxo(db, &input.prevout.hash, input.prevout.index, height)?;
                    tx_hashxs.insert(spent.hash_x);
                    undo.push(spent);
                }
            }
            for (idx, output) in block_tx.tx.outputs.iter().enumerate() {
                if let Some(hash_x) = db.codec.hash_x_from_script(&output.script_pubkey) {
                    self.flush_data.adds.insert(
                        (block_tx.hash, idx as u32),
                        CachedUtxo {
                            hash_x,
                            tx_num,
                            value: output.value,
                        },
                    );
                    tx_hashxs.insert(hash_x);
                }
            }
            self.touched.extend(tx_hashxs.iter().copied());
            hashxs_by_tx.push(tx_hashxs);
        }
        db.history.add_unflushed(&hashxs_by_tx, first_tx_num);

        self.flush_data.tx_count += block.txs.len() as u32;
        db.tx_counts.push(self.flush_data.tx_count);
        self.flush_data.height = height as i32;
        self.tip = db.codec.header_hash(&block.header);
        self.flush_data.tip = self.tip;
        self.flush_data.headers.push(block.header.clone());
        self.flush_data
            .block_tx_hashes
            .push(block.txs.iter().map(|block_tx| block_tx.hash).collect());

        if (height as i32) >= db.min_undo_height(daemon_height) {
            self.flush_data.undo_infos.push((height, pack_undo(&undo)));
            self.flush_data.raw_blocks.push((height, raw.to_vec()));
        }
        Ok(())
    }

    fn spend_utxo(
        &mut self,
        db: &ChainDb<S>,
        tx_hash: &Hash256,
        tx_pos: u32,
        height: u32,
    ) -> Result<CachedUtxo, ProcessError> {
        // Outputs created since the last flush are spent straight from the
        // cache and never hit the store.
        if let Some(cached) = self.flush_data.adds.remove(&(*tx_hash, tx_pos)) {
            return Ok(cached);
        }
        let Some((hash_x, tx_num, value)) = db.db_utxo(tx_hash, tx_pos)? else {
            return Err(ProcessError::Chain(format!(
                "spent output {}:{tx_pos} not found at height {height}",
                hash_to_hex(tx_hash),
            )));
        };
        self.flush_data
            .deletes_utxo
            .push(utxo_key(&hash_x, tx_pos, tx_num));
        self.flush_data
            .deletes_lookup
            .push(lookup_key(tx_hash, tx_pos, tx_num));
        Ok(CachedUtxo {
            hash_x,
            tx_num,
            value,
        })
    }

    fn flush(&mut self, flush_utxos: bool) -> Result<(), ProcessError> {
        let db_arc = Arc::clone(&self.db);
        let mut db = db_arc.write().expect("chain db lock");
        db.flush_dbs(&mut self.flush_data, flush_utxos)?;
        Ok(())
    }

    async fn reorg(&mut self, count: Option<usize>, daemon_height: i32) -> Result<(), ProcessError> {
        log_warn!(
            "chain reorganization detected at height {}",
            self.flush_data.height,
        );
        // Flush everything first so the backup works purely against
        // persisted state.
        self.flush(true)?;

        let (start, count) = self.calc_reorg_range(count).await?;
        if count == 0 {
            return Ok(());
        }
        let min_undo = {
            let db = self.db.read().expect("chain db lock");
            db.min_undo_height(daemon_height)
        };
        if (start as i32) < min_undo {
            return Err(ProcessError::Chain(format!(
                "reorg of {count} blocks from height {start} is deeper than the undo window"
            )));
        }

        let blocks = self.reorg_raw_blocks(start, count).await?;
        self.backup_blocks(&blocks)?;

        let db_arc = Arc::clone(&self.db);
        let mut db = db_arc.write().expect("chain db lock");
        db.flush_backup(&mut self.flush_data, &self.touched)?;
        log_warn!(
            "reorg complete: chain rewound to height {}",
            self.flush_data.height,
        );
        Ok(())
    }

    /// Fork point search: walk back in doubling windows comparing our
    /// block hashes with the source's until a common prefix appears.
    async fn calc_reorg_range(&mut self, count: Option<usize>) -> Result<(u32, usize), ProcessError> {
        let db_height = self.flush_data.height;
        if let Some(count) = count {
            let start = (db_height - count as i32 + 1).max(0) as u32;
            return Ok((start, count));
        }

        let mut start = db_height as i64 - 1;
        let mut count = 1i64;
        while start > 0 {
            let ours = {
                let db = self.db.read().expect("chain db lock");
                db.fs_block_hashes(start as u32, count as usize)?
            };
            let theirs = self.source.block_hashes(start as u32, count as usize).await?;
            let common = ours
                .iter()
                .zip(theirs.iter())
                .take_while(|(a, b)| a == b)
                .count();
            if common > 0 {
                start += common as i64;
                break;
            }
            count = (count * 2).min(start);
            start -= count;
        }
        let start = start.max(0) as u32;
        let count = (db_height - start as i32 + 1) as usize;
        log_warn!("reorg range: {count} blocks from height {start}");
        Ok((start, count))
    }

    /// The blocks being backed out, newest first. Raw blocks come from
    /// the store's reorg window, falling back to a by-hash fetch for
    /// anything already pruned.
    async fn reorg_raw_blocks(
        &mut self,
        start: u32,
        count: usize,
    ) -> Result<Vec<(u32, Vec<u8>)>, ProcessError> {
        let (stored, hashes) = {
            let db = self.db.read().expect("chain db lock");
            let hashes = db.fs_block_hashes(start, count)?;
            let mut stored = Vec::with_capacity(count);
            for offset in 0..count {
                stored.push(db.raw_block(start + offset as u32)?);
            }
            (stored, hashes)
        };
        let mut blocks = Vec::with_capacity(count);
        for (offset, raw) in stored.into_iter().enumerate() {
            let height = start + offset as u32;
            let raw = match raw {
                Some(raw) => raw,
                None => {
                    let mut fetched =
                        self.source.raw_blocks(&hashes[offset..offset + 1]).await?;
                    fetched.pop().ok_or_else(|| {
                        SourceError::Protocol("source returned no block for hash".to_string())
                    })?
                }
            };
            blocks.push((height, raw));
        }
        blocks.reverse();
        Ok(blocks)
    }

    /// Undo blocks against flushed state, newest first. Spent outputs are
    /// restored from undo info; created outputs are deleted.
    fn backup_blocks(&mut self, blocks: &[(u32, Vec<u8>)]) -> Result<(), ProcessError> {
        let db_arc = Arc::clone(&self.db);
        let db = db_arc.write().expect("chain db lock");
        for (height, raw) in blocks {
            let block = db.codec.parse_block(raw)?;
            let hash = db.codec.header_hash(&block.header);
            if hash != self.tip {
                return Err(ProcessError::Chain(format!(
                    "backup block at height {height} does not match our tip"
                )));
            }
            self.backup_block(&db, &block, *height)?;
            self.tip = db.codec.header_prevhash(&block.header)?;
            self.flush_data.tip = self.tip;
            self.flush_data.height = *height as i32 - 1;
            self.flush_data.tx_count -= block.txs.len() as u32;
        }
        Ok(())
    }

    fn backup_block(
        &mut self,
        db: &ChainDb<S>,
        block: &Block,
        height: u32,
    ) -> Result<(), ProcessError> {
        let mut undo = db.undo_info(height)?.ok_or_else(|| {
            ProcessError::Chain(format!("no undo information for height {height}"))
        })?;

        let mut tx_num = self.flush_data.tx_count;
        for block_tx in block.txs.iter().rev() {
            tx_num -= 1;
            for (idx, output) in block_tx.tx.outputs.iter().enumerate() {
                let Some(hash_x) = db.codec.hash_x_from_script(&output.script_pubkey) else {
                    continue;
                };
                // An output restored moments ago by a same-block spender
                // never reached the store.
                if self
                    .flush_data
                    .adds
                    .remove(&(block_tx.hash, idx as u32))
                    .is_none()
                {
                    self.flush_data
                        .deletes_utxo
                        .push(utxo_key(&hash_x, idx as u32, tx_num));
                    self.flush_data
                        .deletes_lookup
                        .push(lookup_key(&block_tx.hash, idx as u32, tx_num));
                }
                self.touched.insert(hash_x);
            }
            if !block_tx.tx.is_coinbase() {
                for input in block_tx.tx.inputs.iter().rev() {
                    let entry = undo.pop().ok_or_else(|| {
                        ProcessError::Chain("undo information too short".to_string())
                    })?;
                    self.flush_data
                        .adds
                        .insert((input.prevout.hash, input.prevout.index), entry);
                    self.touched.insert(entry.hash_x);
                }
            }
        }
        if !undo.is_empty() {
            return Err(ProcessError::Chain("undo information too long".to_string()));
        }
        Ok(())
    }
}
