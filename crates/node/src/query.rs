//! Read-side facade over the chain database.
//!
//! History reads are cached per hashX; the sync pipeline invalidates
//! entries through the touched sets it drains after each batch. Reads
//! that race a reorg can see tx_nums past the flushed files; those are
//! retried briefly before giving up.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use utxod_chain::HashX;
use utxod_db::chaindb::{ChainDb, HistoryItem, Utxo};
use utxod_db::DbError;
use utxod_log::log_warn;
use utxod_primitives::Hash256;
use utxod_storage::KeyValueStore;

const DEFAULT_CACHE_ENTRIES: usize = 1000;
const RETRY_DELAY_MS: u64 = 250;
const RETRY_LIMIT: usize = 8;

/// LRU map from hashX to its cached confirmed history.
struct HistoryCache {
    entries: HashMap<HashX, (u64, Arc<Vec<HistoryItem>>)>,
    by_use: BTreeMap<u64, HashX>,
    next_stamp: u64,
    capacity: usize,
}

impl HistoryCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_use: BTreeMap::new(),
            next_stamp: 0,
            capacity: capacity.max(1),
        }
    }

    fn get(&mut self, hash_x: &HashX) -> Option<Arc<Vec<HistoryItem>>> {
        let (stamp, items) = self.entries.get_mut(hash_x)?;
        let old = *stamp;
        *stamp = self.next_stamp;
        let items = Arc::clone(items);
        self.by_use.remove(&old);
        self.by_use.insert(self.next_stamp, *hash_x);
        self.next_stamp += 1;
        Some(items)
    }

    fn insert(&mut self, hash_x: HashX, items: Arc<Vec<HistoryItem>>) {
        if let Some((old, _)) = self.entries.remove(&hash_x) {
            self.by_use.remove(&old);
        }
        self.entries.insert(hash_x, (self.next_stamp, items));
        self.by_use.insert(self.next_stamp, hash_x);
        self.next_stamp += 1;
        while self.entries.len() > self.capacity {
            let Some((_, evicted)) = self.by_use.pop_first() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }

    fn remove(&mut self, hash_x: &HashX) {
        if let Some((stamp, _)) = self.entries.remove(hash_x) {
            self.by_use.remove(&stamp);
        }
    }
}

pub struct Query<S> {
    db: Arc<RwLock<ChainDb<S>>>,
    history_cache: Mutex<HistoryCache>,
}

impl<S: KeyValueStore + Clone> Query<S> {
    pub fn new(db: Arc<RwLock<ChainDb<S>>>) -> Self {
        Self::with_cache_entries(db, DEFAULT_CACHE_ENTRIES)
    }

    pub fn with_cache_entries(db: Arc<RwLock<ChainDb<S>>>, entries: usize) -> Self {
        Self {
            db,
            history_cache: Mutex::new(HistoryCache::new(entries)),
        }
    }

    /// Drop cached history for every hashX a sync batch touched.
    pub fn invalidate(&self, touched: &HashSet<HashX>) {
        let mut cache = self.history_cache.lock().expect("history cache lock");
        for hash_x in touched {
            cache.remove(hash_x);
        }
    }

    /// Confirmed history for a hashX, oldest first.
    pub async fn history(&self, hash_x: &HashX) -> Result<Arc<Vec<HistoryItem>>, DbError> {
        {
            let mut cache = self.history_cache.lock().expect("history cache lock");
            if let Some(items) = cache.get(hash_x) {
                return Ok(items);
            }
        }
        let mut items = self.read_history(hash_x)?;
        let mut retries = 0;
        while items.iter().any(|item| item.tx_hash.is_none()) {
            retries += 1;
            if retries > RETRY_LIMIT {
                log_warn!("history read kept racing a reorg, returning partial result");
                return Ok(Arc::new(items));
            }
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            items = self.read_history(hash_x)?;
        }
        let items = Arc::new(items);
        let mut cache = self.history_cache.lock().expect("history cache lock");
        cache.insert(*hash_x, Arc::clone(&items));
        Ok(items)
    }

    fn read_history(&self, hash_x: &HashX) -> Result<Vec<HistoryItem>, DbError> {
        let db = self.db.read().expect("chain db lock");
        db.limited_history(hash_x, None)
    }

    /// Confirmed UTXOs for a hashX, with the same reorg-race retry as
    /// history reads.
    pub async fn utxos(&self, hash_x: &HashX) -> Result<Vec<Utxo>, DbError> {
        let mut retries = 0;
        loop {
            let utxos = {
                let db = self.db.read().expect("chain db lock");
                db.all_utxos(hash_x)?
            };
            if utxos.iter().all(|utxo| utxo.tx_hash.is_some()) {
                return Ok(utxos);
            }
            retries += 1;
            if retries > RETRY_LIMIT {
                log_warn!("utxo read kept racing a reorg, returning partial result");
                return Ok(utxos);
            }
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }
    }

    pub async fn confirmed_balance(&self, hash_x: &HashX) -> Result<u64, DbError> {
        let utxos = self.utxos(hash_x).await?;
        Ok(utxos.iter().map(|utxo| utxo.value).sum())
    }

    pub fn raw_header(&self, height: u32) -> Result<Vec<u8>, DbError> {
        let db = self.db.read().expect("chain db lock");
        db.raw_header(height)
    }

    pub fn headers(&self, start: u32, count: usize) -> Result<Vec<Vec<u8>>, DbError> {
        let db = self.db.read().expect("chain db lock");
        db.read_headers(start, count)
    }

    /// Merkle branch and root over the first `length` headers for the
    /// header at `height`.
    pub fn header_branch_and_root(
        &self,
        length: usize,
        height: u32,
    ) -> Result<(Vec<Hash256>, Hash256), DbError> {
        let db = self.db.read().expect("chain db lock");
        db.header_branch_and_root(length, height)
    }

    pub fn db_height(&self) -> i32 {
        self.db.read().expect("chain db lock").db_height
    }
}
