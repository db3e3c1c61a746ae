//! Mempool mirror keyed by hashX, with fee histogram support.
//!
//! Transactions arrive with unresolved inputs. Each sync pass runs the
//! resolution to a fixed point: an input resolves against either another
//! mempool transaction's outputs or the confirmed UTXO set. Whatever is
//! still unresolved stays pending and is retried on the next pass.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use utxod_chain::{ChainCodec, HashX};
use utxod_db::chaindb::ChainDb;
use utxod_db::DbError;
use utxod_log::{log_debug, log_info};
use utxod_primitives::encoding::decode;
use utxod_primitives::transaction::Transaction;
use utxod_primitives::Hash256;
use utxod_storage::KeyValueStore;

use crate::daemon::{MempoolSource, SourceError};

const REFRESH_INTERVAL_SECS: u64 = 5;
/// Raw transactions are fetched in chunks of this many hashes.
const REQUEST_CHUNK: usize = 200;
/// First histogram bin covers this many bytes; each following bin grows
/// geometrically so the compact histogram stays small for any backlog.
const HISTOGRAM_BIN_BYTES: f64 = 100_000.0;
const HISTOGRAM_BIN_GROWTH: f64 = 1.1;

#[derive(Debug)]
pub enum MempoolError {
    Db(DbError),
    Source(SourceError),
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MempoolError::Db(err) => write!(f, "db: {err}"),
            MempoolError::Source(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for MempoolError {}

impl From<DbError> for MempoolError {
    fn from(err: DbError) -> Self {
        MempoolError::Db(err)
    }
}

impl From<SourceError> for MempoolError {
    fn from(err: SourceError) -> Self {
        MempoolError::Source(err)
    }
}

#[derive(Clone, Debug)]
pub struct MempoolTx {
    /// Inputs not yet matched to a funding output.
    pub prevouts: Vec<(Hash256, u32)>,
    /// Resolved inputs; `None` until every prevout is accounted for.
    pub in_pairs: Option<Vec<(HashX, u64)>>,
    pub out_pairs: Vec<(HashX, u64)>,
    pub fee: u64,
    pub size: usize,
}

/// One unconfirmed transaction touching a hashX.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxSummary {
    pub hash: Hash256,
    pub fee: u64,
    pub has_unconfirmed_inputs: bool,
}

pub struct Mempool<S, A> {
    db: Arc<RwLock<ChainDb<S>>>,
    api: A,
    txs: HashMap<Hash256, MempoolTx>,
    hashxs: HashMap<HashX, HashSet<Hash256>>,
    touched: HashSet<HashX>,
}

impl<S: KeyValueStore + Clone, A: MempoolSource> Mempool<S, A> {
    pub fn new(db: Arc<RwLock<ChainDb<S>>>, api: A) -> Self {
        Self {
            db,
            api,
            txs: HashMap::new(),
            hashxs: HashMap::new(),
            touched: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn drain_touched(&mut self) -> HashSet<HashX> {
        std::mem::take(&mut self.touched)
    }

    /// Refresh on an interval until shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), MempoolError> {
        loop {
            self.refresh_once().await?;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(REFRESH_INTERVAL_SECS)) => {}
            }
        }
    }

    /// One synchronization pass against the source.
    pub async fn refresh_once(&mut self) -> Result<(), MempoolError> {
        let hashes = self.stable_hashes().await?;
        let hashes: HashSet<Hash256> = hashes.into_iter().collect();

        let gone: Vec<Hash256> = self
            .txs
            .keys()
            .filter(|hash| !hashes.contains(*hash))
            .copied()
            .collect();
        for hash in &gone {
            self.evict(hash);
        }

        let missing: Vec<Hash256> = hashes
            .iter()
            .filter(|hash| !self.txs.contains_key(*hash))
            .copied()
            .collect();
        let fetched = self.fetch_transactions(&missing).await?;
        let added = fetched.len();
        for (hash, tx) in fetched {
            self.txs.insert(hash, tx);
        }
        self.resolve();
        if added > 0 || !gone.is_empty() {
            log_debug!(
                "mempool synchronized: {} txs ({added} new, {} gone)",
                self.txs.len(),
                gone.len(),
            );
        }
        Ok(())
    }

    /// Mempool hashes from a snapshot the source's chain tip did not
    /// move under.
    async fn stable_hashes(&self) -> Result<Vec<Hash256>, MempoolError> {
        loop {
            let height = self.api.height().await?;
            let hashes = self.api.mempool_hashes().await?;
            if self.api.height().await? == height {
                return Ok(hashes);
            }
            log_debug!("mempool snapshot raced a block, retrying");
        }
    }

    async fn fetch_transactions(
        &self,
        hashes: &[Hash256],
    ) -> Result<Vec<(Hash256, MempoolTx)>, MempoolError> {
        let mut out = Vec::with_capacity(hashes.len());
        let codec = {
            let db = self.db.read().expect("chain db lock");
            Arc::clone(&db.codec)
        };
        for chunk in hashes.chunks(REQUEST_CHUNK) {
            let raws = self.api.raw_transactions(chunk).await?;
            for (hash, raw) in chunk.iter().zip(raws) {
                let Some(raw) = raw else {
                    continue;
                };
                let Ok(tx) = decode::<Transaction>(&raw) else {
                    log_info!("dropping undecodable mempool transaction");
                    continue;
                };
                // Coinbase prevouts cannot appear in a mempool tx; a
                // source in a race may still hand one over.
                if tx.is_coinbase() {
                    continue;
                }
                let prevouts = tx
                    .inputs
                    .iter()
                    .map(|input| (input.prevout.hash, input.prevout.index))
                    .collect();
                let out_pairs = tx
                    .outputs
                    .iter()
                    .filter_map(|output| {
                        codec
                            .hash_x_from_script(&output.script_pubkey)
                            .map(|hash_x| (hash_x, output.value))
                    })
                    .collect();
                out.push((
                    *hash,
                    MempoolTx {
                        prevouts,
                        in_pairs: None,
                        out_pairs,
                        fee: 0,
                        size: raw.len(),
                    },
                ));
            }
        }
        Ok(out)
    }

    /// Run input resolution to a fixed point over the whole pool.
    fn resolve(&mut self) {
        loop {
            let unresolved: Vec<Hash256> = self
                .txs
                .iter()
                .filter(|(_, tx)| tx.in_pairs.is_none())
                .map(|(hash, _)| *hash)
                .collect();
            if unresolved.is_empty() {
                return;
            }
            let mut progressed = false;
            for hash in unresolved {
                if self.try_resolve(&hash) {
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
    }

    fn try_resolve(&mut self, hash: &Hash256) -> bool {
        let prevouts = match self.txs.get(hash) {
            Some(tx) => tx.prevouts.clone(),
            None => return false,
        };
        let mut in_pairs = Vec::with_capacity(prevouts.len());
        let mut confirmed = Vec::new();
        for (prev_hash, prev_idx) in &prevouts {
            match self.txs.get(prev_hash) {
                // Only an accepted parent can fund a child; a pending
                // parent keeps the child waiting with it.
                Some(parent) if parent.in_pairs.is_some() => {
                    // hashX-less parent outputs (unspendables) cannot be
                    // spent; treat a reference to one as unresolvable.
                    match parent.out_pairs.get(*prev_idx as usize) {
                        Some(pair) => in_pairs.push(Some(*pair)),
                        None => return false,
                    }
                }
                Some(_) => return false,
                None => {
                    confirmed.push((*prev_hash, *prev_idx));
                    in_pairs.push(None);
                }
            }
        }
        if !confirmed.is_empty() {
            let resolved = {
                let db = self.db.read().expect("chain db lock");
                match db.lookup_utxos(&confirmed) {
                    Ok(resolved) => resolved,
                    Err(_) => return false,
                }
            };
            let mut iter = resolved.into_iter();
            for slot in in_pairs.iter_mut() {
                if slot.is_none() {
                    match iter.next().flatten() {
                        Some(pair) => *slot = Some(pair),
                        None => return false,
                    }
                }
            }
        }
        let in_pairs: Vec<(HashX, u64)> = in_pairs.into_iter().flatten().collect();
        let value_in: u64 = in_pairs.iter().map(|(_, value)| value).sum();
        let Some(tx) = self.txs.get_mut(hash) else {
            return false;
        };
        let value_out: u64 = tx.out_pairs.iter().map(|(_, value)| value).sum();
        tx.fee = value_in.saturating_sub(value_out);
        tx.in_pairs = Some(in_pairs);

        let tx = &self.txs[hash];
        let mut affected: HashSet<HashX> = tx.out_pairs.iter().map(|(hash_x, _)| *hash_x).collect();
        if let Some(in_pairs) = &tx.in_pairs {
            affected.extend(in_pairs.iter().map(|(hash_x, _)| *hash_x));
        }
        for hash_x in affected {
            self.hashxs.entry(hash_x).or_default().insert(*hash);
            self.touched.insert(hash_x);
        }
        true
    }

    fn evict(&mut self, hash: &Hash256) {
        let Some(tx) = self.txs.remove(hash) else {
            return;
        };
        let mut affected: HashSet<HashX> = tx.out_pairs.iter().map(|(hash_x, _)| *hash_x).collect();
        if let Some(in_pairs) = tx.in_pairs {
            affected.extend(in_pairs.into_iter().map(|(hash_x, _)| hash_x));
        }
        for hash_x in affected {
            if let Some(set) = self.hashxs.get_mut(&hash_x) {
                set.remove(hash);
                if set.is_empty() {
                    self.hashxs.remove(&hash_x);
                }
            }
            self.touched.insert(hash_x);
        }
    }

    // --- queries ---

    /// Unconfirmed transactions touching a hashX, flagged when they spend
    /// other unconfirmed outputs.
    pub fn transaction_summaries(&self, hash_x: &HashX) -> Vec<TxSummary> {
        let Some(hashes) = self.hashxs.get(hash_x) else {
            return Vec::new();
        };
        let mut out: Vec<TxSummary> = hashes
            .iter()
            .filter_map(|hash| {
                let tx = self.txs.get(hash)?;
                Some(TxSummary {
                    hash: *hash,
                    fee: tx.fee,
                    has_unconfirmed_inputs: tx
                        .prevouts
                        .iter()
                        .any(|(prev_hash, _)| self.txs.contains_key(prev_hash)),
                })
            })
            .collect();
        out.sort_by_key(|summary| summary.hash);
        out
    }

    /// Net unconfirmed value change for a hashX, in satoshis.
    pub fn balance_delta(&self, hash_x: &HashX) -> i64 {
        let Some(hashes) = self.hashxs.get(hash_x) else {
            return 0;
        };
        let mut delta = 0i64;
        for hash in hashes {
            let Some(tx) = self.txs.get(hash) else {
                continue;
            };
            for (out_hash_x, value) in &tx.out_pairs {
                if out_hash_x == hash_x {
                    delta += *value as i64;
                }
            }
            if let Some(in_pairs) = &tx.in_pairs {
                for (in_hash_x, value) in in_pairs {
                    if in_hash_x == hash_x {
                        delta -= *value as i64;
                    }
                }
            }
        }
        delta
    }

    /// Outputs created in the mempool for a hashX, in no particular
    /// order.
    pub fn unordered_utxos(&self, hash_x: &HashX) -> Vec<(Hash256, u32, u64)> {
        let Some(hashes) = self.hashxs.get(hash_x) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for hash in hashes {
            let Some(tx) = self.txs.get(hash) else {
                continue;
            };
            for (idx, (out_hash_x, value)) in tx.out_pairs.iter().enumerate() {
                if out_hash_x == hash_x {
                    out.push((*hash, idx as u32, *value));
                }
            }
        }
        out
    }

    /// Every outpoint spent by transactions touching a hashX. The caller
    /// filters its confirmed UTXOs against this set.
    pub fn potential_spends(&self, hash_x: &HashX) -> HashSet<(Hash256, u32)> {
        let Some(hashes) = self.hashxs.get(hash_x) else {
            return HashSet::new();
        };
        let mut out = HashSet::new();
        for hash in hashes {
            if let Some(tx) = self.txs.get(hash) {
                out.extend(tx.prevouts.iter().copied());
            }
        }
        out
    }

    /// Compact fee histogram: (integer fee rate in sat/byte, bin size in
    /// bytes), fee rates descending. The bins cover every accepted
    /// transaction; the last one may be smaller than its threshold.
    pub fn fee_histogram(&self) -> Vec<(u64, usize)> {
        let mut by_rate: BTreeMap<u64, usize> = BTreeMap::new();
        for tx in self.txs.values() {
            if tx.in_pairs.is_some() && tx.size > 0 {
                *by_rate.entry(tx.fee / tx.size as u64).or_insert(0) += tx.size;
            }
        }

        let mut out = Vec::new();
        let mut bin_size = HISTOGRAM_BIN_BYTES;
        let mut cum_size = 0usize;
        let mut cum_rate = 0u64;
        for (&rate, &size) in by_rate.iter().rev() {
            cum_size += size;
            cum_rate = rate;
            if cum_size as f64 > bin_size {
                out.push((rate, cum_size));
                cum_size = 0;
                bin_size *= HISTOGRAM_BIN_GROWTH;
            }
        }
        if cum_size > 0 {
            out.push((cum_rate, cum_size));
        }
        out
    }
}
