mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use utxod_db::chaindb::ChainDb;
use utxod_primitives::transaction::Transaction;
use utxod_primitives::Hash256;
use utxod_storage::memory::MemoryStore;

use utxod::block_processor::{BlockProcessor, DEFAULT_FLUSH_THRESHOLD};
use utxod::daemon::{ChainSource, SourceError};
use utxod::query::Query;

use common::{block_on, coinbase, genesis_block, hash_x_for, header_hash, open_db, spend};

#[derive(Default)]
struct FakeChainInner {
    /// Raw blocks by height, the active chain.
    blocks: Vec<Vec<u8>>,
    /// Every block ever produced, forks included.
    by_hash: HashMap<Hash256, Vec<u8>>,
}

#[derive(Clone, Default)]
struct FakeChain {
    inner: Arc<Mutex<FakeChainInner>>,
}

impl FakeChain {
    fn push(&self, raw: Vec<u8>) -> Hash256 {
        let hash = header_hash(&raw);
        let mut inner = self.inner.lock().expect("fake chain lock");
        inner.by_hash.insert(hash, raw.clone());
        inner.blocks.push(raw);
        hash
    }

    /// Replace the chain from `height` upward with a fork.
    fn truncate(&self, height: usize) {
        let mut inner = self.inner.lock().expect("fake chain lock");
        inner.blocks.truncate(height);
    }

    fn tip_hash(&self) -> Hash256 {
        let inner = self.inner.lock().expect("fake chain lock");
        header_hash(inner.blocks.last().expect("nonempty chain"))
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn height(&self) -> Result<i32, SourceError> {
        let inner = self.inner.lock().expect("fake chain lock");
        Ok(inner.blocks.len() as i32 - 1)
    }

    async fn block_hashes(&self, start: u32, count: usize) -> Result<Vec<Hash256>, SourceError> {
        let inner = self.inner.lock().expect("fake chain lock");
        Ok(inner
            .blocks
            .iter()
            .skip(start as usize)
            .take(count)
            .map(|raw| header_hash(raw))
            .collect())
    }

    async fn raw_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Vec<u8>>, SourceError> {
        let inner = self.inner.lock().expect("fake chain lock");
        hashes
            .iter()
            .map(|hash| {
                inner
                    .by_hash
                    .get(hash)
                    .cloned()
                    .ok_or_else(|| SourceError::Protocol("unknown block hash".to_string()))
            })
            .collect()
    }
}

struct Harness {
    chain: FakeChain,
    db: Arc<RwLock<ChainDb<Arc<MemoryStore>>>>,
    processor: BlockProcessor<Arc<MemoryStore>, FakeChain>,
    _dir: tempfile::TempDir,
}

/// Genesis pays 50_000_000 to script A; block 1 moves it to script C and
/// mints a coinbase to B.
fn harness() -> (Harness, Hash256, Hash256) {
    let chain = FakeChain::default();
    let genesis_cb = coinbase(b'A', 50_000_000, 0);
    let genesis_cb_hash = genesis_cb.txid();
    let genesis = genesis_block(&[genesis_cb]);
    let genesis_hash = chain.push(genesis);

    let txs = vec![
        coinbase(b'B', 25_000_000, 1),
        spend(&[(genesis_cb_hash, 0)], &[(b'C', 49_000_000)]),
    ];
    let spend_hash = txs[1].txid();
    chain.push(block_on(genesis_hash, 1, &txs));

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(RwLock::new(open_db(dir.path(), store)));
    let processor = BlockProcessor::new(Arc::clone(&db), chain.clone(), DEFAULT_FLUSH_THRESHOLD);
    (
        Harness {
            chain,
            db,
            processor,
            _dir: dir,
        },
        genesis_cb_hash,
        spend_hash,
    )
}

#[tokio::test]
async fn syncs_chain_and_serves_queries() {
    let (mut harness, genesis_cb_hash, spend_hash) = harness();
    harness.processor.catch_up().await.expect("catch up");
    assert_eq!(harness.processor.height(), 1);

    {
        let db = harness.db.read().expect("chain db lock");
        assert_eq!(db.db_height, 1);
        assert_eq!(db.db_tx_count, 3);
        assert!(!db.first_sync);
    }
    let touched = harness.processor.drain_touched();
    assert!(touched.contains(&hash_x_for(b'A')));
    assert!(touched.contains(&hash_x_for(b'C')));

    let query = Query::new(Arc::clone(&harness.db));
    let history = query.history(&hash_x_for(b'A')).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].tx_hash, Some(genesis_cb_hash));
    assert_eq!(history[0].height, 0);
    assert_eq!(history[1].tx_hash, Some(spend_hash));
    assert_eq!(history[1].height, 1);

    assert!(query.utxos(&hash_x_for(b'A')).await.expect("utxos").is_empty());
    let utxos = query.utxos(&hash_x_for(b'C')).await.expect("utxos");
    assert_eq!(utxos.len(), 1);
    assert_eq!(utxos[0].value, 49_000_000);
    assert_eq!(utxos[0].tx_hash, Some(spend_hash));
    assert_eq!(
        query
            .confirmed_balance(&hash_x_for(b'B'))
            .await
            .expect("balance"),
        25_000_000,
    );
}

#[tokio::test]
async fn follows_new_blocks_after_catch_up() {
    let (mut harness, _, _) = harness();
    harness.processor.catch_up().await.expect("catch up");

    let tip = harness.chain.tip_hash();
    harness
        .chain
        .push(block_on(tip, 2, &[coinbase(b'D', 25_000_000, 2)]));
    harness.processor.catch_up().await.expect("catch up");
    assert_eq!(harness.processor.height(), 2);

    let query = Query::new(Arc::clone(&harness.db));
    assert_eq!(
        query
            .confirmed_balance(&hash_x_for(b'D'))
            .await
            .expect("balance"),
        25_000_000,
    );
}

#[tokio::test]
async fn reorg_rewinds_and_follows_the_fork() {
    let (mut harness, _, _) = harness();
    harness.processor.catch_up().await.expect("catch up");
    let block1_hash = harness.chain.tip_hash();

    // Block 2 spends B's coinbase to D.
    let coinbase_b = coinbase(b'B', 25_000_000, 1);
    let block2_txs = vec![
        coinbase(b'X', 25_000_000, 3),
        spend(&[(coinbase_b.txid(), 0)], &[(b'D', 24_000_000)]),
    ];
    harness.chain.push(block_on(block1_hash, 3, &block2_txs));
    harness.processor.catch_up().await.expect("catch up");
    assert_eq!(harness.processor.height(), 2);

    let query = Query::new(Arc::clone(&harness.db));
    assert!(query.utxos(&hash_x_for(b'B')).await.expect("utxos").is_empty());
    query.invalidate(&harness.processor.drain_touched());

    // The source switches to a fork replacing block 2 and extending it.
    harness.chain.truncate(2);
    let fork2_hash = harness.chain.push(block_on(
        block1_hash,
        4,
        &[coinbase(b'E', 25_000_000, 4)],
    ));
    harness
        .chain
        .push(block_on(fork2_hash, 5, &[coinbase(b'F', 25_000_000, 5)]));

    harness.processor.catch_up().await.expect("catch up");
    assert_eq!(harness.processor.height(), 3);
    query.invalidate(&harness.processor.drain_touched());

    // B's coinbase spend was undone with the orphaned block.
    assert_eq!(
        query
            .confirmed_balance(&hash_x_for(b'B'))
            .await
            .expect("balance"),
        25_000_000,
    );
    assert!(query.utxos(&hash_x_for(b'D')).await.expect("utxos").is_empty());
    assert!(query.utxos(&hash_x_for(b'X')).await.expect("utxos").is_empty());
    assert_eq!(
        query
            .confirmed_balance(&hash_x_for(b'E'))
            .await
            .expect("balance"),
        25_000_000,
    );
    let history = query.history(&hash_x_for(b'B')).await.expect("history");
    assert_eq!(history.len(), 1);

    {
        let db = harness.db.read().expect("chain db lock");
        assert_eq!(db.db_height, 3);
        assert_eq!(db.db_tx_count, 5);
    }
}

#[tokio::test]
async fn rejects_wrong_genesis_block() {
    let chain = FakeChain::default();
    // A regtest database fed a non-regtest genesis block.
    let bogus = block_on([9u8; 32], 7, &[coinbase(b'A', 50_000_000, 0)]);
    chain.push(bogus);

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(RwLock::new(open_db(dir.path(), store)));
    let mut processor = BlockProcessor::new(db, chain, DEFAULT_FLUSH_THRESHOLD);
    assert!(processor.catch_up().await.is_err());
}

#[tokio::test]
async fn spends_within_one_batch_stay_in_cache() {
    // Genesis coinbase is spent in the very next block before any flush;
    // the spend must resolve from the in-memory cache.
    let chain = FakeChain::default();
    let cb = coinbase(b'A', 50_000_000, 0);
    let cb_hash = cb.txid();
    let genesis_hash = chain.push(genesis_block(&[cb]));
    let chained: Vec<Transaction> = vec![
        coinbase(b'B', 25_000_000, 1),
        spend(&[(cb_hash, 0)], &[(b'C', 49_000_000)]),
    ];
    let spend_c = chained[1].txid();
    let block1 = block_on(genesis_hash, 1, &chained);
    let block1_hash = header_hash(&block1);
    chain.push(block1);
    chain.push(block_on(
        block1_hash,
        2,
        &[
            coinbase(b'B', 25_000_000, 2),
            spend(&[(spend_c, 0)], &[(b'D', 48_000_000)]),
        ],
    ));

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let db = Arc::new(RwLock::new(open_db(dir.path(), store)));
    let mut processor = BlockProcessor::new(Arc::clone(&db), chain, DEFAULT_FLUSH_THRESHOLD);
    processor.catch_up().await.expect("catch up");

    let query = Query::new(db);
    assert!(query.utxos(&hash_x_for(b'A')).await.expect("utxos").is_empty());
    assert!(query.utxos(&hash_x_for(b'C')).await.expect("utxos").is_empty());
    assert_eq!(
        query
            .confirmed_balance(&hash_x_for(b'D'))
            .await
            .expect("balance"),
        48_000_000,
    );
}
