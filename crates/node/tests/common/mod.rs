#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use utxod_chain::{chain_params, ChainCodec, CoreCodec, HashX, Network};
use utxod_db::chaindb::ChainDb;
use utxod_primitives::encoding::{encode, Encoder};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_primitives::{hash_from_hex, Hash256};
use utxod_storage::memory::MemoryStore;

pub fn open_db(dir: &Path, store: Arc<MemoryStore>) -> ChainDb<Arc<MemoryStore>> {
    ChainDb::open(
        dir,
        store,
        Arc::new(CoreCodec),
        chain_params(Network::Regtest),
    )
    .expect("open chain db")
}

pub fn script_for(tag: u8) -> Vec<u8> {
    vec![0x76, 0xa9, 0x14, tag, tag, 0xac]
}

pub fn hash_x_for(tag: u8) -> HashX {
    CoreCodec
        .hash_x_from_script(&script_for(tag))
        .expect("script hashX")
}

pub fn coinbase(tag: u8, value: u64, salt: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig: salt.to_le_bytes().to_vec(),
            sequence: u32::MAX,
            witness: Vec::new(),
        }],
        outputs: vec![TxOut {
            value,
            script_pubkey: script_for(tag),
        }],
        lock_time: 0,
    }
}

pub fn spend(prevouts: &[(Hash256, u32)], outputs: &[(u8, u64)]) -> Transaction {
    Transaction {
        version: 1,
        inputs: prevouts
            .iter()
            .map(|(hash, index)| TxIn {
                prevout: OutPoint {
                    hash: *hash,
                    index: *index,
                },
                script_sig: vec![0x00],
                sequence: u32::MAX,
                witness: Vec::new(),
            })
            .collect(),
        outputs: outputs
            .iter()
            .map(|(tag, value)| TxOut {
                value: *value,
                script_pubkey: script_for(*tag),
            })
            .collect(),
        lock_time: 0,
    }
}

fn encode_block(header: Vec<u8>, txs: &[Transaction]) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.write_bytes(&header);
    enc.write_varint(txs.len() as u64);
    for tx in txs {
        enc.write_bytes(&encode(tx));
    }
    enc.into_inner()
}

/// The real regtest genesis header, so the genesis hash check passes.
pub fn genesis_block(txs: &[Transaction]) -> Vec<u8> {
    let merkle_root = hash_from_hex(
        "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
    )
    .expect("genesis merkle root");
    let mut enc = Encoder::new();
    enc.write_i32_le(1);
    enc.write_hash_le(&[0u8; 32]);
    enc.write_hash_le(&merkle_root);
    enc.write_u32_le(1_296_688_602);
    enc.write_u32_le(0x207f_ffff);
    enc.write_u32_le(2);
    encode_block(enc.into_inner(), txs)
}

/// A block on top of `prev`; `salt` keeps header hashes distinct across
/// forks.
pub fn block_on(prev: Hash256, salt: u32, txs: &[Transaction]) -> Vec<u8> {
    let mut merkle_root = [0u8; 32];
    merkle_root[..4].copy_from_slice(&salt.to_le_bytes());
    let mut enc = Encoder::new();
    enc.write_i32_le(1);
    enc.write_hash_le(&prev);
    enc.write_hash_le(&merkle_root);
    enc.write_u32_le(1_296_688_602 + salt);
    enc.write_u32_le(0x207f_ffff);
    enc.write_u32_le(salt);
    encode_block(enc.into_inner(), txs)
}

pub fn header_hash(raw_block: &[u8]) -> Hash256 {
    CoreCodec.header_hash(&raw_block[..80])
}
