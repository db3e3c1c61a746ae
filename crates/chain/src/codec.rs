//! Chain codec strategies: header geometry, block parsing, script hashing.

use std::sync::Arc;

use utxod_primitives::encoding::{Decodable, DecodeError, Decoder};
use utxod_primitives::hash::{sha256, sha256d};
use utxod_primitives::transaction::Transaction;
use utxod_primitives::Hash256;

pub const HASHX_LEN: usize = 11;

/// Truncated script hash, the key every index is organized around.
pub type HashX = [u8; HASHX_LEN];

const OP_RETURN: u8 = 0x6a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Decode(DecodeError),
    BadHeader(&'static str),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Decode(err) => write!(f, "block decode: {err}"),
            CodecError::BadHeader(message) => write!(f, "bad header: {message}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<DecodeError> for CodecError {
    fn from(err: DecodeError) -> Self {
        CodecError::Decode(err)
    }
}

/// Typed header view for session-layer serialization.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderFields {
    pub version: i32,
    pub prev_hash: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct BlockTx {
    pub tx: Transaction,
    pub hash: Hash256,
    /// Serialized size within the raw block.
    pub size: usize,
}

#[derive(Clone, Debug)]
pub struct Block {
    pub header: Vec<u8>,
    pub txs: Vec<BlockTx>,
}

/// Everything chain-specific the indexer needs. Implementations are
/// stateless; one trait object is shared across the whole process.
pub trait ChainCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Fixed header size, or `None` when headers are variable-length and
    /// file offsets come from the offsets table.
    fn static_header_len(&self) -> Option<usize>;

    /// Size of the header at the start of `raw`.
    fn header_len(&self, raw: &[u8]) -> Result<usize, CodecError>;

    fn header_hash(&self, header: &[u8]) -> Hash256 {
        sha256d(header)
    }

    fn header_prevhash(&self, header: &[u8]) -> Result<Hash256, CodecError> {
        let bytes = header
            .get(4..36)
            .ok_or(CodecError::BadHeader("header too short for prev hash"))?;
        let mut out = [0u8; 32];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn header_fields(&self, header: &[u8]) -> Result<HeaderFields, CodecError>;

    /// File offset of a static-geometry header. `None` for codecs that
    /// need the offsets table.
    fn static_header_offset(&self, height: u32) -> Option<u64> {
        self.static_header_len()
            .map(|len| height as u64 * len as u64)
    }

    /// hashX for a script pubkey; `None` for provably unspendable
    /// outputs, which are never indexed.
    fn hash_x_from_script(&self, script: &[u8]) -> Option<HashX> {
        if script.first() == Some(&OP_RETURN) {
            return None;
        }
        let digest = sha256(script);
        let mut out = [0u8; HASHX_LEN];
        out.copy_from_slice(&digest[..HASHX_LEN]);
        Some(out)
    }

    fn parse_block(&self, raw: &[u8]) -> Result<Block, CodecError> {
        let header_len = self.header_len(raw)?;
        if raw.len() < header_len {
            return Err(CodecError::Decode(DecodeError::UnexpectedEof));
        }
        let header = raw[..header_len].to_vec();
        let mut decoder = Decoder::new(&raw[header_len..]);
        let tx_count = decoder.read_varint()?;
        let mut txs = Vec::with_capacity(tx_count.min(4096) as usize);
        for _ in 0..tx_count {
            let start = decoder.position();
            let tx = Transaction::consensus_decode(&mut decoder)?;
            let size = decoder.position() - start;
            let hash = tx.txid();
            txs.push(BlockTx { tx, hash, size });
        }
        if !decoder.is_empty() {
            return Err(CodecError::Decode(DecodeError::TrailingBytes));
        }
        Ok(Block { header, txs })
    }
}

/// 80-byte Bitcoin-style headers.
pub struct CoreCodec;

const CORE_HEADER_LEN: usize = 80;

impl ChainCodec for CoreCodec {
    fn name(&self) -> &'static str {
        "core"
    }

    fn static_header_len(&self) -> Option<usize> {
        Some(CORE_HEADER_LEN)
    }

    fn header_len(&self, _raw: &[u8]) -> Result<usize, CodecError> {
        Ok(CORE_HEADER_LEN)
    }

    fn header_fields(&self, header: &[u8]) -> Result<HeaderFields, CodecError> {
        if header.len() != CORE_HEADER_LEN {
            return Err(CodecError::BadHeader("expected 80-byte header"));
        }
        let mut decoder = Decoder::new(header);
        Ok(HeaderFields {
            version: decoder.read_i32_le()?,
            prev_hash: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_bytes(4)?,
        })
    }
}

/// Equihash-style headers: fixed 140-byte prefix (32-byte nonce) followed
/// by a var-bytes solution, so header sizes vary block to block.
pub struct SolutionCodec;

const SOLUTION_PREFIX_LEN: usize = 140;

impl ChainCodec for SolutionCodec {
    fn name(&self) -> &'static str {
        "solution"
    }

    fn static_header_len(&self) -> Option<usize> {
        None
    }

    fn header_len(&self, raw: &[u8]) -> Result<usize, CodecError> {
        if raw.len() < SOLUTION_PREFIX_LEN {
            return Err(CodecError::BadHeader("header prefix truncated"));
        }
        let mut decoder = Decoder::new(&raw[SOLUTION_PREFIX_LEN..]);
        let solution_len = decoder.read_varint()? as usize;
        let total = SOLUTION_PREFIX_LEN + decoder.position() + solution_len;
        if raw.len() < total {
            return Err(CodecError::BadHeader("solution truncated"));
        }
        Ok(total)
    }

    fn header_fields(&self, header: &[u8]) -> Result<HeaderFields, CodecError> {
        if header.len() < SOLUTION_PREFIX_LEN {
            return Err(CodecError::BadHeader("header prefix truncated"));
        }
        let mut decoder = Decoder::new(header);
        let version = decoder.read_i32_le()?;
        let prev_hash = decoder.read_hash_le()?;
        let merkle_root = decoder.read_hash_le()?;
        // Reserved field between the merkle root and timestamp.
        let _ = decoder.read_hash_le()?;
        let time = decoder.read_u32_le()?;
        let bits = decoder.read_u32_le()?;
        let nonce = decoder.read_bytes(32)?;
        Ok(HeaderFields {
            version,
            prev_hash,
            merkle_root,
            time,
            bits,
            nonce,
        })
    }
}

pub fn codec_for_name(name: &str) -> Option<Arc<dyn ChainCodec>> {
    match name.trim().to_ascii_lowercase().as_str() {
        "core" => Some(Arc::new(CoreCodec)),
        "solution" => Some(Arc::new(SolutionCodec)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use utxod_primitives::encoding::{encode, Encoder};
    use utxod_primitives::outpoint::OutPoint;
    use utxod_primitives::transaction::{TxIn, TxOut};
    use utxod_primitives::hash_to_hex;

    fn core_header(prev: Hash256, merkle_root: Hash256, nonce: u32) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_i32_le(1);
        enc.write_hash_le(&prev);
        enc.write_hash_le(&merkle_root);
        enc.write_u32_le(1_600_000_000);
        enc.write_u32_le(0x207f_ffff);
        enc.write_u32_le(nonce);
        enc.into_inner()
    }

    fn coinbase_tx(height: u32) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: height.to_le_bytes().to_vec(),
                sequence: u32::MAX,
                witness: Vec::new(),
            }],
            outputs: vec![TxOut {
                value: 50_0000_0000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn bitcoin_genesis_header_hash() {
        let merkle_root = utxod_primitives::hash_from_hex(
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b",
        )
        .expect("merkle root");
        let mut enc = Encoder::new();
        enc.write_i32_le(1);
        enc.write_hash_le(&[0u8; 32]);
        enc.write_hash_le(&merkle_root);
        enc.write_u32_le(1_231_006_505);
        enc.write_u32_le(0x1d00_ffff);
        enc.write_u32_le(2_083_236_893);
        let header = enc.into_inner();
        let codec = CoreCodec;
        assert_eq!(
            hash_to_hex(&codec.header_hash(&header)),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        let fields = codec.header_fields(&header).expect("fields");
        assert_eq!(fields.merkle_root, merkle_root);
        assert_eq!(fields.time, 1_231_006_505);
    }

    #[test]
    fn parse_core_block() {
        let tx = coinbase_tx(5);
        let txid = tx.txid();
        let mut raw = core_header([3u8; 32], txid, 42);
        raw.push(1);
        raw.extend_from_slice(&encode(&tx));

        let codec = CoreCodec;
        let block = codec.parse_block(&raw).expect("parse");
        assert_eq!(block.header.len(), 80);
        assert_eq!(block.txs.len(), 1);
        assert_eq!(block.txs[0].hash, txid);
        assert_eq!(block.txs[0].size, encode(&tx).len());
        assert_eq!(codec.header_prevhash(&block.header), Ok([3u8; 32]));
    }

    #[test]
    fn parse_block_rejects_trailing_bytes() {
        let tx = coinbase_tx(1);
        let mut raw = core_header([0u8; 32], tx.txid(), 0);
        raw.push(1);
        raw.extend_from_slice(&encode(&tx));
        raw.push(0xff);
        assert!(CoreCodec.parse_block(&raw).is_err());
    }

    #[test]
    fn solution_header_len_tracks_solution_size() {
        let mut raw = vec![0u8; SOLUTION_PREFIX_LEN];
        raw.push(3);
        raw.extend_from_slice(&[1, 2, 3]);
        let codec = SolutionCodec;
        assert_eq!(codec.header_len(&raw), Ok(SOLUTION_PREFIX_LEN + 1 + 3));
        assert_eq!(codec.static_header_len(), None);
        assert!(codec.header_len(&raw[..SOLUTION_PREFIX_LEN]).is_err());
    }

    #[test]
    fn op_return_is_not_indexed() {
        let codec = CoreCodec;
        assert_eq!(codec.hash_x_from_script(&[OP_RETURN, 0x04, 1, 2, 3, 4]), None);
        let hash_x = codec.hash_x_from_script(&[0x51]).expect("hashX");
        assert_eq!(hash_x.len(), HASHX_LEN);
        assert_eq!(&sha256(&[0x51])[..HASHX_LEN], &hash_x[..]);
    }

    #[test]
    fn static_offsets() {
        assert_eq!(CoreCodec.static_header_offset(0), Some(0));
        assert_eq!(CoreCodec.static_header_offset(100), Some(8000));
        assert_eq!(SolutionCodec.static_header_offset(100), None);
    }
}
