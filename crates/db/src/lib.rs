//! Confirmed chain state: flat files, history index, UTXO store.

pub mod chaindb;
pub mod flatfiles;
pub mod history;

use std::fmt;
use std::io;

use utxod_chain::CodecError;
use utxod_primitives::encoding::DecodeError;
use utxod_primitives::merkle::MerkleError;
use utxod_storage::StoreError;

#[derive(Debug)]
pub enum DbError {
    Store(StoreError),
    Io(io::Error),
    Decode(DecodeError),
    Codec(CodecError),
    Merkle(MerkleError),
    Corrupt(String),
    OutOfRange(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Store(err) => write!(f, "store: {err}"),
            DbError::Io(err) => write!(f, "io: {err}"),
            DbError::Decode(err) => write!(f, "decode: {err}"),
            DbError::Codec(err) => write!(f, "codec: {err}"),
            DbError::Merkle(err) => write!(f, "merkle: {err}"),
            DbError::Corrupt(message) => write!(f, "corrupt database: {message}"),
            DbError::OutOfRange(message) => write!(f, "out of range: {message}"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<StoreError> for DbError {
    fn from(err: StoreError) -> Self {
        DbError::Store(err)
    }
}

impl From<io::Error> for DbError {
    fn from(err: io::Error) -> Self {
        DbError::Io(err)
    }
}

impl From<DecodeError> for DbError {
    fn from(err: DecodeError) -> Self {
        DbError::Decode(err)
    }
}

impl From<CodecError> for DbError {
    fn from(err: CodecError) -> Self {
        DbError::Codec(err)
    }
}

impl From<MerkleError> for DbError {
    fn from(err: MerkleError) -> Self {
        DbError::Merkle(err)
    }
}
