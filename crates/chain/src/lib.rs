//! Per-chain codec strategies and network parameters.

pub mod codec;
pub mod params;

pub use codec::{
    codec_for_name, Block, BlockTx, ChainCodec, CodecError, CoreCodec, HashX, HeaderFields,
    SolutionCodec, HASHX_LEN,
};
pub use params::{chain_params, ChainParams, Network};
