//! Network parameter tables.

use utxod_primitives::{hash_from_hex, Hash256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_hash: Hash256,
    /// Maximum reorg depth undo data is retained for.
    pub reorg_limit: u32,
}

fn genesis(hex: &'static str) -> Hash256 {
    hash_from_hex(hex).expect("static genesis hash")
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            genesis_hash: genesis(
                "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            ),
            reorg_limit: 200,
        },
        Network::Testnet => ChainParams {
            network,
            genesis_hash: genesis(
                "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943",
            ),
            reorg_limit: 8000,
        },
        Network::Regtest => ChainParams {
            network,
            genesis_hash: genesis(
                "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206",
            ),
            reorg_limit: 200,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_networks() {
        assert_eq!(Network::parse("mainnet"), Some(Network::Mainnet));
        assert_eq!(Network::parse("TEST"), Some(Network::Testnet));
        assert_eq!(Network::parse("nope"), None);
    }

    #[test]
    fn genesis_hashes_decode() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = chain_params(network);
            assert_ne!(params.genesis_hash, [0u8; 32]);
        }
    }
}
