use utxod_primitives::encoding::{decode, encode};
use utxod_primitives::outpoint::OutPoint;
use utxod_primitives::transaction::{Transaction, TxIn, TxOut};
use utxod_primitives::Hash256;

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u8(&mut self) -> u8 {
        self.next_u64() as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_vec(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    let mut bytes = Vec::with_capacity(len);
    for _ in 0..len {
        bytes.push(rng.next_u8());
    }
    bytes
}

fn random_transaction(rng: &mut Lcg) -> Transaction {
    let with_witness = rng.gen_range(2) == 1;
    let inputs = (0..1 + rng.gen_range(3))
        .map(|_| TxIn {
            prevout: OutPoint {
                hash: random_hash(rng),
                index: rng.next_u32(),
            },
            script_sig: random_vec(rng, 32),
            sequence: rng.next_u32(),
            witness: if with_witness && rng.gen_range(2) == 1 {
                (0..1 + rng.gen_range(3)).map(|_| random_vec(rng, 24)).collect()
            } else {
                Vec::new()
            },
        })
        .collect();
    let outputs = (0..rng.gen_range(4))
        .map(|_| TxOut {
            value: rng.next_u64() >> 12,
            script_pubkey: random_vec(rng, 40),
        })
        .collect();
    Transaction {
        version: rng.gen_range(3) as i32 + 1,
        inputs,
        outputs,
        lock_time: rng.next_u32(),
    }
}

#[test]
fn random_transactions_round_trip() {
    let mut rng = Lcg::new(0x5eed);
    for _ in 0..256 {
        let tx = random_transaction(&mut rng);
        let bytes = encode(&tx);
        let back: Transaction = decode(&bytes).expect("decode random tx");
        assert_eq!(back, tx);
        assert_eq!(tx.serialized_size(), bytes.len());
    }
}

#[test]
fn txid_is_stable_under_witness_changes() {
    let mut rng = Lcg::new(7);
    for _ in 0..64 {
        let mut tx = random_transaction(&mut rng);
        let txid = tx.txid();
        for input in &mut tx.inputs {
            input.witness = vec![random_vec(&mut rng, 16)];
        }
        assert_eq!(tx.txid(), txid);
    }
}

#[test]
fn truncated_transactions_are_rejected() {
    let mut rng = Lcg::new(99);
    let tx = random_transaction(&mut rng);
    let bytes = encode(&tx);
    for cut in [1, bytes.len() / 2, bytes.len() - 1] {
        assert!(decode::<Transaction>(&bytes[..cut]).is_err());
    }
}
