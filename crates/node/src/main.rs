use utxod_log as logging;

pub mod block_processor;
pub mod daemon;
pub mod mempool;
pub mod query;

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use tokio::sync::watch;
use utxod_chain::{chain_params, codec_for_name, ChainCodec, Network};
use utxod_db::chaindb::ChainDb;
use utxod_log::log_info;
use utxod_primitives::hash_to_hex;
use utxod_storage::fjall::{FjallOptions, FjallStore};
use utxod_storage::memory::MemoryStore;
use utxod_storage::KeyValueStore;

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_DB_CACHE_MB: u64 = 256;
/// Bytes of rewritten rows per history compaction slice.
const COMPACT_SLICE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Command {
    /// Open the database and report its state.
    Status,
    /// Run history compaction to completion.
    CompactHistory,
}

#[derive(Debug)]
pub struct Config {
    pub command: Command,
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub network: Network,
    pub codec_name: String,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub db_cache_mb: u64,
    pub db_fsync_ms: Option<u16>,
}

pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

fn env_default(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// Flags win over `UTXOD_*` environment variables, which win over the
/// built-in defaults.
pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut command = Command::Status;
    let mut backend = Backend::Fjall;
    let mut data_dir = PathBuf::from(
        env_default("UTXOD_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
    );
    let mut network = match env_default("UTXOD_NETWORK") {
        Some(value) => Network::parse(&value)
            .ok_or_else(|| format!("unknown network '{value}' in UTXOD_NETWORK"))?,
        None => Network::Mainnet,
    };
    let mut codec_name = env_default("UTXOD_CODEC").unwrap_or_else(|| "core".to_string());
    let mut log_level = match env_default("UTXOD_LOG_LEVEL") {
        Some(value) => logging::Level::parse(&value)
            .ok_or_else(|| format!("unknown log level '{value}' in UTXOD_LOG_LEVEL"))?,
        None => logging::Level::Info,
    };
    let mut log_format = logging::Format::Text;
    let mut log_timestamps = true;
    let mut db_cache_mb = DEFAULT_DB_CACHE_MB;
    let mut db_fsync_ms = None;

    let mut args = raw_args.into_iter().peekable();
    match args.peek().map(|value| value.as_str()) {
        Some("help") => return Ok(CliAction::PrintHelp),
        Some("version") => return Ok(CliAction::PrintVersion),
        Some("status") => {
            let _ = args.next();
        }
        Some("compact-history") => {
            command = Command::CompactHistory;
            let _ = args.next();
        }
        _ => {}
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" => return Ok(CliAction::PrintVersion),
            "--backend" => {
                let value = next_value(&mut args, "--backend")?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("unknown backend '{value}'"))?;
            }
            "--data-dir" => {
                data_dir = PathBuf::from(next_value(&mut args, "--data-dir")?);
            }
            "--network" => {
                let value = next_value(&mut args, "--network")?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("unknown network '{value}'"))?;
            }
            "--codec" => {
                codec_name = next_value(&mut args, "--codec")?;
            }
            "--log-level" => {
                let value = next_value(&mut args, "--log-level")?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("unknown log level '{value}'"))?;
            }
            "--log-format" => {
                let value = next_value(&mut args, "--log-format")?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("unknown log format '{value}'"))?;
            }
            "--no-log-timestamps" => log_timestamps = false,
            "--db-cache-mb" => {
                let value = next_value(&mut args, "--db-cache-mb")?;
                db_cache_mb = value
                    .parse()
                    .map_err(|_| format!("invalid --db-cache-mb '{value}'"))?;
            }
            "--db-fsync-ms" => {
                let value = next_value(&mut args, "--db-fsync-ms")?;
                db_fsync_ms = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid --db-fsync-ms '{value}'"))?,
                );
            }
            other => return Err(format!("unknown argument '{other}', try 'utxod help'")),
        }
    }

    Ok(CliAction::Run(Config {
        command,
        backend,
        data_dir,
        network,
        codec_name,
        log_level,
        log_format,
        log_timestamps,
        db_cache_mb,
        db_fsync_ms,
    }))
}

fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String, String> {
    args.next().ok_or_else(|| format!("{flag} requires a value"))
}

fn print_help() {
    println!(
        "\
utxod {version}

USAGE:
    utxod [COMMAND] [OPTIONS]

COMMANDS:
    status             Open the database and report its state (default)
    compact-history    Compact the history index, then exit
    help               Show this help
    version            Show the version

OPTIONS:
    --backend <memory|fjall>    Storage backend (default fjall)
    --data-dir <path>           Data directory (default {data_dir})
    --network <name>            mainnet, testnet or regtest (default mainnet)
    --codec <name>              Chain codec: core or solution (default core)
    --log-level <level>         error, warn, info, debug or trace
    --log-format <text|json>    Log line format
    --no-log-timestamps         Omit timestamps from text logs
    --db-cache-mb <mb>          Block cache size (default {cache})
    --db-fsync-ms <ms>          Periodic fsync interval for the store

ENVIRONMENT:
    UTXOD_DATA_DIR, UTXOD_NETWORK, UTXOD_CODEC and UTXOD_LOG_LEVEL set
    defaults; flags take precedence.",
        version = env!("CARGO_PKG_VERSION"),
        data_dir = DEFAULT_DATA_DIR,
        cache = DEFAULT_DB_CACHE_MB,
    );
}

#[derive(Serialize)]
struct StatusReport {
    network: &'static str,
    codec: &'static str,
    height: i32,
    tx_count: u32,
    tip: String,
    utxo_flush_count: u32,
    first_sync: bool,
    wall_time_secs: u64,
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args_from(std::env::args().skip(1))? {
        CliAction::PrintHelp => {
            print_help();
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("utxod {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_node(config).await,
    }
}

async fn run_node(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    let codec = codec_for_name(&config.codec_name)
        .ok_or_else(|| format!("unknown codec '{}'", config.codec_name))?;
    let params = chain_params(config.network);
    let dir = config.data_dir.join(config.network.as_str());

    let store: Arc<dyn KeyValueStore> = match config.backend {
        Backend::Memory => Arc::new(MemoryStore::new()),
        Backend::Fjall => Arc::new(
            FjallStore::open_with_options(
                dir.join("db"),
                FjallOptions {
                    cache_bytes: Some(config.db_cache_mb * 1024 * 1024),
                    write_buffer_bytes: None,
                    fsync_ms: config.db_fsync_ms,
                },
            )
            .map_err(|err| err.to_string())?,
        ),
    };

    let db = ChainDb::open(&dir, store, codec, params).map_err(|err| err.to_string())?;
    let db = Arc::new(RwLock::new(db));

    match config.command {
        Command::Status => {
            let report = {
                let db = db.read().expect("chain db lock");
                StatusReport {
                    network: db.params.network.as_str(),
                    codec: db.codec.name(),
                    height: db.db_height,
                    tx_count: db.db_tx_count,
                    tip: hash_to_hex(&db.db_tip),
                    utxo_flush_count: db.utxo_flush_count,
                    first_sync: db.first_sync,
                    wall_time_secs: db.wall_time_secs,
                }
            };
            let rendered =
                serde_json::to_string_pretty(&report).map_err(|err| err.to_string())?;
            println!("{rendered}");
            Ok(())
        }
        Command::CompactHistory => compact_history(db).await,
    }
}

async fn compact_history(
    db: Arc<RwLock<ChainDb<Arc<dyn KeyValueStore>>>>,
) -> Result<(), String> {
    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = stop_tx.send(true);
    });

    log_info!("compacting history index");
    loop {
        if *stop_rx.borrow() {
            log_info!("history compaction interrupted, state discarded on next start");
            return Ok(());
        }
        let done = {
            let mut db = db.write().expect("chain db lock");
            db.history
                .compact_once(COMPACT_SLICE_BYTES)
                .map_err(|err| err.to_string())?
        };
        if done {
            log_info!("history compaction finished");
            return Ok(());
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn parse_defaults() {
        let CliAction::Run(config) = parse_args_from(args(&[])).expect("parse") else {
            panic!("expected a run action");
        };
        assert_eq!(config.command, Command::Status);
        assert_eq!(config.backend, Backend::Fjall);
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.codec_name, "core");
    }

    #[test]
    fn parse_compact_with_flags() {
        let CliAction::Run(config) = parse_args_from(args(&[
            "compact-history",
            "--backend",
            "memory",
            "--network",
            "regtest",
            "--codec",
            "solution",
            "--db-cache-mb",
            "64",
        ]))
        .expect("parse") else {
            panic!("expected a run action");
        };
        assert_eq!(config.command, Command::CompactHistory);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.codec_name, "solution");
        assert_eq!(config.db_cache_mb, 64);
    }

    #[test]
    fn parse_rejects_unknown_flags() {
        assert!(parse_args_from(args(&["--nope"])).is_err());
        assert!(parse_args_from(args(&["--backend"])).is_err());
        assert!(parse_args_from(args(&["--backend", "sled"])).is_err());
    }
}
