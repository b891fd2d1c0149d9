//! KeelStore CLI
//!
//! Command-line tool for inspecting and editing a KeelStore file.

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use keelstore::root_block::RootBlockManager;
use keelstore::storage::BackingFile;
use keelstore::{PendingWrites, Result, Store, StoreConfig, StoreType};
use tracing_subscriber::{fmt, EnvFilter};

/// KeelStore CLI
#[derive(Parser, Debug)]
#[command(name = "keelstore-cli")]
#[command(about = "Inspect and edit a KeelStore journal file")]
#[command(version)]
struct Args {
    /// Store file
    #[arg(short, long, default_value = "./keelstore.jnl")]
    path: PathBuf,

    /// Addressing discipline used when the store is created
    #[arg(long, value_enum, default_value = "worm")]
    store_type: CliStoreType,

    /// Address offset bits used when the store is created
    #[arg(long, default_value = "42")]
    offset_bits: u32,

    /// Sync before and after each root block write
    #[arg(long)]
    double_sync: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliStoreType {
    Worm,
    Rw,
}

impl From<CliStoreType> for StoreType {
    fn from(t: CliStoreType) -> Self {
        match t {
            CliStoreType::Worm => StoreType::Worm,
            CliStoreType::Rw => StoreType::Rw,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show both root blocks and which one is current
    Info,

    /// Put a key-value pair into an index
    Put {
        index: String,
        key: String,
        value: String,
    },

    /// Get a value, optionally as of a past commit time
    Get {
        index: String,
        key: String,

        /// Commit timestamp (milliseconds) to read as of
        #[arg(long)]
        as_of: Option<u64>,
    },

    /// Delete a key from an index
    Del { index: String, key: String },

    /// List every commit
    History,

    /// Check the page structure of every index in the current commit
    Verify,

    /// Disallow any further commit
    Close,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,keelstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = run(args) {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    if let Commands::Info = args.command {
        return info(&args.path);
    }

    let read_only = matches!(
        args.command,
        Commands::Get { .. } | Commands::History | Commands::Verify
    );
    let config = StoreConfig::builder()
        .path(&args.path)
        .store_type(args.store_type.into())
        .offset_bits(args.offset_bits)
        .double_sync(args.double_sync)
        .read_only(read_only)
        .build();
    let store = Store::open(config)?;

    match args.command {
        Commands::Info => {}
        Commands::Put { index, key, value } => {
            let mut writes = PendingWrites::new();
            writes.put(index, key, value);
            let rb = store.commit(writes)?;
            println!("OK (commit {} at {})", rb.commit_counter(), rb.last_commit_time());
        }
        Commands::Get { index, key, as_of } => {
            let snapshot = match as_of {
                Some(t) => store.read_as_of(t)?,
                None => store.snapshot()?,
            };
            match snapshot.get(&index, key.as_bytes())? {
                Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                None => println!("(nil)"),
            }
        }
        Commands::Del { index, key } => {
            let mut writes = PendingWrites::new();
            writes.delete(index, key);
            let rb = store.commit(writes)?;
            println!("OK (commit {})", rb.commit_counter());
        }
        Commands::History => {
            for entry in store.commit_history()? {
                println!(
                    "commit {:>6}  time {:>14}  record {:#018x}",
                    entry.commit_counter, entry.timestamp, entry.commit_record_addr
                );
            }
        }
        Commands::Verify => {
            let snapshot = store.snapshot()?;
            for name in snapshot.index_names() {
                if let Some(stats) = snapshot.validate_index(&name)? {
                    println!(
                        "{}: {} entries, {} buckets, {} directories, depth {}, {} unbalanced, {} overfull",
                        name,
                        stats.entries,
                        stats.buckets,
                        stats.directories,
                        stats.depth,
                        stats.unbalanced_directories,
                        stats.overfull_buckets
                    );
                }
            }
            println!("OK (commit {})", snapshot.commit_counter());
        }
        Commands::Close => {
            let rb = store.close_for_writes()?;
            println!("OK (closed at {})", rb.close_time());
        }
    }
    Ok(())
}

/// Print both slots without opening the store
fn info(path: &Path) -> Result<()> {
    let (file, _) = BackingFile::open(path, false, true)?;
    let slots = RootBlockManager::read_slots(&file);

    for (slot, result) in slots.iter().enumerate() {
        match result {
            Ok(rb) => println!("{}", rb),
            Err(e) => println!("rootBlock{}: INVALID ({})", slot, e),
        }
    }

    let [rb0, rb1] = slots;
    let (current, report) = RootBlockManager::choose(rb0, rb1)?;
    println!(
        "current: rootBlock{} (commit {})",
        report.chosen_slot,
        current.commit_counter()
    );
    if !report.is_clean() {
        println!("recovery ignored: torn {:?}, rejected {:?}", report.torn_slots, report.rejected);
    }
    Ok(())
}
