//! chunkstore Inspector
//!
//! Read-only look at a container file: superblock, dataset layout and the
//! chunk index.

use std::path::PathBuf;
use std::sync::Arc;

use chunkstore::{Config, Dataset, StorageFile};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

/// chunkstore Inspector
#[derive(Parser, Debug)]
#[command(name = "chunkstore-inspect")]
#[command(about = "Inspect chunkstore container files")]
#[command(version)]
struct Args {
    /// Container file
    file: PathBuf,

    /// Dataset header address (defaults to the file's root dataset)
    #[arg(short, long)]
    dataset: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the superblock and the dataset layout
    Info,

    /// List every chunk record
    Dump,

    /// Print allocated chunk count and bytes
    Stats,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chunkstore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args) {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> chunkstore::Result<()> {
    let file = Arc::new(StorageFile::open_read_only(&args.file)?);

    let Some(addr) = args.dataset.or_else(|| file.root()) else {
        println!("{}: no root dataset; pass --dataset <ADDR>", args.file.display());
        return Ok(());
    };
    let mut dataset = Dataset::open(Arc::clone(&file), addr, &Config::default())?;

    match args.command {
        Commands::Info => {
            let codec = file.codec();
            println!("file:          {}", file.path().display());
            println!("byte order:    {:?}", codec.order());
            println!("address size:  {}", codec.addr_size());
            println!("end of alloc:  {}", file.eoa());
            println!("dataset:       {}", addr);
            println!("dims:          {:?}", dataset.dims());
            println!("max dims:      {:?}", dataset.space().max_dims());
            println!("chunk dims:    {:?}", dataset.layout().chunk_dims());
            println!("element size:  {}", dataset.layout().elem_size());
            println!("index:         {:?}", dataset.index_kind());
            println!("fill:          {:?}", dataset.fill());
            println!("alloc time:    {:?}", dataset.alloc_time());
            for filter in dataset.filters() {
                println!("filter:        {:?}", filter);
            }
            if !dataset.filters().is_empty() {
                println!("edge filters:  {}", dataset.filter_partial_edges());
            }
        }
        Commands::Dump => {
            let stdout = std::io::stdout();
            dataset.dump_index(&mut stdout.lock())?;
        }
        Commands::Stats => {
            let mut nchunks = 0u64;
            let mut nbytes = 0u64;
            for record in dataset.chunk_records()? {
                let record = record?;
                nchunks += 1;
                nbytes += record.nbytes;
            }
            println!("chunks:        {}", nchunks);
            println!("stored bytes:  {}", nbytes);
            println!("decoded bytes: {}", nchunks * dataset.layout().chunk_bytes() as u64);
        }
    }
    Ok(())
}
