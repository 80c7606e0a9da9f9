//! nvlog CLI
//!
//! Operator tool for nvlog device images.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args as ClapArgs, Parser, Subcommand};
use nvlog::{Config, Engine, FileDevice, Layout, LogEntry, LogInfo};
use tracing_subscriber::{fmt, EnvFilter};

/// nvlog CLI
#[derive(Parser, Debug)]
#[command(name = "nvlog-cli")]
#[command(about = "Inspect and exercise nvlog device images")]
#[command(version)]
struct Args {
    /// Device image file
    #[arg(short, long, default_value = "./nvlog.img")]
    image: PathBuf,

    /// Sector size of the image in bytes
    #[arg(long, default_value = "512")]
    sector_size: u32,

    #[command(flatten)]
    layout: LayoutArgs,

    #[command(subcommand)]
    command: Commands,
}

/// On-device layout; must match the values the image was formatted with
#[derive(ClapArgs, Debug)]
struct LayoutArgs {
    /// log2 of the segment size
    #[arg(long, default_value_t = Layout::default().segment_bits)]
    segment_bits: u32,

    /// Number of metadata slots
    #[arg(long, default_value_t = Layout::default().max_logs)]
    max_logs: usize,

    /// Log-entry translation table length
    #[arg(long, default_value_t = Layout::default().log_entry_table_len)]
    log_entry_table: usize,

    /// Data translation table length
    #[arg(long, default_value_t = Layout::default().data_table_len)]
    data_table: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a blank image
    Format {
        /// Image size in MB
        #[arg(short, long, default_value = "1024")]
        size_mb: u64,
    },

    /// Show device geometry, segment usage and all logs
    Info,

    /// Append one record to a log (created if missing)
    Append {
        /// Log name
        log: String,

        /// Payload
        data: String,
    },

    /// Print a committed record
    Read {
        /// Log name
        log: String,

        /// Entry index (defaults to the last one)
        #[arg(short = 'n', long)]
        index: Option<i64>,
    },

    /// Show one log's metadata
    Stat {
        /// Log name
        log: String,
    },

    /// Move a log's head forward
    Trim {
        /// Log name
        log: String,

        /// New head index
        head: i64,
    },
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,nvlog=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> nvlog::Result<()> {
    let config = Config::builder()
        .segment_bits(args.layout.segment_bits)
        .max_logs(args.layout.max_logs)
        .table_lengths(args.layout.log_entry_table, args.layout.data_table)
        .build();

    if let Commands::Format { size_mb } = args.command {
        if args.image.exists() {
            std::fs::remove_file(&args.image)?;
        }
        let device = FileDevice::create(&args.image, args.sector_size, size_mb * 1024 * 1024)?;
        // Opening once validates the layout against the new image
        Engine::open(config, Arc::new(device))?.close()?;
        println!("Formatted {} ({} MB)", args.image.display(), size_mb);
        return Ok(());
    }

    let device = Arc::new(FileDevice::open(&args.image, args.sector_size)?);
    let engine = Engine::open(config, device.clone())?;

    match args.command {
        Commands::Format { .. } => {}
        Commands::Info => {
            let geometry = engine.geometry();
            println!("image:        {}", device.path().display());
            println!("sector size:  {}", geometry.sector_size);
            println!("capacity:     {} sectors", geometry.capacity_sectors);
            println!(
                "segments:     {} used / {} free",
                engine.segments_used(),
                engine.segments_free()
            );
            for info in engine.logs() {
                print_info(&info);
            }
        }
        Commands::Append { log, data } => {
            let view = engine.load(&log)?;
            let entry = LogEntry::new(view.version() + 1, view.next_data_offset(), data.len() as u64);
            let snapshot = view.info.advanced(view.tail() + 1, entry.version);
            engine.append(view.id(), data.as_bytes(), &entry, view.next_entry_offset(), &snapshot)?;
            println!("{}[{}] v{}", log, view.tail(), entry.version);
        }
        Commands::Read { log, index } => {
            let view = engine.load(&log)?;
            let index = index.unwrap_or(view.tail() - 1);
            let entry = engine.read_entry(view.id(), index)?;
            let data = engine.read_data(view.id(), index)?;
            println!(
                "{}[{}] v{} offset={} len={}: {}",
                log,
                index,
                entry.version,
                entry.data_offset,
                entry.data_length,
                String::from_utf8_lossy(&data)
            );
        }
        Commands::Stat { log } => {
            let view = engine.load(&log)?;
            print_info(&view.info);
            if let Some(entry) = view.last_entry {
                println!("  last entry: v{} offset={} len={}", entry.version, entry.data_offset, entry.data_length);
            }
        }
        Commands::Trim { log, head } => {
            let view = engine.load(&log)?;
            let mut snapshot = view.info.advanced(view.tail(), view.version());
            snapshot.head = head;
            engine.update_metadata(view.id(), &snapshot)?;
            println!("{} head -> {}", log, head);
        }
    }

    let stats = engine.io_stats();
    tracing::debug!(
        "I/O: data {} submitted / {} completed, metadata {} submitted / {} completed",
        stats.data.submitted,
        stats.data.completed,
        stats.metadata.submitted,
        stats.metadata.completed
    );
    engine.close()
}

fn print_info(info: &LogInfo) {
    println!(
        "log {:>4} '{}': head={} tail={} version={}",
        info.id, info.name, info.head, info.tail, info.version
    );
}
