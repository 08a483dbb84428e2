use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use ironshard::{
    CancelToken, Decompressor, Delimiter, ExternalDecompressor, FieldPrefixExtractor, InvalidPolicy, NameHash,
    ProgressPolicy, RunOutcome, Runner, ShardNaming, SplitConfig, SplitError,
};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DecompressorOpt {
    Auto,
    External,
    InProcess,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum NameHashOpt {
    Sha256,
    Md5,
}

#[derive(Debug, Parser)]
#[command(name = "ironshard", version, about = "Split a large line-oriented file into per-key compressed shards")]
struct Args {
    /// Input file (gzip, zstd or plain text); the first line is the header
    #[arg(short, long)]
    input: PathBuf,

    /// Output directory for shards and the progress file
    #[arg(short, long)]
    output: PathBuf,

    /// Worker threads for chunk processing (defaults to the CPU count)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum simultaneously open shard files
    #[arg(long, default_value_t = 1000)]
    max_handles: usize,

    /// Lines per chunk
    #[arg(long, default_value_t = 1_000_000)]
    chunk_size: usize,

    /// Rewrite shards even when a complete one already exists
    #[arg(long)]
    no_skip: bool,

    /// Data records to skip before processing (resume offset)
    #[arg(long, default_value_t = 0)]
    start_offset: u64,

    /// Decompression strategy for gzip input
    #[arg(long, value_enum, default_value_t = DecompressorOpt::Auto)]
    decompressor: DecompressorOpt,

    /// External decompressor program; invoked as `<program> -dc [-p N] <input>`
    #[arg(long, default_value = "pigz")]
    external_program: String,

    /// Per-key buffer size in bytes before a write is issued
    #[arg(long, default_value_t = 256 * 1024)]
    buffer_bytes: usize,

    /// Shard compression level
    #[arg(long, default_value_t = 1)]
    compression_level: u32,

    /// Shard file name suffix; selects the codec (.gz or .zst)
    #[arg(long, default_value = ".txt.gz")]
    suffix: String,

    /// Template hashed into shard names; `{key}` is replaced by the key
    #[arg(long, default_value = "{key}")]
    name_template: String,

    /// Digest for the shard name prefix (md5 matches `md5(url)` cache names)
    #[arg(long, value_enum, default_value_t = NameHashOpt::Sha256)]
    name_hash: NameHashOpt,

    /// Route records without a usable key to this bucket instead of dropping them
    #[arg(long)]
    invalid_bucket: Option<String>,

    /// Fields are separated by single tabs rather than runs of whitespace
    #[arg(long)]
    tab_delimited: bool,

    /// Seconds between interim progress saves (0 saves only at the end)
    #[arg(long, default_value_t = 300)]
    progress_interval: u64,

    /// Also write the run summary as JSON to this path
    #[arg(long)]
    summary_json: Option<PathBuf>,

    /// Log filter, e.g. `info` or `ironshard=debug` (overrides RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn decompressor(&self) -> Decompressor {
        let tool = if self.external_program == "pigz" {
            ExternalDecompressor::pigz(num_cpus::get().min(16))
        } else {
            ExternalDecompressor {
                program: self.external_program.clone(),
                args: vec!["-dc".to_string()],
            }
        };
        match self.decompressor {
            DecompressorOpt::Auto => Decompressor::Auto(tool),
            DecompressorOpt::External => Decompressor::External(tool),
            DecompressorOpt::InProcess => Decompressor::InProcess,
        }
    }

    fn config(&self) -> SplitConfig {
        let defaults = SplitConfig::default();
        SplitConfig {
            input: self.input.clone(),
            output_dir: self.output.clone(),
            workers: self.workers.unwrap_or(defaults.workers),
            max_handles: self.max_handles,
            chunk_size: self.chunk_size,
            skip_existing: !self.no_skip,
            start_offset: self.start_offset,
            decompressor: self.decompressor(),
            buffer_bytes: self.buffer_bytes,
            compression_level: self.compression_level,
            naming: ShardNaming::new(self.name_template.clone(), self.suffix.clone()).with_algorithm(
                match self.name_hash {
                    NameHashOpt::Sha256 => NameHash::Sha256,
                    NameHashOpt::Md5 => NameHash::Md5,
                },
            ),
            invalid_policy: self
                .invalid_bucket
                .clone()
                .map_or(InvalidPolicy::Drop, InvalidPolicy::CatchAll),
            progress_policy: match self.progress_interval {
                0 => ProgressPolicy::AtEnd,
                secs => ProgressPolicy::TimeInterval(secs),
            },
            ..defaults
        }
    }
}

/// SIGINT/SIGTERM stop the run at the next chunk boundary; shards are still
/// finalized and progress saved.
fn install_signal_handlers(token: &CancelToken) -> std::io::Result<()> {
    for signal in [SIGINT, SIGTERM] {
        signal_hook::flag::register(signal, token.flag())?;
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = match &args.log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    let extractor = FieldPrefixExtractor {
        delimiter: if args.tab_delimited { Delimiter::Tab } else { Delimiter::Whitespace },
        ..Default::default()
    };
    let runner = Runner::new(args.config()).with_extractor(Arc::new(extractor));
    if let Err(err) = install_signal_handlers(&runner.cancel_token()) {
        warn!(error = %err, "could not install signal handlers; interrupts will not be graceful");
    }

    match runner.run() {
        Ok(summary) => {
            if let Some(path) = &args.summary_json
                && let Err(err) = summary.save_to_file(path)
            {
                error!(error = %format!("{err:#}"), "could not write summary");
            }
            if summary.outcome == RunOutcome::ShortInput {
                eprintln!(
                    "input ended after {} of {} requested records; nothing was processed",
                    summary.fast_forwarded,
                    summary.fast_forwarded + summary.shortfall
                );
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{err:#}");
            match err.downcast_ref::<SplitError>() {
                Some(SplitError::Interrupted) => ExitCode::from(130),
                Some(SplitError::InvalidConfig(_)) => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
