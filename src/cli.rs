// Command-line front end for blocksync.
//
// Subcommands mirror the three halves of a remote sync (signature, delta,
// patch) plus a local `sync`, and a few inspection helpers.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum, ValueHint};

use crate::engine::SyncOptions;
use crate::hash::config::{self, BlockConfig};
use crate::io as sync_io;
use crate::wire::{Frame, FrameReader};

const BUF_SIZE: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Byte size parsing (supports K, M, G suffixes)
// ---------------------------------------------------------------------------

fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".into());
    }
    let (num_part, multiplier) = match s.as_bytes().last() {
        Some(b'k' | b'K') => (&s[..s.len() - 1], 1024u64),
        Some(b'm' | b'M') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'g' | b'G') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };
    let num: u64 = num_part
        .trim()
        .parse()
        .map_err(|e| format!("invalid size '{s}': {e}"))?;
    num.checked_mul(multiplier)
        .ok_or_else(|| format!("size overflow: '{s}'"))
}

// ---------------------------------------------------------------------------
// Clap CLI definition
// ---------------------------------------------------------------------------

/// Rolling-hash delta synchronization.
#[derive(Parser, Debug)]
#[command(
    name = "blocksync",
    version,
    about = "Content-defined delta synchronization",
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,

    /// Force overwrite existing output files.
    #[arg(short = 'f', long, global = true)]
    force: bool,

    /// Quiet mode (only errors are logged).
    #[arg(short = 'q', long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Verbose mode (use twice for debug logging).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Output stats as JSON to stderr.
    #[arg(long = "json", global = true)]
    json_output: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Hash a target file into a signature.
    Signature(SignatureArgs),
    /// Match a source file against a signature, writing a delta.
    Delta(DeltaArgs),
    /// Apply a delta to a target file.
    Patch(PatchArgs),
    /// Sync two local files.
    Sync(SyncArgs),
    /// Print the block lengths chosen for an object size.
    BlockSize(BlockSizeArgs),
    /// Print the frames of a signature or delta file.
    Inspect(InspectArgs),
    /// Print build/configuration details.
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProfileArg {
    Default,
    LowMemory,
}

impl ProfileArg {
    fn config(self) -> BlockConfig {
        match self {
            Self::Default => config::DEFAULT,
            Self::LowMemory => config::LOW_MEMORY,
        }
    }
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Block-size limits and scan buffer profile.
    #[arg(long, value_enum, default_value_t = ProfileArg::Default)]
    profile: ProfileArg,

    /// Fixed block length instead of one derived from the file size
    /// (supports K/M/G suffix).
    #[arg(long = "block-size", value_parser = parse_byte_size)]
    block_size: Option<u64>,
}

#[derive(Args, Debug)]
struct SignatureArgs {
    /// File the receiver already has.
    #[arg(value_hint = ValueHint::FilePath)]
    target: PathBuf,

    /// Signature output.
    #[arg(value_hint = ValueHint::FilePath)]
    signature: PathBuf,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct DeltaArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    signature: PathBuf,

    /// New version of the file.
    #[arg(value_hint = ValueHint::FilePath)]
    source: PathBuf,

    /// Delta output.
    #[arg(value_hint = ValueHint::FilePath)]
    delta: PathBuf,

    /// Order the delta so the target can be patched in place.
    #[arg(long = "in-place")]
    in_place: bool,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct PatchArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    target: PathBuf,

    #[arg(value_hint = ValueHint::FilePath)]
    delta: PathBuf,

    /// Output file; the target is rewritten in place when omitted.
    #[arg(value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct SyncArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    target: PathBuf,

    #[arg(value_hint = ValueHint::FilePath)]
    source: PathBuf,

    /// Output file; the target is rewritten in place when omitted.
    #[arg(value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,

    /// Refine matches with shrinking block lengths.
    #[arg(long, conflicts_with = "in_place")]
    multiround: bool,

    /// Order records for in-place application even with an output file.
    #[arg(long = "in-place")]
    in_place: bool,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct BlockSizeArgs {
    /// Object size (supports K/M/G suffix).
    #[arg(value_parser = parse_byte_size)]
    size: u64,

    #[arg(long, value_enum, default_value_t = ProfileArg::Default)]
    profile: ProfileArg,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(value_hint = ValueHint::FilePath)]
    frames: PathBuf,

    /// Stop after this many frames.
    #[arg(long)]
    limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved command + options (flattened from Cli)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Signature,
    Delta,
    Patch,
    Sync,
    BlockSize,
    Inspect,
    Config,
}

#[derive(Debug)]
struct Options {
    command: Command,
    force: bool,
    quiet: bool,
    verbose: u8,
    json_output: bool,
    config: BlockConfig,
    block_size: Option<u64>,
    multiround: bool,
    in_place: bool,
    target_file: Option<PathBuf>,
    source_file: Option<PathBuf>,
    signature_file: Option<PathBuf>,
    delta_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    size: u64,
    limit: Option<u64>,
}

impl Options {
    fn base(command: Command, cli: &Cli) -> Self {
        Self {
            command,
            force: cli.force,
            quiet: cli.quiet,
            verbose: cli.verbose.min(2),
            json_output: cli.json_output,
            config: config::DEFAULT,
            block_size: None,
            multiround: false,
            in_place: false,
            target_file: None,
            source_file: None,
            signature_file: None,
            delta_file: None,
            output_file: None,
            size: 0,
            limit: None,
        }
    }

    fn sync_options(&self) -> Result<SyncOptions, String> {
        let block_len = match self.block_size {
            None => None,
            Some(0) => return Err("--block-size must be positive".into()),
            Some(b) => Some(
                u32::try_from(b).map_err(|_| format!("--block-size {b} exceeds {}", u32::MAX))?,
            ),
        };
        Ok(SyncOptions {
            config: self.config,
            multiround: self.multiround,
            in_place: self.in_place,
            block_len,
        })
    }

    fn log_filter(&self) -> &'static str {
        match (self.quiet, self.verbose) {
            (true, _) => "error",
            (false, 0) => "warn",
            (false, 1) => "info",
            _ => "debug",
        }
    }
}

fn resolve_options(cli: Cli) -> Options {
    let command = match &cli.command {
        Cmd::Signature(_) => Command::Signature,
        Cmd::Delta(_) => Command::Delta,
        Cmd::Patch(_) => Command::Patch,
        Cmd::Sync(_) => Command::Sync,
        Cmd::BlockSize(_) => Command::BlockSize,
        Cmd::Inspect(_) => Command::Inspect,
        Cmd::Config => Command::Config,
    };
    let mut opts = Options::base(command, &cli);
    match cli.command {
        Cmd::Signature(args) => {
            opts.config = args.tuning.profile.config();
            opts.block_size = args.tuning.block_size;
            opts.target_file = Some(args.target);
            opts.signature_file = Some(args.signature);
        }
        Cmd::Delta(args) => {
            opts.config = args.tuning.profile.config();
            opts.block_size = args.tuning.block_size;
            opts.in_place = args.in_place;
            opts.signature_file = Some(args.signature);
            opts.source_file = Some(args.source);
            opts.delta_file = Some(args.delta);
        }
        Cmd::Patch(args) => {
            opts.target_file = Some(args.target);
            opts.delta_file = Some(args.delta);
            opts.output_file = args.output;
        }
        Cmd::Sync(args) => {
            opts.config = args.tuning.profile.config();
            opts.block_size = args.tuning.block_size;
            opts.multiround = args.multiround;
            opts.in_place = args.in_place;
            opts.target_file = Some(args.target);
            opts.source_file = Some(args.source);
            opts.output_file = args.output;
        }
        Cmd::BlockSize(args) => {
            opts.config = args.profile.config();
            opts.size = args.size;
        }
        Cmd::Inspect(args) => {
            opts.delta_file = Some(args.frames);
            opts.limit = args.limit;
        }
        Cmd::Config => {}
    }
    opts
}

#[cfg(any(test, feature = "fuzzing"))]
pub fn fuzz_try_parse_args(args: &[String]) {
    let argv: Vec<String> = std::iter::once("blocksync".to_string())
        .chain(args.iter().cloned())
        .collect();
    if let Ok(cli) = Cli::try_parse_from(argv) {
        let opts = resolve_options(cli);
        let _ = opts.sync_options();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn required(path: &Option<PathBuf>, what: &str) -> Result<PathBuf, String> {
    path.clone().ok_or_else(|| format!("missing {what} path"))
}

/// Refuse to clobber an existing output unless forced.
fn check_output(path: &Path, opts: &Options) -> Result<(), String> {
    if path.exists() && !opts.force {
        return Err(format!(
            "output file exists, use -f to overwrite: {}",
            path.display()
        ));
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_opt(bytes: &Option<[u8; 32]>) -> Option<String> {
    bytes.as_ref().map(|b| hex(b))
}

fn print_json(json: serde_json::Value) {
    match serde_json::to_string_pretty(&json) {
        Ok(s) => eprintln!("{s}"),
        Err(e) => log::warn!("could not render stats: {e}"),
    }
}

fn finish(result: Result<(), String>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("blocksync: {e}");
            1
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_signature(opts: &Options) -> Result<(), String> {
    let target = required(&opts.target_file, "target")?;
    let sig = required(&opts.signature_file, "signature")?;
    check_output(&sig, opts)?;
    let sync = opts.sync_options()?;
    let stats = sync_io::write_signature(&target, &sig, &sync).map_err(|e| e.to_string())?;

    if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "blocksync: signature: target size: {}, block length: {}, blocks: {}, \
             signature size: {}",
            stats.target_size, stats.block_len, stats.blocks, stats.signature_size
        );
    }
    if opts.json_output {
        print_json(serde_json::json!({
            "command": "signature",
            "target_exists": stats.target_exists,
            "target_size": stats.target_size,
            "block_len": stats.block_len,
            "blocks": stats.blocks,
            "signature_size": stats.signature_size,
            "target_sha256": hex_opt(&stats.target_sha256),
        }));
    }
    Ok(())
}

fn cmd_delta(opts: &Options) -> Result<(), String> {
    let sig = required(&opts.signature_file, "signature")?;
    let source = required(&opts.source_file, "source")?;
    let delta = required(&opts.delta_file, "delta")?;
    check_output(&delta, opts)?;
    let sync = opts.sync_options()?;
    let stats = sync_io::write_delta(&sig, &source, &delta, &sync).map_err(|e| e.to_string())?;

    let m = &stats.matched;
    if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "blocksync: delta: source size: {}, equal blocks: {}, diff bytes: {}, delta size: {}",
            stats.source_size, m.equal_blocks, m.diff_bytes, stats.delta_size
        );
    }
    if opts.json_output {
        print_json(serde_json::json!({
            "command": "delta",
            "source_size": stats.source_size,
            "block_len": stats.block_len,
            "in_place": sync.in_place,
            "equal_blocks": m.equal_blocks,
            "diff_records": m.diff_records,
            "diff_bytes": m.diff_bytes,
            "lookups": m.lookups,
            "delta_size": stats.delta_size,
            "source_sha256": hex_opt(&stats.source_sha256),
        }));
    }
    Ok(())
}

fn cmd_patch(opts: &Options) -> Result<(), String> {
    let target = required(&opts.target_file, "target")?;
    let delta = required(&opts.delta_file, "delta")?;
    if let Some(out) = &opts.output_file {
        check_output(out, opts)?;
    }
    let stats = sync_io::apply_delta_file(&target, &delta, opts.output_file.as_deref())
        .map_err(|e| e.to_string())?;

    let a = &stats.applied;
    if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "blocksync: patch: output size: {}, equal bytes: {}, diff bytes: {}{}",
            a.total_size,
            a.equal_bytes,
            a.diff_bytes,
            if stats.in_place { " (in place)" } else { "" }
        );
    }
    if opts.json_output {
        print_json(serde_json::json!({
            "command": "patch",
            "in_place": stats.in_place,
            "output_size": a.total_size,
            "equal_bytes": a.equal_bytes,
            "diff_bytes": a.diff_bytes,
            "output_sha256": hex_opt(&stats.output_sha256),
        }));
    }
    Ok(())
}

fn cmd_sync(opts: &Options) -> Result<(), String> {
    let target = required(&opts.target_file, "target")?;
    let source = required(&opts.source_file, "source")?;
    if let Some(out) = &opts.output_file {
        check_output(out, opts)?;
    }
    let sync = opts.sync_options()?;
    let stats = sync_io::sync_file(&target, &source, opts.output_file.as_deref(), &sync)
        .map_err(|e| e.to_string())?;

    let m = &stats.matched;
    if opts.verbose > 0 && !opts.quiet {
        eprintln!(
            "blocksync: sync: source size: {}, rounds: {}, equal blocks: {}, diff bytes: {}",
            stats.source_size, stats.rounds, m.equal_blocks, m.diff_bytes
        );
    }
    if opts.json_output {
        print_json(serde_json::json!({
            "command": "sync",
            "source_size": stats.source_size,
            "rounds": stats.rounds,
            "in_place": stats.patch.in_place,
            "equal_blocks": m.equal_blocks,
            "diff_bytes": m.diff_bytes,
            "lookups": m.lookups,
            "output_sha256": hex_opt(&stats.patch.output_sha256),
        }));
    }
    Ok(())
}

fn cmd_block_size(opts: &Options) -> Result<(), String> {
    let cfg = opts.config;
    let single = cfg.block_length_for(opts.size);
    let rounds: Vec<u32> = cfg.round_lengths(cfg.multiround_initial(opts.size)).collect();
    if opts.json_output {
        print_json(serde_json::json!({
            "command": "block-size",
            "size": opts.size,
            "profile": cfg.name,
            "block_len": single,
            "multiround": rounds,
        }));
        return Ok(());
    }
    println!("size:        {}", opts.size);
    println!("profile:     {}", cfg.name);
    println!("block:       {single}");
    let rounds: Vec<String> = rounds.iter().map(u32::to_string).collect();
    println!("multiround:  {}", rounds.join(" "));
    Ok(())
}

fn describe(frame: &Frame) -> String {
    match frame {
        Frame::HashBegin {
            name,
            block_len,
            flags,
        } => format!("HashBegin   name={name} block_len={block_len} flags={flags:?}"),
        Frame::HashBlock(b) => format!(
            "HashBlock   weak={:08x} strong={} base={} index={}",
            b.weak,
            b.strong.to_hex(),
            b.position.base_offset,
            b.position.block_index
        ),
        Frame::HashEnd { digest, size } => {
            format!("HashEnd     digest={} size={size}", digest.to_hex())
        }
        Frame::DeltaBegin {
            name,
            block_len,
            flags,
        } => format!("DeltaBegin  name={name} block_len={block_len} flags={flags:?}"),
        Frame::Equal {
            position,
            block_len,
            source_offset,
        } => format!(
            "Equal       base={} index={} len={block_len} at={source_offset}",
            position.base_offset, position.block_index
        ),
        Frame::Diff {
            source_offset,
            data,
        } => format!("Diff        len={} at={source_offset}", data.len()),
        Frame::RoundBegin { block_len } => format!("RoundBegin  block_len={block_len}"),
        Frame::RoundEnd => "RoundEnd".to_string(),
        Frame::DeltaEnd { total_size } => format!("DeltaEnd    size={total_size}"),
        Frame::Error { code, message } => format!("Error       code={code} message={message}"),
    }
}

fn cmd_inspect(opts: &Options) -> Result<(), String> {
    let path = required(&opts.delta_file, "frames")?;
    let file = File::open(&path).map_err(|e| format!("{}: {e}", path.display()))?;
    let mut reader = FrameReader::new(BufReader::with_capacity(BUF_SIZE, file));
    let mut shown = 0u64;
    while opts.limit.is_none_or(|limit| shown < limit) {
        match reader.read_frame() {
            Ok(Some(frame)) => {
                println!("{:>8}  {}", shown, describe(&frame));
                shown += 1;
            }
            Ok(None) => break,
            Err(e) => return Err(format!("{}: frame {shown}: {e}", path.display())),
        }
    }
    if opts.verbose > 0 && !opts.quiet {
        eprintln!("blocksync: {shown} frames");
    }
    Ok(())
}

fn cmd_config() -> i32 {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("blocksync version {version} (Rust)");

    let file_io = cfg!(feature = "file-io") as u8;
    let parallel = cfg!(feature = "parallel") as u8;
    let ptr_size = std::mem::size_of::<*const ()>();

    eprintln!("FILE_IO={file_io}");
    eprintln!("PARALLEL={parallel}");
    eprintln!("MIN_BLOCK={}", config::MIN_BLOCK);
    eprintln!("MAX_BLOCK={}", config::MAX_BLOCK);
    eprintln!("MULTIROUND_BASE={}", config::MULTIROUND_BASE);
    for cfg in [config::DEFAULT, config::LOW_MEMORY] {
        eprintln!(
            "PROFILE {}: multiround_max_block={} buffer_len={}",
            cfg.name, cfg.multiround_max_block, cfg.buffer_len
        );
    }
    eprintln!("sizeof(usize)={ptr_size}");

    0
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Main CLI entry point. Parses arguments via clap, dispatches commands.
pub fn run() -> ! {
    let cli = Cli::parse();
    let opts = resolve_options(cli);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(opts.log_filter()))
        .format_timestamp(None)
        .format_target(false)
        .init();

    let exit_code = match opts.command {
        Command::Signature => finish(cmd_signature(&opts)),
        Command::Delta => finish(cmd_delta(&opts)),
        Command::Patch => finish(cmd_patch(&opts)),
        Command::Sync => finish(cmd_sync(&opts)),
        Command::BlockSize => finish(cmd_block_size(&opts)),
        Command::Inspect => finish(cmd_inspect(&opts)),
        Command::Config => cmd_config(),
    };

    process::exit(exit_code);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
