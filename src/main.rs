use std::path::PathBuf;
use std::process::ExitCode;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use nsz::config::{TieBreak, UndupeAction};
use nsz::{
    BatchReport, CnmtPolicy, Config, RetentionPolicy, Threads, VerifyMode, VerifyPolicy,
};

#[derive(Parser)]
#[command(name = "nsz", version, about = "Compress, verify and deduplicate NSP/XCI/NCA containers")]
struct Cli {
    /// JSON config file; command-line flags override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More logging (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum CnmtArg { Never, OnDemand, Always }

#[derive(Clone, Copy, ValueEnum)]
enum VerifyArg { None, Quick, Full }

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg { Report, Remove, Hardlink, Rename }

#[derive(Subcommand)]
enum Commands {
    /// Compress containers into archives
    Compress {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(short = 'o', long)]
        output_dir: Option<PathBuf>,
        /// Zstd level (1-22)
        #[arg(short, long)]
        level: Option<i32>,
        /// Block size as a power of two (14-32)
        #[arg(short = 'B', long)]
        block_size_exponent: Option<u8>,
        /// One zstd stream for the whole container
        #[arg(short = 'S', long)]
        solid: bool,
        /// Long-distance matching (larger window)
        #[arg(short = 'L', long)]
        long: bool,
        #[arg(long)]
        fix_padding: bool,
        /// Files processed concurrently
        #[arg(short, long)]
        multi: Option<usize>,
        /// Block workers per file: a count or "auto"
        #[arg(short, long)]
        threads: Option<Threads>,
        #[arg(long, value_enum)]
        cnmt: Option<CnmtArg>,
        #[arg(long, value_enum)]
        verify: Option<VerifyArg>,
        /// Delete each source after its archive verifies
        #[arg(long)]
        rm_source: bool,
        #[arg(short = 'w', long)]
        overwrite: bool,
        #[arg(short, long)]
        keys: Option<PathBuf>,
    },
    /// Restore the original containers
    Decompress {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(short = 'o', long)]
        output_dir: Option<PathBuf>,
        #[arg(long)]
        fix_padding: bool,
        #[arg(short, long)]
        multi: Option<usize>,
        #[arg(short, long)]
        threads: Option<Threads>,
        #[arg(short = 'w', long)]
        overwrite: bool,
    },
    /// Check archives (and plain containers)
    Verify {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        /// Decode everything and compare with the original
        #[arg(short = 'F', long)]
        full: bool,
        #[arg(long)]
        fix_padding: bool,
        /// Original container (single input only)
        #[arg(long)]
        original: Option<PathBuf>,
        #[arg(short, long)]
        multi: Option<usize>,
    },
    /// Write selected entries out as files
    Extract {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(short = 'o', long, default_value = ".")]
        output_dir: PathBuf,
        /// Regex over entry and content unit names
        #[arg(short, long, default_value = ".*")]
        selector: String,
    },
    /// Package loose files into an NSP
    Create {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(long)]
        fix_padding: bool,
        #[arg(short = 'w', long)]
        overwrite: bool,
    },
    /// Print the content units of each input as JSON
    Classify {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(long, value_enum)]
        cnmt: Option<CnmtArg>,
        #[arg(short, long)]
        keys: Option<PathBuf>,
    },
    /// Find redundant copies of the same title
    Undupe {
        #[arg(required = true, num_args = 1..)]
        input: Vec<PathBuf>,
        #[arg(long, value_enum)]
        action: Option<ActionArg>,
        #[arg(long)]
        dry_run: bool,
        /// Group across versions
        #[arg(long)]
        old_versions: bool,
        #[arg(long)]
        priority: Vec<String>,
        #[arg(long)]
        whitelist: Vec<String>,
        #[arg(long)]
        blacklist: Vec<String>,
        /// Resolve identical ranks by path order instead of refusing
        #[arg(long)]
        path_order: bool,
    },
}

impl From<CnmtArg> for CnmtPolicy {
    fn from(a: CnmtArg) -> Self {
        match a {
            CnmtArg::Never    => CnmtPolicy::Never,
            CnmtArg::OnDemand => CnmtPolicy::OnDemand,
            CnmtArg::Always   => CnmtPolicy::Always,
        }
    }
}

impl From<VerifyArg> for VerifyPolicy {
    fn from(a: VerifyArg) -> Self {
        match a {
            VerifyArg::None  => VerifyPolicy::None,
            VerifyArg::Quick => VerifyPolicy::Quick,
            VerifyArg::Full  => VerifyPolicy::Full,
        }
    }
}

impl From<ActionArg> for UndupeAction {
    fn from(a: ActionArg) -> Self {
        match a {
            ActionArg::Report   => UndupeAction::Report,
            ActionArg::Remove   => UndupeAction::Remove,
            ActionArg::Hardlink => UndupeAction::Hardlink,
            ActionArg::Rename   => UndupeAction::Rename,
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "nsz=info",
        1 => "nsz=debug",
        _ => "nsz=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

fn print_failures<T>(report: &BatchReport<T>) -> bool {
    for (path, e) in report.failed() {
        eprintln!("  FAILED  {}: {e}", path.display());
    }
    report.is_success()
}

/// Returns whether every job succeeded.
fn run(cli: Cli) -> nsz::Result<bool> {
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        // ── Compress ─────────────────────────────────────────────────────────
        Commands::Compress {
            input, output_dir, level, block_size_exponent, solid, long, fix_padding,
            multi, threads, cnmt, verify, rm_source, overwrite, keys,
        } => {
            let mut opts = config.compress;
            if let Some(l) = level { opts.params.level = l; }
            if let Some(b) = block_size_exponent { opts.params.block_size_exponent = b; }
            opts.params.solid |= solid;
            opts.params.long_distance_mode |= long;
            opts.fix_padding |= fix_padding;
            if let Some(m) = multi { opts.parallelism.multi = m; }
            if let Some(t) = threads { opts.parallelism.threads = t; }
            if let Some(c) = cnmt { opts.cnmt = c.into(); }
            if let Some(v) = verify { opts.verify = v.into(); }
            if rm_source {
                opts.retention = RetentionPolicy::RemoveSource;
                if opts.verify == VerifyPolicy::None {
                    opts.verify = VerifyPolicy::Quick;
                }
            }
            opts.overwrite |= overwrite;
            if keys.is_some() { opts.keys_file = keys; }

            let report = nsz::compress_batch(&input, output_dir.as_deref(), &opts)?;
            for (path, out) in report.succeeded() {
                match (&out.report, out.skipped) {
                    (_, true) => println!("  skipped {} (exists)", out.output.display()),
                    (Some(r), _) => println!(
                        "  {} -> {}  {} -> {} bytes",
                        path.display(), out.output.display(), r.source_size, r.archive_size
                    ),
                    (None, _) => println!("  {} -> {}", path.display(), out.output.display()),
                }
            }
            Ok(print_failures(&report))
        }

        // ── Decompress ───────────────────────────────────────────────────────
        Commands::Decompress { input, output_dir, fix_padding, multi, threads, overwrite } => {
            let mut opts = config.decompress;
            opts.fix_padding |= fix_padding;
            if let Some(m) = multi { opts.parallelism.multi = m; }
            if let Some(t) = threads { opts.parallelism.threads = t; }
            opts.overwrite |= overwrite;
            let report = nsz::decompress_batch(&input, output_dir.as_deref(), &opts)?;
            for (path, out) in report.succeeded() {
                let state = if out.skipped { "skipped" } else { "restored" };
                println!("  {state} {} -> {}", path.display(), out.output.display());
            }
            Ok(print_failures(&report))
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input, full, fix_padding, original, multi } => {
            let mut opts = config.verify;
            if full { opts.mode = VerifyMode::Full; }
            opts.fix_padding |= fix_padding;
            if original.is_some() { opts.original = original; }
            if let Some(m) = multi { opts.parallelism.multi = m; }
            let report = nsz::verify_batch(&input, &opts)?;
            for (path, r) in report.succeeded() {
                println!("  OK      {} ({:?}, {} blocks)", path.display(), r.mode, r.blocks_checked);
            }
            Ok(print_failures(&report))
        }

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { input, output_dir, selector } => {
            let report = nsz::extract(&input, &output_dir, &selector, &nsz::CancelToken::new())?;
            let mut count = 0;
            for (_, written) in report.succeeded() {
                for p in written {
                    println!("  {}", p.display());
                }
                count += written.len();
            }
            println!("Extracted {count} entries");
            Ok(print_failures(&report))
        }

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { output, input, fix_padding, overwrite } => {
            let mut opts = config.create;
            opts.fix_padding |= fix_padding;
            opts.overwrite |= overwrite;
            let out = nsz::create(&output, &input, &opts)?;
            println!("Created: {}", out.display());
            Ok(true)
        }

        // ── Classify ─────────────────────────────────────────────────────────
        Commands::Classify { input, cnmt, keys } => {
            let policy = cnmt.map(CnmtPolicy::from).unwrap_or(config.compress.cnmt);
            let keys = keys.or(config.compress.keys_file);
            let report = nsz::classify_batch(&input, policy, keys.as_deref(), config.compress.parallelism.multi)?;
            for (path, units) in report.succeeded() {
                let json = serde_json::json!({ "path": path, "units": units });
                println!("{json}");
            }
            Ok(print_failures(&report))
        }

        // ── Undupe ───────────────────────────────────────────────────────────
        Commands::Undupe { input, action, dry_run, old_versions, priority, whitelist, blacklist, path_order } => {
            let mut policy = config.undupe;
            if let Some(a) = action { policy.action = a.into(); }
            policy.dry_run |= dry_run;
            policy.old_versions |= old_versions;
            policy.priority.extend(priority);
            policy.whitelist.extend(whitelist);
            policy.blacklist.extend(blacklist);
            if path_order { policy.tie_break = TieBreak::PathOrder; }

            let report = nsz::undupe(&input, &policy)?;
            let tag = if report.dry_run { " (dry run)" } else { "" };
            for p in &report.kept {
                println!("  keep       {}", p.display());
            }
            for s in &report.superseded {
                let done = if s.applied { "done" } else { "not applied" };
                println!("  {:<10} {} (kept {}; {done}){tag}", format!("{:?}", s.action).to_lowercase(), s.path.display(), s.retained.display());
            }
            for e in report.ambiguous.iter().chain(&report.failures) {
                eprintln!("  {e}");
            }
            Ok(report.failures.is_empty() && report.ambiguous.is_empty())
        }
    }
}
