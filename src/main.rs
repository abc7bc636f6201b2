use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dcm_prep::config::{LabelStrategy, PipelineConfig, PolicyKind, ThicknessRange};
use dcm_prep::pipeline::{self, RunOptions, Stage};
use dcm_prep::report::print_summary;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dcm-prep")]
#[command(about = "Prepare DICOM studies for conversion: series selection, case identity, resumable extraction")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Select one series per case and convert it with dcm2niix
    Convert {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        selection: SelectionArgs,

        /// Converter binary (overrides the configured candidates)
        #[arg(long)]
        converter: Option<PathBuf>,

        /// Converter timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Staging directory for converter input (must be an ASCII path)
        #[arg(long)]
        staging: Option<PathBuf>,
    },
    /// Write de-identified copies of every case
    Deidentify {
        #[command(flatten)]
        input: InputArgs,
    },
    /// Discover cases and report the selected series without converting
    Scan {
        #[command(flatten)]
        input: InputArgs,
        #[command(flatten)]
        selection: SelectionArgs,
    },
    /// Merge converter sidecars with a registry CSV
    Reconcile {
        /// Folder containing converter outputs and sidecars
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Registry CSV (e.g. case_metadata.csv from a previous run)
        #[arg(long)]
        registry: Option<PathBuf>,
    },
}

#[derive(Args)]
struct InputArgs {
    /// Input path: ZIP archive, case folder, or folder of archives/folders
    #[arg(value_name = "INPUT")]
    input: PathBuf,

    /// Output directory (defaults to <input>/output)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Treat INPUT as a single case folder even if it has sub-folders
    #[arg(long)]
    single: bool,

    /// Process cases in parallel
    #[arg(long)]
    parallel: bool,

    /// Show a progress bar
    #[arg(long)]
    progress: bool,

    /// Keep extracted working copies after success
    #[arg(long)]
    keep_work: bool,

    /// How case labels are derived
    #[arg(long, value_enum)]
    labels: Option<LabelArg>,
}

#[derive(Args)]
struct SelectionArgs {
    /// Series selection policy
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,

    /// Keep only series whose slice thickness is at least this (mm)
    #[arg(long, requires = "thickness_max")]
    thickness_min: Option<f64>,

    /// Keep only series whose slice thickness is at most this (mm)
    #[arg(long, requires = "thickness_min")]
    thickness_max: Option<f64>,

    /// Disable the slice-thickness filter
    #[arg(long, conflicts_with_all = ["thickness_min", "thickness_max"])]
    no_thickness_filter: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    /// Most objects, then largest area, CT, highest series number
    Lexicographic,
    /// Weighted score with keyword penalties and bonuses
    Scored,
    /// Scored, after discarding series outside 4.5-5.5mm slice thickness
    Thin5mm,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum LabelArg {
    Subject,
    Source,
    SourceSubject,
}

impl From<LabelArg> for LabelStrategy {
    fn from(arg: LabelArg) -> Self {
        match arg {
            LabelArg::Subject => LabelStrategy::Subject,
            LabelArg::Source => LabelStrategy::Source,
            LabelArg::SourceSubject => LabelStrategy::SourceSubject,
        }
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration {:?}", path)),
        None => Ok(PipelineConfig::default()),
    }
}

fn apply_input(config: &mut PipelineConfig, args: &InputArgs) -> RunOptions {
    if let Some(labels) = args.labels {
        config.identity.label_strategy = Some(labels.into());
    }
    if args.keep_work {
        config.extraction.keep_working_copies = true;
    }
    RunOptions {
        input: args.input.clone(),
        output: args.output.clone(),
        force_single: args.single,
        parallel: args.parallel,
        keep_work: args.keep_work,
        progress: args.progress,
        staging_root: None,
    }
}

fn apply_selection(config: &mut PipelineConfig, args: &SelectionArgs) {
    match args.policy {
        Some(PolicyArg::Lexicographic) => config.selection.policy = PolicyKind::Lexicographic,
        Some(PolicyArg::Scored) => config.selection.policy = PolicyKind::Scored,
        Some(PolicyArg::Thin5mm) => {
            config.selection.policy = PolicyKind::Scored;
            config.selection.thickness_range = Some(ThicknessRange::default());
        }
        None => {}
    }
    if let (Some(min), Some(max)) = (args.thickness_min, args.thickness_max) {
        config.selection.thickness_range = Some(ThicknessRange::new(min, max));
    }
    if args.no_thickness_filter {
        config.selection.thickness_range = None;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Convert {
            input,
            selection,
            converter,
            timeout,
            staging,
        } => {
            let mut options = apply_input(&mut config, &input);
            apply_selection(&mut config, &selection);
            if let Some(converter) = converter {
                config.converter.candidates = vec![converter];
            }
            if let Some(timeout) = timeout {
                config.converter.timeout_secs = timeout;
                config.converter.extended_timeout_secs = config.converter.extended_timeout_secs.max(timeout);
            }
            options.staging_root = staging;
            config.validate()?;

            let summary = pipeline::run(&options, &config, Stage::Convert)?;
            print_summary(&summary.report.summary, &summary.paths);
            if summary.report.summary.total > 0 && summary.report.summary.succeeded() == 0 {
                bail!("no case was converted");
            }
        }
        Command::Scan { input, selection } => {
            let options = apply_input(&mut config, &input);
            apply_selection(&mut config, &selection);
            config.validate()?;

            let summary = pipeline::run(&options, &config, Stage::Scan)?;
            for case in &summary.report.cases {
                match &case.selected {
                    Some(series) => println!(
                        "✅ {} [{}]: series {} - {} ({} files)",
                        case.label, case.surrogate, series.series_number, series.description, series.object_count
                    ),
                    None => println!(
                        "❌ {}: {}",
                        case.label,
                        case.error.as_deref().unwrap_or("no series selected")
                    ),
                }
            }
            print_summary(&summary.report.summary, &summary.paths);
        }
        Command::Deidentify { input } => {
            let options = apply_input(&mut config, &input);
            config.validate()?;

            let run = pipeline::deidentify(&options, &config)?;
            for case in &run.cases {
                println!(
                    "✅ {} -> {} ({}/{} files)",
                    case.case, case.new_patient_id, case.files_written, case.file_count
                );
            }
            for failure in &run.failures {
                println!(
                    "❌ {}: {}",
                    failure.label,
                    failure.error.as_deref().unwrap_or("failed")
                );
            }
            if let Some(path) = &run.summary_csv {
                println!("📄 {}", path.display());
            }
            println!("📁 Output: {}", run.output_root.display());
        }
        Command::Reconcile { dir, registry } => {
            let (summary, clinical, count) = pipeline::reconcile_outputs(&dir, registry.as_deref())?;
            println!("✅ {} records reconciled", count);
            println!("📄 {}", summary.display());
            println!("📄 {}", clinical.display());
        }
    }

    Ok(())
}
