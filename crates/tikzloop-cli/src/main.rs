mod report;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tikzloop_contracts::runs::{FinalSelection, Run, Verdict};
use tikzloop_engine::config::{
    DEFAULT_DPI, DEFAULT_MAX_ATTEMPTS, DEFAULT_PASS_THRESHOLD, DEFAULT_SIMILARITY_THRESHOLD,
};
use tikzloop_engine::recorder::REPORT_FILE_NAME;
use tikzloop_engine::{
    build_generator, load_run, ConvergenceController, GenerationConfig, LatexRenderer,
    LoopOptions, Rasterizer, RenderConfig, RunRecorder, SsimScorer, Strategy,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::report::write_report;

#[derive(Debug, Parser)]
#[command(name = "tikzloop", version, about = "Convert a figure image into TikZ code")]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Convert(ConvertArgs),
    Export(ExportArgs),
}

#[derive(Debug, Args)]
struct ConvertArgs {
    image: PathBuf,
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    max_attempts: usize,
    #[arg(long, default_value = "similarity")]
    strategy: String,
    #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
    threshold: f64,
    #[arg(long, default_value_t = DEFAULT_PASS_THRESHOLD)]
    pass_threshold: f64,
    #[arg(long, default_value = "last-rendered")]
    select: String,
    /// Ask the planner for aesthetic cleanup (critique strategy only).
    #[arg(long)]
    clean: bool,
    /// Extra preamble lines, e.g. \usepackage commands.
    #[arg(long)]
    preamble: Option<PathBuf>,
    /// Run directory; defaults to runs/<image stem>.
    #[arg(long)]
    out: Option<PathBuf>,
    #[arg(long, env = "TIKZLOOP_PROVIDER", default_value = "openai")]
    provider: String,
    #[arg(long, env = "TIKZLOOP_MODEL")]
    model: Option<String>,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long, default_value_t = 120)]
    request_timeout: u64,
    #[arg(long, default_value = "pdflatex")]
    compiler: String,
    #[arg(long, default_value = "pdftoppm")]
    rasterizer: String,
    #[arg(long, default_value_t = DEFAULT_DPI)]
    dpi: u32,
    #[arg(long, default_value_t = 30)]
    compile_timeout: u64,
    #[arg(long)]
    no_report: bool,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    run: PathBuf,
    /// Defaults to report.html inside the run directory.
    #[arg(long)]
    out: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("tikzloop error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Convert(args) => run_convert(args),
        Command::Export(args) => run_export(args),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "tikzloop=debug" } else { "tikzloop=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_convert(args: ConvertArgs) -> Result<i32> {
    let preamble = match &args.preamble {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading preamble {}", path.display()))?,
        None => String::new(),
    };
    let options = LoopOptions {
        max_attempts: args.max_attempts,
        strategy: args.strategy.parse::<Strategy>()?,
        threshold: args.threshold,
        pass_threshold: args.pass_threshold,
        clean: args.clean,
        selection: parse_selection(&args.select)?,
        work_dir: args
            .out
            .clone()
            .unwrap_or_else(|| default_work_dir(&args.image)),
    };
    let render_config = RenderConfig {
        compiler: args.compiler.clone(),
        rasterizer: args.rasterizer.parse::<Rasterizer>()?,
        dpi: args.dpi,
        compile_timeout: Duration::from_secs(args.compile_timeout),
        preamble: preamble.clone(),
        ..RenderConfig::default()
    };
    let generation_config = GenerationConfig {
        provider: args.provider.trim().to_ascii_lowercase(),
        model: args.model.clone(),
        api_base: args.api_base.clone(),
        request_timeout: Duration::from_secs(args.request_timeout),
        ..GenerationConfig::default()
    }
    .with_env_credentials();

    let generator = build_generator(&generation_config, &preamble)?;
    let controller = ConvergenceController::new(
        Box::new(generator),
        Box::new(LatexRenderer::new(render_config)),
        Box::new(SsimScorer::default()),
    );
    let run = controller.run(&args.image, &options)?;

    let record = RunRecorder::new(&options.work_dir, preamble).persist(&run)?;
    if !args.no_report {
        let report_path = options.work_dir.join(REPORT_FILE_NAME);
        write_report(&record, &report_path)?;
        info!(path = %report_path.display(), "report written");
    }
    print_outcome(&run, &options.work_dir);
    Ok(exit_code(&run))
}

fn run_export(args: ExportArgs) -> Result<i32> {
    if !args.run.is_dir() {
        bail!("run directory {} does not exist", args.run.display());
    }
    let record = load_run(&args.run)?;
    let out = args
        .out
        .unwrap_or_else(|| args.run.join(REPORT_FILE_NAME));
    write_report(&record, &out)?;
    println!("Exported to {}", out.display());
    Ok(0)
}

fn parse_selection(raw: &str) -> Result<FinalSelection> {
    match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
        "last-rendered" | "last" => Ok(FinalSelection::LastRendered),
        "best-scoring" | "best" => Ok(FinalSelection::BestScoring),
        other => bail!("unknown selection '{other}' (expected last-rendered or best-scoring)"),
    }
}

fn default_work_dir(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .and_then(|value| value.to_str())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("figure");
    PathBuf::from("runs").join(stem)
}

fn print_outcome(run: &Run, work_dir: &Path) {
    println!(
        "Run {} finished: {} after {} attempt(s)",
        run.run_id(),
        run.verdict().as_str(),
        run.attempts().len()
    );
    match run.final_artifact() {
        Some(artifact) => {
            let attempt = run.attempts().get(artifact.attempt_index);
            let similarity = attempt
                .and_then(|item| item.similarity_score())
                .map(|score| format!("{score:.4}"))
                .unwrap_or_else(|| "N/A".to_string());
            println!(
                "Final: attempt {} (similarity {similarity}) -> {}",
                artifact.attempt_index,
                work_dir.join("final.tex").display()
            );
        }
        None => println!("No attempt rendered; sources are under {}", work_dir.display()),
    }
    if run.verdict() == Verdict::FailedQuality {
        println!("Result did not pass quality bar.");
    }
}

fn exit_code(run: &Run) -> i32 {
    match run.verdict() {
        Verdict::Passed | Verdict::FailedQuality => 0,
        Verdict::FailedCompile => 1,
    }
}
