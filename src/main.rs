use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, trace, warn};

use analysis_runner::game::{parse_move_list, GameRecord};
use analysis_runner::jobs::{load_jobs, sample_jobs, write_job_file};
use analysis_runner::logger::init_logger;
use analysis_runner::prelude::*;
use analysis_runner::progress::{spawn_console_printer, DEFAULT_CAPACITY};
use analysis_runner::report::{Summary, WalkReport};
use analysis_runner::transport::RetryPolicy;

#[derive(Debug, Parser)]
#[command(
    name = "analysis-runner",
    version,
    about = "Move-by-move and batch analysis through an external evaluation engine"
)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(flatten)]
    budget: BudgetArgs,

    /// Do not print progress lines
    #[arg(long, global = true)]
    quiet: bool,

    /// Write a trace log file in the working directory
    #[arg(long, global = true)]
    log: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct EngineArgs {
    /// Engine command line, run as a subprocess (e.g. "katago analysis -config a.cfg")
    #[arg(long, global = true, conflicts_with = "url")]
    engine_cmd: Option<String>,

    /// Base url of an HTTP engine
    #[arg(long, global = true)]
    url: Option<String>,

    /// Bearer credential for the HTTP engine
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Accept invalid TLS certificates
    #[arg(long, global = true)]
    insecure: bool,

    /// Attempts per HTTP request
    #[arg(long, global = true, default_value_t = 3)]
    max_attempts: u32,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    Fast,
    Standard,
    Precise,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorArg {
    Black,
    White,
}

#[derive(Debug, Args)]
struct BudgetArgs {
    /// Budget preset, applied before the other budget options
    #[arg(long, global = true, value_enum)]
    preset: Option<PresetArg>,

    /// Visits per query
    #[arg(long, global = true)]
    visits: Option<u32>,

    /// Engine time budget per query, in seconds
    #[arg(long, global = true)]
    max_time: Option<f64>,

    /// Consecutive failures before a walk stops
    #[arg(long, global = true)]
    failure_threshold: Option<usize>,

    /// Jobs in flight during a batch (default: physical CPU count)
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// Report win rates from this color's point of view
    #[arg(long, global = true, value_enum)]
    reference_color: Option<ColorArg>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Analyse a game position by position
    Walk {
        /// SGF file to analyse
        #[arg(long, conflicts_with = "moves")]
        sgf: Option<PathBuf>,

        /// Move list in engine coordinates: "B D4, W Q16, ..."
        #[arg(long)]
        moves: Option<String>,

        /// Board size of --moves
        #[arg(long, default_value_t = 19)]
        board_size: u8,

        /// Komi of --moves
        #[arg(long, default_value_t = 7.5)]
        komi: f64,

        /// First ply to analyse
        #[arg(long, default_value_t = 0)]
        from: usize,

        /// Last ply to analyse (default: end of game)
        #[arg(long)]
        to: Option<usize>,

        /// Stop after this many seconds
        #[arg(long)]
        deadline: Option<f64>,

        /// Report file (.csv for CSV, JSON otherwise)
        #[arg(long, short, default_value = "walk_report.json")]
        output: PathBuf,
    },
    /// Analyse independent jobs concurrently
    Batch {
        /// Job file (.json or .csv); the sample job set when absent
        #[arg(long)]
        jobs: Option<PathBuf>,

        /// Stop launching jobs after this many seconds
        #[arg(long)]
        deadline: Option<f64>,

        /// Report file (.csv for CSV, JSON otherwise)
        #[arg(long, short, default_value = "batch_report.json")]
        output: PathBuf,
    },
    /// Probe the HTTP engine
    Health,
    /// Write the sample job set to a file
    SampleJobs {
        /// Destination (.csv for CSV, JSON otherwise)
        #[arg(default_value = "sample_jobs.json")]
        output: PathBuf,
    },
}

/// Engine selected on the command line.
enum Engine {
    Process(ProcessConfig),
    Http(HttpConfig),
}

impl TransportFactory for Engine {
    fn create(&self) -> Result<Box<dyn Transport>, TransportError> {
        match self {
            Engine::Process(config) => config.create(),
            Engine::Http(config) => config.create(),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Configuration::from_env();
    if cli.quiet {
        config = config.with_verbose(false);
    }
    if cli.log {
        config = config.with_log(true);
    }
    if config.log() {
        let file = init_logger()?;
        eprintln!("logging to {}", file.display());
    }
    trace!(command = ?cli.command, ?config);

    match cli.command {
        Command::SampleJobs { ref output } => {
            let jobs = sample_jobs();
            write_job_file(&jobs, output)?;
            println!("{} sample jobs written to {}", jobs.len(), output.display());
            Ok(())
        }
        Command::Health => {
            let Some(Engine::Http(http)) = engine(&cli.engine, config)? else {
                bail!("health needs --url");
            };
            let transport = HttpTransport::connect(http)?;
            let status = transport.health(Duration::from_secs(10))?;
            println!("healthy: {} (HTTP {})", status.healthy, status.status);
            println!("{}", serde_json::to_string_pretty(&status.info)?);
            if !status.healthy {
                bail!("engine is not healthy");
            }
            Ok(())
        }
        Command::Walk {
            ref sgf,
            ref moves,
            board_size,
            komi,
            from,
            to,
            deadline,
            ref output,
        } => {
            let record = read_record(sgf.as_deref(), moves.as_deref(), board_size, komi)?;
            let settings = settings(&cli.budget)?;
            let engine = require_engine(&cli.engine, config)?;
            let transport = engine.create()?;

            let (sink, printer) = progress(config)?;
            let cancel = cancel_after(deadline)?;
            let mut walker = SequentialWalker::new(transport, settings)
                .with_progress(sink)
                .with_cancel(cancel);
            let state = walker.walk(&record, from, to.unwrap_or(record.len()));
            drop(walker);
            if let Some(printer) = printer {
                let _ = printer.join();
            }

            let report = WalkReport::finalize(state);
            println!(
                "walk {:?}: {} plies analysed, {} failed, {} moves skipped",
                report.status,
                report.plies.len(),
                report.failures.len(),
                report.skipped_moves.len()
            );
            print_summary(&report.summary);
            for swing in &report.summary.largest_swings {
                println!(
                    "  swing {:>3} -> {:<3} {:+.1}%",
                    swing.from_ply,
                    swing.to_ply,
                    swing.delta * 100.0
                );
            }
            write_report(&Report::Walk(report), output)?;
            println!("report written to {}", output.display());
            Ok(())
        }
        Command::Batch {
            ref jobs,
            deadline,
            ref output,
        } => {
            let jobs = match jobs {
                Some(path) => load_jobs(path)?,
                None => {
                    info!("no job file given, using sample jobs");
                    sample_jobs()
                }
            };
            let settings = settings(&cli.budget)?;
            let engine = require_engine(&cli.engine, config)?;

            let (sink, printer) = progress(config)?;
            let scheduler = BatchScheduler::new(engine, settings)
                .with_progress(sink)
                .with_cancel(cancel_after(deadline)?);
            let report = scheduler.run(jobs);
            drop(scheduler);
            if let Some(printer) = printer {
                let _ = printer.join();
            }

            println!(
                "batch: {} jobs, {} succeeded, {} failed, {} cancelled in {:.2}s",
                report.total_jobs,
                report.succeeded,
                report.failed,
                report.cancelled,
                report.elapsed.as_secs_f64()
            );
            print_summary(&report.summary);
            write_report(&Report::Batch(report), output)?;
            println!("report written to {}", output.display());
            Ok(())
        }
    }
}

fn settings(args: &BudgetArgs) -> anyhow::Result<AnalysisSettings> {
    let mut builder = AnalysisSettingsBuilder::from_env();
    if let Some(preset) = args.preset {
        builder = builder.with_preset(match preset {
            PresetArg::Fast => Preset::Fast,
            PresetArg::Standard => Preset::Standard,
            PresetArg::Precise => Preset::Precise,
        });
    }
    if let Some(visits) = args.visits {
        builder = builder.with_visit_budget(visits);
    }
    if let Some(secs) = args.max_time {
        let budget = Duration::try_from_secs_f64(secs)
            .ok()
            .filter(|d| !d.is_zero())
            .context("--max-time must be a positive number of seconds")?;
        builder = builder.with_time_budget(budget);
    }
    if let Some(threshold) = args.failure_threshold {
        builder = builder.with_failure_threshold(threshold);
    }
    if let Some(concurrency) = args.concurrency {
        builder = builder.with_concurrency(concurrency);
    }
    if let Some(color) = args.reference_color {
        builder = builder.with_reference_color(match color {
            ColorArg::Black => Color::Black,
            ColorArg::White => Color::White,
        });
    }
    let settings = builder.build().context("invalid analysis settings")?;
    trace!(?settings);
    Ok(settings)
}

fn engine(args: &EngineArgs, config: Configuration) -> anyhow::Result<Option<Engine>> {
    if let Some(line) = &args.engine_cmd {
        let process = ProcessConfig::from_command_line(line)
            .context("--engine-cmd is empty")?
            .with_allow_stderr(config.debug_engine_stderr());
        return Ok(Some(Engine::Process(process)));
    }
    if let Some(url) = &args.url {
        let mut http = HttpConfig::new(url.as_str())
            .with_verify_tls(!args.insecure)
            .with_retry(RetryPolicy {
                max_attempts: args.max_attempts,
                ..Default::default()
            });
        if let Some(key) = &args.api_key {
            http = http.with_api_key(key.as_str());
        }
        return Ok(Some(Engine::Http(http)));
    }
    Ok(None)
}

/// The configured engine, checked for reachability.
fn require_engine(args: &EngineArgs, config: Configuration) -> anyhow::Result<Engine> {
    let Some(engine) = engine(args, config)? else {
        bail!("no engine configured: use --engine-cmd or --url");
    };
    if let Engine::Http(http) = &engine {
        let status = HttpTransport::connect(http.clone())?
            .health(Duration::from_secs(10))
            .with_context(|| format!("engine at {} is unreachable", http.base_url))?;
        if !status.healthy {
            warn!(status = status.status, "engine health check failed");
            eprintln!("warning: engine reports unhealthy (HTTP {})", status.status);
        }
    }
    Ok(engine)
}

fn read_record(
    sgf: Option<&Path>,
    moves: Option<&str>,
    board_size: u8,
    komi: f64,
) -> anyhow::Result<GameRecord> {
    match (sgf, moves) {
        (Some(path), _) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("could not read {}", path.display()))?;
            GameRecord::from_sgf(&text).with_context(|| format!("invalid SGF {}", path.display()))
        }
        (None, Some(list)) => {
            let (moves, rejected) = parse_move_list(list, board_size);
            if !rejected.is_empty() {
                eprintln!("warning: skipped moves {rejected:?}");
            }
            Ok(GameRecord {
                moves,
                board_size,
                komi,
                ..Default::default()
            })
        }
        (None, None) => bail!("walk needs --sgf or --moves"),
    }
}

fn progress(
    config: Configuration,
) -> anyhow::Result<(ProgressSink, Option<thread::JoinHandle<()>>)> {
    if !config.verbose() {
        return Ok((ProgressSink::disabled(), None));
    }
    let (sink, events) = ProgressSink::bounded(DEFAULT_CAPACITY);
    let printer = spawn_console_printer(events).context("could not start progress printer")?;
    Ok((sink, Some(printer)))
}

fn cancel_after(deadline: Option<f64>) -> anyhow::Result<CancelToken> {
    let cancel = CancelToken::new();
    if let Some(secs) = deadline {
        let delay = Duration::try_from_secs_f64(secs)
            .context("--deadline must be a non-negative number of seconds")?;
        let token = cancel.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            info!("deadline reached, cancelling");
            token.cancel();
        });
    }
    Ok(cancel)
}

fn print_summary(summary: &Summary) {
    let secs = |v: Option<f64>| v.map_or("-".to_string(), |s| format!("{s:.3}s"));
    println!(
        "success rate {:.1}% ({}/{}), latency mean {} median {}",
        summary.success_rate * 100.0,
        summary.succeeded,
        summary.attempted,
        secs(summary.mean_latency),
        secs(summary.median_latency)
    );
}
