use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use htr_core::{
    CancellationToken, DecodeOptions, DeviceInventory, HostTestExecutor, Kettle, KettleGuard,
    Orchestrator, RunConfig, RunSummary, SuiteResult, TestSpec, decode_log,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Host test runner for embedded targets", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Flash and run every test binary listed in the test spec
    Run(RunArgs),

    /// Decode a captured transcript and print the results
    Decode {
        /// Transcript or raw device output
        log: PathBuf,

        /// Test binary name, used to name a synthesized case
        #[arg(long, default_value = "")]
        test_name: String,

        /// Build directory coverage dumps are written under
        #[arg(long)]
        build_path: Option<PathBuf>,
    },

    /// Show the device lock registry
    Locks {
        /// Lock directory (default ~/.htr)
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Remove the entry of this instance id
        #[arg(long)]
        clean: Option<String>,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// test_spec.json files; builds are merged
    #[arg(short = 't', long = "test-spec", required = true)]
    test_spec: Vec<PathBuf>,

    /// Device inventory
    #[arg(short, long, default_value = "devices.toml")]
    devices: PathBuf,

    /// Run configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Devices used at once per build
    #[arg(short, long)]
    parallel: Option<usize>,

    /// Comma list of tests to run; a trailing `*` matches by prefix
    #[arg(short = 'n', long)]
    test_by_names: Option<String>,

    /// Comma list of tests to skip
    #[arg(short, long)]
    skip_test: Option<String>,

    /// Attempts per test binary
    #[arg(short, long)]
    retry_count: Option<u32>,

    /// Shuffle test order
    #[arg(long)]
    shuffle: bool,

    /// Seed for --shuffle
    #[arg(long)]
    shuffle_seed: Option<u64>,

    /// Claim devices in the cross-process lock registry
    #[arg(long)]
    lock: bool,
}

fn main() {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match args.command {
        Command::Run(run_args) => run(run_args),
        Command::Decode {
            log,
            test_name,
            build_path,
        } => decode(log, test_name, build_path),
        Command::Locks { dir, clean } => locks(dir, clean),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run(args: RunArgs) -> Result<i32> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load_from_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(parallel) = args.parallel {
        config.parallelism = parallel;
    }
    if let Some(retry_count) = args.retry_count {
        config.retry_count = retry_count;
    }
    if args.test_by_names.is_some() {
        config.test_by_names = args.test_by_names;
    }
    if args.skip_test.is_some() {
        config.skip_tests = args.skip_test;
    }
    if args.shuffle || args.shuffle_seed.is_some() {
        config.shuffle = true;
        config.shuffle_seed = args.shuffle_seed.or(config.shuffle_seed);
    }
    if args.lock {
        config.lock.enabled = true;
    }

    let mut inventory = DeviceInventory::load_from_file(&args.devices)?;
    let spec = TestSpec::load_all(&args.test_spec).context("loading test spec")?;
    let targets = spec.to_build_targets(&config);
    info!(
        builds = targets.len(),
        devices = inventory.devices.len(),
        "Starting run"
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("Interrupt received, stopping after the current tests");
            cancel.cancel();
        })
        .context("installing interrupt handler")?;
    }

    let executor = HostTestExecutor::new(config.clone(), config.plugin_registry()?);
    let mut orchestrator = Orchestrator::new(config.clone(), executor, cancel);
    let guard = if config.lock.enabled {
        let guard = KettleGuard::register(config.lock.kettle()).context("registering in kettle")?;
        orchestrator = orchestrator.with_kettle(guard.kettle().clone());
        Some(guard)
    } else {
        None
    };

    let summary = orchestrator.run(&targets, &mut inventory);
    drop(guard);

    print_summary(&summary);
    Ok(summary.exit_code())
}

fn print_summary(summary: &RunSummary) {
    let report = &summary.report;
    println!(
        "{:<20} {:<40} {:<18} {:<13} {:>9} {:>6} {:>6}",
        "build", "test", "target", "result", "elapsed", "passed", "failed"
    );
    for (build, test, suite) in report.suites() {
        let (passed, failed) = suite.case_counts();
        println!(
            "{:<20} {:<40} {:<18} {:<13} {:>8.2}s {:>6} {:>6}",
            build,
            test,
            suite.target_id,
            suite.outcome.as_str(),
            suite.duration,
            passed,
            failed
        );
    }

    let counts = report
        .outcome_counts()
        .iter()
        .map(|(outcome, n)| format!("{} {}", n, outcome))
        .collect::<Vec<_>>()
        .join(" / ");
    println!("Result: {} ({})", report.suite_outcome(), counts);
    if let Some(seed) = report.shuffle_seed {
        println!("Shuffle seed: {}", seed);
    }
    for platform in &report.unmatched_platforms {
        println!("No device matched platform {}", platform);
    }
    for platform in &report.busy_platforms {
        println!("Every {} device was held by another instance", platform);
    }
    if summary.cancelled {
        println!("Run was cancelled");
    }
}

fn decode(log: PathBuf, test_name: String, build_path: Option<PathBuf>) -> Result<i32> {
    let text = std::fs::read_to_string(&log)
        .with_context(|| format!("reading transcript {}", log.display()))?;
    let result = decode_log(
        &text,
        DecodeOptions {
            test_name,
            build_path,
            duration: None,
        },
    );
    print_suite(&result);
    Ok(if result.outcome.is_success() { 0 } else { 1 })
}

fn print_suite(result: &SuiteResult) {
    println!("Suite: {} in {:.2}s", result.outcome, result.duration);
    println!(
        "{:<48} {:<8} {:>6} {:>6} {:>9}",
        "test case", "result", "passed", "failed", "elapsed"
    );
    for (name, case) in &result.test_cases {
        println!(
            "{:<48} {:<8} {:>6} {:>6} {:>8.2}s",
            name,
            case.result_text(),
            case.passed,
            case.failed,
            case.duration
        );
    }

    let (passed, failed) = result.computed_summary();
    match result.summary {
        Some(reported) if !result.summary_matches() => println!(
            "Summary: {} passed / {} failed (device reported {} / {})",
            passed, failed, reported.0, reported.1
        ),
        _ => println!("Summary: {} passed / {} failed", passed, failed),
    }

    if let Some(memory) = &result.memory_metrics {
        if let Some(max_heap) = memory.max_heap {
            println!("Max heap usage: {} bytes", max_heap);
        }
        if let Some(reserved) = memory.reserved_heap {
            println!("Reserved heap: {} bytes", reserved);
        }
        if let Some(stacks) = &memory.stack_summary {
            println!(
                "Stacks: {} threads, max {} of {} bytes, total {} of {} bytes",
                memory.thread_stack_info.len(),
                stacks.max_stack_usage,
                stacks.max_stack_size,
                stacks.max_stack_usage_total,
                stacks.reserved_stack_total
            );
        }
    }
}

fn locks(dir: Option<PathBuf>, clean: Option<String>) -> Result<i32> {
    let dir = dir.unwrap_or_else(Kettle::default_dir);
    if let Some(instance) = clean {
        Kettle::with_instance_id(&dir, instance, None).clean()?;
    }
    print!("{}", Kettle::new(&dir, None).info()?);
    Ok(0)
}
