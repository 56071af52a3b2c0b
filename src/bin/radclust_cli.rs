use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use radclust::{
    cluster_within, discover_samples, load_samples, save_samples, AssemblyConfig, RunOptions,
    Sample, Toolkit,
};

#[derive(Parser)]
#[command(name = "radclust")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Within-sample clustering of RAD-seq reads", long_about = None)]
struct Args {
    /// Assembly parameters (JSON)
    #[arg(short, long, value_name = "FILE")]
    params: PathBuf,

    /// Sample state file (default: <working_directory>/<name>_samples.json)
    #[arg(short, long, value_name = "FILE")]
    samples: Option<PathBuf>,

    /// Size of the worker pool (0 = all cores)
    #[arg(short = 't', long, default_value = "0")]
    workers: usize,

    /// Re-run samples that already finished this step
    #[arg(short, long)]
    force: bool,

    /// Never cluster reverse complements
    #[arg(long)]
    noreverse: bool,
}

fn spinner(color: &str, msg: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template(&format!("{{spinner:.{color}}} {{msg}}"))
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(msg.to_string());
    spinner
}

fn run(args: Args) -> radclust::Result<bool> {
    let config = AssemblyConfig::from_json_file(&args.params)?;
    let state_file = args.samples.unwrap_or_else(|| {
        config
            .working_directory
            .join(format!("{}_samples.json", config.name))
    });

    // 1. samples from the state file, or from the edits directory
    let sp = spinner("blue", "Gathering samples...");
    let mut samples: Vec<Sample> = if state_file.exists() {
        load_samples(&state_file)?
    } else {
        discover_samples(&config)?
    };
    sp.finish_with_message(format!("Found {} sample(s).", samples.len()));

    // 2. clustering
    let options = RunOptions {
        workers: if args.workers == 0 {
            RunOptions::default().workers
        } else {
            args.workers
        },
        force: args.force,
        noreverse: args.noreverse,
    };
    let sp = spinner("green", "Clustering within samples...");
    let toolkit = Toolkit::from_config(&config);
    let stats_file = config.stats_file();
    let outcome = cluster_within(config, &mut samples, options, toolkit);
    sp.finish_with_message("Clustering finished.");

    // 3. state, saved even when the run stopped early
    let sp = spinner("yellow", "Saving sample state...");
    save_samples(&state_file, &samples)?;
    sp.finish_with_message(format!("Sample state written to {}.", state_file.display()));

    let report = outcome?;
    log::info!(
        "clustered {} sample(s), skipped {}, failed {}",
        report.completed.len(),
        report.skipped.len(),
        report.failed.len()
    );

    for failure in &report.failed {
        log::error!(
            "{} ({}): {}",
            failure.sample,
            failure.stage,
            failure.error
        );
    }
    for name in &report.no_clusters {
        log::warn!("{}: no clusters", name);
    }
    if !report.completed.is_empty() && report.stats_error.is_none() {
        log::info!("summary statistics in {}", stats_file.display());
    }
    Ok(report.is_success())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            log::error!("{}", e);
            if e.is_sample_local() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}
