mod pipelines;
mod utils;
mod config;
mod cli;

use std::env;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use env_logger::Builder;
use log::{self, debug, error, info, LevelFilter};

use crate::cli::parse;
use crate::cli::args::{Arguments, Module};
use crate::config::defs::{PipelineError, RunConfig};
use crate::pipelines::discover::{discover, load_orders};
use crate::pipelines::executor::Pipeline;
use crate::pipelines::platform::select_platform;
use crate::pipelines::reference::ReferenceIndex;
use crate::utils::command::check_versions;
use crate::utils::streams::ProcessRunner;
use crate::utils::system::{compute_max_concurrency, detect_cores_and_load};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let result = match args.module {
        Module::Run => prime_run(args, dir).await,
        Module::Discover => discover_run(&args, &dir).await,
    };

    if let Err(e) = result {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    info!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn prime_run(args: Arguments, dir: PathBuf) -> Result<(), PipelineError> {
    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    let max_concurrency = compute_max_concurrency(max_cores, cpu_load);
    debug!(
        "Detected {} usable cores; CPU load {}%; running up to {} libraries at once",
        max_cores, cpu_load, max_concurrency
    );

    let run_config = Arc::new(RunConfig::from_args(&args, dir, max_concurrency)?);
    info!(
        "Flowcell {} ({:?}, {:?}) -> {:?}",
        run_config.fcid, run_config.machine_type, run_config.run_type, run_config.out_dir
    );

    let platform = select_platform(&run_config.machine_type);
    check_versions(&platform.required_tools(run_config.fastq_dir.is_none())).await?;

    let pipeline = Pipeline::new(Arc::clone(&run_config), Arc::new(ProcessRunner))?;
    let outcome = pipeline.run().await?;

    match &outcome.link {
        Some(link) => println!("{}", link),
        None => info!("No libraries processed for {}", run_config.fcid),
    }
    debug!("States: {:?}", outcome.transitions);
    Ok(())
}

async fn discover_run(args: &Arguments, dir: &PathBuf) -> Result<(), PipelineError> {
    let data_folder = args
        .data_folder
        .as_ref()
        .map(|p| dir.join(p))
        .ok_or_else(|| PipelineError::InvalidConfig("--data_folder is required for discover".to_string()))?;
    let processed_log = args
        .processed_log
        .as_ref()
        .map(|p| dir.join(p))
        .ok_or_else(|| anyhow!("--processed_log is required for discover"))?;

    let orders = match &args.orders {
        Some(path) => Some(load_orders(&dir.join(path)).await?),
        None => None,
    };
    let index = match &args.index_samplesheet {
        Some(path) => Some(ReferenceIndex::load(&dir.join(path)).await?),
        None => None,
    };

    let platform = select_platform(&args.machine_type);
    let runs = discover(
        &data_folder,
        &platform,
        &processed_log,
        args.changed_within_hours,
        orders.as_ref(),
        index.as_ref(),
    )
    .await?;
    for run in runs {
        println!("{}\t{}\t{}", run.fcid, run.fc_path.display(), run.flags);
    }
    Ok(())
}
