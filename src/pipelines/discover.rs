use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fxhash::FxHashMap;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use crate::cli::args::RunType;
use crate::config::defs::{fcid_from_path, PipelineError};
use crate::pipelines::manifest::OrderType;
use crate::pipelines::platform::PlatformSpec;
use crate::pipelines::reference::ReferenceIndex;

/// Order label of genome engineering runs, which this pipeline never handles.
const TARGETED_DEEP: &str = "Targeted Deep";

/// LIMS order details of one flowcell, one row of the order export.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FlowcellOrder {
    #[serde(rename = "FCID")]
    pub fcid: String,
    #[serde(rename = "orderType")]
    pub order_type: String,
    #[serde(rename = "genomeVersion", default)]
    pub genome_version: String,
}

/// Reads the order export. Later rows of the same flowcell replace earlier ones.
pub async fn load_orders(path: &Path) -> Result<FxHashMap<String, FlowcellOrder>, PipelineError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| PipelineError::InvalidConfig(format!("Cannot open order export {:?}: {}", path, e)))?;
    let mut rdr = csv::Reader::from_reader(bytes.as_slice());
    let mut orders = FxHashMap::default();
    for result in rdr.deserialize() {
        let order: FlowcellOrder =
            result.map_err(|e| PipelineError::InvalidConfig(format!("Bad order export row in {:?}: {}", path, e)))?;
        orders.insert(order.fcid.clone(), order);
    }
    Ok(orders)
}

/// Flags a discovered run should be started with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFlags {
    pub run_type: RunType,
    pub only_cp_fastq: bool,
}

impl RunFlags {
    /// 10x orders run as `10X`; a genome missing from the index means fastqs are only copied.
    /// Without an order the defaults apply; without an index no genome counts as missing.
    pub fn suggest(order: Option<&FlowcellOrder>, index: Option<&ReferenceIndex>) -> Self {
        let Some(order) = order else {
            return RunFlags::default();
        };
        let run_type = match OrderType::parse(&order.order_type) {
            OrderType::Standard => RunType::RnaSeq,
            OrderType::TenXCapture | OrderType::TenXFlex => RunType::TenX,
        };
        let only_cp_fastq = index.is_some_and(|index| !index.contains(order.genome_version.trim()));
        RunFlags { run_type, only_cp_fastq }
    }
}

impl fmt::Display for RunFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let run_type = match self.run_type {
            RunType::RnaSeq => "RNA-Seq",
            RunType::TenX => "10X",
        };
        write!(f, "--run_type {}", run_type)?;
        if self.only_cp_fastq {
            write!(f, " --only_cp_fastq")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredRun {
    pub fcid: String,
    pub fc_path: PathBuf,
    pub flags: RunFlags,
}

/// Run folders under `data_folder` (at most two levels down) whose completion
/// marker was modified within `changed_within`.
pub async fn find_completed_runs(
    data_folder: &Path,
    marker: &str,
    changed_within: Duration,
) -> Result<Vec<DiscoveredRun>, PipelineError> {
    let now = SystemTime::now();
    let mut candidates = vec![data_folder.to_path_buf()];
    let mut entries = tokio::fs::read_dir(data_folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            candidates.push(entry.path());
        }
    }

    let mut runs = Vec::new();
    for dir in candidates {
        let marker_path = dir.join(marker);
        let modified = match tokio::fs::metadata(&marker_path).await {
            Ok(meta) if meta.is_file() => meta.modified()?,
            _ => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age > changed_within {
            debug!("Skipping {:?}: marker is {}h old", dir, age.as_secs() / 3600);
            continue;
        }
        if let Some(fcid) = fcid_from_path(&dir) {
            runs.push(DiscoveredRun { fcid, fc_path: dir, flags: RunFlags::default() });
        }
    }
    runs.sort_by(|a, b| a.fc_path.cmp(&b.fc_path));
    Ok(runs)
}

/// Drops runs whose flowcell id already appears anywhere in the processed log.
pub async fn filter_processed(runs: Vec<DiscoveredRun>, processed_log: &Path) -> Result<Vec<DiscoveredRun>, PipelineError> {
    let seen = match tokio::fs::read_to_string(processed_log).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(runs
        .into_iter()
        .filter(|run| {
            let processed = seen.lines().any(|line| line.contains(&run.fcid));
            if processed {
                debug!("{} already processed", run.fcid);
            }
            !processed
        })
        .collect())
}

pub async fn record_discovered(runs: &[DiscoveredRun], processed_log: &Path) -> Result<(), PipelineError> {
    if runs.is_empty() {
        return Ok(());
    }
    let mut log = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(processed_log)
        .await?;
    for run in runs {
        let line = format!(
            "{} - INFO - Discovered {} - fc_path: {}\n",
            chrono::Local::now().format("%m/%d/%Y %H:%M:%S"),
            run.fcid,
            run.fc_path.display()
        );
        log.write_all(line.as_bytes()).await?;
    }
    log.flush().await?;
    Ok(())
}

/// Attaches suggested flags from the order export and drops genome engineering runs.
pub fn apply_orders(
    runs: Vec<DiscoveredRun>,
    orders: Option<&FxHashMap<String, FlowcellOrder>>,
    index: Option<&ReferenceIndex>,
) -> Vec<DiscoveredRun> {
    runs.into_iter()
        .filter_map(|mut run| {
            let order = orders.and_then(|orders| orders.get(&run.fcid));
            if orders.is_some() && order.is_none() {
                warn!("{} has no entry in the order export; using default flags", run.fcid);
            }
            if order.is_some_and(|o| o.order_type.contains(TARGETED_DEEP)) {
                debug!("Skipping {}: genome engineering order", run.fcid);
                return None;
            }
            run.flags = RunFlags::suggest(order, index);
            Some(run)
        })
        .collect()
}

/// Finds new completed runs for one platform and records them as processed.
///
/// # Arguments
///
/// * `data_folder` - Instrument data folder.
/// * `platform` - Supplies the completion marker.
/// * `processed_log` - Log of runs already handed off.
/// * `changed_within_hours` - Only markers this recent count.
/// * `orders` - Optional LIMS order export, keyed by flowcell id.
/// * `index` - Optional reference index; genomes outside it get `--only_cp_fastq`.
///
/// # Returns
/// Newly discovered runs with their suggested flags.
pub async fn discover(
    data_folder: &Path,
    platform: &PlatformSpec,
    processed_log: &Path,
    changed_within_hours: u64,
    orders: Option<&FxHashMap<String, FlowcellOrder>>,
    index: Option<&ReferenceIndex>,
) -> Result<Vec<DiscoveredRun>, PipelineError> {
    let window = Duration::from_secs(changed_within_hours * 3600);
    let runs = find_completed_runs(data_folder, platform.completion_marker, window).await?;
    let runs = apply_orders(runs, orders, index);
    let new_runs = filter_processed(runs, processed_log).await?;
    record_discovered(&new_runs, processed_log).await?;
    if new_runs.is_empty() {
        info!("No new runs in {:?}", data_folder);
    }
    for run in &new_runs {
        info!("Discovered {} - fc_path: {} ({})", run.fcid, run.fc_path.display(), run.flags);
    }
    Ok(new_runs)
}
