use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::config::defs::{PipelineError, NOT_CALCULATED, NO_REFERENCE_STATUS};
use crate::pipelines::executor::{AggregateHandle, BranchResult, StepOutput};
use crate::pipelines::graph::StepKind;
use crate::pipelines::layout::RunLayout;
use crate::pipelines::manifest::{distinct_result_paths, ManifestRow};
use crate::utils::file::{copy_into, write_atomic};

/// Columns appended to the manifest's own columns in the enriched driver CSV.
pub const DERIVED_COLUMNS: [&str; 7] = [
    "referenceStatus",
    "genomeVersionUsed",
    "annotationUsed",
    "bam",
    "bamstats",
    "flagstat",
    "fastqc",
];

pub const REFERENCE_AVAILABLE: &str = "Reference genome available";

fn first_path(output: &StepOutput) -> Option<String> {
    match output {
        StepOutput::Paths(paths) => paths.first().map(|p| p.to_string_lossy().to_string()),
        other => other.display(),
    }
}

fn derived_values(branch: &BranchResult) -> Vec<String> {
    let not_calculated = || NOT_CALCULATED.to_string();
    let (status, genome, annotation) = match branch.classification.reference() {
        Some(r) => (REFERENCE_AVAILABLE.to_string(), r.genome.clone(), r.annotation.clone()),
        None => (NO_REFERENCE_STATUS.to_string(), not_calculated(), not_calculated()),
    };
    let bam = first_path(branch.output(StepKind::Align))
        .or_else(|| branch.output(StepKind::CellRangerCount).display())
        .or_else(|| branch.output(StepKind::CellRangerMulti).display());

    vec![
        status,
        genome,
        annotation,
        bam.unwrap_or_else(not_calculated),
        first_path(branch.output(StepKind::BamStats)).unwrap_or_else(not_calculated),
        first_path(branch.output(StepKind::Flagstat)).unwrap_or_else(not_calculated),
        branch.output(StepKind::FastQc).display().unwrap_or_else(not_calculated),
    ]
}

/// Renders the enriched driver CSV: the manifest's columns verbatim, then
/// the derived columns, one record per row in manifest order.
pub fn driver_csv_bytes(headers: &[String], aggregate: &AggregateHandle) -> Result<Vec<u8>, PipelineError> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    let mut header_row: Vec<&str> = headers.iter().map(String::as_str).collect();
    header_row.extend(DERIVED_COLUMNS);
    wtr.write_record(&header_row).map_err(|e| PipelineError::IOError(e.to_string()))?;

    for branch in &aggregate.branches {
        let mut record = branch.row.record.clone();
        record.resize(headers.len(), String::new());
        record.extend(derived_values(branch));
        wtr.write_record(&record).map_err(|e| PipelineError::IOError(e.to_string()))?;
    }
    wtr.into_inner().map_err(|e| PipelineError::IOError(e.to_string()))
}

/// Writes the enriched driver CSV with an atomic rename, off the async workers.
pub async fn write_driver_csv(path: &Path, headers: &[String], aggregate: &AggregateHandle) -> Result<(), PipelineError> {
    let bytes = driver_csv_bytes(headers, aggregate)?;
    let target = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
        .await
        .map_err(|e| PipelineError::TaskJoin(e.to_string()))??;
    info!("Wrote {:?} ({} libraries)", path, aggregate.branches.len());
    Ok(())
}


/// Copies the MultiQC report and sample report into every distinct result path.
///
/// # Arguments
///
/// * `aggregate` - Joined branches; their rows supply the result paths.
/// * `layout` - Where the reports were written.
///
/// # Returns
/// Paths of the published copies.
pub async fn publish(aggregate: &AggregateHandle, layout: &RunLayout) -> Result<Vec<PathBuf>, PipelineError> {
    let targets = distinct_result_paths(aggregate.branches.iter().map(|b| b.row.as_ref()));
    if targets.len() > 1 {
        warn!("Libraries span {} result paths; publishing reports to each: {:?}", targets.len(), targets);
    }

    let mut published = Vec::new();
    for target in &targets {
        let dest = Path::new(target);
        for report in [&layout.multiqc_html, &layout.sample_report] {
            published.push(copy_into(report, dest).await?);
        }
        info!("Published reports to {}", target);
    }
    Ok(published)
}

/// `<link_base>/<result path>/multiqc.html`
pub fn format_link(link_base: &str, representative: &ManifestRow) -> String {
    format!(
        "{}/{}/{}",
        link_base.trim_end_matches('/'),
        representative.result_path.trim_matches('/'),
        crate::config::defs::MULTIQC_HTML
    )
}
