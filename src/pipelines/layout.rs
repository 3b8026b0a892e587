use std::path::{Path, PathBuf};

use crate::config::defs::{
    BAMSTATS_SUFFIX, BAM_EXT, DRIVER_CSV, FLAGSTAT_SUFFIX, FLEX_CONFIG_SUFFIX, LOG_EXT,
    MULTIQC_HTML, QC_DIR, REPORT_DIR, SAMPLES_DIR, SAMPLE_REPORT_CSV, SAM_EXT,
};
use crate::pipelines::manifest::ManifestRow;
use crate::utils::file::file_path_manipulator;

/// Fixed artifact locations under the run's output root.
#[derive(Debug, Clone, PartialEq)]
pub struct RunLayout {
    pub out_dir: PathBuf,
    /// Shared by every row; each row writes distinct names.
    pub qc_dir: PathBuf,
    pub fastqc_dir: PathBuf,
    pub samples_dir: PathBuf,
    pub report_dir: PathBuf,
    pub driver_csv: PathBuf,
    pub multiqc_html: PathBuf,
    pub sample_report: PathBuf,
}

impl RunLayout {
    pub fn new(out_dir: &Path) -> Self {
        let qc_dir = out_dir.join(QC_DIR);
        let report_dir = out_dir.join(REPORT_DIR);
        RunLayout {
            out_dir: out_dir.to_path_buf(),
            fastqc_dir: qc_dir.join("fastqc"),
            qc_dir,
            samples_dir: out_dir.join(SAMPLES_DIR),
            driver_csv: report_dir.join(DRIVER_CSV),
            multiqc_html: report_dir.join(MULTIQC_HTML),
            sample_report: report_dir.join(SAMPLE_REPORT_CSV),
            report_dir,
        }
    }

    pub async fn create(&self) -> Result<(), std::io::Error> {
        for dir in [&self.out_dir, &self.qc_dir, &self.fastqc_dir, &self.samples_dir, &self.report_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }

    pub fn row(&self, row: &ManifestRow) -> RowLayout {
        RowLayout::new(self, row)
    }
}

/// Per-row artifact locations, named after the row's canonical file name.
#[derive(Debug, Clone, PartialEq)]
pub struct RowLayout {
    pub sample_dir: PathBuf,
    pub sam: PathBuf,
    pub bam: PathBuf,
    pub log: PathBuf,
    pub bamstats: PathBuf,
    pub flagstat: PathBuf,
    pub flex_config: PathBuf,
    pub cellranger_outs: PathBuf,
}

impl RowLayout {
    fn new(run: &RunLayout, row: &ManifestRow) -> Self {
        let name = PathBuf::from(&row.file_name);
        let sample_dir = run.samples_dir.join(&row.file_name);
        RowLayout {
            sam: sample_dir.join(format!("{}.{}", row.file_name, SAM_EXT)),
            bam: sample_dir.join(format!("{}.{}", row.file_name, BAM_EXT)),
            log: run.qc_dir.join(format!("{}.{}", row.file_name, LOG_EXT)),
            bamstats: file_path_manipulator(&name, Some(&run.qc_dir), None, Some(BAMSTATS_SUFFIX), "_"),
            flagstat: file_path_manipulator(&name, Some(&run.qc_dir), None, Some(FLAGSTAT_SUFFIX), "_"),
            flex_config: sample_dir.join(format!("{}.{}", row.library_id, FLEX_CONFIG_SUFFIX)),
            cellranger_outs: sample_dir.join(&row.file_name).join("outs"),
            sample_dir,
        }
    }
}
