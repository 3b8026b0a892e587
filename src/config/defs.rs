use std::path::PathBuf;
use std::sync::Arc;

use lazy_static::lazy_static;
use log::LevelFilter;
use std::collections::HashMap;
use tokio::sync::Semaphore;

use crate::cli::args::{Arguments, MachineType, RunType};

// External software
pub const BCL_CONVERT_TAG: &str = "bcl-convert";
pub const BASES2FASTQ_TAG: &str = "bases2fastq";
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BAMTOOLS_TAG: &str = "bamtools";
pub const FASTQC_TAG: &str = "fastqc";
pub const MULTIQC_TAG: &str = "multiqc";
pub const CELLRANGER_TAG: &str = "cellranger";

// Facility helper scripts, resolved against --bin_dir
pub const DRIVER_CSV_MAKE: &str = "driver_csv_Make.py";
pub const NEXTSEQ2K_DRIVER_CSV_MAKE: &str = "NextSeq2K_driver_csv_Make.py";
pub const AVITI_LIMS_INFO_MAKE: &str = "Aviti_lims_json_Make_V2.py";
pub const AVITI_SAMPLESHEET_MAKE: &str = "Aviti_samplesheet_Make.py";
pub const AVITI_NAME_CHANGE: &str = "Aviti_name_change.py";
pub const NEXTSEQ2K_NAME_CHANGE: &str = "NextSeq2K_name_change.py";
pub const FLEX_CONFIGCSV_MAKE: &str = "Aviti_FLEXscRNAseq_configcsv_Make.py";
pub const SAMPLE_REPORT_MAKE: &str = "Prime_SampleReport_Make.py";
pub const NO_REF_SAMPLE_REPORT_MAKE: &str = "no_Ref_SampleReport_Make.py";

lazy_static! {
    /// Flag each tool answers with its version string.
    pub static ref TOOL_VERSION_FLAGS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(BCL_CONVERT_TAG, "--version");
        m.insert(BASES2FASTQ_TAG, "--version");
        m.insert(BOWTIE2_TAG, "--version");
        m.insert(SAMTOOLS_TAG, "--version");
        m.insert(BAMTOOLS_TAG, "--version");
        m.insert(FASTQC_TAG, "--version");
        m.insert(MULTIQC_TAG, "--version");
        m.insert(CELLRANGER_TAG, "--version");
        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Flagstat,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CellrangerSubcommand {
    Count,
    Multi,
}

// Static Filenames
pub const DRIVER_CSV: &str = "PRIME_driver.csv";
pub const AVITI_SAMPLESHEET: &str = "samplesheet.csv";
pub const LIMS_INFO_CSV: &str = "lims_info.csv";
pub const SAMPLE_REPORT_CSV: &str = "Prime_Sample_Report.csv";
pub const MULTIQC_HTML: &str = "multiqc.html";
pub const LOG_EXT: &str = "log";
pub const BAM_EXT: &str = "bam";
pub const SAM_EXT: &str = "sam";
pub const BAMSTATS_SUFFIX: &str = "bamstats.txt";
pub const FLAGSTAT_SUFFIX: &str = "flagstat.tsv";
pub const FASTQC_SUFFIX: &str = "fastqc.html";
pub const FLEX_CONFIG_SUFFIX: &str = "config.csv";
pub const R1_FASTQ_SUFFIX: &str = "R1.fastq.gz";
pub const R2_FASTQ_SUFFIX: &str = "R2.fastq.gz";

// Output layout under the run's output root
pub const QC_DIR: &str = "qc";
pub const SAMPLES_DIR: &str = "samples";
pub const REPORT_DIR: &str = "report";
pub const BCL_CONVERT_OUT_DIR: &str = "fastq";
pub const BASES2FASTQ_OUT_DIR: &str = "bases2fastq";

// Placeholders written for rows without a usable reference
pub const NO_REFERENCE_STATUS: &str = "No reference genome available";
pub const NOT_CALCULATED: &str = "NA-NotCalculated";

// Static Parameters
pub const AGGREGATE_MAX_RETRIES: u32 = 5;
pub const DEFAULT_LINK_BASE: &str = "https://webfs";
pub const DEFAULT_CHANGED_WITHIN_HOURS: u64 = 128;


/// Errors surfaced by any part of a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Malformed manifest {path:?}: {reason}")]
    MalformedManifest { path: PathBuf, reason: String },

    #[error("{step} finished but did not produce {path:?}")]
    StepOutputMissing { step: String, path: PathBuf },

    #[error("{tool} exited with status {code:?}: {stderr}")]
    ExternalToolFailure {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Failed to spawn {tool}: {error}")]
    ToolSpawn { tool: String, error: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Task failed to join: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


/// Immutable per-run context, built once from the command line and shared by
/// every step through an `Arc`.
#[derive(Debug)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub fcid: String,
    pub fcpath: PathBuf,
    pub out_dir: PathBuf,
    pub machine_type: MachineType,
    pub run_type: RunType,
    pub fastq_dir: Option<PathBuf>,
    pub only_cp_fastq: bool,
    pub genome: Option<String>,
    pub annotation: Option<String>,
    pub molng: Option<String>,
    pub manifest: Option<PathBuf>,
    /// LIMS export; read by the 10x Flex config builder.
    pub lims_info: Option<PathBuf>,
    pub index_samplesheet: PathBuf,
    pub index_root: PathBuf,
    pub bin_dir: PathBuf,
    pub link_base: String,
    pub threads: usize,
    pub max_concurrency: usize,
    pub maximal_semaphore: Arc<Semaphore>,
    pub log_level: LevelFilter,
}

impl RunConfig {
    /// LIMS export given with `--lims_info`, else the one the Aviti prelude writes.
    pub fn lims_info_path(&self) -> PathBuf {
        self.lims_info.clone().unwrap_or_else(|| self.out_dir.join(LIMS_INFO_CSV))
    }


    /// Builds the run context from parsed arguments.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command line.
    /// * `cwd` - Directory relative paths are resolved against.
    /// * `max_concurrency` - Upper bound on concurrently running rows.
    ///
    /// # Returns
    /// RunConfig or InvalidConfig when a required option is missing.
    pub fn from_args(
        args: &Arguments,
        cwd: PathBuf,
        max_concurrency: usize,
    ) -> Result<Self, PipelineError> {
        let absolute = |p: &str| {
            let path = PathBuf::from(p);
            if path.is_absolute() { path } else { cwd.join(path) }
        };

        let fcpath = match &args.fcpath {
            Some(p) => absolute(p),
            None => cwd.clone(),
        };
        let fcid = match &args.fcid {
            Some(id) => id.clone(),
            None => fcid_from_path(&fcpath).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "--fcid not given and no flowcell id in {:?}",
                    fcpath
                ))
            })?,
        };
        let out_dir = match &args.out_dir {
            Some(p) => absolute(p),
            None => fcpath.join(format!("PRIME_{}", fcid)),
        };
        let index_samplesheet = args
            .index_samplesheet
            .as_deref()
            .map(absolute)
            .ok_or_else(|| PipelineError::InvalidConfig("--index_samplesheet is required".to_string()))?;

        let max_concurrency = max_concurrency.max(1);
        Ok(RunConfig {
            fcid,
            fcpath,
            out_dir,
            machine_type: args.machine_type.clone(),
            run_type: args.run_type.clone(),
            fastq_dir: args.fastq_dir.as_deref().map(absolute),
            only_cp_fastq: args.only_cp_fastq,
            genome: args.genome.clone(),
            annotation: args.annotation.clone(),
            molng: args.molng.clone(),
            manifest: args.manifest.as_deref().map(absolute),
            lims_info: args.lims_info.as_deref().map(absolute),
            index_samplesheet,
            index_root: absolute(&args.index_root),
            bin_dir: absolute(&args.bin_dir),
            link_base: args.link_base.trim_end_matches('/').to_string(),
            threads: args.threads,
            max_concurrency,
            maximal_semaphore: Arc::new(Semaphore::new(max_concurrency)),
            log_level: if args.verbose { LevelFilter::Debug } else { LevelFilter::Info },
            cwd,
        })
    }
}

/// Flowcell ids are the last `_`-separated token of the run folder name,
/// e.g. `230919_VH00629_133_AAC7NV3HV` -> `AAC7NV3HV`.
pub fn fcid_from_path(path: &std::path::Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    let id = name.rsplit('_').next()?;
    if id.is_empty() { None } else { Some(id.to_string()) }
}
