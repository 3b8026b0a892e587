use clap::{Parser, ValueEnum};

use crate::config::defs::{DEFAULT_CHANGED_WITHIN_HOURS, DEFAULT_LINK_BASE};

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum Module {
    #[default]
    Run,
    Discover,
}

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum MachineType {
    /// Standard Illumina flow cell (G4, NovaSeq)
    #[default]
    #[value(alias = "G4")]
    Standard,
    #[value(alias = "Aviti")]
    Aviti,
    #[value(name = "nextseq2k", alias = "NextSeq2K")]
    NextSeq2K,
}

#[derive(Debug, Clone, ValueEnum, Default, PartialEq)]
pub enum RunType {
    #[default]
    #[value(name = "RNA-Seq", alias = "rna-seq")]
    RnaSeq,
    #[value(name = "10X", alias = "10x")]
    TenX,
}

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "prime-pipelines", version, about = "Primary analysis for sequencing runs")]
pub struct Arguments {

    #[arg(long, default_value = "run", value_enum)]
    pub module: Module,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, help = "Flowcell id. Defaults to the last '_' token of --fcpath")]
    pub fcid: Option<String>,

    #[arg(long, help = "Instrument run folder. Defaults to the current directory")]
    pub fcpath: Option<String>,

    #[arg(short = 'o', long = "out", help = "Output root for the run. Defaults to <fcpath>/PRIME_<fcid>")]
    pub out_dir: Option<String>,

    #[arg(long = "machine_type", default_value = "standard", value_enum)]
    pub machine_type: MachineType,

    #[arg(long = "run_type", default_value = "RNA-Seq", value_enum)]
    pub run_type: RunType,

    #[arg(long = "fastq_dir", help = "Use these fastqs instead of demultiplexing")]
    pub fastq_dir: Option<String>,

    #[arg(long = "only_cp_fastq", action, help = "Skip fastq renaming and analysis; copy fastqs verbatim")]
    pub only_cp_fastq: bool,

    #[arg(long, help = "Force this reference genome for every library")]
    pub genome: Option<String>,

    #[arg(long, help = "Force this annotation for every library")]
    pub annotation: Option<String>,

    #[arg(long, help = "Only process libraries of this order")]
    pub molng: Option<String>,

    #[arg(long, help = "Pre-built driver manifest; skips the manifest builder")]
    pub manifest: Option<String>,

    #[arg(long = "lims_info", help = "LIMS export (lims_info.csv); skips the LIMS fetch on Aviti")]
    pub lims_info: Option<String>,

    #[arg(long = "index_samplesheet", help = "Reference index collection CSV (id,name,annotation_version)")]
    pub index_samplesheet: Option<String>,

    #[arg(long = "index_root", default_value = "/n/analysis/indexes")]
    pub index_root: String,

    #[arg(long = "bin_dir", default_value = "bin", help = "Directory holding the facility helper scripts")]
    pub bin_dir: String,

    #[arg(long = "link_base", default_value = DEFAULT_LINK_BASE)]
    pub link_base: String,

    #[arg(long, default_value_t = 64)]
    pub threads: usize,

    #[arg(long = "data_folder", help = "Instrument data folder scanned by --module discover")]
    pub data_folder: Option<String>,

    #[arg(long = "processed_log", help = "Log of flowcells already handed to the pipeline")]
    pub processed_log: Option<String>,

    #[arg(long = "changed_within_hours", default_value_t = DEFAULT_CHANGED_WITHIN_HOURS)]
    pub changed_within_hours: u64,

    #[arg(long, help = "LIMS order export (FCID,orderType,genomeVersion) used to suggest run flags in discover")]
    pub orders: Option<String>,
}
