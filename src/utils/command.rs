/// Functions and structs for working with creating command-line arguments

use std::any::Any;

use anyhow::anyhow;
use log::{debug, info};
use tokio::process::Command;

use crate::config::defs::{
    PipelineError, RunConfig, BAMTOOLS_TAG, BASES2FASTQ_TAG, BCL_CONVERT_TAG, BOWTIE2_TAG,
    CELLRANGER_TAG, FASTQC_TAG, MULTIQC_TAG, SAMTOOLS_TAG, TOOL_VERSION_FLAGS,
};
use crate::utils::streams::{read_child_output_to_vec, ChildStream};

/// Threads handed to one per-row tool so concurrent rows share `--threads`.
pub fn row_threads(config: &RunConfig) -> usize {
    (config.threads / config.max_concurrency.max(1)).max(1)
}

fn path_arg(path: &std::path::Path) -> String {
    path.to_string_lossy().to_string()
}


pub mod bcl_convert {
    use std::path::PathBuf;
    use crate::config::defs::RunConfig;
    use super::path_arg;

    #[derive(Debug)]
    pub struct BclConvertConfig {
        pub input_dir: PathBuf,
        pub output_dir: PathBuf,
        /// Emit index reads for Cell Ranger.
        pub tenx: bool,
    }

    pub fn arg_generator(_config: &RunConfig, tool_config: &BclConvertConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--bcl-input-directory".to_string());
        args_vec.push(path_arg(&tool_config.input_dir));
        args_vec.push("--output-directory".to_string());
        args_vec.push(path_arg(&tool_config.output_dir));
        args_vec.push("--force".to_string());
        if tool_config.tenx {
            args_vec.push("--create-fastq-for-index-reads".to_string());
            args_vec.push("true".to_string());
        }
        args_vec
    }
}

pub mod bases2fastq {
    use std::path::PathBuf;
    use crate::config::defs::RunConfig;
    use super::path_arg;

    #[derive(Debug)]
    pub struct Bases2FastqConfig {
        pub input_dir: PathBuf,
        pub output_dir: PathBuf,
        pub tenx: bool,
    }

    pub fn arg_generator(config: &RunConfig, tool_config: &Bases2FastqConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(path_arg(&tool_config.input_dir));
        args_vec.push(path_arg(&tool_config.output_dir));
        args_vec.push("-p".to_string());
        args_vec.push(config.threads.to_string());
        if tool_config.tenx {
            args_vec.push("--legacy-fastq".to_string());
        }
        args_vec
    }
}

pub mod bowtie2 {
    use std::path::PathBuf;
    use crate::config::defs::RunConfig;
    use super::{path_arg, row_threads};

    #[derive(Debug)]
    pub struct Bowtie2Config {
        /// Index prefix, not a file.
        pub index: PathBuf,
        pub r1: Vec<PathBuf>,
        pub r2: Vec<PathBuf>,
        pub sam: PathBuf,
    }

    pub fn arg_generator(config: &RunConfig, tool_config: &Bowtie2Config) -> Vec<String> {
        let join = |paths: &[PathBuf]| paths.iter().map(|p| path_arg(p)).collect::<Vec<_>>().join(",");

        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-p".to_string());
        args_vec.push(row_threads(config).to_string());
        args_vec.push("-x".to_string());
        args_vec.push(path_arg(&tool_config.index));
        if tool_config.r2.is_empty() {
            args_vec.push("-U".to_string());
            args_vec.push(join(&tool_config.r1));
        } else {
            args_vec.push("-1".to_string());
            args_vec.push(join(&tool_config.r1));
            args_vec.push("-2".to_string());
            args_vec.push(join(&tool_config.r2));
        }
        args_vec.push("-S".to_string());
        args_vec.push(path_arg(&tool_config.sam));
        args_vec
    }
}

pub mod samtools {
    use std::path::PathBuf;
    use crate::config::defs::{RunConfig, SamtoolsSubcommand};
    use super::{path_arg, row_threads};

    #[derive(Debug)]
    pub struct SamtoolsConfig {
        pub subcommand: SamtoolsSubcommand,
        pub input: PathBuf,
        /// Sort target. Flagstat writes to stdout.
        pub output: Option<PathBuf>,
    }

    pub fn arg_generator(config: &RunConfig, tool_config: &SamtoolsConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match tool_config.subcommand {
            SamtoolsSubcommand::Sort => {
                args_vec.push("sort".to_string());
                args_vec.push("-@".to_string());
                args_vec.push(row_threads(config).to_string());
                if let Some(output) = &tool_config.output {
                    args_vec.push("-o".to_string());
                    args_vec.push(path_arg(output));
                }
            }
            SamtoolsSubcommand::Flagstat => {
                args_vec.push("flagstat".to_string());
                args_vec.push("-O".to_string());
                args_vec.push("tsv".to_string());
            }
        }
        args_vec.push(path_arg(&tool_config.input));
        args_vec
    }
}

pub mod bamtools {
    use std::path::PathBuf;
    use super::path_arg;

    #[derive(Debug)]
    pub struct BamtoolsConfig {
        pub bam: PathBuf,
    }

    pub fn arg_generator(tool_config: &BamtoolsConfig) -> Vec<String> {
        vec!["stats".to_string(), "-in".to_string(), path_arg(&tool_config.bam)]
    }
}

pub mod fastqc {
    use std::path::PathBuf;
    use crate::config::defs::RunConfig;
    use super::{path_arg, row_threads};

    #[derive(Debug)]
    pub struct FastqcConfig {
        pub out_dir: PathBuf,
        pub fastqs: Vec<PathBuf>,
    }

    pub fn arg_generator(config: &RunConfig, tool_config: &FastqcConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(&tool_config.out_dir));
        args_vec.push("-t".to_string());
        args_vec.push(row_threads(config).to_string());
        args_vec.push("--quiet".to_string());
        args_vec.extend(tool_config.fastqs.iter().map(|p| path_arg(p)));
        args_vec
    }
}

pub mod multiqc {
    use std::path::PathBuf;
    use crate::config::defs::{RunConfig, MULTIQC_HTML};
    use super::path_arg;

    #[derive(Debug)]
    pub struct MultiqcConfig {
        pub search_dir: PathBuf,
        pub out_dir: PathBuf,
    }

    pub fn arg_generator(config: &RunConfig, tool_config: &MultiqcConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push(path_arg(&tool_config.search_dir));
        args_vec.push("-o".to_string());
        args_vec.push(path_arg(&tool_config.out_dir));
        args_vec.push("-n".to_string());
        args_vec.push(MULTIQC_HTML.to_string());
        args_vec.push("-f".to_string());
        args_vec.push("--title".to_string());
        args_vec.push(config.fcid.clone());
        args_vec
    }
}

pub mod cellranger {
    use std::path::PathBuf;
    use crate::config::defs::{CellrangerSubcommand, RunConfig};
    use super::{path_arg, row_threads};

    #[derive(Debug)]
    pub struct CellrangerConfig {
        pub subcommand: CellrangerSubcommand,
        pub id: String,
        pub transcriptome: Option<PathBuf>,
        pub fastqs: Option<PathBuf>,
        pub sample: Option<String>,
        /// Multi config CSV.
        pub csv: Option<PathBuf>,
    }

    pub fn arg_generator(config: &RunConfig, tool_config: &CellrangerConfig) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match tool_config.subcommand {
            CellrangerSubcommand::Count => {
                args_vec.push("count".to_string());
                args_vec.push(format!("--id={}", tool_config.id));
                if let Some(transcriptome) = &tool_config.transcriptome {
                    args_vec.push(format!("--transcriptome={}", path_arg(transcriptome)));
                }
                if let Some(fastqs) = &tool_config.fastqs {
                    args_vec.push(format!("--fastqs={}", path_arg(fastqs)));
                }
                if let Some(sample) = &tool_config.sample {
                    args_vec.push(format!("--sample={}", sample));
                }
                args_vec.push("--create-bam=true".to_string());
            }
            CellrangerSubcommand::Multi => {
                args_vec.push("multi".to_string());
                args_vec.push(format!("--id={}", tool_config.id));
                if let Some(csv) = &tool_config.csv {
                    args_vec.push(format!("--csv={}", path_arg(csv)));
                }
            }
        }
        args_vec.push(format!("--localcores={}", row_threads(config)));
        args_vec
    }
}

/// Facility helper scripts. Their interfaces are fixed by the scripts themselves.
pub mod scripts {
    use std::path::Path;
    use crate::config::defs::RunConfig;
    use super::path_arg;

    /// Driver CSV builders (standard flow cells, NextSeq 2000).
    pub fn driver_csv_builder_args(config: &RunConfig, fastq_source: &Path) -> Vec<String> {
        let mut args_vec = vec![
            "--fcid".to_string(),
            config.fcid.clone(),
            "--fcpath".to_string(),
            path_arg(&config.fcpath),
            "--fastq_dir".to_string(),
            path_arg(fastq_source),
            "--RoboIndex_samplesheet".to_string(),
            path_arg(&config.index_samplesheet),
            "--output_dir".to_string(),
            path_arg(&config.out_dir),
        ];
        if let Some(molng) = &config.molng {
            args_vec.push("--molng".to_string());
            args_vec.push(molng.clone());
        }
        args_vec
    }

    /// LIMS export for Aviti runs. The script writes `lims_info.csv` into its cwd.
    pub fn lims_export_args(config: &RunConfig) -> Vec<String> {
        let mut args_vec = vec![
            "--fcid".to_string(),
            config.fcid.clone(),
            "--samplesheet_Robo".to_string(),
            path_arg(&config.index_samplesheet),
            "--output_dir".to_string(),
            path_arg(&config.out_dir),
        ];
        if let Some(molng) = &config.molng {
            args_vec.push("--molng".to_string());
            args_vec.push(molng.clone());
        }
        args_vec
    }

    /// Aviti sample sheet from the LIMS export. Writes `samplesheet.csv` into its cwd.
    pub fn aviti_samplesheet_args(lims_info: &Path, index_samplesheet: &Path) -> Vec<String> {
        vec![
            "--lims_info_table".to_string(),
            path_arg(lims_info),
            "--RoboIndex_samplesheet".to_string(),
            path_arg(index_samplesheet),
        ]
    }

    /// Directory-wide rename (NextSeq 2000), pointed at the driver CSV when it already exists.
    pub fn fastq_dir_rename_args(fastq_source: &Path, manifest: Option<&Path>) -> Vec<String> {
        let mut args_vec = vec!["--fastq_dir".to_string(), path_arg(fastq_source)];
        if let Some(manifest) = manifest {
            args_vec.push("--driver_csv".to_string());
            args_vec.push(path_arg(manifest));
        }
        args_vec
    }

    /// Single-fastq rename (Aviti). `fastq_name` is a bare file name; the script
    /// splits it on `_` and renames inside its cwd.
    pub fn fastq_rename_args(fastq_name: &str) -> Vec<String> {
        vec!["-f".to_string(), fastq_name.to_string()]
    }

    /// 10x Flex config builder. Reads `analysisGoals` from the LIMS export and
    /// writes `<libID>.config.csv` into its cwd.
    pub fn flex_config_args(library_id: &str, fastq_dir: &Path, lims_info: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            "--libID".to_string(),
            library_id.to_string(),
            "--fastqDir".to_string(),
            path_arg(fastq_dir),
            "--lims_info_csv".to_string(),
            path_arg(lims_info),
            "--output_dir".to_string(),
            path_arg(out_dir),
        ]
    }

    pub fn sample_report_args(driver_csv: &Path, out_dir: &Path) -> Vec<String> {
        vec![
            "--driver_csv".to_string(),
            path_arg(driver_csv),
            "--output_dir".to_string(),
            path_arg(out_dir),
        ]
    }
}


/// Builds the argument vector for an external tool.
///
/// # Arguments
///
/// * `tool` - Tool tag from config::defs.
/// * `config` - Run context.
/// * `tool_config` - The tool's own config struct, e.g. `bowtie2::Bowtie2Config`.
///
/// # Returns
/// Argument vector, without the program name.
pub fn generate_cli(
    tool: &str,
    config: &RunConfig,
    tool_config: Option<&dyn Any>,
) -> Result<Vec<String>, PipelineError> {
    let cmd = match tool {
        BCL_CONVERT_TAG => bcl_convert::arg_generator(config, downcast(tool, tool_config)?),
        BASES2FASTQ_TAG => bases2fastq::arg_generator(config, downcast(tool, tool_config)?),
        BOWTIE2_TAG => bowtie2::arg_generator(config, downcast(tool, tool_config)?),
        SAMTOOLS_TAG => samtools::arg_generator(config, downcast(tool, tool_config)?),
        BAMTOOLS_TAG => bamtools::arg_generator(downcast(tool, tool_config)?),
        FASTQC_TAG => fastqc::arg_generator(config, downcast(tool, tool_config)?),
        MULTIQC_TAG => multiqc::arg_generator(config, downcast(tool, tool_config)?),
        CELLRANGER_TAG => cellranger::arg_generator(config, downcast(tool, tool_config)?),
        _ => return Err(PipelineError::InvalidConfig(format!("Unknown tool: {}", tool))),
    };
    debug!("{} args: {:?}", tool, cmd);
    Ok(cmd)
}

fn downcast<'a, T: 'static>(tool: &str, tool_config: Option<&'a dyn Any>) -> Result<&'a T, PipelineError> {
    tool_config
        .and_then(|c| c.downcast_ref::<T>())
        .ok_or_else(|| PipelineError::InvalidConfig(format!("{} requires its tool config", tool)))
}


/// Asks a tool for its version.
///
/// # Arguments
///
/// * `tool` - Tool tag; must be present in TOOL_VERSION_FLAGS.
///
/// # Returns
/// First line of the tool's version output.
pub async fn check_version(tool: &str) -> Result<String, PipelineError> {
    let flag = TOOL_VERSION_FLAGS
        .get(tool)
        .ok_or_else(|| PipelineError::InvalidConfig(format!("Unknown tool: {}", tool)))?;

    let mut child = Command::new(tool)
        .arg(flag)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PipelineError::ToolSpawn {
            tool: tool.to_string(),
            error: format!("{}. Is {} installed?", e, tool),
        })?;

    let mut lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    // bcl-convert prints its banner on stderr
    if lines.iter().all(|l| l.trim().is_empty()) {
        lines = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
    }
    child.wait().await?;

    let version = lines
        .into_iter()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| anyhow!("No output from {} {}", tool, flag))?;
    Ok(version.trim().to_string())
}

/// Checks every tool up front so a missing tool fails before any work starts.
pub async fn check_versions(tools: &[&str]) -> Result<Vec<(String, String)>, PipelineError> {
    let mut versions = Vec::with_capacity(tools.len());
    for tool in tools {
        let version = check_version(tool).await?;
        info!("{}: {}", tool, version);
        versions.push((tool.to_string(), version));
    }
    Ok(versions)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::Arguments;
    use crate::config::defs::{CellrangerSubcommand, SamtoolsSubcommand};
    use clap::Parser;
    use std::path::{Path, PathBuf};

    fn config() -> RunConfig {
        let args = Arguments::parse_from([
            "prime-pipelines", "--fcid", "FC1", "--index_samplesheet", "idx.csv", "--threads", "16",
        ]);
        RunConfig::from_args(&args, PathBuf::from("/work"), 4).unwrap()
    }

    #[test]
    fn test_row_threads() {
        assert_eq!(row_threads(&config()), 4);
    }

    #[test]
    fn test_bowtie2_single_and_paired() {
        let cfg = config();
        let single = bowtie2::Bowtie2Config {
            index: PathBuf::from("/idx/mm10/bowtie2/mm10"),
            r1: vec![PathBuf::from("a_R1.fastq.gz"), PathBuf::from("b_R1.fastq.gz")],
            r2: vec![],
            sam: PathBuf::from("s.sam"),
        };
        let args = generate_cli(BOWTIE2_TAG, &cfg, Some(&single)).unwrap();
        assert_eq!(
            args,
            vec!["-p", "4", "-x", "/idx/mm10/bowtie2/mm10", "-U", "a_R1.fastq.gz,b_R1.fastq.gz", "-S", "s.sam"]
        );

        let paired = bowtie2::Bowtie2Config {
            r2: vec![PathBuf::from("a_R2.fastq.gz")],
            r1: vec![PathBuf::from("a_R1.fastq.gz")],
            ..single
        };
        let args = generate_cli(BOWTIE2_TAG, &cfg, Some(&paired)).unwrap();
        assert!(args.windows(2).any(|w| w[0] == "-1" && w[1] == "a_R1.fastq.gz"));
        assert!(args.windows(2).any(|w| w[0] == "-2" && w[1] == "a_R2.fastq.gz"));
    }

    #[test]
    fn test_samtools_subcommands() {
        let cfg = config();
        let sort = samtools::SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Sort,
            input: PathBuf::from("s.sam"),
            output: Some(PathBuf::from("s.bam")),
        };
        assert_eq!(generate_cli(SAMTOOLS_TAG, &cfg, Some(&sort)).unwrap(), vec!["sort", "-@", "4", "-o", "s.bam", "s.sam"]);

        let flagstat = samtools::SamtoolsConfig {
            subcommand: SamtoolsSubcommand::Flagstat,
            input: PathBuf::from("s.bam"),
            output: None,
        };
        assert_eq!(generate_cli(SAMTOOLS_TAG, &cfg, Some(&flagstat)).unwrap(), vec!["flagstat", "-O", "tsv", "s.bam"]);
    }

    #[test]
    fn test_demux_tenx_flags() {
        let cfg = config();
        let bcl = bcl_convert::BclConvertConfig { input_dir: PathBuf::from("/fc"), output_dir: PathBuf::from("/out/fastq"), tenx: true };
        assert!(generate_cli(BCL_CONVERT_TAG, &cfg, Some(&bcl)).unwrap().contains(&"--create-fastq-for-index-reads".to_string()));

        let b2f = bases2fastq::Bases2FastqConfig { input_dir: PathBuf::from("/fc"), output_dir: PathBuf::from("/out/b2f"), tenx: false };
        let args = generate_cli(BASES2FASTQ_TAG, &cfg, Some(&b2f)).unwrap();
        assert_eq!(args, vec!["/fc", "/out/b2f", "-p", "16"]);
    }

    #[test]
    fn test_cellranger_count() {
        let cr = cellranger::CellrangerConfig {
            subcommand: CellrangerSubcommand::Count,
            id: "S1".to_string(),
            transcriptome: Some(PathBuf::from("/ref")),
            fastqs: Some(PathBuf::from("/fq")),
            sample: Some("S1".to_string()),
            csv: None,
        };
        let args = generate_cli(CELLRANGER_TAG, &config(), Some(&cr)).unwrap();
        assert_eq!(args[0], "count");
        assert!(args.contains(&"--transcriptome=/ref".to_string()));
        assert!(args.contains(&"--localcores=4".to_string()));
    }

    #[test]
    fn test_generate_cli_rejects_wrong_config() {
        let cfg = config();
        let wrong = bamtools::BamtoolsConfig { bam: PathBuf::from("x.bam") };
        assert!(matches!(generate_cli(BOWTIE2_TAG, &cfg, Some(&wrong)), Err(PipelineError::InvalidConfig(_))));
        assert!(generate_cli(BOWTIE2_TAG, &cfg, None).is_err());
        assert!(generate_cli("nope", &cfg, None).is_err());
    }

    #[test]
    fn test_aviti_script_contracts() {
        let cfg = config();
        assert_eq!(
            scripts::lims_export_args(&cfg),
            vec!["--fcid", "FC1", "--samplesheet_Robo", "/work/idx.csv", "--output_dir", "/work/PRIME_FC1"]
        );
        assert_eq!(
            scripts::aviti_samplesheet_args(Path::new("/out/lims_info.csv"), Path::new("/work/idx.csv")),
            vec!["--lims_info_table", "/out/lims_info.csv", "--RoboIndex_samplesheet", "/work/idx.csv"]
        );
        assert_eq!(scripts::fastq_rename_args("L63060_R1.fastq.gz"), vec!["-f", "L63060_R1.fastq.gz"]);
        let flex = scripts::flex_config_args("L1", Path::new("/fq"), Path::new("/out/lims_info.csv"), Path::new("/s"));
        assert_eq!(&flex[4..6], &["--lims_info_csv".to_string(), "/out/lims_info.csv".to_string()]);
    }

    #[tokio::test]
    async fn test_check_version_missing_tool() {
        // Not a known tool tag.
        assert!(matches!(check_version("nope").await, Err(PipelineError::InvalidConfig(_))));
    }
}
