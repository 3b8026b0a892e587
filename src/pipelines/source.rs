use std::path::{Path, PathBuf};

use log::info;
use tokio::sync::OnceCell;

use crate::cli::args::RunType;
use crate::config::defs::{PipelineError, RunConfig, BASES2FASTQ_TAG, BCL_CONVERT_TAG, R1_FASTQ_SUFFIX, R2_FASTQ_SUFFIX};
use crate::pipelines::graph::StepKind;
use crate::pipelines::platform::PlatformSpec;
use crate::utils::command::{bases2fastq, bcl_convert, generate_cli};
use crate::utils::streams::{ToolInvocation, ToolRunner};

/// Decides once per run where fastqs come from: the `--fastq_dir` override,
/// or the platform demultiplexer's output directory.
#[derive(Debug, Default)]
pub struct SourceResolver {
    resolved: OnceCell<PathBuf>,
}

impl SourceResolver {
    pub fn new() -> Self {
        SourceResolver { resolved: OnceCell::new() }
    }

    /// Resolves the fastq source, demultiplexing only on the first call and
    /// only without an override.
    ///
    /// # Arguments
    ///
    /// * `config` - Run context.
    /// * `platform` - Supplies the demultiplexer and its output directory.
    /// * `runner` - Tool runner used for the demultiplexer.
    ///
    /// # Returns
    /// Directory the manifest's fastq locations are relative to.
    pub async fn resolve<R: ToolRunner>(
        &self,
        config: &RunConfig,
        platform: &PlatformSpec,
        runner: &R,
    ) -> Result<&Path, PipelineError> {
        let dir = self
            .resolved
            .get_or_try_init(|| async {
                match &config.fastq_dir {
                    Some(dir) => {
                        info!("Using fastqs from {:?}; skipping {}", dir, platform.demultiplexer);
                        Ok(dir.clone())
                    }
                    None => demultiplex(config, platform, runner).await,
                }
            })
            .await?;
        Ok(dir.as_path())
    }

    pub fn get(&self) -> Option<&Path> {
        self.resolved.get().map(|p| p.as_path())
    }
}

pub fn demux_invocation(config: &RunConfig, platform: &PlatformSpec) -> Result<ToolInvocation, PipelineError> {
    let output_dir = config.out_dir.join(platform.demux_out_dir);
    let tenx = config.run_type == RunType::TenX;
    let args = match platform.demultiplexer {
        BCL_CONVERT_TAG => {
            let tool_config = bcl_convert::BclConvertConfig { input_dir: config.fcpath.clone(), output_dir, tenx };
            generate_cli(BCL_CONVERT_TAG, config, Some(&tool_config))?
        }
        BASES2FASTQ_TAG => {
            let tool_config = bases2fastq::Bases2FastqConfig { input_dir: config.fcpath.clone(), output_dir, tenx };
            generate_cli(BASES2FASTQ_TAG, config, Some(&tool_config))?
        }
        other => return Err(PipelineError::InvalidConfig(format!("Unknown demultiplexer: {}", other))),
    };
    Ok(ToolInvocation::new(StepKind::Demultiplex, platform.demultiplexer, args).cwd(config.out_dir.clone()))
}

async fn demultiplex<R: ToolRunner>(
    config: &RunConfig,
    platform: &PlatformSpec,
    runner: &R,
) -> Result<PathBuf, PipelineError> {
    let output_dir = config.out_dir.join(platform.demux_out_dir);
    tokio::fs::create_dir_all(&config.out_dir).await?;
    let invocation = demux_invocation(config, platform)?;
    info!("Demultiplexing {:?} with {}", config.fcpath, platform.demultiplexer);
    runner.run(&invocation).await?;

    if !tokio::fs::try_exists(&output_dir).await? {
        return Err(PipelineError::StepOutputMissing {
            step: StepKind::Demultiplex.to_string(),
            path: output_dir,
        });
    }
    Ok(output_dir)
}


/// Fastqs of one library.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowFastqs {
    pub r1: Vec<PathBuf>,
    pub r2: Vec<PathBuf>,
}

impl RowFastqs {
    pub fn all(&self) -> Vec<PathBuf> {
        self.r1.iter().chain(self.r2.iter()).cloned().collect()
    }

    pub fn paired(&self) -> bool {
        !self.r2.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mate {
    R1,
    R2,
}

/// `S<n>` style tokens; `width` pins the digit count (lanes are `L001`).
fn is_numbered(token: &str, letter: char, width: Option<usize>) -> bool {
    token.strip_prefix(letter).is_some_and(|digits| {
        !digits.is_empty()
            && digits.bytes().all(|b| b.is_ascii_digit())
            && width.is_none_or(|w| digits.len() == w)
    })
}

/// Reads the part of a fastq name after `<file_name>_`. Accepts the Illumina
/// tail `S<n>_[L<nnn>_]R<1|2>_<chunk>.fastq.gz` and the bare `R<1|2>.fastq.gz`.
fn mate_of(tail: &str) -> Option<Mate> {
    if tail == R1_FASTQ_SUFFIX {
        return Some(Mate::R1);
    }
    if tail == R2_FASTQ_SUFFIX {
        return Some(Mate::R2);
    }
    let stem = tail.strip_suffix(".fastq.gz")?;
    let mut parts = stem.split('_');
    if !is_numbered(parts.next()?, 'S', None) {
        return None;
    }
    let mut part = parts.next()?;
    if is_numbered(part, 'L', Some(3)) {
        part = parts.next()?;
    }
    let mate = match part {
        "R1" => Mate::R1,
        "R2" => Mate::R2,
        _ => return None,
    };
    let chunk = parts.next()?;
    let chunk_ok = !chunk.is_empty() && chunk.bytes().all(|b| b.is_ascii_digit());
    if !chunk_ok || parts.next().is_some() {
        return None;
    }
    Some(mate)
}

/// Finds the R1 and R2 fastqs of one library in `dir`. A name only belongs to
/// `file_name` when everything after `<file_name>_` is a read tail, so `L1`
/// never picks up `L1_B_S2_L001_R1_001.fastq.gz`.
/// A library without any R1 file is an error; R2 is optional.
pub async fn find_fastqs(dir: &Path, file_name: &str, step: StepKind) -> Result<RowFastqs, PipelineError> {
    let missing = || PipelineError::StepOutputMissing {
        step: step.to_string(),
        path: dir.join(format!("{}_{}", file_name, R1_FASTQ_SUFFIX)),
    };
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(missing()),
        Err(e) => return Err(e.into()),
    };

    let prefix = format!("{}_", file_name);
    let mut fastqs = RowFastqs::default();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        match name.strip_prefix(&prefix).and_then(mate_of) {
            Some(Mate::R1) => fastqs.r1.push(entry.path()),
            Some(Mate::R2) => fastqs.r2.push(entry.path()),
            None => {}
        }
    }
    if fastqs.r1.is_empty() {
        return Err(missing());
    }
    fastqs.r1.sort();
    fastqs.r2.sort();
    Ok(fastqs)
}


/// Name the Aviti rename script gives `<lib>_R1.fastq.gz`: `<lib>_S1_L001_R1_001.fastq.gz`.
/// Only names of exactly that two-token form are renamed.
pub fn aviti_renamed(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".fastq.gz")?;
    let (lib, read) = stem.split_once('_')?;
    if lib.is_empty() || read.contains('_') || !matches!(read, "R1" | "R2") {
        return None;
    }
    Some(format!("{}_S1_L001_{}_001.fastq.gz", lib, read))
}

/// Fastqs in `dir` still waiting for the Aviti rename, as (current, renamed) names.
pub async fn aviti_rename_targets(dir: &Path) -> Result<Vec<(String, String)>, PipelineError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut targets = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(renamed) = aviti_renamed(&name) {
            targets.push((name, renamed));
        }
    }
    targets.sort();
    Ok(targets)
}
