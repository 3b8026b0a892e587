//! Interprets a StepGraph: run prelude, per-row fan-out under the semaphore,
//! the join barrier, then the fan-in and reporting stages.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use futures::future::try_join_all;
use log::{debug, error, info, warn};
use tokio::task::JoinSet;

use crate::config::defs::{
    CellrangerSubcommand, PipelineError, RunConfig, SamtoolsSubcommand, BAMTOOLS_TAG, BOWTIE2_TAG,
    CELLRANGER_TAG, FASTQC_TAG, MULTIQC_TAG, NO_REF_SAMPLE_REPORT_MAKE, SAMPLE_REPORT_MAKE, SAMTOOLS_TAG,
    FLEX_CONFIGCSV_MAKE, LIMS_INFO_CSV,
};
use crate::pipelines::graph::{RowChain, StepGraph, StepKind};
use crate::pipelines::layout::{RowLayout, RunLayout};
use crate::pipelines::manifest::{load_manifest, Manifest, ManifestRow};
use crate::pipelines::platform::{select_platform, PlatformSpec, RenamePlacement, ScriptContract};
use crate::pipelines::reference::{classify_rows, Classification, ReferenceIndex};
use crate::pipelines::report::{format_link, publish, write_driver_csv};
use crate::pipelines::source::{aviti_rename_targets, find_fastqs, SourceResolver};
use crate::utils::command::{bamtools, bowtie2, cellranger, fastqc, generate_cli, multiqc, samtools, scripts};
use crate::utils::file::{copy_into, remove_if_exists};
use crate::utils::streams::{ToolInvocation, ToolOutput, ToolRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Resolving,
    Classifying,
    Executing,
    Reporting,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Resolving => "Resolving",
            RunState::Classifying => "Classifying",
            RunState::Executing => "Executing",
            RunState::Reporting => "Reporting",
            RunState::Done => "Done",
            RunState::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Records every state the run passes through.
#[derive(Debug, Clone)]
pub struct RunTracker {
    transitions: Vec<RunState>,
}

impl RunTracker {
    pub fn new() -> Self {
        RunTracker { transitions: vec![RunState::Resolving] }
    }

    pub fn current(&self) -> RunState {
        *self.transitions.last().unwrap_or(&RunState::Resolving)
    }

    pub fn advance(&mut self, next: RunState) {
        info!("Run state: {} -> {}", self.current(), next);
        self.transitions.push(next);
    }

    pub fn transitions(&self) -> &[RunState] {
        &self.transitions
    }
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}


#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    Paths(Vec<PathBuf>),
    Directory(PathBuf),
    Status(String),
    /// The step ran but has nothing to report for this row.
    NotFound,
}

impl StepOutput {
    /// Value written into report columns; `None` for `NotFound`.
    pub fn display(&self) -> Option<String> {
        match self {
            StepOutput::Paths(paths) if paths.is_empty() => None,
            StepOutput::Paths(paths) => Some(
                paths.iter().map(|p| p.to_string_lossy().to_string()).collect::<Vec<_>>().join(";"),
            ),
            StepOutput::Directory(dir) => Some(dir.to_string_lossy().to_string()),
            StepOutput::Status(status) => Some(status.clone()),
            StepOutput::NotFound => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub kind: StepKind,
    pub output: StepOutput,
    pub started: Instant,
    pub finished: Instant,
}

/// One row's completed chain.
#[derive(Debug, Clone)]
pub struct BranchResult {
    /// Position in the manifest.
    pub index: usize,
    pub row: Arc<ManifestRow>,
    pub classification: Classification,
    pub results: Vec<StepResult>,
    pub finished_at: Instant,
}

impl BranchResult {
    pub fn output(&self, kind: StepKind) -> &StepOutput {
        self.results
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| &r.output)
            .unwrap_or(&StepOutput::NotFound)
    }
}

/// Every row's results, in manifest order, available only after all rows finished.
#[derive(Debug, Clone)]
pub struct AggregateHandle {
    pub branches: Vec<BranchResult>,
    pub representative: Option<Arc<ManifestRow>>,
    pub opened_at: Instant,
}

impl AggregateHandle {
    pub fn all_without_reference(&self) -> bool {
        self.branches.iter().all(|b| !b.classification.has_reference())
    }
}

#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    /// Absent when the manifest had no rows.
    pub link: Option<String>,
    pub rows: usize,
    pub transitions: Vec<RunState>,
    pub aggregate: Option<AggregateHandle>,
    pub fan_in: Vec<StepResult>,
}


/// Waits for every branch. On the first failure the remaining branches are
/// aborted and drained before the error is returned.
///
/// # Arguments
///
/// * `branches` - One task per manifest row.
///
/// # Returns
/// AggregateHandle with branches sorted into manifest order.
pub async fn join(
    mut branches: JoinSet<Result<BranchResult, PipelineError>>,
) -> Result<AggregateHandle, PipelineError> {
    let mut done = Vec::with_capacity(branches.len());
    while let Some(joined) = branches.join_next().await {
        let failure = match joined {
            Ok(Ok(branch)) => {
                debug!("Library {} finished", branch.row.library_id);
                done.push(branch);
                continue;
            }
            Ok(Err(e)) => e,
            Err(e) => PipelineError::TaskJoin(e.to_string()),
        };
        if !branches.is_empty() {
            warn!("Cancelling {} running libraries after failure: {}", branches.len(), failure);
        }
        branches.abort_all();
        while branches.join_next().await.is_some() {}
        return Err(failure);
    }

    done.sort_by_key(|b| b.index);
    let representative = done.first().map(|b| Arc::clone(&b.row));
    Ok(AggregateHandle { branches: done, representative, opened_at: Instant::now() })
}


/// Everything one row task needs, owned so the task can be spawned.
struct RowContext<R: ToolRunner> {
    config: Arc<RunConfig>,
    runner: Arc<R>,
    layout: RunLayout,
    source_dir: PathBuf,
    lims_info: PathBuf,
}

impl<R: ToolRunner> Clone for RowContext<R> {
    fn clone(&self) -> Self {
        RowContext {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            layout: self.layout.clone(),
            source_dir: self.source_dir.clone(),
            lims_info: self.lims_info.clone(),
        }
    }
}

/// Runs `invocation`, first clearing its stale outputs, then checks every
/// declared output exists.
async fn invoke<R: ToolRunner>(runner: &R, invocation: &ToolInvocation) -> Result<ToolOutput, PipelineError> {
    for stale in invocation.outputs.iter().chain(invocation.stdout_to.iter()) {
        remove_if_exists(stale).await?;
    }
    debug!("{}: {}", invocation.step, invocation.command_line());
    let output = runner.run(invocation).await?;
    for path in &invocation.outputs {
        if !tokio::fs::try_exists(path).await? {
            return Err(PipelineError::StepOutputMissing { step: invocation.step.to_string(), path: path.clone() });
        }
    }
    Ok(output)
}

fn script(config: &RunConfig, name: &str) -> String {
    config.bin_dir.join(name).to_string_lossy().to_string()
}


async fn run_branch<R: ToolRunner>(
    ctx: RowContext<R>,
    index: usize,
    row: Arc<ManifestRow>,
    classification: Classification,
    chain: RowChain,
) -> Result<BranchResult, PipelineError> {
    let _permit = Arc::clone(&ctx.config.maximal_semaphore)
        .acquire_owned()
        .await
        .map_err(|e| PipelineError::Other(anyhow!("Semaphore closed: {}", e)))?;

    info!("Library {} ({}): {}", row.library_id, row.file_name, match &classification {
        Classification::HasReference(r) => format!("reference {} {}", r.genome, r.annotation),
        Classification::NoReference { reason } => format!("no reference ({})", reason),
    });
    let row_layout = ctx.layout.row(&row);
    tokio::fs::create_dir_all(&row_layout.sample_dir).await?;

    let mut results = Vec::new();
    for stage in &chain.stages {
        let stage_results = try_join_all(
            stage.iter().map(|kind| run_row_step(&ctx, *kind, &row, &row_layout, &classification)),
        )
        .await?;
        results.extend(stage_results);
    }

    Ok(BranchResult { index, row, classification, results, finished_at: Instant::now() })
}

async fn run_row_step<R: ToolRunner>(
    ctx: &RowContext<R>,
    kind: StepKind,
    row: &ManifestRow,
    layout: &RowLayout,
    classification: &Classification,
) -> Result<StepResult, PipelineError> {
    let started = Instant::now();
    info!("Library {}: {}", row.library_id, kind);
    let output = kind
        .retry_policy()
        .run(kind, |_| row_step_attempt(ctx, kind, row, layout, classification))
        .await?;
    Ok(StepResult { kind, output, started, finished: Instant::now() })
}

async fn row_step_attempt<R: ToolRunner>(
    ctx: &RowContext<R>,
    kind: StepKind,
    row: &ManifestRow,
    layout: &RowLayout,
    classification: &Classification,
) -> Result<StepOutput, PipelineError> {
    let config = ctx.config.as_ref();
    let runner = ctx.runner.as_ref();
    let fastq_dir = row.fastq_dir(&ctx.source_dir);
    let reference = || {
        classification.reference().ok_or_else(|| {
            PipelineError::InvalidConfig(format!("{} needs a reference for library {}", kind, row.library_id))
        })
    };

    match kind {
        StepKind::Align => {
            let fastqs = find_fastqs(&fastq_dir, &row.file_name, kind).await?;
            let bt2 = bowtie2::Bowtie2Config {
                index: reference()?.bowtie2_index.clone(),
                r1: fastqs.r1.clone(),
                r2: fastqs.r2.clone(),
                sam: layout.sam.clone(),
            };
            let align = ToolInvocation::new(kind, BOWTIE2_TAG, generate_cli(BOWTIE2_TAG, config, Some(&bt2))?)
                .stderr_to(layout.log.clone())
                .outputs(vec![layout.sam.clone(), layout.log.clone()]);
            invoke(runner, &align).await?;

            let sort = samtools::SamtoolsConfig {
                subcommand: SamtoolsSubcommand::Sort,
                input: layout.sam.clone(),
                output: Some(layout.bam.clone()),
            };
            let sort = ToolInvocation::new(kind, SAMTOOLS_TAG, generate_cli(SAMTOOLS_TAG, config, Some(&sort))?)
                .outputs(vec![layout.bam.clone()]);
            invoke(runner, &sort).await?;
            remove_if_exists(&layout.sam).await?;

            Ok(StepOutput::Paths(vec![layout.bam.clone(), layout.log.clone()]))
        }
        StepKind::BamStats => {
            let stats = bamtools::BamtoolsConfig { bam: layout.bam.clone() };
            let inv = ToolInvocation::new(kind, BAMTOOLS_TAG, generate_cli(BAMTOOLS_TAG, config, Some(&stats))?)
                .stdout_to(layout.bamstats.clone())
                .outputs(vec![layout.bamstats.clone()]);
            invoke(runner, &inv).await?;
            Ok(StepOutput::Paths(vec![layout.bamstats.clone()]))
        }
        StepKind::Flagstat => {
            let flagstat = samtools::SamtoolsConfig {
                subcommand: SamtoolsSubcommand::Flagstat,
                input: layout.bam.clone(),
                output: None,
            };
            let inv = ToolInvocation::new(kind, SAMTOOLS_TAG, generate_cli(SAMTOOLS_TAG, config, Some(&flagstat))?)
                .stdout_to(layout.flagstat.clone())
                .outputs(vec![layout.flagstat.clone()]);
            invoke(runner, &inv).await?;
            Ok(StepOutput::Paths(vec![layout.flagstat.clone()]))
        }
        StepKind::FastQc => {
            let fastqs = find_fastqs(&fastq_dir, &row.file_name, kind).await?;
            let reports: Vec<PathBuf> = fastqs
                .all()
                .iter()
                .map(|fq| ctx.layout.fastqc_dir.join(fastqc_report_name(fq)))
                .collect();
            let qc = fastqc::FastqcConfig { out_dir: ctx.layout.fastqc_dir.clone(), fastqs: fastqs.all() };
            let inv = ToolInvocation::new(kind, FASTQC_TAG, generate_cli(FASTQC_TAG, config, Some(&qc))?)
                .outputs(reports.clone());
            invoke(runner, &inv).await?;
            Ok(StepOutput::Paths(reports))
        }
        StepKind::CopyFastq => {
            let fastqs = find_fastqs(&fastq_dir, &row.file_name, kind).await?;
            let dest = PathBuf::from(&row.result_path);
            let mut copies = Vec::new();
            for fq in fastqs.all() {
                let copy = copy_into(&fq, &dest).await?;
                debug!("Copied {:?} to {:?}", fq, copy);
                copies.push(copy);
            }
            Ok(StepOutput::Paths(copies))
        }
        StepKind::FlexConfig => {
            let args = scripts::flex_config_args(&row.library_id, &fastq_dir, &ctx.lims_info, &layout.sample_dir);
            let inv = ToolInvocation::new(kind, script(config, FLEX_CONFIGCSV_MAKE), args)
                .cwd(layout.sample_dir.clone())
                .outputs(vec![layout.flex_config.clone()]);
            invoke(runner, &inv).await?;
            Ok(StepOutput::Paths(vec![layout.flex_config.clone()]))
        }
        StepKind::CellRangerCount | StepKind::CellRangerMulti => {
            let (subcommand, declared) = if kind == StepKind::CellRangerCount {
                (CellrangerSubcommand::Count, layout.cellranger_outs.join("web_summary.html"))
            } else {
                (CellrangerSubcommand::Multi, layout.cellranger_outs.join("config.csv"))
            };
            let cr = cellranger::CellrangerConfig {
                subcommand,
                id: row.file_name.clone(),
                transcriptome: (subcommand == CellrangerSubcommand::Count)
                    .then(|| reference().map(|r| r.cellranger_ref.clone()))
                    .transpose()?,
                fastqs: (subcommand == CellrangerSubcommand::Count).then(|| fastq_dir.clone()),
                sample: (subcommand == CellrangerSubcommand::Count).then(|| row.file_name.clone()),
                csv: (subcommand == CellrangerSubcommand::Multi).then(|| layout.flex_config.clone()),
            };
            let inv = ToolInvocation::new(kind, CELLRANGER_TAG, generate_cli(CELLRANGER_TAG, config, Some(&cr))?)
                .cwd(layout.sample_dir.clone())
                .stdout_to(layout.sample_dir.join(format!("{}.log", kind)))
                .outputs(vec![declared]);
            invoke(runner, &inv).await?;
            Ok(StepOutput::Directory(layout.cellranger_outs.clone()))
        }
        other => Err(PipelineError::InvalidConfig(format!("{} is not a per-row step", other))),
    }
}

/// `S1_L001_R1_001.fastq.gz` -> `S1_L001_R1_001_fastqc.html`
pub fn fastqc_report_name(fastq: &Path) -> String {
    let name = fastq.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let stem = name
        .strip_suffix(".fastq.gz")
        .or_else(|| name.strip_suffix(".fq.gz"))
        .or_else(|| name.strip_suffix(".fastq"))
        .unwrap_or(&name);
    format!("{}_{}", stem, crate::config::defs::FASTQC_SUFFIX)
}


/// Executes one run. Generic over the tool runner so tests can substitute one.
pub struct Pipeline<R: ToolRunner> {
    config: Arc<RunConfig>,
    runner: Arc<R>,
    platform: PlatformSpec,
    graph: StepGraph,
    layout: RunLayout,
    source: SourceResolver,
}

impl<R: ToolRunner> Pipeline<R> {
    pub fn new(config: Arc<RunConfig>, runner: Arc<R>) -> Result<Self, PipelineError> {
        let platform = select_platform(&config.machine_type);
        let graph = StepGraph::build(&platform, &config)?;
        let layout = RunLayout::new(&config.out_dir);
        Ok(Pipeline { config, runner, platform, graph, layout, source: SourceResolver::new() })
    }

    pub fn platform(&self) -> &PlatformSpec {
        &self.platform
    }

    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// Runs the whole graph.
    ///
    /// # Returns
    /// RunOutcome in state Done, or the error that moved the run to Failed.
    pub async fn run(&self) -> Result<RunOutcome, PipelineError> {
        let mut tracker = RunTracker::new();
        match self.execute(&mut tracker).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracker.advance(RunState::Failed);
                error!("Run {} failed: {}", self.config.fcid, e);
                Err(e)
            }
        }
    }

    async fn execute(&self, tracker: &mut RunTracker) -> Result<RunOutcome, PipelineError> {
        self.layout.create().await?;

        // Resolving
        let source_dir = self
            .source
            .resolve(&self.config, &self.platform, self.runner.as_ref())
            .await?
            .to_path_buf();
        let manifest_path = self.prelude(&source_dir).await?;
        let mut manifest = load_manifest(&manifest_path, self.platform.columns).await?;
        if let Some(molng) = &self.config.molng {
            manifest.retain_order(molng);
        }

        tracker.advance(RunState::Classifying);
        if manifest.is_empty() {
            info!("Manifest {:?} has no libraries; nothing to do", manifest_path);
            tracker.advance(RunState::Done);
            return Ok(RunOutcome {
                state: RunState::Done,
                link: None,
                rows: 0,
                transitions: tracker.transitions().to_vec(),
                aggregate: None,
                fan_in: Vec::new(),
            });
        }
        let index = ReferenceIndex::load(&self.config.index_samplesheet).await?;
        let classes = classify_rows(&manifest.rows, &index, &self.config, self.platform.classification_scope);

        tracker.advance(RunState::Executing);
        let aggregate = self.fan_out(&manifest, classes, &source_dir).await?;

        let mut fan_in = Vec::new();
        for stage in &self.graph.fan_in {
            if stage.iter().any(|k| k.is_reporting()) && tracker.current() != RunState::Reporting {
                tracker.advance(RunState::Reporting);
            }
            let results = try_join_all(
                stage.iter().map(|kind| self.run_fan_in_step(*kind, &manifest, &aggregate)),
            )
            .await?;
            fan_in.extend(results);
        }

        let link = fan_in.iter().find(|r| r.kind == StepKind::PublishLink).and_then(|r| r.output.display());
        tracker.advance(RunState::Done);
        Ok(RunOutcome {
            state: RunState::Done,
            link,
            rows: aggregate.branches.len(),
            transitions: tracker.transitions().to_vec(),
            aggregate: Some(aggregate),
            fan_in,
        })
    }

    /// Rename and manifest construction, in the platform's order.
    async fn prelude(&self, source_dir: &Path) -> Result<PathBuf, PipelineError> {
        let manifest_path = match &self.config.manifest {
            Some(path) => path.clone(),
            None => self.config.out_dir.join(self.platform.manifest_file),
        };

        for kind in &self.graph.prelude {
            info!("Run {}: {}", self.config.fcid, kind);
            let invocations = match kind {
                StepKind::BuildManifest => self.manifest_invocations(&manifest_path, source_dir),
                StepKind::RenameFastq => self.rename_invocations(&manifest_path, source_dir).await?,
                other => {
                    return Err(PipelineError::InvalidConfig(format!("{} is not a prelude step", other)));
                }
            };
            for inv in &invocations {
                invoke(self.runner.as_ref(), inv).await?;
            }
        }
        Ok(manifest_path)
    }

    /// Manifest builder calls. Aviti first exports the LIMS order table
    /// unless `--lims_info` supplied one, then builds the sample sheet from it.
    fn manifest_invocations(&self, manifest_path: &Path, source_dir: &Path) -> Vec<ToolInvocation> {
        let config = self.config.as_ref();
        let builder = script(config, self.platform.manifest_builder);
        match self.platform.scripts {
            ScriptContract::DriverCsv => vec![
                ToolInvocation::new(StepKind::BuildManifest, builder, scripts::driver_csv_builder_args(config, source_dir))
                    .cwd(config.out_dir.clone())
                    .outputs(vec![manifest_path.to_path_buf()]),
            ],
            ScriptContract::AvitiLims { lims_export } => {
                let lims_info = config.lims_info_path();
                let mut invocations = Vec::new();
                if config.lims_info.is_none() {
                    invocations.push(
                        ToolInvocation::new(StepKind::BuildManifest, script(config, lims_export), scripts::lims_export_args(config))
                            .cwd(config.out_dir.clone())
                            .outputs(vec![config.out_dir.join(LIMS_INFO_CSV)]),
                    );
                }
                invocations.push(
                    ToolInvocation::new(
                        StepKind::BuildManifest,
                        builder,
                        scripts::aviti_samplesheet_args(&lims_info, &config.index_samplesheet),
                    )
                    .cwd(config.out_dir.clone())
                    .outputs(vec![manifest_path.to_path_buf()]),
                );
                invocations
            }
        }
    }

    /// Rename calls. Aviti renames one fastq per call, inside the fastq directory.
    async fn rename_invocations(&self, manifest_path: &Path, source_dir: &Path) -> Result<Vec<ToolInvocation>, PipelineError> {
        let script_name = self
            .platform
            .rename_script
            .ok_or_else(|| PipelineError::InvalidConfig("rename step without a rename script".to_string()))?;
        let program = script(&self.config, script_name);
        match self.platform.scripts {
            ScriptContract::DriverCsv => {
                let manifest = (self.platform.rename == RenamePlacement::AfterManifest).then_some(manifest_path);
                Ok(vec![
                    ToolInvocation::new(StepKind::RenameFastq, program, scripts::fastq_dir_rename_args(source_dir, manifest))
                        .cwd(self.config.out_dir.clone()),
                ])
            }
            ScriptContract::AvitiLims { .. } => {
                let targets = aviti_rename_targets(source_dir).await?;
                if targets.is_empty() {
                    info!("No fastqs to rename in {:?}", source_dir);
                }
                Ok(targets
                    .into_iter()
                    .map(|(current, renamed)| {
                        ToolInvocation::new(StepKind::RenameFastq, program.clone(), scripts::fastq_rename_args(&current))
                            .cwd(source_dir.to_path_buf())
                            .outputs(vec![source_dir.join(renamed)])
                    })
                    .collect())
            }
        }
    }

    async fn fan_out(
        &self,
        manifest: &Manifest,
        classes: Vec<Classification>,
        source_dir: &Path,
    ) -> Result<AggregateHandle, PipelineError> {
        let ctx = RowContext {
            config: Arc::clone(&self.config),
            runner: Arc::clone(&self.runner),
            layout: self.layout.clone(),
            source_dir: source_dir.to_path_buf(),
            lims_info: self.config.lims_info_path(),
        };

        let mut branches = JoinSet::new();
        for (index, (row, classification)) in manifest.rows.iter().zip(classes).enumerate() {
            let chain = self.graph.chain_for(&classification, row.order_kind()).clone();
            branches.spawn(run_branch(ctx.clone(), index, Arc::clone(row), classification, chain));
        }
        info!("Started {} libraries, at most {} at a time", manifest.rows.len(), self.config.max_concurrency);
        join(branches).await
    }

    async fn run_fan_in_step(
        &self,
        kind: StepKind,
        manifest: &Manifest,
        aggregate: &AggregateHandle,
    ) -> Result<StepResult, PipelineError> {
        let started = Instant::now();
        info!("Run {}: {}", self.config.fcid, kind);
        let output = kind
            .retry_policy()
            .run(kind, |attempt| self.fan_in_attempt(kind, manifest, aggregate, attempt))
            .await?;
        Ok(StepResult { kind, output, started, finished: Instant::now() })
    }

    async fn fan_in_attempt(
        &self,
        kind: StepKind,
        manifest: &Manifest,
        aggregate: &AggregateHandle,
        attempt: u32,
    ) -> Result<StepOutput, PipelineError> {
        let layout = &self.layout;
        match kind {
            StepKind::WriteDriverCsv => {
                write_driver_csv(&layout.driver_csv, &manifest.headers, aggregate).await?;
                Ok(StepOutput::Paths(vec![layout.driver_csv.clone()]))
            }
            StepKind::MultiQc => {
                let mqc = multiqc::MultiqcConfig { search_dir: layout.qc_dir.clone(), out_dir: layout.report_dir.clone() };
                let inv = ToolInvocation::new(kind, MULTIQC_TAG, generate_cli(MULTIQC_TAG, &self.config, Some(&mqc))?)
                    .outputs(vec![layout.multiqc_html.clone()]);
                if attempt > 1 {
                    debug!("multiqc attempt {}", attempt);
                }
                invoke(self.runner.as_ref(), &inv).await?;
                Ok(StepOutput::Paths(vec![layout.multiqc_html.clone()]))
            }
            StepKind::SampleReport => {
                let name = if aggregate.all_without_reference() { NO_REF_SAMPLE_REPORT_MAKE } else { SAMPLE_REPORT_MAKE };
                let inv = ToolInvocation::new(
                    kind,
                    script(&self.config, name),
                    scripts::sample_report_args(&layout.driver_csv, &layout.report_dir),
                )
                .cwd(layout.report_dir.clone())
                .outputs(vec![layout.sample_report.clone()]);
                invoke(self.runner.as_ref(), &inv).await?;
                Ok(StepOutput::Paths(vec![layout.sample_report.clone()]))
            }
            StepKind::Publish => Ok(StepOutput::Paths(publish(aggregate, layout).await?)),
            StepKind::PublishLink => match &aggregate.representative {
                Some(row) => Ok(StepOutput::Status(format_link(&self.config.link_base, row))),
                None => Ok(StepOutput::NotFound),
            },
            other => Err(PipelineError::InvalidConfig(format!("{} is not a fan-in step", other))),
        }
    }
}
