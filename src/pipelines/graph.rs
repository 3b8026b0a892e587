//! Typed step graph. Nodes are step kinds, edges are data dependencies.
//! One graph is built per run from the platform variant and run options;
//! the executor interprets it the same way for every platform.

use std::fmt;

use crate::config::defs::{PipelineError, AGGREGATE_MAX_RETRIES};
use crate::config::defs::RunConfig;
use crate::pipelines::manifest::OrderType;
use crate::pipelines::platform::{PlatformSpec, RenamePlacement};
use crate::pipelines::reference::Classification;
use crate::pipelines::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    // Run-level
    Demultiplex,
    RenameFastq,
    BuildManifest,
    // Per-row
    Align,
    BamStats,
    Flagstat,
    FastQc,
    CopyFastq,
    FlexConfig,
    CellRangerCount,
    CellRangerMulti,
    // Fan-in
    WriteDriverCsv,
    MultiQc,
    SampleReport,
    Publish,
    PublishLink,
}

/// What a step consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Runs once per run, before the manifest rows exist.
    Run,
    /// One manifest row.
    Row,
    /// The joined results of every row.
    FanIn,
}

impl StepKind {
    pub fn arity(&self) -> Arity {
        match self {
            StepKind::Demultiplex | StepKind::RenameFastq | StepKind::BuildManifest => Arity::Run,
            StepKind::Align
            | StepKind::BamStats
            | StepKind::Flagstat
            | StepKind::FastQc
            | StepKind::CopyFastq
            | StepKind::FlexConfig
            | StepKind::CellRangerCount
            | StepKind::CellRangerMulti => Arity::Row,
            StepKind::WriteDriverCsv
            | StepKind::MultiQc
            | StepKind::SampleReport
            | StepKind::Publish
            | StepKind::PublishLink => Arity::FanIn,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            StepKind::MultiQc | StepKind::SampleReport => RetryPolicy::retry(AGGREGATE_MAX_RETRIES),
            _ => RetryPolicy::fail_fast(),
        }
    }

    /// Upstream steps whose outputs this step reads. Dependencies on
    /// per-row steps from a fan-in step only apply when the step is present.
    pub fn depends_on(&self) -> &'static [StepKind] {
        match self {
            StepKind::BamStats | StepKind::Flagstat => &[StepKind::Align],
            StepKind::CellRangerMulti => &[StepKind::FlexConfig],
            StepKind::MultiQc => &[StepKind::FastQc, StepKind::Align, StepKind::BamStats, StepKind::Flagstat],
            StepKind::SampleReport => &[StepKind::WriteDriverCsv],
            StepKind::WriteDriverCsv => &[
                StepKind::Align,
                StepKind::BamStats,
                StepKind::Flagstat,
                StepKind::FastQc,
                StepKind::CopyFastq,
                StepKind::CellRangerCount,
                StepKind::CellRangerMulti,
            ],
            StepKind::Publish => &[StepKind::MultiQc, StepKind::SampleReport],
            StepKind::PublishLink => &[StepKind::Publish],
            _ => &[],
        }
    }

    /// Steps that belong to the final reporting phase.
    pub fn is_reporting(&self) -> bool {
        matches!(self, StepKind::Publish | StepKind::PublishLink)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Demultiplex => "demultiplex",
            StepKind::RenameFastq => "rename_fastq",
            StepKind::BuildManifest => "build_manifest",
            StepKind::Align => "align",
            StepKind::BamStats => "bamstats",
            StepKind::Flagstat => "flagstat",
            StepKind::FastQc => "fastqc",
            StepKind::CopyFastq => "copy_fastq",
            StepKind::FlexConfig => "flex_config",
            StepKind::CellRangerCount => "cellranger_count",
            StepKind::CellRangerMulti => "cellranger_multi",
            StepKind::WriteDriverCsv => "write_driver_csv",
            StepKind::MultiQc => "multiqc",
            StepKind::SampleReport => "sample_report",
            StepKind::Publish => "publish",
            StepKind::PublishLink => "publish_link",
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}


/// Steps in one stage run concurrently; stages run in order.
pub type Stage = Vec<StepKind>;

#[derive(Debug, Clone, PartialEq)]
pub struct RowChain {
    pub stages: Vec<Stage>,
}

impl RowChain {
    fn new(stages: Vec<Stage>) -> Self {
        RowChain { stages }
    }

    pub fn steps(&self) -> impl Iterator<Item = StepKind> + '_ {
        self.stages.iter().flatten().copied()
    }

    pub fn contains(&self, kind: StepKind) -> bool {
        self.steps().any(|k| k == kind)
    }
}


#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Run-level steps after source resolution, in order.
    pub prelude: Vec<StepKind>,
    pub reference_standard: RowChain,
    pub reference_tenx_capture: RowChain,
    pub reference_tenx_flex: RowChain,
    pub no_reference: RowChain,
    pub fan_in: Vec<Stage>,
}

impl StepGraph {
    /// Builds the graph for a platform and the run's options.
    ///
    /// # Arguments
    ///
    /// * `platform` - Selected platform wiring.
    /// * `config` - Run context; `only_cp_fastq` drops renaming and `manifest` drops the builder.
    ///
    /// # Returns
    /// A validated StepGraph.
    pub fn build(platform: &PlatformSpec, config: &RunConfig) -> Result<Self, PipelineError> {
        let rename = !config.only_cp_fastq && platform.rename_script.is_some();
        let build_manifest = config.manifest.is_none();

        let mut prelude = Vec::new();
        if rename && platform.rename == RenamePlacement::BeforeManifest {
            prelude.push(StepKind::RenameFastq);
        }
        if build_manifest {
            prelude.push(StepKind::BuildManifest);
        }
        if rename && platform.rename == RenamePlacement::AfterManifest {
            prelude.push(StepKind::RenameFastq);
        }

        let graph = StepGraph {
            prelude,
            reference_standard: RowChain::new(vec![
                vec![StepKind::Align, StepKind::FastQc],
                vec![StepKind::BamStats, StepKind::Flagstat],
            ]),
            reference_tenx_capture: RowChain::new(vec![
                vec![StepKind::CellRangerCount, StepKind::FastQc],
            ]),
            reference_tenx_flex: RowChain::new(vec![
                vec![StepKind::FlexConfig, StepKind::FastQc],
                vec![StepKind::CellRangerMulti],
            ]),
            no_reference: RowChain::new(vec![
                vec![StepKind::CopyFastq, StepKind::FastQc],
            ]),
            fan_in: vec![
                vec![StepKind::WriteDriverCsv],
                vec![StepKind::MultiQc, StepKind::SampleReport],
                vec![StepKind::Publish],
                vec![StepKind::PublishLink],
            ],
        };
        graph.validate()?;
        Ok(graph)
    }

    /// Chain for one row, swapped whole by reference availability and order type.
    pub fn chain_for(&self, classification: &Classification, order_type: OrderType) -> &RowChain {
        match (classification, order_type) {
            (Classification::NoReference { .. }, _) => &self.no_reference,
            (Classification::HasReference(_), OrderType::Standard) => &self.reference_standard,
            (Classification::HasReference(_), OrderType::TenXCapture) => &self.reference_tenx_capture,
            (Classification::HasReference(_), OrderType::TenXFlex) => &self.reference_tenx_flex,
        }
    }

    fn chains(&self) -> [&RowChain; 4] {
        [
            &self.reference_standard,
            &self.reference_tenx_capture,
            &self.reference_tenx_flex,
            &self.no_reference,
        ]
    }

    /// Checks arities and that every dependency is satisfied by an earlier stage.
    pub fn validate(&self) -> Result<(), PipelineError> {
        for kind in &self.prelude {
            if kind.arity() != Arity::Run {
                return Err(PipelineError::InvalidConfig(format!("{} is not a run-level step", kind)));
            }
        }

        for chain in self.chains() {
            let mut done: Vec<StepKind> = Vec::new();
            for stage in &chain.stages {
                for kind in stage {
                    if kind.arity() != Arity::Row {
                        return Err(PipelineError::InvalidConfig(format!("{} is not a per-row step", kind)));
                    }
                    if let Some(missing) = kind.depends_on().iter().find(|d| !done.contains(d)) {
                        return Err(PipelineError::InvalidConfig(format!(
                            "{} runs before its dependency {}",
                            kind, missing
                        )));
                    }
                }
                done.extend(stage.iter().copied());
            }
        }

        let mut done: Vec<StepKind> = Vec::new();
        for stage in &self.fan_in {
            for kind in stage {
                if kind.arity() != Arity::FanIn {
                    return Err(PipelineError::InvalidConfig(format!("{} is not a fan-in step", kind)));
                }
                // Per-row dependencies are met by the barrier.
                let unmet = kind
                    .depends_on()
                    .iter()
                    .filter(|d| d.arity() == Arity::FanIn)
                    .find(|d| !done.contains(d));
                if let Some(missing) = unmet {
                    return Err(PipelineError::InvalidConfig(format!(
                        "{} runs before its dependency {}",
                        kind, missing
                    )));
                }
            }
            done.extend(stage.iter().copied());
        }
        Ok(())
    }
}
