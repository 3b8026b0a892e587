use crate::cli::args::MachineType;
use crate::config::defs::{
    AVITI_LIMS_INFO_MAKE, AVITI_NAME_CHANGE, AVITI_SAMPLESHEET, AVITI_SAMPLESHEET_MAKE, BASES2FASTQ_OUT_DIR, BASES2FASTQ_TAG, BAMTOOLS_TAG,
    BCL_CONVERT_OUT_DIR, BCL_CONVERT_TAG, BOWTIE2_TAG, CELLRANGER_TAG, DRIVER_CSV, DRIVER_CSV_MAKE, FASTQC_TAG,
    MULTIQC_TAG, NEXTSEQ2K_DRIVER_CSV_MAKE, NEXTSEQ2K_NAME_CHANGE, SAMTOOLS_TAG,
};
use crate::pipelines::manifest::{ColumnMapping, AVITI_COLUMNS, GENERIC_COLUMNS};

/// Where the fastq rename step runs relative to manifest construction.
/// Renaming after the manifest is built leaves the manifest pointing at the
/// pre-rename names, which the NextSeq 2000 wiring relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenamePlacement {
    None,
    BeforeManifest,
    AfterManifest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassificationScope {
    PerRow,
    /// One decision for the whole run: every row must have a reference.
    PerRun,
}

/// Command-line contract of a platform's manifest builder and rename script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptContract {
    /// Driver CSV builders: one call over the whole fastq directory.
    DriverCsv,
    /// LIMS export, then a sample sheet built from it. Renaming is one call per fastq.
    AvitiLims { lims_export: &'static str },
}

/// The parts of the graph that differ between instruments.
#[derive(Debug, Clone)]
pub struct PlatformSpec {
    pub machine_type: MachineType,
    pub demultiplexer: &'static str,
    pub demux_out_dir: &'static str,
    pub manifest_builder: &'static str,
    pub scripts: ScriptContract,
    /// File the builder writes into the output root.
    pub manifest_file: &'static str,
    pub rename_script: Option<&'static str>,
    pub rename: RenamePlacement,
    pub columns: &'static ColumnMapping,
    pub classification_scope: ClassificationScope,
    /// File the instrument writes when a run has finished copying.
    pub completion_marker: &'static str,
}

impl PlatformSpec {
    /// Tools a run on this platform may invoke.
    pub fn required_tools(&self, demultiplex: bool) -> Vec<&'static str> {
        let mut tools = Vec::new();
        if demultiplex {
            tools.push(self.demultiplexer);
        }
        tools.extend([BOWTIE2_TAG, SAMTOOLS_TAG, BAMTOOLS_TAG, FASTQC_TAG, MULTIQC_TAG, CELLRANGER_TAG]);
        tools
    }
}

/// Picks the concrete wiring for an instrument type.
pub fn select_platform(machine_type: &MachineType) -> PlatformSpec {
    match machine_type {
        MachineType::Standard => PlatformSpec {
            machine_type: MachineType::Standard,
            demultiplexer: BCL_CONVERT_TAG,
            demux_out_dir: BCL_CONVERT_OUT_DIR,
            manifest_builder: DRIVER_CSV_MAKE,
            scripts: ScriptContract::DriverCsv,
            manifest_file: DRIVER_CSV,
            rename_script: None,
            rename: RenamePlacement::None,
            columns: &GENERIC_COLUMNS,
            classification_scope: ClassificationScope::PerRow,
            completion_marker: "transfer_complete.txt",
        },
        MachineType::Aviti => PlatformSpec {
            machine_type: MachineType::Aviti,
            demultiplexer: BASES2FASTQ_TAG,
            demux_out_dir: BASES2FASTQ_OUT_DIR,
            manifest_builder: AVITI_SAMPLESHEET_MAKE,
            scripts: ScriptContract::AvitiLims { lims_export: AVITI_LIMS_INFO_MAKE },
            manifest_file: AVITI_SAMPLESHEET,
            rename_script: Some(AVITI_NAME_CHANGE),
            rename: RenamePlacement::BeforeManifest,
            columns: &AVITI_COLUMNS,
            classification_scope: ClassificationScope::PerRow,
            completion_marker: "RunUploaded.json",
        },
        MachineType::NextSeq2K => PlatformSpec {
            machine_type: MachineType::NextSeq2K,
            demultiplexer: BCL_CONVERT_TAG,
            demux_out_dir: BCL_CONVERT_OUT_DIR,
            manifest_builder: NEXTSEQ2K_DRIVER_CSV_MAKE,
            scripts: ScriptContract::DriverCsv,
            manifest_file: DRIVER_CSV,
            rename_script: Some(NEXTSEQ2K_NAME_CHANGE),
            rename: RenamePlacement::AfterManifest,
            columns: &GENERIC_COLUMNS,
            classification_scope: ClassificationScope::PerRun,
            completion_marker: "CopyComplete.txt",
        },
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_differ_only_in_substituted_parts() {
        let standard = select_platform(&MachineType::Standard);
        let aviti = select_platform(&MachineType::Aviti);
        let nextseq = select_platform(&MachineType::NextSeq2K);

        assert_eq!(standard.demultiplexer, BCL_CONVERT_TAG);
        assert_eq!(aviti.demultiplexer, BASES2FASTQ_TAG);
        assert_eq!(nextseq.demultiplexer, BCL_CONVERT_TAG);

        assert_eq!(aviti.rename, RenamePlacement::BeforeManifest);
        assert_eq!(nextseq.rename, RenamePlacement::AfterManifest);
        assert_eq!(standard.rename, RenamePlacement::None);

        assert_ne!(standard.manifest_builder, nextseq.manifest_builder);
        assert_eq!(aviti.completion_marker, "RunUploaded.json");
        assert_eq!(aviti.scripts, ScriptContract::AvitiLims { lims_export: AVITI_LIMS_INFO_MAKE });
        assert_eq!(nextseq.scripts, ScriptContract::DriverCsv);
    }

    #[test]
    fn test_required_tools() {
        let aviti = select_platform(&MachineType::Aviti);
        assert!(aviti.required_tools(true).contains(&BASES2FASTQ_TAG));
        assert!(!aviti.required_tools(false).contains(&BASES2FASTQ_TAG));
        assert!(aviti.required_tools(false).contains(&MULTIQC_TAG));
    }
}
