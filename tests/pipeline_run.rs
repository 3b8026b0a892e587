use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use prime_pipelines::cli::Arguments;
use prime_pipelines::config::defs::{PipelineError, RunConfig};
use prime_pipelines::pipelines::executor::{Pipeline, RunState};
use prime_pipelines::pipelines::graph::StepKind;
use prime_pipelines::utils::streams::{ToolInvocation, ToolOutput, ToolRunner};

#[derive(Debug, Clone)]
struct Call {
    step: StepKind,
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    started: Instant,
    finished: Instant,
}

/// Fails, delays or drops outputs of invocations whose program and arguments match.
#[derive(Debug, Clone)]
struct Rule {
    program: &'static str,
    arg: Option<&'static str>,
    fail_times: u32,
    delay: Duration,
    /// Outputs ending with this suffix are not written.
    skip_output: Option<&'static str>,
}

impl Rule {
    fn fail(program: &'static str, arg: Option<&'static str>, fail_times: u32) -> Self {
        Rule { program, arg, fail_times, delay: Duration::ZERO, skip_output: None }
    }

    fn delay(program: &'static str, arg: Option<&'static str>, delay: Duration) -> Self {
        Rule { program, arg, fail_times: 0, delay, skip_output: None }
    }

    fn skip_output(program: &'static str, suffix: &'static str) -> Self {
        Rule { program, arg: None, fail_times: 0, delay: Duration::ZERO, skip_output: Some(suffix) }
    }

    fn matches(&self, invocation: &ToolInvocation) -> bool {
        invocation.program.ends_with(self.program)
            && self.arg.map_or(true, |a| invocation.args.iter().any(|x| x.contains(a)))
    }
}

/// Stands in for every external tool: records each call with timestamps and
/// materialises declared outputs with content that depends only on the file name.
/// `-f <fastq>` calls move the fastq in their working directory, like the Aviti rename script.
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<Call>>,
    rules: Mutex<Vec<Rule>>,
    /// Output contents by file name, for outputs the pipeline reads back.
    contents: HashMap<String, String>,
}

impl RecordingRunner {
    fn with_rules(rules: Vec<Rule>) -> Self {
        RecordingRunner { rules: Mutex::new(rules), ..Default::default() }
    }

    fn with_contents(contents: &[(&str, &str)]) -> Self {
        RecordingRunner {
            contents: contents.iter().map(|(name, text)| (name.to_string(), text.to_string())).collect(),
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn count(&self, step: StepKind) -> usize {
        self.calls().iter().filter(|c| c.step == step).count()
    }

    fn programs(&self) -> Vec<String> {
        self.calls().iter().map(|c| c.program.clone()).collect()
    }
}

fn artifact(path: &Path) -> String {
    format!("artifact {}\n", path.file_name().unwrap().to_string_lossy())
}

impl ToolRunner for RecordingRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PipelineError> {
        let started = Instant::now();
        let (delay, fail, skipped) = {
            let mut rules = self.rules.lock().unwrap();
            let mut delay = Duration::ZERO;
            let mut fail = false;
            let mut skipped = Vec::new();
            for rule in rules.iter_mut().filter(|r| r.matches(invocation)) {
                delay += rule.delay;
                if rule.fail_times > 0 {
                    rule.fail_times -= 1;
                    fail = true;
                }
                skipped.extend(rule.skip_output);
            }
            (delay, fail, skipped)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if fail {
            // Leave a partial artifact behind, as a crashing tool would.
            for path in &invocation.outputs {
                std::fs::write(path, b"partial")?;
            }
            Err(PipelineError::ExternalToolFailure {
                tool: invocation.program.clone(),
                code: Some(1),
                stderr: "simulated failure".to_string(),
            })
        } else {
            if let Some(pos) = invocation.args.iter().position(|a| a == "--output-directory") {
                std::fs::create_dir_all(&invocation.args[pos + 1])?;
            }
            if let (Some(cwd), [flag, fastq]) = (&invocation.cwd, invocation.args.as_slice()) {
                if flag == "-f" {
                    std::fs::rename(cwd.join(fastq), &invocation.outputs[0])?;
                }
            }
            for path in invocation.outputs.iter().chain(invocation.stdout_to.iter()).chain(invocation.stderr_to.iter()) {
                let name = path.file_name().unwrap().to_string_lossy().to_string();
                if path.exists() || skipped.iter().any(|suffix| name.ends_with(suffix)) {
                    continue;
                }
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, self.contents.get(&name).cloned().unwrap_or_else(|| artifact(path)))?;
            }
            Ok(ToolOutput::default())
        };

        self.calls.lock().unwrap().push(Call {
            step: invocation.step,
            program: invocation.program.clone(),
            args: invocation.args.clone(),
            cwd: invocation.cwd.clone(),
            started,
            finished: Instant::now(),
        });
        result
    }
}


const HEADER: &str = "Order,OrderType,LibraryID,fileNames,FastqDir,Reference,Species,resultPaths,Lab";
const INDEX: &str = "id,name,annotation_version\nmm10,Mus musculus,Ens_98\nhg38,Homo sapiens,Ens_104\n";

struct Fixture {
    root: tempfile::TempDir,
}

impl Fixture {
    /// `rows` are (library, genome, order type).
    fn new(rows: &[(&str, &str, &str)]) -> Result<Self> {
        let root = tempfile::tempdir()?;
        let fastq = root.path().join("fastq");
        std::fs::create_dir_all(&fastq)?;
        std::fs::write(root.path().join("index.csv"), INDEX)?;

        let mut manifest = format!("{}\n", HEADER);
        for (lib, genome, order_type) in rows {
            std::fs::write(fastq.join(format!("{}_S1_R1_001.fastq.gz", lib)), b"@r1\n")?;
            std::fs::write(fastq.join(format!("{}_S1_R2_001.fastq.gz", lib)), b"@r2\n")?;
            manifest.push_str(&format!(
                "MOLNG-1,{},{},{},{},{},Mus musculus,{},Smith Lab\n",
                order_type,
                lib,
                lib,
                fastq.display(),
                genome,
                root.path().join("results").join("MOLNG-1").display()
            ));
        }
        std::fs::write(root.path().join("driver.csv"), manifest)?;
        Ok(Fixture { root })
    }

    fn path(&self) -> &Path {
        self.root.path()
    }

    fn out(&self) -> PathBuf {
        self.path().join("out")
    }

    fn result_path(&self) -> PathBuf {
        self.path().join("results").join("MOLNG-1")
    }

    fn config(&self, extra: &[&str]) -> Arc<RunConfig> {
        let manifest = self.path().join("driver.csv").to_string_lossy().to_string();
        let mut argv = vec!["--manifest", manifest.as_str()];
        argv.extend_from_slice(extra);
        self.config_built_manifest(&argv)
    }

    /// No `--manifest`: the prelude builds one.
    fn config_built_manifest(&self, extra: &[&str]) -> Arc<RunConfig> {
        let out = self.out().to_string_lossy().to_string();
        let index = self.path().join("index.csv").to_string_lossy().to_string();
        let fcpath = self.path().join("230919_VH00629_133_AAC7NV3HV").to_string_lossy().to_string();
        let mut argv = vec![
            "prime-pipelines",
            "--fcpath", fcpath.as_str(),
            "--out", out.as_str(),
            "--index_samplesheet", index.as_str(),
            "--threads", "8",
        ];
        argv.extend_from_slice(extra);
        let args = Arguments::parse_from(argv);
        Arc::new(RunConfig::from_args(&args, self.path().to_path_buf(), 4).unwrap())
    }

    fn with_fastq_dir(&self) -> String {
        self.path().join("fastq").to_string_lossy().to_string()
    }
}


#[tokio::test]
async fn test_three_rows_with_genome_override() -> Result<()> {
    let fx = Fixture::new(&[("L001", "NA", "RNA-Seq"), ("L002", "NA", "RNA-Seq"), ("L003", "xx1", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::default());
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str(), "--genome", "mm10"]), Arc::clone(&runner))?;

    let outcome = pipeline.run().await?;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.rows, 3);
    assert_eq!(
        outcome.transitions,
        vec![RunState::Resolving, RunState::Classifying, RunState::Executing, RunState::Reporting, RunState::Done]
    );
    assert!(runner.programs().iter().all(|p| p != "bcl-convert"));
    assert_eq!(runner.count(StepKind::Demultiplex), 0);
    assert_eq!(runner.count(StepKind::Align), 6); // bowtie2 + samtools sort per row
    assert_eq!(runner.count(StepKind::BamStats), 3);
    assert_eq!(runner.count(StepKind::Flagstat), 3);
    assert_eq!(runner.count(StepKind::FastQc), 3);
    assert_eq!(runner.count(StepKind::MultiQc), 1);
    assert_eq!(runner.count(StepKind::SampleReport), 1);
    assert!(runner.calls().iter().any(|c| c.program.ends_with("Prime_SampleReport_Make.py")));

    let bowtie2: Vec<Call> = runner.calls().into_iter().filter(|c| c.program == "bowtie2").collect();
    assert!(bowtie2.iter().all(|c| c.args.contains(&"-1".to_string()) && c.args.iter().any(|a| a.ends_with("bowtie2/mm10"))));

    let expected = format!("https://webfs/{}/multiqc.html", fx.result_path().to_string_lossy().trim_matches('/'));
    assert_eq!(outcome.link.as_deref(), Some(expected.as_str()));
    assert!(fx.result_path().join("multiqc.html").exists());
    assert!(fx.result_path().join("Prime_Sample_Report.csv").exists());
    assert!(fx.out().join("qc").join("L002_bamstats.txt").exists());
    // sam files are intermediate
    assert!(!fx.out().join("samples").join("L001").join("L001.sam").exists());
    Ok(())
}

#[tokio::test]
async fn test_mixed_references_with_demultiplexing() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq"), ("L002", "NA", "RNA-Seq")])?;
    let runner = Arc::new(RecordingRunner::default());
    let pipeline = Pipeline::new(fx.config(&[]), Arc::clone(&runner))?;

    let outcome = pipeline.run().await?;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(runner.count(StepKind::Demultiplex), 1);
    let demux_finished = runner.calls().iter().find(|c| c.step == StepKind::Demultiplex).unwrap().finished;
    assert!(runner.calls().iter().filter(|c| c.step != StepKind::Demultiplex).all(|c| c.started >= demux_finished));

    // L001 aligns, L002 only copies and runs FastQC.
    let bowtie2: Vec<Call> = runner.calls().into_iter().filter(|c| c.program == "bowtie2").collect();
    assert_eq!(bowtie2.len(), 1);
    assert!(bowtie2[0].args.iter().any(|a| a.contains("L001_S1_R1_001")));
    assert_eq!(runner.count(StepKind::FastQc), 2);
    assert!(fx.result_path().join("L002_S1_R1_001.fastq.gz").exists());
    assert!(!fx.result_path().join("L001_S1_R1_001.fastq.gz").exists());
    assert!(runner.calls().iter().any(|c| c.program.ends_with("Prime_SampleReport_Make.py")));

    let driver = std::fs::read_to_string(fx.out().join("report").join("PRIME_driver.csv"))?;
    let lines: Vec<&str> = driver.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].ends_with("referenceStatus,genomeVersionUsed,annotationUsed,bam,bamstats,flagstat,fastqc"));
    assert!(lines[1].contains("mm10,Ens_98"));
    assert!(lines[1].contains("L001.bam"));
    assert!(lines[2].contains("No reference genome available,NA-NotCalculated,NA-NotCalculated,NA-NotCalculated"));
    assert!(outcome.link.is_some());
    Ok(())
}

#[tokio::test]
async fn test_all_rows_without_reference_use_no_ref_report() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq"), ("L002", "mm10", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::default());
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str(), "--only_cp_fastq"]), Arc::clone(&runner))?;

    pipeline.run().await?;

    assert!(runner.programs().iter().all(|p| p != "bowtie2"));
    assert!(runner.calls().iter().any(|c| c.program.ends_with("no_Ref_SampleReport_Make.py")));
    assert!(fx.result_path().join("L001_S1_R2_001.fastq.gz").exists());
    Ok(())
}

#[tokio::test]
async fn test_per_run_classification_on_nextseq() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq"), ("L002", "NA", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::default());
    let config = fx.config(&["--fastq_dir", fastq_dir.as_str(), "--machine_type", "nextseq2k"]);
    let pipeline = Pipeline::new(config, Arc::clone(&runner))?;

    pipeline.run().await?;

    // One row without a reference downgrades the whole run.
    assert_eq!(runner.count(StepKind::Align), 0);
    // The rename script still runs after the (skipped) manifest builder.
    assert_eq!(runner.count(StepKind::RenameFastq), 1);
    assert_eq!(runner.count(StepKind::BuildManifest), 0);
    Ok(())
}

#[tokio::test]
async fn test_tenx_capture_runs_cellranger() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "10x_scRNA-Seq_NextGEM")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::default());
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str(), "--run_type", "10X"]), Arc::clone(&runner))?;

    pipeline.run().await?;

    let cellranger: Vec<Call> = runner.calls().into_iter().filter(|c| c.program == "cellranger").collect();
    assert_eq!(cellranger.len(), 1);
    assert_eq!(cellranger[0].args[0], "count");
    assert!(cellranger[0].args.iter().any(|a| a.ends_with("annotation/Ens_98/10x/cellranger")));
    assert_eq!(runner.count(StepKind::Align), 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_manifest() -> Result<()> {
    let fx = Fixture::new(&[])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::default());
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str()]), Arc::clone(&runner))?;

    let outcome = pipeline.run().await?;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.rows, 0);
    assert!(outcome.link.is_none());
    assert_eq!(outcome.transitions, vec![RunState::Resolving, RunState::Classifying, RunState::Done]);
    assert!(runner.calls().is_empty());
    assert!(!fx.out().join("report").join("PRIME_driver.csv").exists());
    Ok(())
}

#[tokio::test]
async fn test_fan_in_waits_for_every_row() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq"), ("L002", "mm10", "RNA-Seq"), ("L003", "NA", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::with_rules(vec![
        Rule::delay("bowtie2", Some("L002"), Duration::from_millis(300)),
        Rule::delay("fastqc", Some("L003"), Duration::from_millis(200)),
    ]));
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str()]), Arc::clone(&runner))?;

    let outcome = pipeline.run().await?;

    let calls = runner.calls();
    let last_row_call = calls
        .iter()
        .filter(|c| c.step.arity() == prime_pipelines::pipelines::graph::Arity::Row)
        .map(|c| c.finished)
        .max()
        .unwrap();
    let fan_in: Vec<&Call> = calls.iter().filter(|c| c.step == StepKind::MultiQc || c.step == StepKind::SampleReport).collect();
    assert_eq!(fan_in.len(), 2);
    assert!(fan_in.iter().all(|c| c.started >= last_row_call));

    let aggregate = outcome.aggregate.unwrap();
    assert!(aggregate.branches.iter().all(|b| b.finished_at <= aggregate.opened_at));
    assert!(outcome.fan_in.iter().all(|r| r.started >= aggregate.opened_at));
    // Stats only start after alignment finished for that row.
    for branch in &aggregate.branches {
        if let Some(align) = branch.results.iter().find(|r| r.kind == StepKind::Align) {
            let stats = branch.results.iter().find(|r| r.kind == StepKind::BamStats).unwrap();
            assert!(stats.started >= align.finished);
        }
    }
    Ok(())
}

#[tokio::test]
async fn test_multiqc_retry_is_idempotent() -> Result<()> {
    let rows = [("L001", "mm10", "RNA-Seq"), ("L002", "NA", "RNA-Seq")];

    let clean = Fixture::new(&rows)?;
    let clean_fastq = clean.with_fastq_dir();
    let clean_runner = Arc::new(RecordingRunner::default());
    Pipeline::new(clean.config(&["--fastq_dir", clean_fastq.as_str()]), clean_runner)?.run().await?;

    let flaky = Fixture::new(&rows)?;
    let flaky_fastq = flaky.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::with_rules(vec![
        Rule::fail("multiqc", None, 2),
        Rule::fail("Prime_SampleReport_Make.py", None, 5),
    ]));
    let outcome = Pipeline::new(flaky.config(&["--fastq_dir", flaky_fastq.as_str()]), Arc::clone(&runner))?.run().await?;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(runner.count(StepKind::MultiQc), 3);
    assert_eq!(runner.count(StepKind::SampleReport), 6);
    for name in ["multiqc.html", "Prime_Sample_Report.csv"] {
        assert_eq!(
            std::fs::read(flaky.out().join("report").join(name))?,
            std::fs::read(clean.out().join("report").join(name))?
        );
        assert_eq!(std::fs::read(flaky.result_path().join(name))?, artifact(Path::new(name)).into_bytes());
    }
    Ok(())
}

#[tokio::test]
async fn test_retry_exhaustion_fails_run() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::with_rules(vec![Rule::fail("multiqc", None, u32::MAX)]));
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str()]), Arc::clone(&runner))?;

    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(err, PipelineError::ExternalToolFailure { .. }));
    assert_eq!(runner.count(StepKind::MultiQc), 6);
    assert!(!fx.result_path().join("multiqc.html").exists());
    Ok(())
}

#[tokio::test]
async fn test_row_failure_cancels_other_rows() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq"), ("L002", "mm10", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::with_rules(vec![
        Rule::delay("bowtie2", Some("L001"), Duration::from_secs(30)),
        Rule::fail("bowtie2", Some("L002"), u32::MAX),
    ]));
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str()]), Arc::clone(&runner))?;

    let started = Instant::now();
    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(err, PipelineError::ExternalToolFailure { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    // Align is fail-fast: one attempt only.
    assert_eq!(runner.calls().iter().filter(|c| c.program == "bowtie2").count(), 1);
    assert_eq!(runner.count(StepKind::MultiQc), 0);
    assert_eq!(runner.count(StepKind::BamStats), 0);
    Ok(())
}

#[tokio::test]
async fn test_malformed_manifest_fails_before_any_row() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq")])?;
    std::fs::write(fx.path().join("driver.csv"), "Order,LibraryID\nMOLNG-1,L001\n")?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::default());
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str()]), Arc::clone(&runner))?;

    let err = pipeline.run().await.unwrap_err();

    assert!(matches!(err, PipelineError::MalformedManifest { .. }));
    assert!(runner.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_missing_alignment_log_fails_row() -> Result<()> {
    let fx = Fixture::new(&[("L001", "mm10", "RNA-Seq")])?;
    let fastq_dir = fx.with_fastq_dir();
    let runner = Arc::new(RecordingRunner::with_rules(vec![Rule::skip_output("bowtie2", ".log")]));
    let pipeline = Pipeline::new(fx.config(&["--fastq_dir", fastq_dir.as_str()]), Arc::clone(&runner))?;

    let err = pipeline.run().await.unwrap_err();

    match err {
        PipelineError::StepOutputMissing { step, path } => {
            assert_eq!(step, StepKind::Align.to_string());
            assert!(path.ends_with("L001.log"), "{:?}", path);
        }
        other => panic!("expected StepOutputMissing, got {:?}", other),
    }
    // samtools sort never starts on an alignment without its log.
    assert!(runner.programs().iter().all(|p| p != "samtools"));
    Ok(())
}

#[tokio::test]
async fn test_aviti_builds_samplesheet_from_lims_export() -> Result<()> {
    let fx = Fixture::new(&[])?;
    let fastq = fx.path().join("fastq");
    for name in ["L63060_R1.fastq.gz", "L63060_R2.fastq.gz"] {
        std::fs::write(fastq.join(name), b"@r\n")?;
    }
    let samplesheet = format!(
        "libID,genomeVersion,speciesName,orderType,resultPaths,requestingDepartment,prnOrderNo,requester,annotation\n\
L63060,mm10,Mus musculus,RNA-Seq,{},Smith,MOLNG-1,jdoe,Ens_98\n",
        fx.result_path().display()
    );
    let runner = Arc::new(RecordingRunner::with_contents(&[("samplesheet.csv", samplesheet.as_str())]));
    let fastq_dir = fx.with_fastq_dir();
    let config = fx.config_built_manifest(&["--fastq_dir", fastq_dir.as_str(), "--machine_type", "aviti"]);
    let pipeline = Pipeline::new(config, Arc::clone(&runner))?;

    let outcome = pipeline.run().await?;

    assert_eq!(outcome.state, RunState::Done);
    assert_eq!(outcome.rows, 1);

    // One rename per fastq, run inside the fastq directory.
    let renames: Vec<Call> = runner.calls().into_iter().filter(|c| c.step == StepKind::RenameFastq).collect();
    assert_eq!(renames.len(), 2);
    assert_eq!(renames[0].args, vec!["-f".to_string(), "L63060_R1.fastq.gz".to_string()]);
    assert_eq!(renames[1].args, vec!["-f".to_string(), "L63060_R2.fastq.gz".to_string()]);
    assert!(renames.iter().all(|c| c.program.ends_with("Aviti_name_change.py") && c.cwd.as_deref() == Some(fastq.as_path())));
    assert!(fastq.join("L63060_S1_L001_R1_001.fastq.gz").exists());
    assert!(!fastq.join("L63060_R1.fastq.gz").exists());

    let builders: Vec<Call> = runner.calls().into_iter().filter(|c| c.step == StepKind::BuildManifest).collect();
    assert_eq!(builders.len(), 2);
    assert!(builders[0].program.ends_with("Aviti_lims_json_Make_V2.py"));
    assert_eq!(builders[0].args[..2], ["--fcid".to_string(), "AAC7NV3HV".to_string()]);
    assert!(builders[1].program.ends_with("Aviti_samplesheet_Make.py"));
    assert_eq!(builders[1].args[0], "--lims_info_table");
    assert!(builders[1].args[1].ends_with("lims_info.csv"));
    assert_eq!(builders[1].args[2], "--RoboIndex_samplesheet");
    assert_eq!(builders[1].args.len(), 4);
    assert!(builders.iter().all(|c| c.cwd.as_deref() == Some(fx.out().as_path())));
    let renames_done = renames.iter().map(|c| c.finished).max().unwrap();
    assert!(builders.iter().all(|c| c.started >= renames_done));

    let bowtie2: Vec<Call> = runner.calls().into_iter().filter(|c| c.program == "bowtie2").collect();
    assert_eq!(bowtie2.len(), 1);
    assert!(bowtie2[0].args.iter().any(|a| a.ends_with("L63060_S1_L001_R1_001.fastq.gz")));
    assert!(bowtie2[0].args.iter().any(|a| a.ends_with("L63060_S1_L001_R2_001.fastq.gz")));
    Ok(())
}

#[tokio::test]
async fn test_aviti_lims_info_override_skips_export() -> Result<()> {
    let fx = Fixture::new(&[])?;
    let samplesheet =
        "libID,genomeVersion,speciesName,orderType,resultPaths,requestingDepartment,prnOrderNo,requester,annotation\n";
    let lims_info = fx.path().join("lims_info.csv");
    std::fs::write(&lims_info, "libID,analysisGoals\n")?;
    let lims_info = lims_info.to_string_lossy().to_string();
    let runner = Arc::new(RecordingRunner::with_contents(&[("samplesheet.csv", samplesheet)]));
    let fastq_dir = fx.with_fastq_dir();
    let config = fx.config_built_manifest(&[
        "--fastq_dir", fastq_dir.as_str(),
        "--machine_type", "aviti",
        "--lims_info", lims_info.as_str(),
    ]);

    let outcome = Pipeline::new(config, Arc::clone(&runner))?.run().await?;

    assert_eq!(outcome.rows, 0);
    assert_eq!(runner.count(StepKind::RenameFastq), 0);
    let builders: Vec<Call> = runner.calls().into_iter().filter(|c| c.step == StepKind::BuildManifest).collect();
    assert_eq!(builders.len(), 1);
    assert_eq!(builders[0].args[1], lims_info);
    Ok(())
}
