// src/utils/streams.rs
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::config::defs::PipelineError;
use crate::pipelines::graph::StepKind;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}


/// One external tool call, fully resolved: program, arguments, redirections,
/// and the artifacts the call is declared to produce.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub step: StepKind,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdout_to: Option<PathBuf>,
    pub stderr_to: Option<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl ToolInvocation {
    pub fn new(step: StepKind, program: impl Into<String>, args: Vec<String>) -> Self {
        ToolInvocation {
            step,
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
            stdout_to: None,
            stderr_to: None,
            outputs: Vec::new(),
        }
    }

    pub fn cwd(mut self, dir: PathBuf) -> Self {
        self.cwd = Some(dir);
        self
    }

    pub fn stdout_to(mut self, path: PathBuf) -> Self {
        self.stdout_to = Some(path);
        self
    }

    pub fn stderr_to(mut self, path: PathBuf) -> Self {
        self.stderr_to = Some(path);
        self
    }

    pub fn outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn command_line(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}


/// Captured output of a finished tool. Redirected streams are not captured.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}


/// Runs external tools. The executor only ever talks to tools through this trait.
pub trait ToolRunner: Send + Sync + 'static {
    fn run(
        &self,
        invocation: &ToolInvocation,
    ) -> impl Future<Output = Result<ToolOutput, PipelineError>> + Send;
}


/// Spawns each invocation as a subprocess. Children are killed when their
/// future is dropped, so aborting a row task also stops its tools.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, PipelineError> {
        debug!("Spawning: {}", invocation.command_line());

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }
        match &invocation.stdout_to {
            Some(path) => { cmd.stdout(Stdio::from(std::fs::File::create(path)?)); }
            None => { cmd.stdout(Stdio::piped()); }
        }
        match &invocation.stderr_to {
            Some(path) => { cmd.stderr(Stdio::from(std::fs::File::create(path)?)); }
            None => { cmd.stderr(Stdio::piped()); }
        }

        let mut child = cmd.spawn().map_err(|e| PipelineError::ToolSpawn {
            tool: invocation.program.clone(),
            error: e.to_string(),
        })?;

        // Drain both pipes concurrently with wait() so a chatty tool cannot block on a full pipe.
        let stdout_task = child.stdout.take().map(|out| tokio::spawn(collect_lines(out)));
        let stderr_task = child.stderr.take().map(|err| tokio::spawn(collect_lines(err)));

        let status = child.wait().await?;

        let stdout = join_lines(stdout_task).await?;
        let mut stderr = join_lines(stderr_task).await?;
        if stderr.is_empty() {
            if let Some(path) = &invocation.stderr_to {
                if !status.success() {
                    stderr = tokio::fs::read_to_string(path)
                        .await
                        .map(|s| s.lines().map(String::from).collect())
                        .unwrap_or_default();
                }
            }
        }

        if !status.success() {
            let tail_start = stderr.len().saturating_sub(STDERR_TAIL_LINES);
            return Err(PipelineError::ExternalToolFailure {
                tool: invocation.program.clone(),
                code: status.code(),
                stderr: stderr[tail_start..].join("\n"),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}


async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> std::io::Result<Vec<String>> {
    LinesStream::new(BufReader::new(reader).lines())
        .collect::<std::io::Result<Vec<String>>>()
        .await
}

async fn join_lines(
    task: Option<tokio::task::JoinHandle<std::io::Result<Vec<String>>>>,
) -> Result<Vec<String>, PipelineError> {
    match task {
        Some(handle) => Ok(handle
            .await
            .map_err(|e| PipelineError::TaskJoin(e.to_string()))??),
        None => Ok(Vec::new()),
    }
}


/// Reads all lines of a child's stdout or stderr.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to read.
///
/// # Returns
/// Vec of lines.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let lines = match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not piped"))?;
            collect_lines(out).await?
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not piped"))?;
            collect_lines(err).await?
        }
    };
    Ok(lines)
}
