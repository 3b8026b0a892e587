// src/lib.rs
pub mod config;
pub mod utils;
pub mod pipelines;
pub mod cli;
pub use cli::{Arguments, MachineType, Module, RunType};
pub use config::defs::{PipelineError, RunConfig};
pub use pipelines::executor::{Pipeline, RunOutcome, RunState};
pub use utils::streams::{ProcessRunner, ToolInvocation, ToolOutput, ToolRunner};
