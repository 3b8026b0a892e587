pub mod args;

use clap::Parser;
pub use args::{Arguments, MachineType, Module, RunType};

pub fn parse() -> Arguments {
    Arguments::parse()
}
