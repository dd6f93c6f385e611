use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum, builder::{Styles, styling::{AnsiColor, Effects}}, crate_description, crate_name, crate_version};
use clap_complete::Shell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DecompileModeCli {
    Source,
    Disasm,
    Ast,
}

#[derive(Parser)]
#[command(name = crate_name!(),
    bin_name = "dedso",
    version = crate_version!(),
    about = crate_description!(),
    styles = Styles::styled()
        .header(AnsiColor::BrightGreen.on_default() | Effects::BOLD | Effects::UNDERLINE)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Cyan.on_default()))]
pub struct Cli {
    /// More log output (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Option<TopLevel>,
}

#[derive(Subcommand)]
pub enum TopLevel {
    /// Decompiles Torque DSO files
    Decompile {
        #[command(subcommand)]
        command: DecompileCommand,
    },
    /// Generate shell completion
    Completion {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug, Clone)]
pub struct DecodeArgs {
    /// Output mode
    #[arg(long, value_enum, default_value_t = DecompileModeCli::Source)]
    pub mode: DecompileModeCli,

    /// JSON array of opcode names in numeric order, for engines with a shuffled opcode table
    #[arg(long, value_name = "MAP.json")]
    pub opcodes: Option<PathBuf>,

    /// Decode files whose version word does not match the expected DSO version
    #[arg(long, default_value_t = false)]
    pub allow_version_mismatch: bool,
}

#[derive(Subcommand)]
pub enum DecompileCommand {
    /// Decompiles a single DSO file
    File {
        /// Path to the DSO file
        path: PathBuf,

        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        decode: DecodeArgs,
    },
    /// Decompiles every *.dso file under a directory, writing each result next to its input
    Dir {
        /// Directory to search recursively
        path: PathBuf,

        #[command(flatten)]
        decode: DecodeArgs,
    },
}
