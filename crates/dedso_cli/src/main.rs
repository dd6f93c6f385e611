use clap::{CommandFactory, Parser};
use console::style;
use dedso_lib::{DecompileMode, DecompileOptions, OpcodeTable};

use crate::batch::CliResult;
use crate::cli::{Cli, DecodeArgs, DecompileCommand, DecompileModeCli, TopLevel};

mod batch;
mod cli;
mod logger;

fn options(args: &DecodeArgs) -> CliResult<DecompileOptions> {
    let mode = match args.mode {
        DecompileModeCli::Source => DecompileMode::Source,
        DecompileModeCli::Disasm => DecompileMode::Disasm,
        DecompileModeCli::Ast => DecompileMode::Ast,
    };
    let opcodes = match &args.opcodes {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
            OpcodeTable::from_json(&json)?
        }
        None => OpcodeTable::tge(),
    };
    Ok(DecompileOptions { mode, allow_version_mismatch: args.allow_version_mismatch, opcodes })
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("{} {e}", style("error:").for_stderr().red().bold());
    std::process::exit(1);
}

fn main() {
    let cli = Cli::parse();
    logger::init(logger::level_for(cli.verbose, cli.quiet));

    match cli.command {
        Some(TopLevel::Decompile { command }) => match command {
            DecompileCommand::File { path, output, decode } => {
                let options = options(&decode).unwrap_or_else(|e| fail(e));
                let out = batch::decompile_file(&path, &options)
                    .unwrap_or_else(|e| fail(format!("{}: {e}", path.display())));
                match output {
                    Some(dest) => {
                        if let Err(e) = std::fs::write(&dest, out) {
                            fail(format!("failed to write {}: {e}", dest.display()));
                        }
                    }
                    None => print!("{out}"),
                }
            }
            DecompileCommand::Dir { path, decode } => {
                let options = options(&decode).unwrap_or_else(|e| fail(e));
                let summary = batch::decompile_dir(&path, &options).unwrap_or_else(|e| fail(e));
                eprintln!(
                    "{} decompiled, {} failed",
                    style(summary.succeeded).for_stderr().green().bold(),
                    style(summary.failed).for_stderr().red().bold()
                );
                if summary.failed > 0 {
                    std::process::exit(1);
                }
            }
        },
        Some(TopLevel::Completion { shell }) => {
            let mut cmd = Cli::command();
            let bin_name = cmd.get_bin_name().unwrap_or("dedso").to_string();
            clap_complete::generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
        }
        None => {
            let _ = Cli::command().print_help();
        }
    }
}
