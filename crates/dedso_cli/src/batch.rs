use std::error::Error;
use std::path::{Path, PathBuf};

use console::style;
use dedso_lib::{DecompileMode, DecompileOptions};
use indicatif::{ProgressBar, ProgressStyle};

pub type CliResult<T> = Result<T, Box<dyn Error>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

pub fn decompile_file(path: &Path, options: &DecompileOptions) -> CliResult<String> {
    let bytes = std::fs::read(path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    Ok(dedso_lib::decompile_with_options(&bytes, options)?)
}

/// `foo.cs.dso` -> `foo.cs`; AST output gets a `.json` suffix instead.
pub fn output_path(path: &Path, mode: DecompileMode) -> PathBuf {
    let stripped = path.with_extension("");
    match mode {
        DecompileMode::Source => stripped,
        DecompileMode::Disasm => path.with_extension("dso.txt"),
        DecompileMode::Ast => path.with_extension("dso.json"),
    }
}

fn find_inputs(dir: &Path) -> CliResult<Vec<PathBuf>> {
    let pattern = dir.join("**").join("*.dso");
    let mut paths = Vec::new();
    for entry in glob::glob(&pattern.to_string_lossy())? {
        match entry {
            Ok(p) if p.is_file() => paths.push(p),
            Ok(_) => {}
            Err(e) => log::warn!("skipping {}: {}", e.path().display(), e.error()),
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn decompile_dir(dir: &Path, options: &DecompileOptions) -> CliResult<BatchSummary> {
    let paths = find_inputs(dir)?;
    log::info!("found {} DSO files under {}", paths.len(), dir.display());

    let bar = ProgressBar::new(paths.len() as u64);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}")?
            .progress_chars("=> "),
    );

    let mut summary = BatchSummary::default();
    for path in &paths {
        bar.set_message(path.display().to_string());
        let result = decompile_file(path, options).and_then(|out| {
            let dest = output_path(path, options.mode);
            std::fs::write(&dest, out).map_err(|e| format!("failed to write {}: {e}", dest.display()))?;
            Ok(dest)
        });
        match result {
            Ok(dest) => {
                summary.succeeded += 1;
                log::debug!("{} -> {}", path.display(), dest.display());
            }
            Err(e) => {
                summary.failed += 1;
                bar.suspend(|| eprintln!("{} {}: {e}", style("failed").for_stderr().red().bold(), path.display()));
            }
        }
        bar.inc(1);
    }
    bar.finish_and_clear();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_path_strips_binary_extension() {
        assert_eq!(output_path(Path::new("a/b/main.cs.dso"), DecompileMode::Source), PathBuf::from("a/b/main.cs"));
        assert_eq!(output_path(Path::new("x.dso"), DecompileMode::Ast), PathBuf::from("x.dso.json"));
        assert_eq!(output_path(Path::new("x.dso"), DecompileMode::Disasm), PathBuf::from("x.dso.txt"));
    }
}
