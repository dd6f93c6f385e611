use console::style;
use log::{Level, LevelFilter, Log, Metadata, Record};

struct ConsoleLogger {
    level: LevelFilter,
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => style("error").for_stderr().red().bold(),
            Level::Warn => style("warn").for_stderr().yellow().bold(),
            Level::Info => style("info").for_stderr().cyan(),
            Level::Debug => style("debug").for_stderr().dim(),
            Level::Trace => style("trace").for_stderr().dim(),
        };
        eprintln!("{tag}: {}", record.args());
    }

    fn flush(&self) {}
}

pub fn level_for(verbose: u8, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::Error,
        (false, 0) => LevelFilter::Warn,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    }
}

/// Installs the stderr logger; later calls are ignored.
pub fn init(level: LevelFilter) {
    let logger: &'static ConsoleLogger = Box::leak(Box::new(ConsoleLogger { level }));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}
