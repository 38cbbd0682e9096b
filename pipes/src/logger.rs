use std::fs::{File, OpenOptions};
use std::io::{self, Stdout, Write};
use std::path::Path;

use anyhow::anyhow;
use slog::{o, Drain};

use pipes_conf::logging::To;
use pipes_conf::Log;

use crate::Result;

pub use slog::Logger;

/// Routes `log` records into a `slog` root built from `conf`.
pub fn logger_init(conf: &Log) -> Result<()> {
    let level = conf.level.inner();
    let logger = config_logger(conf.filename(), conf.to, level);
    log::set_boxed_logger(Box::new(LoggerEx(logger))).map_err(|e| anyhow!("logger init failed, {e}"))?;
    log::set_max_level(slog_to_log_level(level).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let location = &slog::RecordLocation {
            file: r.file_static().unwrap_or("<unknown>"),
            line: r.line().unwrap_or_default(),
            column: 0,
            function: "",
            module: r.module_path_static().unwrap_or("<unknown>"),
        };
        let s = slog::RecordStatic { location, level, tag: r.target() };
        self.0.log(&slog::Record::new(&s, r.args(), slog::b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> slog::Level {
    match level {
        log::Level::Trace => slog::Level::Trace,
        log::Level::Debug => slog::Level::Debug,
        log::Level::Info => slog::Level::Info,
        log::Level::Warn => slog::Level::Warning,
        log::Level::Error => slog::Level::Error,
    }
}

fn slog_to_log_level(level: slog::Level) -> log::Level {
    match level {
        slog::Level::Trace => log::Level::Trace,
        slog::Level::Debug => log::Level::Debug,
        slog::Level::Info => log::Level::Info,
        slog::Level::Warning => log::Level::Warn,
        slog::Level::Error | slog::Level::Critical => log::Level::Error,
    }
}

pub fn config_logger(filename: String, to: To, level: slog::Level) -> Logger {
    let decorator = slog_term::PlainDecorator::new(Output::new(filename, to));
    let drain = slog_term::FullFormat::new(decorator)
        .use_custom_timestamp(|w: &mut dyn Write| {
            write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
        })
        .build()
        .fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

/// Writes to the console, the log file, both or nowhere. The file is opened on first write.
struct Output {
    filename: String,
    to: To,
    file: Option<File>,
    console: Stdout,
}

impl Output {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        self.file.as_mut().ok_or_else(|| io::Error::other("log file unavailable"))
    }
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.to {
            To::Console => self.console.write(buf),
            To::File => self.file()?.write(buf),
            To::Both => {
                self.console.write_all(buf)?;
                self.file()?.write(buf)
            }
            To::Off => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.to.console() {
            self.console.flush()?;
        }
        if self.to.file() {
            self.file()?.flush()?;
        }
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    if let Some(dir) = Path::new(filename).parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    OpenOptions::new().create(true).append(true).open(filename).map_err(|e| {
        io::Error::new(e.kind(), format!("logger file config error, filename: {filename}, {e}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_off_swallows() {
        let mut out = Output::new("/nonexistent/dir/pipes.log".into(), To::Off);
        assert_eq!(out.write(b"hello").unwrap(), 5);
        out.flush().unwrap();
    }

    #[test]
    fn test_output_file() {
        let path = std::env::temp_dir().join(format!("pipes-logger-{}.log", std::process::id()));
        let filename = path.to_string_lossy().to_string();
        let mut out = Output::new(filename.clone(), To::File);
        out.write_all(b"line\n").unwrap();
        out.flush().unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("line"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_levels() {
        assert_eq!(slog_to_log_level(slog::Level::Critical), log::Level::Error);
        assert_eq!(log_to_slog_level(log::Level::Warn), slog::Level::Warning);
    }
}
