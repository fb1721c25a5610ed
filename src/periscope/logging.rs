use std::{fs, io, path::Path};

use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::periscope::config::LoggingConfig;

#[derive(Debug)]
pub struct LoggingRuntime {
    _guard: WorkerGuard,
}

/// Installs the global tracing subscriber. The returned guard must stay alive
/// for the life of the process or buffered log lines are lost.
///
/// The numeric level maps onto filter directives: 1 shows lifecycle events
/// only, 2 adds per-connection events, 3 adds per-frame detail. `RUST_LOG`
/// overrides the mapping when set.
pub fn init(logging: &LoggingConfig) -> anyhow::Result<LoggingRuntime> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            let directive = match logging.level {
                1 => "info",
                3 => "trace",
                _ => "debug",
            };
            EnvFilter::try_new(directive)
        })
        .context("logging: init filter")?;

    let sink = open_output(logging.output.trim())?;
    let (writer, guard) = tracing_appender::non_blocking(sink);

    let fmt = logging.format.trim().to_ascii_lowercase();
    let base = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(fmt == "text")
        .with_target(true);

    let base = if fmt == "json" {
        base.json().boxed()
    } else {
        base.boxed()
    };

    tracing_subscriber::registry().with(filter).with(base).init();

    Ok(LoggingRuntime { _guard: guard })
}

/// Resolves the configured `output` to a byte sink for the non-blocking
/// appender. Anything that is not a named stream is treated as a log file
/// path and opened append-only.
fn open_output(output: &str) -> anyhow::Result<Box<dyn io::Write + Send>> {
    Ok(match output {
        "" | "stderr" => Box::new(io::stderr()),
        "stdout" => Box::new(io::stdout()),
        "discard" => Box::new(io::sink()),
        path => {
            let path = Path::new(path);
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                fs::create_dir_all(dir)
                    .with_context(|| format!("logging: create log directory {}", dir.display()))?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("logging: open log file {}", path.display()))?;
            Box::new(file)
        }
    })
}
