use std::fs;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::Targets, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

use flowbench::paths;

#[derive(Clone, Copy, Debug)]
pub enum JsonLogFormat {
    Pretty,
    Compact,
}

/// Initializes the tracing subscriber with layered output:
/// 1. Stdout: formatted based on `log_json` and `verbose` flags.
/// 2. File: JSON debug logs to `~/.flowbench/logs/<name>.log` when `log_file` is given.
///
/// Returns a WorkerGuard that must be held by main() to ensure file logs are flushed.
pub fn init(
    verbose: bool,
    log_json: bool,
    json_format: JsonLogFormat,
    log_file: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let registry = tracing_subscriber::registry();
    let stdout_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_env_filter(verbose));

    let (file_layer, guard) = if let Some(name) = log_file {
        let log_dir = paths::logs_dir();
        if let Err(e) = fs::create_dir_all(&log_dir) {
            eprintln!("Warning: Failed to create log dir {:?}: {}", log_dir, e);
            (None, None)
        } else {
            let file_appender = tracing_appender::rolling::daily(&log_dir, format!("{name}.log"));
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer = fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(Targets::new().with_default(tracing::Level::DEBUG));

            (Some(layer), Some(guard))
        }
    } else {
        (None, None)
    };

    let stdout_layer: Box<dyn Layer<Registry> + Send + Sync> = if log_json {
        match json_format {
            JsonLogFormat::Pretty => Box::new(
                fmt::layer()
                    .json()
                    .with_writer(|| PrettyJsonWriter::new(std::io::stdout()))
                    .with_filter(stdout_filter.clone()),
            ),
            JsonLogFormat::Compact => Box::new(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stdout)
                    .with_filter(stdout_filter.clone()),
            ),
        }
    } else if verbose {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stdout_filter.clone()),
        )
    } else {
        Box::new(
            fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_level(true)
                .with_filter(stdout_filter.clone()),
        )
    };

    registry.with(stdout_layer).with(file_layer).init();

    guard
}

struct PrettyJsonWriter<W: std::io::Write> {
    inner: W,
}

impl<W: std::io::Write> PrettyJsonWriter<W> {
    fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: std::io::Write> std::io::Write for PrettyJsonWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(s) = std::str::from_utf8(buf) {
            let trimmed = s.trim();
            if trimmed.starts_with('{')
                && trimmed.ends_with('}')
                && let Ok(val) = serde_json::from_str::<serde_json::Value>(trimmed)
                && serde_json::to_writer_pretty(&mut self.inner, &val).is_ok()
            {
                let _ = self.inner.write(b"\n");
                return Ok(buf.len());
            }
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn default_env_filter(verbose: bool) -> EnvFilter {
    let spec = if verbose {
        "flowbench=debug,info"
    } else {
        "flowbench=info,warn"
    };
    EnvFilter::new(spec)
}
