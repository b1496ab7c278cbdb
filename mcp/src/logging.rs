use std::path::Path;

use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, writer::BoxMakeWriter};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str =
    "mcp_host_evals=info,host_evals_core=info,host_evals_mcp_runtime=info,host_evals_api=info,tower_http=info";

/// Rotated files kept per log.
const MAX_LOG_FILES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    /// stdout carries the protocol, so logs must stay off it.
    Stderr,
}

/// `runtime.log` receives everything, `error.log` only errors. Both rotate
/// daily.
pub struct LogFiles {
    runtime: RollingFileAppender,
    errors: RollingFileAppender,
}

impl LogFiles {
    pub fn open(dir: &Path) -> Result<Self, InitError> {
        Ok(Self {
            runtime: appender(dir, "runtime")?,
            errors: appender(dir, "error")?,
        })
    }
}

fn appender(dir: &Path, prefix: &str) -> Result<RollingFileAppender, InitError> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
}

/// Structured JSON logging, filtered by `RUST_LOG`. With `log_dir`, logs are
/// also written to rotating files there; if the files cannot be opened the
/// console keeps working and a warning is logged.
pub fn init(target: LogTarget, log_dir: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());

    let console = match target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };
    let mut layers = vec![fmt::layer().json().with_writer(console).boxed()];

    let mut unavailable = None;
    if let Some(dir) = log_dir {
        match LogFiles::open(dir) {
            Ok(LogFiles { runtime, errors }) => {
                layers.push(fmt::layer().json().with_ansi(false).with_writer(runtime).boxed());
                layers.push(
                    fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(errors)
                        .with_filter(LevelFilter::ERROR)
                        .boxed(),
                );
            }
            Err(err) => unavailable = Some((dir, err)),
        }
    }

    tracing_subscriber::registry().with(layers).with(filter).init();

    if let Some((dir, err)) = unavailable {
        tracing::warn!(
            event = "file_logging_disabled",
            dir = %dir.display(),
            error = %err,
            "Could not open log files, logging to the console only"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("mcp-host-evals-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn log_files_are_created_in_the_directory() {
        let dir = scratch_dir("logs");
        LogFiles::open(&dir).expect("appenders");

        let names: Vec<String> = std::fs::read_dir(&dir)
            .expect("log dir")
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name.starts_with("runtime.") && name.ends_with(".log")), "{names:?}");
        assert!(names.iter().any(|name| name.starts_with("error.") && name.ends_with(".log")), "{names:?}");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unusable_directory_is_reported() {
        let dir = scratch_dir("blocked");
        std::fs::write(&dir, b"not a directory").expect("file");
        assert!(LogFiles::open(&dir).is_err());
        let _ = std::fs::remove_file(&dir);
    }
}
