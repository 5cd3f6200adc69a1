// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Logging initialization for hyprlofs binaries.
//!
//! Output goes to stderr by default so that command output on stdout stays
//! machine-readable, or to a file when `--log-file` / `--log-dir` is given.
//! `RUST_LOG` overrides the level chosen on the command line.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

pub use clap;
pub use tracing::Level;

/// Output format for log messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable plaintext format
    #[default]
    Plaintext,
    /// Structured JSON format, one object per line
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Plaintext => write!(f, "plaintext"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "plaintext" => Ok(LogFormat::Plaintext),
            "json" => Ok(LogFormat::Json),
            _ => Err(format!(
                "Invalid log format: {}. Use 'plaintext' or 'json'",
                s
            )),
        }
    }
}

/// Log level accepted on the command line
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CliLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for Level {
    fn from(level: CliLogLevel) -> Self {
        match level {
            CliLogLevel::Error => Level::ERROR,
            CliLogLevel::Warn => Level::WARN,
            CliLogLevel::Info => Level::INFO,
            CliLogLevel::Debug => Level::DEBUG,
            CliLogLevel::Trace => Level::TRACE,
        }
    }
}

impl std::fmt::Display for CliLogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&Level::from(*self).as_str().to_lowercase())
    }
}

/// Logging flags shared by every hyprlofs binary. Flatten into a clap parser
/// with `#[command(flatten)]`.
#[derive(Clone, Debug, Default, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CliLoggingArgs {
    /// Log verbosity level (default: info)
    #[arg(long, value_enum, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<CliLogLevel>,

    /// Log output format (default: plaintext)
    #[arg(long, value_enum, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_format: Option<LogFormat>,

    /// Directory for log files
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    /// Log file name or path; relative paths are resolved against --log-dir
    #[arg(long, global = true)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl CliLoggingArgs {
    /// Install the global subscriber: stderr unless a log file or directory
    /// was requested.
    pub fn init(&self, component: &str) -> anyhow::Result<()> {
        self.init_with_default_level(component, CliLogLevel::Info)
    }

    pub fn init_with_default_level(
        &self,
        component: &str,
        default_level: CliLogLevel,
    ) -> anyhow::Result<()> {
        let level = self.log_level.unwrap_or(default_level).into();
        let format = self.log_format.unwrap_or_default();
        if self.logs_to_file() {
            init_to_file(component, level, format, &self.resolve_log_path(component))
        } else {
            init(component, level, format)
        }
    }

    pub fn logs_to_file(&self) -> bool {
        self.log_file.is_some() || self.log_dir.is_some()
    }

    /// Where file logging writes for `component`:
    /// an absolute `log_file` wins, a relative one is joined to `log_dir`,
    /// and a missing one becomes `<component>.log` in `log_dir` or the
    /// platform log directory.
    pub fn resolve_log_path(&self, component: &str) -> PathBuf {
        match (&self.log_file, &self.log_dir) {
            (Some(file), _) if file.is_absolute() => file.clone(),
            (Some(file), Some(dir)) => dir.join(file),
            (Some(file), None) => file.clone(),
            (None, Some(dir)) => dir.join(format!("{component}.log")),
            (None, None) => standard_log_path(component),
        }
    }
}

/// Platform log location for `component`:
/// `~/Library/Logs/hyprlofs/` on macOS, the user data directory elsewhere.
pub fn standard_log_path(component: &str) -> PathBuf {
    #[cfg(target_os = "macos")]
    let base = dirs::home_dir().map(|home| home.join("Library").join("Logs"));
    #[cfg(not(target_os = "macos"))]
    let base = dirs::data_dir().or_else(dirs::home_dir);

    base.unwrap_or_else(std::env::temp_dir)
        .join("hyprlofs")
        .join(format!("{component}.log"))
}

/// Filter used when `RUST_LOG` is unset.
pub fn env_filter(component: &str, default_level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},{}={}", default_level, component, default_level))
    })
}

/// Build a subscriber writing `format` to `writer` through `filter`, without
/// installing it.
pub fn subscriber<W>(filter: EnvFilter, format: LogFormat, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    match format {
        LogFormat::Json => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).json();
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            Box::new(tracing_subscriber::registry().with(filter).with(layer))
        }
        LogFormat::Plaintext => {
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            #[cfg(debug_assertions)]
            let layer = layer.with_file(true).with_line_number(true);
            Box::new(tracing_subscriber::registry().with(filter).with(layer))
        }
    }
}

/// Log to stderr.
pub fn init(component: &str, default_level: Level, format: LogFormat) -> anyhow::Result<()> {
    init_with_writer(component, default_level, format, io::stderr)
}

/// Log to `log_path`, creating parent directories and appending to an
/// existing file.
pub fn init_to_file(
    component: &str,
    default_level: Level,
    format: LogFormat,
    log_path: &Path,
) -> anyhow::Result<()> {
    let log_file = open_log_file(log_path)?;
    init_with_writer(component, default_level, format, Mutex::new(log_file))
}

/// Open `log_path` for appending, creating it and its parent directories.
pub fn open_log_file(log_path: &Path) -> io::Result<fs::File> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::OpenOptions::new().create(true).append(true).open(log_path)
}

pub fn init_with_writer<W>(
    component: &str,
    default_level: Level,
    format: LogFormat,
    writer: W,
) -> anyhow::Result<()>
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let subscriber = subscriber(env_filter(component, default_level), format, writer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, MutexGuard};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    struct BufferGuard<'a>(MutexGuard<'a, Vec<u8>>);

    impl Write for BufferGuard<'_> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = BufferGuard<'a>;

        fn make_writer(&'a self) -> Self::Writer {
            BufferGuard(self.0.lock().unwrap())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[test]
    fn json_events_carry_structured_fields() {
        let buffer = Buffer::default();
        let subscriber = subscriber(EnvFilter::new("info"), LogFormat::Json, buffer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(operation = "mount", mountpoint = "/vfs", "hyprlofs mount");
            tracing::debug!(operation = "filtered", "below the filter");
        });

        let output = buffer.contents();
        let lines: Vec<_> = output.lines().collect();
        assert_eq!(lines.len(), 1, "unexpected output: {output}");
        let event: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(event["level"], "INFO");
        assert_eq!(event["fields"]["operation"], "mount");
        assert_eq!(event["fields"]["mountpoint"], "/vfs");
        assert_eq!(event["fields"]["message"], "hyprlofs mount");
    }

    #[test]
    fn plaintext_events_are_uncolored() {
        let buffer = Buffer::default();
        let subscriber = subscriber(EnvFilter::new("trace"), LogFormat::Plaintext, buffer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::trace!(operation = "channel_open", "hyprlofs open");
        });
        let output = buffer.contents();
        assert!(output.contains("TRACE"));
        assert!(output.contains("operation=\"channel_open\""));
        assert!(!output.contains('\x1b'));
    }

    #[test]
    fn log_path_resolution() {
        let dir = PathBuf::from("/var/log/hyprlofs");
        let args = CliLoggingArgs {
            log_dir: Some(dir.clone()),
            ..Default::default()
        };
        assert!(args.logs_to_file());
        assert_eq!(args.resolve_log_path("hyprlofsctl"), dir.join("hyprlofsctl.log"));

        let args = CliLoggingArgs {
            log_dir: Some(dir.clone()),
            log_file: Some(PathBuf::from("admin/run.log")),
            ..Default::default()
        };
        assert_eq!(args.resolve_log_path("hyprlofsctl"), dir.join("admin/run.log"));

        let args = CliLoggingArgs {
            log_dir: Some(dir),
            log_file: Some(PathBuf::from("/tmp/elsewhere.log")),
            ..Default::default()
        };
        assert_eq!(
            args.resolve_log_path("hyprlofsctl"),
            PathBuf::from("/tmp/elsewhere.log")
        );

        let args = CliLoggingArgs::default();
        assert!(!args.logs_to_file());
        let path = args.resolve_log_path("hyprlofsctl");
        assert!(path.ends_with("hyprlofs/hyprlofsctl.log"));
    }

    #[test]
    fn levels_and_formats_parse_and_display() {
        assert_eq!(Level::from(CliLogLevel::Warn), Level::WARN);
        assert_eq!(CliLogLevel::default(), CliLogLevel::Info);
        assert_eq!(CliLogLevel::Trace.to_string(), "trace");
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default().to_string(), "plaintext");
    }

    #[test]
    fn file_logging_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hyprlofsctl.log");
        let file = open_log_file(&path).unwrap();
        let subscriber = subscriber(EnvFilter::new("info"), LogFormat::Json, Mutex::new(file));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(operation = "unmount", "hyprlofs umount");
        });
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"operation\":\"unmount\""));
    }
}
