// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `[log]` section of the cluster file.

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde::Serialize;
use slog::o;
use slog::Drain;
use slog::Level;
use slog::Logger;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "mode")]
pub enum LogConfig {
    #[serde(rename = "stderr-terminal")]
    StderrTerminal { level: LogLevel },

    #[serde(rename = "file")]
    File {
        level: LogLevel,
        path: Utf8PathBuf,
        #[serde(default)]
        if_exists: LogIfExists,
    },
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig::StderrTerminal { level: LogLevel::Info }
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogIfExists {
    Fail,
    Truncate,
    #[default]
    Append,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Level {
        match level {
            LogLevel::Trace => Level::Trace,
            LogLevel::Debug => Level::Debug,
            LogLevel::Info => Level::Info,
            LogLevel::Warn => Level::Warning,
            LogLevel::Error => Level::Error,
            LogLevel::Critical => Level::Critical,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("open log file \"{path}\"")]
pub struct LogInitError {
    path: Utf8PathBuf,
    #[source]
    err: std::io::Error,
}

impl LogConfig {
    pub fn level(&self) -> LogLevel {
        match self {
            LogConfig::StderrTerminal { level } | LogConfig::File { level, .. } => {
                *level
            }
        }
    }

    /// Returns a copy of this configuration logging at `level` instead.
    pub fn with_level(&self, level: LogLevel) -> LogConfig {
        let mut config = self.clone();
        match &mut config {
            LogConfig::StderrTerminal { level: l }
            | LogConfig::File { level: l, .. } => *l = level,
        }
        config
    }

    /// Create the root logger based on the requested configuration.
    pub fn to_logger(&self) -> Result<Logger, LogInitError> {
        match self {
            LogConfig::StderrTerminal { level } => {
                let decorator = slog_term::TermDecorator::new().build();
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }

            LogConfig::File { level, path, if_exists } => {
                let mut open_options = fs_err::OpenOptions::new();
                open_options.write(true).create(true);
                match if_exists {
                    LogIfExists::Fail => {
                        open_options.create_new(true);
                    }
                    LogIfExists::Append => {
                        open_options.append(true);
                    }
                    LogIfExists::Truncate => {
                        open_options.truncate(true);
                    }
                }

                let init_err =
                    |err| LogInitError { path: path.clone(), err };
                if let Some(parent) = path.parent() {
                    if !parent.as_str().is_empty() {
                        fs_err::create_dir_all(parent).map_err(init_err)?;
                    }
                }
                let file = open_options.open(path).map_err(init_err)?;

                // Say where the rest of the output went.
                eprintln!("note: configured to log to \"{path}\"");
                let decorator = slog_term::PlainDecorator::new(file);
                let drain =
                    slog_term::FullFormat::new(decorator).build().fuse();
                Ok(async_root_logger(*level, drain))
            }
        }
    }
}

fn async_root_logger<T>(level: LogLevel, drain: T) -> Logger
where
    T: Drain + Send + 'static,
    <T as Drain>::Err: std::fmt::Debug,
{
    let pid = std::process::id();
    let level_drain = slog::LevelFilter(drain, Level::from(level)).fuse();
    let async_drain = slog_async::Async::new(level_drain).build().fuse();
    Logger::root(async_drain, o!("pid" => pid))
}

#[cfg(test)]
mod test {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    #[derive(Debug, Deserialize)]
    struct Wrapper {
        log: LogConfig,
    }

    #[test]
    fn parses_both_modes() {
        let parsed: Wrapper = toml::from_str(
            r#"
            [log]
            level = "debug"
            mode = "stderr-terminal"
            "#,
        )
        .unwrap();
        assert_eq!(
            parsed.log,
            LogConfig::StderrTerminal { level: LogLevel::Debug }
        );

        let parsed: Wrapper = toml::from_str(
            r#"
            [log]
            level = "warn"
            mode = "file"
            path = "/var/log/dbfleet.log"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.log.level(), LogLevel::Warn);
        assert!(matches!(
            parsed.log,
            LogConfig::File { if_exists: LogIfExists::Append, .. }
        ));
    }

    #[test]
    fn bad_mode_is_rejected() {
        let error = toml::from_str::<Wrapper>(
            r#"
            [log]
            level = "info"
            mode = "syslog"
            "#,
        )
        .unwrap_err();
        assert!(error.to_string().contains("unknown variant `syslog`"));
    }

    #[test]
    fn file_mode_refuses_existing_file_when_asked() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("logs/deploy.log");
        let config = LogConfig::File {
            level: LogLevel::Info,
            path: path.clone(),
            if_exists: LogIfExists::Fail,
        };
        let log = config.to_logger().unwrap();
        slog::info!(log, "first run");
        drop(log);
        assert!(path.is_file());

        let error = config.to_logger().unwrap_err();
        assert!(error.to_string().starts_with("open log file"));
    }

    #[test]
    fn level_override_keeps_mode() {
        let config = LogConfig::default().with_level(LogLevel::Trace);
        assert_eq!(
            config,
            LogConfig::StderrTerminal { level: LogLevel::Trace }
        );
    }
}
