use super::GlobalConfig;
use super::allocator::AllocatorLogLevel;
use alloc::{string::ToString, sync::Arc, vec::Vec};
use core::fmt::Display;
use hashbrown::HashMap;

#[cfg(std_io)]
use std::{
    fs::{File, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

/// Configuration for logging, parameterized by a log level type.
///
/// Note that you can use multiple loggers at the same time.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(bound = "")]
pub struct LoggerConfig<L: LogLevel> {
    /// Path to the log file, if file logging is enabled (requires `std` feature).
    #[serde(default)]
    #[cfg(std_io)]
    pub file: Option<PathBuf>,

    /// Whether to append to the log file (true) or overwrite it (false). Defaults to true.
    #[serde(default = "append_default")]
    pub append: bool,

    /// Whether to log to standard output.
    #[serde(default)]
    pub stdout: bool,

    /// Whether to log to standard error.
    #[serde(default)]
    pub stderr: bool,

    /// Optional crate-level logging configuration (e.g., info, debug, trace).
    #[serde(default)]
    pub log: Option<LogCrateLevel>,

    /// The log level for this logger, determining verbosity.
    #[serde(default)]
    pub level: L,
}

impl<L: LogLevel> Default for LoggerConfig<L> {
    fn default() -> Self {
        Self {
            #[cfg(std_io)]
            file: None,
            append: true,
            stdout: false,
            stderr: false,
            log: None,
            level: L::default(),
        }
    }
}

/// Log levels using the `log` crate.
#[derive(
    Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize, Hash, PartialEq, Eq,
)]
pub enum LogCrateLevel {
    /// Logs informational messages.
    #[default]
    #[serde(rename = "info")]
    Info,

    /// Logs debugging messages.
    #[serde(rename = "debug")]
    Debug,

    /// Logs trace-level messages.
    #[serde(rename = "trace")]
    Trace,
}

fn append_default() -> bool {
    true
}

/// Trait for types that can be used as log levels in `LoggerConfig`.
pub trait LogLevel:
    serde::de::DeserializeOwned + serde::Serialize + Clone + Copy + core::fmt::Debug + Default
{
}

/// Logging utility writing allocator diagnostics to every configured output.
#[derive(Debug)]
pub struct Logger {
    /// Collection of logger instances (file, stdout, stderr, or crate-level).
    loggers: Vec<LoggerKind>,

    /// Indices of loggers used for allocator logging.
    allocator_index: Vec<usize>,

    /// Global configuration for logging settings.
    pub config: Arc<GlobalConfig>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new `Logger` instance based on the global configuration.
    ///
    /// Note that creating a logger opens its files, so it shouldn't be done on a hot path.
    pub fn new() -> Self {
        Self::from_config(GlobalConfig::get())
    }

    /// Creates a new `Logger` for the provided configuration.
    pub fn from_config(config: Arc<GlobalConfig>) -> Self {
        let mut loggers = Vec::new();
        let mut allocator_index = Vec::new();

        #[derive(Hash, PartialEq, Eq)]
        enum LoggerId {
            #[cfg(std_io)]
            File(PathBuf),
            #[cfg(feature = "std")]
            Stdout,
            #[cfg(feature = "std")]
            Stderr,
            LogCrate(LogCrateLevel),
        }

        let mut logger2index = HashMap::<LoggerId, usize>::new();

        fn new_logger<S: Clone, ID: Fn(S) -> LoggerId, LG: Fn(S) -> LoggerKind>(
            setting_index: &mut Vec<usize>,
            loggers: &mut Vec<LoggerKind>,
            logger2index: &mut HashMap<LoggerId, usize>,
            state: S,
            func_id: ID,
            func_logger: LG,
        ) {
            let id = func_id(state.clone());

            if let Some(index) = logger2index.get(&id) {
                setting_index.push(*index);
            } else {
                let logger = func_logger(state);
                let index = loggers.len();
                logger2index.insert(id, index);
                loggers.push(logger);
                setting_index.push(index);
            }
        }

        if config.allocator.logger.level != AllocatorLogLevel::Disabled {
            let kind = &config.allocator.logger;

            #[cfg(std_io)]
            if let Some(file) = &kind.file {
                new_logger(
                    &mut allocator_index,
                    &mut loggers,
                    &mut logger2index,
                    (file, kind.append),
                    |(file, _append)| LoggerId::File(file.clone()),
                    |(file, append)| LoggerKind::File(FileLogger::new(file, append)),
                );
            }

            #[cfg(feature = "std")]
            if kind.stdout {
                new_logger(
                    &mut allocator_index,
                    &mut loggers,
                    &mut logger2index,
                    (),
                    |_| LoggerId::Stdout,
                    |_| LoggerKind::Stdout,
                );
            }

            #[cfg(feature = "std")]
            if kind.stderr {
                new_logger(
                    &mut allocator_index,
                    &mut loggers,
                    &mut logger2index,
                    (),
                    |_| LoggerId::Stderr,
                    |_| LoggerKind::Stderr,
                );
            }

            if let Some(level) = kind.log {
                new_logger(
                    &mut allocator_index,
                    &mut loggers,
                    &mut logger2index,
                    level,
                    LoggerId::LogCrate,
                    LoggerKind::Log,
                );
            }
        }

        Self {
            loggers,
            allocator_index,
            config,
        }
    }

    /// Logs a message for the allocators, directing it to all configured allocator loggers.
    pub fn log_allocator<S: Display>(&mut self, msg: &S) {
        let length = self.allocator_index.len();
        if length > 1 {
            let msg = msg.to_string();
            for i in 0..length {
                let index = self.allocator_index[i];
                self.log(&msg, index)
            }
        } else if let Some(index) = self.allocator_index.first() {
            self.log(&msg, *index)
        }
    }

    /// Returns the current allocator log level from the configuration.
    pub fn log_level_allocator(&self) -> AllocatorLogLevel {
        self.config.allocator.logger.level
    }

    fn log<S: Display>(&mut self, msg: &S, index: usize) {
        let logger = &mut self.loggers[index];
        logger.log(msg);
    }
}

/// Represents different types of loggers.
#[derive(Debug)]
enum LoggerKind {
    /// Logs to a file.
    #[cfg(std_io)]
    File(FileLogger),

    /// Logs to standard output.
    #[cfg(feature = "std")]
    Stdout,

    /// Logs to standard error.
    #[cfg(feature = "std")]
    Stderr,

    /// Logs using the `log` crate with a specified level.
    Log(LogCrateLevel),
}

impl LoggerKind {
    fn log<S: Display>(&mut self, msg: &S) {
        match self {
            #[cfg(std_io)]
            LoggerKind::File(file_logger) => file_logger.log(msg),
            #[cfg(feature = "std")]
            LoggerKind::Stdout => println!("{msg}"),
            #[cfg(feature = "std")]
            LoggerKind::Stderr => eprintln!("{msg}"),
            LoggerKind::Log(level) => match level {
                LogCrateLevel::Info => log::info!("{msg}"),
                LogCrateLevel::Debug => log::debug!("{msg}"),
                LogCrateLevel::Trace => log::trace!("{msg}"),
            },
        }
    }
}

/// Logger that writes messages to a file.
#[derive(Debug)]
#[cfg(std_io)]
struct FileLogger {
    writer: Option<BufWriter<File>>,
}

#[cfg(std_io)]
impl FileLogger {
    // Creates a new file logger. A file that can't be opened disables this output.
    fn new(path: &PathBuf, append: bool) -> Self {
        let file = OpenOptions::new()
            .write(true)
            .append(append)
            .truncate(!append)
            .create(true)
            .open(path);

        let writer = match file {
            Ok(file) => Some(BufWriter::new(file)),
            Err(err) => {
                log::warn!("Can't open allocator log file {path:?}: {err}");
                None
            }
        };

        Self { writer }
    }

    // Logs a message to the file, flushing the buffer to ensure immediate write.
    fn log<S: Display>(&mut self, msg: &S) {
        if let Some(writer) = self.writer.as_mut() {
            let written = writeln!(writer, "{msg}").and_then(|_| writer.flush());
            if let Err(err) = written {
                log::warn!("Can't write allocator log: {err}");
            }
        }
    }
}
