//! Log sinks for call records
//!
//! The [`Logger`] trait is the only thing interceptors know about logging.
//! There are two implementations:
//!
//! - [`StdoutLogger`] writes plain `INFO: ...` / `ERROR: ...` lines to stdout, or any
//!   other [`io::Write`], synchronously.
//! - [`TracingLogger`] emits [`tracing`] events. How they are formatted and where they go
//!   is decided by the subscriber, see [`init`].
//!
//! Which one is used is decided once at startup, see [`LogFormat`].
use std::{
    fmt,
    io::{self, Write},
    str::FromStr,
    sync::{Arc, Mutex},
};

use tracing_subscriber::EnvFilter;

/// Environment variable read by [`LogFormat::from_env`]
pub const LOG_FORMAT_ENV: &str = "RPC_LOG_FORMAT";

/// A sink for leveled log messages.
///
/// Implementations must not fail: errors writing the output are swallowed, so that
/// logging can never change the outcome of the call being logged. Implementations are
/// shared between all calls in flight and must emit each message as a single unit.
pub trait Logger: fmt::Debug + Send + Sync + 'static {
    /// Log a message at info level
    fn info(&self, message: &str);

    /// Log a message at error level
    fn error(&self, message: &str);

    /// Log formatted arguments at info level
    fn info_fmt(&self, args: fmt::Arguments<'_>) {
        match args.as_str() {
            Some(message) => self.info(message),
            None => self.info(&args.to_string()),
        }
    }

    /// Log formatted arguments at error level
    fn error_fmt(&self, args: fmt::Arguments<'_>) {
        match args.as_str() {
            Some(message) => self.error(message),
            None => self.error(&args.to_string()),
        }
    }
}

impl<L: Logger + ?Sized> Logger for Arc<L> {
    fn info(&self, message: &str) {
        (**self).info(message)
    }

    fn error(&self, message: &str) {
        (**self).error(message)
    }

    fn info_fmt(&self, args: fmt::Arguments<'_>) {
        (**self).info_fmt(args)
    }

    fn error_fmt(&self, args: fmt::Arguments<'_>) {
        (**self).error_fmt(args)
    }
}

/// Plain text logger writing directly to an [`io::Write`].
///
/// Every message becomes one `LEVEL: message` line, written with a single call
/// while holding a lock, so lines from concurrent calls never interleave.
pub struct StdoutLogger {
    out: Mutex<Box<dyn Write + Send>>,
}

impl StdoutLogger {
    /// A logger writing to stdout
    pub fn new() -> Self {
        Self::with_writer(io::stdout())
    }

    /// A logger writing to the given writer
    pub fn with_writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(writer)),
        }
    }

    fn write_line(&self, level: &str, message: &str) {
        let line = format!("{level}: {message}\n");
        // a poisoned lock still holds a usable writer
        let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
        out.write_all(line.as_bytes()).ok();
        out.flush().ok();
    }
}

impl Default for StdoutLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StdoutLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StdoutLogger").finish_non_exhaustive()
    }
}

impl Logger for StdoutLogger {
    fn info(&self, message: &str) {
        self.write_line("INFO", message)
    }

    fn error(&self, message: &str) {
        self.write_line("ERROR", message)
    }
}

/// Structured logger that forwards messages as [`tracing`] events.
///
/// Events are emitted with target `rpc_observe::call`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TracingLogger {
    /// Create a new tracing logger
    pub fn new() -> Self {
        Self
    }
}

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(target: "rpc_observe::call", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "rpc_observe::call", "{message}");
    }

    fn info_fmt(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "rpc_observe::call", "{args}");
    }

    fn error_fmt(&self, args: fmt::Arguments<'_>) {
        tracing::error!(target: "rpc_observe::call", "{args}");
    }
}

/// Which logger to use, chosen once at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// [`StdoutLogger`]
    Plain,
    /// [`TracingLogger`] with a human readable subscriber
    #[default]
    Structured,
    /// [`TracingLogger`] with a JSON subscriber
    Json,
}

impl LogFormat {
    /// Read the format from [`LOG_FORMAT_ENV`], falling back to the default if it is unset.
    pub fn from_env() -> Result<Self, ParseLogFormatError> {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::default()),
        }
    }
}

impl FromStr for LogFormat {
    type Err = ParseLogFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "stdout" => Ok(LogFormat::Plain),
            "structured" | "tracing" => Ok(LogFormat::Structured),
            "json" => Ok(LogFormat::Json),
            _ => Err(ParseLogFormatError(s.to_owned())),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Plain => write!(f, "plain"),
            LogFormat::Structured => write!(f, "structured"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Error parsing a [`LogFormat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseLogFormatError(String);

impl fmt::Display for ParseLogFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown log format {:?}, expected one of plain, structured, json",
            self.0
        )
    }
}

impl std::error::Error for ParseLogFormatError {}

/// Install the global tracing subscriber for the given format.
///
/// The filter is taken from `RUST_LOG` and defaults to `info`. Does nothing if a
/// subscriber is already installed. For [`LogFormat::Plain`] call records do not go
/// through tracing, but library diagnostics still do.
pub fn init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let res = match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Plain | LogFormat::Structured => builder.try_init(),
    };
    if let Err(cause) = res {
        tracing::debug!("tracing subscriber not installed: {cause}");
    }
}

/// Create the logger for the given format.
pub fn logger(format: LogFormat) -> Arc<dyn Logger> {
    match format {
        LogFormat::Plain => Arc::new(StdoutLogger::new()),
        LogFormat::Structured | LogFormat::Json => Arc::new(TracingLogger::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn stdout_logger_lines() {
        let buf = SharedBuf::default();
        let logger = StdoutLogger::with_writer(buf.clone());
        logger.info("hello");
        logger.error_fmt(format_args!("failed: {}", 42));
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "INFO: hello\nERROR: failed: 42\n");
    }

    #[test]
    fn write_errors_are_swallowed() {
        let logger = StdoutLogger::with_writer(BrokenPipe);
        logger.info("nobody is listening");
        logger.error("still fine");
    }

    #[test]
    fn concurrent_lines_stay_whole() {
        let buf = SharedBuf::default();
        let logger = Arc::new(StdoutLogger::with_writer(buf.clone()));
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let logger = logger.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        logger.info_fmt(format_args!("thread {i} line {j}"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 800);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("INFO: thread ") && l.contains(" line ")));
    }

    #[test]
    fn parse_log_format() {
        assert_eq!("plain".parse(), Ok(LogFormat::Plain));
        assert_eq!(" JSON ".parse(), Ok(LogFormat::Json));
        assert_eq!("tracing".parse(), Ok(LogFormat::Structured));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::default(), LogFormat::Structured);
    }
}
