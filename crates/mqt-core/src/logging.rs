//! Log dispatch construction
//!
//! Entry points receive a numeric level selector and build a
//! [`tracing::Dispatch`] from it. The dispatch is scoped over the work it
//! covers instead of being installed as the process-wide default, so two
//! sessions in one process can log at different levels.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, EnvFilter};

/// Log levels understood by the entry points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    /// Only unrecoverable failures. Maps to the error filter.
    Fatal,
}

impl LogLevel {
    /// Map a numeric selector: 0=debug, 1=info, 2=warn, 3=error, 6=fatal.
    /// Anything else falls back to info.
    pub fn from_selector(selector: i32) -> Self {
        match selector {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            6 => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }

    pub fn filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Fatal => LevelFilter::ERROR,
        }
    }
}

/// Build a JSON log dispatch writing to stdout.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn dispatch(level: LogLevel) -> tracing::Dispatch {
    dispatch_to(level, std::io::stdout)
}

/// Same as [`dispatch`] with a caller-supplied writer.
///
/// Each event is one JSON object with flat `timestamp`, `level` and
/// `message` keys; structured fields sit next to `message`.
pub fn dispatch_to<W>(level: LogLevel, writer: W) -> tracing::Dispatch
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(level.filter().into())
        .from_env_lossy();

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_target(false)
            .with_writer(writer),
    );

    tracing::Dispatch::new(subscriber)
}
