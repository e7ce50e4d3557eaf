use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing::span::EnteredSpan;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Which side of the channel a binary runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LogRole {
    Host,
    Peer,
}

impl LogRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LogRole::Host => "host",
            LogRole::Peer => "peer",
        }
    }
}

/// Install the stderr subscriber and enter the process span.
///
/// A spawned peer inherits the host's stderr, so every event carries the
/// role and pid. Keep the returned guard alive for the life of `main`; the
/// channel poller picks the span up from the thread that starts it.
pub fn init_logging(format: LogFormat, level: LogLevel, role: LogRole) -> EnteredSpan {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::from(level))
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().try_init();
        }
    }

    tracing::info_span!("linepipe", role = role.as_str(), pid = std::process::id()).entered()
}
