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

/// Log to stderr so stdout stays free for messages and summaries.
///
/// Inside a model process (`MODELWIRE_MODEL` set) every event carries the
/// model name; keep the returned guard alive for the whole command.
pub fn init_logging(format: LogFormat, level: LogLevel) -> Option<EnteredSpan> {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::from(level))
        .with_ansi(false)
        .with_target(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    if let Err(err) = installed {
        eprintln!("modelwire: logging unavailable: {err}");
        return None;
    }

    model_name().map(|model| tracing::info_span!("model", name = %model).entered())
}

fn model_name() -> Option<String> {
    std::env::var(modelwire_comm::MODEL_ENV)
        .ok()
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_filters() {
        assert_eq!(LevelFilter::from(LogLevel::Warn), LevelFilter::WARN);
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::TRACE);
    }

    #[test]
    fn level_names_parse_case_insensitively() {
        assert!(matches!(
            LogLevel::from_str("debug", true),
            Ok(LogLevel::Debug)
        ));
        assert!(LogLevel::from_str("loud", true).is_err());
    }
}
