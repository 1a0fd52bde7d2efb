//! Tracing setup for the `agentflow` binary.
//!
//! Logs always go to stderr so `run` and `todos` output on stdout stays
//! machine-readable. The filter comes from `AGENTFLOW_LOG`, then `RUST_LOG`,
//! then the level picked on the command line.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    /// Newline-delimited JSON, with the enclosing run span on every line.
    Json,
}

impl LogFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Filter directive from the two environment variables and the fallback level.
fn directive(agentflow_log: Option<String>, rust_log: Option<String>, level: Level) -> String {
    let set = |d: &String| !d.trim().is_empty();
    agentflow_log
        .filter(set)
        .or(rust_log.filter(set))
        .unwrap_or_else(|| format!("{},agentflow_core={level},agentflow_todo={level}", Level::WARN))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_tracing(format: LogFormat, level: Level) -> bool {
    let wanted = directive(
        std::env::var("AGENTFLOW_LOG").ok(),
        std::env::var("RUST_LOG").ok(),
        level,
    );
    let filter = EnvFilter::try_new(&wanted).unwrap_or_else(|_| EnvFilter::new(level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .is_ok(),
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agentflow_log_wins_over_rust_log() {
        let d = directive(Some("agentflow_core=trace".into()), Some("debug".into()), Level::INFO);
        assert_eq!(d, "agentflow_core=trace");
        assert_eq!(directive(None, Some("debug".into()), Level::INFO), "debug");
    }

    #[test]
    fn test_fallback_scopes_level_to_agentflow_crates() {
        let d = directive(None, Some("  ".into()), Level::DEBUG);
        assert_eq!(d, "WARN,agentflow_core=DEBUG,agentflow_todo=DEBUG");
        assert!(EnvFilter::try_new(&d).is_ok());
    }

    #[test]
    fn test_second_install_is_refused() {
        init_tracing(LogFormat::Text, Level::WARN);
        assert!(!init_tracing(LogFormat::Json, Level::DEBUG));
    }
}
