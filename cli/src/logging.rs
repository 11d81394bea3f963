//! Log setup for the `tappay` binary.
//!
//! Every subcommand prints its result as JSON on stdout, so diagnostics are
//! written to stderr. `RUST_LOG` selects what is shown; without it the
//! binary and the protocol library log at `info`.

use clap::ValueEnum;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_DIRECTIVES: &str = "tappay=info,tappay_protocol=info";

/// How log lines are rendered on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Colored lines for a terminal watching a tap.
    Pretty,
    /// One JSON object per line, for collecting scan and poll events.
    Json,
}

/// Installs the global subscriber. `main` calls this once before
/// dispatching a subcommand.
///
/// ```text
/// RUST_LOG=tappay_protocol::settlement=debug tappay watch --address ...
/// ```
pub fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }

    tracing::debug!(?format, "logging ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn format_names_are_lowercase() {
        assert_eq!(LogFormat::from_str("json", true), Ok(LogFormat::Json));
        assert_eq!(LogFormat::from_str("PRETTY", true), Ok(LogFormat::Pretty));
        assert!(LogFormat::from_str("yaml", true).is_err());
    }
}
