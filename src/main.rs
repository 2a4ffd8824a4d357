//! evalforge CLI entry point.
//!
//! Initializes logging and delegates to the CLI module for command handling.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Priority: RUST_LOG env var > --log-level CLI arg > default "info"
fn log_filter(rust_log: Option<String>, cli_level: &str) -> String {
    rust_log
        .filter(|filter| !filter.trim().is_empty())
        .unwrap_or_else(|| cli_level.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments first to get log_level
    let cli = evalforge::cli::parse_cli();

    // Initialize tracing with environment filter
    let log_filter = log_filter(std::env::var("RUST_LOG").ok(), &cli.log_level);

    // Events and reports go to stdout, logs to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_new(&log_filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Run the CLI with parsed arguments
    evalforge::cli::run_with_cli(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_filter_priority() {
        assert_eq!(log_filter(None, "debug"), "debug");
        assert_eq!(log_filter(Some("evalforge=trace".to_string()), "debug"), "evalforge=trace");
        assert_eq!(log_filter(Some("  ".to_string()), "warn"), "warn");
    }
}
