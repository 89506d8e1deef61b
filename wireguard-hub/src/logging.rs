use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter};

/// Crates that are noisy at `debug` and below but rarely what an operator wants.
const IRRELEVANT_CRATES: &str = "mio=warn,want=warn,tower::buffer=warn";

/// Sets up the global `tracing` subscriber.
///
/// `cli_level` is the `--log-level` flag, if given; it takes precedence over
/// `RUST_LOG` when both are set. Falls back to `info` if neither is set.
pub fn init(cli_level: Option<&str>) -> Result<()> {
    let directives = cli_level
        .map(str::to_owned)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| "info".to_string());

    let filter = EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
        .context("failed to parse log directives")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .context("failed to install global tracing subscriber")?;

    Ok(())
}
