use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::errors::{CoreError, Result};

/// Control-plane crates log at info; the HTTP stack only surfaces
/// warnings so hub ticks stay readable.
const DEFAULT_DIRECTIVES: &str = "info,hyper=warn,tower=warn,reqwest=warn";

/// Initializes the tracing subscriber shared by the daemon and its tools.
///
/// Precedence: an explicit `directives` argument (the `--log` flag), then
/// `RUST_LOG`, then [`DEFAULT_DIRECTIVES`].
pub fn init_tracing(directives: Option<&str>) -> Result<()> {
    let filter = match directives {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES)),
    };

    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .try_init()
        .map_err(|err| CoreError::General(err.to_string()))?;

    Ok(())
}
